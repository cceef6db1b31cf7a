//! Test process execution with line-by-line output capture.

pub mod reassembler;
pub mod runner;

pub use reassembler::LineReassembler;
pub use runner::{LineRetention, ProcessRunner, RunResult, RunnerConfig, ShellMode};
