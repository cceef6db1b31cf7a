//! testcast CLI Library
//!
//! Runs a test process and streams its console output through the relay
//! (producer role), or watches that stream (consumer role).

pub mod client;
pub mod producer;
pub mod subprocess;
pub mod watch;
