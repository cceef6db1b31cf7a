//! `testcast` Core Library
//!
//! Shared functionality for `testcast` components:
//! - Message envelopes exchanged over the relay, and their validation
//! - Channel-tagged output lines
//! - Configuration resolution and hierarchy
//! - File-backed test catalog
//! - Common error types

pub mod catalog;
pub mod config;
pub mod envelope;
pub mod error;
pub mod output;
pub mod tracing_init;

pub use config::Config;
pub use envelope::{Envelope, EnvelopeError, EnvelopeKind, MAX_CLIENTS_REACHED};
pub use error::{Error, Result};
pub use output::{Channel, OutputLine};
