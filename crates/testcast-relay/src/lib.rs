//! testcast Relay Server Library
//!
//! Core functionality for the testcast relay:
//! - Bounded participant set (at most two live connections)
//! - WebSocket server that validates envelopes and forwards them to the
//!   other participant

pub mod participants;
pub mod server;

pub use participants::{CapacityExceeded, Participant, ParticipantId, ParticipantSet};
pub use server::{RelayConfig, RelayError, RelayServer};
