//! Domain layer for QuickChat.
//!
//! Holds the conversation and message records, the contracts of the two
//! external collaborators the sync engine talks to (the document store and
//! the identity provider), the shared error type and the sync settings.

pub mod config;
pub mod conversation;
pub mod error;
pub mod identity;
pub mod participant;
pub mod store;
pub mod timestamp;

pub use config::{SendStrategy, SyncSettings, UNKNOWN_USER};
pub use error::{ChatError, Result};
pub use timestamp::Timestamp;
