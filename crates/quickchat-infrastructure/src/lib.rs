//! Infrastructure adapters for QuickChat: an in-memory document store, an
//! in-process identity provider and TOML settings storage.

pub mod config_storage;
pub mod identity;
pub mod memory_store;

pub use crate::config_storage::{default_config_path, load_settings, save_settings};
pub use crate::identity::InMemoryIdentityProvider;
pub use crate::memory_store::InMemoryDocumentStore;
