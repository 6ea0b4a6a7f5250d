//! Conversation domain module.
//!
//! # Module Structure
//!
//! - `model`: Conversation record (`Conversation`, `ConversationKind`)
//! - `message`: Message record (`Message`)
//! - `document`: Mapping to and from the stored schema

mod document;
mod message;
mod model;

pub use document::fields;
pub use message::Message;
pub use model::{Conversation, ConversationKind};
