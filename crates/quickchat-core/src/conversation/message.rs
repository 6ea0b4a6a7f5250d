//! Message domain model.

use crate::timestamp::Timestamp;

/// A message inside a conversation.
///
/// `conversation_id` is a back-reference only; a message outlives the
/// in-memory conversation record it was loaded alongside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender: String,
    pub text: String,
    pub timestamp: Timestamp,
}

impl Message {
    pub fn is_from(&self, user_id: &str) -> bool {
        self.sender == user_id
    }
}
