//! Conversation domain model.

use crate::timestamp::Timestamp;
use serde::{Deserialize, Serialize};

/// Whether a conversation is between two people or a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    #[serde(alias = "private")]
    Direct,
    Group,
}

impl ConversationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationKind::Direct => "direct",
            ConversationKind::Group => "group",
        }
    }
}

/// A messaging thread with a denormalized summary of its latest message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub kind: ConversationKind,
    pub participants: Vec<String>,
    /// Stored name. Authoritative for groups; ignored for direct conversations.
    pub display_name: Option<String>,
    pub created_at: Option<Timestamp>,
    pub last_message: String,
    pub last_message_time: Option<Timestamp>,
    /// Resolved name of the other participant (direct conversations only).
    pub other_participant_name: Option<String>,
}

impl Conversation {
    pub fn is_direct(&self) -> bool {
        self.kind == ConversationKind::Direct
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    /// The participant of a direct conversation who is not `user_id`.
    pub fn other_participant(&self, user_id: &str) -> Option<&str> {
        if !self.is_direct() {
            return None;
        }
        self.participants
            .iter()
            .map(String::as_str)
            .find(|p| *p != user_id)
    }

    /// Name shown for the conversation.
    ///
    /// Direct conversations are named after the other participant; groups
    /// use their stored name.
    pub fn effective_display_name(&self) -> &str {
        match self.kind {
            ConversationKind::Direct => self
                .other_participant_name
                .as_deref()
                .or(self.display_name.as_deref())
                .unwrap_or_default(),
            ConversationKind::Group => self.display_name.as_deref().unwrap_or_default(),
        }
    }

    /// Case-insensitive match against the display name and last message.
    pub fn matches_search(&self, term: &str) -> bool {
        let term = term.trim().to_lowercase();
        if term.is_empty() {
            return true;
        }
        self.effective_display_name().to_lowercase().contains(&term)
            || self.last_message.to_lowercase().contains(&term)
    }
}
