//! Sync engine settings.

use crate::error::{ChatError, Result};
use serde::{Deserialize, Serialize};

/// Fallback label used when a participant's name cannot be resolved.
pub const UNKNOWN_USER: &str = "Unknown User";

/// Size of the recent-message window.
pub const DEFAULT_MESSAGE_WINDOW: usize = 50;

/// How the send path writes the message and the conversation summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendStrategy {
    /// Append the message, then update the summary in a second write.
    #[default]
    TwoStep,
    /// Commit both writes in one atomic batch when the store supports it.
    Atomic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub message_window: usize,
    pub unknown_user_label: String,
    pub resolve_timeout_ms: u64,
    pub send_strategy: SendStrategy,
    pub conversations_collection: String,
    pub messages_collection: String,
    pub users_collection: String,
    pub log_level: String,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            message_window: DEFAULT_MESSAGE_WINDOW,
            unknown_user_label: UNKNOWN_USER.to_string(),
            resolve_timeout_ms: 3000,
            send_strategy: SendStrategy::default(),
            conversations_collection: "chats".to_string(),
            messages_collection: "messages".to_string(),
            users_collection: "users".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl SyncSettings {
    pub fn validate(&self) -> Result<()> {
        if self.message_window == 0 {
            return Err(ChatError::config("message_window must be at least 1"));
        }
        if self.unknown_user_label.trim().is_empty() {
            return Err(ChatError::config("unknown_user_label must not be empty"));
        }
        for (name, value) in [
            ("conversations_collection", &self.conversations_collection),
            ("messages_collection", &self.messages_collection),
            ("users_collection", &self.users_collection),
        ] {
            if value.is_empty() || value.contains('/') {
                return Err(ChatError::config(format!(
                    "{} must be a non-empty single path segment",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn resolve_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.resolve_timeout_ms)
    }
}
