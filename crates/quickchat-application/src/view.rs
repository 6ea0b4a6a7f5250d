//! What the UI shell renders and is told about.

use crate::subscription::StreamKey;
use quickchat_core::ChatError;
use quickchat_core::conversation::{Conversation, Message};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

impl fmt::Display for NoticeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NoticeLevel::Info => write!(f, "info"),
            NoticeLevel::Warning => write!(f, "warning"),
            NoticeLevel::Error => write!(f, "error"),
        }
    }
}

/// A non-blocking message for the user (toast, status line, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Warning,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Which part of `ViewState` changed after processing an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewUpdate {
    ConversationsChanged,
    ActiveConversationChanged,
    MessagesChanged,
    /// A background lookup attached `user_id`'s name to the rendered conversations.
    ParticipantNameResolved { user_id: String },
    /// A live stream ended with an error; its view was cleared and is not retried.
    StreamFailed { key: StreamKey, error: ChatError },
    IdentityChanged { user_id: Option<String> },
}

/// Read model of the current view, rebuilt from each snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ViewState {
    pub user_id: Option<String>,
    /// Ordered by `lastMessageTime`, newest first.
    pub conversations: Vec<Conversation>,
    pub conversations_loading: bool,
    pub selected_conversation: Option<String>,
    pub active_conversation: Option<Conversation>,
    /// Most recent window, oldest first.
    pub messages: Vec<Message>,
    pub messages_loading: bool,
    pub search_term: String,
    pub input: String,
}

impl ViewState {
    pub fn signed_in(user_id: Option<String>) -> Self {
        Self {
            conversations_loading: user_id.is_some(),
            user_id,
            ..Self::default()
        }
    }

    /// Conversations passing the current search filter, in list order.
    pub fn visible_conversations(&self) -> Vec<&Conversation> {
        self.conversations
            .iter()
            .filter(|c| c.matches_search(&self.search_term))
            .collect()
    }

    pub fn is_selected(&self, conversation_id: &str) -> bool {
        self.selected_conversation.as_deref() == Some(conversation_id)
    }
}
