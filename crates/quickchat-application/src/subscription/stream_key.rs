use std::fmt;

/// Identifies the scope of one live subscription.
///
/// At most one subscription per key is open at a time.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamKey {
    /// Conversations the user participates in, newest activity first.
    ConversationList(String),
    /// Metadata document of one conversation.
    ConversationMeta(String),
    /// Recent-message window of one conversation.
    Messages(String),
}

impl StreamKey {
    /// The user id or conversation id the stream is scoped to.
    pub fn scope_id(&self) -> &str {
        match self {
            StreamKey::ConversationList(id)
            | StreamKey::ConversationMeta(id)
            | StreamKey::Messages(id) => id,
        }
    }

    pub fn is_conversation_scoped(&self) -> bool {
        !matches!(self, StreamKey::ConversationList(_))
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKey::ConversationList(id) => write!(f, "conversationList:{}", id),
            StreamKey::ConversationMeta(id) => write!(f, "conversationMeta:{}", id),
            StreamKey::Messages(id) => write!(f, "messages:{}", id),
        }
    }
}
