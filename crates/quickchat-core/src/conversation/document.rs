//! Mapping between conversation records and their stored documents.

use super::message::Message;
use super::model::{Conversation, ConversationKind};
use crate::error::{ChatError, Result};
use crate::store::{Document, WriteData};
use crate::timestamp::Timestamp;
use serde::Deserialize;

/// Field names of the stored conversation schema.
pub mod fields {
    pub const KIND: &str = "kind";
    pub const PARTICIPANTS: &str = "participants";
    pub const DISPLAY_NAME: &str = "displayName";
    pub const CREATED_AT: &str = "createdAt";
    pub const LAST_MESSAGE: &str = "lastMessage";
    pub const LAST_MESSAGE_TIME: &str = "lastMessageTime";

    pub const SENDER: &str = "sender";
    pub const TEXT: &str = "text";
    pub const TIMESTAMP: &str = "timestamp";
    pub const CONVERSATION_ID: &str = "conversationId";
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConversationDocument {
    #[serde(alias = "type")]
    kind: ConversationKind,
    #[serde(default)]
    participants: Vec<String>,
    #[serde(default, alias = "name")]
    display_name: Option<String>,
    #[serde(default)]
    created_at: Option<Timestamp>,
    #[serde(default)]
    last_message: Option<String>,
    #[serde(default)]
    last_message_time: Option<Timestamp>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDocument {
    sender: String,
    text: String,
    timestamp: Timestamp,
    #[serde(default)]
    conversation_id: Option<String>,
}

impl TryFrom<&Document> for Conversation {
    type Error = ChatError;

    fn try_from(doc: &Document) -> Result<Self> {
        let raw: ConversationDocument = doc.decode()?;
        Ok(Conversation {
            id: doc.id().to_string(),
            kind: raw.kind,
            participants: raw.participants,
            display_name: raw.display_name.filter(|name| !name.is_empty()),
            created_at: raw.created_at,
            last_message: raw.last_message.unwrap_or_default(),
            last_message_time: raw.last_message_time,
            other_participant_name: None,
        })
    }
}

impl Message {
    /// Decodes a message document read from `conversation_id`'s message collection.
    ///
    /// A document carrying an explicit `conversationId` for another
    /// conversation is rejected.
    pub fn from_document(doc: &Document, conversation_id: &str) -> Result<Self> {
        let raw: MessageDocument = doc.decode()?;
        if let Some(owner) = raw.conversation_id.as_deref()
            && owner != conversation_id
        {
            return Err(ChatError::document(format!(
                "{} belongs to conversation '{}', not '{}'",
                doc.path, owner, conversation_id
            )));
        }
        Ok(Message {
            id: doc.id().to_string(),
            conversation_id: conversation_id.to_string(),
            sender: raw.sender,
            text: raw.text,
            timestamp: raw.timestamp,
        })
    }

    /// Payload appended for a new message; the store assigns the timestamp.
    pub fn new_document(conversation_id: &str, sender: &str, text: &str) -> WriteData {
        WriteData::new()
            .set(fields::SENDER, sender)
            .set(fields::TEXT, text)
            .set(fields::CONVERSATION_ID, conversation_id)
            .server_timestamp(fields::TIMESTAMP)
    }
}

impl Conversation {
    /// Payload for a newly created conversation.
    pub fn new_document(
        kind: ConversationKind,
        participants: &[String],
        display_name: Option<&str>,
    ) -> WriteData {
        let mut data = WriteData::new()
            .set(fields::KIND, kind.as_str())
            .set(fields::PARTICIPANTS, participants.to_vec())
            .set(fields::LAST_MESSAGE, "")
            .server_timestamp(fields::CREATED_AT)
            .server_timestamp(fields::LAST_MESSAGE_TIME);
        if let Some(name) = display_name {
            data = data.set(fields::DISPLAY_NAME, name);
        }
        data
    }
}
