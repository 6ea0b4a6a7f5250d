use super::path::{CollectionPath, DocumentPath};
use crate::config::SyncSettings;

/// Where the chat schema lives inside the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreLayout {
    conversations: CollectionPath,
    users: CollectionPath,
    messages: String,
}

impl StoreLayout {
    pub fn new(settings: &SyncSettings) -> Self {
        Self {
            conversations: CollectionPath::new(settings.conversations_collection.clone()),
            users: CollectionPath::new(settings.users_collection.clone()),
            messages: settings.messages_collection.clone(),
        }
    }

    pub fn conversations(&self) -> &CollectionPath {
        &self.conversations
    }

    pub fn conversation(&self, conversation_id: &str) -> DocumentPath {
        self.conversations.doc(conversation_id)
    }

    pub fn messages(&self, conversation_id: &str) -> CollectionPath {
        self.conversation(conversation_id)
            .subcollection(&self.messages)
    }

    pub fn users(&self) -> &CollectionPath {
        &self.users
    }

    pub fn user(&self, user_id: &str) -> DocumentPath {
        self.users.doc(user_id)
    }
}

impl Default for StoreLayout {
    fn default() -> Self {
        Self::new(&SyncSettings::default())
    }
}
