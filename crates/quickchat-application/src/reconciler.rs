//! Snapshot reconciliation.
//!
//! Turns the raw documents of a live-query delivery into the ordered,
//! deduplicated domain records the UI renders. The read model is rebuilt
//! wholesale on every delivery; nothing is patched incrementally.
//!
//! Reconciliation never waits on the store. Direct conversations get the
//! other participant's name from the resolver cache, or the unknown-user
//! label until a lookup fills it in via `attach_name`.

use crate::participant_resolver::ParticipantResolver;
use quickchat_core::conversation::{Conversation, Message};
use quickchat_core::store::Document;
use std::collections::HashSet;
use std::sync::Arc;

pub struct SnapshotReconciler {
    resolver: Arc<ParticipantResolver>,
}

impl SnapshotReconciler {
    pub fn new(resolver: Arc<ParticipantResolver>) -> Self {
        Self { resolver }
    }

    /// Builds the conversation list for `current_user`.
    ///
    /// Records keep the store's delivery order (the backing query orders by
    /// `lastMessageTime` descending). Duplicate ids keep their first
    /// occurrence; malformed documents are skipped.
    pub fn reconcile_conversations(
        &self,
        docs: &[Document],
        current_user: &str,
    ) -> Vec<Conversation> {
        let mut seen = HashSet::new();
        docs.iter()
            .filter(|doc| seen.insert(doc.id().to_string()))
            .filter_map(|doc| match Conversation::try_from(doc) {
                Ok(conversation) => Some(conversation),
                Err(e) => {
                    tracing::warn!("[SnapshotReconciler] Skipping conversation: {}", e);
                    None
                }
            })
            .map(|mut conversation| {
                conversation.other_participant_name =
                    self.other_participant_name(&conversation, current_user);
                conversation
            })
            .collect()
    }

    /// Builds the active conversation's metadata from a single-document delivery.
    ///
    /// Returns `None` when the document is gone or unreadable.
    pub fn reconcile_conversation(
        &self,
        doc: Option<&Document>,
        current_user: &str,
    ) -> Option<Conversation> {
        let mut conversation = match Conversation::try_from(doc?) {
            Ok(conversation) => conversation,
            Err(e) => {
                tracing::warn!("[SnapshotReconciler] Unreadable conversation: {}", e);
                return None;
            }
        };
        conversation.other_participant_name =
            self.other_participant_name(&conversation, current_user);
        Some(conversation)
    }

    /// Builds the message window of `conversation_id`.
    ///
    /// Order is the store's (timestamp ascending) and the size is bounded by
    /// the backing query's limit; no re-sorting or truncation happens here.
    pub fn reconcile_messages(&self, docs: &[Document], conversation_id: &str) -> Vec<Message> {
        let mut seen = HashSet::new();
        docs.iter()
            .filter(|doc| seen.insert(doc.id().to_string()))
            .filter_map(|doc| match Message::from_document(doc, conversation_id) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::warn!("[SnapshotReconciler] Skipping message: {}", e);
                    None
                }
            })
            .collect()
    }

    /// Other participants of direct conversations whose name is not cached,
    /// each listed once.
    pub fn unresolved_participants<'a>(
        &self,
        conversations: impl IntoIterator<Item = &'a Conversation>,
        current_user: &str,
    ) -> Vec<String> {
        let mut seen = HashSet::new();
        conversations
            .into_iter()
            .filter(|conversation| conversation.is_direct())
            .filter_map(|conversation| conversation.other_participant(current_user))
            .filter(|other| self.resolver.cached_name(other).is_none())
            .filter(|other| seen.insert(other.to_string()))
            .map(str::to_string)
            .collect()
    }

    /// Sets `name` on `conversation` if it is a direct conversation of
    /// `current_user` with `participant`. Returns whether anything changed.
    pub fn attach_name(
        conversation: &mut Conversation,
        current_user: &str,
        participant: &str,
        name: &str,
    ) -> bool {
        if !conversation.is_direct()
            || conversation.other_participant(current_user) != Some(participant)
            || conversation.other_participant_name.as_deref() == Some(name)
        {
            return false;
        }
        conversation.other_participant_name = Some(name.to_string());
        true
    }

    fn other_participant_name(
        &self,
        conversation: &Conversation,
        current_user: &str,
    ) -> Option<String> {
        if !conversation.is_direct() {
            return None;
        }
        let name = conversation
            .other_participant(current_user)
            .and_then(|other| self.resolver.cached_name(other))
            .unwrap_or_else(|| self.resolver.unknown_label().to_string());
        Some(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickchat_core::store::{CollectionPath, DocumentData, DocumentStore, StoreLayout, WriteData};
    use quickchat_core::{ChatError, SyncSettings};
    use quickchat_infrastructure::InMemoryDocumentStore;
    use serde_json::{Value, json};

    fn doc(collection: &str, id: &str, value: Value) -> Document {
        let data: DocumentData = value.as_object().cloned().unwrap();
        Document::new(CollectionPath::new(collection).doc(id), data)
    }

    fn direct(id: &str, other: &str, time: &str) -> Document {
        doc(
            "chats",
            id,
            json!({
                "kind": "direct",
                "participants": ["me", other],
                "lastMessage": format!("from {}", other),
                "lastMessageTime": time,
            }),
        )
    }

    async fn reconciler_with_profiles(
        profiles: &[(&str, &str)],
    ) -> (SnapshotReconciler, Arc<ParticipantResolver>, Arc<InMemoryDocumentStore>) {
        let store = Arc::new(InMemoryDocumentStore::new());
        for (id, name) in profiles {
            store
                .merge(
                    &StoreLayout::default().user(id),
                    WriteData::new().set("displayName", *name),
                )
                .await
                .unwrap();
        }
        let resolver = Arc::new(ParticipantResolver::new(
            store.clone(),
            &SyncSettings::default(),
        ));
        (SnapshotReconciler::new(resolver.clone()), resolver, store)
    }

    #[tokio::test]
    async fn test_empty_snapshot_yields_empty_list() {
        let (reconciler, _, _) = reconciler_with_profiles(&[]).await;
        assert!(reconciler.reconcile_conversations(&[], "me").is_empty());
        assert!(reconciler.reconcile_messages(&[], "c1").is_empty());
    }

    #[tokio::test]
    async fn test_keeps_store_order_and_drops_duplicates() {
        let (reconciler, resolver, _) =
            reconciler_with_profiles(&[("bob", "Bob"), ("eve", "Eve")]).await;
        let docs = vec![
            direct("c2", "eve", "2024-05-01T10:00:02.000000Z"),
            direct("c1", "bob", "2024-05-01T10:00:01.000000Z"),
            direct("c2", "eve", "2024-05-01T10:00:02.000000Z"),
        ];

        let list = reconciler.reconcile_conversations(&docs, "me");
        let ids: Vec<&str> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c2", "c1"]);
        assert_eq!(list[0].effective_display_name(), "Unknown User");
        assert_eq!(reconciler.unresolved_participants(&list, "me"), vec!["eve", "bob"]);

        resolver.resolve_name("eve").await;
        resolver.resolve_name("bob").await;
        let list = reconciler.reconcile_conversations(&docs, "me");
        assert_eq!(list[0].effective_display_name(), "Eve");
        assert_eq!(list[1].effective_display_name(), "Bob");
        assert!(reconciler.unresolved_participants(&list, "me").is_empty());
    }

    #[tokio::test]
    async fn test_failed_lookup_only_affects_its_conversation() {
        let (reconciler, resolver, store) =
            reconciler_with_profiles(&[("bob", "Bob"), ("eve", "Eve")]).await;
        store.fail_reads(
            StoreLayout::default().user("eve"),
            ChatError::data_access("unreachable"),
        );
        resolver.resolve_name("eve").await;
        resolver.resolve_name("bob").await;
        let docs = vec![
            direct("c2", "eve", "2024-05-01T10:00:02.000000Z"),
            direct("c1", "bob", "2024-05-01T10:00:01.000000Z"),
        ];

        let list = reconciler.reconcile_conversations(&docs, "me");
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].other_participant_name.as_deref(), Some("Unknown User"));
        assert_eq!(list[1].other_participant_name.as_deref(), Some("Bob"));
        assert_eq!(reconciler.unresolved_participants(&list, "me"), vec!["eve"]);
    }

    #[tokio::test]
    async fn test_attach_name_targets_matching_direct_conversations() {
        let (reconciler, _, _) = reconciler_with_profiles(&[]).await;
        let docs = vec![
            direct("c1", "bob", "2024-05-01T10:00:01.000000Z"),
            direct("c2", "eve", "2024-05-01T10:00:02.000000Z"),
        ];
        let mut list = reconciler.reconcile_conversations(&docs, "me");

        assert!(SnapshotReconciler::attach_name(&mut list[0], "me", "bob", "Bob"));
        assert!(!SnapshotReconciler::attach_name(&mut list[0], "me", "bob", "Bob"));
        assert!(!SnapshotReconciler::attach_name(&mut list[1], "me", "bob", "Bob"));
        assert_eq!(list[0].effective_display_name(), "Bob");
        assert_eq!(list[1].effective_display_name(), "Unknown User");
    }

    #[tokio::test]
    async fn test_groups_keep_stored_name_and_malformed_docs_are_skipped() {
        let (reconciler, _, _) = reconciler_with_profiles(&[]).await;
        let docs = vec![
            doc(
                "chats",
                "g1",
                json!({
                    "kind": "group",
                    "participants": ["me", "a", "b"],
                    "displayName": "Team",
                    "lastMessageTime": "2024-05-01T10:00:00.000000Z",
                }),
            ),
            doc("chats", "broken", json!({ "kind": 42 })),
        ];

        let list = reconciler.reconcile_conversations(&docs, "me");
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].effective_display_name(), "Team");
        assert_eq!(list[0].other_participant_name, None);
    }

    #[tokio::test]
    async fn test_messages_preserve_delivery_order() {
        let (reconciler, _, _) = reconciler_with_profiles(&[]).await;
        let docs = vec![
            doc(
                "chats/c1/messages",
                "m1",
                json!({ "sender": "me", "text": "one", "timestamp": "2024-05-01T10:00:00.000000Z" }),
            ),
            doc(
                "chats/c1/messages",
                "m2",
                json!({ "sender": "bob", "text": "two", "timestamp": "2024-05-01T10:00:01.000000Z" }),
            ),
            doc("chats/c1/messages", "m3", json!({ "sender": "bob" })),
        ];

        let messages = reconciler.reconcile_messages(&docs, "c1");
        let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["one", "two"]);
        assert!(messages.iter().all(|m| m.conversation_id == "c1"));
    }

    #[tokio::test]
    async fn test_missing_meta_document_yields_none() {
        let (reconciler, _, _) = reconciler_with_profiles(&[]).await;
        assert!(reconciler.reconcile_conversation(None, "me").is_none());
    }
}
