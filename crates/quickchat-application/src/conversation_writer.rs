//! The user-initiated send path.
//!
//! A send appends a message and then brings the parent conversation's
//! summary (`lastMessage`, `lastMessageTime`) in line with it. In the
//! two-step strategy these are separate writes: if the second one fails the
//! message is still delivered and the summary stays stale until the next
//! successful refresh. The summary is always recomputed from the newest
//! stored message, so a retry self-heals.

use quickchat_core::conversation::{Message, fields};
use quickchat_core::error::{ChatError, Result};
use quickchat_core::identity::{IdentityProvider, ensure_signed_in_as};
use quickchat_core::store::{
    Direction, DocumentStore, Precondition, Query, StoreLayout, WriteBatch, WriteData,
};
use quickchat_core::{SendStrategy, SyncSettings, Timestamp};
use std::sync::Arc;

/// Conditional summary writes before giving up under contention.
const SUMMARY_ATTEMPTS: usize = 5;

/// State of the conversation summary after a send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryStatus {
    Updated,
    /// The message is stored but the summary update failed.
    Stale(ChatError),
}

/// Result of a send whose message append succeeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOutcome {
    pub message_id: String,
    pub summary: SummaryStatus,
}

impl SendOutcome {
    pub fn summary_is_stale(&self) -> bool {
        matches!(self.summary, SummaryStatus::Stale(_))
    }
}

pub struct ConversationWriter {
    store: Arc<dyn DocumentStore>,
    identity: Arc<dyn IdentityProvider>,
    layout: StoreLayout,
    strategy: SendStrategy,
}

impl ConversationWriter {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            store,
            identity,
            layout: StoreLayout::new(settings),
            strategy: settings.send_strategy,
        }
    }

    /// Sends `text` to `conversation_id` as `sender_id`.
    ///
    /// # Errors
    ///
    /// - `EmptyMessage` / `InvalidArgument` / `Unauthenticated`: rejected
    ///   before any write.
    /// - Any store error from the message append. Summary failures are not
    ///   errors; they are reported through `SendOutcome::summary`.
    pub async fn send(
        &self,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
    ) -> Result<SendOutcome> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        if conversation_id.is_empty() {
            return Err(ChatError::invalid_argument("no conversation selected"));
        }
        ensure_signed_in_as(self.identity.as_ref(), sender_id)?;

        match self.strategy {
            SendStrategy::Atomic if self.store.supports_atomic_batches() => {
                self.send_atomic(conversation_id, sender_id, text).await
            }
            SendStrategy::Atomic => {
                tracing::debug!(
                    "[ConversationWriter] Store has no atomic batches, falling back to two-step send"
                );
                self.send_two_step(conversation_id, sender_id, text).await
            }
            SendStrategy::TwoStep => self.send_two_step(conversation_id, sender_id, text).await,
        }
    }

    async fn send_two_step(
        &self,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
    ) -> Result<SendOutcome> {
        let path = self
            .store
            .add(
                &self.layout.messages(conversation_id),
                Message::new_document(conversation_id, sender_id, text),
            )
            .await?;
        let message_id = path.id().to_string();
        tracing::debug!(
            "[ConversationWriter] Appended message {} to {}",
            message_id,
            conversation_id
        );

        // The identity may have changed while the append was in flight.
        let summary = match ensure_signed_in_as(self.identity.as_ref(), sender_id) {
            Err(e) => SummaryStatus::Stale(e),
            Ok(()) => match self.refresh_summary(conversation_id).await {
                Ok(()) => SummaryStatus::Updated,
                Err(e) => SummaryStatus::Stale(e),
            },
        };

        if let SummaryStatus::Stale(e) = &summary {
            tracing::warn!(
                "[ConversationWriter] Message {} stored but summary of {} is stale: {}",
                message_id,
                conversation_id,
                e
            );
        }

        Ok(SendOutcome {
            message_id,
            summary,
        })
    }

    async fn send_atomic(
        &self,
        conversation_id: &str,
        sender_id: &str,
        text: &str,
    ) -> Result<SendOutcome> {
        let batch = WriteBatch::new()
            .add(
                self.layout.messages(conversation_id),
                Message::new_document(conversation_id, sender_id, text),
            )
            .merge(
                self.layout.conversation(conversation_id),
                WriteData::new()
                    .set(fields::LAST_MESSAGE, text)
                    .server_timestamp(fields::LAST_MESSAGE_TIME),
            );

        let paths = self.store.commit(batch).await?;
        let message_id = paths
            .first()
            .map(|path| path.id().to_string())
            .ok_or_else(|| ChatError::internal("batch commit returned no paths"))?;
        tracing::debug!(
            "[ConversationWriter] Committed message {} and summary of {}",
            message_id,
            conversation_id
        );

        Ok(SendOutcome {
            message_id,
            summary: SummaryStatus::Updated,
        })
    }

    /// Recomputes the conversation summary from its newest stored message.
    ///
    /// Idempotent and safe to retry. Never moves `lastMessageTime` backwards:
    /// the summary is written with a precondition on the `lastMessageTime`
    /// that was read, and re-evaluated if another writer got there first.
    /// Stores without conditional merges get the time from the server clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation does not exist, the store fails,
    /// or the summary kept changing for `SUMMARY_ATTEMPTS` rounds.
    pub async fn refresh_summary(&self, conversation_id: &str) -> Result<()> {
        let conversation_path = self.layout.conversation(conversation_id);

        for attempt in 1..=SUMMARY_ATTEMPTS {
            let current = self
                .store
                .get(&conversation_path)
                .await?
                .ok_or_else(|| ChatError::not_found("Conversation", conversation_id))?;

            let latest = self
                .store
                .query(
                    &Query::collection(self.layout.messages(conversation_id))
                        .order_by(fields::TIMESTAMP, Direction::Descending)
                        .limit(1),
                )
                .await?;
            let Some(latest) = latest.first() else {
                return Ok(());
            };
            let message = Message::from_document(latest, conversation_id)?;

            let recorded_value = current.get(fields::LAST_MESSAGE_TIME).cloned();
            let recorded = recorded_value
                .as_ref()
                .and_then(|value| value.as_str())
                .and_then(Timestamp::parse);
            if recorded.is_some_and(|recorded| recorded >= message.timestamp) {
                tracing::debug!(
                    "[ConversationWriter] Summary of {} already covers message {}",
                    conversation_id,
                    message.id
                );
                return Ok(());
            }

            let guard = Precondition::field_equals(fields::LAST_MESSAGE_TIME, recorded_value);
            let data = WriteData::new()
                .set(fields::LAST_MESSAGE, message.text.as_str())
                .set(fields::LAST_MESSAGE_TIME, message.timestamp);
            match self.store.merge_if(&conversation_path, &guard, data).await {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    tracing::debug!(
                        "[ConversationWriter] Summary of {} changed underneath (attempt {}), re-reading",
                        conversation_id,
                        attempt
                    );
                }
                Err(e) if e.is_unsupported() => {
                    return self
                        .store
                        .merge(
                            &conversation_path,
                            WriteData::new()
                                .set(fields::LAST_MESSAGE, message.text)
                                .server_timestamp(fields::LAST_MESSAGE_TIME),
                        )
                        .await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(ChatError::data_access(format!(
            "summary of {} kept changing after {} attempts",
            conversation_id, SUMMARY_ATTEMPTS
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickchat_core::conversation::{Conversation, ConversationKind};
    use quickchat_infrastructure::{InMemoryDocumentStore, InMemoryIdentityProvider};

    struct Fixture {
        store: Arc<InMemoryDocumentStore>,
        identity: Arc<InMemoryIdentityProvider>,
        conversation_id: String,
    }

    impl Fixture {
        async fn new() -> Self {
            let store = Arc::new(InMemoryDocumentStore::new());
            let identity = Arc::new(InMemoryIdentityProvider::signed_in("u1"));
            let path = store
                .add(
                    StoreLayout::default().conversations(),
                    Conversation::new_document(
                        ConversationKind::Direct,
                        &["u1".to_string(), "u2".to_string()],
                        None,
                    ),
                )
                .await
                .unwrap();
            Self {
                store,
                identity,
                conversation_id: path.id().to_string(),
            }
        }

        fn writer(&self, strategy: SendStrategy) -> ConversationWriter {
            let settings = SyncSettings {
                send_strategy: strategy,
                ..SyncSettings::default()
            };
            ConversationWriter::new(self.store.clone(), self.identity.clone(), &settings)
        }

        async fn summary(&self) -> (String, String) {
            let doc = self
                .store
                .get(&StoreLayout::default().conversation(&self.conversation_id))
                .await
                .unwrap()
                .unwrap();
            (
                doc.get("lastMessage").unwrap().as_str().unwrap().to_string(),
                doc.get("lastMessageTime").unwrap().as_str().unwrap().to_string(),
            )
        }

        async fn messages(&self) -> Vec<quickchat_core::store::Document> {
            self.store
                .query(&Query::collection(
                    StoreLayout::default().messages(&self.conversation_id),
                ))
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_two_step_send_updates_summary() {
        let fx = Fixture::new().await;
        let outcome = fx
            .writer(SendStrategy::TwoStep)
            .send(&fx.conversation_id, "u1", "hello")
            .await
            .unwrap();

        assert_eq!(outcome.summary, SummaryStatus::Updated);
        let messages = fx.messages().await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id(), outcome.message_id);

        let (last_message, last_time) = fx.summary().await;
        assert_eq!(last_message, "hello");
        assert_eq!(
            Some(&serde_json::Value::String(last_time)),
            messages[0].get("timestamp")
        );
    }

    #[tokio::test]
    async fn test_blank_text_performs_no_writes() {
        let fx = Fixture::new().await;
        let before = fx.store.write_count();
        let err = fx
            .writer(SendStrategy::TwoStep)
            .send(&fx.conversation_id, "u1", "   ")
            .await
            .unwrap_err();
        assert_eq!(err, ChatError::EmptyMessage);
        assert_eq!(fx.store.write_count(), before);
    }

    #[tokio::test]
    async fn test_wrong_identity_is_rejected_before_io() {
        let fx = Fixture::new().await;
        let before = fx.store.write_count();
        let err = fx
            .writer(SendStrategy::TwoStep)
            .send(&fx.conversation_id, "u2", "hi")
            .await
            .unwrap_err();
        assert!(err.is_unauthenticated());

        fx.identity.sign_out();
        let err = fx
            .writer(SendStrategy::TwoStep)
            .send(&fx.conversation_id, "u1", "hi")
            .await
            .unwrap_err();
        assert!(err.is_unauthenticated());
        assert_eq!(fx.store.write_count(), before);
    }

    #[tokio::test]
    async fn test_summary_failure_keeps_message() {
        let fx = Fixture::new().await;
        fx.store.fail_writes(
            StoreLayout::default().conversation(&fx.conversation_id),
            ChatError::data_access("summary write rejected"),
        );

        let outcome = fx
            .writer(SendStrategy::TwoStep)
            .send(&fx.conversation_id, "u1", "hello")
            .await
            .unwrap();
        assert!(outcome.summary_is_stale());
        assert_eq!(fx.messages().await.len(), 1);
        assert_eq!(fx.summary().await.0, "");

        fx.store.clear_faults();
        fx.writer(SendStrategy::TwoStep)
            .refresh_summary(&fx.conversation_id)
            .await
            .unwrap();
        assert_eq!(fx.summary().await.0, "hello");
    }

    #[tokio::test]
    async fn test_append_failure_is_an_error() {
        let fx = Fixture::new().await;
        fx.store.fail_adds(
            StoreLayout::default().messages(&fx.conversation_id),
            ChatError::data_access("offline"),
        );
        let result = fx
            .writer(SendStrategy::TwoStep)
            .send(&fx.conversation_id, "u1", "hello")
            .await;
        assert!(result.is_err());
        assert!(fx.messages().await.is_empty());
    }

    #[tokio::test]
    async fn test_atomic_send_shares_timestamp() {
        let fx = Fixture::new().await;
        let outcome = fx
            .writer(SendStrategy::Atomic)
            .send(&fx.conversation_id, "u1", "together")
            .await
            .unwrap();
        assert_eq!(outcome.summary, SummaryStatus::Updated);

        let messages = fx.messages().await;
        let (last_message, last_time) = fx.summary().await;
        assert_eq!(last_message, "together");
        assert_eq!(
            messages[0].get("timestamp").and_then(|v| v.as_str()),
            Some(last_time.as_str())
        );
    }

    #[tokio::test]
    async fn test_refresh_never_moves_backwards() {
        let fx = Fixture::new().await;
        let writer = fx.writer(SendStrategy::TwoStep);
        writer.send(&fx.conversation_id, "u1", "first").await.unwrap();

        fx.store
            .merge(
                &StoreLayout::default().conversation(&fx.conversation_id),
                WriteData::new()
                    .set("lastMessage", "from elsewhere")
                    .set("lastMessageTime", Timestamp::parse("2999-01-01T00:00:00Z").unwrap()),
            )
            .await
            .unwrap();

        writer.refresh_summary(&fx.conversation_id).await.unwrap();
        assert_eq!(fx.summary().await.0, "from elsewhere");
    }

    #[tokio::test]
    async fn test_refresh_of_current_summary_writes_nothing() {
        let fx = Fixture::new().await;
        let writer = fx.writer(SendStrategy::TwoStep);
        writer.send(&fx.conversation_id, "u1", "hello").await.unwrap();

        let before = fx.store.write_count();
        writer.refresh_summary(&fx.conversation_id).await.unwrap();
        assert_eq!(fx.store.write_count(), before);
    }

    #[tokio::test]
    async fn test_refresh_of_missing_conversation_fails() {
        let fx = Fixture::new().await;
        let err = fx
            .writer(SendStrategy::TwoStep)
            .refresh_summary("nope")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
