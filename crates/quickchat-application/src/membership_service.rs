//! Conversation creation and membership.
//!
//! Enforces the membership rules the sync engine relies on: direct
//! conversations have exactly two participants and are never duplicated,
//! groups have at least two participants and a name, and only participants
//! may change a conversation.

use quickchat_core::conversation::{Conversation, ConversationKind, fields};
use quickchat_core::error::{ChatError, Result};
use quickchat_core::identity::IdentityProvider;
use quickchat_core::participant;
use quickchat_core::store::{DocumentStore, Query, StoreLayout, WriteBatch, WriteData};
use quickchat_core::SyncSettings;
use std::collections::HashSet;
use std::sync::Arc;

pub struct MembershipService {
    store: Arc<dyn DocumentStore>,
    identity: Arc<dyn IdentityProvider>,
    layout: StoreLayout,
}

impl MembershipService {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            store,
            identity,
            layout: StoreLayout::new(settings),
        }
    }

    fn current_user(&self) -> Result<String> {
        self.identity
            .current_user()
            .ok_or_else(|| ChatError::unauthenticated("no user is signed in"))
    }

    /// Finds the id of the user registered with `email`.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no profile carries that email.
    pub async fn lookup_user_by_email(&self, email: &str) -> Result<String> {
        let email = email.trim();
        if email.is_empty() {
            return Err(ChatError::invalid_argument("email must not be empty"));
        }

        let matches = self
            .store
            .query(
                &Query::collection(self.layout.users().clone())
                    .where_eq(participant::fields::EMAIL, email)
                    .limit(1),
            )
            .await?;

        matches
            .first()
            .map(|doc| doc.id().to_string())
            .ok_or_else(|| ChatError::not_found("User", email))
    }

    /// Returns the direct conversation between the two users, if one exists.
    pub async fn find_existing_direct_conversation(
        &self,
        user_id: &str,
        other_user_id: &str,
    ) -> Result<Option<String>> {
        let docs = self
            .store
            .query(
                &Query::collection(self.layout.conversations().clone())
                    .where_array_contains(fields::PARTICIPANTS, user_id),
            )
            .await?;

        Ok(docs
            .iter()
            .filter_map(|doc| Conversation::try_from(doc).ok())
            .find(|c| c.is_direct() && c.has_participant(other_user_id))
            .map(|c| c.id))
    }

    /// Creates a conversation and returns its id.
    ///
    /// The signed-in user must be among `participants`. Duplicate ids are
    /// collapsed before the arity rules are checked.
    ///
    /// # Errors
    ///
    /// - `Unauthenticated` if nobody is signed in
    /// - `InvalidArgument` if the participant set or name breaks the kind's rules
    /// - `AlreadyExists` for a second direct conversation between the same users
    pub async fn create_conversation(
        &self,
        kind: ConversationKind,
        participants: &[String],
        display_name: Option<&str>,
    ) -> Result<String> {
        let current_user = self.current_user()?;

        let mut seen = HashSet::new();
        let participants: Vec<String> = participants
            .iter()
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty() && seen.insert(p.clone()))
            .collect();

        if !participants.contains(&current_user) {
            return Err(ChatError::invalid_argument(
                "the signed-in user must be a participant",
            ));
        }

        let display_name = display_name.map(str::trim).filter(|name| !name.is_empty());
        match kind {
            ConversationKind::Direct => {
                if participants.len() != 2 {
                    return Err(ChatError::invalid_argument(format!(
                        "a direct conversation needs exactly 2 participants, got {}",
                        participants.len()
                    )));
                }
                let other = participants
                    .iter()
                    .find(|p| **p != current_user)
                    .ok_or_else(|| ChatError::internal("direct conversation without a peer"))?;
                if let Some(existing) = self
                    .find_existing_direct_conversation(&current_user, other)
                    .await?
                {
                    return Err(ChatError::already_exists("Conversation", existing));
                }
            }
            ConversationKind::Group => {
                if participants.len() < 2 {
                    return Err(ChatError::invalid_argument(
                        "a group needs at least 2 participants",
                    ));
                }
                if display_name.is_none() {
                    return Err(ChatError::invalid_argument("a group needs a name"));
                }
            }
        }

        let path = self
            .store
            .add(
                self.layout.conversations(),
                Conversation::new_document(kind, &participants, display_name),
            )
            .await?;
        tracing::info!(
            "[MembershipService] Created {} conversation {} with {} participants",
            kind.as_str(),
            path.id(),
            participants.len()
        );
        Ok(path.id().to_string())
    }

    /// Starts a direct conversation between the signed-in user and the user
    /// registered with `email`. The email is stored as the fallback name.
    pub async fn start_direct_conversation(&self, email: &str) -> Result<String> {
        let current_user = self.current_user()?;
        let other = self.lookup_user_by_email(email).await?;
        if other == current_user {
            return Err(ChatError::invalid_argument(
                "cannot start a conversation with yourself",
            ));
        }
        self.create_conversation(
            ConversationKind::Direct,
            &[current_user, other],
            Some(email.trim()),
        )
        .await
    }

    /// Adds `user_id` to a group conversation. Adding an existing member is a no-op.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the conversation does not exist
    /// - `PermissionDenied` if the signed-in user is not a participant
    /// - `InvalidArgument` for direct conversations
    pub async fn add_member(&self, conversation_id: &str, user_id: &str) -> Result<()> {
        let current_user = self.current_user()?;
        let conversation = self.load(conversation_id).await?;

        if !conversation.has_participant(&current_user) {
            return Err(ChatError::permission_denied(format!(
                "user {} is not a participant of {}",
                current_user, conversation_id
            )));
        }
        if conversation.is_direct() {
            return Err(ChatError::invalid_argument(
                "direct conversation membership cannot change",
            ));
        }
        if conversation.has_participant(user_id) {
            return Ok(());
        }

        let mut participants = conversation.participants;
        participants.push(user_id.to_string());
        self.store
            .merge(
                &self.layout.conversation(conversation_id),
                WriteData::new().set(fields::PARTICIPANTS, participants),
            )
            .await?;
        tracing::info!(
            "[MembershipService] Added {} to conversation {}",
            user_id,
            conversation_id
        );
        Ok(())
    }

    /// Deletes a conversation together with its messages.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the conversation does not exist
    /// - `PermissionDenied` if the signed-in user is not a participant
    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<()> {
        let current_user = self.current_user()?;
        let conversation = self.load(conversation_id).await?;
        if !conversation.has_participant(&current_user) {
            return Err(ChatError::permission_denied(format!(
                "user {} is not a participant of {}",
                current_user, conversation_id
            )));
        }

        let messages = self
            .store
            .query(&Query::collection(self.layout.messages(conversation_id)))
            .await?;
        let message_count = messages.len();
        let conversation_path = self.layout.conversation(conversation_id);

        if self.store.supports_atomic_batches() {
            let batch = messages
                .into_iter()
                .fold(WriteBatch::new(), |batch, doc| batch.delete(doc.path))
                .delete(conversation_path);
            self.store.commit(batch).await?;
        } else {
            for doc in &messages {
                self.store.delete(&doc.path).await?;
            }
            self.store.delete(&conversation_path).await?;
        }

        tracing::info!(
            "[MembershipService] Deleted conversation {} and {} messages",
            conversation_id,
            message_count
        );
        Ok(())
    }

    async fn load(&self, conversation_id: &str) -> Result<Conversation> {
        let doc = self
            .store
            .get(&self.layout.conversation(conversation_id))
            .await?
            .ok_or_else(|| ChatError::not_found("Conversation", conversation_id))?;
        Conversation::try_from(&doc)
    }
}
