//! The conversation sync engine as driven by a UI shell.

use crate::conversation_writer::{ConversationWriter, SendOutcome};
use crate::membership_service::MembershipService;
use crate::participant_resolver::ParticipantResolver;
use crate::reconciler::SnapshotReconciler;
use crate::subscription::{StreamKey, SubscriptionManager};
use crate::view::{Notice, ViewState, ViewUpdate};
use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use quickchat_core::conversation::{Conversation, ConversationKind, fields};
use quickchat_core::error::{ChatError, Result};
use quickchat_core::identity::IdentityProvider;
use quickchat_core::store::{
    Direction, DocumentStore, ListenTarget, Query, SnapshotEvent, StoreLayout,
};
use quickchat_core::SyncSettings;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::watch;

/// A participant name looked up on behalf of `owner`'s view.
struct ResolvedName {
    owner: String,
    user_id: String,
    name: String,
}

/// What woke the event loop.
enum Wake {
    /// The identity changed; the new value is read when handling.
    IdentityPending,
    IdentityGone,
    Stream(StreamKey, SnapshotEvent),
    NameResolved(ResolvedName),
    /// Nothing to apply.
    Idle,
}

/// Keeps a local view of conversations and messages in sync with the store.
///
/// `ChatSync` is responsible for:
/// - Opening the conversation list of the signed-in user and the metadata
///   and message window of the selected conversation
/// - Closing every stream that no longer matches the view before opening new ones
/// - Rebuilding `ViewState` from each delivered snapshot
/// - Routing sends and membership changes, and reporting failures as notices
///
/// Events are processed one at a time by `process_next`/`process_pending`;
/// there is no parallel reconciliation. Participant name lookups run in the
/// background and never hold back a delivery: the list is rendered with
/// cached or placeholder names and patched as lookups complete.
pub struct ChatSync {
    identity: Arc<dyn IdentityProvider>,
    identity_rx: watch::Receiver<Option<String>>,
    identity_live: bool,
    settings: SyncSettings,
    layout: StoreLayout,
    resolver: Arc<ParticipantResolver>,
    reconciler: SnapshotReconciler,
    subscriptions: SubscriptionManager,
    writer: ConversationWriter,
    membership: MembershipService,
    name_lookups: FuturesUnordered<BoxFuture<'static, ResolvedName>>,
    /// Participants with a lookup in `name_lookups`.
    names_in_flight: HashSet<String>,
    state: ViewState,
    notices: Vec<Notice>,
}

impl ChatSync {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        identity: Arc<dyn IdentityProvider>,
        settings: SyncSettings,
    ) -> Self {
        let resolver = Arc::new(ParticipantResolver::new(store.clone(), &settings));
        Self {
            identity_rx: identity.watch(),
            identity_live: true,
            layout: StoreLayout::new(&settings),
            reconciler: SnapshotReconciler::new(resolver.clone()),
            resolver,
            subscriptions: SubscriptionManager::new(store.clone()),
            writer: ConversationWriter::new(store.clone(), identity.clone(), &settings),
            membership: MembershipService::new(store, identity.clone(), &settings),
            name_lookups: FuturesUnordered::new(),
            names_in_flight: HashSet::new(),
            identity,
            settings,
            state: ViewState::default(),
            notices: Vec::new(),
        }
    }

    /// Sets up the view for whoever is signed in right now.
    pub async fn start(&mut self) -> Result<()> {
        let user = self.identity_rx.borrow_and_update().clone();
        self.switch_identity(user).await
    }

    pub fn state(&self) -> &ViewState {
        &self.state
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn open_streams(&self) -> Vec<StreamKey> {
        self.subscriptions.open_keys()
    }

    /// Drains the queued notices, oldest first.
    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    fn notify(&mut self, notice: Notice) {
        self.notices.push(notice);
    }

    fn conversation_list_query(&self, user_id: &str) -> Query {
        Query::collection(self.layout.conversations().clone())
            .where_array_contains(fields::PARTICIPANTS, user_id)
            .order_by(fields::LAST_MESSAGE_TIME, Direction::Descending)
    }

    fn message_window_query(&self, conversation_id: &str) -> Query {
        Query::collection(self.layout.messages(conversation_id))
            .order_by(fields::TIMESTAMP, Direction::Ascending)
            .limit_to_last(self.settings.message_window)
    }

    /// The signed-in user, provided the view belongs to them.
    fn acting_user(&self) -> Result<String> {
        match (self.identity.current_user(), self.state.user_id.as_deref()) {
            (Some(current), Some(view_user)) if current == view_user => Ok(current),
            (Some(_), _) => Err(ChatError::unauthenticated(
                "the signed-in user changed; the view is being rebuilt",
            )),
            (None, _) => Err(ChatError::unauthenticated("no user is signed in")),
        }
    }

    async fn switch_identity(&mut self, user: Option<String>) -> Result<()> {
        let closed = self.subscriptions.close_all();
        self.name_lookups = FuturesUnordered::new();
        self.names_in_flight.clear();
        self.resolver.clear_cache();
        self.state = ViewState::signed_in(user.clone());
        tracing::info!(
            "[ChatSync] Identity is now {} ({} streams closed)",
            user.as_deref().unwrap_or("<signed out>"),
            closed
        );

        let Some(user) = user else {
            return Ok(());
        };
        let target = ListenTarget::Query(self.conversation_list_query(&user));
        if let Err(e) = self
            .subscriptions
            .open(StreamKey::ConversationList(user), target)
            .await
        {
            self.state.conversations_loading = false;
            self.notify(Notice::error(format!("Could not load conversations: {}", e)));
            return Err(e);
        }
        Ok(())
    }

    /// Makes `conversation_id` the active conversation.
    ///
    /// Streams of the previously selected conversation are closed before the
    /// new ones open.
    pub async fn on_select_conversation(&mut self, conversation_id: &str) -> Result<()> {
        let user = self.acting_user()?;
        if conversation_id.is_empty() {
            return Err(ChatError::invalid_argument("conversation id must not be empty"));
        }

        let list_key = StreamKey::ConversationList(user);
        self.subscriptions.retain(|key| *key == list_key);

        self.state.selected_conversation = Some(conversation_id.to_string());
        self.state.active_conversation = None;
        self.state.messages.clear();
        self.state.messages_loading = true;
        tracing::info!("[ChatSync] Selected conversation {}", conversation_id);

        let meta = ListenTarget::Document(self.layout.conversation(conversation_id));
        let window = ListenTarget::Query(self.message_window_query(conversation_id));
        let opened = match self
            .subscriptions
            .open(StreamKey::ConversationMeta(conversation_id.to_string()), meta)
            .await
        {
            Ok(_) => {
                self.subscriptions
                    .open(StreamKey::Messages(conversation_id.to_string()), window)
                    .await
            }
            Err(e) => Err(e),
        };

        if let Err(e) = opened {
            self.subscriptions.retain(|key| !key.is_conversation_scoped());
            self.state.messages_loading = false;
            self.notify(Notice::error(format!("Could not open conversation: {}", e)));
            return Err(e);
        }
        Ok(())
    }

    /// Leaves the active conversation, keeping only the conversation list live.
    pub fn clear_selection(&mut self) {
        self.subscriptions.retain(|key| !key.is_conversation_scoped());
        self.state.selected_conversation = None;
        self.state.active_conversation = None;
        self.state.messages.clear();
        self.state.messages_loading = false;
    }

    /// Filters the rendered conversation list. The list itself is untouched.
    pub fn on_search(&mut self, term: &str) {
        self.state.search_term = term.to_string();
    }

    pub fn visible_conversations(&self) -> Vec<&Conversation> {
        self.state.visible_conversations()
    }

    pub fn set_input(&mut self, text: impl Into<String>) {
        self.state.input = text.into();
    }

    pub fn input(&self) -> &str {
        &self.state.input
    }

    /// Sends `text` to the selected conversation as the signed-in user.
    ///
    /// An empty message is rejected silently. Other failures are also queued
    /// as notices; a stale summary is a warning on an otherwise successful send.
    pub async fn on_send(&mut self, text: &str) -> Result<SendOutcome> {
        if text.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let sender = match self.acting_user() {
            Ok(user) => user,
            Err(e) => {
                self.notify(Notice::warning("Sign in to send messages"));
                return Err(e);
            }
        };
        let conversation_id = self.state.selected_conversation.clone().unwrap_or_default();

        match self.writer.send(&conversation_id, &sender, text).await {
            Ok(outcome) => {
                if outcome.summary_is_stale() {
                    self.notify(Notice::warning(
                        "Message sent, but the conversation summary could not be updated",
                    ));
                }
                Ok(outcome)
            }
            Err(e) if e.is_precondition() => {
                self.notify(Notice::warning(format!("Message not sent: {}", e)));
                Err(e)
            }
            Err(e) => {
                tracing::error!(
                    "[ChatSync] Failed to send message to {}: {}",
                    conversation_id,
                    e
                );
                self.notify(Notice::error(format!("Failed to send message: {}", e)));
                Err(e)
            }
        }
    }

    /// Sends the input buffer, clearing it once the message is stored.
    pub async fn send_input(&mut self) -> Result<SendOutcome> {
        let text = self.state.input.clone();
        let outcome = self.on_send(&text).await?;
        self.state.input.clear();
        Ok(outcome)
    }

    /// Retries the summary update of a conversation after a stale-summary warning.
    pub async fn refresh_summary(&self, conversation_id: &str) -> Result<()> {
        self.writer.refresh_summary(conversation_id).await
    }

    /// Starts a direct conversation with the user registered under `email`
    /// and selects it.
    pub async fn start_conversation_with(&mut self, email: &str) -> Result<String> {
        let created = self.membership.start_direct_conversation(email).await;
        self.select_created(created).await
    }

    /// Creates a group of the signed-in user and `members`, and selects it.
    pub async fn create_group(&mut self, name: &str, members: &[String]) -> Result<String> {
        let created = match self.acting_user() {
            Ok(user) => {
                let mut participants = vec![user];
                participants.extend(members.iter().cloned());
                self.membership
                    .create_conversation(ConversationKind::Group, &participants, Some(name))
                    .await
            }
            Err(e) => Err(e),
        };
        self.select_created(created).await
    }

    async fn select_created(&mut self, created: Result<String>) -> Result<String> {
        let conversation_id = match created {
            Ok(id) => id,
            Err(e) => {
                let notice = if e.is_already_exists() || e.is_not_found() || e.is_precondition() {
                    Notice::warning(e.to_string())
                } else {
                    Notice::error(format!("Could not create conversation: {}", e))
                };
                self.notify(notice);
                return Err(e);
            }
        };
        self.notify(Notice::info("Conversation created"));
        self.on_select_conversation(&conversation_id).await?;
        Ok(conversation_id)
    }

    /// Adds the user registered under `email` to a group conversation.
    pub async fn add_member(&mut self, conversation_id: &str, email: &str) -> Result<()> {
        let added = match self.membership.lookup_user_by_email(email).await {
            Ok(user_id) => self.membership.add_member(conversation_id, &user_id).await,
            Err(e) => Err(e),
        };
        match added {
            Ok(()) => {
                self.notify(Notice::info(format!("Added {}", email.trim())));
                Ok(())
            }
            Err(e) => {
                self.notify(Notice::warning(format!("Could not add member: {}", e)));
                Err(e)
            }
        }
    }

    /// Deletes a conversation and its messages, leaving it if it was selected.
    pub async fn delete_conversation(&mut self, conversation_id: &str) -> Result<()> {
        if let Err(e) = self.membership.delete_conversation(conversation_id).await {
            self.notify(Notice::error(format!("Could not delete conversation: {}", e)));
            return Err(e);
        }
        if self.state.is_selected(conversation_id) {
            self.clear_selection();
        }
        Ok(())
    }

    /// Waits for the next identity transition, stream delivery or resolved
    /// participant name and applies it.
    ///
    /// Returns `None` when nothing can wake the loop any more: no stream is
    /// open, no lookup is running and the identity provider is gone.
    pub async fn process_next(&mut self) -> Option<ViewUpdate> {
        loop {
            let wake = tokio::select! {
                biased;
                changed = self.identity_rx.changed(), if self.identity_live => match changed {
                    Ok(()) => Wake::IdentityPending,
                    Err(_) => Wake::IdentityGone,
                },
                delivered = self.subscriptions.next_event(), if !self.subscriptions.is_empty() => {
                    match delivered {
                        Some((key, event)) => Wake::Stream(key, event),
                        None => Wake::Idle,
                    }
                }
                resolved = self.name_lookups.next(), if !self.name_lookups.is_empty() => {
                    match resolved {
                        Some(resolved) => Wake::NameResolved(resolved),
                        None => Wake::Idle,
                    }
                }
                else => return None,
            };

            if let Some(update) = self.handle(wake).await {
                return Some(update);
            }
        }
    }

    /// Applies every identity transition, delivery and finished lookup that
    /// is already queued.
    pub async fn process_pending(&mut self) -> Vec<ViewUpdate> {
        let mut updates = Vec::new();
        loop {
            let wake = if self.identity_live && self.identity_rx.has_changed().unwrap_or(false) {
                Wake::IdentityPending
            } else if let Some((key, event)) = self.subscriptions.try_next_event() {
                Wake::Stream(key, event)
            } else if let Some(resolved) = self.name_lookups.next().now_or_never().flatten() {
                Wake::NameResolved(resolved)
            } else {
                return updates;
            };
            if let Some(update) = self.handle(wake).await {
                updates.push(update);
            }
        }
    }

    async fn handle(&mut self, wake: Wake) -> Option<ViewUpdate> {
        match wake {
            Wake::IdentityPending => {
                let user = self.identity_rx.borrow_and_update().clone();
                if user == self.state.user_id {
                    return None;
                }
                if let Err(e) = self.switch_identity(user.clone()).await {
                    tracing::warn!("[ChatSync] View for new identity is incomplete: {}", e);
                }
                Some(ViewUpdate::IdentityChanged { user_id: user })
            }
            Wake::IdentityGone => {
                tracing::warn!("[ChatSync] Identity provider went away");
                self.identity_live = false;
                None
            }
            Wake::Stream(key, event) => self.apply_event(key, event),
            Wake::NameResolved(resolved) => self.apply_name(resolved),
            Wake::Idle => None,
        }
    }

    /// Whether the view still belongs to `user`, who is still signed in.
    fn owns_view(&self, user: &str) -> bool {
        self.identity.current_user().as_deref() == Some(user)
            && self.state.user_id.as_deref() == Some(user)
    }

    /// Whether a result computed for `key` on behalf of `user` may still be applied.
    fn still_current(&self, key: &StreamKey, user: &str) -> bool {
        self.owns_view(user) && self.subscriptions.is_open(key)
    }

    /// Starts a background lookup for every participant not already queued.
    fn queue_name_lookups(&mut self, owner: &str, participants: Vec<String>) {
        for user_id in participants {
            if !self.names_in_flight.insert(user_id.clone()) {
                continue;
            }
            tracing::debug!("[ChatSync] Looking up the name of {}", user_id);
            let resolver = self.resolver.clone();
            let owner = owner.to_string();
            self.name_lookups.push(
                async move {
                    let name = resolver.resolve_name(&user_id).await;
                    ResolvedName {
                        owner,
                        user_id,
                        name,
                    }
                }
                .boxed(),
            );
        }
    }

    fn apply_name(&mut self, resolved: ResolvedName) -> Option<ViewUpdate> {
        self.names_in_flight.remove(&resolved.user_id);
        if !self.owns_view(&resolved.owner) {
            tracing::debug!(
                "[ChatSync] Dropping name of {} resolved for a previous view",
                resolved.user_id
            );
            return None;
        }

        let ResolvedName {
            owner,
            user_id,
            name,
        } = resolved;
        let mut changed = false;
        for conversation in self.state.conversations.iter_mut() {
            changed |= SnapshotReconciler::attach_name(conversation, &owner, &user_id, &name);
        }
        if let Some(active) = self.state.active_conversation.as_mut() {
            changed |= SnapshotReconciler::attach_name(active, &owner, &user_id, &name);
        }
        changed.then_some(ViewUpdate::ParticipantNameResolved { user_id })
    }

    fn apply_event(&mut self, key: StreamKey, event: SnapshotEvent) -> Option<ViewUpdate> {
        let user = self.state.user_id.clone()?;

        let snapshot = match event {
            Ok(snapshot) => snapshot,
            Err(error) => return Some(self.fail_stream(key, error)),
        };

        match &key {
            StreamKey::ConversationList(owner) => {
                if *owner != user {
                    return None;
                }
                if !self.still_current(&key, &user) {
                    tracing::debug!("[ChatSync] Dropping outdated delivery for {}", key);
                    return None;
                }
                let conversations = self
                    .reconciler
                    .reconcile_conversations(&snapshot.documents, &user);
                let unresolved = self.reconciler.unresolved_participants(&conversations, &user);
                tracing::debug!(
                    "[ChatSync] Conversation list rebuilt with {} entries ({} names pending)",
                    conversations.len(),
                    unresolved.len()
                );
                self.queue_name_lookups(&user, unresolved);
                self.state.conversations = conversations;
                self.state.conversations_loading = false;
                Some(ViewUpdate::ConversationsChanged)
            }
            StreamKey::ConversationMeta(conversation_id) => {
                if !self.still_current(&key, &user) || !self.state.is_selected(conversation_id) {
                    tracing::debug!("[ChatSync] Dropping outdated delivery for {}", key);
                    return None;
                }
                let active = self
                    .reconciler
                    .reconcile_conversation(snapshot.documents.first(), &user);
                match &active {
                    Some(conversation) => {
                        let unresolved = self
                            .reconciler
                            .unresolved_participants(std::iter::once(conversation), &user);
                        self.queue_name_lookups(&user, unresolved);
                    }
                    None => {
                        tracing::info!("[ChatSync] Conversation {} no longer exists", conversation_id);
                    }
                }
                self.state.active_conversation = active;
                Some(ViewUpdate::ActiveConversationChanged)
            }
            StreamKey::Messages(conversation_id) => {
                if !self.still_current(&key, &user) || !self.state.is_selected(conversation_id) {
                    return None;
                }
                self.state.messages = self
                    .reconciler
                    .reconcile_messages(&snapshot.documents, conversation_id);
                self.state.messages_loading = false;
                Some(ViewUpdate::MessagesChanged)
            }
        }
    }

    /// Clears the view fed by a failed stream. The stream is not reopened.
    fn fail_stream(&mut self, key: StreamKey, error: ChatError) -> ViewUpdate {
        match &key {
            StreamKey::ConversationList(_) => {
                self.state.conversations.clear();
                self.state.conversations_loading = false;
            }
            StreamKey::ConversationMeta(conversation_id) => {
                if self.state.is_selected(conversation_id) {
                    self.state.active_conversation = None;
                }
            }
            StreamKey::Messages(conversation_id) => {
                if self.state.is_selected(conversation_id) {
                    self.state.messages.clear();
                    self.state.messages_loading = false;
                }
            }
        }
        tracing::warn!("[ChatSync] Live updates for {} stopped: {}", key, error);
        self.notify(Notice::error(format!(
            "Live updates stopped ({}): {}",
            key, error
        )));
        ViewUpdate::StreamFailed { key, error }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickchat_infrastructure::{InMemoryDocumentStore, InMemoryIdentityProvider};

    fn engine(user: Option<&str>) -> (ChatSync, Arc<InMemoryDocumentStore>, Arc<InMemoryIdentityProvider>) {
        let store = Arc::new(InMemoryDocumentStore::new());
        let identity = Arc::new(InMemoryIdentityProvider::new(user.map(str::to_string)));
        let sync = ChatSync::new(store.clone(), identity.clone(), SyncSettings::default());
        (sync, store, identity)
    }

    #[tokio::test]
    async fn test_start_opens_only_the_conversation_list() {
        let (mut sync, _, _) = engine(Some("u1"));
        sync.start().await.unwrap();
        assert_eq!(
            sync.open_streams(),
            vec![StreamKey::ConversationList("u1".to_string())]
        );
        assert!(sync.state().conversations_loading);

        let updates = sync.process_pending().await;
        assert_eq!(updates, vec![ViewUpdate::ConversationsChanged]);
        assert!(!sync.state().conversations_loading);
        assert!(sync.state().conversations.is_empty());
    }

    #[tokio::test]
    async fn test_signed_out_start_opens_nothing() {
        let (mut sync, _, _) = engine(None);
        sync.start().await.unwrap();
        assert!(sync.open_streams().is_empty());
        assert!(sync.on_select_conversation("c1").await.is_err());
    }

    #[tokio::test]
    async fn test_blank_send_is_silent() {
        let (mut sync, store, _) = engine(Some("u1"));
        sync.start().await.unwrap();
        sync.set_input("   ");
        let before = store.write_count();

        assert_eq!(sync.send_input().await.unwrap_err(), ChatError::EmptyMessage);
        assert_eq!(sync.input(), "   ");
        assert!(sync.take_notices().is_empty());
        assert_eq!(store.write_count(), before);
    }

    #[tokio::test]
    async fn test_search_filters_without_reordering() {
        let (mut sync, store, _) = engine(Some("u1"));
        let layout = StoreLayout::default();
        for (name, text) in [("Alpha", "hello"), ("Beta", "bye"), ("Gamma", "see you")] {
            let path = store
                .add(
                    layout.conversations(),
                    Conversation::new_document(
                        ConversationKind::Group,
                        &["u1".to_string(), "u2".to_string()],
                        Some(name),
                    ),
                )
                .await
                .unwrap();
            store
                .merge(
                    &path,
                    quickchat_core::store::WriteData::new().set(fields::LAST_MESSAGE, text),
                )
                .await
                .unwrap();
        }
        sync.start().await.unwrap();
        sync.process_pending().await;

        sync.on_search("gam");
        let visible: Vec<&str> = sync
            .visible_conversations()
            .iter()
            .map(|c| c.effective_display_name())
            .collect();
        assert_eq!(visible, vec!["Gamma"]);
        assert_eq!(sync.state().conversations.len(), 3);

        sync.on_search("HELLO");
        assert_eq!(sync.visible_conversations().len(), 1);

        sync.on_search("");
        assert_eq!(sync.visible_conversations().len(), 3);
    }
}
