//! In-memory document store with live push subscriptions.
//!
//! Implements the full `DocumentStore` contract: filtered/ordered queries,
//! listeners that receive a snapshot on registration and after every
//! change affecting their target, a strictly increasing server clock, and
//! atomic write batches. Faults can be injected per path to exercise the
//! degraded paths of the sync engine.

use async_trait::async_trait;
use quickchat_core::error::{ChatError, Result};
use quickchat_core::store::{
    ChangeKind, CollectionPath, Direction, Document, DocumentChange, DocumentData, DocumentPath,
    DocumentStore, Limit, ListenTarget, Precondition, Query, Snapshot, SnapshotEvent,
    SnapshotReceiver, WriteBatch, WriteData, WriteOp,
};
use quickchat_core::Timestamp;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct StoredDocument {
    data: DocumentData,
    /// Insertion sequence; breaks ordering ties.
    seq: u64,
}

struct Listener {
    id: u64,
    target: ListenTarget,
    cancel: CancellationToken,
    sender: mpsc::UnboundedSender<SnapshotEvent>,
    last: Vec<Document>,
}

impl Listener {
    fn is_detached(&self) -> bool {
        self.cancel.is_cancelled() || self.sender.is_closed()
    }

    fn observes(&self, collection: &CollectionPath) -> bool {
        match &self.target {
            ListenTarget::Query(query) => &query.collection == collection,
            ListenTarget::Document(path) => path.collection() == collection,
        }
    }
}

#[derive(Debug, Clone)]
enum Fault {
    Read(DocumentPath, ChatError),
    Write(DocumentPath, ChatError),
    Add(CollectionPath, ChatError),
}

#[derive(Default)]
struct StoreState {
    collections: HashMap<CollectionPath, BTreeMap<String, StoredDocument>>,
    listeners: Vec<Listener>,
    faults: Vec<Fault>,
    last_timestamp: Option<Timestamp>,
    next_seq: u64,
    next_listener_id: u64,
    write_count: u64,
}

impl StoreState {
    /// Strictly increasing server clock.
    fn tick(&mut self) -> Timestamp {
        let now = Timestamp::now();
        let ts = match self.last_timestamp {
            Some(last) if now <= last => last.next_tick(),
            _ => now,
        };
        self.last_timestamp = Some(ts);
        ts
    }

    fn read_fault(&self, path: &DocumentPath) -> Option<ChatError> {
        self.faults.iter().find_map(|fault| match fault {
            Fault::Read(p, err) if p == path => Some(err.clone()),
            _ => None,
        })
    }

    fn write_fault(&self, op: &WriteOp) -> Option<ChatError> {
        self.faults.iter().find_map(|fault| match (fault, op) {
            (Fault::Write(p, err), WriteOp::Merge { path, .. })
            | (Fault::Write(p, err), WriteOp::Delete { path })
                if p == path =>
            {
                Some(err.clone())
            }
            (Fault::Add(c, err), WriteOp::Add { collection, .. }) if c == collection => {
                Some(err.clone())
            }
            _ => None,
        })
    }

    fn document(&self, path: &DocumentPath) -> Option<Document> {
        self.collections
            .get(path.collection())
            .and_then(|docs| docs.get(path.id()))
            .map(|stored| Document::new(path.clone(), stored.data.clone()))
    }

    fn evaluate(&self, query: &Query) -> Vec<Document> {
        let Some(docs) = self.collections.get(&query.collection) else {
            return Vec::new();
        };

        let mut matched: Vec<(&String, &StoredDocument)> = docs
            .iter()
            .filter(|(_, stored)| query.matches(&stored.data))
            .collect();

        match &query.order_by {
            Some(order) => {
                // Documents lacking the ordering field are not part of an ordered result.
                matched.retain(|(_, stored)| stored.data.contains_key(&order.field));
                matched.sort_by(|(_, a), (_, b)| {
                    let by_field =
                        compare_values(a.data.get(&order.field), b.data.get(&order.field));
                    let by_field = match order.direction {
                        Direction::Ascending => by_field,
                        Direction::Descending => by_field.reverse(),
                    };
                    by_field.then(a.seq.cmp(&b.seq))
                });
            }
            None => matched.sort_by_key(|(_, stored)| stored.seq),
        }

        match query.limit {
            Some(Limit::First(n)) => matched.truncate(n),
            Some(Limit::Last(n)) if matched.len() > n => {
                matched.drain(..matched.len() - n);
            }
            _ => {}
        }

        matched
            .into_iter()
            .map(|(id, stored)| Document::new(query.collection.doc(id.clone()), stored.data.clone()))
            .collect()
    }

    fn resolve_target(&self, target: &ListenTarget) -> Vec<Document> {
        match target {
            ListenTarget::Query(query) => self.evaluate(query),
            ListenTarget::Document(path) => self.document(path).into_iter().collect(),
        }
    }

    fn apply(&mut self, op: WriteOp, now: Timestamp) -> DocumentPath {
        match op {
            WriteOp::Add { collection, data } => {
                let path = collection.doc(new_document_id());
                self.upsert(&path, &data, now);
                path
            }
            WriteOp::Merge { path, data } => {
                self.upsert(&path, &data, now);
                path
            }
            WriteOp::Delete { path } => {
                if let Some(docs) = self.collections.get_mut(path.collection()) {
                    docs.remove(path.id());
                }
                path
            }
        }
    }

    fn upsert(&mut self, path: &DocumentPath, data: &WriteData, now: Timestamp) {
        let resolved = data.resolve(now);
        let seq = self.next_seq;
        let docs = self
            .collections
            .entry(path.collection().clone())
            .or_default();
        match docs.get_mut(path.id()) {
            Some(existing) => existing.data.extend(resolved),
            None => {
                docs.insert(
                    path.id().to_string(),
                    StoredDocument {
                        data: resolved,
                        seq,
                    },
                );
                self.next_seq += 1;
            }
        }
    }

    /// Pushes a snapshot to every listener whose result set changed.
    fn notify(&mut self) {
        let mut listeners = std::mem::take(&mut self.listeners);
        listeners.retain(|listener| !listener.is_detached());

        for listener in listeners.iter_mut() {
            let current = self.resolve_target(&listener.target);
            if current == listener.last {
                continue;
            }
            let changes = diff(&listener.last, &current);
            let snapshot = Snapshot {
                documents: current.clone(),
                changes,
            };
            if listener.sender.send(Ok(snapshot)).is_ok() {
                listener.last = current;
            }
        }

        listeners.retain(|listener| !listener.is_detached());
        self.listeners = listeners;
    }
}

fn new_document_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Bool(_)) => 1,
        Some(Value::Number(_)) => 2,
        Some(Value::String(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Object(_)) => 5,
    }
}

/// Total order over field values used by `order_by`.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

fn diff(previous: &[Document], current: &[Document]) -> Vec<DocumentChange> {
    let before: HashMap<&DocumentPath, &Document> =
        previous.iter().map(|doc| (&doc.path, doc)).collect();
    let after: HashMap<&DocumentPath, &Document> =
        current.iter().map(|doc| (&doc.path, doc)).collect();

    let mut changes = Vec::new();
    for doc in current {
        match before.get(&doc.path) {
            None => changes.push(DocumentChange {
                kind: ChangeKind::Added,
                document: doc.clone(),
            }),
            Some(old) if old.data != doc.data => changes.push(DocumentChange {
                kind: ChangeKind::Modified,
                document: doc.clone(),
            }),
            Some(_) => {}
        }
    }
    for doc in previous {
        if !after.contains_key(&doc.path) {
            changes.push(DocumentChange {
                kind: ChangeKind::Removed,
                document: doc.clone(),
            });
        }
    }
    changes
}

/// Document store kept entirely in process memory.
///
/// # Example
///
/// ```ignore
/// use quickchat_core::store::{CollectionPath, DocumentStore, WriteData};
/// use quickchat_infrastructure::InMemoryDocumentStore;
///
/// let store = InMemoryDocumentStore::new();
/// let users = CollectionPath::new("users");
/// store.merge(&users.doc("u1"), WriteData::new().set("email", "a@example.com")).await?;
/// assert!(store.get(&users.doc("u1")).await?.is_some());
/// ```
#[derive(Default)]
pub struct InMemoryDocumentStore {
    state: Mutex<StoreState>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreState>> {
        self.state
            .lock()
            .map_err(|e| ChatError::internal(format!("store lock poisoned: {}", e)))
    }

    fn write(&self, op: WriteOp) -> Result<DocumentPath> {
        let mut state = self.lock()?;
        if let Some(err) = state.write_fault(&op) {
            return Err(err);
        }
        let now = state.tick();
        let path = state.apply(op, now);
        state.write_count += 1;
        state.notify();
        Ok(path)
    }

    // ============================================================================
    // Fault injection and introspection
    // ============================================================================

    /// Makes point reads of `path` fail with `error` until cleared.
    pub fn fail_reads(&self, path: DocumentPath, error: ChatError) {
        if let Ok(mut state) = self.lock() {
            state.faults.push(Fault::Read(path, error));
        }
    }

    /// Makes merge/delete writes to `path` fail with `error` until cleared.
    pub fn fail_writes(&self, path: DocumentPath, error: ChatError) {
        if let Ok(mut state) = self.lock() {
            state.faults.push(Fault::Write(path, error));
        }
    }

    /// Makes document creation in `collection` fail with `error` until cleared.
    pub fn fail_adds(&self, collection: CollectionPath, error: ChatError) {
        if let Ok(mut state) = self.lock() {
            state.faults.push(Fault::Add(collection, error));
        }
    }

    pub fn clear_faults(&self) {
        if let Ok(mut state) = self.lock() {
            state.faults.clear();
        }
    }

    /// Terminates every listener observing `collection` with `error`,
    /// as a backend does when a permission is revoked.
    pub fn revoke_listeners(&self, collection: &CollectionPath, error: ChatError) -> usize {
        let Ok(mut state) = self.lock() else {
            return 0;
        };
        let mut revoked = 0;
        state.listeners.retain(|listener| {
            if listener.observes(collection) {
                let _ = listener.sender.send(Err(error.clone()));
                revoked += 1;
                false
            } else {
                true
            }
        });
        tracing::debug!(
            "[InMemoryDocumentStore] Revoked {} listener(s) on {}",
            revoked,
            collection
        );
        revoked
    }

    /// Number of live listeners, optionally restricted to one collection.
    pub fn listener_count(&self, collection: Option<&CollectionPath>) -> usize {
        let Ok(mut state) = self.lock() else {
            return 0;
        };
        state.listeners.retain(|listener| !listener.is_detached());
        state
            .listeners
            .iter()
            .filter(|listener| collection.is_none_or(|c| listener.observes(c)))
            .count()
    }

    /// Number of successfully applied writes (a batch counts each op).
    pub fn write_count(&self) -> u64 {
        self.lock().map(|state| state.write_count).unwrap_or_default()
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>> {
        let state = self.lock()?;
        if let Some(err) = state.read_fault(path) {
            return Err(err);
        }
        Ok(state.document(path))
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        Ok(self.lock()?.evaluate(query))
    }

    async fn add(&self, collection: &CollectionPath, data: WriteData) -> Result<DocumentPath> {
        self.write(WriteOp::Add {
            collection: collection.clone(),
            data,
        })
    }

    async fn merge(&self, path: &DocumentPath, data: WriteData) -> Result<()> {
        self.write(WriteOp::Merge {
            path: path.clone(),
            data,
        })
        .map(|_| ())
    }

    async fn merge_if(
        &self,
        path: &DocumentPath,
        precondition: &Precondition,
        data: WriteData,
    ) -> Result<bool> {
        let mut state = self.lock()?;
        let op = WriteOp::Merge {
            path: path.clone(),
            data,
        };
        if let Some(err) = state.write_fault(&op) {
            return Err(err);
        }
        let current = state
            .document(path)
            .ok_or_else(|| ChatError::not_found("Document", path.to_string()))?;
        if !precondition.holds(current.get(&precondition.field)) {
            tracing::debug!(
                "[InMemoryDocumentStore] Precondition on {}.{} failed",
                path,
                precondition.field
            );
            return Ok(false);
        }
        let now = state.tick();
        state.apply(op, now);
        state.write_count += 1;
        state.notify();
        Ok(true)
    }

    async fn delete(&self, path: &DocumentPath) -> Result<()> {
        self.write(WriteOp::Delete { path: path.clone() }).map(|_| ())
    }

    async fn listen(
        &self,
        target: ListenTarget,
        cancel: CancellationToken,
    ) -> Result<SnapshotReceiver> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut state = self.lock()?;

        let initial = state.resolve_target(&target);
        let changes = diff(&[], &initial);
        sender
            .send(Ok(Snapshot {
                documents: initial.clone(),
                changes,
            }))
            .map_err(|_| ChatError::internal("listener receiver dropped during registration"))?;

        let id = state.next_listener_id;
        state.next_listener_id += 1;
        tracing::debug!("[InMemoryDocumentStore] Listener {} registered", id);
        state.listeners.push(Listener {
            id,
            target,
            cancel,
            sender,
            last: initial,
        });
        Ok(receiver)
    }

    fn supports_atomic_batches(&self) -> bool {
        true
    }

    async fn commit(&self, batch: WriteBatch) -> Result<Vec<DocumentPath>> {
        let mut state = self.lock()?;
        if let Some(err) = batch.ops().iter().find_map(|op| state.write_fault(op)) {
            return Err(err);
        }
        let now = state.tick();
        let paths: Vec<DocumentPath> = batch
            .into_ops()
            .into_iter()
            .map(|op| state.apply(op, now))
            .collect();
        state.write_count += paths.len() as u64;
        state.notify();
        Ok(paths)
    }
}

impl std::fmt::Debug for InMemoryDocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let listeners = self
            .lock()
            .map(|state| state.listeners.iter().map(|l| l.id).collect::<Vec<_>>())
            .unwrap_or_default();
        f.debug_struct("InMemoryDocumentStore")
            .field("listeners", &listeners)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chats() -> CollectionPath {
        CollectionPath::new("chats")
    }

    #[tokio::test]
    async fn test_merge_keeps_untouched_fields() {
        let store = InMemoryDocumentStore::new();
        let path = chats().doc("c1");
        store
            .merge(&path, WriteData::new().set("a", 1).set("b", 2))
            .await
            .unwrap();
        store.merge(&path, WriteData::new().set("b", 3)).await.unwrap();

        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.get("a"), Some(&json!(1)));
        assert_eq!(doc.get("b"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn test_server_timestamps_strictly_increase() {
        let store = InMemoryDocumentStore::new();
        let messages = chats().doc("c1").subcollection("messages");
        for i in 0..5 {
            store
                .add(&messages, WriteData::new().set("n", i).server_timestamp("ts"))
                .await
                .unwrap();
        }
        let docs = store
            .query(&Query::collection(messages).order_by("ts", Direction::Ascending))
            .await
            .unwrap();
        let order: Vec<i64> = docs.iter().map(|d| d.get("n").unwrap().as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        let stamps: Vec<&str> = docs.iter().map(|d| d.get("ts").unwrap().as_str().unwrap()).collect();
        assert!(stamps.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_merge_if_applies_only_when_field_matches() {
        let store = InMemoryDocumentStore::new();
        let path = chats().doc("c1");
        store.merge(&path, WriteData::new().set("v", 1)).await.unwrap();

        let stale = Precondition::field_equals("v", Some(json!(0)));
        assert!(!store.merge_if(&path, &stale, WriteData::new().set("v", 9)).await.unwrap());
        assert_eq!(store.get(&path).await.unwrap().unwrap().get("v"), Some(&json!(1)));

        let fresh = Precondition::field_equals("v", Some(json!(1)));
        assert!(store.merge_if(&path, &fresh, WriteData::new().set("v", 2)).await.unwrap());
        assert_eq!(store.get(&path).await.unwrap().unwrap().get("v"), Some(&json!(2)));

        let absent = Precondition::field_equals("w", None);
        assert!(store.merge_if(&path, &absent, WriteData::new().set("w", 1)).await.unwrap());

        let err = store
            .merge_if(&chats().doc("missing"), &absent, WriteData::new().set("w", 1))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_limit_to_last_keeps_newest_in_order() {
        let store = InMemoryDocumentStore::new();
        for i in 0..10 {
            store
                .merge(&chats().doc(format!("c{}", i)), WriteData::new().set("n", i))
                .await
                .unwrap();
        }
        let docs = store
            .query(
                &Query::collection(chats())
                    .order_by("n", Direction::Ascending)
                    .limit_to_last(3),
            )
            .await
            .unwrap();
        let ids: Vec<&str> = docs.iter().map(|d| d.id()).collect();
        assert_eq!(ids, vec!["c7", "c8", "c9"]);
    }

    #[tokio::test]
    async fn test_ordered_query_skips_documents_without_field() {
        let store = InMemoryDocumentStore::new();
        store.merge(&chats().doc("a"), WriteData::new().set("t", 1)).await.unwrap();
        store.merge(&chats().doc("b"), WriteData::new().set("x", 1)).await.unwrap();
        let docs = store
            .query(&Query::collection(chats()).order_by("t", Direction::Descending))
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn test_listener_receives_initial_and_changes() {
        let store = InMemoryDocumentStore::new();
        let token = CancellationToken::new();
        let mut rx = store
            .listen(ListenTarget::Query(Query::collection(chats())), token.clone())
            .await
            .unwrap();

        let initial = rx.recv().await.unwrap().unwrap();
        assert!(initial.is_empty());

        store.merge(&chats().doc("c1"), WriteData::new().set("a", 1)).await.unwrap();
        let next = rx.recv().await.unwrap().unwrap();
        assert_eq!(next.len(), 1);
        assert_eq!(next.changes[0].kind, ChangeKind::Added);

        store.merge(&chats().doc("c1"), WriteData::new().set("a", 2)).await.unwrap();
        let modified = rx.recv().await.unwrap().unwrap();
        assert_eq!(modified.changes[0].kind, ChangeKind::Modified);

        store.delete(&chats().doc("c1")).await.unwrap();
        let removed = rx.recv().await.unwrap().unwrap();
        assert!(removed.is_empty());
        assert_eq!(removed.changes[0].kind, ChangeKind::Removed);
    }

    #[tokio::test]
    async fn test_cancelled_listener_gets_nothing_more() {
        let store = InMemoryDocumentStore::new();
        let token = CancellationToken::new();
        let mut rx = store
            .listen(ListenTarget::Document(chats().doc("c1")), token.clone())
            .await
            .unwrap();
        rx.recv().await.unwrap().unwrap();

        token.cancel();
        store.merge(&chats().doc("c1"), WriteData::new().set("a", 1)).await.unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(store.listener_count(None), 0);
    }

    #[tokio::test]
    async fn test_unrelated_writes_do_not_notify() {
        let store = InMemoryDocumentStore::new();
        let mut rx = store
            .listen(
                ListenTarget::Document(chats().doc("c1")),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        rx.recv().await.unwrap().unwrap();

        store.merge(&chats().doc("c2"), WriteData::new().set("a", 1)).await.unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_batch_fault_applies_nothing() {
        let store = InMemoryDocumentStore::new();
        let path = chats().doc("c1");
        store.fail_writes(path.clone(), ChatError::data_access("offline"));

        let batch = WriteBatch::new()
            .add(path.subcollection("messages"), WriteData::new().set("text", "hi"))
            .merge(path.clone(), WriteData::new().set("lastMessage", "hi"));
        assert!(store.commit(batch).await.is_err());
        assert_eq!(store.write_count(), 0);

        let messages = store
            .query(&Query::collection(path.subcollection("messages")))
            .await
            .unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_batch_shares_one_timestamp() {
        let store = InMemoryDocumentStore::new();
        let path = chats().doc("c1");
        let paths = store
            .commit(
                WriteBatch::new()
                    .add(path.subcollection("messages"), WriteData::new().server_timestamp("ts"))
                    .merge(path.clone(), WriteData::new().server_timestamp("ts")),
            )
            .await
            .unwrap();
        let message = store.get(&paths[0]).await.unwrap().unwrap();
        let chat = store.get(&path).await.unwrap().unwrap();
        assert_eq!(message.get("ts"), chat.get("ts"));
    }

    #[tokio::test]
    async fn test_revoke_sends_terminal_error() {
        let store = InMemoryDocumentStore::new();
        let mut rx = store
            .listen(
                ListenTarget::Query(Query::collection(chats())),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        rx.recv().await.unwrap().unwrap();

        let revoked = store.revoke_listeners(&chats(), ChatError::permission_denied("revoked"));
        assert_eq!(revoked, 1);
        assert!(rx.recv().await.unwrap().unwrap_err().is_permission_denied());
        assert!(rx.recv().await.is_none());
    }
}
