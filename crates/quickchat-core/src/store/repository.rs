//! Document store contract.
//!
//! The sync engine depends only on four capabilities of the backing store:
//! live queries with push delivery, point reads, create/merge-update writes,
//! and server-assigned timestamps.

use super::document::{Document, SnapshotEvent, WriteData};
use super::path::{CollectionPath, DocumentPath};
use super::query::{ListenTarget, Query};
use crate::error::{ChatError, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Push channel of a live subscription.
///
/// The store sends an initial snapshot as soon as the listener is
/// registered, then one snapshot per change affecting the target. A stream
/// error is terminal: the store drops the listener after sending it.
pub type SnapshotReceiver = mpsc::UnboundedReceiver<SnapshotEvent>;

/// A single write inside a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Add {
        collection: CollectionPath,
        data: WriteData,
    },
    Merge {
        path: DocumentPath,
        data: WriteData,
    },
    Delete {
        path: DocumentPath,
    },
}

/// Writes applied all-or-nothing by stores that support it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, collection: CollectionPath, data: WriteData) -> Self {
        self.ops.push(WriteOp::Add { collection, data });
        self
    }

    pub fn merge(mut self, path: DocumentPath, data: WriteData) -> Self {
        self.ops.push(WriteOp::Merge { path, data });
        self
    }

    pub fn delete(mut self, path: DocumentPath) -> Self {
        self.ops.push(WriteOp::Delete { path });
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Guard of a conditional merge: `field` must currently hold `expected`.
///
/// `expected: None` means the field must be absent.
#[derive(Debug, Clone, PartialEq)]
pub struct Precondition {
    pub field: String,
    pub expected: Option<Value>,
}

impl Precondition {
    pub fn field_equals(field: impl Into<String>, expected: Option<Value>) -> Self {
        Self {
            field: field.into(),
            expected,
        }
    }

    pub fn holds(&self, current: Option<&Value>) -> bool {
        current == self.expected.as_ref()
    }
}

/// An abstract document database with query and push-subscription capability.
///
/// Merge-updates follow "last write per field wins". Server timestamps in
/// a write are assigned by the store when the write is applied.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Point read by path.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(Document))`: Document exists
    /// - `Ok(None)`: No document at that path
    /// - `Err(_)`: Read failed
    async fn get(&self, path: &DocumentPath) -> Result<Option<Document>>;

    /// One-shot evaluation of a query.
    async fn query(&self, query: &Query) -> Result<Vec<Document>>;

    /// Creates a document with a store-assigned id.
    async fn add(&self, collection: &CollectionPath, data: WriteData) -> Result<DocumentPath>;

    /// Merges fields into a document, creating it if missing.
    async fn merge(&self, path: &DocumentPath, data: WriteData) -> Result<()>;

    /// Merges fields into an existing document if `precondition` holds at
    /// the moment the write is applied.
    ///
    /// # Returns
    ///
    /// - `Ok(true)`: Precondition held, write applied
    /// - `Ok(false)`: Precondition failed, nothing written
    /// - `Err(NotFound)`: No document at that path
    /// - `Err(Unsupported)`: The store cannot evaluate preconditions
    async fn merge_if(
        &self,
        path: &DocumentPath,
        precondition: &Precondition,
        data: WriteData,
    ) -> Result<bool> {
        let _ = (path, precondition, data);
        Err(ChatError::unsupported("conditional merges"))
    }

    /// Deletes a document. Deleting a missing document is not an error.
    async fn delete(&self, path: &DocumentPath) -> Result<()>;

    /// Registers a live listener.
    ///
    /// The listener stays registered until `cancel` fires, the receiver is
    /// dropped, or a stream error is delivered. After `cancel` fires no
    /// further event is sent.
    async fn listen(&self, target: ListenTarget, cancel: CancellationToken)
    -> Result<SnapshotReceiver>;

    /// Whether `commit` applies a batch atomically.
    fn supports_atomic_batches(&self) -> bool {
        false
    }

    /// Applies every write of `batch` atomically, with one shared server
    /// timestamp. Returns the path written by each op, in order.
    async fn commit(&self, batch: WriteBatch) -> Result<Vec<DocumentPath>> {
        let _ = batch;
        Err(ChatError::unsupported("atomic write batches"))
    }
}
