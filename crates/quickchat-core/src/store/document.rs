//! Raw documents, snapshots and write payloads exchanged with the store.

use super::path::DocumentPath;
use crate::error::{ChatError, Result};
use crate::timestamp::Timestamp;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;

/// Field map of a stored document.
pub type DocumentData = serde_json::Map<String, Value>;

/// A document as delivered by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: DocumentPath,
    pub data: DocumentData,
}

impl Document {
    pub fn new(path: DocumentPath, data: DocumentData) -> Self {
        Self { path, data }
    }

    pub fn id(&self) -> &str {
        self.path.id()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.data.get(field)
    }

    /// Decodes the field map into a typed schema record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(Value::Object(self.data.clone()))
            .map_err(|e| ChatError::document(format!("{}: {}", self.path, e)))
    }
}

/// Kind of change a document underwent since the previous snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: Document,
}

/// One delivery of a live query: the full current result set plus the
/// deltas relative to the previous delivery on the same listener.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    pub documents: Vec<Document>,
    pub changes: Vec<DocumentChange>,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }
}

/// What a listener receives: a snapshot, or a terminal stream error.
pub type SnapshotEvent = Result<Snapshot>;

/// A value to write into a field.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Value(Value),
    /// Replaced by the store's clock when the write is applied.
    ServerTimestamp,
}

/// Field updates for a create or merge-update write.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteData {
    fields: BTreeMap<String, FieldValue>,
}

impl WriteData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields
            .insert(field.into(), FieldValue::Value(value.into()));
        self
    }

    pub fn server_timestamp(mut self, field: impl Into<String>) -> Self {
        self.fields.insert(field.into(), FieldValue::ServerTimestamp);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Materializes the payload, substituting `now` for server timestamps.
    pub fn resolve(&self, now: Timestamp) -> DocumentData {
        self.fields
            .iter()
            .map(|(field, value)| {
                let value = match value {
                    FieldValue::Value(v) => v.clone(),
                    FieldValue::ServerTimestamp => now.into(),
                };
                (field.clone(), value)
            })
            .collect()
    }
}
