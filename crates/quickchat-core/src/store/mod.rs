//! Document store domain module.
//!
//! # Module Structure
//!
//! - `path`: Collection and document addressing
//! - `document`: Raw documents, snapshots and write payloads
//! - `query`: Queries and listen targets
//! - `layout`: Where conversations, messages and profiles live
//! - `repository`: The `DocumentStore` trait

mod document;
mod layout;
mod path;
mod query;
mod repository;

pub use document::{
    ChangeKind, Document, DocumentChange, DocumentData, FieldValue, Snapshot, SnapshotEvent,
    WriteData,
};
pub use layout::StoreLayout;
pub use path::{CollectionPath, DocumentPath};
pub use query::{Direction, Filter, Limit, ListenTarget, OrderBy, Query};
pub use repository::{DocumentStore, Precondition, SnapshotReceiver, WriteBatch, WriteOp};
