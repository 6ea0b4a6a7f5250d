//! Filtered, ordered queries and listen targets.

use super::document::DocumentData;
use super::path::{CollectionPath, DocumentPath};
use serde_json::Value;

/// A single predicate over a document's fields.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Equals { field: String, value: Value },
    ArrayContains { field: String, value: Value },
}

impl Filter {
    pub fn matches(&self, data: &DocumentData) -> bool {
        match self {
            Filter::Equals { field, value } => data.get(field) == Some(value),
            Filter::ArrayContains { field, value } => data
                .get(field)
                .and_then(Value::as_array)
                .is_some_and(|items| items.contains(value)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Result-size cap applied after ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    /// Keep the first `n` results in query order.
    First(usize),
    /// Keep the last `n` results, still returned in query order.
    Last(usize),
}

/// Query over one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: CollectionPath,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
    pub limit: Option<Limit>,
}

impl Query {
    pub fn collection(collection: CollectionPath) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Equals {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn where_array_contains(
        mut self,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.filters.push(Filter::ArrayContains {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: Direction) -> Self {
        self.order_by = Some(OrderBy {
            field: field.into(),
            direction,
        });
        self
    }

    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(Limit::First(n));
        self
    }

    pub fn limit_to_last(mut self, n: usize) -> Self {
        self.limit = Some(Limit::Last(n));
        self
    }

    pub fn matches(&self, data: &DocumentData) -> bool {
        self.filters.iter().all(|filter| filter.matches(data))
    }
}

/// What a live subscription observes.
#[derive(Debug, Clone, PartialEq)]
pub enum ListenTarget {
    Query(Query),
    Document(DocumentPath),
}
