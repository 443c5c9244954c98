//! The remote store gateway abstraction.

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use tokio::sync::mpsc;

/// Address of a single document: `collection/id`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentKey {
    pub collection: String,
    pub id: String,
}

impl DocumentKey {
    pub fn new(collection: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.collection, self.id)
    }
}

/// A document as returned by a query: its id plus its body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub id: String,
    pub data: Value,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// A collection query: optional equality filter, ordering and limit.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub collection: String,
    /// Keep only documents whose top-level `field` equals the value.
    pub filter: Option<(String, Value)>,
    /// Order by a top-level field.
    pub order_by: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn collection(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Default::default()
        }
    }

    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filter = Some((field.into(), value.into()));
        self
    }

    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some((field.into(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check whether a document passes the filter.
    pub fn matches(&self, data: &Value) -> bool {
        match &self.filter {
            Some((field, expected)) => data.get(field) == Some(expected),
            None => true,
        }
    }

    /// Filter, sort and truncate a document set in place.
    pub fn apply(&self, mut documents: Vec<StoredDocument>) -> Vec<StoredDocument> {
        documents.retain(|doc| self.matches(&doc.data));

        if let Some((field, order)) = &self.order_by {
            documents.sort_by(|a, b| {
                let ord = compare_values(a.data.get(field), b.data.get(field));
                match order {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                }
            });
        }

        if let Some(limit) = self.limit {
            documents.truncate(limit);
        }
        documents
    }
}

/// Order JSON scalars: missing < null < bool < number < string.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(_) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Abstract remote document store.
///
/// Implementations must be safe to share across tasks. None of the
/// operations are transactional; two clients writing the same document
/// race and the last write wins.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Read a single document. `Ok(None)` when it does not exist.
    async fn read(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Write a document.
    ///
    /// With `merge = false` the document is replaced wholesale. With
    /// `merge = true` top-level fields are merged into the existing
    /// document and fields set to `null` are deleted.
    async fn write(&self, collection: &str, id: &str, document: Value, merge: bool)
        -> Result<()>;

    /// Append a document under a freshly allocated id and return the id.
    async fn append(&self, collection: &str, document: Value) -> Result<String>;

    /// Run a one-shot query over a collection.
    async fn query(&self, query: &Query) -> Result<Vec<StoredDocument>>;

    /// Subscribe to a query. The receiver gets the full matching document
    /// set every time the collection changes.
    fn watch(&self, query: Query) -> mpsc::UnboundedReceiver<Vec<StoredDocument>>;
}
