//! Write actions produced by mappers and consumed by the bulk

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Column name to value. Ordered so column iteration is always sorted.
pub type Document = BTreeMap<String, Value>;

/// Write operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Upsert,
    Update,
    Delete,
}

impl Operation {
    /// Statement verb; Insert and Upsert share the same idempotent INSERT.
    pub fn verb(&self) -> &'static str {
        match self {
            Operation::Insert | Operation::Upsert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Insert => "insert",
            Operation::Upsert => "upsert",
            Operation::Update => "update",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A single row-level write against one table.
///
/// `document` carries the values for Insert/Upsert/Update, `filter` the
/// WHERE predicate for Update/Delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteAction {
    pub table: String,
    pub operation: Operation,
    #[serde(default)]
    pub document: Document,
    #[serde(default)]
    pub filter: Document,
    /// Identifier used in log lines; falls back to the `id` column.
    #[serde(default)]
    pub id: Option<String>,
}

impl WriteAction {
    pub fn new(table: impl Into<String>, operation: Operation) -> Self {
        Self {
            table: table.into(),
            operation,
            document: Document::new(),
            filter: Document::new(),
            id: None,
        }
    }

    pub fn insert(table: impl Into<String>, document: Document) -> Self {
        Self::new(table, Operation::Insert).with_document(document)
    }

    pub fn upsert(table: impl Into<String>, document: Document) -> Self {
        Self::new(table, Operation::Upsert).with_document(document)
    }

    pub fn update(table: impl Into<String>, document: Document, filter: Document) -> Self {
        Self::new(table, Operation::Update)
            .with_document(document)
            .with_filter(filter)
    }

    pub fn delete(table: impl Into<String>, filter: Document) -> Self {
        Self::new(table, Operation::Delete).with_filter(filter)
    }

    pub fn with_document(mut self, document: Document) -> Self {
        self.document = document;
        self
    }

    pub fn with_filter(mut self, filter: Document) -> Self {
        self.filter = filter;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Declared row identifier, if the action carries one.
    pub fn declared_id(&self) -> Option<String> {
        if let Some(id) = &self.id {
            return Some(id.clone());
        }
        let source = if self.document.is_empty() {
            &self.filter
        } else {
            &self.document
        };
        source.get("id").and_then(Value::as_str).map(str::to_string)
    }

    /// Approximate payload footprint: key lengths plus string value lengths,
    /// 8 bytes for any non-string value.
    pub fn approximate_size(&self) -> usize {
        self.document
            .iter()
            .map(|(column, value)| {
                column.len()
                    + match value {
                        Value::String(s) => s.len(),
                        _ => 8,
                    }
            })
            .sum()
    }
}

/// Per-event acknowledgment capability handed over by the change feed.
///
/// Cloning shares the same underlying callback; one event mapped to several
/// actions hands the same `Ack` to each of them.
#[derive(Clone, Default)]
pub struct Ack {
    callback: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl Ack {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            callback: Some(Arc::new(callback)),
        }
    }

    /// An acknowledgment that does nothing.
    pub fn noop() -> Self {
        Self::default()
    }

    pub fn ack(&self) {
        if let Some(callback) = &self.callback {
            callback();
        }
    }
}

impl fmt::Debug for Ack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ack")
            .field("noop", &self.callback.is_none())
            .finish()
    }
}

/// Build a [`Document`] from `column => value` pairs.
#[macro_export]
macro_rules! document {
    () => { $crate::model::Document::new() };
    ($($column:expr => $value:expr),+ $(,)?) => {{
        let mut doc = $crate::model::Document::new();
        $( doc.insert(($column).to_string(), ::serde_json::json!($value)); )+
        doc
    }};
}
