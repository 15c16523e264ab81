//! CQL statement generation and caching
//!
//! Statements use positional placeholders. Document columns come first in
//! lexicographic order, then filter columns in lexicographic order; the same
//! rule drives [`bind_values`] so placeholders and values always line up.
//!
//! The cache key carries the sorted column names, not just their counts, so
//! two documents with the same number of different columns never share a
//! statement.

use crate::model::{Operation, WriteAction};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Cache key for the statement shape of `action`
pub fn shape_key(action: &WriteAction) -> String {
    let document = columns(&action.document);
    let filter = columns(&action.filter);
    let verb = action.operation.verb();
    match action.operation {
        Operation::Insert | Operation::Upsert => format!("{}:{}:{}", verb, action.table, document),
        Operation::Update => format!("{}:{}:{}:{}", verb, action.table, document, filter),
        Operation::Delete => format!("{}:{}:{}", verb, action.table, filter),
    }
}

fn columns(source: &crate::model::Document) -> String {
    source.keys().map(String::as_str).collect::<Vec<_>>().join(",")
}

/// Generate statement text for `action` against `keyspace`.
pub fn build_statement(keyspace: &str, action: &WriteAction) -> String {
    let table = &action.table;
    match action.operation {
        Operation::Insert | Operation::Upsert => {
            let placeholders = vec!["?"; action.document.len()].join(",");
            format!(
                "INSERT INTO {}.{} ({}) VALUES ({})",
                keyspace,
                table,
                columns(&action.document),
                placeholders
            )
        }
        Operation::Update => format!(
            "UPDATE {}.{} SET {} WHERE {}",
            keyspace,
            table,
            assignments(&action.document, ","),
            assignments(&action.filter, " AND ")
        ),
        Operation::Delete => format!(
            "DELETE FROM {}.{} WHERE {}",
            keyspace,
            table,
            assignments(&action.filter, " AND ")
        ),
    }
}

fn assignments(source: &crate::model::Document, separator: &str) -> String {
    source
        .keys()
        .map(|column| format!("{} = ?", column))
        .collect::<Vec<_>>()
        .join(separator)
}

/// Positional values for the statement built from `action`
pub fn bind_values(action: &WriteAction) -> Vec<Value> {
    match action.operation {
        Operation::Insert | Operation::Upsert => action.document.values().cloned().collect(),
        Operation::Update => action
            .document
            .values()
            .chain(action.filter.values())
            .cloned()
            .collect(),
        Operation::Delete => action.filter.values().cloned().collect(),
    }
}

/// Read-mostly memo of generated statements, owned per bulk instance.
#[derive(Debug)]
pub struct StatementCache {
    keyspace: String,
    statements: RwLock<HashMap<String, Arc<str>>>,
}

impl StatementCache {
    pub fn new(keyspace: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            statements: RwLock::new(HashMap::new()),
        }
    }

    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    /// Cached statement for the shape of `action`, built on first use.
    pub fn get_or_build(&self, action: &WriteAction) -> Arc<str> {
        let key = shape_key(action);

        if let Some(query) = self.statements.read().get(&key) {
            return query.clone();
        }

        let mut statements = self.statements.write();
        // Another caller may have built it between the two locks
        if let Some(query) = statements.get(&key) {
            return query.clone();
        }

        let query: Arc<str> = Arc::from(build_statement(&self.keyspace, action));
        statements.insert(key, query.clone());
        query
    }

    pub fn len(&self) -> usize {
        self.statements.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document;
    use serde_json::json;

    #[test]
    fn test_insert_statement() {
        let action = WriteAction::insert("t", document! { "name" => "x", "id" => "a" });
        assert_eq!(
            build_statement("ks", &action),
            "INSERT INTO ks.t (id,name) VALUES (?,?)"
        );
        assert_eq!(bind_values(&action), vec![json!("a"), json!("x")]);
    }

    #[test]
    fn test_update_statement() {
        let action = WriteAction::update(
            "t",
            document! { "b" => 2, "a" => 1 },
            document! { "zone" => "eu", "id" => "k" },
        );
        assert_eq!(
            build_statement("ks", &action),
            "UPDATE ks.t SET a = ?,b = ? WHERE id = ? AND zone = ?"
        );
        assert_eq!(
            bind_values(&action),
            vec![json!(1), json!(2), json!("k"), json!("eu")]
        );
    }

    #[test]
    fn test_delete_statement() {
        let action = WriteAction::delete("t", document! { "id" => "a" });
        assert_eq!(build_statement("ks", &action), "DELETE FROM ks.t WHERE id = ?");
        assert_eq!(bind_values(&action), vec![json!("a")]);
    }

    #[test]
    fn test_cache_hit_returns_identical_text() {
        let cache = StatementCache::new("ks");
        let first = cache.get_or_build(&WriteAction::upsert("t", document! { "id" => "a" }));
        let second = cache.get_or_build(&WriteAction::upsert("t", document! { "id" => "b" }));

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_same_count_different_columns_do_not_collide() {
        let cache = StatementCache::new("ks");
        let first = cache.get_or_build(&WriteAction::upsert("t", document! { "id" => "a", "name" => "x" }));
        let second = cache.get_or_build(&WriteAction::upsert("t", document! { "id" => "a", "email" => "y" }));

        assert_eq!(&*first, "INSERT INTO ks.t (id,name) VALUES (?,?)");
        assert_eq!(&*second, "INSERT INTO ks.t (email,id) VALUES (?,?)");
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_insert_and_upsert_share_shape() {
        let insert = WriteAction::insert("t", document! { "id" => "a" });
        let upsert = WriteAction::upsert("t", document! { "id" => "a" });
        assert_eq!(shape_key(&insert), shape_key(&upsert));
        assert_eq!(shape_key(&insert), "INSERT:t:id");
    }

    #[test]
    fn test_shape_key_carries_verb_and_columns() {
        let update = WriteAction::update("t", document! { "b" => 1, "a" => 2 }, document! { "id" => "k" });
        assert_eq!(shape_key(&update), "UPDATE:t:a,b:id");

        let delete = WriteAction::delete("t", document! { "zone" => "eu", "id" => "k" });
        assert_eq!(shape_key(&delete), "DELETE:t:id,zone");
    }
}
