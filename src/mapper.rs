//! Change event to write action mappers
//!
//! A mapper turns one [`ChangeEvent`] into zero or more [`WriteAction`]s.
//! An empty result means the event is filtered out and is acknowledged
//! without ever reaching the bulk.

use crate::config::CollectionTableMapping;
use crate::error::{Error, Result};
use crate::event::ChangeEvent;
use crate::model::{Document, WriteAction};
use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Source field that maps the whole raw payload into a column
pub const DOCUMENT_DATA_FIELD: &str = "documentData";

/// Mapper trait
pub trait Mapper: Send + Sync {
    fn map(&self, event: &ChangeEvent) -> Result<Vec<WriteAction>>;
}

impl<F> Mapper for F
where
    F: Fn(&ChangeEvent) -> Vec<WriteAction> + Send + Sync,
{
    fn map(&self, event: &ChangeEvent) -> Result<Vec<WriteAction>> {
        Ok(self(event))
    }
}

/// Upserts `{id: key, data: payload}` into one fixed table.
#[derive(Debug, Clone)]
pub struct SimpleMapper {
    table: String,
}

impl SimpleMapper {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }
}

impl Default for SimpleMapper {
    fn default() -> Self {
        Self::new("example_table")
    }
}

impl Mapper for SimpleMapper {
    fn map(&self, event: &ChangeEvent) -> Result<Vec<WriteAction>> {
        let key = event.key_str();
        let mut document = Document::new();
        document.insert("id".to_string(), Value::String(key.clone()));
        document.insert("data".to_string(), Value::String(event.value_str()));
        Ok(vec![WriteAction::upsert(&self.table, document).with_id(key)])
    }
}

/// Maps collections onto tables through configured field mappings.
pub struct CollectionMapper {
    mappings: Vec<CollectionTableMapping>,
    cache: RwLock<HashMap<String, Arc<CollectionTableMapping>>>,
}

impl CollectionMapper {
    pub fn new(mappings: Vec<CollectionTableMapping>) -> Self {
        Self {
            mappings,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Mapping for `collection`, falling back to the default collection mapping.
    pub fn find_mapping(&self, collection: &str) -> Result<Arc<CollectionTableMapping>> {
        if let Some(mapping) = self.cache.read().get(collection) {
            return Ok(mapping.clone());
        }

        let found = self
            .mappings
            .iter()
            .find(|m| m.collection == collection)
            .or_else(|| {
                self.mappings
                    .iter()
                    .find(|m| m.collection.is_empty() || m.collection == "_default")
            })
            .ok_or_else(|| {
                Error::Mapping(format!("no mapping found for collection: {}", collection))
            })?;

        let mapping = Arc::new(found.clone());
        self.cache
            .write()
            .insert(collection.to_string(), mapping.clone());
        Ok(mapping)
    }

    fn build_upsert(&self, mapping: &CollectionTableMapping, event: &ChangeEvent) -> WriteAction {
        let key = event.key_str();
        let source = decode_object(event).unwrap_or_else(|| {
            warn!(key = %key, "JSON decode failed, mapping as empty document");
            Map::new()
        });

        let mut document = Document::new();
        for (column, field) in &mapping.field_mappings {
            if field == "id" {
                continue;
            }
            let value = if field == DOCUMENT_DATA_FIELD {
                Value::String(event.value_str())
            } else {
                nested_field(&source, field)
                    .map(|v| convert_field_value(field, v))
                    .unwrap_or(Value::Null)
            };
            document.insert(column.clone(), value);
        }
        document.insert("id".to_string(), Value::String(key.clone()));

        debug!(key = %key, table = %mapping.table_name, columns = document.len(), "mapped upsert");
        WriteAction::upsert(&mapping.table_name, document).with_id(key)
    }

    fn build_delete(&self, mapping: &CollectionTableMapping, event: &ChangeEvent) -> WriteAction {
        let key = event.key_str();
        let source = decode_object(event).unwrap_or_default();

        let mut filter = Document::new();
        for (column, field) in &mapping.field_mappings {
            if field == "id" {
                continue;
            }
            if let Some(value) = nested_field(&source, field) {
                filter.insert(column.clone(), convert_field_value(field, value));
            }
        }
        filter.insert("id".to_string(), Value::String(key.clone()));

        WriteAction::delete(&mapping.table_name, filter).with_id(key)
    }
}

impl Mapper for CollectionMapper {
    fn map(&self, event: &ChangeEvent) -> Result<Vec<WriteAction>> {
        let mapping = self.find_mapping(&event.collection_name)?;
        let action = if event.is_mutated() {
            self.build_upsert(&mapping, event)
        } else {
            self.build_delete(&mapping, event)
        };
        Ok(vec![action])
    }
}

fn decode_object(event: &ChangeEvent) -> Option<Map<String, Value>> {
    match serde_json::from_slice::<Value>(event.value.as_deref()?) {
        Ok(Value::Object(fields)) => Some(fields),
        _ => None,
    }
}

/// Resolve a field, walking nested objects when the path contains `.`.
///
/// A dotted path never falls back to a literal key of the same name.
pub fn nested_field<'a>(document: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    if !path.contains('.') {
        return document.get(path);
    }
    let mut parts = path.split('.');
    let mut current = document.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

/// The `date` field is always stored as a float.
fn convert_field_value(field: &str, value: &Value) -> Value {
    if field != "date" {
        return value.clone();
    }
    let number = match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse::<f64>().unwrap_or(0.0),
        _ => return value.clone(),
    };
    serde_json::Number::from_f64(number)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Operation;
    use serde_json::json;

    fn mapping(collection: &str, table: &str, fields: &[(&str, &str)]) -> CollectionTableMapping {
        CollectionTableMapping {
            collection: collection.to_string(),
            table_name: table.to_string(),
            field_mappings: fields
                .iter()
                .map(|(c, f)| (c.to_string(), f.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_simple_mapper() {
        let actions = SimpleMapper::default()
            .map(&ChangeEvent::mutation("k1", "payload", "c"))
            .unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].table, "example_table");
        assert_eq!(actions[0].operation, Operation::Upsert);
        assert_eq!(actions[0].document["data"], json!("payload"));
        assert_eq!(actions[0].document["id"], json!("k1"));
    }

    #[test]
    fn test_collection_mapper_upsert() {
        let mapper = CollectionMapper::new(vec![mapping(
            "orders",
            "orders_tbl",
            &[
                ("total", "amount.value"),
                ("when", "date"),
                ("raw", DOCUMENT_DATA_FIELD),
                ("missing", "nope"),
                ("pk", "id"),
            ],
        )]);
        let payload = r#"{"amount":{"value":12},"date":"1700000000.5"}"#;
        let actions = mapper
            .map(&ChangeEvent::mutation("o-1", payload, "orders"))
            .unwrap();

        let action = &actions[0];
        assert_eq!(action.table, "orders_tbl");
        assert_eq!(action.document["total"], json!(12));
        assert_eq!(action.document["when"], json!(1700000000.5));
        assert_eq!(action.document["raw"], json!(payload));
        assert_eq!(action.document["missing"], Value::Null);
        assert_eq!(action.document["id"], json!("o-1"));
        assert!(!action.document.contains_key("pk"));
    }

    #[test]
    fn test_collection_mapper_delete_and_default_fallback() {
        let mapper = CollectionMapper::new(vec![
            mapping("orders", "orders_tbl", &[]),
            mapping("_default", "fallback_tbl", &[("region", "region")]),
        ]);
        let actions = mapper
            .map(&ChangeEvent::deletion("u-9", "users"))
            .unwrap();

        let action = &actions[0];
        assert_eq!(action.table, "fallback_tbl");
        assert_eq!(action.operation, Operation::Delete);
        assert_eq!(action.filter.len(), 1);
        assert_eq!(action.filter["id"], json!("u-9"));
        assert!(mapper.cache.read().contains_key("users"));
    }

    #[test]
    fn test_collection_mapper_unmapped_collection() {
        let mapper = CollectionMapper::new(vec![mapping("orders", "orders_tbl", &[])]);
        let err = mapper
            .map(&ChangeEvent::mutation("k", "{}", "users"))
            .unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
    }

    #[test]
    fn test_malformed_payload_maps_nulls() {
        let mapper = CollectionMapper::new(vec![mapping("c", "t", &[("name", "name")])]);
        let actions = mapper.map(&ChangeEvent::mutation("k", "not json", "c")).unwrap();
        assert_eq!(actions[0].document["name"], Value::Null);
        assert_eq!(actions[0].document["id"], json!("k"));
    }

    #[test]
    fn test_dotted_path_walks_nested_objects_only() {
        let source = json!({
            "meta.id": "literal",
            "meta": { "id": "nested" },
            "flat": 1
        });
        let source = source.as_object().unwrap();

        assert_eq!(nested_field(source, "meta.id"), Some(&json!("nested")));
        assert_eq!(nested_field(source, "flat"), Some(&json!(1)));
        assert_eq!(nested_field(source, "flat.x"), None);

        let only_literal = json!({ "a.b": 5 });
        assert_eq!(nested_field(only_literal.as_object().unwrap(), "a.b"), None);
    }

    #[test]
    fn test_closure_mapper() {
        let mapper = |_: &ChangeEvent| Vec::<WriteAction>::new();
        assert!(Mapper::map(&mapper, &ChangeEvent::deletion("k", "c"))
            .unwrap()
            .is_empty());
    }
}
