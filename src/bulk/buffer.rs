//! Staging buffer with in-place deduplication
//!
//! At most one item per dedup key is staged. A later action for the same
//! row overwrites the earlier slot, keeping the slot position but taking the
//! newer payload and acknowledgment.

use crate::model::{Ack, Document, WriteAction};
use serde_json::Value;
use std::collections::HashMap;

/// One staged write and the acknowledgment of the event that produced it
#[derive(Debug, Clone)]
pub struct StagedItem {
    pub action: WriteAction,
    pub ack: Ack,
}

#[derive(Debug, Default)]
pub struct StagingBuffer {
    items: Vec<StagedItem>,
    keys: HashMap<String, usize>,
    byte_size: usize,
}

impl StagingBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            keys: HashMap::with_capacity(capacity),
            byte_size: 0,
        }
    }

    /// Grow to at least twice the current capacity, or the exact need if larger.
    pub fn reserve_for(&mut self, additional: usize) {
        let needed = self.items.len() + additional;
        if needed <= self.items.capacity() {
            return;
        }
        let target = (self.items.capacity() * 2).max(needed);
        self.items.reserve_exact(target - self.items.len());
    }

    /// Stage `action`, returning `true` if it took a new slot.
    ///
    /// Byte accounting only counts the first insertion of a key; overwrites
    /// leave `byte_size` unchanged.
    pub fn stage(&mut self, action: WriteAction, ack: Ack, primary_key: &[String]) -> bool {
        let key = dedup_key(&action, primary_key)
            .unwrap_or_else(|| format!("batch:{}", self.items.len()));

        if let Some(&slot) = self.keys.get(&key) {
            self.items[slot] = StagedItem { action, ack };
            return false;
        }

        self.byte_size += action.approximate_size();
        self.keys.insert(key, self.items.len());
        self.items.push(StagedItem { action, ack });
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    pub fn items(&self) -> &[StagedItem] {
        &self.items
    }

    /// Copy of every staged item, in slot order
    pub fn snapshot(&self) -> Vec<StagedItem> {
        self.items.clone()
    }

    /// Drop all staged items and zero the counters, keeping the allocation.
    pub fn reset(&mut self) {
        self.items.clear();
        self.keys.clear();
        self.byte_size = 0;
    }
}

/// `table:field=value;...` over the primary key columns found in the
/// document, else in the filter. `None` when neither carries any of them.
///
/// Values are rendered unquoted, so the string `"7"` and the number `7`
/// address the same row.
pub fn dedup_key(action: &WriteAction, primary_key: &[String]) -> Option<String> {
    key_from(&action.table, &action.document, primary_key)
        .or_else(|| key_from(&action.table, &action.filter, primary_key))
}

fn key_from(table: &str, source: &Document, primary_key: &[String]) -> Option<String> {
    let mut key = format!("{}:", table);
    let mut found = false;
    for field in primary_key {
        if let Some(value) = source.get(field) {
            found = true;
            key.push_str(field);
            key.push('=');
            match value {
                Value::String(s) => key.push_str(s),
                other => key.push_str(&other.to_string()),
            }
            key.push(';');
        }
    }
    found.then_some(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document;

    fn pk() -> Vec<String> {
        vec!["id".to_string()]
    }

    #[test]
    fn test_dedup_key_formats() {
        let action = WriteAction::upsert("t", document! { "id" => "a", "n" => 1 });
        assert_eq!(dedup_key(&action, &pk()).as_deref(), Some("t:id=a;"));

        let action = WriteAction::delete("t", document! { "id" => 7 });
        assert_eq!(dedup_key(&action, &pk()).as_deref(), Some("t:id=7;"));

        let composite = vec!["tenant".to_string(), "id".to_string()];
        let action = WriteAction::upsert("t", document! { "id" => "a", "tenant" => "x" });
        assert_eq!(
            dedup_key(&action, &composite).as_deref(),
            Some("t:tenant=x;id=a;")
        );

        let action = WriteAction::upsert("t", document! { "name" => "a" });
        assert_eq!(dedup_key(&action, &pk()), None);
    }

    #[test]
    fn test_string_and_number_ids_share_a_key() {
        let text = WriteAction::upsert("t", document! { "id" => "7" });
        let number = WriteAction::upsert("t", document! { "id" => 7 });
        assert_eq!(dedup_key(&text, &pk()), dedup_key(&number, &pk()));

        let mut buffer = StagingBuffer::default();
        buffer.stage(text, Ack::noop(), &pk());
        assert!(!buffer.stage(number, Ack::noop(), &pk()));
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.items()[0].action.document["id"], 7);
    }

    #[test]
    fn test_overwrite_keeps_slot_and_takes_latest() {
        let mut buffer = StagingBuffer::with_capacity(4);
        assert!(buffer.stage(WriteAction::upsert("t", document! { "id" => "a", "v" => "1" }), Ack::noop(), &pk()));
        assert!(buffer.stage(WriteAction::upsert("t", document! { "id" => "b" }), Ack::noop(), &pk()));
        assert!(!buffer.stage(WriteAction::upsert("t", document! { "id" => "a", "v" => "2" }), Ack::noop(), &pk()));

        assert_eq!(buffer.len(), 2);
        assert_eq!(buffer.items()[0].action.document["v"], "2");
        assert_eq!(buffer.items()[1].action.document["id"], "b");
    }

    #[test]
    fn test_same_id_in_other_table_is_distinct() {
        let mut buffer = StagingBuffer::default();
        buffer.stage(WriteAction::upsert("t1", document! { "id" => "a" }), Ack::noop(), &pk());
        buffer.stage(WriteAction::upsert("t2", document! { "id" => "a" }), Ack::noop(), &pk());
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_keyless_actions_never_dedup() {
        let mut buffer = StagingBuffer::default();
        for _ in 0..3 {
            buffer.stage(WriteAction::upsert("t", document! { "name" => "x" }), Ack::noop(), &pk());
        }
        assert_eq!(buffer.len(), 3);
    }

    #[test]
    fn test_byte_size_counts_first_insert_only() {
        let mut buffer = StagingBuffer::default();
        buffer.stage(WriteAction::upsert("t", document! { "id" => "a" }), Ack::noop(), &pk());
        assert_eq!(buffer.byte_size(), 3);

        buffer.stage(
            WriteAction::upsert("t", document! { "id" => "a", "payload" => "a much larger value" }),
            Ack::noop(),
            &pk(),
        );
        assert_eq!(buffer.byte_size(), 3);
    }

    #[test]
    fn test_reserve_grows_geometrically() {
        let mut buffer = StagingBuffer::with_capacity(4);
        for i in 0..4 {
            buffer.stage(WriteAction::upsert("t", document! { "id" => i }), Ack::noop(), &pk());
        }
        buffer.reserve_for(1);
        assert!(buffer.capacity() >= 8);

        buffer.reserve_for(100);
        assert!(buffer.capacity() >= 104);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut buffer = StagingBuffer::default();
        buffer.stage(WriteAction::upsert("t", document! { "id" => "a" }), Ack::noop(), &pk());
        buffer.reset();

        assert!(buffer.is_empty());
        assert_eq!(buffer.byte_size(), 0);
        assert!(buffer.stage(WriteAction::upsert("t", document! { "id" => "a" }), Ack::noop(), &pk()));
    }
}
