//! Change events delivered by the DCP listener

use crate::model::Ack;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of document change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Mutation,
    Deletion,
    Expiration,
}

/// A single document change from the source bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub key: Vec<u8>,
    #[serde(default)]
    pub value: Option<Vec<u8>>,
    #[serde(default)]
    pub collection_name: String,
    pub event_time: DateTime<Utc>,
    #[serde(default)]
    pub cas: u64,
    #[serde(default)]
    pub vb_id: u16,
}

impl ChangeEvent {
    pub fn mutation(
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        collection_name: impl Into<String>,
    ) -> Self {
        Self::new(EventKind::Mutation, key.into(), Some(value.into()), collection_name.into())
    }

    pub fn deletion(key: impl Into<Vec<u8>>, collection_name: impl Into<String>) -> Self {
        Self::new(EventKind::Deletion, key.into(), None, collection_name.into())
    }

    pub fn expiration(key: impl Into<Vec<u8>>, collection_name: impl Into<String>) -> Self {
        Self::new(EventKind::Expiration, key.into(), None, collection_name.into())
    }

    fn new(kind: EventKind, key: Vec<u8>, value: Option<Vec<u8>>, collection_name: String) -> Self {
        Self {
            kind,
            key,
            value,
            collection_name,
            event_time: Utc::now(),
            cas: 0,
            vb_id: 0,
        }
    }

    pub fn with_event_time(mut self, event_time: DateTime<Utc>) -> Self {
        self.event_time = event_time;
        self
    }

    pub fn is_mutated(&self) -> bool {
        self.kind == EventKind::Mutation
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == EventKind::Deletion
    }

    pub fn is_expired(&self) -> bool {
        self.kind == EventKind::Expiration
    }

    /// Document key as UTF-8, lossy
    pub fn key_str(&self) -> String {
        String::from_utf8_lossy(&self.key).into_owned()
    }

    /// Payload as UTF-8, lossy; empty for deletions and expirations
    pub fn value_str(&self) -> String {
        self.value
            .as_deref()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .unwrap_or_default()
    }
}

/// What the feed client hands to the listener
#[derive(Debug, Clone, PartialEq)]
pub enum ListenerEvent {
    Change(ChangeEvent),
    /// Anything the sink does not handle (snapshot markers, seqno advances, ...)
    Other(String),
}

/// A listener event together with its acknowledgment capability
#[derive(Debug, Clone)]
pub struct ListenerContext {
    pub event: ListenerEvent,
    pub ack: Ack,
}

impl ListenerContext {
    pub fn new(event: ListenerEvent, ack: Ack) -> Self {
        Self { event, ack }
    }

    pub fn change(event: ChangeEvent, ack: Ack) -> Self {
        Self::new(ListenerEvent::Change(event), ack)
    }
}
