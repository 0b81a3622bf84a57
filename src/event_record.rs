//! # Event Records
//!
//! An [`EventRecord`] is one local or distributed event queued on a unit of work
//! for publication after the work is saved.
//!
//! Records are ordered by [`EventRecord::event_order`], a process-wide counter
//! assigned when the record is created. Wall-clock timestamps are never used for
//! ordering: two events raised in the same tick would tie.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static EVENT_ORDER: AtomicU64 = AtomicU64::new(1);

/// Returns the next value of the process-wide event order counter.
pub fn next_event_order() -> u64 {
    EVENT_ORDER.fetch_add(1, Ordering::Relaxed)
}

/// An immutable event queued on a unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    event_type: String,
    event_data: Value,
    event_order: u64,
    use_outbox: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    properties: HashMap<String, Value>,
}

impl EventRecord {
    /// Creates a record and assigns it the next event order.
    pub fn new(event_type: impl Into<String>, event_data: Value) -> Self {
        Self {
            event_type: event_type.into(),
            event_data,
            event_order: next_event_order(),
            use_outbox: false,
            properties: HashMap::new(),
        }
    }

    /// Serializes `payload` into the record's event data.
    pub fn from_payload<T: Serialize>(
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event_type, serde_json::to_value(payload)?))
    }

    pub fn with_outbox(mut self, use_outbox: bool) -> Self {
        self.use_outbox = use_outbox;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn event_data(&self) -> &Value {
        &self.event_data
    }

    pub fn event_order(&self) -> u64 {
        self.event_order
    }

    pub fn use_outbox(&self) -> bool {
        self.use_outbox
    }

    pub fn properties(&self) -> &HashMap<String, Value> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&Value> {
        self.properties.get(key)
    }

    /// Deserialize the event data into the specified type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.event_data.clone())
    }
}

/// Empties `buffer` and returns its records sorted by event order.
pub(crate) fn drain_ordered(buffer: &mut Vec<EventRecord>) -> Vec<EventRecord> {
    let mut records = std::mem::take(buffer);
    records.sort_by_key(EventRecord::event_order);
    records
}

/// Replaces the first record matching `selector` in place, or appends `record`.
pub(crate) fn add_or_replace(
    buffer: &mut Vec<EventRecord>,
    record: EventRecord,
    selector: Option<&dyn Fn(&EventRecord) -> bool>,
) {
    match selector.and_then(|matches| buffer.iter().position(|r| matches(r))) {
        Some(index) => buffer[index] = record,
        None => buffer.push(record),
    }
}
