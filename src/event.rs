//! Event types shared by the store, the actors, and the executor.
//!
//! Domain events are ordinary Rust enums using adjacently tagged serde
//! (`#[serde(tag = "type", content = "data")]`). [`NewEvent::new`] splits
//! such a value into an `event_type` and a JSON payload, and
//! [`Event::decode`] reassembles it on the way back out. No I/O occurs here.

use std::time::SystemTime;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::sortable_id::SortableUniqueId;
use crate::tag::{EventTag, Tag};

/// Infrastructure metadata stamped on every written event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// What caused the event (the command type name for executor writes).
    pub causation_id: String,
    /// Correlation id shared by every event of one logical operation.
    pub correlation_id: String,
    /// Identity of whoever executed the write.
    pub executed_by: String,
}

/// An immutable event as stored in and returned by the
/// [`EventStore`](crate::EventStore).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event id (UUID v7 for executor writes).
    pub id: Uuid,
    /// Position in the global order.
    pub sortable_unique_id: SortableUniqueId,
    /// Logical type name of the payload (the `"type"` of the domain enum).
    pub event_type: String,
    /// Domain payload (the `"data"` of the domain enum, `null` for unit
    /// variants).
    pub payload: serde_json::Value,
    /// Causation, correlation and executor identity.
    pub metadata: EventMetadata,
    /// Tags the event is indexed under. Duplicates are indexed once.
    pub tags: Vec<Tag>,
}

impl Event {
    /// Build an event with a fresh UUID v7 id and a freshly generated
    /// [`SortableUniqueId`].
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        tags: Vec<Tag>,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            sortable_unique_id: SortableUniqueId::generate_new(),
            event_type: event_type.into(),
            payload,
            metadata,
            tags,
        }
    }

    /// Replace the generated position, e.g. to replay events with their
    /// original ids.
    pub fn with_sortable_unique_id(mut self, id: SortableUniqueId) -> Self {
        self.sortable_unique_id = id;
        self
    }

    /// `true` if the event is indexed under `tag`.
    pub fn has_tag(&self, tag: &Tag) -> bool {
        self.tags.contains(tag)
    }

    /// Decode the event back into an adjacently tagged domain enum.
    ///
    /// Returns `None` if the event type is not a variant of `E` or the
    /// payload does not match, so folds can skip events they don't know.
    pub fn decode<E: DeserializeOwned>(&self) -> Option<E> {
        let tagged = if self.payload.is_null() {
            serde_json::json!({ "type": self.event_type })
        } else {
            serde_json::json!({
                "type": self.event_type,
                "data": self.payload,
            })
        };
        serde_json::from_value(tagged).ok()
    }
}

/// An event produced by a command handler, before the executor assigns it
/// an id, a position, and metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEvent {
    /// Logical type name of the payload.
    pub event_type: String,
    /// Domain payload.
    pub payload: serde_json::Value,
    /// Tags to index and (unless skipped) reserve.
    pub tags: Vec<EventTag>,
}

impl NewEvent {
    /// Encode an adjacently tagged domain event.
    ///
    /// # Arguments
    ///
    /// * `event` - The domain event. Must serialize to an object with a
    ///   string `"type"` and an optional `"data"`.
    /// * `tags` - Tags to attach. Plain [`Tag`]s are reserved against the
    ///   position the handler observed.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the event cannot be serialized or does
    /// not have the adjacently tagged shape.
    pub fn new<E, I, T>(event: &E, tags: I) -> serde_json::Result<Self>
    where
        E: Serialize,
        I: IntoIterator<Item = T>,
        T: Into<EventTag>,
    {
        use serde::ser::Error as _;

        let value = serde_json::to_value(event)?;
        let obj = value.as_object().ok_or_else(|| {
            serde_json::Error::custom("domain event must serialize to a JSON object")
        })?;
        let event_type = obj
            .get("type")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| serde_json::Error::custom("domain event must have a string 'type'"))?
            .to_owned();
        // Absent for unit variants.
        let payload = obj.get("data").cloned().unwrap_or(serde_json::Value::Null);

        Ok(Self {
            event_type,
            payload,
            tags: tags.into_iter().map(Into::into).collect(),
        })
    }

    /// Build from an already split type name and payload.
    pub fn from_parts(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        tags: Vec<EventTag>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
            tags,
        }
    }

    /// Distinct tags in first-seen order.
    pub fn distinct_tags(&self) -> Vec<&Tag> {
        let mut seen: Vec<&Tag> = Vec::with_capacity(self.tags.len());
        for event_tag in &self.tags {
            if !seen.contains(&&event_tag.tag) {
                seen.push(&event_tag.tag);
            }
        }
        seen
    }
}

/// Result of a command handler: an event to write, or nothing.
pub type EventOrNone = Option<NewEvent>;

/// One row of the per-tag index: this event carries this tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagStream {
    /// The indexed tag.
    pub tag: Tag,
    /// The event carrying it.
    pub event_id: Uuid,
    /// The event's position.
    pub sortable_unique_id: SortableUniqueId,
}

/// Per-tag outcome of a successful write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagWriteResult {
    /// The written tag.
    pub tag: Tag,
    /// Number of [`TagStream`] rows for the tag after the write.
    pub version: u64,
    /// When the write completed.
    pub timestamp: SystemTime,
}
