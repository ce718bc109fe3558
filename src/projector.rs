//! Tag projectors and the materialized [`TagState`] they produce.
//!
//! A projector is a pure fold `(prior payload, event) -> new payload`,
//! looked up by name in a [`ProjectorRegistry`]. Typed projectors implement
//! [`TagProjector`]; the registry erases them to JSON so the tag state
//! actor can work with any of them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::ProjectorError;
use crate::event::Event;
use crate::sortable_id::SortableUniqueId;
use crate::tag::TagStateId;

/// A typed fold from tagged events to a per-tag state.
///
/// Implementations should ignore event types they do not know, returning
/// the state unchanged, so new event types can be added without breaking
/// existing projectors.
///
/// # Examples
///
/// ```
/// use eventfold_dcb::{Event, TagProjector};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Debug, Clone, Default, Serialize, Deserialize)]
/// struct Seen { count: u64 }
///
/// struct SeenProjector;
///
/// impl TagProjector for SeenProjector {
///     const NAME: &'static str = "SeenProjector";
///     type State = Seen;
///
///     fn project(state: Seen, _event: &Event) -> Seen {
///         Seen { count: state.count + 1 }
///     }
/// }
/// ```
pub trait TagProjector: Send + Sync + 'static {
    /// Registry name. Forms the last segment of a [`TagStateId`].
    const NAME: &'static str;

    /// Version of the fold logic. Changing it invalidates cached states.
    const VERSION: &'static str = "1";

    /// The projected state. `Default` is the state before any event.
    type State: Default + Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Apply one event.
    fn project(state: Self::State, event: &Event) -> Self::State;

    /// `true` if the state represents a deleted entity. Multi-projections
    /// drop such items.
    fn is_deleted(_state: &Self::State) -> bool {
        false
    }
}

/// Projected payload of a [`TagState`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum TagStatePayload {
    /// No event has been folded.
    #[default]
    Empty,
    /// The projector's output.
    Projected(serde_json::Value),
}

impl TagStatePayload {
    /// Decode the payload, treating `Empty` as `T::default()`.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the projected value is not a `T`.
    pub fn decode<T: DeserializeOwned + Default>(&self) -> serde_json::Result<T> {
        match self {
            TagStatePayload::Empty => Ok(T::default()),
            TagStatePayload::Projected(value) => T::deserialize(value),
        }
    }
}

/// The materialized state of one `(tag, projector)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagState {
    /// Projected payload.
    pub payload: TagStatePayload,
    /// Number of events folded.
    pub version: u64,
    /// Position of the last folded event, `None` before the first.
    pub last_sorted_unique_id: Option<SortableUniqueId>,
    /// Group of the tag.
    pub tag_group: String,
    /// Content of the tag.
    pub tag_content: String,
    /// Projector that produced the payload.
    pub projector_name: String,
    /// Version of that projector. Empty when no projector was found.
    pub projector_version: String,
}

impl TagState {
    /// An empty state for `id` with no projector version.
    pub fn empty(id: &TagStateId) -> Self {
        Self {
            payload: TagStatePayload::Empty,
            version: 0,
            last_sorted_unique_id: None,
            tag_group: id.tag.group().to_owned(),
            tag_content: id.tag.content().to_owned(),
            projector_name: id.projector.clone(),
            projector_version: String::new(),
        }
    }

    /// An empty state stamped with a projector version.
    pub(crate) fn empty_with_version(id: &TagStateId, projector_version: &str) -> Self {
        Self {
            projector_version: projector_version.to_owned(),
            ..Self::empty(id)
        }
    }

    /// `true` if no event has been folded.
    pub fn is_empty(&self) -> bool {
        matches!(self.payload, TagStatePayload::Empty)
    }

    /// Decode the payload into a projector state type.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload is not a `T`.
    pub fn payload_as<T: DeserializeOwned + Default>(&self) -> serde_json::Result<T> {
        self.payload.decode()
    }

    /// `Group:Content:Projector` identity of this state.
    pub fn identity(&self) -> String {
        format!(
            "{}:{}:{}",
            self.tag_group, self.tag_content, self.projector_name
        )
    }

    /// `true` if this state belongs to `id`.
    pub fn matches(&self, id: &TagStateId) -> bool {
        self.tag_group == id.tag.group()
            && self.tag_content == id.tag.content()
            && self.projector_name == id.projector
    }
}

type FoldFn =
    dyn Fn(TagStatePayload, &Event) -> serde_json::Result<TagStatePayload> + Send + Sync;

/// A projector as stored in the [`ProjectorRegistry`].
#[derive(Clone)]
pub struct RegisteredProjector {
    name: String,
    version: String,
    fold: Arc<FoldFn>,
}

impl RegisteredProjector {
    /// Registry name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fold logic version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Apply one event to a payload.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if a typed projector cannot decode the
    /// prior payload or encode its output.
    pub fn apply(
        &self,
        payload: TagStatePayload,
        event: &Event,
    ) -> serde_json::Result<TagStatePayload> {
        (self.fold)(payload, event)
    }
}

impl fmt::Debug for RegisteredProjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredProjector")
            .field("name", &self.name)
            .field("version", &self.version)
            .finish()
    }
}

/// Name-keyed lookup of tag projectors.
///
/// `Clone` is cheap: projectors are `Arc`-wrapped.
#[derive(Debug, Clone, Default)]
pub struct ProjectorRegistry {
    projectors: HashMap<String, RegisteredProjector>,
}

impl ProjectorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed projector under [`TagProjector::NAME`]. A later
    /// registration with the same name replaces the earlier one.
    pub fn register<P: TagProjector>(&mut self) -> &mut Self {
        let fold = |payload: TagStatePayload, event: &Event| -> serde_json::Result<TagStatePayload> {
            let state: P::State = payload.decode()?;
            let next = P::project(state, event);
            Ok(TagStatePayload::Projected(serde_json::to_value(next)?))
        };
        self.projectors.insert(
            P::NAME.to_owned(),
            RegisteredProjector {
                name: P::NAME.to_owned(),
                version: P::VERSION.to_owned(),
                fold: Arc::new(fold),
            },
        );
        self
    }

    /// Register an untyped fold function.
    ///
    /// # Arguments
    ///
    /// * `name` - Registry name.
    /// * `version` - Fold logic version.
    /// * `fold` - `(prior payload, event) -> new payload`.
    pub fn register_fn<F>(
        &mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        fold: F,
    ) -> &mut Self
    where
        F: Fn(TagStatePayload, &Event) -> TagStatePayload + Send + Sync + 'static,
    {
        let name = name.into();
        self.projectors.insert(
            name.clone(),
            RegisteredProjector {
                name,
                version: version.into(),
                fold: Arc::new(
                    move |payload: TagStatePayload, event: &Event| -> serde_json::Result<TagStatePayload> {
                        Ok(fold(payload, event))
                    },
                ),
            },
        );
        self
    }

    /// Look up a projector by name.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectorError::NotRegistered`] if no projector has that
    /// name.
    pub fn get(&self, name: &str) -> Result<&RegisteredProjector, ProjectorError> {
        self.projectors
            .get(name)
            .ok_or_else(|| ProjectorError::NotRegistered(name.to_owned()))
    }

    /// Registered names, in no particular order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.projectors.keys().map(String::as_str)
    }
}
