//! Commands, their handlers, and the context a handler runs against.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::accessor::ActorObjectAccessor;
use crate::consistent::ReservationBaseline;
use crate::error::{StoreError, TagStateError};
use crate::event::{EventOrNone, NewEvent};
use crate::projector::{TagProjector, TagState};
use crate::sortable_id::SortableUniqueId;
use crate::tag::Tag;
use crate::tag_state::TagStateActor;

/// Cross-cutting metadata passed alongside a command.
///
/// Every field is optional. The executor fills the gaps: the causation id
/// defaults to the command type name, the correlation id to the id of the
/// first written event, and the executor identity to the executor's name.
///
/// # Examples
///
/// ```
/// use eventfold_dcb::CommandMetadata;
///
/// let meta = CommandMetadata::default()
///     .with_executed_by("user-42")
///     .with_correlation_id("req-abc-123");
///
/// assert_eq!(meta.executed_by.as_deref(), Some("user-42"));
/// assert_eq!(meta.correlation_id.as_deref(), Some("req-abc-123"));
/// assert_eq!(meta.causation_id, None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandMetadata {
    /// Identity of whoever issued the command (e.g. a user id).
    pub executed_by: Option<String>,
    /// Correlation id for tracing a request across commands.
    pub correlation_id: Option<String>,
    /// What caused this command (e.g. the id of an upstream event).
    pub causation_id: Option<String>,
}

impl CommandMetadata {
    /// Set the executor identity.
    pub fn with_executed_by(mut self, executed_by: impl Into<String>) -> Self {
        self.executed_by = Some(executed_by.into());
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the causation id.
    pub fn with_causation_id(mut self, id: impl Into<String>) -> Self {
        self.causation_id = Some(id.into());
        self
    }
}

/// A command and its handler.
///
/// The handler reads whatever tag states it needs through the
/// [`CommandContext`], decides, and returns at most one event (more can be
/// added with [`CommandContext::append_event`]). Returning an error
/// short-circuits execution before anything is reserved or written.
///
/// # Examples
///
/// ```
/// use eventfold_dcb::{Command, CommandContext, EventOrNone, NewEvent, Tag};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// #[serde(tag = "type", content = "data")]
/// enum StudentEvent {
///     Created { name: String },
/// }
///
/// struct CreateStudent { id: String, name: String }
///
/// impl Command for CreateStudent {
///     type Error = serde_json::Error;
///
///     async fn handle(&self, _ctx: &CommandContext) -> Result<EventOrNone, Self::Error> {
///         let tag = Tag::new("Student", self.id.clone()).expect("valid tag");
///         let event = StudentEvent::Created { name: self.name.clone() };
///         Ok(Some(NewEvent::new(&event, [tag])?))
///     }
/// }
/// ```
pub trait Command: Send + Sync + 'static {
    /// Error returned when the handler rejects the command.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Decide which event, if any, the command produces.
    fn handle(
        &self,
        ctx: &CommandContext,
    ) -> impl Future<Output = Result<EventOrNone, Self::Error>> + Send;

    /// Name recorded as the causation of written events. Defaults to the
    /// unqualified type name without generic arguments.
    fn command_type(&self) -> &'static str {
        let full = std::any::type_name::<Self>();
        let path = full.split('<').next().unwrap_or(full);
        path.rsplit("::").next().unwrap_or(path)
    }
}

/// Per-execution context handed to [`Command::handle`].
///
/// Records the position of every tag state the handler reads, so the
/// executor can reserve each tag against exactly what the handler saw.
pub struct CommandContext {
    accessor: ActorObjectAccessor,
    accessed: Mutex<HashMap<Tag, Option<SortableUniqueId>>>,
    appended: Mutex<Vec<NewEvent>>,
}

impl CommandContext {
    pub(crate) fn new(accessor: ActorObjectAccessor) -> Self {
        Self {
            accessor,
            accessed: Mutex::new(HashMap::new()),
            appended: Mutex::new(Vec::new()),
        }
    }

    /// Read a tag's state as projected by `P`.
    ///
    /// # Errors
    ///
    /// Returns [`TagStateError`] if the state actor cannot be reached or
    /// the fold fails.
    pub async fn get_state<P: TagProjector>(&self, tag: &Tag) -> Result<TagState, TagStateError> {
        self.get_state_by_name(tag, P::NAME).await
    }

    /// Read a tag's state as projected by `P` and decode its payload.
    ///
    /// An unwritten tag decodes to `P::State::default()`.
    ///
    /// # Errors
    ///
    /// Returns [`TagStateError`] if the state cannot be read or decoded.
    pub async fn state<P: TagProjector>(&self, tag: &Tag) -> Result<P::State, TagStateError> {
        let state = self.get_state::<P>(tag).await?;
        Ok(state.payload_as()?)
    }

    /// Read a tag's state through a projector looked up by name.
    ///
    /// # Errors
    ///
    /// Returns [`TagStateError`] if the state actor cannot be reached or
    /// the fold fails.
    pub async fn get_state_by_name(
        &self,
        tag: &Tag,
        projector: &str,
    ) -> Result<TagState, TagStateError> {
        let handle = self
            .accessor
            .get_or_create::<TagStateActor>(&format!("{tag}:{projector}"))
            .await?;
        let state = handle.get_state().await?;
        // An unregistered projector folds nothing, so its empty state says
        // nothing about the tag.
        if self.accessor.projectors().get(projector).is_ok() {
            self.accessed
                .lock()
                .expect("accessed states lock poisoned")
                .insert(tag.clone(), state.last_sorted_unique_id.clone());
        }
        Ok(state)
    }

    /// `true` if any event carries `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the store cannot be read.
    pub async fn tag_exists(&self, tag: &Tag) -> Result<bool, StoreError> {
        self.accessor.event_store().tag_exists(tag).await
    }

    /// Queue an extra event to be written in the same batch as the one the
    /// handler returns.
    pub fn append_event(&self, event: NewEvent) {
        self.appended
            .lock()
            .expect("appended events lock poisoned")
            .push(event);
    }

    /// Position the handler observed for `tag`, if it read the tag.
    pub fn accessed_position(&self, tag: &Tag) -> Option<SortableUniqueId> {
        self.accessed
            .lock()
            .expect("accessed states lock poisoned")
            .get(tag)
            .cloned()
            .flatten()
    }

    /// What a reservation on `tag` is checked against: the observed
    /// position, [`ReservationBaseline::Empty`] if the handler saw no
    /// events, or [`ReservationBaseline::Unchecked`] if it never read the
    /// tag.
    pub fn accessed_baseline(&self, tag: &Tag) -> ReservationBaseline {
        match self
            .accessed
            .lock()
            .expect("accessed states lock poisoned")
            .get(tag)
        {
            Some(Some(id)) => ReservationBaseline::At(id.clone()),
            Some(None) => ReservationBaseline::Empty,
            None => ReservationBaseline::Unchecked,
        }
    }

    /// Tags whose state the handler read.
    pub fn accessed_tags(&self) -> Vec<Tag> {
        self.accessed
            .lock()
            .expect("accessed states lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Drain the appended events.
    pub(crate) fn take_appended(&self) -> Vec<NewEvent> {
        std::mem::take(&mut *self.appended.lock().expect("appended events lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::actor::ActorConfig;
    use crate::projector::ProjectorRegistry;
    use crate::projector::test_fixtures::{
        ClassRoom, ClassRoomEvent, ClassRoomProjector, classroom_event, tag,
    };
    use crate::store::{EventStore, InMemoryEventStore};

    fn context() -> (Arc<InMemoryEventStore>, CommandContext) {
        let store = Arc::new(InMemoryEventStore::new());
        let mut projectors = ProjectorRegistry::new();
        projectors.register::<ClassRoomProjector>();
        let accessor = ActorObjectAccessor::new(store.clone(), projectors, ActorConfig::default());
        (store, CommandContext::new(accessor))
    }

    #[test]
    fn metadata_builder_chains_all_fields() {
        let meta = CommandMetadata::default()
            .with_executed_by("admin")
            .with_correlation_id("req-abc")
            .with_causation_id("evt-1");
        assert_eq!(meta.executed_by.as_deref(), Some("admin"));
        assert_eq!(meta.correlation_id.as_deref(), Some("req-abc"));
        assert_eq!(meta.causation_id.as_deref(), Some("evt-1"));
    }

    #[test]
    fn metadata_serde_roundtrip() {
        let meta = CommandMetadata::default().with_executed_by(String::from("svc-payments"));
        let json = serde_json::to_string(&meta).expect("serialization should succeed");
        let back: CommandMetadata =
            serde_json::from_str(&json).expect("deserialization should succeed");
        assert_eq!(back, meta);
    }

    #[test]
    fn command_type_is_unqualified() {
        struct Ping;
        impl Command for Ping {
            type Error = std::io::Error;
            async fn handle(&self, _ctx: &CommandContext) -> Result<EventOrNone, Self::Error> {
                Ok(None)
            }
        }
        assert_eq!(Ping.command_type(), "Ping");
    }

    #[test]
    fn command_type_drops_generic_arguments() {
        struct Wrap<T>(T);
        impl<T: Send + Sync + 'static> Command for Wrap<T> {
            type Error = std::io::Error;
            async fn handle(&self, _ctx: &CommandContext) -> Result<EventOrNone, Self::Error> {
                Ok(None)
            }
        }
        assert_eq!(Wrap(CommandMetadata::default()).command_type(), "Wrap");
        assert_eq!(Wrap(vec![1_u8]).command_type(), "Wrap");
    }

    #[tokio::test]
    async fn reading_state_records_observed_position() {
        let (store, ctx) = context();
        let created = classroom_event(&ClassRoomEvent::Created { capacity: 3 }, &["ClassRoom:1"]);
        store
            .write_events(vec![created.clone()])
            .await
            .expect("write should succeed");

        let room: ClassRoom = ctx
            .state::<ClassRoomProjector>(&tag("ClassRoom:1"))
            .await
            .expect("state");
        assert_eq!(room.capacity, 3);
        assert_eq!(
            ctx.accessed_position(&tag("ClassRoom:1")),
            Some(created.sortable_unique_id)
        );
        assert_eq!(ctx.accessed_tags(), vec![tag("ClassRoom:1")]);
    }

    #[tokio::test]
    async fn unread_and_unwritten_tags_have_no_position() {
        let (_store, ctx) = context();
        assert_eq!(ctx.accessed_position(&tag("ClassRoom:1")), None);
        assert_eq!(
            ctx.accessed_baseline(&tag("ClassRoom:1")),
            ReservationBaseline::Unchecked
        );
        let room: ClassRoom = ctx
            .state::<ClassRoomProjector>(&tag("ClassRoom:1"))
            .await
            .expect("state");
        assert_eq!(room, ClassRoom::default());
        assert_eq!(ctx.accessed_position(&tag("ClassRoom:1")), None);
        assert_eq!(
            ctx.accessed_baseline(&tag("ClassRoom:1")),
            ReservationBaseline::Empty
        );
        assert!(!ctx.tag_exists(&tag("ClassRoom:1")).await.expect("exists"));
    }

    #[tokio::test]
    async fn unregistered_projector_read_leaves_tag_unchecked() {
        let (store, ctx) = context();
        store
            .write_events(vec![classroom_event(
                &ClassRoomEvent::Created { capacity: 3 },
                &["ClassRoom:1"],
            )])
            .await
            .expect("write should succeed");

        let state = ctx
            .get_state_by_name(&tag("ClassRoom:1"), "MissingProjector")
            .await
            .expect("state");
        assert_eq!(state.version, 0);
        assert_eq!(
            ctx.accessed_baseline(&tag("ClassRoom:1")),
            ReservationBaseline::Unchecked
        );
    }

    #[test]
    fn appended_events_are_kept_in_order() {
        let (_store, ctx) = context();
        let first = NewEvent::new(&ClassRoomEvent::Created { capacity: 1 }, [tag("ClassRoom:1")])
            .expect("encode");
        let second = NewEvent::new(&ClassRoomEvent::Deleted, [tag("ClassRoom:1")]).expect("encode");
        ctx.append_event(first.clone());
        ctx.append_event(second.clone());
        assert_eq!(ctx.take_appended(), vec![first, second]);
        assert!(ctx.take_appended().is_empty());
    }
}
