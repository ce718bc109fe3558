//! Dynamic Consistency Boundary event sourcing.
//!
//! Events carry any number of `group:content` tags instead of belonging to
//! one aggregate. Writers are serialized per tag by short-lived
//! reservations, tag states are folded on demand by per-tag actors, and
//! multi-item read models tolerate bounded out-of-order delivery through a
//! safe/unsafe window.

mod accessor;
mod actor;
mod command;
mod consistent;
mod error;
mod event;
mod executor;
mod live;
mod projection;
mod projector;
mod safe_unsafe;
mod sortable_id;
mod store;
mod tag;
mod tag_state;

pub use accessor::{ActorKind, ActorObjectAccessor};
pub use actor::ActorConfig;
pub use command::{Command, CommandContext, CommandMetadata};
pub use consistent::{
    ReservationBaseline, TagConsistentActor, TagConsistentHandle, TagWriteReservation,
};
pub use error::{
    ActorError, ExecuteError, ProjectorError, ReservationError, ReservationFailures,
    SortableIdError, StoreError, TagError, TagReservationFailure, TagStateError,
};
pub use event::{Event, EventMetadata, EventOrNone, NewEvent, TagStream, TagWriteResult};
pub use executor::{
    CommandExecutor, CommandExecutorBuilder, ExecutionResult, METRIC_EVENT_COUNT,
    METRIC_TAG_COUNT,
};
pub use live::{LiveConfig, LiveHandle, spawn_live_projection};
pub use projection::{MultiProjectionRunner, MultiProjector, TagGroupProjector};
pub use projector::{
    ProjectorRegistry, RegisteredProjector, TagProjector, TagState, TagStatePayload,
};
pub use safe_unsafe::{ProjectedItem, SafeUnsafeProjectionState, SortableEvent};
pub use sortable_id::{SORTABLE_ID_LENGTH, SortableUniqueId};
pub use store::{
    EventStore, EventSubscription, InMemoryEventStore, LatestTag, SubscriptionLagged, TagInfo,
    WriteOutcome,
};
pub use tag::{Consistency, EventTag, Tag, TagStateId};
pub use tag_state::{TagStateActor, TagStateHandle};
