//! Per-`(tag, projector)` materialized state actor.
//!
//! A [`TagStateActor`] folds the events of one tag through one registered
//! projector and caches the resulting [`TagState`]. The fold is bounded by
//! the latest position known to the tag's
//! [`TagConsistentActor`](crate::TagConsistentActor), so a state never runs
//! ahead of a write that is still being confirmed. When that position
//! moves, the cache is extended incrementally rather than rebuilt.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::accessor::{ActorKind, ActorObjectAccessor, WeakAccessor};
use crate::actor::{Actor, spawn_actor};
use crate::consistent::TagConsistentActor;
use crate::error::{ActorError, StoreError, TagStateError};
use crate::event::Event;
use crate::projector::{ProjectorRegistry, RegisteredProjector, TagState};
use crate::sortable_id::SortableUniqueId;
use crate::store::EventStore;
use crate::tag::TagStateId;

/// Marker for the tag state actor kind. Ids have the form
/// `Group:Content:Projector`.
#[derive(Debug)]
pub enum TagStateActor {}

impl ActorKind for TagStateActor {
    const KIND: &'static str = "tag-state";
    type Handle = TagStateHandle;

    fn spawn(id: &str, accessor: &ActorObjectAccessor) -> Result<Self::Handle, ActorError> {
        let state_id = TagStateId::parse(id).map_err(|source| ActorError::InvalidId {
            kind: Self::KIND,
            id: id.to_owned(),
            source,
        })?;
        let state = TagStateActorState {
            id: state_id.clone(),
            accessor: accessor.downgrade(),
            store: Arc::clone(accessor.event_store()),
            projectors: accessor.projectors().clone(),
            cache: None,
        };
        let sender = spawn_actor(state, Self::KIND, state_id.to_string(), accessor.config());
        Ok(TagStateHandle {
            id: state_id,
            sender,
        })
    }

    fn is_alive(handle: &Self::Handle) -> bool {
        handle.is_alive()
    }
}

/// Messages sent from [`TagStateHandle`] to the actor.
pub(crate) enum TagStateMessage {
    GetState {
        reply: oneshot::Sender<Result<TagState, TagStateError>>,
    },
    UpdateState {
        state: TagState,
        reply: oneshot::Sender<Result<(), TagStateError>>,
    },
    ClearCache {
        reply: oneshot::Sender<()>,
    },
}

struct TagStateActorState {
    id: TagStateId,
    accessor: WeakAccessor,
    store: Arc<dyn EventStore>,
    projectors: ProjectorRegistry,
    cache: Option<TagState>,
}

impl TagStateActorState {
    /// Latest written position of the tag, preferring the consistent
    /// actor's view and falling back to the store.
    async fn latest_position(&self) -> Result<Option<SortableUniqueId>, TagStateError> {
        if let Some(accessor) = self.accessor.upgrade() {
            let consistent = accessor
                .get_or_create::<TagConsistentActor>(&self.id.tag.to_string())
                .await?;
            match consistent.get_latest_sortable_unique_id().await {
                Ok(latest) => return Ok(latest),
                Err(e) => {
                    tracing::warn!(
                        tag = %self.id.tag,
                        error = %e,
                        "consistent actor unavailable, reading position from store"
                    );
                }
            }
        }
        match self.store.get_latest_tag_state(&self.id.tag).await {
            Ok(latest) => Ok(Some(latest.last_sortable_unique_id)),
            Err(StoreError::TagNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_state(&mut self) -> Result<TagState, TagStateError> {
        let latest = self.latest_position().await?;

        if let Some(cached) = &self.cache
            && cached.last_sorted_unique_id == latest
        {
            return Ok(cached.clone());
        }

        let projector = match self.projectors.get(&self.id.projector) {
            Ok(projector) => projector.clone(),
            Err(e) => {
                tracing::debug!(id = %self.id, error = %e, "returning empty tag state");
                return Ok(TagState::empty(&self.id));
            }
        };

        let Some(latest) = latest else {
            let empty = TagState::empty_with_version(&self.id, projector.version());
            self.cache = Some(empty.clone());
            return Ok(empty);
        };

        let state = match self.cache.take() {
            Some(cached)
                if cached.projector_version == projector.version()
                    && cached
                        .last_sorted_unique_id
                        .as_ref()
                        .is_some_and(|last| last < &latest) =>
            {
                let since = cached.last_sorted_unique_id.clone();
                let events = self
                    .store
                    .read_events_by_tag(&self.id.tag, since.as_ref())
                    .await?;
                fold(cached, &projector, &events, &latest)?
            }
            _ => {
                let events = self.store.read_events_by_tag(&self.id.tag, None).await?;
                let empty = TagState::empty_with_version(&self.id, projector.version());
                fold(empty, &projector, &events, &latest)?
            }
        };
        self.cache = Some(state.clone());
        Ok(state)
    }

    fn update_state(&mut self, state: TagState) -> Result<(), TagStateError> {
        if !state.matches(&self.id) {
            return Err(TagStateError::IdentityMismatch {
                expected: self.id.to_string(),
                actual: state.identity(),
            });
        }
        self.cache = Some(state);
        Ok(())
    }
}

/// Fold `events` up to and including `latest` onto `state`.
fn fold(
    mut state: TagState,
    projector: &RegisteredProjector,
    events: &[Event],
    latest: &SortableUniqueId,
) -> Result<TagState, TagStateError> {
    let mut payload = std::mem::take(&mut state.payload);
    for event in events
        .iter()
        .take_while(|e| &e.sortable_unique_id <= latest)
    {
        payload = projector.apply(payload, event)?;
        state.version += 1;
        state.last_sorted_unique_id = Some(event.sortable_unique_id.clone());
    }
    state.payload = payload;
    Ok(state)
}

impl Actor for TagStateActorState {
    type Message = TagStateMessage;

    async fn handle(&mut self, msg: TagStateMessage) {
        match msg {
            TagStateMessage::GetState { reply } => {
                let result = self.get_state().await;
                let _ = reply.send(result);
            }
            TagStateMessage::UpdateState { state, reply } => {
                let _ = reply.send(self.update_state(state));
            }
            TagStateMessage::ClearCache { reply } => {
                self.cache = None;
                let _ = reply.send(());
            }
        }
    }
}

/// Async handle to a tag state actor.
#[derive(Debug, Clone)]
pub struct TagStateHandle {
    id: TagStateId,
    sender: mpsc::Sender<TagStateMessage>,
}

impl TagStateHandle {
    /// Identity of the actor.
    pub fn id(&self) -> &TagStateId {
        &self.id
    }

    /// Current projected state of the tag.
    ///
    /// Returns an empty state if the projector is not registered.
    ///
    /// # Errors
    ///
    /// * [`TagStateError::Store`] -- reading events failed.
    /// * [`TagStateError::Decode`] -- the projector could not decode its
    ///   own payload.
    /// * [`TagStateError::ActorGone`] -- the actor has exited.
    pub async fn get_state(&self) -> Result<TagState, TagStateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TagStateMessage::GetState { reply: tx })
            .await
            .map_err(|_| TagStateError::ActorGone)?;
        rx.await.map_err(|_| TagStateError::ActorGone)?
    }

    /// Replace the cached state.
    ///
    /// # Errors
    ///
    /// * [`TagStateError::IdentityMismatch`] -- `state` belongs to another
    ///   `(group, content, projector)`.
    /// * [`TagStateError::ActorGone`] -- the actor has exited.
    pub async fn update_state(&self, state: TagState) -> Result<(), TagStateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TagStateMessage::UpdateState { state, reply: tx })
            .await
            .map_err(|_| TagStateError::ActorGone)?;
        rx.await.map_err(|_| TagStateError::ActorGone)?
    }

    /// Drop the cached state so the next read rebuilds it.
    ///
    /// # Errors
    ///
    /// Returns [`TagStateError::ActorGone`] if the actor has exited.
    pub async fn clear_cache(&self) -> Result<(), TagStateError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(TagStateMessage::ClearCache { reply: tx })
            .await
            .map_err(|_| TagStateError::ActorGone)?;
        rx.await.map_err(|_| TagStateError::ActorGone)
    }

    /// Check whether the actor backing this handle is still running.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}
