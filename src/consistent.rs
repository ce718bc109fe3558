//! Per-tag reservation actor.
//!
//! One [`TagConsistentActor`] runs per tag. It hands out at most one
//! unexpired [`TagWriteReservation`] at a time and tracks the tag's latest
//! written position, which it catches up lazily from the
//! [`EventStore`](crate::EventStore). A reservation request whose baseline
//! position differs from the current one is rejected as stale, as is a
//! request made against an empty tag that has since been written.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use uuid::Uuid;

use crate::accessor::{ActorKind, ActorObjectAccessor};
use crate::actor::{Actor, spawn_actor};
use crate::error::{ActorError, ReservationError, StoreError};
use crate::sortable_id::SortableUniqueId;
use crate::store::EventStore;
use crate::tag::Tag;

/// An exclusive, time-bounded hold on a tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagWriteReservation {
    /// Opaque token presented to confirm or cancel.
    pub reservation_code: Uuid,
    /// When the lease runs out, on the monotonic clock.
    pub expires_at: Instant,
    /// The reserved tag.
    pub tag: Tag,
}

impl TagWriteReservation {
    /// `true` once the lease has run out.
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Instant::now()
    }
}

/// What a reservation request is checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationBaseline {
    /// No staleness check.
    Unchecked,
    /// The caller saw the tag with no events.
    Empty,
    /// The caller saw the tag at this position.
    At(SortableUniqueId),
}

impl ReservationBaseline {
    /// Position the caller saw, if any.
    pub fn position(&self) -> Option<&SortableUniqueId> {
        match self {
            Self::At(id) => Some(id),
            Self::Unchecked | Self::Empty => None,
        }
    }
}

/// Marker for the per-tag reservation actor kind, used with
/// [`ActorObjectAccessor::get_or_create`].
#[derive(Debug)]
pub enum TagConsistentActor {}

impl ActorKind for TagConsistentActor {
    const KIND: &'static str = "tag-consistent";
    type Handle = TagConsistentHandle;

    fn spawn(id: &str, accessor: &ActorObjectAccessor) -> Result<Self::Handle, ActorError> {
        let tag = Tag::parse(id).map_err(|source| ActorError::InvalidId {
            kind: Self::KIND,
            id: id.to_owned(),
            source,
        })?;
        let config = accessor.config();
        let state = TagConsistentState::new(
            tag.clone(),
            Arc::clone(accessor.event_store()),
            config.reservation_lease,
        );
        let sender = spawn_actor(state, Self::KIND, tag.to_string(), config);
        Ok(TagConsistentHandle { tag, sender })
    }

    fn is_alive(handle: &Self::Handle) -> bool {
        handle.is_alive()
    }
}

/// Messages sent from [`TagConsistentHandle`] to the actor.
pub(crate) enum ConsistentMessage {
    /// Latest written position of the tag, after catching up.
    GetLatest {
        reply: oneshot::Sender<Option<SortableUniqueId>>,
    },
    /// Request a reservation against a baseline position.
    MakeReservation {
        baseline: ReservationBaseline,
        reply: oneshot::Sender<Result<TagWriteReservation, ReservationError>>,
    },
    /// Release a reservation after a successful write.
    Confirm {
        reservation: TagWriteReservation,
        reply: oneshot::Sender<Result<(), ReservationError>>,
    },
    /// Release a reservation without writing.
    Cancel {
        reservation: TagWriteReservation,
        reply: oneshot::Sender<bool>,
    },
    /// An event carrying the tag was written without a reservation.
    NotifyEventWritten { reply: oneshot::Sender<()> },
    /// Currently held, unexpired reservations.
    ActiveReservations {
        reply: oneshot::Sender<Vec<TagWriteReservation>>,
    },
}

/// State owned by the reservation actor task.
struct TagConsistentState {
    tag: Tag,
    store: Arc<dyn EventStore>,
    lease: Duration,
    reservation: Option<TagWriteReservation>,
    latest: Option<SortableUniqueId>,
    caught_up: bool,
}

impl TagConsistentState {
    fn new(tag: Tag, store: Arc<dyn EventStore>, lease: Duration) -> Self {
        Self {
            tag,
            store,
            lease,
            reservation: None,
            latest: None,
            caught_up: false,
        }
    }

    /// Refresh `latest` from the store if a write may have moved it.
    async fn catch_up(&mut self) {
        if self.caught_up {
            return;
        }
        match self.store.get_latest_tag_state(&self.tag).await {
            Ok(latest) => {
                self.latest = Some(latest.last_sortable_unique_id);
                self.caught_up = true;
            }
            Err(StoreError::TagNotFound(_)) => {
                self.latest = None;
                self.caught_up = true;
            }
            Err(e) => {
                // Keep the previous value and retry on the next request.
                tracing::error!(tag = %self.tag, error = %e, "failed to catch up tag position");
            }
        }
    }

    fn purge_expired(&mut self) {
        if self.reservation.as_ref().is_some_and(TagWriteReservation::is_expired) {
            tracing::debug!(tag = %self.tag, "reservation lease expired");
            self.reservation = None;
        }
    }

    async fn make_reservation(
        &mut self,
        baseline: ReservationBaseline,
    ) -> Result<TagWriteReservation, ReservationError> {
        self.catch_up().await;
        self.purge_expired();

        if self.reservation.is_some() {
            return Err(ReservationError::Conflict {
                tag: self.tag.to_string(),
            });
        }
        if let Some(current) = &self.latest {
            let stale = match &baseline {
                ReservationBaseline::Unchecked => false,
                ReservationBaseline::Empty => true,
                ReservationBaseline::At(expected) => expected != current,
            };
            if stale {
                return Err(ReservationError::StaleVersion {
                    tag: self.tag.to_string(),
                    expected: baseline.position().cloned(),
                    current: current.clone(),
                });
            }
        }

        let reservation = TagWriteReservation {
            reservation_code: Uuid::new_v4(),
            expires_at: Instant::now() + self.lease,
            tag: self.tag.clone(),
        };
        self.reservation = Some(reservation.clone());
        Ok(reservation)
    }

    fn holds(&self, reservation: &TagWriteReservation) -> bool {
        self.reservation
            .as_ref()
            .is_some_and(|held| held.reservation_code == reservation.reservation_code)
    }

    fn confirm(&mut self, reservation: &TagWriteReservation) -> Result<(), ReservationError> {
        if !self.holds(reservation) {
            return Err(ReservationError::Mismatch {
                tag: self.tag.to_string(),
                code: reservation.reservation_code,
            });
        }
        self.reservation = None;
        // The confirmed write moved the tag; re-read it on the next request.
        self.caught_up = false;
        Ok(())
    }

    fn cancel(&mut self, reservation: &TagWriteReservation) -> bool {
        if !self.holds(reservation) {
            return false;
        }
        self.reservation = None;
        true
    }
}

impl Actor for TagConsistentState {
    type Message = ConsistentMessage;

    async fn handle(&mut self, msg: ConsistentMessage) {
        match msg {
            ConsistentMessage::GetLatest { reply } => {
                self.catch_up().await;
                let _ = reply.send(self.latest.clone());
            }
            ConsistentMessage::MakeReservation { baseline, reply } => {
                let result = self.make_reservation(baseline).await;
                let _ = reply.send(result);
            }
            ConsistentMessage::Confirm { reservation, reply } => {
                let _ = reply.send(self.confirm(&reservation));
            }
            ConsistentMessage::Cancel { reservation, reply } => {
                let _ = reply.send(self.cancel(&reservation));
            }
            ConsistentMessage::NotifyEventWritten { reply } => {
                self.caught_up = false;
                let _ = reply.send(());
            }
            ConsistentMessage::ActiveReservations { reply } => {
                self.purge_expired();
                let _ = reply.send(self.reservation.iter().cloned().collect());
            }
        }
    }

    fn can_idle(&self) -> bool {
        self.reservation
            .as_ref()
            .is_none_or(TagWriteReservation::is_expired)
    }
}

/// Async handle to a tag's reservation actor.
///
/// Cheap to clone. Every method fails with
/// [`ReservationError::ActorGone`] once the actor task has exited.
#[derive(Debug, Clone)]
pub struct TagConsistentHandle {
    tag: Tag,
    sender: mpsc::Sender<ConsistentMessage>,
}

impl TagConsistentHandle {
    /// The tag this actor guards.
    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    /// Latest written position of the tag, `None` if it was never written.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::ActorGone`] if the actor has exited.
    pub async fn get_latest_sortable_unique_id(
        &self,
    ) -> Result<Option<SortableUniqueId>, ReservationError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConsistentMessage::GetLatest { reply: tx })
            .await
            .map_err(|_| ReservationError::ActorGone)?;
        rx.await.map_err(|_| ReservationError::ActorGone)
    }

    /// Acquire the tag's reservation.
    ///
    /// Expired reservations are purged first.
    ///
    /// # Arguments
    ///
    /// * `baseline` - What the caller based its decision on.
    ///   [`ReservationBaseline::Unchecked`] skips the staleness check.
    ///
    /// # Errors
    ///
    /// * [`ReservationError::Conflict`] -- another reservation is live.
    /// * [`ReservationError::StaleVersion`] -- the tag moved past
    ///   `baseline`.
    /// * [`ReservationError::ActorGone`] -- the actor has exited.
    pub async fn make_reservation(
        &self,
        baseline: ReservationBaseline,
    ) -> Result<TagWriteReservation, ReservationError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConsistentMessage::MakeReservation {
                baseline,
                reply: tx,
            })
            .await
            .map_err(|_| ReservationError::ActorGone)?;
        rx.await.map_err(|_| ReservationError::ActorGone)?
    }

    /// Release a reservation after its write succeeded.
    ///
    /// # Errors
    ///
    /// * [`ReservationError::Mismatch`] -- the reservation is not held
    ///   (already consumed, expired and replaced, or never issued here).
    /// * [`ReservationError::ActorGone`] -- the actor has exited.
    pub async fn confirm_reservation(
        &self,
        reservation: TagWriteReservation,
    ) -> Result<(), ReservationError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConsistentMessage::Confirm {
                reservation,
                reply: tx,
            })
            .await
            .map_err(|_| ReservationError::ActorGone)?;
        rx.await.map_err(|_| ReservationError::ActorGone)?
    }

    /// Release a reservation without writing.
    ///
    /// Returns `false` if the reservation was not held.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::ActorGone`] if the actor has exited.
    pub async fn cancel_reservation(
        &self,
        reservation: TagWriteReservation,
    ) -> Result<bool, ReservationError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConsistentMessage::Cancel {
                reservation,
                reply: tx,
            })
            .await
            .map_err(|_| ReservationError::ActorGone)?;
        rx.await.map_err(|_| ReservationError::ActorGone)
    }

    /// Tell the actor an event carrying the tag was written outside the
    /// reservation protocol, so it re-reads its position.
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::ActorGone`] if the actor has exited.
    pub async fn notify_event_written(&self) -> Result<(), ReservationError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConsistentMessage::NotifyEventWritten { reply: tx })
            .await
            .map_err(|_| ReservationError::ActorGone)?;
        rx.await.map_err(|_| ReservationError::ActorGone)
    }

    /// Reservations currently held (zero or one).
    ///
    /// # Errors
    ///
    /// Returns [`ReservationError::ActorGone`] if the actor has exited.
    pub async fn active_reservations(&self) -> Result<Vec<TagWriteReservation>, ReservationError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConsistentMessage::ActiveReservations { reply: tx })
            .await
            .map_err(|_| ReservationError::ActorGone)?;
        rx.await.map_err(|_| ReservationError::ActorGone)
    }

    /// Check whether the actor backing this handle is still running.
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }
}
