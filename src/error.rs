//! Crate-level error types for the event store, the tag actors, and
//! command execution.

use std::fmt;

use uuid::Uuid;

use crate::sortable_id::SortableUniqueId;

/// Error returned when a string is not a valid [`SortableUniqueId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SortableIdError {
    /// The value does not have the fixed id width.
    #[error("sortable unique id must be {expected} characters, got {actual}")]
    InvalidLength {
        /// Required width.
        expected: usize,
        /// Width of the rejected value.
        actual: usize,
    },

    /// The value contains something other than an ASCII digit.
    #[error("sortable unique id contains a non-digit at position {position}")]
    InvalidCharacter {
        /// Byte offset of the first offending character.
        position: usize,
    },
}

/// Error returned when a tag or tag state id cannot be parsed or validated.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TagError {
    /// The `Group:Content` separator is missing.
    #[error("tag '{0}' is missing the ':' separator between group and content")]
    MissingSeparator(String),

    /// The group part is empty.
    #[error("tag '{0}' has an empty group")]
    EmptyGroup(String),

    /// The group part contains a `:`.
    #[error("tag group '{0}' must not contain ':'")]
    InvalidGroup(String),

    /// The content part is empty.
    #[error("tag '{0}' has empty content")]
    EmptyContent(String),

    /// A tag state id is missing its trailing projector name.
    #[error("tag state id '{0}' is missing a projector name")]
    MissingProjector(String),
}

/// Error returned by [`EventStore`](crate::EventStore) operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// No event with this id has been written.
    #[error("event {0} not found")]
    EventNotFound(Uuid),

    /// No event carrying this tag has been written.
    #[error("tag {0} not found")]
    TagNotFound(String),

    /// The batch contains an event id that already exists (or appears
    /// twice in the batch). Nothing from the batch was written.
    #[error("event {0} already exists")]
    DuplicateEvent(Uuid),

    /// The backend rejected the batch. Nothing from the batch was written.
    #[error("write failed: {0}")]
    WriteFailure(String),
}

/// Error returned when a tag projector lookup fails.
///
/// Lookups that fail this way are soft inside the tag state actor: the
/// actor answers with an empty state instead of surfacing the error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProjectorError {
    /// No projector is registered under this name.
    #[error("tag projector '{0}' is not registered")]
    NotRegistered(String),
}

/// Error returned by the [`ActorObjectAccessor`](crate::ActorObjectAccessor).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActorError {
    /// The id could not be parsed into the identity the actor kind needs.
    #[error("invalid {kind} actor id '{id}': {source}")]
    InvalidId {
        /// Actor kind name.
        kind: &'static str,
        /// The rejected id.
        id: String,
        /// Why the id was rejected.
        #[source]
        source: TagError,
    },
}

/// Error returned by the per-tag reservation actor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReservationError {
    /// The tag already holds an unexpired reservation.
    #[error("tag {tag} is currently reserved")]
    Conflict {
        /// The contested tag.
        tag: String,
    },

    /// The caller's baseline position no longer matches the tag's latest
    /// written position.
    #[error(
        "tag {tag} has been modified: expected {}, current {current}",
        .expected.as_ref().map_or("<empty>", SortableUniqueId::as_str)
    )]
    StaleVersion {
        /// The contested tag.
        tag: String,
        /// Position the caller observed, `None` if it saw no events.
        expected: Option<SortableUniqueId>,
        /// Position the actor currently knows.
        current: SortableUniqueId,
    },

    /// Confirm or cancel presented a reservation the actor does not hold.
    #[error("reservation {code} is not held for tag {tag}")]
    Mismatch {
        /// The tag the request was sent to.
        tag: String,
        /// The presented reservation code.
        code: Uuid,
    },

    /// The actor task has exited.
    #[error("tag consistent actor is no longer running")]
    ActorGone,

    /// The actor could not be located or created.
    #[error(transparent)]
    Actor(#[from] ActorError),
}

/// Error returned when reading or updating a tag state fails.
#[derive(Debug, thiserror::Error)]
pub enum TagStateError {
    /// `UpdateState` presented a state belonging to a different
    /// `(group, content, projector)` identity.
    #[error("cannot change tag state identity: expected {expected}, got {actual}")]
    IdentityMismatch {
        /// Identity of the actor.
        expected: String,
        /// Identity carried by the rejected state.
        actual: String,
    },

    /// Reading events for the fold failed.
    #[error("failed to read events for tag state: {0}")]
    Store(#[from] StoreError),

    /// The projected payload could not be decoded into the requested type.
    #[error("failed to decode tag state payload: {0}")]
    Decode(#[from] serde_json::Error),

    /// The actor task has exited.
    #[error("tag state actor is no longer running")]
    ActorGone,

    /// The actor could not be located or created.
    #[error(transparent)]
    Actor(#[from] ActorError),
}

/// One failed reservation inside an aggregated [`ExecuteError::Reservation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagReservationFailure {
    /// The tag whose reservation failed.
    pub tag: String,
    /// Why it failed.
    pub error: ReservationError,
}

/// Every reservation failure observed during one command execution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReservationFailures(pub Vec<TagReservationFailure>);

impl ReservationFailures {
    /// `true` if at least one failure is a [`ReservationError::Conflict`] or
    /// [`ReservationError::StaleVersion`], i.e. the command lost a race and
    /// may succeed if retried.
    pub fn is_contention(&self) -> bool {
        self.0.iter().any(|f| {
            matches!(
                f.error,
                ReservationError::Conflict { .. } | ReservationError::StaleVersion { .. }
            )
        })
    }

    /// Tags whose reservation failed.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|f| f.tag.as_str())
    }
}

impl fmt::Display for ReservationFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("failed to reserve tags: ")?;
        for (i, failure) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "Tag {}: {}", failure.tag, failure.error)?;
        }
        Ok(())
    }
}

/// Error returned when executing a command fails.
///
/// Generic over `E`, the error type of the command handler (e.g.
/// "classroom is full").
///
/// # Type Parameters
///
/// * `E` - Handler error type, must implement `Error + Send + Sync + 'static`
#[derive(Debug, thiserror::Error)]
pub enum ExecuteError<E: std::error::Error + Send + Sync + 'static> {
    /// The handler rejected the command. Nothing was reserved or written.
    #[error(transparent)]
    Handler(E),

    /// One or more reservations failed. Every reservation that succeeded
    /// was cancelled and nothing was written.
    #[error("{0}")]
    Reservation(ReservationFailures),

    /// The store rejected the write. Every reservation was cancelled.
    #[error("event write failed: {0}")]
    Write(#[source] StoreError),

    /// The caller's cancel signal fired before the write started. Any
    /// reservation already granted is cancelled in the background.
    #[error("command execution was cancelled")]
    Cancelled,
}

impl<E: std::error::Error + Send + Sync + 'static> ExecuteError<E> {
    /// `true` if the command lost a reservation race and may succeed when
    /// retried against fresh state.
    pub fn is_contention(&self) -> bool {
        matches!(self, ExecuteError::Reservation(failures) if failures.is_contention())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A minimal handler error for testing `ExecuteError<E>`.
    #[derive(Debug, thiserror::Error)]
    #[error("classroom is full")]
    struct TestHandlerError;

    #[test]
    fn execute_error_handler_displays_inner() {
        let err: ExecuteError<TestHandlerError> = ExecuteError::Handler(TestHandlerError);
        assert_eq!(err.to_string(), "classroom is full");
    }

    #[test]
    fn reservation_failures_enumerate_every_tag() {
        let failures = ReservationFailures(vec![
            TagReservationFailure {
                tag: "Student:1".into(),
                error: ReservationError::Conflict {
                    tag: "Student:1".into(),
                },
            },
            TagReservationFailure {
                tag: "ClassRoom:9".into(),
                error: ReservationError::ActorGone,
            },
        ]);
        let err: ExecuteError<TestHandlerError> = ExecuteError::Reservation(failures);
        assert_eq!(
            err.to_string(),
            "failed to reserve tags: Tag Student:1: tag Student:1 is currently reserved; \
             Tag ClassRoom:9: tag consistent actor is no longer running"
        );
        assert!(err.is_contention());
    }

    #[test]
    fn actor_gone_is_not_contention() {
        let failures = ReservationFailures(vec![TagReservationFailure {
            tag: "Student:1".into(),
            error: ReservationError::ActorGone,
        }]);
        assert!(!failures.is_contention());
        assert_eq!(failures.tags().collect::<Vec<_>>(), vec!["Student:1"]);
    }

    #[test]
    fn write_error_display() {
        let err: ExecuteError<TestHandlerError> =
            ExecuteError::Write(StoreError::WriteFailure("disk full".into()));
        assert_eq!(err.to_string(), "event write failed: write failed: disk full");
    }

    #[test]
    fn stale_version_display_names_both_positions() {
        let expected = SortableUniqueId::generate_new();
        let current = SortableUniqueId::generate_new();
        let err = ReservationError::StaleVersion {
            tag: "ClassRoom:1".into(),
            expected: Some(expected.clone()),
            current: current.clone(),
        };
        let msg = err.to_string();
        assert!(msg.contains(expected.as_str()));
        assert!(msg.contains(current.as_str()));

        let err = ReservationError::StaleVersion {
            tag: "Student:1".into(),
            expected: None,
            current,
        };
        assert!(err.to_string().contains("expected <empty>"));
    }

    #[test]
    fn tag_state_error_from_store_error() {
        let err = TagStateError::from(StoreError::TagNotFound("Student:1".into()));
        assert!(err.to_string().contains("Student:1"));
    }

    // Verify `Send + Sync` bounds are satisfied so errors can cross task
    // boundaries through `tokio` channels.
    const _: () = {
        #[allow(dead_code)]
        fn assert_send_sync<T: Send + Sync>() {}

        #[allow(dead_code)]
        fn check() {
            assert_send_sync::<ExecuteError<TestHandlerError>>();
            assert_send_sync::<TagStateError>();
            assert_send_sync::<ReservationError>();
            assert_send_sync::<StoreError>();
        }
    };
}
