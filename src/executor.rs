//! Command orchestration: handle, reserve, write, confirm.
//!
//! [`CommandExecutor::execute`] runs a [`Command`]'s handler against a
//! fresh [`CommandContext`], reserves every consistency tag of the produced
//! events in parallel, writes the batch, and confirms the reservations.
//! Any reservation or write failure cancels every reservation that was
//! granted, and nothing is written.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::accessor::ActorObjectAccessor;
use crate::actor::ActorConfig;
use crate::command::{Command, CommandContext, CommandMetadata};
use crate::consistent::{
    ReservationBaseline, TagConsistentActor, TagConsistentHandle, TagWriteReservation,
};
use crate::error::{
    ExecuteError, ReservationError, ReservationFailures, TagReservationFailure, TagStateError,
};
use crate::event::{Event, EventMetadata, NewEvent, TagWriteResult};
use crate::projector::{ProjectorRegistry, TagProjector, TagState, TagStatePayload};
use crate::sortable_id::SortableUniqueId;
use crate::store::{EventStore, InMemoryEventStore};
use crate::tag::{Consistency, Tag, TagStateId};
use crate::tag_state::TagStateActor;

/// Default executor identity stamped on written events.
const DEFAULT_EXECUTOR_NAME: &str = "CommandExecutor";

/// Metrics key for the number of written events.
pub const METRIC_EVENT_COUNT: &str = "EventCount";

/// Metrics key for the number of distinct tags written.
pub const METRIC_TAG_COUNT: &str = "TagCount";

/// Outcome of a successful command execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Id of the last written event, `None` if the handler produced none.
    pub event_id: Option<Uuid>,
    /// Position of the last written event, `None` if nothing was written.
    pub sortable_unique_id: Option<SortableUniqueId>,
    /// Store event count after the write. Informational only.
    pub position: u64,
    /// One entry per distinct tag written.
    pub tag_write_results: Vec<TagWriteResult>,
    /// Wall time spent executing.
    pub elapsed: Duration,
    /// Every written event, in write order.
    pub events: Vec<Event>,
    /// Small metrics bag ([`METRIC_EVENT_COUNT`], [`METRIC_TAG_COUNT`]).
    pub metrics: BTreeMap<String, u64>,
}

impl ExecutionResult {
    fn no_event(elapsed: Duration) -> Self {
        Self {
            event_id: None,
            sortable_unique_id: None,
            position: 0,
            tag_write_results: Vec::new(),
            elapsed,
            events: Vec::new(),
            metrics: metrics(0, 0),
        }
    }

    /// `true` if at least one event was written.
    pub fn wrote_events(&self) -> bool {
        !self.events.is_empty()
    }
}

fn metrics(events: usize, tags: usize) -> BTreeMap<String, u64> {
    BTreeMap::from([
        (METRIC_EVENT_COUNT.to_owned(), events as u64),
        (METRIC_TAG_COUNT.to_owned(), tags as u64),
    ])
}

/// A granted reservation together with the actor that issued it.
type Granted = (TagConsistentHandle, TagWriteReservation);

/// Outcome of one reservation task.
type ReserveOutcome = (Tag, Result<Granted, ReservationError>);

/// Runs commands against an event store with per-tag reservations.
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    accessor: ActorObjectAccessor,
    executor_name: Arc<str>,
}

impl CommandExecutor {
    /// Start configuring an executor.
    pub fn builder() -> CommandExecutorBuilder {
        CommandExecutorBuilder::new()
    }

    /// Build an executor over an existing accessor.
    pub fn new(accessor: ActorObjectAccessor) -> Self {
        Self {
            accessor,
            executor_name: Arc::from(DEFAULT_EXECUTOR_NAME),
        }
    }

    /// Execute a command to completion.
    ///
    /// # Arguments
    ///
    /// * `command` - The command to run.
    /// * `metadata` - Caller identity and correlation.
    ///
    /// # Returns
    ///
    /// An [`ExecutionResult`] describing what was written.
    ///
    /// # Errors
    ///
    /// * [`ExecuteError::Handler`] -- the handler rejected the command.
    /// * [`ExecuteError::Reservation`] -- at least one tag could not be
    ///   reserved. Granted reservations were cancelled.
    /// * [`ExecuteError::Write`] -- the store rejected the batch. All
    ///   reservations were cancelled.
    pub async fn execute<C: Command>(
        &self,
        command: C,
        metadata: CommandMetadata,
    ) -> Result<ExecutionResult, ExecuteError<C::Error>> {
        self.execute_until(command, metadata, std::future::pending())
            .await
    }

    /// Execute a command unless `cancel` completes first.
    ///
    /// `cancel` is checked while the handler runs, during the reservation
    /// fan-out, and once more before the write. If it fires in any of those
    /// windows the call returns [`ExecuteError::Cancelled`] and every
    /// reservation that was or will be granted is cancelled in the
    /// background. Once the write has started it runs to completion.
    ///
    /// # Arguments
    ///
    /// * `command` - The command to run.
    /// * `metadata` - Caller identity and correlation.
    /// * `cancel` - Any future, e.g. `tokio::time::sleep(deadline)` or a
    ///   cancellation token's `cancelled()`.
    ///
    /// # Errors
    ///
    /// Everything [`execute`](CommandExecutor::execute) returns, plus
    /// [`ExecuteError::Cancelled`].
    pub async fn execute_until<C, F>(
        &self,
        command: C,
        metadata: CommandMetadata,
        cancel: F,
    ) -> Result<ExecutionResult, ExecuteError<C::Error>>
    where
        C: Command,
        F: Future<Output = ()> + Send,
    {
        let span = tracing::info_span!("execute", command = command.command_type());
        self.run(command, metadata, cancel).instrument(span).await
    }

    async fn run<C, F>(
        &self,
        command: C,
        metadata: CommandMetadata,
        cancel: F,
    ) -> Result<ExecutionResult, ExecuteError<C::Error>>
    where
        C: Command,
        F: Future<Output = ()> + Send,
    {
        let started = Instant::now();
        tokio::pin!(cancel);

        // 1. Decide.
        let ctx = CommandContext::new(self.accessor.clone());
        let returned = tokio::select! {
            biased;
            () = &mut cancel => return Err(ExecuteError::Cancelled),
            result = command.handle(&ctx) => result.map_err(ExecuteError::Handler)?,
        };
        let new_events = collect_events(&ctx, returned);
        let targets = reservation_targets(&ctx, &new_events);
        drop(ctx);

        // 2. No event: nothing to reserve or write.
        if new_events.is_empty() {
            return Ok(ExecutionResult::no_event(started.elapsed()));
        }

        // 3. Reserve every consistency tag in parallel.
        let mut set: JoinSet<ReserveOutcome> = JoinSet::new();
        for (tag, baseline) in &targets {
            let accessor = self.accessor.clone();
            let tag = tag.clone();
            let baseline = baseline.clone();
            set.spawn(async move {
                let result = reserve(&accessor, &tag, baseline).await;
                (tag, result)
            });
        }

        let mut granted: Vec<Granted> = Vec::with_capacity(targets.len());
        let mut failures: Vec<TagReservationFailure> = Vec::new();
        loop {
            tokio::select! {
                biased;
                () = &mut cancel => {
                    abandon(set, granted);
                    return Err(ExecuteError::Cancelled);
                }
                next = set.join_next() => match next {
                    None => break,
                    Some(Ok((_, Ok(pair)))) => granted.push(pair),
                    Some(Ok((tag, Err(error)))) => failures.push(TagReservationFailure {
                        tag: tag.to_string(),
                        error,
                    }),
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "reservation task failed");
                        failures.push(TagReservationFailure {
                            tag: String::from("<unknown>"),
                            error: ReservationError::ActorGone,
                        });
                    }
                },
            }
        }

        if !failures.is_empty() {
            cancel_all(granted).await;
            failures.sort_by_key(|f| {
                targets
                    .iter()
                    .position(|(tag, _)| tag.to_string() == f.tag)
                    .unwrap_or(usize::MAX)
            });
            let failures = ReservationFailures(failures);
            tracing::warn!(error = %failures, "reservation failed, nothing written");
            return Err(ExecuteError::Reservation(failures));
        }

        // Last chance to back out before the write.
        tokio::select! {
            biased;
            () = &mut cancel => {
                cancel_all(granted).await;
                return Err(ExecuteError::Cancelled);
            }
            () = std::future::ready(()) => {}
        }

        // 4. Write.
        let events = self.stamp(&command, &metadata, new_events);
        let outcome = match self.accessor.event_store().write_events(events).await {
            Ok(outcome) => outcome,
            Err(e) => {
                cancel_all(granted).await;
                tracing::warn!(error = %e, "event write failed, reservations cancelled");
                return Err(ExecuteError::Write(e));
            }
        };

        // 5. Confirm, then refresh the position of tags written without a
        //    reservation.
        confirm_all(granted).await;
        self.notify_unreserved(&outcome.tag_writes, &targets).await;

        tracing::info!(
            count = outcome.events.len(),
            tags = outcome.tag_writes.len(),
            "events appended"
        );

        let last = outcome.events.last();
        Ok(ExecutionResult {
            event_id: last.map(|e| e.id),
            sortable_unique_id: last.map(|e| e.sortable_unique_id.clone()),
            position: outcome.global_position,
            metrics: metrics(outcome.events.len(), outcome.tag_writes.len()),
            tag_write_results: outcome.tag_writes,
            elapsed: started.elapsed(),
            events: outcome.events,
        })
    }

    /// Assign ids, positions, and metadata to the new events.
    fn stamp<C: Command>(
        &self,
        command: &C,
        metadata: &CommandMetadata,
        new_events: Vec<NewEvent>,
    ) -> Vec<Event> {
        let mut correlation_id = metadata.correlation_id.clone();
        new_events
            .into_iter()
            .map(|new_event| {
                let id = Uuid::now_v7();
                let correlation_id = correlation_id
                    .get_or_insert_with(|| id.to_string())
                    .clone();
                let tags = new_event.distinct_tags().into_iter().cloned().collect();
                Event {
                    id,
                    sortable_unique_id: SortableUniqueId::generate_new(),
                    event_type: new_event.event_type,
                    payload: new_event.payload,
                    metadata: EventMetadata {
                        causation_id: metadata
                            .causation_id
                            .clone()
                            .unwrap_or_else(|| command.command_type().to_owned()),
                        correlation_id,
                        executed_by: metadata
                            .executed_by
                            .clone()
                            .unwrap_or_else(|| self.executor_name.to_string()),
                    },
                    tags,
                }
            })
            .collect()
    }

    async fn notify_unreserved(
        &self,
        written: &[TagWriteResult],
        reserved: &[(Tag, ReservationBaseline)],
    ) {
        for write in written {
            if reserved.iter().any(|(tag, _)| tag == &write.tag) {
                continue;
            }
            let id = write.tag.to_string();
            if !self.accessor.exists::<TagConsistentActor>(&id).await {
                // A fresh actor catches up on first use.
                continue;
            }
            let result = match self.accessor.get_or_create::<TagConsistentActor>(&id).await {
                Ok(handle) => handle.notify_event_written().await,
                Err(e) => Err(e.into()),
            };
            if let Err(e) = result {
                tracing::warn!(tag = %write.tag, error = %e, "failed to notify tag actor");
            }
        }
    }

    /// Read a tag state outside of any command.
    ///
    /// # Errors
    ///
    /// Returns [`TagStateError`] if the state actor cannot be reached or
    /// the fold fails.
    pub async fn get_tag_state(&self, id: &TagStateId) -> Result<TagState, TagStateError> {
        let handle = self
            .accessor
            .get_or_create::<TagStateActor>(&id.to_string())
            .await?;
        handle.get_state().await
    }

    /// The actor registry this executor uses.
    pub fn accessor(&self) -> &ActorObjectAccessor {
        &self.accessor
    }

    /// The event store this executor writes to.
    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        self.accessor.event_store()
    }

    /// Identity stamped on events when the caller supplies none.
    pub fn executor_name(&self) -> &str {
        &self.executor_name
    }
}

/// Appended events first, then the returned one unless it was also
/// appended.
fn collect_events(ctx: &CommandContext, returned: Option<NewEvent>) -> Vec<NewEvent> {
    let mut events = ctx.take_appended();
    if let Some(event) = returned
        && !events.contains(&event)
    {
        events.push(event);
    }
    events
}

/// Distinct consistency tags across `events`, each with the baseline to
/// reserve against. A pinned position wins over an observed one.
fn reservation_targets(
    ctx: &CommandContext,
    events: &[NewEvent],
) -> Vec<(Tag, ReservationBaseline)> {
    let mut targets: Vec<(Tag, ReservationBaseline)> = Vec::new();
    for event_tag in events.iter().flat_map(|e| &e.tags) {
        let baseline = match &event_tag.consistency {
            Consistency::Skip => continue,
            Consistency::Required(id) => ReservationBaseline::At(id.clone()),
            Consistency::Observed => ctx.accessed_baseline(&event_tag.tag),
        };
        let pinned = matches!(event_tag.consistency, Consistency::Required(_));
        match targets.iter_mut().find(|(tag, _)| tag == &event_tag.tag) {
            Some(existing) if pinned => existing.1 = baseline,
            Some(_) => {}
            None => targets.push((event_tag.tag.clone(), baseline)),
        }
    }
    targets
}

async fn reserve(
    accessor: &ActorObjectAccessor,
    tag: &Tag,
    baseline: ReservationBaseline,
) -> Result<Granted, ReservationError> {
    let handle = accessor
        .get_or_create::<TagConsistentActor>(&tag.to_string())
        .await?;
    let reservation = handle.make_reservation(baseline).await?;
    Ok((handle, reservation))
}

/// Cancel every granted reservation concurrently. Failures are logged.
async fn cancel_all(granted: Vec<Granted>) {
    let mut set = JoinSet::new();
    for (handle, reservation) in granted {
        set.spawn(async move {
            let tag = reservation.tag.clone();
            (tag, handle.cancel_reservation(reservation).await)
        });
    }
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(true))) => {}
            Ok((tag, Ok(false))) => {
                tracing::warn!(tag = %tag, "reservation already released before cancel");
            }
            Ok((tag, Err(e))) => {
                tracing::warn!(tag = %tag, error = %e, "failed to cancel reservation");
            }
            Err(e) => tracing::warn!(error = %e, "cancel task failed"),
        }
    }
}

/// Confirm every reservation concurrently. The events are already durable,
/// so failures are logged and left to lease expiry.
async fn confirm_all(granted: Vec<Granted>) {
    let mut set = JoinSet::new();
    for (handle, reservation) in granted {
        set.spawn(async move {
            let tag = reservation.tag.clone();
            (tag, handle.confirm_reservation(reservation).await)
        });
    }
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((_, Ok(()))) => {}
            Ok((tag, Err(e))) => {
                tracing::warn!(tag = %tag, error = %e, "failed to confirm reservation");
            }
            Err(e) => tracing::warn!(error = %e, "confirm task failed"),
        }
    }
}

/// Hand the in-flight fan-out to a detached task that cancels every
/// reservation it yields.
fn abandon(mut set: JoinSet<ReserveOutcome>, granted: Vec<Granted>) {
    tokio::spawn(async move {
        let mut all = granted;
        while let Some(joined) = set.join_next().await {
            if let Ok((_, Ok(pair))) = joined {
                all.push(pair);
            }
        }
        cancel_all(all).await;
    });
}

/// Builder for configuring a [`CommandExecutor`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_dcb::CommandExecutorBuilder;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let executor = CommandExecutorBuilder::new()
///     .reservation_lease(Duration::from_secs(10))
///     .executor_name("enrollment-service")
///     .build();
/// assert_eq!(executor.executor_name(), "enrollment-service");
/// # }
/// ```
pub struct CommandExecutorBuilder {
    event_store: Option<Arc<dyn EventStore>>,
    projectors: ProjectorRegistry,
    config: ActorConfig,
    executor_name: String,
}

impl CommandExecutorBuilder {
    /// A builder with an in-memory store, no projectors, and default
    /// [`ActorConfig`].
    pub fn new() -> Self {
        Self {
            event_store: None,
            projectors: ProjectorRegistry::new(),
            config: ActorConfig::default(),
            executor_name: DEFAULT_EXECUTOR_NAME.to_owned(),
        }
    }

    /// Use `store` instead of a fresh [`InMemoryEventStore`].
    pub fn event_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.event_store = Some(store);
        self
    }

    /// Register a typed tag projector.
    pub fn projector<P: TagProjector>(mut self) -> Self {
        self.projectors.register::<P>();
        self
    }

    /// Register an untyped fold function.
    ///
    /// # Arguments
    ///
    /// * `name` - Registry name.
    /// * `version` - Fold logic version.
    /// * `fold` - `(prior payload, event) -> new payload`.
    pub fn projector_fn<F>(
        mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        fold: F,
    ) -> Self
    where
        F: Fn(TagStatePayload, &Event) -> TagStatePayload + Send + Sync + 'static,
    {
        self.projectors.register_fn(name, version, fold);
        self
    }

    /// Set how long a tag reservation is held.
    pub fn reservation_lease(mut self, lease: Duration) -> Self {
        self.config.reservation_lease = lease;
        self
    }

    /// Set how long an idle actor waits before shutting down.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Replace the whole actor configuration.
    pub fn actor_config(mut self, config: ActorConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the identity stamped on events when the caller supplies none.
    pub fn executor_name(mut self, name: impl Into<String>) -> Self {
        self.executor_name = name.into();
        self
    }

    /// Build the executor and its actor registry.
    pub fn build(self) -> CommandExecutor {
        let store = self
            .event_store
            .unwrap_or_else(|| Arc::new(InMemoryEventStore::new()));
        let accessor = ActorObjectAccessor::new(store, self.projectors, self.config);
        CommandExecutor {
            accessor,
            executor_name: Arc::from(self.executor_name),
        }
    }
}

impl Default for CommandExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
