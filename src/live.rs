//! Live multi-projection loop.
//!
//! [`spawn_live_projection`] keeps a [`MultiProjectionRunner`] current: it
//! catches up from the store, then folds events from the store's
//! subscription as they are committed and advances the safe window on a
//! fixed interval. [`LiveHandle`] reads the projected items and stops the
//! loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_stream::StreamExt;

use crate::projection::{MultiProjectionRunner, MultiProjector};
use crate::store::{EventSubscription, InMemoryEventStore};

/// Configuration for a live projection.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_dcb::LiveConfig;
///
/// let config = LiveConfig {
///     safe_window: Duration::from_secs(5),
///     ..LiveConfig::default()
/// };
/// assert_eq!(config.threshold_interval, Duration::from_secs(1));
/// ```
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// How far behind the wall clock the safe threshold trails. Events
    /// newer than this stay provisional.
    ///
    /// Default: 20 seconds.
    pub safe_window: Duration,

    /// How often the safe threshold is advanced.
    ///
    /// Default: 1 second.
    pub threshold_interval: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            safe_window: Duration::from_secs(20),
            threshold_interval: Duration::from_secs(1),
        }
    }
}

/// Handle to a running live projection.
///
/// Dropping the handle does **not** stop the loop -- call
/// [`shutdown`](LiveHandle::shutdown).
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
pub struct LiveHandle<M: MultiProjector> {
    shutdown_tx: watch::Sender<bool>,
    caught_up: Arc<AtomicBool>,
    runner: Arc<Mutex<MultiProjectionRunner<M>>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<M: MultiProjector> Clone for LiveHandle<M> {
    fn clone(&self) -> Self {
        Self {
            shutdown_tx: self.shutdown_tx.clone(),
            caught_up: Arc::clone(&self.caught_up),
            runner: Arc::clone(&self.runner),
            task: Arc::clone(&self.task),
        }
    }
}

impl<M: MultiProjector> LiveHandle<M> {
    /// `true` once the initial catch-up from the store has completed.
    pub fn is_caught_up(&self) -> bool {
        self.caught_up.load(Ordering::Acquire)
    }

    /// Run `f` against the runner while holding its lock.
    pub async fn with_runner<R>(&self, f: impl FnOnce(&MultiProjectionRunner<M>) -> R) -> R {
        let runner = self.runner.lock().await;
        f(&runner)
    }

    /// Signal the loop to stop and wait for it to exit.
    ///
    /// Calling `shutdown` more than once is safe.
    ///
    /// # Errors
    ///
    /// Returns [`JoinError`] if the loop task panicked.
    pub async fn shutdown(&self) -> Result<(), JoinError> {
        // The receiver is gone if the task already exited.
        let _ = self.shutdown_tx.send(true);
        let task = self.task.lock().await.take();
        match task {
            Some(join_handle) => join_handle.await,
            None => Ok(()),
        }
    }
}

/// Start a live projection over `store`.
///
/// Subscribes before the initial catch-up, so no event committed in between
/// is missed. Events seen both ways are folded once.
///
/// # Arguments
///
/// * `projector` - The read model to keep current.
/// * `store` - The store to catch up from and subscribe to.
/// * `config` - Safe window and threshold interval.
pub fn spawn_live_projection<M: MultiProjector>(
    projector: M,
    store: Arc<InMemoryEventStore>,
    config: LiveConfig,
) -> LiveHandle<M> {
    let subscription = store.subscribe();
    let runner = Arc::new(Mutex::new(MultiProjectionRunner::new(
        projector,
        store,
        config.safe_window,
    )));
    let caught_up = Arc::new(AtomicBool::new(false));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let task = tokio::spawn(run_live_loop(
        Arc::clone(&runner),
        subscription,
        config.threshold_interval,
        Arc::clone(&caught_up),
        shutdown_rx,
    ));

    LiveHandle {
        shutdown_tx,
        caught_up,
        runner,
        task: Arc::new(Mutex::new(Some(task))),
    }
}

/// Catch up, then follow the subscription until shut down or the feed
/// closes.
async fn run_live_loop<M: MultiProjector>(
    runner: Arc<Mutex<MultiProjectionRunner<M>>>,
    mut subscription: EventSubscription,
    threshold_interval: Duration,
    caught_up: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(threshold_interval);
    // The first tick completes immediately; consume it.
    ticker.tick().await;

    catch_up(&runner, &caught_up).await;

    loop {
        tokio::select! {
            Ok(()) = shutdown_rx.changed() => break,
            _ = ticker.tick() => {
                if !caught_up.load(Ordering::Acquire) {
                    catch_up(&runner, &caught_up).await;
                }
                runner.lock().await.advance_threshold(SystemTime::now());
            }
            next = subscription.next() => match next {
                Some(Ok(event)) => {
                    runner.lock().await.apply_event(&event);
                }
                Some(Err(lagged)) => {
                    tracing::warn!(skipped = lagged.skipped, "live projection lagged, re-reading store");
                    caught_up.store(false, Ordering::Release);
                    catch_up(&runner, &caught_up).await;
                }
                None => {
                    tracing::info!("event feed closed, live projection stopping");
                    break;
                }
            },
        }
    }
}

async fn catch_up<M: MultiProjector>(
    runner: &Mutex<MultiProjectionRunner<M>>,
    caught_up: &AtomicBool,
) {
    let mut runner = runner.lock().await;
    match runner.catch_up().await {
        Ok(applied) => {
            caught_up.store(true, Ordering::Release);
            tracing::info!(projector = runner.projector().name(), applied, "live projection caught up");
        }
        Err(e) => {
            tracing::error!(
                projector = runner.projector().name(),
                error = %e,
                "live projection catch-up failed, will retry"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::projection::TagGroupProjector;
    use crate::projector::test_fixtures::{
        ClassRoomEvent, ClassRoomProjector, CounterProjector, classroom_event, tag,
    };
    use crate::store::EventStore;

    async fn write(store: &InMemoryEventStore, event: ClassRoomEvent, tags: &[&str]) -> Event {
        let event = classroom_event(&event, tags);
        store
            .write_events(vec![event.clone()])
            .await
            .expect("write should succeed");
        event
    }

    /// Poll until `check` holds or the deadline passes.
    async fn eventually<M: MultiProjector>(
        handle: &LiveHandle<M>,
        check: impl Fn(&MultiProjectionRunner<M>) -> bool,
    ) -> bool {
        for _ in 0..200 {
            if handle.with_runner(&check).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn live_projection_catches_up_then_follows() {
        let store = Arc::new(InMemoryEventStore::new());
        write(&store, ClassRoomEvent::Created { capacity: 2 }, &["ClassRoom:1"]).await;

        let handle = spawn_live_projection(
            TagGroupProjector::<ClassRoomProjector>::new("ClassRoom"),
            Arc::clone(&store),
            LiveConfig {
                safe_window: Duration::from_secs(20),
                threshold_interval: Duration::from_millis(10),
            },
        );
        assert!(eventually(&handle, |r| r.state().len() == 1).await);
        assert!(handle.is_caught_up());

        write(&store, ClassRoomEvent::Created { capacity: 3 }, &["ClassRoom:2"]).await;
        assert!(eventually(&handle, |r| r.state().len() == 2).await);

        // Inside the window both rooms are still provisional.
        let unsafe_rooms = handle
            .with_runner(|r| r.state().is_item_unsafe(&tag("ClassRoom:2")))
            .await;
        assert!(unsafe_rooms);

        handle.shutdown().await.expect("shutdown should succeed");
        handle.shutdown().await.expect("second shutdown is a no-op");
    }

    #[tokio::test]
    async fn zero_window_freezes_items_on_tick() {
        let store = Arc::new(InMemoryEventStore::new());
        write(&store, ClassRoomEvent::Created { capacity: 2 }, &["ClassRoom:1"]).await;

        let handle = spawn_live_projection(
            TagGroupProjector::<CounterProjector>::new("ClassRoom"),
            Arc::clone(&store),
            LiveConfig {
                safe_window: Duration::ZERO,
                threshold_interval: Duration::from_millis(10),
            },
        );
        assert!(
            eventually(&handle, |r| {
                r.state().len() == 1 && !r.state().is_item_unsafe(&tag("ClassRoom:1"))
            })
            .await
        );
        handle.shutdown().await.expect("shutdown should succeed");
    }
}
