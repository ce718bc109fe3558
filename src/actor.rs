//! Mailbox loop shared by the tag actors.
//!
//! Each actor is a tokio task that exclusively owns its state and
//! processes messages one at a time from a bounded `mpsc` channel. Callers
//! hold a cloneable handle wrapping the sender; every request carries a
//! `oneshot` reply channel. The loop exits when all handles are dropped or
//! when no message arrives within the idle timeout, after which the
//! [`ActorObjectAccessor`](crate::ActorObjectAccessor) re-spawns the actor
//! on the next lookup.

use std::future::Future;
use std::time::Duration;

use tokio::sync::mpsc;

/// Default idle timeout for actors: 5 minutes.
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default reservation lease: 30 seconds.
const DEFAULT_RESERVATION_LEASE: Duration = Duration::from_secs(30);

/// Default mailbox capacity per actor.
const DEFAULT_MAILBOX_CAPACITY: usize = 32;

/// Configuration shared by every actor the accessor spawns.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use eventfold_dcb::ActorConfig;
///
/// let config = ActorConfig {
///     reservation_lease: Duration::from_secs(5),
///     ..ActorConfig::default()
/// };
/// assert_eq!(config.idle_timeout, Duration::from_secs(300));
/// assert_eq!(config.mailbox_capacity, 32);
/// ```
#[derive(Debug, Clone)]
pub struct ActorConfig {
    /// How long an actor waits for a message before shutting down.
    ///
    /// A consistent actor holding an unexpired reservation stays up past
    /// the timeout until the reservation is released or expires.
    ///
    /// Default: 5 minutes.
    pub idle_timeout: Duration,

    /// How long a tag reservation is held before a new contender may
    /// purge it.
    ///
    /// Default: 30 seconds.
    pub reservation_lease: Duration,

    /// Bounded channel capacity per actor.
    ///
    /// Default: 32.
    pub mailbox_capacity: usize,
}

impl Default for ActorConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            reservation_lease: DEFAULT_RESERVATION_LEASE,
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
        }
    }
}

/// State owned by an actor task.
pub(crate) trait Actor: Send + 'static {
    /// Request type carried by the mailbox.
    type Message: Send + 'static;

    /// Process one message. Replies go out through the message's own
    /// `oneshot` sender.
    fn handle(&mut self, msg: Self::Message) -> impl Future<Output = ()> + Send;

    /// Whether the actor may shut down when the idle timeout elapses.
    fn can_idle(&self) -> bool {
        true
    }
}

/// Spawn `actor` on the current tokio runtime and return its mailbox.
///
/// # Arguments
///
/// * `actor` - The state the task will own.
/// * `kind` - Actor kind name, for logging.
/// * `id` - Actor id, for logging.
/// * `config` - Idle timeout and mailbox capacity.
pub(crate) fn spawn_actor<A: Actor>(
    actor: A,
    kind: &'static str,
    id: String,
    config: &ActorConfig,
) -> mpsc::Sender<A::Message> {
    let (tx, rx) = mpsc::channel(config.mailbox_capacity.max(1));
    let idle_timeout = config.idle_timeout;
    tracing::debug!(kind, id = %id, "spawning actor");
    tokio::spawn(run_actor(actor, rx, idle_timeout, kind, id));
    tx
}

/// Runs the mailbox loop until the channel closes or the actor idles out.
async fn run_actor<A: Actor>(
    mut actor: A,
    mut rx: mpsc::Receiver<A::Message>,
    idle_timeout: Duration,
    kind: &'static str,
    id: String,
) {
    loop {
        match tokio::time::timeout(idle_timeout, rx.recv()).await {
            Ok(Some(msg)) => actor.handle(msg).await,
            // Channel closed: all handles dropped.
            Ok(None) => break,
            Err(_elapsed) if actor.can_idle() => {
                tracing::info!(kind, id = %id, "actor idle, shutting down");
                break;
            }
            Err(_elapsed) => continue,
        }
    }
}
