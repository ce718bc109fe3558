//! Keyed get-or-create registry for tag actors.
//!
//! [`ActorObjectAccessor`] caches one live handle per `(actor kind, id)`
//! pair. Lookups take a read lock; a miss or a dead handle falls through to
//! a write lock that re-checks before spawning, so concurrent callers for
//! the same id always end up sharing the first caller's actor.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use tokio::sync::RwLock;

use crate::actor::ActorConfig;
use crate::error::ActorError;
use crate::projector::ProjectorRegistry;
use crate::store::EventStore;

/// Type-erased handle cache keyed by `(TypeId, id)`.
///
/// `TypeId` identifies the [`ActorKind`]; the `String` is the actor id.
/// Downcasting recovers the typed handle.
type HandleCache = HashMap<(TypeId, String), Box<dyn Any + Send + Sync>>;

/// A kind of actor the accessor can create.
pub trait ActorKind: 'static {
    /// Kind name, for logging and errors.
    const KIND: &'static str;

    /// Cloneable handle to a running actor.
    type Handle: Clone + Send + Sync + 'static;

    /// Parse `id` and spawn a fresh actor for it.
    ///
    /// # Errors
    ///
    /// Returns [`ActorError::InvalidId`] if `id` is not a valid identity
    /// for this kind.
    fn spawn(id: &str, accessor: &ActorObjectAccessor) -> Result<Self::Handle, ActorError>;

    /// `false` once the actor behind `handle` has exited.
    fn is_alive(handle: &Self::Handle) -> bool;
}

struct AccessorInner {
    cache: RwLock<HandleCache>,
    event_store: Arc<dyn EventStore>,
    projectors: ProjectorRegistry,
    config: ActorConfig,
}

/// Registry of live tag actors, sharing one event store, one projector
/// registry, and one [`ActorConfig`].
///
/// `Clone` is cheap -- all internal state is `Arc`-wrapped.
#[derive(Clone)]
pub struct ActorObjectAccessor {
    inner: Arc<AccessorInner>,
}

// Manual `Debug` because `dyn Any` is not `Debug`.
impl fmt::Debug for ActorObjectAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorObjectAccessor")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl ActorObjectAccessor {
    /// Create an empty registry.
    ///
    /// # Arguments
    ///
    /// * `event_store` - Store every created actor reads from.
    /// * `projectors` - Projectors available to tag state actors.
    /// * `config` - Idle timeout, reservation lease, mailbox capacity.
    pub fn new(
        event_store: Arc<dyn EventStore>,
        projectors: ProjectorRegistry,
        config: ActorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(AccessorInner {
                cache: RwLock::new(HashMap::new()),
                event_store,
                projectors,
                config,
            }),
        }
    }

    /// Get the live actor for `id`, spawning it if needed.
    ///
    /// Dead handles (idled out or stopped) are evicted and replaced. A
    /// re-spawned actor rebuilds its state from the event store.
    ///
    /// # Errors
    ///
    /// Returns [`ActorError::InvalidId`] if `id` is not valid for `K`.
    pub async fn get_or_create<K: ActorKind>(&self, id: &str) -> Result<K::Handle, ActorError> {
        let key = (TypeId::of::<K>(), id.to_owned());

        // Fast path: check cache with read lock.
        {
            let cache = self.inner.cache.read().await;
            if let Some(handle) = live_handle::<K>(&cache, &key) {
                return Ok(handle);
            }
        }

        // Slow path: re-check under the write lock so only the first caller
        // spawns.
        let mut cache = self.inner.cache.write().await;
        if let Some(handle) = live_handle::<K>(&cache, &key) {
            return Ok(handle);
        }
        let handle = K::spawn(id, self)?;
        cache.insert(key, Box::new(handle.clone()));
        Ok(handle)
    }

    /// `true` if a live actor of kind `K` is cached for `id`.
    pub async fn exists<K: ActorKind>(&self, id: &str) -> bool {
        let key = (TypeId::of::<K>(), id.to_owned());
        let cache = self.inner.cache.read().await;
        live_handle::<K>(&cache, &key).is_some()
    }

    /// Drop the cached actor of kind `K` for `id`. The actor stops once
    /// every outstanding handle is dropped. Returns `true` if an entry was
    /// removed.
    pub async fn remove<K: ActorKind>(&self, id: &str) -> bool {
        let key = (TypeId::of::<K>(), id.to_owned());
        self.inner.cache.write().await.remove(&key).is_some()
    }

    /// Drop every cached actor.
    pub async fn clear(&self) {
        self.inner.cache.write().await.clear();
    }

    /// The shared event store.
    pub fn event_store(&self) -> &Arc<dyn EventStore> {
        &self.inner.event_store
    }

    /// The shared projector registry.
    pub fn projectors(&self) -> &ProjectorRegistry {
        &self.inner.projectors
    }

    /// The shared actor configuration.
    pub fn config(&self) -> &ActorConfig {
        &self.inner.config
    }

    /// A non-owning reference, for actors that look up sibling actors
    /// without keeping the registry alive.
    pub(crate) fn downgrade(&self) -> WeakAccessor {
        WeakAccessor {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

fn live_handle<K: ActorKind>(cache: &HandleCache, key: &(TypeId, String)) -> Option<K::Handle> {
    cache
        .get(key)
        .and_then(|boxed| boxed.downcast_ref::<K::Handle>())
        .filter(|handle| K::is_alive(handle))
        .cloned()
}

/// Weak counterpart of [`ActorObjectAccessor`].
#[derive(Clone)]
pub(crate) struct WeakAccessor {
    inner: Weak<AccessorInner>,
}

impl WeakAccessor {
    /// The accessor, if it still exists.
    pub(crate) fn upgrade(&self) -> Option<ActorObjectAccessor> {
        self.inner
            .upgrade()
            .map(|inner| ActorObjectAccessor { inner })
    }
}
