//! Windowed multi-item projection state.
//!
//! Events whose position is at or past the safe-window threshold are
//! "unsafe": they may still be joined by earlier events arriving out of
//! order. For every item touched by an unsafe event the state keeps the last
//! stable value plus the pending unsafe events, sorted by position, and
//! recomputes the current value by replaying them. When the threshold
//! advances, pending events that fell below it are folded into the stable
//! value and forgotten, so memory is bounded by the window, not the log.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use uuid::Uuid;

use crate::event::Event;
use crate::sortable_id::SortableUniqueId;

/// An event that can be placed in the global order.
pub trait SortableEvent: Clone {
    /// Global position of the event.
    fn sortable_unique_id(&self) -> &SortableUniqueId;

    /// Unique identity, used to drop redelivered events.
    fn event_id(&self) -> Uuid;
}

impl SortableEvent for Event {
    fn sortable_unique_id(&self) -> &SortableUniqueId {
        &self.sortable_unique_id
    }

    fn event_id(&self) -> Uuid {
        self.id
    }
}

/// A tracked item and the position of the last event that shaped it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedItem<V> {
    /// The projected value.
    pub value: V,
    /// Greatest position among the events folded into `value`.
    pub last_sortable_unique_id: SortableUniqueId,
}

/// Stable value of an item plus the unsafe events layered on top of it.
#[derive(Debug, Clone)]
struct SafeBackup<V, E> {
    /// `None` if the item did not exist before the first pending event.
    safe: Option<ProjectedItem<V>>,
    /// Sorted by `(sortable_unique_id, event_id)`.
    pending: Vec<E>,
}

/// Projection state over many keyed items with a safe/unsafe split.
///
/// # Type Parameters
///
/// * `K` - Item key.
/// * `V` - Item value.
/// * `E` - Event type, [`Event`] by default.
#[derive(Debug, Clone)]
pub struct SafeUnsafeProjectionState<K, V, E = Event> {
    items: HashMap<K, ProjectedItem<V>>,
    backups: HashMap<K, SafeBackup<V, E>>,
    pending_ids: HashSet<Uuid>,
    threshold: SortableUniqueId,
}

impl<K, V, E> Default for SafeUnsafeProjectionState<K, V, E> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            backups: HashMap::new(),
            pending_ids: HashSet::new(),
            threshold: SortableUniqueId::min_value(),
        }
    }
}

impl<K, V, E> SafeUnsafeProjectionState<K, V, E>
where
    K: Eq + Hash + Clone,
    V: Clone,
    E: SortableEvent,
{
    /// Empty state with the threshold at
    /// [`SortableUniqueId::min_value`], so every event starts unsafe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event into every item it affects.
    ///
    /// # Arguments
    ///
    /// * `event` - The event to apply.
    /// * `selector` - Keys of the items `event` affects.
    /// * `project` - `(key, current value, event) -> new value`. `None`
    ///   deletes the item.
    ///
    /// Redelivery of an event still inside the window is ignored. An unsafe
    /// event older than other pending events for the same item is replayed
    /// in position order.
    pub fn process_event<S, P>(&mut self, event: &E, selector: S, project: P)
    where
        S: Fn(&E) -> Vec<K>,
        P: Fn(&K, Option<&V>, &E) -> Option<V>,
    {
        if self.pending_ids.contains(&event.event_id()) {
            return;
        }
        let keys = selector(event);
        if keys.is_empty() {
            return;
        }

        if event.sortable_unique_id().is_earlier_than(&self.threshold) {
            for key in keys {
                self.apply_safe(key, event, &project);
            }
        } else {
            self.pending_ids.insert(event.event_id());
            for key in keys {
                self.apply_unsafe(key, event, &project);
            }
        }
    }

    /// [`process_event`](Self::process_event) for each event in order.
    pub fn process_events<'a, S, P>(
        &mut self,
        events: impl IntoIterator<Item = &'a E>,
        selector: S,
        project: P,
    ) where
        E: 'a,
        S: Fn(&E) -> Vec<K>,
        P: Fn(&K, Option<&V>, &E) -> Option<V>,
    {
        for event in events {
            self.process_event(event, &selector, &project);
        }
    }

    /// Move the safe-window threshold forward.
    ///
    /// Pending events earlier than `threshold` are folded into their items'
    /// stable values and dropped from the window. A threshold that does not
    /// move forward is ignored. Returns `true` if the threshold changed.
    pub fn update_safe_window_threshold<S, P>(
        &mut self,
        threshold: SortableUniqueId,
        selector: S,
        project: P,
    ) -> bool
    where
        S: Fn(&E) -> Vec<K>,
        P: Fn(&K, Option<&V>, &E) -> Option<V>,
    {
        if threshold <= self.threshold {
            return false;
        }
        self.threshold = threshold;

        let threshold = &self.threshold;
        let pending_ids = &mut self.pending_ids;
        self.backups.retain(|key, backup| {
            let split = backup
                .pending
                .partition_point(|e| e.sortable_unique_id().is_earlier_than(threshold));
            if split == 0 {
                return true;
            }
            let mut safe = backup.safe.take();
            for event in backup.pending.drain(..split) {
                pending_ids.remove(&event.event_id());
                if !selector(&event).contains(key) {
                    continue;
                }
                safe = fold(key, safe, &event, &project);
            }
            backup.safe = safe;
            !backup.pending.is_empty()
        });
        tracing::trace!(threshold = %self.threshold, pending = self.backups.len(), "safe window advanced");
        true
    }

    /// Every tracked item, safe and unsafe.
    pub fn get_current_state(&self) -> HashMap<&K, &V> {
        self.items.iter().map(|(k, item)| (k, &item.value)).collect()
    }

    /// Items last shaped by an event earlier than the threshold.
    pub fn get_safe_state(&self) -> HashMap<&K, &V> {
        self.items
            .iter()
            .filter(|(_, item)| item.last_sortable_unique_id.is_earlier_than(&self.threshold))
            .map(|(k, item)| (k, &item.value))
            .collect()
    }

    /// `true` iff `key` is tracked and its last event is not earlier than
    /// the threshold.
    pub fn is_item_unsafe(&self, key: &K) -> bool {
        self.items
            .get(key)
            .is_some_and(|item| !item.last_sortable_unique_id.is_earlier_than(&self.threshold))
    }

    /// Current value of `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.items.get(key).map(|item| &item.value)
    }

    /// Current value of `key` with its last contributing position.
    pub fn item(&self, key: &K) -> Option<&ProjectedItem<V>> {
        self.items.get(key)
    }

    /// The last applied threshold. [`SortableUniqueId::min_value`] until the
    /// first advance.
    pub fn safe_window_threshold(&self) -> &SortableUniqueId {
        &self.threshold
    }

    /// Number of events still inside the window.
    pub fn pending_event_count(&self) -> usize {
        self.pending_ids.len()
    }

    /// Number of tracked items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// `true` if no item is tracked.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn apply_safe<P>(&mut self, key: K, event: &E, project: &P)
    where
        P: Fn(&K, Option<&V>, &E) -> Option<V>,
    {
        match self.backups.get_mut(&key) {
            // Late arrival under the window: slot it beneath the pending
            // events and replay them.
            Some(backup) => {
                backup.safe = fold(&key, backup.safe.take(), event, project);
                self.replay(key, project);
            }
            None => {
                let current = self.items.remove(&key);
                if let Some(item) = fold(&key, current, event, project) {
                    self.items.insert(key, item);
                }
            }
        }
    }

    fn apply_unsafe<P>(&mut self, key: K, event: &E, project: &P)
    where
        P: Fn(&K, Option<&V>, &E) -> Option<V>,
    {
        let backup = self
            .backups
            .entry(key.clone())
            .or_insert_with(|| SafeBackup {
                safe: self.items.get(&key).cloned(),
                pending: Vec::new(),
            });
        let position = backup
            .pending
            .partition_point(|e| order(e) < order(event));
        backup.pending.insert(position, event.clone());
        self.replay(key, project);
    }

    /// Recompute the current value of `key` from its backup.
    fn replay<P>(&mut self, key: K, project: &P)
    where
        P: Fn(&K, Option<&V>, &E) -> Option<V>,
    {
        let Some(backup) = self.backups.get(&key) else {
            return;
        };
        let mut current = backup.safe.clone();
        for event in &backup.pending {
            current = fold(&key, current, event, project);
        }
        match current {
            Some(item) => {
                self.items.insert(key, item);
            }
            None => {
                self.items.remove(&key);
            }
        }
    }
}

fn order<E: SortableEvent>(event: &E) -> (&SortableUniqueId, Uuid) {
    (event.sortable_unique_id(), event.event_id())
}

/// Apply one event to an item. The last contributing position only moves
/// forward.
fn fold<K, V, E, P>(
    key: &K,
    current: Option<ProjectedItem<V>>,
    event: &E,
    project: &P,
) -> Option<ProjectedItem<V>>
where
    E: SortableEvent,
    P: Fn(&K, Option<&V>, &E) -> Option<V>,
{
    let previous = current.as_ref().map(|item| &item.last_sortable_unique_id);
    let last = match previous {
        Some(prev) if event.sortable_unique_id() < prev => prev.clone(),
        _ => event.sortable_unique_id().clone(),
    };
    project(key, current.as_ref().map(|item| &item.value), event).map(|value| ProjectedItem {
        value,
        last_sortable_unique_id: last,
    })
}
