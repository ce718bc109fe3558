//! Multi-item read models fed from the global event log.
//!
//! A [`MultiProjector`] maps each event to the keys it affects and folds it
//! into those items. [`MultiProjectionRunner`] drives one projector: it pages
//! through the store to catch up, accepts pushed events from a live feed,
//! and advances a wall-clock safe window so recent items stay provisional
//! while older ones freeze.

use std::collections::BTreeSet;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use uuid::Uuid;

use crate::error::StoreError;
use crate::event::Event;
use crate::projector::TagProjector;
use crate::safe_unsafe::SafeUnsafeProjectionState;
use crate::sortable_id::SortableUniqueId;
use crate::store::EventStore;
use crate::tag::Tag;

/// Events read per store call during catch-up.
const CATCH_UP_PAGE_SIZE: usize = 256;

/// A read model spanning many keyed items.
///
/// # Contract
///
/// - [`project`](MultiProjector::project) must be deterministic: the same
///   events in the same order produce the same items.
/// - Events the projector does not care about yield no keys from
///   [`affected_keys`](MultiProjector::affected_keys).
pub trait MultiProjector: Send + Sync + 'static {
    /// Item key.
    type Key: Eq + Hash + Clone + Send + Sync + 'static;

    /// Item value.
    type Value: Clone + Send + Sync + 'static;

    /// Name used in logs.
    fn name(&self) -> &str;

    /// Keys of the items `event` touches.
    fn affected_keys(&self, event: &Event) -> Vec<Self::Key>;

    /// Fold `event` into one item. `None` removes the item.
    fn project(
        &self,
        key: &Self::Key,
        current: Option<&Self::Value>,
        event: &Event,
    ) -> Option<Self::Value>;
}

/// Every tag of one group, each projected through tag projector `P`.
///
/// Items whose state reports [`TagProjector::is_deleted`] are removed.
///
/// # Examples
///
/// ```
/// use eventfold_dcb::{Event, MultiProjector, TagGroupProjector, TagProjector};
///
/// struct Seen;
///
/// impl TagProjector for Seen {
///     const NAME: &'static str = "Seen";
///     type State = u32;
///
///     fn project(state: u32, _event: &Event) -> u32 {
///         state + 1
///     }
/// }
///
/// let rooms = TagGroupProjector::<Seen>::new("ClassRoom");
/// assert_eq!(rooms.name(), "ClassRoom:Seen");
/// ```
pub struct TagGroupProjector<P> {
    group: String,
    name: String,
    _projector: PhantomData<fn() -> P>,
}

impl<P: TagProjector> TagGroupProjector<P> {
    pub fn new(group: impl Into<String>) -> Self {
        let group = group.into();
        let name = format!("{group}:{}", P::NAME);
        Self {
            group,
            name,
            _projector: PhantomData,
        }
    }

    /// The tag group this projector covers.
    pub fn group(&self) -> &str {
        &self.group
    }
}

impl<P: TagProjector> MultiProjector for TagGroupProjector<P> {
    type Key = Tag;
    type Value = P::State;

    fn name(&self) -> &str {
        &self.name
    }

    fn affected_keys(&self, event: &Event) -> Vec<Tag> {
        event
            .tags
            .iter()
            .filter(|tag| tag.is_in_group(&self.group))
            .cloned()
            .collect()
    }

    fn project(&self, _key: &Tag, current: Option<&P::State>, event: &Event) -> Option<P::State> {
        let next = P::project(current.cloned().unwrap_or_default(), event);
        (!P::is_deleted(&next)).then_some(next)
    }
}

/// Drives one [`MultiProjector`] over an [`EventStore`].
///
/// Folded events are remembered by id down to a horizon one safe window
/// below the threshold, so redelivery from a catch-up page or a live feed
/// is a no-op while an event committed late, beneath the threshold, is
/// still folded. Events at or below the horizon are dropped with a warning.
pub struct MultiProjectionRunner<M: MultiProjector> {
    projector: M,
    state: SafeUnsafeProjectionState<M::Key, M::Value>,
    store: Arc<dyn EventStore>,
    safe_window: Duration,
    /// Greatest folded position that is below the threshold.
    cursor: Option<SortableUniqueId>,
    /// Positions at or below this are no longer tracked.
    horizon: Option<SortableUniqueId>,
    /// Folded events above the horizon.
    folded: BTreeSet<(SortableUniqueId, Uuid)>,
}

impl<M: MultiProjector> MultiProjectionRunner<M> {
    /// Create a runner with empty state.
    ///
    /// # Arguments
    ///
    /// * `projector` - The read model to drive.
    /// * `store` - Source of catch-up reads.
    /// * `safe_window` - How far behind "now" the safe threshold trails.
    pub fn new(projector: M, store: Arc<dyn EventStore>, safe_window: Duration) -> Self {
        Self {
            projector,
            state: SafeUnsafeProjectionState::new(),
            store,
            safe_window,
            cursor: None,
            horizon: None,
            folded: BTreeSet::new(),
        }
    }

    /// Fold one event. Returns `false` if it was already folded or is
    /// older than the horizon.
    pub fn apply_event(&mut self, event: &Event) -> bool {
        let position = &event.sortable_unique_id;
        if let Some(horizon) = &self.horizon
            && position <= horizon
        {
            tracing::warn!(
                projector = self.projector.name(),
                event_id = %event.id,
                position = %position,
                "event older than the tracked horizon dropped"
            );
            return false;
        }
        if !self.folded.insert((position.clone(), event.id)) {
            return false;
        }
        let projector = &self.projector;
        self.state.process_event(
            event,
            |e| projector.affected_keys(e),
            |key, current, e| projector.project(key, current, e),
        );
        true
    }

    /// Read and fold every event above the horizon that is not folded yet.
    ///
    /// Returns the number of newly folded events.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if a store read fails. Events folded before
    /// the failure stay folded.
    pub async fn catch_up(&mut self) -> Result<usize, StoreError> {
        let mut since = self.horizon.clone();
        let mut applied = 0;
        loop {
            let page = self
                .store
                .read_all_events(since.as_ref(), Some(CATCH_UP_PAGE_SIZE))
                .await?;
            for event in &page {
                if self.apply_event(event) {
                    applied += 1;
                }
            }
            match page.last() {
                Some(last) if page.len() == CATCH_UP_PAGE_SIZE => {
                    since = Some(last.sortable_unique_id.clone());
                }
                _ => break,
            }
        }
        tracing::debug!(projector = self.projector.name(), applied, "caught up");
        Ok(applied)
    }

    /// Move the safe threshold to `now - safe_window` and the horizon one
    /// more window back.
    ///
    /// Returns `true` if the threshold moved.
    pub fn advance_threshold(&mut self, now: SystemTime) -> bool {
        let at = now.checked_sub(self.safe_window).unwrap_or(UNIX_EPOCH);
        let threshold = SortableUniqueId::floor(at);
        let projector = &self.projector;
        let moved = self.state.update_safe_window_threshold(
            threshold.clone(),
            |e| projector.affected_keys(e),
            |key, current, e| projector.project(key, current, e),
        );
        if moved {
            if let Some((last, _)) = self.folded.range(..(threshold, Uuid::nil())).next_back() {
                self.cursor = Some(last.clone());
            }
            let horizon = SortableUniqueId::floor(
                at.checked_sub(self.safe_window).unwrap_or(UNIX_EPOCH),
            );
            self.folded.retain(|(position, _)| position > &horizon);
            self.horizon = Some(horizon);
        }
        moved
    }

    /// The projected items.
    pub fn state(&self) -> &SafeUnsafeProjectionState<M::Key, M::Value> {
        &self.state
    }

    pub fn projector(&self) -> &M {
        &self.projector
    }

    /// Greatest frozen position, `None` before the first prune.
    pub fn cursor(&self) -> Option<&SortableUniqueId> {
        self.cursor.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projector::test_fixtures::{
        ClassRoom, ClassRoomEvent, ClassRoomProjector, classroom_event, tag,
    };
    use crate::store::InMemoryEventStore;

    fn runner(
        store: Arc<InMemoryEventStore>,
        window: Duration,
    ) -> MultiProjectionRunner<TagGroupProjector<ClassRoomProjector>> {
        MultiProjectionRunner::new(TagGroupProjector::new("ClassRoom"), store, window)
    }

    async fn write(store: &InMemoryEventStore, event: ClassRoomEvent, tags: &[&str]) -> Event {
        let event = classroom_event(&event, tags);
        store
            .write_events(vec![event.clone()])
            .await
            .expect("write should succeed");
        event
    }

    #[tokio::test]
    async fn catch_up_folds_group_tags_only() {
        let store = Arc::new(InMemoryEventStore::new());
        write(&store, ClassRoomEvent::Created { capacity: 2 }, &["ClassRoom:1"]).await;
        write(&store, ClassRoomEvent::Created { capacity: 5 }, &["ClassRoom:2"]).await;
        write(
            &store,
            ClassRoomEvent::StudentEnrolled {
                student_id: "s1".into(),
            },
            &["ClassRoom:1", "Student:s1"],
        )
        .await;

        let mut runner = runner(store, Duration::from_secs(20));
        assert_eq!(runner.catch_up().await.expect("catch up"), 3);
        let items = runner.state().get_current_state();
        assert_eq!(items.len(), 2);
        let room: &ClassRoom = items[&tag("ClassRoom:1")];
        assert_eq!(room.enrolled, vec!["s1".to_owned()]);

        // Nothing new: a second pass is a no-op.
        assert_eq!(runner.catch_up().await.expect("catch up"), 0);
    }

    #[tokio::test]
    async fn deleted_items_are_removed() {
        let store = Arc::new(InMemoryEventStore::new());
        write(&store, ClassRoomEvent::Created { capacity: 2 }, &["ClassRoom:1"]).await;
        write(&store, ClassRoomEvent::Deleted, &["ClassRoom:1"]).await;

        let mut runner = runner(store, Duration::ZERO);
        runner.catch_up().await.expect("catch up");
        assert!(runner.state().is_empty());
    }

    #[tokio::test]
    async fn advancing_threshold_freezes_and_prunes() {
        let store = Arc::new(InMemoryEventStore::new());
        let created = write(&store, ClassRoomEvent::Created { capacity: 2 }, &["ClassRoom:1"]).await;

        let mut runner = runner(store.clone(), Duration::ZERO);
        runner.catch_up().await.expect("catch up");
        assert!(runner.state().is_item_unsafe(&tag("ClassRoom:1")));

        assert!(runner.advance_threshold(SystemTime::now() + Duration::from_secs(1)));
        assert!(!runner.state().is_item_unsafe(&tag("ClassRoom:1")));
        assert_eq!(runner.cursor(), Some(&created.sortable_unique_id));

        // Redelivery of a frozen event is ignored.
        assert!(!runner.apply_event(&created));
        assert_eq!(runner.catch_up().await.expect("catch up"), 0);
    }

    /// A room-creation event positioned `secs` after `base`.
    fn created_at(base: SystemTime, secs: u64, room: &str) -> Event {
        let mut event = classroom_event(&ClassRoomEvent::Created { capacity: 1 }, &[room]);
        event.sortable_unique_id =
            SortableUniqueId::generate(base + Duration::from_secs(secs), event.id);
        event
    }

    #[tokio::test]
    async fn late_event_below_the_threshold_is_still_folded() {
        let base = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let store = Arc::new(InMemoryEventStore::new());
        let early = created_at(base, 20, "ClassRoom:1");
        let recent = created_at(base, 40, "ClassRoom:2");
        store
            .write_events(vec![early.clone(), recent])
            .await
            .expect("write should succeed");

        let mut runner = runner(Arc::clone(&store), Duration::from_secs(20));
        assert_eq!(runner.catch_up().await.expect("catch up"), 2);
        assert!(runner.advance_threshold(base + Duration::from_secs(50)));
        assert_eq!(runner.cursor(), Some(&early.sortable_unique_id));

        // Committed after the threshold moved, positioned beneath it.
        let late = created_at(base, 25, "ClassRoom:3");
        store
            .write_events(vec![late.clone()])
            .await
            .expect("write should succeed");
        assert_eq!(runner.catch_up().await.expect("catch up"), 1);
        assert_eq!(runner.state().len(), 3);
        assert!(!runner.state().is_item_unsafe(&tag("ClassRoom:3")));
        assert!(!runner.apply_event(&late), "already folded");

        // Pushed by a live feed rather than paged.
        let pushed = created_at(base, 28, "ClassRoom:4");
        assert!(runner.apply_event(&pushed));
        assert_eq!(runner.state().len(), 4);

        // Older than the horizon: dropped.
        let ancient = created_at(base, 5, "ClassRoom:5");
        assert!(!runner.apply_event(&ancient));
        assert_eq!(runner.state().len(), 4);
    }

    #[tokio::test]
    async fn pushed_and_paged_events_are_not_folded_twice() {
        let store = Arc::new(InMemoryEventStore::new());
        let created = write(&store, ClassRoomEvent::Created { capacity: 2 }, &["ClassRoom:1"]).await;
        let enrolled = write(
            &store,
            ClassRoomEvent::StudentEnrolled {
                student_id: "s1".into(),
            },
            &["ClassRoom:1"],
        )
        .await;

        let mut runner = runner(store, Duration::from_secs(20));
        assert!(runner.apply_event(&enrolled));
        assert!(runner.apply_event(&created));
        assert_eq!(runner.catch_up().await.expect("catch up"), 0);

        let room = runner.state().get(&tag("ClassRoom:1")).expect("room");
        assert_eq!(room.capacity, 2);
        assert_eq!(room.enrolled.len(), 1);
    }

    #[test]
    fn tag_group_projector_names_group_and_projector() {
        let projector = TagGroupProjector::<ClassRoomProjector>::new("ClassRoom");
        assert_eq!(projector.name(), "ClassRoom:ClassRoomProjector");
        assert_eq!(projector.group(), "ClassRoom");
    }
}
