//! Append-only tagged event store.
//!
//! [`EventStore`] is the persistence contract every backend implements:
//! a global log ordered by [`SortableUniqueId`] plus a per-tag index of
//! [`TagStream`] rows. [`InMemoryEventStore`] is the reference backend. It
//! guards both indices with a single lock, so writers are serialized
//! against each other and readers always copy a consistent snapshot.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast};
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use uuid::Uuid;

use crate::error::StoreError;
use crate::event::{Event, TagStream, TagWriteResult};
use crate::sortable_id::SortableUniqueId;
use crate::tag::Tag;

/// Capacity of the commit feed behind [`InMemoryEventStore::subscribe`].
const FEED_CAPACITY: usize = 1024;

/// Everything a successful [`EventStore::write_events`] call produced.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteOutcome {
    /// The written events, in batch order.
    pub events: Vec<Event>,
    /// One entry per distinct tag touched by the batch, in first-seen order.
    pub tag_writes: Vec<TagWriteResult>,
    /// Number of events in the store after the write.
    pub global_position: u64,
}

/// Cheap, projector-agnostic summary of a tag's stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestTag {
    /// The tag.
    pub tag: Tag,
    /// Number of [`TagStream`] rows for the tag.
    pub version: u64,
    /// Position of the latest event carrying the tag.
    pub last_sortable_unique_id: SortableUniqueId,
}

/// One entry of [`EventStore::get_all_tags`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagInfo {
    /// The tag.
    pub tag: Tag,
    /// Number of events carrying the tag.
    pub event_count: u64,
    /// Position of the earliest event carrying the tag.
    pub first_sortable_unique_id: SortableUniqueId,
    /// Position of the latest event carrying the tag.
    pub last_sortable_unique_id: SortableUniqueId,
}

/// Persistence contract for tagged events.
///
/// Every read returns events in ascending [`SortableUniqueId`] order and
/// every `since` bound is exclusive. A batch passed to
/// [`write_events`](EventStore::write_events) must become visible to
/// readers atomically.
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Read the global log.
    ///
    /// # Arguments
    ///
    /// * `since` - Only return events strictly after this position.
    /// * `max_count` - Return at most this many events.
    async fn read_all_events(
        &self,
        since: Option<&SortableUniqueId>,
        max_count: Option<usize>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Read the events carrying `tag`, strictly after `since` if given.
    async fn read_events_by_tag(
        &self,
        tag: &Tag,
        since: Option<&SortableUniqueId>,
    ) -> Result<Vec<Event>, StoreError>;

    /// Read a single event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::EventNotFound`] if no such event exists.
    async fn read_event(&self, id: Uuid) -> Result<Event, StoreError>;

    /// Append a batch of events atomically.
    ///
    /// One [`TagStream`] row is added per distinct `(event, tag)` pair. The
    /// returned [`TagWriteResult::version`] for each tag is its row count
    /// after the write.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::DuplicateEvent`] if an event id already
    /// exists, or [`StoreError::WriteFailure`] if the backend rejects the
    /// batch. Nothing is written in either case.
    async fn write_events(&self, events: Vec<Event>) -> Result<WriteOutcome, StoreError>;

    /// All index rows for `tag`, in append order. Empty if the tag was
    /// never written.
    async fn read_tag_streams(&self, tag: &Tag) -> Result<Vec<TagStream>, StoreError>;

    /// Latest position and row count for `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::TagNotFound`] if the tag was never written.
    async fn get_latest_tag_state(&self, tag: &Tag) -> Result<LatestTag, StoreError>;

    /// `true` if at least one event carries `tag`.
    async fn tag_exists(&self, tag: &Tag) -> Result<bool, StoreError>;

    /// Number of events strictly after `since`, or in total.
    async fn get_event_count(&self, since: Option<&SortableUniqueId>) -> Result<u64, StoreError>;

    /// Summaries of every written tag, optionally restricted to one group,
    /// sorted by group then content.
    async fn get_all_tags(&self, group: Option<&str>) -> Result<Vec<TagInfo>, StoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    /// Global log, kept sorted by `sortable_unique_id`. Ties keep write
    /// order.
    events: Vec<Event>,
    /// Event id to position, for duplicate detection and point reads.
    positions: HashMap<Uuid, SortableUniqueId>,
    /// Per-tag index rows in append order.
    tag_streams: HashMap<Tag, Vec<TagStream>>,
}

impl Inner {
    /// Index of the first event strictly after `since`.
    fn start_after(&self, since: Option<&SortableUniqueId>) -> usize {
        match since {
            Some(since) => self
                .events
                .partition_point(|e| &e.sortable_unique_id <= since),
            None => 0,
        }
    }
}

/// In-process [`EventStore`] backed by a single `RwLock`.
///
/// Every committed event is also published on a broadcast feed, see
/// [`subscribe`](InMemoryEventStore::subscribe).
#[derive(Debug)]
pub struct InMemoryEventStore {
    inner: RwLock<Inner>,
    feed: broadcast::Sender<Event>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: RwLock::new(Inner::default()),
            feed,
        }
    }

    /// Subscribe to events committed from now on, in commit order.
    ///
    /// Commit order is not necessarily [`SortableUniqueId`] order: a
    /// writer that generated its id earlier may commit later.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            inner: BroadcastStream::new(self.feed.subscribe()),
        }
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn read_all_events(
        &self,
        since: Option<&SortableUniqueId>,
        max_count: Option<usize>,
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read().await;
        let start = inner.start_after(since);
        let tail = &inner.events[start..];
        let take = max_count.unwrap_or(tail.len()).min(tail.len());
        Ok(tail[..take].to_vec())
    }

    async fn read_events_by_tag(
        &self,
        tag: &Tag,
        since: Option<&SortableUniqueId>,
    ) -> Result<Vec<Event>, StoreError> {
        let inner = self.inner.read().await;
        if !inner.tag_streams.contains_key(tag) {
            return Ok(Vec::new());
        }
        let start = inner.start_after(since);
        Ok(inner.events[start..]
            .iter()
            .filter(|e| e.has_tag(tag))
            .cloned()
            .collect())
    }

    async fn read_event(&self, id: Uuid) -> Result<Event, StoreError> {
        let inner = self.inner.read().await;
        let position = inner
            .positions
            .get(&id)
            .ok_or(StoreError::EventNotFound(id))?;
        let start = inner
            .events
            .partition_point(|e| &e.sortable_unique_id < position);
        inner.events[start..]
            .iter()
            .take_while(|e| &e.sortable_unique_id == position)
            .find(|e| e.id == id)
            .cloned()
            .ok_or(StoreError::EventNotFound(id))
    }

    async fn write_events(&self, events: Vec<Event>) -> Result<WriteOutcome, StoreError> {
        let mut inner = self.inner.write().await;

        // Validate the whole batch before touching anything.
        let mut batch_ids = HashSet::with_capacity(events.len());
        for event in &events {
            if inner.positions.contains_key(&event.id) || !batch_ids.insert(event.id) {
                return Err(StoreError::DuplicateEvent(event.id));
            }
        }

        let mut touched: Vec<Tag> = Vec::new();
        for event in &events {
            let at = inner
                .events
                .partition_point(|e| e.sortable_unique_id <= event.sortable_unique_id);
            inner.events.insert(at, event.clone());
            inner
                .positions
                .insert(event.id, event.sortable_unique_id.clone());

            let mut indexed: Vec<&Tag> = Vec::with_capacity(event.tags.len());
            for tag in &event.tags {
                if indexed.contains(&tag) {
                    continue;
                }
                indexed.push(tag);
                inner
                    .tag_streams
                    .entry(tag.clone())
                    .or_default()
                    .push(TagStream {
                        tag: tag.clone(),
                        event_id: event.id,
                        sortable_unique_id: event.sortable_unique_id.clone(),
                    });
                if !touched.contains(tag) {
                    touched.push(tag.clone());
                }
            }
        }

        let timestamp = SystemTime::now();
        let tag_writes = touched
            .into_iter()
            .map(|tag| {
                let version = inner.tag_streams.get(&tag).map_or(0, Vec::len) as u64;
                TagWriteResult {
                    tag,
                    version,
                    timestamp,
                }
            })
            .collect();
        let global_position = inner.events.len() as u64;

        // Publish while still holding the lock so subscribers observe
        // commit order.
        for event in &events {
            // No subscribers is fine.
            let _ = self.feed.send(event.clone());
        }
        drop(inner);

        tracing::debug!(count = events.len(), global_position, "events written");

        Ok(WriteOutcome {
            events,
            tag_writes,
            global_position,
        })
    }

    async fn read_tag_streams(&self, tag: &Tag) -> Result<Vec<TagStream>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.tag_streams.get(tag).cloned().unwrap_or_default())
    }

    async fn get_latest_tag_state(&self, tag: &Tag) -> Result<LatestTag, StoreError> {
        let inner = self.inner.read().await;
        let streams = inner
            .tag_streams
            .get(tag)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| StoreError::TagNotFound(tag.to_string()))?;
        // Append order and id order coincide for reserved writes; take the
        // maximum so a late unreserved write cannot move the position back.
        let last = streams
            .iter()
            .map(|s| &s.sortable_unique_id)
            .max()
            .ok_or_else(|| StoreError::TagNotFound(tag.to_string()))?;
        Ok(LatestTag {
            tag: tag.clone(),
            version: streams.len() as u64,
            last_sortable_unique_id: last.clone(),
        })
    }

    async fn tag_exists(&self, tag: &Tag) -> Result<bool, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.tag_streams.get(tag).is_some_and(|s| !s.is_empty()))
    }

    async fn get_event_count(&self, since: Option<&SortableUniqueId>) -> Result<u64, StoreError> {
        let inner = self.inner.read().await;
        Ok((inner.events.len() - inner.start_after(since)) as u64)
    }

    async fn get_all_tags(&self, group: Option<&str>) -> Result<Vec<TagInfo>, StoreError> {
        let inner = self.inner.read().await;
        let mut tags: Vec<TagInfo> = inner
            .tag_streams
            .iter()
            .filter(|(tag, _)| group.is_none_or(|g| tag.is_in_group(g)))
            .filter_map(|(tag, streams)| {
                let first = streams.iter().map(|s| &s.sortable_unique_id).min()?;
                let last = streams.iter().map(|s| &s.sortable_unique_id).max()?;
                Some(TagInfo {
                    tag: tag.clone(),
                    event_count: streams.len() as u64,
                    first_sortable_unique_id: first.clone(),
                    last_sortable_unique_id: last.clone(),
                })
            })
            .collect();
        tags.sort_by(|a, b| a.tag.cmp(&b.tag));
        Ok(tags)
    }
}

/// Stream of events committed to an [`InMemoryEventStore`].
///
/// A subscriber that falls more than the feed capacity behind skips the
/// overflow. The skip is logged, and consumers that need every event
/// should re-read the store.
#[derive(Debug)]
pub struct EventSubscription {
    inner: BroadcastStream<Event>,
}

impl Stream for EventSubscription {
    type Item = Result<Event, SubscriptionLagged>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
            Some(Ok(event)) => Poll::Ready(Some(Ok(event))),
            Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                tracing::warn!(skipped, "event subscription lagged");
                Poll::Ready(Some(Err(SubscriptionLagged { skipped })))
            }
            None => Poll::Ready(None),
        }
    }
}

/// A subscriber fell behind and `skipped` events were dropped from its
/// feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event subscription skipped {skipped} events")]
pub struct SubscriptionLagged {
    /// Number of dropped events.
    pub skipped: u64,
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, UNIX_EPOCH};

    use tokio_stream::StreamExt;

    use super::*;
    use crate::event::EventMetadata;

    fn tag(s: &str) -> Tag {
        Tag::parse(s).expect("valid tag")
    }

    fn event(tags: &[&str]) -> Event {
        Event::new(
            "Happened",
            serde_json::json!({ "n": 1 }),
            tags.iter().map(|t| tag(t)).collect(),
            EventMetadata::default(),
        )
    }

    fn event_at(secs: u64, tags: &[&str]) -> Event {
        event(tags).with_sortable_unique_id(SortableUniqueId::generate(
            UNIX_EPOCH + Duration::from_secs(secs),
            Uuid::new_v4(),
        ))
    }

    #[tokio::test]
    async fn written_event_is_readable_by_tag_and_latest_state() {
        let store = InMemoryEventStore::new();
        let e1 = event(&["Student:123"]);
        let outcome = store
            .write_events(vec![e1.clone()])
            .await
            .expect("write should succeed");
        assert_eq!(outcome.global_position, 1);
        assert_eq!(outcome.tag_writes.len(), 1);
        assert_eq!(outcome.tag_writes[0].version, 1);

        let by_tag = store
            .read_events_by_tag(&tag("Student:123"), None)
            .await
            .expect("read should succeed");
        assert_eq!(by_tag, vec![e1.clone()]);

        let latest = store
            .get_latest_tag_state(&tag("Student:123"))
            .await
            .expect("latest should succeed");
        assert_eq!(latest.version, 1);
        assert_eq!(latest.last_sortable_unique_id, e1.sortable_unique_id);
    }

    #[tokio::test]
    async fn read_all_is_sorted_even_when_written_out_of_order() {
        let store = InMemoryEventStore::new();
        let late = event_at(30, &["A:1"]);
        let early = event_at(10, &["A:1"]);
        let middle = event_at(20, &["B:1"]);
        store.write_events(vec![late.clone()]).await.expect("write");
        store
            .write_events(vec![early.clone(), middle.clone()])
            .await
            .expect("write");

        let all = store.read_all_events(None, None).await.expect("read");
        let ids: Vec<_> = all.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![early.id, middle.id, late.id]);

        let a_only = store
            .read_events_by_tag(&tag("A:1"), None)
            .await
            .expect("read");
        let ids: Vec<_> = a_only.iter().map(|e| e.id).collect();
        assert_eq!(ids, vec![early.id, late.id]);
    }

    #[tokio::test]
    async fn since_is_exclusive_and_reads_are_repeatable() {
        let store = InMemoryEventStore::new();
        let events: Vec<_> = (1..=4).map(|s| event_at(s, &["A:1"])).collect();
        store.write_events(events.clone()).await.expect("write");

        let since = &events[1].sortable_unique_id;
        let first = store.read_all_events(Some(since), None).await.expect("read");
        let second = store.read_all_events(Some(since), None).await.expect("read");
        assert_eq!(first, second);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].id, events[2].id);
        assert_eq!(
            store.get_event_count(Some(since)).await.expect("count"),
            2
        );
    }

    #[tokio::test]
    async fn max_count_limits_page() {
        let store = InMemoryEventStore::new();
        let events: Vec<_> = (1..=5).map(|s| event_at(s, &["A:1"])).collect();
        store.write_events(events.clone()).await.expect("write");

        let page = store.read_all_events(None, Some(2)).await.expect("read");
        assert_eq!(page.len(), 2);
        let next = store
            .read_all_events(Some(&page[1].sortable_unique_id), Some(10))
            .await
            .expect("read");
        assert_eq!(next.len(), 3);
    }

    #[tokio::test]
    async fn version_counts_rows_and_duplicate_tags_index_once() {
        let store = InMemoryEventStore::new();
        store
            .write_events(vec![event(&["A:1", "A:1", "B:1"])])
            .await
            .expect("write");
        let outcome = store
            .write_events(vec![event(&["A:1"]), event(&["A:1"])])
            .await
            .expect("write");
        assert_eq!(outcome.tag_writes.len(), 1);
        assert_eq!(outcome.tag_writes[0].version, 3);

        let streams = store.read_tag_streams(&tag("A:1")).await.expect("read");
        assert_eq!(streams.len(), 3);
        assert!(
            store
                .read_tag_streams(&tag("Z:9"))
                .await
                .expect("read")
                .is_empty()
        );
    }

    #[tokio::test]
    async fn duplicate_event_rejects_whole_batch() {
        let store = InMemoryEventStore::new();
        let existing = event(&["A:1"]);
        store.write_events(vec![existing.clone()]).await.expect("write");

        let fresh = event(&["A:1"]);
        let err = store
            .write_events(vec![fresh.clone(), existing.clone()])
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::DuplicateEvent(existing.id));
        assert_eq!(store.get_event_count(None).await.expect("count"), 1);
        assert!(matches!(
            store.read_event(fresh.id).await,
            Err(StoreError::EventNotFound(_))
        ));
    }

    #[tokio::test]
    async fn read_event_finds_by_id() {
        let store = InMemoryEventStore::new();
        let e = event(&["A:1"]);
        store.write_events(vec![e.clone()]).await.expect("write");
        assert_eq!(store.read_event(e.id).await.expect("read"), e);
        let missing = Uuid::new_v4();
        assert_eq!(
            store.read_event(missing).await,
            Err(StoreError::EventNotFound(missing))
        );
    }

    #[tokio::test]
    async fn unknown_tag_is_not_found() {
        let store = InMemoryEventStore::new();
        assert_eq!(
            store.get_latest_tag_state(&tag("Student:404")).await,
            Err(StoreError::TagNotFound("Student:404".into()))
        );
        assert!(!store.tag_exists(&tag("Student:404")).await.expect("exists"));
    }

    #[tokio::test]
    async fn get_all_tags_filters_by_group_and_sorts() {
        let store = InMemoryEventStore::new();
        let first = event_at(1, &["Student:b", "ClassRoom:1"]);
        let second = event_at(2, &["Student:a"]);
        let third = event_at(3, &["Student:b"]);
        store
            .write_events(vec![first.clone(), second, third.clone()])
            .await
            .expect("write");

        let students = store.get_all_tags(Some("Student")).await.expect("tags");
        let names: Vec<String> = students.iter().map(|t| t.tag.to_string()).collect();
        assert_eq!(names, vec!["Student:a", "Student:b"]);
        assert_eq!(students[1].event_count, 2);
        assert_eq!(students[1].first_sortable_unique_id, first.sortable_unique_id);
        assert_eq!(students[1].last_sortable_unique_id, third.sortable_unique_id);

        let all = store.get_all_tags(None).await.expect("tags");
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].tag.to_string(), "ClassRoom:1");
    }

    #[tokio::test]
    async fn subscription_receives_commits_in_order() {
        let store = InMemoryEventStore::new();
        let mut feed = store.subscribe();
        let a = event(&["A:1"]);
        let b = event(&["B:1"]);
        store.write_events(vec![a.clone()]).await.expect("write");
        store.write_events(vec![b.clone()]).await.expect("write");

        let got_a = feed.next().await.expect("item").expect("not lagged");
        let got_b = feed.next().await.expect("item").expect("not lagged");
        assert_eq!(got_a.id, a.id);
        assert_eq!(got_b.id, b.id);
    }
}
