//! # In-Memory Event Store
//!
//! A [`PartitionSubscriber`] backed by an append-only log held in memory.
//! It is the store the integration tests and the stress binary run the
//! engine against.
//!
//! ## Streams
//!
//! Every projection reads one root stream plus one stream per partition:
//!
//! ```text
//!   root:       {projection}Projection-{typeset hash}
//!   partition:  {projection}ProjectionPartition-{partition key}
//! ```
//!
//! An event appended to a partition stream is delivered only to that
//! partition's subscription.
//!
//! ## The Catch-Up + Live Handoff
//!
//! ```text
//!   subscribe()
//!     │
//!     ├─ lock log ─┬─ attach broadcast receiver
//!     │            └─ snapshot stream history        (no append can interleave)
//!     ├─ deliver history as one batch, await it       (catch-up)
//!     ├─ spawn tail task ── recv ─▶ filter stream ─▶ skip pos <= live_from ─▶ deliver
//!     └─ resolve Ok(handle)                            (live)
//! ```
//!
//! Appends broadcast while holding the log lock, so every event lands either
//! in the snapshot or in the receiver, never both and never neither.
//!
//! ## Backpressure
//!
//! The broadcast channel is bounded and shared by every stream, so traffic
//! on other partitions can push a slow tail past its capacity. A tail that
//! gets `RecvError::Lagged` re-attaches to the channel and re-reads its
//! stream from the log, both under the log lock:
//!
//! ```text
//!   Lagged(n) ─▶ lock log ─┬─ resubscribe receiver
//!                          └─ collect stream events after last_delivered
//!               deliver them as one batch, resume recv
//! ```
//!
//! Events buffered in both places are dropped by the `last_delivered` check.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::schema::ProjectionSchema;
use crate::subscriber::{BatchSink, PartitionSubscriber, SubscriptionHandle};
use crate::types::{Event, EventEnvelope, EventMetadata, GlobalPos, PartitionId};

// =============================================================================
// Configuration
// =============================================================================

/// Default capacity for the broadcast channel.
///
/// This determines how many events can be buffered before slow tails start
/// lagging.
pub const DEFAULT_BROADCAST_CAPACITY: usize = 10_000;

/// Maximum number of live events handed to a sink in one batch.
pub const DEFAULT_LIVE_BATCH_SIZE: usize = 256;

// =============================================================================
// Stream Names
// =============================================================================

/// Name of one stream of a projection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamName(String);

impl StreamName {
    /// The stream a subscription to `partition` of `schema` reads.
    pub fn for_partition(schema: &ProjectionSchema, partition: PartitionId) -> Self {
        match partition {
            PartitionId::Root => Self(format!("{}Projection-{}", schema.name, schema.hash())),
            PartitionId::Keyed(key) => Self(format!("{}ProjectionPartition-{}", schema.name, key)),
        }
    }

    /// Returns the name as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns a 64-bit XXH3 hash of the name.
    pub fn hash(&self) -> u64 {
        xxhash_rust::xxh3::xxh3_64(self.0.as_bytes())
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event broadcast to tails after it was appended.
#[derive(Debug, Clone)]
struct StoredEvent {
    stream: StreamName,
    envelope: EventEnvelope,
}

// =============================================================================
// Store
// =============================================================================

struct StoreState {
    log: Vec<StoredEvent>,
    head: Option<GlobalPos>,
}

/// Append-only in-memory event log with partition subscriptions.
pub struct InMemoryEventStore {
    state: Arc<Mutex<StoreState>>,
    broadcast_tx: broadcast::Sender<StoredEvent>,
    opened: AtomicUsize,
    active: Arc<AtomicUsize>,
    failures: AtomicUsize,
    subscribe_delay: Mutex<Option<Duration>>,
}

impl InMemoryEventStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BROADCAST_CAPACITY)
    }

    /// Creates an empty store whose broadcast channel holds `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(capacity.max(1));

        Self {
            state: Arc::new(Mutex::new(StoreState {
                log: Vec::new(),
                head: None,
            })),
            broadcast_tx,
            opened: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            failures: AtomicUsize::new(0),
            subscribe_delay: Mutex::new(None),
        }
    }

    /// Appends `event` to the stream of `partition` and broadcasts it.
    pub fn append<E: Event>(&self, schema: &ProjectionSchema, partition: PartitionId, event: E) -> GlobalPos {
        self.append_with(schema, partition, event, |metadata| metadata)
    }

    /// Appends `event`, letting `metadata` adjust the stored metadata
    /// (correlation and causation ids).
    pub fn append_with<E, F>(&self, schema: &ProjectionSchema, partition: PartitionId, event: E, metadata: F) -> GlobalPos
    where
        E: Event,
        F: FnOnce(EventMetadata) -> EventMetadata,
    {
        let stream = StreamName::for_partition(schema, partition);
        let mut state = self.lock_state();

        let position = state.head.map_or(GlobalPos::FIRST, |head| head.next());
        let mut metadata = metadata(EventMetadata::new(position));
        metadata.position = position;

        let stored = StoredEvent {
            stream,
            envelope: EventEnvelope::new(metadata, event),
        };
        state.log.push(stored.clone());
        state.head = Some(position);

        // No receivers is fine
        let _ = self.broadcast_tx.send(stored);
        position
    }

    /// Returns the envelopes of one stream in append order.
    pub fn read_stream(&self, schema: &ProjectionSchema, partition: PartitionId) -> Vec<EventEnvelope> {
        let stream = StreamName::for_partition(schema, partition);
        self.lock_state()
            .log
            .iter()
            .filter(|stored| stored.stream == stream)
            .map(|stored| stored.envelope.clone())
            .collect()
    }

    /// Position of the last appended event.
    pub fn head(&self) -> Option<GlobalPos> {
        self.lock_state().head
    }

    /// Number of subscriptions opened so far.
    pub fn subscription_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    /// Number of tails currently running.
    pub fn active_subscriptions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Makes the next `count` subscription attempts fail.
    pub fn fail_next_subscriptions(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Delays every subscription attempt before it reads history.
    pub fn set_subscribe_delay(&self, delay: Option<Duration>) {
        *self.subscribe_delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    fn lock_state(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn open(&self, schema: Arc<ProjectionSchema>, partition: PartitionId, sink: Arc<dyn BatchSink>) -> Result<SubscriptionHandle> {
        let delay = *self.subscribe_delay.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.take_failure() {
            return Err(Error::SubscriptionFailed {
                partition,
                reason: "store rejected the subscription".to_string(),
            });
        }

        let stream = StreamName::for_partition(&schema, partition);

        // Receiver and snapshot under one lock
        let (receiver, history) = {
            let state = self.lock_state();
            let receiver = self.broadcast_tx.subscribe();
            let history: Vec<EventEnvelope> = state
                .log
                .iter()
                .filter(|stored| stored.stream == stream)
                .map(|stored| stored.envelope.clone())
                .collect();
            (receiver, history)
        };

        let live_from = history.last().map(EventEnvelope::position);
        tracing::debug!(
            partition = %partition,
            stream = %stream,
            catch_up = history.len(),
            "subscription catching up"
        );
        if !history.is_empty() {
            sink.deliver(history).await;
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        let tail = Tail {
            partition,
            stream,
            state: Arc::clone(&self.state),
            last_delivered: live_from,
            receiver,
            sink,
            _active: ActiveGuard::new(Arc::clone(&self.active)),
        };
        let task = tokio::spawn(tail.run());

        tracing::debug!(partition = %partition, live_from = ?live_from, "subscription live");
        Ok(SubscriptionHandle::new(partition, live_from, move || task.abort()))
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionSubscriber for InMemoryEventStore {
    fn subscribe(
        &self,
        schema: Arc<ProjectionSchema>,
        partition: PartitionId,
        sink: Arc<dyn BatchSink>,
    ) -> BoxFuture<'_, Result<SubscriptionHandle>> {
        Box::pin(self.open(schema, partition, sink))
    }
}

impl fmt::Debug for InMemoryEventStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventStore")
            .field("head", &self.head())
            .field("subscriptions", &self.subscription_count())
            .field("active", &self.active_subscriptions())
            .finish()
    }
}

// =============================================================================
// Live Tail
// =============================================================================

struct ActiveGuard(Arc<AtomicUsize>);

impl ActiveGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct Tail {
    partition: PartitionId,
    stream: StreamName,
    state: Arc<Mutex<StoreState>>,
    last_delivered: Option<GlobalPos>,
    receiver: broadcast::Receiver<StoredEvent>,
    sink: Arc<dyn BatchSink>,
    _active: ActiveGuard,
}

impl Tail {
    async fn run(mut self) {
        loop {
            let first = match self.receiver.recv().await {
                Ok(stored) => stored,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.catch_up(missed).await;
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return,
            };

            let mut batch = Vec::new();
            self.push_if_new(&mut batch, first);

            // Drain whatever is already buffered into the same batch
            let mut lagged = None;
            while batch.len() < DEFAULT_LIVE_BATCH_SIZE {
                match self.receiver.try_recv() {
                    Ok(stored) => self.push_if_new(&mut batch, stored),
                    Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                        lagged = Some(missed);
                        break;
                    }
                    Err(_) => break,
                }
            }

            if !batch.is_empty() {
                self.sink.deliver(batch).await;
            }

            if let Some(missed) = lagged {
                self.catch_up(missed).await;
            }
        }
    }

    fn push_if_new(&mut self, batch: &mut Vec<EventEnvelope>, stored: StoredEvent) {
        if stored.stream != self.stream {
            return;
        }

        let position = stored.envelope.position();
        if self.last_delivered.is_some_and(|last| position <= last) {
            return;
        }

        self.last_delivered = Some(position);
        batch.push(stored.envelope);
    }

    /// Re-reads the stream from the log after the receiver lagged.
    async fn catch_up(&mut self, missed: u64) {
        let state = Arc::clone(&self.state);
        let batch: Vec<EventEnvelope> = {
            let state = state.lock().unwrap_or_else(PoisonError::into_inner);
            self.receiver = self.receiver.resubscribe();

            let after = self.last_delivered;
            state
                .log
                .iter()
                .filter(|stored| stored.stream == self.stream)
                .map(|stored| &stored.envelope)
                .filter(|envelope| after.map_or(true, |last| envelope.position() > last))
                .cloned()
                .collect()
        };

        tracing::warn!(
            partition = %self.partition,
            stream = %self.stream,
            missed,
            catch_up = batch.len(),
            "subscription lagged behind the store, re-reading the log"
        );

        if let Some(last) = batch.last() {
            self.last_delivered = Some(last.position());
            self.sink.deliver(batch).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::type_set::TypeSet;
    use crate::types::{PartitionKey, TypeKey};
    use uuid::Uuid;

    #[derive(Debug)]
    struct Noted(u32);
    impl Event for Noted {
        const NAME: &'static str = "Noted";
    }

    struct Notes;

    fn schema() -> Arc<ProjectionSchema> {
        Arc::new(ProjectionSchema::new(
            "notes",
            TypeKey::of::<Notes>(),
            TypeSet::new([TypeKey::event::<Noted>()]),
        ))
    }

    #[derive(Default)]
    struct RecordingSink {
        batches: Mutex<Vec<Vec<u64>>>,
        delay: Option<Duration>,
    }

    impl RecordingSink {
        fn positions(&self) -> Vec<u64> {
            self.batches.lock().unwrap().iter().flatten().copied().collect()
        }
    }

    impl BatchSink for RecordingSink {
        fn deliver(&self, batch: Vec<EventEnvelope>) -> BoxFuture<'_, ()> {
            let positions = batch.iter().map(|e| e.position().as_raw()).collect();
            self.batches.lock().unwrap().push(positions);
            let delay = self.delay;
            Box::pin(async move {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
            })
        }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn test_stream_names() {
        let schema = schema();
        let root = StreamName::for_partition(&schema, PartitionId::Root);
        assert_eq!(root.as_str(), format!("notesProjection-{}", schema.hash()));

        let key = PartitionKey::from_uuid(Uuid::nil());
        let keyed = StreamName::for_partition(&schema, PartitionId::Keyed(key));
        assert_eq!(keyed.as_str(), format!("notesProjectionPartition-{}", Uuid::nil()));
        assert_ne!(root.hash(), keyed.hash());
    }

    #[test]
    fn test_append_assigns_increasing_positions() {
        let store = InMemoryEventStore::new();
        let schema = schema();
        let correlation = Uuid::new_v4();

        let first = store.append(&schema, PartitionId::Root, Noted(1));
        let second = store.append_with(&schema, PartitionId::Root, Noted(2), |m| m.with_correlation(correlation));

        assert_eq!(first, GlobalPos::FIRST);
        assert_eq!(second, GlobalPos::from_raw(2));
        assert_eq!(store.head(), Some(second));

        let stream = store.read_stream(&schema, PartitionId::Root);
        assert_eq!(stream.len(), 2);
        assert_eq!(stream[1].metadata.correlation_id, Some(correlation));
        assert_eq!(stream[1].downcast_ref::<Noted>().map(|n| n.0), Some(2));
    }

    #[tokio::test]
    async fn test_subscribe_delivers_history_before_resolving() {
        let store = InMemoryEventStore::new();
        let schema = schema();
        store.append(&schema, PartitionId::Root, Noted(1));
        store.append(&schema, PartitionId::Root, Noted(2));

        let sink = Arc::new(RecordingSink::default());
        let handle = store
            .subscribe(Arc::clone(&schema), PartitionId::Root, sink.clone())
            .await
            .unwrap();

        assert_eq!(sink.positions(), vec![1, 2]);
        assert_eq!(handle.live_from(), Some(GlobalPos::from_raw(2)));
        assert_eq!(store.subscription_count(), 1);
    }

    #[tokio::test]
    async fn test_live_tail_filters_by_stream() {
        let store = InMemoryEventStore::new();
        let schema = schema();
        let partition = PartitionId::Keyed(PartitionKey::new());

        let sink = Arc::new(RecordingSink::default());
        let _handle = store
            .subscribe(Arc::clone(&schema), partition, sink.clone())
            .await
            .unwrap();

        store.append(&schema, PartitionId::Root, Noted(1));
        store.append(&schema, partition, Noted(2));
        store.append(&schema, PartitionId::Keyed(PartitionKey::new()), Noted(3));
        store.append(&schema, partition, Noted(4));

        eventually(|| sink.positions() == vec![2, 4]).await;
    }

    #[tokio::test]
    async fn test_close_stops_tail() {
        let store = InMemoryEventStore::new();
        let schema = schema();
        let sink = Arc::new(RecordingSink::default());

        let handle = store
            .subscribe(Arc::clone(&schema), PartitionId::Root, sink.clone())
            .await
            .unwrap();
        assert_eq!(store.active_subscriptions(), 1);

        handle.close();
        eventually(|| store.active_subscriptions() == 0).await;

        store.append(&schema, PartitionId::Root, Noted(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sink.positions().is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = InMemoryEventStore::new();
        let schema = schema();
        store.fail_next_subscriptions(1);

        let sink = Arc::new(RecordingSink::default());
        let err = store
            .subscribe(Arc::clone(&schema), PartitionId::Root, sink.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::SubscriptionFailed { .. }));
        assert_eq!(store.subscription_count(), 0);

        assert!(store.subscribe(schema, PartitionId::Root, sink).await.is_ok());
    }

    #[tokio::test]
    async fn test_lagging_tail_catches_up_from_log() {
        let store = InMemoryEventStore::with_capacity(2);
        let schema = schema();
        let other = PartitionId::Keyed(PartitionKey::new());

        let sink = Arc::new(RecordingSink {
            delay: Some(Duration::from_millis(30)),
            ..RecordingSink::default()
        });
        let _handle = store
            .subscribe(Arc::clone(&schema), PartitionId::Root, sink.clone())
            .await
            .unwrap();

        store.append(&schema, PartitionId::Root, Noted(0));
        tokio::time::sleep(Duration::from_millis(5)).await;

        // Traffic on another stream overflows the channel as well
        for i in 1..10 {
            store.append(&schema, PartitionId::Root, Noted(i));
            store.append(&schema, other, Noted(i));
        }

        let expected: Vec<u64> = std::iter::once(1).chain((1..10).map(|i| 2 * i)).collect();
        eventually(|| sink.positions() == expected).await;
        assert_eq!(store.active_subscriptions(), 1);

        let next = store.append(&schema, PartitionId::Root, Noted(10));
        eventually(|| sink.positions().last() == Some(&next.as_raw())).await;
    }
}
