//! # Partition Subscriptions
//!
//! The engine does not read the event store itself. It asks a
//! [`PartitionSubscriber`] for a subscription per partition and receives
//! ordered batches through a [`BatchSink`].
//!
//! ```text
//!   QueryEngine                      PartitionSubscriber
//!       │   subscribe(schema, p, sink)        │
//!       │────────────────────────────────────▶│
//!       │                                     │  catch-up batch
//!       │◀──────────── sink.deliver ──────────│
//!       │◀──────────── Ok(handle) ────────────│  (live from here)
//!       │                                     │
//!       │◀──────────── sink.deliver ──────────│  live batches, in order
//! ```
//!
//! ## Contract
//!
//! - `subscribe` resolves only after the catch-up batch was delivered and the
//!   live tail is attached. The engine reads the model for a new live query's
//!   initial result right after, so an early return would lose events.
//! - Batches for one partition are delivered one at a time, in append order.
//! - Dropping or closing the [`SubscriptionHandle`] stops delivery.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::BoxFuture;

use crate::error::Result;
use crate::schema::ProjectionSchema;
use crate::types::{EventEnvelope, GlobalPos, PartitionId};

/// Receives ordered event batches for one partition.
pub trait BatchSink: Send + Sync + 'static {
    /// Applies a batch. The subscriber awaits it before delivering the next.
    fn deliver(&self, batch: Vec<EventEnvelope>) -> BoxFuture<'_, ()>;
}

/// Opens partition subscriptions on an event store.
pub trait PartitionSubscriber: Send + Sync + 'static {
    /// Subscribes `sink` to the stream of `partition` for `schema`.
    ///
    /// Resolves once the subscription is live.
    fn subscribe(
        &self,
        schema: Arc<ProjectionSchema>,
        partition: PartitionId,
        sink: Arc<dyn BatchSink>,
    ) -> BoxFuture<'_, Result<SubscriptionHandle>>;
}

type Stopper = Box<dyn FnOnce() + Send>;

/// An open partition subscription.
///
/// Closing is idempotent; dropping the handle closes it.
pub struct SubscriptionHandle {
    partition: PartitionId,
    live_from: Option<GlobalPos>,
    stopper: Mutex<Option<Stopper>>,
}

impl SubscriptionHandle {
    /// Creates a handle; `stop` runs once when the handle is closed.
    pub fn new(partition: PartitionId, live_from: Option<GlobalPos>, stop: impl FnOnce() + Send + 'static) -> Self {
        Self {
            partition,
            live_from,
            stopper: Mutex::new(Some(Box::new(stop))),
        }
    }

    /// The subscribed partition.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// Position of the last event delivered during catch-up, if any.
    pub fn live_from(&self) -> Option<GlobalPos> {
        self.live_from
    }

    /// Returns true once closed.
    pub fn is_closed(&self) -> bool {
        self.stopper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Stops delivery.
    pub fn close(&self) {
        let stop = self.stopper.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(stop) = stop {
            tracing::debug!(partition = %self.partition, "subscription closed");
            stop();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("partition", &self.partition)
            .field("live_from", &self.live_from)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_close_runs_stopper_once() {
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stops);
        let handle = SubscriptionHandle::new(PartitionId::Root, Some(GlobalPos::from_raw(3)), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!handle.is_closed());
        assert_eq!(handle.live_from(), Some(GlobalPos::from_raw(3)));

        handle.close();
        handle.close();
        assert!(handle.is_closed());
        drop(handle);

        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_closes() {
        let stops = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&stops);
        drop(SubscriptionHandle::new(PartitionId::Root, None, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(stops.load(Ordering::SeqCst), 1);
    }
}
