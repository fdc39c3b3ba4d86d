//! # Live Queries
//!
//! A [`LiveQuery`] binds one query value to a result that keeps changing as
//! events arrive. The engine owns every live query; callers get a
//! [`LiveResult`] handle to read the current result, observe changes and
//! dispose the query.
//!
//! ## Lifecycle
//!
//! ```text
//!   new()            on_result()             dispose()
//!  ───────▶ Created ────────────▶ Running ──────────────▶ Disposed
//!                                  │   ▲
//!                                  └───┘ on_update()
//! ```
//!
//! Transitions only move forward. `on_result` is accepted exactly once, in
//! `Created`; `on_update` only in `Running`. Anything else is rejected with
//! [`Error::InvalidLiveQueryState`]. `dispose` is idempotent: the disposal
//! callback runs at most once and `StatusChanged(Disposed)` is raised once.
//!
//! ## Notifications
//!
//! Observers call [`LiveQuery::subscribe`] and receive [`LiveQueryEvent`]s over
//! a `tokio::sync::broadcast` channel. Dropping the returned
//! [`LiveQueryChanges`] unsubscribes. Sending never blocks the delivery path;
//! an observer that falls behind sees a single `Lagged` event and can re-read
//! the current result.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::broadcast;

use crate::error::{Error, Result};
use crate::types::{PartitionId, Query};

/// Default capacity of a live query's notification channel.
pub const DEFAULT_NOTIFICATION_CAPACITY: usize = 64;

// =============================================================================
// Identity
// =============================================================================

static NEXT_LIVE_QUERY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identifier of a live query instance.
///
/// Two live queries for equal query values (one disposed, one replacing it)
/// have different ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LiveQueryId(u64);

impl LiveQueryId {
    fn next() -> Self {
        Self(NEXT_LIVE_QUERY_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LiveQueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lq-{}", self.0)
    }
}

// =============================================================================
// Status and Notifications
// =============================================================================

/// Lifecycle status of a live query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LiveQueryStatus {
    /// Constructed, no result yet.
    Created,
    /// Initial result set; receiving updates.
    Running,
    /// Disposed; no further updates.
    Disposed,
}

/// A change observed on a live query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveQueryEvent {
    /// The status changed to the given value.
    StatusChanged(LiveQueryStatus),

    /// The result was replaced; `version` is the new result version.
    ResultUpdated {
        /// Version of the new result (1 is the initial result).
        version: u64,
    },

    /// The observer fell behind and missed `missed` notifications.
    Lagged {
        /// Number of notifications dropped for this observer.
        missed: u64,
    },
}

/// Receiver side of a live query's notifications.
pub struct LiveQueryChanges {
    receiver: broadcast::Receiver<LiveQueryEvent>,
}

impl LiveQueryChanges {
    /// Waits for the next notification.
    ///
    /// Returns `None` once the live query has been dropped by the engine and
    /// every buffered notification was consumed.
    pub async fn next(&mut self) -> Option<LiveQueryEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(broadcast::error::RecvError::Lagged(missed)) => Some(LiveQueryEvent::Lagged { missed }),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    /// Returns the next buffered notification without waiting.
    pub fn try_next(&mut self) -> Option<LiveQueryEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(broadcast::error::TryRecvError::Lagged(missed)) => Some(LiveQueryEvent::Lagged { missed }),
            Err(broadcast::error::TryRecvError::Empty) | Err(broadcast::error::TryRecvError::Closed) => None,
        }
    }

    /// Number of buffered notifications.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Returns true if no notification is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// =============================================================================
// Options
// =============================================================================

/// Per-query options passed to `execute`.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Label used in log lines for this live query.
    pub label: Option<String>,

    /// Capacity of the notification channel; engine default when `None`.
    pub notification_capacity: Option<usize>,
}

impl QueryOptions {
    /// Sets the log label.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Sets the notification channel capacity.
    pub fn with_notification_capacity(mut self, capacity: usize) -> Self {
        self.notification_capacity = Some(capacity);
        self
    }
}

// =============================================================================
// Live Query
// =============================================================================

/// Callback run once when a live query is disposed.
pub type DisposeFn<Q> = Box<dyn FnOnce(LiveQueryId, &Q) + Send>;

struct LiveState<R> {
    status: LiveQueryStatus,
    result: Option<R>,
    version: u64,
}

/// One outstanding query subscription.
pub struct LiveQuery<Q: Query> {
    id: LiveQueryId,
    query: Q,
    partition: PartitionId,
    options: QueryOptions,
    state: Mutex<LiveState<Q::Result>>,
    on_dispose: Mutex<Option<DisposeFn<Q>>>,
    changes: broadcast::Sender<LiveQueryEvent>,
}

impl<Q: Query> LiveQuery<Q> {
    /// Creates a live query in status `Created`.
    pub fn new(query: Q, partition: PartitionId, options: QueryOptions, on_dispose: DisposeFn<Q>) -> Self {
        let capacity = options
            .notification_capacity
            .unwrap_or(DEFAULT_NOTIFICATION_CAPACITY)
            .max(1);
        let (changes, _) = broadcast::channel(capacity);

        Self {
            id: LiveQueryId::next(),
            query,
            partition,
            options,
            state: Mutex::new(LiveState {
                status: LiveQueryStatus::Created,
                result: None,
                version: 0,
            }),
            on_dispose: Mutex::new(Some(on_dispose)),
            changes,
        }
    }

    /// The live query's id.
    pub fn id(&self) -> LiveQueryId {
        self.id
    }

    /// The query value.
    pub fn query(&self) -> &Q {
        &self.query
    }

    /// The partition the query is bound to.
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// The options the query was executed with.
    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    /// Current status.
    pub fn status(&self) -> LiveQueryStatus {
        self.lock_state().status
    }

    /// Returns true once disposed.
    pub fn is_disposed(&self) -> bool {
        self.status() == LiveQueryStatus::Disposed
    }

    /// Version of the current result (0 before the initial result).
    pub fn version(&self) -> u64 {
        self.lock_state().version
    }

    /// A clone of the current result, `None` before the initial result.
    pub fn result(&self) -> Option<Q::Result> {
        self.lock_state().result.clone()
    }

    /// Runs `f` against the current result without cloning it.
    pub fn map_result<T>(&self, f: impl FnOnce(&Q::Result) -> T) -> Option<T> {
        self.lock_state().result.as_ref().map(f)
    }

    /// Registers an observer.
    pub fn subscribe(&self) -> LiveQueryChanges {
        LiveQueryChanges {
            receiver: self.changes.subscribe(),
        }
    }

    /// Sets the initial result and moves to `Running`.
    pub fn on_result(&self, result: Q::Result) -> Result<()> {
        {
            let mut state = self.lock_state();
            if state.status != LiveQueryStatus::Created {
                return Err(self.invalid_state(state.status, "set initial result of"));
            }
            state.result = Some(result);
            state.version = 1;
            state.status = LiveQueryStatus::Running;
        }

        let _ = self.changes.send(LiveQueryEvent::StatusChanged(LiveQueryStatus::Running));
        Ok(())
    }

    /// Replaces the result with a refreshed one.
    pub fn on_update(&self, result: Q::Result) -> Result<()> {
        let version = {
            let mut state = self.lock_state();
            if state.status != LiveQueryStatus::Running {
                return Err(self.invalid_state(state.status, "update"));
            }
            state.result = Some(result);
            state.version += 1;
            state.version
        };

        let _ = self.changes.send(LiveQueryEvent::ResultUpdated { version });
        Ok(())
    }

    /// Disposes the live query. Calling it again does nothing.
    pub fn dispose(&self) {
        {
            let mut state = self.lock_state();
            if state.status == LiveQueryStatus::Disposed {
                return;
            }
            state.status = LiveQueryStatus::Disposed;
        }

        let callback = self
            .on_dispose
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback(self.id, &self.query);
        }

        let _ = self.changes.send(LiveQueryEvent::StatusChanged(LiveQueryStatus::Disposed));
    }

    fn lock_state(&self) -> MutexGuard<'_, LiveState<Q::Result>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn invalid_state(&self, status: LiveQueryStatus, operation: &'static str) -> Error {
        Error::InvalidLiveQueryState {
            query: format!("{:?}", self.query),
            status,
            operation,
        }
    }
}

impl<Q: Query> fmt::Debug for LiveQuery<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock_state();
        f.debug_struct("LiveQuery")
            .field("id", &self.id)
            .field("query", &self.query)
            .field("partition", &self.partition)
            .field("status", &state.status)
            .field("version", &state.version)
            .finish()
    }
}

// =============================================================================
// Caller Handle
// =============================================================================

/// Caller-facing handle to a live query.
///
/// Cloning the handle shares the live query. Dropping it does not dispose the
/// query; call [`LiveResult::dispose`].
pub struct LiveResult<Q: Query> {
    inner: Arc<LiveQuery<Q>>,
}

impl<Q: Query> LiveResult<Q> {
    pub(crate) fn new(inner: Arc<LiveQuery<Q>>) -> Self {
        Self { inner }
    }

    /// The id of the underlying live query.
    pub fn id(&self) -> LiveQueryId {
        self.inner.id()
    }

    /// The query value.
    pub fn query(&self) -> &Q {
        self.inner.query()
    }

    /// The partition the query is bound to.
    pub fn partition(&self) -> PartitionId {
        self.inner.partition()
    }

    /// Returns true once disposed.
    pub fn is_disposed(&self) -> bool {
        self.inner.is_disposed()
    }

    /// A clone of the current result.
    pub fn result(&self) -> Option<Q::Result> {
        self.inner.result()
    }

    /// Runs `f` against the current result without cloning it.
    pub fn map_result<T>(&self, f: impl FnOnce(&Q::Result) -> T) -> Option<T> {
        self.inner.map_result(f)
    }

    /// Current status.
    pub fn status(&self) -> LiveQueryStatus {
        self.inner.status()
    }

    /// Version of the current result.
    pub fn version(&self) -> u64 {
        self.inner.version()
    }

    /// Registers an observer for result and status changes.
    pub fn subscribe(&self) -> LiveQueryChanges {
        self.inner.subscribe()
    }

    /// Disposes the live query.
    pub fn dispose(&self) {
        self.inner.dispose();
    }
}

impl<Q: Query> Clone for LiveResult<Q> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<Q: Query> fmt::Debug for LiveResult<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::types::Model;

    struct Board;
    impl Model for Board {}

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Score(u32);

    impl Query for Score {
        type Model = Board;
        type Result = Vec<u32>;
    }

    fn counting_query(disposals: &Arc<AtomicUsize>) -> LiveQuery<Score> {
        let disposals = Arc::clone(disposals);
        LiveQuery::new(
            Score(7),
            PartitionId::Root,
            QueryOptions::default(),
            Box::new(move |_, _| {
                disposals.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_lifecycle_moves_forward() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let live = counting_query(&disposals);
        let mut changes = live.subscribe();

        assert_eq!(live.status(), LiveQueryStatus::Created);
        assert_eq!(live.result(), None);

        live.on_result(vec![1]).unwrap();
        assert_eq!(live.status(), LiveQueryStatus::Running);
        assert_eq!(live.version(), 1);
        assert_eq!(changes.try_next(), Some(LiveQueryEvent::StatusChanged(LiveQueryStatus::Running)));

        live.on_update(vec![1, 2]).unwrap();
        assert_eq!(live.result(), Some(vec![1, 2]));
        assert_eq!(live.version(), 2);
        assert_eq!(changes.try_next(), Some(LiveQueryEvent::ResultUpdated { version: 2 }));

        live.dispose();
        assert_eq!(live.status(), LiveQueryStatus::Disposed);
        assert_eq!(changes.try_next(), Some(LiveQueryEvent::StatusChanged(LiveQueryStatus::Disposed)));
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_initial_result_only_once() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let live = counting_query(&disposals);

        live.on_result(vec![]).unwrap();
        let err = live.on_result(vec![9]).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidLiveQueryState { status: LiveQueryStatus::Running, .. }
        ));
        assert_eq!(live.result(), Some(vec![]));
    }

    #[test]
    fn test_update_before_initial_result_is_rejected() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let live = counting_query(&disposals);

        let err = live.on_update(vec![1]).unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidLiveQueryState { status: LiveQueryStatus::Created, operation: "update", .. }
        ));
    }

    #[test]
    fn test_updates_after_dispose_are_rejected() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let live = counting_query(&disposals);
        live.on_result(vec![1]).unwrap();
        live.dispose();

        let update = live.on_update(vec![2]).unwrap_err();
        assert!(matches!(
            update,
            Error::InvalidLiveQueryState { status: LiveQueryStatus::Disposed, .. }
        ));
        let initial = live.on_result(vec![3]).unwrap_err();
        assert!(matches!(
            initial,
            Error::InvalidLiveQueryState { status: LiveQueryStatus::Disposed, .. }
        ));

        // last result survives disposal
        assert_eq!(live.result(), Some(vec![1]));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let live = counting_query(&disposals);
        live.on_result(vec![1]).unwrap();
        let mut changes = live.subscribe();

        live.dispose();
        live.dispose();

        assert_eq!(disposals.load(Ordering::SeqCst), 1);
        assert_eq!(changes.try_next(), Some(LiveQueryEvent::StatusChanged(LiveQueryStatus::Disposed)));
        assert_eq!(changes.try_next(), None);
    }

    #[test]
    fn test_slow_observer_sees_lag() {
        let live = LiveQuery::new(
            Score(1),
            PartitionId::Root,
            QueryOptions::default().with_notification_capacity(2),
            Box::new(|_, _| {}),
        );
        let mut changes = live.subscribe();

        live.on_result(vec![]).unwrap();
        for i in 0..5 {
            live.on_update(vec![i]).unwrap();
        }

        assert!(matches!(changes.try_next(), Some(LiveQueryEvent::Lagged { .. })));
        assert_eq!(live.version(), 6);
    }

    #[tokio::test]
    async fn test_live_result_handle_shares_state() {
        let disposals = Arc::new(AtomicUsize::new(0));
        let handle = LiveResult::new(Arc::new(counting_query(&disposals)));
        let other = handle.clone();
        let mut changes = other.subscribe();

        handle.inner.on_result(vec![4, 5]).unwrap();
        assert_eq!(changes.next().await, Some(LiveQueryEvent::StatusChanged(LiveQueryStatus::Running)));
        assert_eq!(other.map_result(|r| r.len()), Some(2));
        assert_eq!(other.query(), &Score(7));

        other.dispose();
        assert_eq!(handle.status(), LiveQueryStatus::Disposed);
        assert_eq!(disposals.load(Ordering::SeqCst), 1);
    }
}
