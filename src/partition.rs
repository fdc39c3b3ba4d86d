//! # Partition Registry
//!
//! Tracks, per partition, the live queries bound to it and the partition's
//! subscription, plus a global index of every live query by query value.
//!
//! ```text
//!   PartitionRegistry
//!   ├── partitions: PartitionId ──▶ Partition
//!   │                               ├── queries: QueryKey ──▶ LiveEntry
//!   │                               └── subscription: OnceCell<SubscriptionHandle>
//!   └── live:       QueryKey ──▶ LiveEntry            (global index)
//! ```
//!
//! ## Invariants
//!
//! - A live entry is in the global index iff it is in its partition's map.
//!   `register` and `remove_query` update both.
//! - A partition's subscription is set at most once.
//! - A partition whose subscription attempt failed is discarded, never left
//!   behind without a subscription.
//!
//! Both maps are `DashMap`s. No map guard is held while calling into a live
//! entry or while awaiting.

use std::any::{Any, TypeId};
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::error::Result;
use crate::handler::{QueryHandlerFactory, RefreshOutcome};
use crate::live_query::LiveQueryId;
use crate::subscriber::SubscriptionHandle;
use crate::types::{Model, PartitionId, Query};

// =============================================================================
// Query Keys
// =============================================================================

trait QueryValue: Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn eq_value(&self, other: &dyn QueryValue) -> bool;
    fn hash_value(&self, state: &mut dyn Hasher);
    fn fmt_value(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<Q: Query> QueryValue for Q {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn eq_value(&self, other: &dyn QueryValue) -> bool {
        other.as_any().downcast_ref::<Q>().is_some_and(|other| self == other)
    }

    fn hash_value(&self, mut state: &mut dyn Hasher) {
        TypeId::of::<Q>().hash(&mut state);
        self.hash(&mut state);
    }

    fn fmt_value(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A query value with its type erased, usable as a map key.
///
/// Two keys are equal when they wrap values of the same query type that
/// compare equal.
#[derive(Clone)]
pub struct QueryKey(Arc<dyn QueryValue>);

impl QueryKey {
    /// Creates the key of `query`.
    pub fn of<Q: Query>(query: &Q) -> Self {
        Self(Arc::new(query.clone()))
    }

    /// Returns the wrapped value if it is a `Q`.
    pub fn downcast_ref<Q: Query>(&self) -> Option<&Q> {
        self.0.as_any().downcast_ref::<Q>()
    }
}

impl PartialEq for QueryKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_value(other.0.as_ref())
    }
}

impl Eq for QueryKey {}

impl Hash for QueryKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash_value(state);
    }
}

impl fmt::Debug for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt_value(f)
    }
}

// =============================================================================
// Live Entries
// =============================================================================

/// A registered live query, seen through the model type only.
pub trait LiveEntry<M: Model>: Send + Sync {
    /// Id of the bound live query.
    fn id(&self) -> LiveQueryId;

    /// Partition of the bound live query.
    fn partition(&self) -> PartitionId;

    /// Reruns the query against `model` and pushes the new result.
    fn refresh(&self, model: &M) -> Result<RefreshOutcome>;

    /// Returns true once the bound live query is disposed.
    fn is_disposed(&self) -> bool;

    /// Disposes the bound live query.
    fn dispose(&self);

    /// Upcast for recovering the typed entry.
    fn as_any(&self) -> &dyn Any;
}

impl<Q: Query> LiveEntry<Q::Model> for QueryHandlerFactory<Q> {
    fn id(&self) -> LiveQueryId {
        self.live().id()
    }

    fn partition(&self) -> PartitionId {
        self.live().partition()
    }

    fn refresh(&self, model: &Q::Model) -> Result<RefreshOutcome> {
        QueryHandlerFactory::refresh(self, model)
    }

    fn is_disposed(&self) -> bool {
        self.live().is_disposed()
    }

    fn dispose(&self) {
        self.live().dispose();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// =============================================================================
// Partition
// =============================================================================

/// One partition: its live queries and its subscription slot.
pub struct Partition<M: Model> {
    id: PartitionId,
    queries: DashMap<QueryKey, Arc<dyn LiveEntry<M>>>,
    subscription: OnceCell<SubscriptionHandle>,
}

impl<M: Model> Partition<M> {
    fn new(id: PartitionId) -> Self {
        Self {
            id,
            queries: DashMap::new(),
            subscription: OnceCell::new(),
        }
    }

    /// The partition's id.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// Returns true once the subscription is established.
    pub fn is_subscribed(&self) -> bool {
        self.subscription.initialized()
    }

    /// The subscription, if established.
    pub fn subscription(&self) -> Option<&SubscriptionHandle> {
        self.subscription.get()
    }

    /// Establishes the subscription exactly once.
    ///
    /// Concurrent callers wait on the same attempt. If it fails, the slot
    /// stays empty and the next caller tries again.
    pub async fn ensure_subscribed<F, Fut>(&self, subscribe: F) -> Result<&SubscriptionHandle>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SubscriptionHandle>>,
    {
        self.subscription.get_or_try_init(subscribe).await
    }

    /// Snapshot of the live queries bound to this partition.
    pub fn queries(&self) -> Vec<Arc<dyn LiveEntry<M>>> {
        self.queries.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Number of live queries bound to this partition.
    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    fn close(&self) {
        if let Some(handle) = self.subscription.get() {
            handle.close();
        }
    }
}

impl<M: Model> fmt::Debug for Partition<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Partition")
            .field("id", &self.id)
            .field("queries", &self.queries.len())
            .field("subscribed", &self.is_subscribed())
            .finish()
    }
}

// =============================================================================
// Registry
// =============================================================================

/// All partitions of one engine and the global live query index.
pub struct PartitionRegistry<M: Model> {
    partitions: DashMap<PartitionId, Arc<Partition<M>>>,
    live: DashMap<QueryKey, Arc<dyn LiveEntry<M>>>,
}

impl<M: Model> PartitionRegistry<M> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            partitions: DashMap::new(),
            live: DashMap::new(),
        }
    }

    /// Returns the partition record for `id`, inserting an empty one if absent.
    pub fn get_or_create(&self, id: PartitionId) -> Arc<Partition<M>> {
        let partition = self
            .partitions
            .entry(id)
            .or_insert_with(|| Arc::new(Partition::new(id)));
        Arc::clone(partition.value())
    }

    /// Returns the partition record for `id`.
    pub fn get(&self, id: PartitionId) -> Option<Arc<Partition<M>>> {
        self.partitions.get(&id).map(|partition| Arc::clone(partition.value()))
    }

    /// Returns the live entry registered for `key`.
    pub fn find_query(&self, key: &QueryKey) -> Option<Arc<dyn LiveEntry<M>>> {
        self.live.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Registers `entry` under `key` in the global index and its partition.
    ///
    /// If a live entry for an equal query is already registered, nothing
    /// changes and that entry is returned as the error. A disposed entry is
    /// replaced.
    pub fn register(&self, key: QueryKey, entry: Arc<dyn LiveEntry<M>>) -> std::result::Result<(), Arc<dyn LiveEntry<M>>> {
        let partition = self.get_or_create(entry.partition());

        match self.live.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let stale = occupied.get();
                if !stale.is_disposed() {
                    return Err(Arc::clone(stale));
                }
                let stale_id = stale.id();
                if let Some(previous) = self.get(stale.partition()) {
                    previous.queries.remove_if(&key, |_, entry| entry.id() == stale_id);
                }
                partition.queries.insert(key, Arc::clone(&entry));
                occupied.insert(entry);
            }
            Entry::Vacant(vacant) => {
                partition.queries.insert(key, Arc::clone(&entry));
                vacant.insert(entry);
            }
        }
        Ok(())
    }

    /// Removes the live entry `id` registered under `key` from the global
    /// index and from its partition.
    ///
    /// Entries registered under the same key with another id are left alone.
    pub fn remove_query(&self, key: &QueryKey, id: LiveQueryId) -> Option<Arc<dyn LiveEntry<M>>> {
        let (_, entry) = self.live.remove_if(key, |_, entry| entry.id() == id)?;

        if let Some(partition) = self.get(entry.partition()) {
            partition.queries.remove_if(key, |_, entry| entry.id() == id);
        }
        Some(entry)
    }

    /// Removes the record for `id` if it has no subscription and no queries.
    ///
    /// The caller is expected to hold one handle to the record. A record that
    /// another caller also holds (one still waiting on the subscription) is
    /// kept, so that caller's attempt lands on the record in the map.
    pub fn discard_if_unsubscribed(&self, id: PartitionId) -> bool {
        self.partitions
            .remove_if(&id, |_, partition| {
                !partition.is_subscribed() && partition.queries.is_empty() && Arc::strong_count(partition) <= 2
            })
            .is_some()
    }

    /// Returns true if the partition `id` has an established subscription.
    pub fn is_subscribed(&self, id: PartitionId) -> bool {
        self.get(id).is_some_and(|partition| partition.is_subscribed())
    }

    /// Number of partition records.
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    /// Number of registered live queries.
    pub fn live_query_count(&self) -> usize {
        self.live.len()
    }

    /// Closes every subscription and empties the registry.
    ///
    /// Returns the live entries that were registered so the caller can
    /// dispose them.
    pub fn close_all(&self) -> Vec<Arc<dyn LiveEntry<M>>> {
        let ids: Vec<PartitionId> = self.partitions.iter().map(|p| *p.key()).collect();
        for id in ids {
            if let Some((_, partition)) = self.partitions.remove(&id) {
                partition.close();
            }
        }

        let keys: Vec<QueryKey> = self.live.iter().map(|e| e.key().clone()).collect();
        keys.into_iter()
            .filter_map(|key| self.live.remove(&key).map(|(_, entry)| entry))
            .collect()
    }
}

impl<M: Model> Default for PartitionRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Model> fmt::Debug for PartitionRegistry<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartitionRegistry")
            .field("partitions", &self.partitions.len())
            .field("live_queries", &self.live.len())
            .finish()
    }
}
