//! # Query Engine
//!
//! The [`QueryEngine`] turns queries into live queries. It owns the model,
//! the partition registry and every live query it creates.
//!
//! ## Execute Path
//!
//! ```text
//!  execute(query)
//!    │
//!    ├─ 1. partitioner(model, query) ──▶ PartitionId (root if none)
//!    ├─ 2. partition.ensure_subscribed ──▶ subscriber.subscribe(...)
//!    │        (once per partition, concurrent callers wait,
//!    │         resolves only after catch-up was applied)
//!    ├─ 3. model.read() ─┬─ handler.execute(model, query)   initial result
//!    │                   ├─ live.on_result(result)
//!    │                   └─ registry.register(live)         same read lock
//!    └─ 4. LiveResult
//! ```
//!
//! Step 3's snapshot and registration happen under one shared lock on the
//! model. The delivery path needs the exclusive lock to apply events, so an
//! event is either in the initial result or triggers an update, never both
//! and never neither.
//!
//! ## Delivery Path
//!
//! ```text
//!  subscriber ──▶ PartitionDispatcher::deliver(batch)
//!                   ├─ model.write(): apply every envelope in order,
//!                   │                 skipping pos <= partition checkpoint
//!                   ├─ downgrade to model.read()
//!                   └─ for each live query of the partition: refresh
//! ```
//!
//! Failures inside the delivery path never reach the subscriber: unknown event
//! types and projection errors skip the event, a failing refresh skips that
//! live query. All of them are logged with `tracing`. A batch in which no
//! event could be applied refreshes nothing.
//!
//! Each partition keeps the position of the last event it consumed. A
//! subscription retried after a timeout replays the partition's history; the
//! replayed positions are dropped instead of being applied a second time.
//! The checkpoints belong to the engine, not to the partition record, so
//! they survive a record discarded after a failed subscription.
//!
//! ## Rust Concepts
//!
//! - **Capability tables**: query handlers and partitioners of many query
//!   types are stored as `Box<dyn Any>` keyed by `TypeId` and downcast back to
//!   `Arc<dyn QueryHandler<Q>>` in the generic `execute::<Q>`.
//! - **`Weak` back references**: subscriptions and disposal callbacks hold
//!   `Weak` pointers, so dropping the engine tears everything down.
//! - **`RwLockWriteGuard::downgrade`**: atomically trades the exclusive lock
//!   for a shared one without letting a writer in between.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures::future::BoxFuture;
use tokio::sync::{RwLockReadGuard, RwLockWriteGuard};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::handler::{
    EventHandlerFactory, ProjectionHandlerFactory, QueryHandler, QueryHandlerFactory, QueryPartitioner,
    RefreshOutcome,
};
use crate::live_query::{DisposeFn, LiveQuery, LiveResult, QueryOptions};
use crate::model::{ModelFactory, ModelHolder};
use crate::partition::{LiveEntry, PartitionRegistry, QueryKey};
use crate::projection::Projection;
use crate::schema::{ProjectionSchema, ProjectionSchemaRegister, QuerySchema, QuerySchemaRegister};
use crate::subscriber::{BatchSink, PartitionSubscriber};
use crate::types::{EventEnvelope, GlobalPos, Model, PartitionId, PartitionKey, Query, TypeKey};

type Capability = Box<dyn Any + Send + Sync>;

// =============================================================================
// Query Engine
// =============================================================================

/// Executes live queries against one model type.
///
/// `QueryEngine` is `Clone`; all clones share the same model, registry and
/// subscriptions.
///
/// # Example
///
/// ```rust,ignore
/// let engine = QueryEngine::<RoomModel>::builder(store.clone())
///     .projection(rooms_projection())
///     .query::<GetRoom, _>(|model, query| Ok(model.rooms.get(&query.0).cloned()))
///     .build()?;
///
/// let live = engine.execute(GetRoom(101), QueryOptions::default()).await?;
/// let mut changes = live.subscribe();
/// while let Some(change) = changes.next().await {
///     println!("{change:?}: {:?}", live.result());
/// }
/// ```
pub struct QueryEngine<M: Model> {
    inner: Arc<EngineInner<M>>,
}

struct EngineInner<M: Model> {
    model: ModelHolder<M>,
    projection: Arc<ProjectionHandlerFactory<M>>,
    projections: ProjectionSchemaRegister,
    queries: QuerySchemaRegister,
    schema: Arc<ProjectionSchema>,
    handlers: HashMap<TypeId, Capability>,
    partitioners: HashMap<TypeId, Capability>,
    registry: Arc<PartitionRegistry<M>>,
    /// Last consumed position per partition. Only touched under the model
    /// write lock.
    checkpoints: DashMap<PartitionId, GlobalPos>,
    subscriber: Arc<dyn PartitionSubscriber>,
    config: EngineConfig,
    shutdown: AtomicBool,
}

impl<M: Model + Default> QueryEngine<M> {
    /// Starts building an engine whose model is created with `M::default()`.
    pub fn builder(subscriber: Arc<dyn PartitionSubscriber>) -> QueryEngineBuilder<M> {
        QueryEngineBuilder::new(subscriber, Box::new(M::default))
    }
}

impl<M: Model> QueryEngine<M> {
    /// Starts building an engine whose model is created by `factory`.
    pub fn builder_with_model(
        subscriber: Arc<dyn PartitionSubscriber>,
        factory: impl Fn() -> M + Send + Sync + 'static,
    ) -> QueryEngineBuilder<M> {
        QueryEngineBuilder::new(subscriber, Box::new(factory))
    }

    /// Executes `query` and keeps its result live.
    ///
    /// If an equal query is already live, a handle to that live query is
    /// returned instead.
    ///
    /// # Errors
    ///
    /// - [`Error::UnregisteredQuery`] if `Q` has no handler
    /// - [`Error::SubscriptionFailed`] if the partition could not be
    ///   subscribed; the call can be retried
    /// - any error of the query handler for the initial result
    /// - [`Error::EngineShutdown`] after [`QueryEngine::shutdown`], also when
    ///   the shutdown lands while this call is in flight
    pub async fn execute<Q>(&self, query: Q, options: QueryOptions) -> Result<LiveResult<Q>>
    where
        Q: Query<Model = M>,
    {
        let inner = &self.inner;
        inner.ensure_running()?;

        inner.queries.get_by_query_type(&TypeKey::of::<Q>())?;
        inner.projections.find_by_model_type(&TypeKey::of::<M>())?;
        let handler = inner.query_handler::<Q>()?;

        let key = QueryKey::of(&query);
        if let Some(existing) = inner.registry.find_query(&key) {
            if !existing.is_disposed() {
                if let Some(live) = typed_live::<Q>(&*existing) {
                    return Ok(LiveResult::new(live));
                }
            }
        }

        let partition = {
            let model = inner.model.get_or_create().read().await;
            PartitionId::from(inner.partition_key(&*model, &query))
        };

        self.ensure_subscribed(partition).await?;

        let model = inner.model.get_or_create().read().await;
        inner.ensure_running()?;

        let initial = handler.execute(&model, &query)?;
        let options = QueryOptions {
            notification_capacity: options.notification_capacity.or(Some(inner.config.notification_capacity)),
            ..options
        };
        let live = Arc::new(LiveQuery::new(query, partition, options, inner.dispose_callback(key.clone())));
        live.on_result(initial)?;

        let entry = Arc::new(QueryHandlerFactory::new(
            Arc::clone(&inner.projection),
            handler,
            Arc::clone(&live),
        ));

        let registered = inner.registry.register(key, entry);

        // `shutdown` may have drained the registry while this query was
        // being prepared
        if inner.ensure_running().is_err() {
            live.dispose();
            inner.registry.discard_if_unsubscribed(partition);
            return Err(Error::EngineShutdown);
        }

        match registered {
            Ok(()) => {
                tracing::debug!(
                    id = %live.id(),
                    query = ?live.query(),
                    label = live.options().label.as_deref(),
                    partition = %partition,
                    "live query registered"
                );
                Ok(LiveResult::new(live))
            }
            Err(existing) => typed_live::<Q>(&*existing)
                .map(LiveResult::new)
                .ok_or_else(|| Error::UnregisteredQuery {
                    query_type: std::any::type_name::<Q>().to_string(),
                }),
        }
    }

    /// Shared read access to the model.
    pub async fn model(&self) -> RwLockReadGuard<'_, M> {
        self.inner.model.get_or_create().read().await
    }

    /// The schema of the engine's projection.
    pub fn schema(&self) -> &Arc<ProjectionSchema> {
        &self.inner.schema
    }

    /// The engine's configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// Number of live queries currently registered.
    pub fn live_query_count(&self) -> usize {
        self.inner.registry.live_query_count()
    }

    /// Number of partition records.
    pub fn partition_count(&self) -> usize {
        self.inner.registry.partition_count()
    }

    /// Returns true if `partition` has an established subscription.
    pub fn is_subscribed(&self, partition: PartitionId) -> bool {
        self.inner.registry.is_subscribed(partition)
    }

    /// Closes every subscription and disposes every live query.
    ///
    /// Later calls to `execute` fail with [`Error::EngineShutdown`].
    /// Calling it again does nothing.
    pub fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let entries = self.inner.registry.close_all();
        let disposed = entries.len();
        for entry in entries {
            entry.dispose();
        }

        tracing::info!(disposed, "query engine shut down");
    }

    /// Returns true once [`QueryEngine::shutdown`] was called.
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    async fn ensure_subscribed(&self, partition: PartitionId) -> Result<()> {
        let inner = &self.inner;
        let record = inner.registry.get_or_create(partition);

        let schema = Arc::clone(&inner.schema);
        let subscriber = Arc::clone(&inner.subscriber);
        let timeout = inner.config.subscribe_timeout;
        let sink: Arc<dyn BatchSink> = Arc::new(PartitionDispatcher {
            partition,
            engine: Arc::downgrade(inner),
        });

        let subscribed = record
            .ensure_subscribed(|| async move {
                tracing::debug!(partition = %partition, "subscribing partition");
                match tokio::time::timeout(timeout, subscriber.subscribe(schema, partition, sink)).await {
                    Ok(Ok(handle)) => Ok(handle),
                    Ok(Err(error @ Error::SubscriptionFailed { .. })) => Err(error),
                    Ok(Err(error)) => Err(Error::SubscriptionFailed {
                        partition,
                        reason: error.to_string(),
                    }),
                    Err(_) => Err(Error::SubscriptionFailed {
                        partition,
                        reason: format!("not live within {timeout:?}"),
                    }),
                }
            })
            .await;

        if let Err(error) = subscribed {
            inner.registry.discard_if_unsubscribed(partition);
            tracing::warn!(partition = %partition, %error, "partition subscription failed");
            return Err(error);
        }
        Ok(())
    }
}

impl<M: Model> Clone for QueryEngine<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<M: Model> fmt::Debug for QueryEngine<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEngine")
            .field("projection", &self.inner.schema.name)
            .field("queries", &self.inner.queries.len())
            .field("registry", &self.inner.registry)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn typed_live<Q: Query>(entry: &dyn LiveEntry<Q::Model>) -> Option<Arc<LiveQuery<Q>>> {
    entry
        .as_any()
        .downcast_ref::<QueryHandlerFactory<Q>>()
        .map(|factory| Arc::clone(factory.live()))
}

// =============================================================================
// Engine Internals
// =============================================================================

impl<M: Model> EngineInner<M> {
    fn ensure_running(&self) -> Result<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(Error::EngineShutdown);
        }
        Ok(())
    }

    fn query_handler<Q: Query<Model = M>>(&self) -> Result<Arc<dyn QueryHandler<Q>>> {
        self.handlers
            .get(&TypeId::of::<Q>())
            .and_then(|handler| handler.downcast_ref::<Arc<dyn QueryHandler<Q>>>())
            .cloned()
            .ok_or_else(|| Error::UnregisteredQuery {
                query_type: std::any::type_name::<Q>().to_string(),
            })
    }

    fn partition_key<Q: Query<Model = M>>(&self, model: &M, query: &Q) -> Option<PartitionKey> {
        self.partitioners
            .get(&TypeId::of::<Q>())
            .and_then(|partitioner| partitioner.downcast_ref::<Arc<dyn QueryPartitioner<Q>>>())
            .and_then(|partitioner| partitioner.calculate_partition(model, query))
    }

    fn dispose_callback<Q: Query<Model = M>>(&self, key: QueryKey) -> DisposeFn<Q> {
        let registry = Arc::downgrade(&self.registry);
        Box::new(move |id, query| {
            let Some(registry) = registry.upgrade() else {
                return;
            };
            if registry.remove_query(&key, id).is_some() {
                tracing::debug!(id = %id, query = ?query, "live query disposed");
            }
        })
    }

    async fn apply_batch(&self, partition: PartitionId, batch: Vec<EventEnvelope>) {
        if batch.is_empty() || self.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let mut model: RwLockWriteGuard<'_, M> = self.model.get_or_create().write().await;
        let mut checkpoint = self.checkpoints.get(&partition).map(|position| *position);
        let mut applied = 0usize;
        let mut replayed = 0usize;
        for envelope in &batch {
            let position = envelope.position();
            if checkpoint.is_some_and(|last| position <= last) {
                replayed += 1;
                continue;
            }
            checkpoint = Some(position);

            let outcome = self
                .projection
                .create_handler(&envelope.event_type())
                .and_then(|handler| handler.execute(&mut model, &envelope.metadata, envelope.event.as_ref()));

            match outcome {
                Ok(()) => applied += 1,
                Err(error) => tracing::warn!(
                    partition = %partition,
                    event_type = %envelope.event_type(),
                    position = %envelope.position(),
                    %error,
                    "skipping event"
                ),
            }
        }

        if let Some(position) = checkpoint {
            self.checkpoints.insert(partition, position);
        }
        if replayed > 0 {
            tracing::debug!(partition = %partition, replayed, "dropped already consumed events");
        }

        if applied == 0 {
            tracing::debug!(partition = %partition, events = batch.len(), "batch had nothing to apply");
            return;
        }

        let model = RwLockWriteGuard::downgrade(model);
        let Some(record) = self.registry.get(partition) else {
            return;
        };

        let mut updated = 0usize;
        for entry in record.queries() {
            match entry.refresh(&model) {
                Ok(RefreshOutcome::Updated) => updated += 1,
                Ok(RefreshOutcome::Skipped) => {}
                Err(error) => tracing::warn!(
                    partition = %partition,
                    id = %entry.id(),
                    %error,
                    "live query refresh failed"
                ),
            }
        }

        tracing::debug!(
            partition = %partition,
            events = batch.len(),
            applied,
            updated,
            "batch delivered"
        );
    }
}

// =============================================================================
// Delivery
// =============================================================================

/// Batch sink handed to the subscriber for one partition.
struct PartitionDispatcher<M: Model> {
    partition: PartitionId,
    engine: Weak<EngineInner<M>>,
}

impl<M: Model> BatchSink for PartitionDispatcher<M> {
    fn deliver(&self, batch: Vec<EventEnvelope>) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            if let Some(engine) = self.engine.upgrade() {
                engine.apply_batch(self.partition, batch).await;
            }
        })
    }
}

// =============================================================================
// Builder
// =============================================================================

/// Builder for [`QueryEngine`].
///
/// Registration errors (a second projection, a query registered twice) are
/// reported by [`QueryEngineBuilder::build`].
pub struct QueryEngineBuilder<M: Model> {
    subscriber: Arc<dyn PartitionSubscriber>,
    model_factory: ModelFactory<M>,
    projection: Option<Projection<M>>,
    query_schemas: Vec<fn(String) -> QuerySchema>,
    handlers: HashMap<TypeId, Capability>,
    partitioners: HashMap<TypeId, Capability>,
    config: EngineConfig,
    error: Option<Error>,
}

impl<M: Model> QueryEngineBuilder<M> {
    fn new(subscriber: Arc<dyn PartitionSubscriber>, model_factory: ModelFactory<M>) -> Self {
        Self {
            subscriber,
            model_factory,
            projection: None,
            query_schemas: Vec::new(),
            handlers: HashMap::new(),
            partitioners: HashMap::new(),
            config: EngineConfig::default(),
            error: None,
        }
    }

    /// Replaces the model factory.
    pub fn model_factory(mut self, factory: impl Fn() -> M + Send + Sync + 'static) -> Self {
        self.model_factory = Box::new(factory);
        self
    }

    /// Sets the projection that builds the model.
    pub fn projection(mut self, projection: Projection<M>) -> Self {
        if self.projection.is_some() {
            self.fail(Error::DuplicateRegistration {
                kind: "projection",
                name: std::any::type_name::<M>().to_string(),
            });
            return self;
        }
        self.projection = Some(projection);
        self
    }

    /// Registers the handler of query type `Q` as a closure.
    pub fn query<Q, F>(self, handler: F) -> Self
    where
        Q: Query<Model = M>,
        F: Fn(&M, &Q) -> Result<Q::Result> + Send + Sync + 'static,
    {
        self.query_handler::<Q>(handler)
    }

    /// Registers the handler of query type `Q`.
    pub fn query_handler<Q>(mut self, handler: impl QueryHandler<Q>) -> Self
    where
        Q: Query<Model = M>,
    {
        if self.handlers.contains_key(&TypeId::of::<Q>()) {
            self.fail(Error::DuplicateRegistration {
                kind: "query",
                name: std::any::type_name::<Q>().to_string(),
            });
            return self;
        }

        let handler: Arc<dyn QueryHandler<Q>> = Arc::new(handler);
        self.handlers.insert(TypeId::of::<Q>(), Box::new(handler));
        self.query_schemas.push(|projection| QuerySchema::of::<Q>(projection));
        self
    }

    /// Registers the partitioner of query type `Q` as a closure.
    pub fn partitioner<Q, F>(self, partitioner: F) -> Self
    where
        Q: Query<Model = M>,
        F: Fn(&M, &Q) -> Option<PartitionKey> + Send + Sync + 'static,
    {
        self.query_partitioner::<Q>(partitioner)
    }

    /// Registers the partitioner of query type `Q`. At most one per type.
    pub fn query_partitioner<Q>(mut self, partitioner: impl QueryPartitioner<Q>) -> Self
    where
        Q: Query<Model = M>,
    {
        if self.partitioners.contains_key(&TypeId::of::<Q>()) {
            self.fail(Error::DuplicateRegistration {
                kind: "partitioner",
                name: std::any::type_name::<Q>().to_string(),
            });
            return self;
        }

        let partitioner: Arc<dyn QueryPartitioner<Q>> = Arc::new(partitioner);
        self.partitioners.insert(TypeId::of::<Q>(), Box::new(partitioner));
        self
    }

    /// Sets the engine configuration.
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Builds the engine.
    ///
    /// # Errors
    ///
    /// - [`Error::UnregisteredProjection`] if no projection was set
    /// - [`Error::DuplicateRegistration`] for any repeated registration
    pub fn build(self) -> Result<QueryEngine<M>> {
        if let Some(error) = self.error {
            return Err(error);
        }

        let projection = self.projection.ok_or_else(|| Error::UnregisteredProjection {
            model_type: std::any::type_name::<M>().to_string(),
        })?;

        let mut projections = ProjectionSchemaRegister::new();
        let schema = projections.register(projection.schema().clone())?;

        let mut queries = QuerySchemaRegister::new();
        for describe in self.query_schemas {
            queries.register(describe(schema.name.clone()))?;
        }

        let projection = Arc::new(ProjectionHandlerFactory::new(Arc::new(projection))?);

        tracing::debug!(
            projection = %schema.name,
            hash = %schema.hash(),
            events = schema.events.len(),
            queries = queries.len(),
            "query engine built"
        );

        Ok(QueryEngine {
            inner: Arc::new(EngineInner {
                model: ModelHolder::new(self.model_factory),
                projection,
                projections,
                queries,
                schema,
                handlers: self.handlers,
                partitioners: self.partitioners,
                registry: Arc::new(PartitionRegistry::new()),
                checkpoints: DashMap::new(),
                subscriber: self.subscriber,
                config: self.config,
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    fn fail(&mut self, error: Error) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryEventStore;
    use crate::types::{Event, EventMetadata};

    #[derive(Default)]
    struct Counter {
        value: i64,
    }
    impl Model for Counter {}

    #[derive(Debug)]
    struct Incremented(i64);
    impl Event for Incremented {
        const NAME: &'static str = "Incremented";
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Current;
    impl Query for Current {
        type Model = Counter;
        type Result = i64;
    }

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct Unhandled;
    impl Query for Unhandled {
        type Model = Counter;
        type Result = ();
    }

    fn projection() -> Projection<Counter> {
        Projection::builder("counter")
            .on::<Incremented, _>(|model: &mut Counter, _meta, ev| model.value += ev.0)
            .build()
    }

    fn engine(store: &Arc<InMemoryEventStore>) -> QueryEngine<Counter> {
        QueryEngine::builder(store.clone())
            .projection(projection())
            .query::<Current, _>(|model, _| Ok(model.value))
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_requires_projection() {
        let store = Arc::new(InMemoryEventStore::new());
        let err = QueryEngine::<Counter>::builder(store).build().unwrap_err();
        assert!(matches!(err, Error::UnregisteredProjection { .. }));
    }

    #[test]
    fn test_build_rejects_duplicates() {
        let store = Arc::new(InMemoryEventStore::new());
        let err = QueryEngine::<Counter>::builder(store.clone())
            .projection(projection())
            .query::<Current, _>(|model, _| Ok(model.value))
            .query::<Current, _>(|_, _| Ok(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration { kind: "query", .. }));

        let err = QueryEngine::<Counter>::builder(store)
            .projection(projection())
            .projection(projection())
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateRegistration { kind: "projection", .. }));
    }

    #[tokio::test]
    async fn test_unregistered_query_is_rejected() {
        let store = Arc::new(InMemoryEventStore::new());
        let engine = engine(&store);

        let err = engine.execute(Unhandled, QueryOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::UnregisteredQuery { .. }));
        assert_eq!(engine.partition_count(), 0);
        assert_eq!(store.subscription_count(), 0);
    }

    #[tokio::test]
    async fn test_initial_result_includes_history() {
        let store = Arc::new(InMemoryEventStore::new());
        let engine = engine(&store);
        store.append(engine.schema(), PartitionId::Root, Incremented(2));
        store.append(engine.schema(), PartitionId::Root, Incremented(3));

        let live = engine.execute(Current, QueryOptions::default()).await.unwrap();

        assert_eq!(live.result(), Some(5));
        assert_eq!(live.partition(), PartitionId::Root);
        assert!(engine.is_subscribed(PartitionId::Root));
        assert_eq!(engine.model().await.value, 5);
    }

    #[tokio::test]
    async fn test_equal_query_shares_live_query() {
        let store = Arc::new(InMemoryEventStore::new());
        let engine = engine(&store);

        let first = engine.execute(Current, QueryOptions::default()).await.unwrap();
        let second = engine.execute(Current, QueryOptions::default()).await.unwrap();

        assert_eq!(engine.live_query_count(), 1);
        first.dispose();
        assert_eq!(second.status(), crate::live_query::LiveQueryStatus::Disposed);
        assert_eq!(engine.live_query_count(), 0);

        let third = engine.execute(Current, QueryOptions::default()).await.unwrap();
        assert_eq!(third.status(), crate::live_query::LiveQueryStatus::Running);
        assert_eq!(engine.live_query_count(), 1);
        assert_eq!(store.subscription_count(), 1);
    }

    fn incremented(position: u64, by: i64) -> EventEnvelope {
        EventEnvelope::new(EventMetadata::new(GlobalPos::from_raw(position)), Incremented(by))
    }

    #[tokio::test]
    async fn test_replayed_positions_are_applied_once() {
        let store = Arc::new(InMemoryEventStore::new());
        let engine = engine(&store);
        let inner = &engine.inner;

        inner
            .apply_batch(PartitionId::Root, vec![incremented(1, 1), incremented(2, 10)])
            .await;
        assert_eq!(engine.model().await.value, 11);

        // A resubscription replays the history it already delivered
        inner
            .apply_batch(
                PartitionId::Root,
                vec![incremented(1, 1), incremented(2, 10), incremented(3, 100)],
            )
            .await;
        assert_eq!(engine.model().await.value, 111);

        inner.apply_batch(PartitionId::Root, vec![incremented(2, 10)]).await;
        assert_eq!(engine.model().await.value, 111);

        // Checkpoints are per partition
        let keyed = PartitionId::Keyed(PartitionKey::new());
        inner.apply_batch(keyed, vec![incremented(2, 1000)]).await;
        assert_eq!(engine.model().await.value, 1111);
    }

    #[tokio::test]
    async fn test_shutdown_during_execute_leaves_nothing_registered() {
        let store = Arc::new(InMemoryEventStore::new());
        let slot: Arc<std::sync::OnceLock<QueryEngine<Counter>>> = Arc::new(std::sync::OnceLock::new());

        let handler_slot = Arc::clone(&slot);
        let engine = QueryEngine::<Counter>::builder(store.clone())
            .projection(projection())
            .query::<Current, _>(move |model, _| {
                // Shut down between the initial result and registration
                if let Some(engine) = handler_slot.get() {
                    engine.shutdown();
                }
                Ok(model.value)
            })
            .build()
            .unwrap();
        assert!(slot.set(engine.clone()).is_ok());

        let err = engine.execute(Current, QueryOptions::default()).await.unwrap_err();

        assert!(matches!(err, Error::EngineShutdown));
        assert!(engine.is_shutdown());
        assert_eq!(engine.live_query_count(), 0);
        assert_eq!(engine.partition_count(), 0);
        assert!(!engine.is_subscribed(PartitionId::Root));
    }

    #[tokio::test]
    async fn test_execute_after_shutdown_fails() {
        let store = Arc::new(InMemoryEventStore::new());
        let engine = engine(&store);
        engine.shutdown();
        engine.shutdown();

        let err = engine.execute(Current, QueryOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::EngineShutdown));
        assert!(engine.is_shutdown());
    }
}
