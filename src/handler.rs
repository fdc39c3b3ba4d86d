//! # Event Handlers and Query Handlers
//!
//! The engine is generic over one model type but has to dispatch events and
//! queries of many concrete types. This module holds the traits at those
//! seams and the factories that bridge them:
//!
//! ```text
//!                      EventHandlerFactory<M>
//!                    ┌──────────┴───────────┐
//!   ProjectionHandlerFactory<M>      QueryHandlerFactory<Q>
//!     event ──▶ apply to model         event ──▶ apply to model
//!                                            ──▶ QueryHandler<Q>::execute
//!                                            ──▶ LiveQuery<Q>::on_update
//! ```
//!
//! Factories only produce handlers for the event types the projection
//! declares; anything else is [`Error::UnsupportedEventType`]. Producing a
//! handler never touches the model.

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::live_query::LiveQuery;
use crate::projection::{ApplyFn, Projection};
use crate::schema::ProjectionSchema;
use crate::type_set::TypeSet;
use crate::types::{AnyEvent, EventMetadata, Model, PartitionKey, Query, TypeKey};

// =============================================================================
// Query Handlers and Partitioners
// =============================================================================

/// Computes the result of a query against the model.
///
/// Handlers run while the engine holds the model's shared lock, so they must
/// not block.
pub trait QueryHandler<Q: Query>: Send + Sync + 'static {
    /// Runs `query` against `model`.
    fn execute(&self, model: &Q::Model, query: &Q) -> Result<Q::Result>;
}

impl<Q, F> QueryHandler<Q> for F
where
    Q: Query,
    F: Fn(&Q::Model, &Q) -> Result<Q::Result> + Send + Sync + 'static,
{
    fn execute(&self, model: &Q::Model, query: &Q) -> Result<Q::Result> {
        self(model, query)
    }
}

/// Chooses the partition a query depends on.
///
/// Returning `None` binds the query to the root partition.
pub trait QueryPartitioner<Q: Query>: Send + Sync + 'static {
    /// Returns the partition key for `query`.
    fn calculate_partition(&self, model: &Q::Model, query: &Q) -> Option<PartitionKey>;
}

impl<Q, F> QueryPartitioner<Q> for F
where
    Q: Query,
    F: Fn(&Q::Model, &Q) -> Option<PartitionKey> + Send + Sync + 'static,
{
    fn calculate_partition(&self, model: &Q::Model, query: &Q) -> Option<PartitionKey> {
        self(model, query)
    }
}

// =============================================================================
// Event Handlers
// =============================================================================

/// Applies one event to the model.
pub trait EventHandler<M: Model>: Send + Sync {
    /// Applies `event` to `model`.
    fn execute(&self, model: &mut M, metadata: &EventMetadata, event: &dyn AnyEvent) -> Result<()>;
}

/// Produces event handlers for the event types of a projection schema.
pub trait EventHandlerFactory<M: Model>: Send + Sync {
    /// The schema the factory serves.
    fn schema(&self) -> &ProjectionSchema;

    /// The event types a handler can be created for.
    fn supported_event_types(&self) -> &TypeSet {
        &self.schema().events
    }

    /// Creates the handler for `event_type`.
    fn create_handler(&self, event_type: &TypeKey) -> Result<Arc<dyn EventHandler<M>>>;
}

fn unsupported(schema: &ProjectionSchema, event_type: &TypeKey) -> Error {
    Error::UnsupportedEventType {
        event_type: event_type.name().to_string(),
        projection: schema.name.clone(),
    }
}

// =============================================================================
// Projection Handlers
// =============================================================================

struct ProjectionHandler<M: Model> {
    apply: ApplyFn<M>,
}

impl<M: Model> EventHandler<M> for ProjectionHandler<M> {
    fn execute(&self, model: &mut M, metadata: &EventMetadata, event: &dyn AnyEvent) -> Result<()> {
        (self.apply)(model, metadata, event)
    }
}

/// Handler factory backed by a [`Projection`].
///
/// One handler per declared event type is built up front; `create_handler`
/// only looks it up.
pub struct ProjectionHandlerFactory<M: Model> {
    projection: Arc<Projection<M>>,
    handlers: HashMap<TypeId, Arc<dyn EventHandler<M>>>,
}

impl<M: Model> ProjectionHandlerFactory<M> {
    /// Builds the handler table for `projection`.
    pub fn new(projection: Arc<Projection<M>>) -> Result<Self> {
        let mut handlers: HashMap<TypeId, Arc<dyn EventHandler<M>>> = HashMap::new();
        for event_type in &projection.schema().events {
            let apply = projection.apply_fn(event_type)?;
            handlers.insert(event_type.id(), Arc::new(ProjectionHandler { apply }));
        }

        Ok(Self { projection, handlers })
    }

    /// The projection behind the factory.
    pub fn projection(&self) -> &Arc<Projection<M>> {
        &self.projection
    }
}

impl<M: Model> EventHandlerFactory<M> for ProjectionHandlerFactory<M> {
    fn schema(&self) -> &ProjectionSchema {
        self.projection.schema()
    }

    fn create_handler(&self, event_type: &TypeKey) -> Result<Arc<dyn EventHandler<M>>> {
        if !self.supported_event_types().contains(event_type) {
            return Err(unsupported(self.schema(), event_type));
        }

        self.handlers
            .get(&event_type.id())
            .cloned()
            .ok_or_else(|| unsupported(self.schema(), event_type))
    }
}

impl<M: Model> fmt::Debug for ProjectionHandlerFactory<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProjectionHandlerFactory")
            .field("projection", &self.projection.name())
            .field("events", &self.projection.schema().events)
            .finish()
    }
}

// =============================================================================
// Query-Bound Handlers
// =============================================================================

/// Outcome of refreshing one live query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// A new result was pushed.
    Updated,
    /// The live query was already disposed; nothing was computed.
    Skipped,
}

/// Handler factory bound to one live query.
///
/// Handlers it creates apply the event through the projection and then rerun
/// the bound query. The engine uses [`QueryHandlerFactory::refresh`] directly
/// after a whole batch was applied.
pub struct QueryHandlerFactory<Q: Query> {
    projection: Arc<ProjectionHandlerFactory<Q::Model>>,
    binding: Arc<QueryBinding<Q>>,
}

struct QueryBinding<Q: Query> {
    handler: Arc<dyn QueryHandler<Q>>,
    live: Arc<LiveQuery<Q>>,
}

impl<Q: Query> QueryBinding<Q> {
    fn refresh(&self, model: &Q::Model) -> Result<RefreshOutcome> {
        if self.live.is_disposed() {
            return Ok(RefreshOutcome::Skipped);
        }

        let result = self.handler.execute(model, self.live.query())?;
        self.live.on_update(result)?;
        Ok(RefreshOutcome::Updated)
    }
}

impl<Q: Query> QueryHandlerFactory<Q> {
    /// Binds `live` to its query handler and the projection.
    pub fn new(
        projection: Arc<ProjectionHandlerFactory<Q::Model>>,
        handler: Arc<dyn QueryHandler<Q>>,
        live: Arc<LiveQuery<Q>>,
    ) -> Self {
        Self {
            projection,
            binding: Arc::new(QueryBinding { handler, live }),
        }
    }

    /// The bound live query.
    pub fn live(&self) -> &Arc<LiveQuery<Q>> {
        &self.binding.live
    }

    /// Reruns the query against `model` and pushes the result.
    pub fn refresh(&self, model: &Q::Model) -> Result<RefreshOutcome> {
        self.binding.refresh(model)
    }
}

struct QueryBoundHandler<Q: Query> {
    apply: Arc<dyn EventHandler<Q::Model>>,
    binding: Arc<QueryBinding<Q>>,
}

impl<Q: Query> EventHandler<Q::Model> for QueryBoundHandler<Q> {
    fn execute(&self, model: &mut Q::Model, metadata: &EventMetadata, event: &dyn AnyEvent) -> Result<()> {
        self.apply.execute(model, metadata, event)?;
        self.binding.refresh(model).map(|_| ())
    }
}

impl<Q: Query> EventHandlerFactory<Q::Model> for QueryHandlerFactory<Q> {
    fn schema(&self) -> &ProjectionSchema {
        self.projection.schema()
    }

    fn create_handler(&self, event_type: &TypeKey) -> Result<Arc<dyn EventHandler<Q::Model>>> {
        let apply = self.projection.create_handler(event_type)?;
        Ok(Arc::new(QueryBoundHandler {
            apply,
            binding: Arc::clone(&self.binding),
        }))
    }
}

impl<Q: Query> fmt::Debug for QueryHandlerFactory<Q> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryHandlerFactory")
            .field("projection", &self.projection.projection().name())
            .field("live", &self.binding.live)
            .finish()
    }
}
