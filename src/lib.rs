//! # SpiteDB Live - Live Queries for Event-Sourced Read Models
//!
//! SpiteDB Live keeps query results up to date as events are appended. A
//! projection builds an in-memory model from a stream of events; queries read
//! that model, and any query can be made *live*: it is re-run and pushed to its
//! caller whenever new events for it arrive.
//!
//! - **Partitioned subscriptions**: queries that only depend on one partition
//!   of the stream only subscribe to that partition
//! - **Subscribe-once**: each partition is subscribed at most once, no matter
//!   how many queries execute against it concurrently
//! - **No missed events, no spurious updates**: a live query sees every event
//!   applied after its initial result and only those
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        QueryEngine<M>                           │
//! │            execute::<Q>(query) ──▶ LiveResult<Q>                │
//! │                                                                 │
//! │  ┌─────────────┐  ┌──────────────────┐  ┌────────────────────┐  │
//! │  │ ModelHolder │  │ PartitionRegistry│  │ Capability tables  │  │
//! │  │ RwLock<M>   │  │ partitions + live│  │ handlers/partitions│  │
//! │  └─────────────┘  └──────────────────┘  └────────────────────┘  │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ subscribe(schema, partition, sink)
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  PartitionSubscriber (event store)              │
//! │          catch-up batch, then live batches in append order      │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **One model per engine**: constructed lazily, mutated only by the
//!    delivery path under the exclusive lock
//! 2. **One subscription per partition**: established at most once, never
//!    left half-initialised after a failure
//! 3. **Forward-only lifecycle**: live queries go Created → Running →
//!    Disposed and never back
//! 4. **Consistent indices**: a live query is in the global index iff it is
//!    in its partition's map
//!
//! ## Module Organization
//!
//! - [`error`]: Error type for all failure modes
//! - [`types`]: Domain types (TypeKey, GlobalPos, PartitionKey, EventEnvelope, ...)
//! - [`type_set`]: Order-independent type sets with a stable hash
//! - [`schema`]: Projection and query schemas and their registers
//! - [`projection`]: Per-event apply functions
//! - [`model`]: Lazy model ownership
//! - [`live_query`]: Live query lifecycle and notifications
//! - [`handler`]: Event handler factories, query handlers and partitioners
//! - [`partition`]: Partition registry
//! - [`subscriber`]: The event store contract
//! - [`config`]: Engine configuration
//! - [`engine`]: The query engine (main entry point)
//! - [`store`]: In-memory event store

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for live query operations.
pub mod error;

/// Domain types.
///
/// Newtypes for positions and partition keys, runtime type keys, event
/// envelopes, and the `Event`, `Model` and `Query` traits.
pub mod types;

/// Order-independent type sets.
pub mod type_set;

/// Projection and query schemas.
pub mod schema;

/// Projections: typed per-event apply functions.
pub mod projection;

/// Lazy model ownership.
pub mod model;

/// Live queries.
///
/// The lifecycle state machine, the caller-facing [`LiveResult`] handle, and
/// change notifications over a broadcast channel.
pub mod live_query;

/// Event handler factories and query handler traits.
pub mod handler;

/// Partition registry and global live query index.
pub mod partition;

/// The event store contract consumed by the engine.
pub mod subscriber;

/// Engine configuration.
pub mod config;

/// The query engine.
///
/// The main entry point is [`QueryEngine`](engine::QueryEngine).
pub mod engine;

/// In-memory event store.
///
/// Implements [`PartitionSubscriber`] with the catch-up + live pattern. Used
/// by the tests and the stress binary.
pub mod store;

// =============================================================================
// Re-exports
// =============================================================================

pub use config::EngineConfig;
pub use engine::{QueryEngine, QueryEngineBuilder};
pub use error::{Error, Result};
pub use handler::{EventHandler, EventHandlerFactory, QueryHandler, QueryPartitioner};
pub use live_query::{
    LiveQuery, LiveQueryChanges, LiveQueryEvent, LiveQueryId, LiveQueryStatus, LiveResult, QueryOptions,
};
pub use projection::{Projection, ProjectionBuilder};
pub use schema::{ProjectionSchema, QuerySchema};
pub use store::InMemoryEventStore;
pub use subscriber::{BatchSink, PartitionSubscriber, SubscriptionHandle};
pub use type_set::{TypeSet, TypeSetHash};

pub use types::{
    AnyEvent, Event, EventEnvelope, EventMetadata, GlobalPos, Model, PartitionId, PartitionKey, Query,
    TypeKey,
};
