//! # Domain Types for Live Queries
//!
//! This module defines the core types the engine passes around: type
//! identifiers, log positions, partition keys, event envelopes, and the three
//! traits user code implements ([`Event`], [`Model`], [`Query`]).
//!
//! ## Design Philosophy: Newtypes for Safety
//!
//! As in the rest of SpiteDB, primitives are wrapped in single-field structs:
//! a [`PartitionKey`] is not interchangeable with an event id even though both
//! are UUIDs, and a [`GlobalPos`] cannot be confused with a version counter.
//!
//! ## Runtime Type Identity
//!
//! The engine is generic over the model, but it stores handlers for many event
//! and query types in capability tables. [`TypeKey`] is the key of those
//! tables: a `TypeId` for exact lookup plus a canonical name used for hashing
//! and error messages.

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

// =============================================================================
// Type Identification
// =============================================================================

/// A runtime identifier for a Rust type.
///
/// Equality and hashing use only the `TypeId`; the name is carried for
/// diagnostics and for the order-independent [`TypeSet`](crate::TypeSet) hash.
///
/// # Example
///
/// ```rust
/// use spitedb_live::types::TypeKey;
///
/// let a = TypeKey::of::<String>();
/// let b = TypeKey::named::<String>("String");
/// assert_eq!(a, b); // same TypeId, names are not compared
/// ```
#[derive(Clone, Copy)]
pub struct TypeKey {
    id: TypeId,
    name: &'static str,
}

impl TypeKey {
    /// Identifies `T` using the compiler-provided type name.
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    /// Identifies `T` under an explicit canonical name.
    ///
    /// Use this when the name feeds a persisted hash; `type_name` output is
    /// not guaranteed to be stable across compiler versions.
    pub fn named<T: ?Sized + 'static>(name: &'static str) -> Self {
        Self {
            id: TypeId::of::<T>(),
            name,
        }
    }

    /// Identifies an event type by its declared [`Event::NAME`].
    pub fn event<E: Event>() -> Self {
        Self::named::<E>(E::NAME)
    }

    /// Returns the underlying `TypeId`.
    pub fn id(&self) -> TypeId {
        self.id
    }

    /// Returns the canonical name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns true if this key identifies `T`.
    pub fn is<T: ?Sized + 'static>(&self) -> bool {
        self.id == TypeId::of::<T>()
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for TypeKey {}

impl Hash for TypeKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeKey({})", self.name)
    }
}

impl fmt::Display for TypeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

// =============================================================================
// Positions
// =============================================================================

/// A position in the global event log.
///
/// # Invariants
///
/// - Strictly increases with each appended event
/// - Starts at 1 (zero is never a valid position)
///
/// Subscriptions use it to skip events already delivered during catch-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GlobalPos(u64);

impl GlobalPos {
    /// The first valid position (1, not 0).
    pub const FIRST: GlobalPos = GlobalPos(1);

    /// Creates a GlobalPos from a raw value.
    ///
    /// # Panics
    ///
    /// Panics if `value` is 0.
    pub fn from_raw(value: u64) -> Self {
        assert!(value > 0, "GlobalPos cannot be zero");
        Self(value)
    }

    /// Returns the raw u64 value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the next position.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for GlobalPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Partitions
// =============================================================================

/// Identifies one partition of a projection's event stream.
///
/// Partitioners return a key for queries that only depend on a subset of the
/// stream (one tenant, one hotel, ...). Queries without a key read the root
/// stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionKey(Uuid);

impl PartitionKey {
    /// Creates a new random partition key.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for PartitionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for PartitionKey {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

/// The partition a live query is bound to.
///
/// `Root` is the distinguished partition for queries whose partitioner
/// returned no key (or that have no partitioner at all).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PartitionId {
    /// The unpartitioned stream.
    Root,
    /// A keyed partition stream.
    Keyed(PartitionKey),
}

impl PartitionId {
    /// Returns true for the root partition.
    pub fn is_root(&self) -> bool {
        matches!(self, PartitionId::Root)
    }

    /// Returns the partition key, `None` for the root partition.
    pub fn key(&self) -> Option<PartitionKey> {
        match self {
            PartitionId::Root => None,
            PartitionId::Keyed(key) => Some(*key),
        }
    }
}

impl From<Option<PartitionKey>> for PartitionId {
    fn from(key: Option<PartitionKey>) -> Self {
        match key {
            Some(key) => PartitionId::Keyed(key),
            None => PartitionId::Root,
        }
    }
}

impl From<PartitionKey> for PartitionId {
    fn from(key: PartitionKey) -> Self {
        PartitionId::Keyed(key)
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PartitionId::Root => f.write_str("root"),
            PartitionId::Keyed(key) => write!(f, "{}", key),
        }
    }
}

// =============================================================================
// Events
// =============================================================================

/// A domain event that projections can apply.
///
/// `NAME` is the canonical, build-independent name of the event. It is what
/// the [`TypeSet`](crate::TypeSet) hash of a projection is computed from, so
/// renaming a Rust type does not change a projection's identity.
///
/// ```rust
/// use spitedb_live::types::Event;
///
/// #[derive(Debug)]
/// struct RoomAdded { number: u32 }
///
/// impl Event for RoomAdded {
///     const NAME: &'static str = "RoomAdded";
/// }
/// ```
pub trait Event: Any + Send + Sync + fmt::Debug {
    /// Canonical event name.
    const NAME: &'static str;
}

/// Object-safe view of an [`Event`], used inside envelopes.
pub trait AnyEvent: Any + Send + Sync + fmt::Debug {
    /// Returns the runtime type key of the event.
    fn event_type(&self) -> TypeKey;

    /// Upcasts to `Any` for downcasting to the concrete event.
    fn as_any(&self) -> &dyn Any;
}

impl<E: Event> AnyEvent for E {
    fn event_type(&self) -> TypeKey {
        TypeKey::event::<E>()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Metadata stored alongside every event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventMetadata {
    /// Unique id of this event.
    pub event_id: Uuid,

    /// Position of the event in the global log.
    pub position: GlobalPos,

    /// Timestamp when the event was stored (Unix milliseconds).
    pub timestamp_ms: u64,

    /// Correlation id shared by all events of one business transaction.
    pub correlation_id: Option<Uuid>,

    /// Id of the message (command or event) that caused this event.
    pub causation_id: Option<Uuid>,
}

impl EventMetadata {
    /// Creates metadata for an event stored at `position`, stamped now.
    pub fn new(position: GlobalPos) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default();

        Self {
            event_id: Uuid::new_v4(),
            position,
            timestamp_ms,
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Sets the correlation id.
    pub fn with_correlation(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    /// Sets the causation id.
    pub fn with_causation(mut self, causation_id: Uuid) -> Self {
        self.causation_id = Some(causation_id);
        self
    }
}

/// One event plus its metadata, as delivered by a subscription.
///
/// The payload sits behind an `Arc` so the same envelope can be broadcast to
/// several subscriptions without copying the event.
#[derive(Debug, Clone)]
pub struct EventEnvelope {
    /// Storage metadata.
    pub metadata: EventMetadata,

    /// The event payload.
    pub event: Arc<dyn AnyEvent>,
}

impl EventEnvelope {
    /// Wraps a concrete event.
    pub fn new<E: Event>(metadata: EventMetadata, event: E) -> Self {
        Self {
            metadata,
            event: Arc::new(event),
        }
    }

    /// Returns the runtime type of the payload.
    pub fn event_type(&self) -> TypeKey {
        self.event.event_type()
    }

    /// Returns the payload as `E` if it is one.
    pub fn downcast_ref<E: Event>(&self) -> Option<&E> {
        self.event.as_any().downcast_ref::<E>()
    }

    /// Returns the global position of the event.
    pub fn position(&self) -> GlobalPos {
        self.metadata.position
    }
}

// =============================================================================
// Models and Queries
// =============================================================================

/// Read state built by a projection.
///
/// One instance exists per engine; it is mutated only by projections while
/// the engine holds the model's write lock.
pub trait Model: Send + Sync + 'static {}

/// A read request against a model.
///
/// Queries are values: two equal queries are the same live query, which is
/// why `Eq + Hash` are required.
pub trait Query: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// The model the query reads.
    type Model: Model;

    /// The result the query produces.
    type Result: Clone + Send + Sync + 'static;
}

// =============================================================================
// Tests
// =============================================================================
