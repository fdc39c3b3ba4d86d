//! # Error Handling for the Live Query Engine
//!
//! A single error enum ([`Error`]) covers every failure mode of the engine,
//! so callers of [`QueryEngine::execute`](crate::engine::QueryEngine::execute)
//! match on one type regardless of which component failed.
//!
//! ## Error Categories
//!
//! | Category | Variants | Typical Response |
//! |----------|----------|------------------|
//! | Configuration | `UnregisteredQuery`, `UnregisteredProjection`, `DuplicateRegistration` | Fix registration, do not retry |
//! | Transport | `SubscriptionFailed` | Retry `execute` |
//! | Schema mismatch | `UnsupportedEventType` | Fix the projection's declared events |
//! | Handler | `QueryFailed`, `ProjectionFailed` | Propagated from `execute`, isolated during delivery |
//! | Programming error | `InvalidLiveQueryState` | Logged and dropped by the delivery loop |
//! | Lifecycle | `EngineShutdown` | Stop issuing queries |

use thiserror::Error;

use crate::live_query::LiveQueryStatus;
use crate::types::PartitionId;

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in live query operations.
///
/// # Example
///
/// ```rust,ignore
/// use spitedb_live::Error;
///
/// match engine.execute(GetRoom(101), QueryOptions::default()).await {
///     Ok(live) => println!("room: {:?}", live.result()),
///     Err(Error::SubscriptionFailed { partition, .. }) => {
///         // transport hiccup, safe to retry
///     }
///     Err(e) => return Err(e),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Configuration Errors (fix registration, retrying will not help)
    // =========================================================================

    /// No query handler or schema was registered for the query type.
    #[error("query type '{query_type}' is not registered")]
    UnregisteredQuery {
        /// Canonical name of the query type
        query_type: String,
    },

    /// No projection was registered for the model type.
    #[error("no projection is registered for model type '{model_type}'")]
    UnregisteredProjection {
        /// Canonical name of the model type
        model_type: String,
    },

    /// The same query, partitioner or projection was registered twice.
    #[error("{kind} '{name}' is already registered")]
    DuplicateRegistration {
        /// What was registered ("query", "partitioner", "projection")
        kind: &'static str,
        /// Canonical name of the registered type
        name: String,
    },

    // =========================================================================
    // Transport Errors (caller may retry)
    // =========================================================================

    /// Establishing the subscription for a partition failed.
    ///
    /// # Guarantees
    ///
    /// The failing caller discards the partition record unless another
    /// caller still holds it. A record left behind this way has no
    /// subscription, so a later `execute` for the same partition attempts a
    /// fresh one. Events the failed attempt already delivered are not
    /// applied again by that retry.
    #[error("subscription for partition {partition} failed: {reason}")]
    SubscriptionFailed {
        /// The partition whose subscription could not be established
        partition: PartitionId,
        /// Transport-provided reason
        reason: String,
    },

    // =========================================================================
    // Schema Errors
    // =========================================================================

    /// A handler was requested for an event type the projection does not declare.
    #[error("event type '{event_type}' is not declared by projection '{projection}'")]
    UnsupportedEventType {
        /// Canonical name of the event type
        event_type: String,
        /// Name of the projection
        projection: String,
    },

    // =========================================================================
    // Handler Errors
    // =========================================================================

    /// A query handler failed to produce a result.
    #[error("query '{query_type}' failed: {reason}")]
    QueryFailed {
        /// Canonical name of the query type
        query_type: String,
        /// Handler-provided reason
        reason: String,
    },

    /// A projection failed to apply an event to the model.
    #[error("projection '{projection}' failed to apply '{event_type}': {reason}")]
    ProjectionFailed {
        /// Name of the projection
        projection: String,
        /// Canonical name of the event type
        event_type: String,
        /// Projection-provided reason
        reason: String,
    },

    // =========================================================================
    // Programming Errors
    // =========================================================================

    /// A result was pushed into a live query in a state that does not accept it.
    ///
    /// Raised when `on_result` is called twice, or when `on_update`/`on_result`
    /// is called on a disposed live query. The delivery loop logs this and
    /// moves on to the next live query.
    #[error("cannot {operation} live query '{query}' in status {status:?}")]
    InvalidLiveQueryState {
        /// Debug rendering of the query value
        query: String,
        /// Status the live query was in
        status: LiveQueryStatus,
        /// Operation that was rejected ("set initial result", "update")
        operation: &'static str,
    },

    /// The engine was shut down.
    #[error("query engine has been shut down")]
    EngineShutdown,
}

impl Error {
    /// Builds a [`Error::QueryFailed`] for query type `Q`.
    ///
    /// Query handlers use this to report domain failures:
    ///
    /// ```rust,ignore
    /// let room = model.rooms.get(&query.0)
    ///     .ok_or_else(|| Error::query_failed::<GetRoom>("room not found"))?;
    /// ```
    pub fn query_failed<Q: 'static>(reason: impl Into<String>) -> Self {
        Self::QueryFailed {
            query_type: std::any::type_name::<Q>().to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true if retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::SubscriptionFailed { .. })
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PartitionKey;

    #[test]
    fn test_error_display() {
        let unregistered = Error::UnregisteredQuery {
            query_type: "GetRoom".to_string(),
        };
        assert_eq!(unregistered.to_string(), "query type 'GetRoom' is not registered");

        let unsupported = Error::UnsupportedEventType {
            event_type: "RoomClosed".to_string(),
            projection: "rooms".to_string(),
        };
        assert_eq!(
            unsupported.to_string(),
            "event type 'RoomClosed' is not declared by projection 'rooms'"
        );

        let invalid = Error::InvalidLiveQueryState {
            query: "GetRoom(101)".to_string(),
            status: LiveQueryStatus::Disposed,
            operation: "update",
        };
        assert_eq!(
            invalid.to_string(),
            "cannot update live query 'GetRoom(101)' in status Disposed"
        );
    }

    #[test]
    fn test_subscription_failed_mentions_partition() {
        let root = Error::SubscriptionFailed {
            partition: PartitionId::Root,
            reason: "connection refused".to_string(),
        };
        assert_eq!(
            root.to_string(),
            "subscription for partition root failed: connection refused"
        );

        let key = PartitionKey::new();
        let keyed = Error::SubscriptionFailed {
            partition: PartitionId::Keyed(key),
            reason: "timeout".to_string(),
        };
        assert!(keyed.to_string().contains(&key.to_string()));
    }

    #[test]
    fn test_only_subscription_failures_are_retryable() {
        let transient = Error::SubscriptionFailed {
            partition: PartitionId::Root,
            reason: "timeout".to_string(),
        };
        assert!(transient.is_retryable());
        assert!(!Error::EngineShutdown.is_retryable());
        assert!(!Error::query_failed::<u32>("boom").is_retryable());
    }
}
