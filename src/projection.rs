//! Projections: typed per-event apply functions collected into a table.
//!
//! A [`Projection`] is built once at startup with [`ProjectionBuilder`]. Every
//! `.on::<E>(...)` call adds one entry to the projection's capability table,
//! keyed by the event's `TypeId`, and one member to its declared event
//! [`TypeSet`]. The table is then resolved at runtime by the type of each
//! delivered envelope, with no reflection involved.
//!
//! ```rust,ignore
//! let projection = Projection::<RoomModel>::builder("rooms")
//!     .on::<RoomAdded, _>(|model, _meta, ev| {
//!         model.rooms.insert(ev.number, Room::new(ev.number));
//!     })
//!     .on::<RoomBooked, _>(|model, _meta, ev| {
//!         if let Some(room) = model.rooms.get_mut(&ev.number) {
//!             room.bookings.push((ev.start, ev.end));
//!         }
//!     })
//!     .build();
//! ```

use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::schema::ProjectionSchema;
use crate::type_set::TypeSet;
use crate::types::{AnyEvent, Event, EventEnvelope, EventMetadata, Model, TypeKey};

/// Type-erased apply function stored in the capability table.
pub(crate) type ApplyFn<M> =
    Arc<dyn Fn(&mut M, &EventMetadata, &dyn AnyEvent) -> Result<()> + Send + Sync>;

/// Applies events of the declared types to a model.
pub struct Projection<M: Model> {
    schema: ProjectionSchema,
    handlers: HashMap<TypeId, ApplyFn<M>>,
}

impl<M: Model> Projection<M> {
    /// Starts building a projection named `name`.
    pub fn builder(name: impl Into<String>) -> ProjectionBuilder<M> {
        ProjectionBuilder {
            name: name.into(),
            events: Vec::new(),
            handlers: HashMap::new(),
        }
    }

    /// The projection's schema.
    pub fn schema(&self) -> &ProjectionSchema {
        &self.schema
    }

    /// The projection's name.
    pub fn name(&self) -> &str {
        &self.schema.name
    }

    /// Returns the apply function for `event_type`.
    pub(crate) fn apply_fn(&self, event_type: &TypeKey) -> Result<ApplyFn<M>> {
        self.handlers
            .get(&event_type.id())
            .cloned()
            .ok_or_else(|| Error::UnsupportedEventType {
                event_type: event_type.name().to_string(),
                projection: self.schema.name.clone(),
            })
    }

    /// Applies a single envelope.
    pub fn apply(&self, model: &mut M, envelope: &EventEnvelope) -> Result<()> {
        let apply = self.apply_fn(&envelope.event_type())?;
        apply(model, &envelope.metadata, envelope.event.as_ref())
    }

    /// Applies a batch in order, stopping at the first failure.
    pub fn execute(&self, model: &mut M, batch: &[EventEnvelope]) -> Result<()> {
        for envelope in batch {
            self.apply(model, envelope)?;
        }
        Ok(())
    }
}

impl<M: Model> fmt::Debug for Projection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Projection")
            .field("name", &self.schema.name)
            .field("events", &self.schema.events)
            .finish()
    }
}

/// Builder for [`Projection`].
pub struct ProjectionBuilder<M: Model> {
    name: String,
    events: Vec<TypeKey>,
    handlers: HashMap<TypeId, ApplyFn<M>>,
}

impl<M: Model> ProjectionBuilder<M> {
    /// Handles events of type `E` with an infallible apply function.
    ///
    /// Registering the same event type twice replaces the earlier function.
    pub fn on<E, F>(self, apply: F) -> Self
    where
        E: Event,
        F: Fn(&mut M, &EventMetadata, &E) + Send + Sync + 'static,
    {
        self.try_on::<E, _, std::convert::Infallible>(move |model, metadata, event| {
            apply(model, metadata, event);
            Ok(())
        })
    }

    /// Handles events of type `E` with a fallible apply function.
    ///
    /// Failures surface as [`Error::ProjectionFailed`].
    pub fn try_on<E, F, Err>(mut self, apply: F) -> Self
    where
        E: Event,
        F: Fn(&mut M, &EventMetadata, &E) -> std::result::Result<(), Err> + Send + Sync + 'static,
        Err: fmt::Display,
    {
        let projection = self.name.clone();
        let erased: ApplyFn<M> = Arc::new(move |model: &mut M, metadata: &EventMetadata, event: &dyn AnyEvent| -> Result<()> {
            let event = event.as_any().downcast_ref::<E>().ok_or_else(|| {
                Error::UnsupportedEventType {
                    event_type: event.event_type().name().to_string(),
                    projection: projection.clone(),
                }
            })?;

            apply(model, metadata, event).map_err(|e| Error::ProjectionFailed {
                projection: projection.clone(),
                event_type: E::NAME.to_string(),
                reason: e.to_string(),
            })
        });

        self.events.push(TypeKey::event::<E>());
        self.handlers.insert(TypeId::of::<E>(), erased);
        self
    }

    /// Finishes the projection.
    pub fn build(self) -> Projection<M> {
        let schema = ProjectionSchema::new(self.name, TypeKey::of::<M>(), TypeSet::new(self.events));

        Projection {
            schema,
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GlobalPos;

    #[derive(Default)]
    struct Tally {
        total: i64,
        seen: Vec<u64>,
    }

    impl Model for Tally {}

    #[derive(Debug)]
    struct Added(i64);
    impl Event for Added {
        const NAME: &'static str = "Added";
    }

    #[derive(Debug)]
    struct Withdrawn(i64);
    impl Event for Withdrawn {
        const NAME: &'static str = "Withdrawn";
    }

    #[derive(Debug)]
    struct Ignored;
    impl Event for Ignored {
        const NAME: &'static str = "Ignored";
    }

    fn tally() -> Projection<Tally> {
        Projection::builder("tally")
            .on::<Added, _>(|model: &mut Tally, meta, ev| {
                model.total += ev.0;
                model.seen.push(meta.position.as_raw());
            })
            .try_on::<Withdrawn, _, String>(|model: &mut Tally, meta, ev| {
                if ev.0 > model.total {
                    return Err(format!("insufficient total {}", model.total));
                }
                model.total -= ev.0;
                model.seen.push(meta.position.as_raw());
                Ok(())
            })
            .build()
    }

    fn envelope<E: Event>(pos: u64, event: E) -> EventEnvelope {
        EventEnvelope::new(EventMetadata::new(GlobalPos::from_raw(pos)), event)
    }

    #[test]
    fn test_schema_declares_registered_events() {
        let projection = tally();
        let schema = projection.schema();

        assert_eq!(schema.name, "tally");
        assert_eq!(schema.model, TypeKey::of::<Tally>());
        assert_eq!(schema.events.len(), 2);
        assert!(schema.events.contains_type::<Added>());
        assert!(!schema.events.contains_type::<Ignored>());
    }

    #[test]
    fn test_execute_applies_in_order() {
        let projection = tally();
        let mut model = Tally::default();

        projection
            .execute(&mut model, &[envelope(1, Added(10)), envelope(2, Withdrawn(4)), envelope(3, Added(1))])
            .unwrap();

        assert_eq!(model.total, 7);
        assert_eq!(model.seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_undeclared_event_is_unsupported() {
        let projection = tally();
        let mut model = Tally::default();

        let err = projection.apply(&mut model, &envelope(1, Ignored)).unwrap_err();
        assert!(matches!(err, Error::UnsupportedEventType { ref event_type, .. } if event_type == "Ignored"));
    }

    #[test]
    fn test_fallible_apply_reports_projection_failed() {
        let projection = tally();
        let mut model = Tally::default();

        let err = projection.apply(&mut model, &envelope(1, Withdrawn(5))).unwrap_err();
        match err {
            Error::ProjectionFailed { projection, event_type, reason } => {
                assert_eq!(projection, "tally");
                assert_eq!(event_type, "Withdrawn");
                assert!(reason.contains("insufficient"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(model.total, 0);
    }
}
