//! Projection and query schemas, and the registers that look them up.
//!
//! Schemas are static descriptions built once at startup:
//!
//! - A [`ProjectionSchema`] names the model a projection builds and the event
//!   types it declares interest in.
//! - A [`QuerySchema`] ties a query type to its model, result and projection.
//!
//! The registers are read-only after the engine is built; the engine only
//! calls `find_by_model_type` and `get_by_query_type`.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::type_set::{TypeSet, TypeSetHash};
use crate::types::{Query, TypeKey};

// =============================================================================
// Schemas
// =============================================================================

/// Static description of a projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectionSchema {
    /// Projection name, also the category of its streams.
    pub name: String,

    /// The model type the projection builds.
    pub model: TypeKey,

    /// Event types the projection applies.
    pub events: TypeSet,
}

impl ProjectionSchema {
    /// Creates a schema.
    pub fn new(name: impl Into<String>, model: TypeKey, events: TypeSet) -> Self {
        Self {
            name: name.into(),
            model,
            events,
        }
    }

    /// Stable identifier of the projection, derived from its declared events.
    pub fn hash(&self) -> TypeSetHash {
        self.events.hash()
    }

    /// Returns true if the projection declares `event_type`.
    pub fn handles(&self, event_type: &TypeKey) -> bool {
        self.events.contains(event_type)
    }
}

/// Static description of a query type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuerySchema {
    /// The query type.
    pub query: TypeKey,

    /// The model the query reads.
    pub model: TypeKey,

    /// The result the query produces.
    pub result: TypeKey,

    /// Name of the projection that builds the model.
    pub projection: String,
}

impl QuerySchema {
    /// Describes query type `Q`, served by the projection named `projection`.
    pub fn of<Q: Query>(projection: impl Into<String>) -> Self {
        Self {
            query: TypeKey::of::<Q>(),
            model: TypeKey::of::<Q::Model>(),
            result: TypeKey::of::<Q::Result>(),
            projection: projection.into(),
        }
    }
}

// =============================================================================
// Registers
// =============================================================================

/// Looks up projection schemas by model type.
#[derive(Debug, Default)]
pub struct ProjectionSchemaRegister {
    by_model: HashMap<TypeKey, Arc<ProjectionSchema>>,
}

impl ProjectionSchemaRegister {
    /// Creates an empty register.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema. At most one projection per model type.
    pub fn register(&mut self, schema: ProjectionSchema) -> Result<Arc<ProjectionSchema>> {
        if self.by_model.contains_key(&schema.model) {
            return Err(Error::DuplicateRegistration {
                kind: "projection",
                name: schema.model.name().to_string(),
            });
        }

        let schema = Arc::new(schema);
        self.by_model.insert(schema.model, Arc::clone(&schema));
        Ok(schema)
    }

    /// Returns the schema of the projection that builds `model`.
    pub fn find_by_model_type(&self, model: &TypeKey) -> Result<Arc<ProjectionSchema>> {
        self.by_model
            .get(model)
            .cloned()
            .ok_or_else(|| Error::UnregisteredProjection {
                model_type: model.name().to_string(),
            })
    }

    /// Number of registered projections.
    pub fn len(&self) -> usize {
        self.by_model.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_model.is_empty()
    }
}

/// Looks up query schemas by query type.
#[derive(Debug, Default)]
pub struct QuerySchemaRegister {
    by_query: HashMap<TypeKey, Arc<QuerySchema>>,
}

impl QuerySchemaRegister {
    /// Creates an empty register.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a schema. At most one schema per query type.
    pub fn register(&mut self, schema: QuerySchema) -> Result<Arc<QuerySchema>> {
        if self.by_query.contains_key(&schema.query) {
            return Err(Error::DuplicateRegistration {
                kind: "query",
                name: schema.query.name().to_string(),
            });
        }

        let schema = Arc::new(schema);
        self.by_query.insert(schema.query, Arc::clone(&schema));
        Ok(schema)
    }

    /// Returns the schema of `query`.
    pub fn get_by_query_type(&self, query: &TypeKey) -> Result<Arc<QuerySchema>> {
        self.by_query
            .get(query)
            .cloned()
            .ok_or_else(|| Error::UnregisteredQuery {
                query_type: query.name().to_string(),
            })
    }

    /// Returns true if `query` is registered.
    pub fn contains(&self, query: &TypeKey) -> bool {
        self.by_query.contains_key(query)
    }

    /// Number of registered queries.
    pub fn len(&self) -> usize {
        self.by_query.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.by_query.is_empty()
    }
}
