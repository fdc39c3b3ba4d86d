//! Lazy ownership of the engine's single model instance.

use std::sync::OnceLock;

use tokio::sync::RwLock;

use crate::types::Model;

/// Constructs a model on first use.
pub type ModelFactory<M> = Box<dyn Fn() -> M + Send + Sync>;

/// Owns the one model instance of an engine.
///
/// The model is built lazily by the factory the first time it is needed and
/// then lives as long as the holder. It sits behind a `tokio::sync::RwLock`:
/// queries and partitioners read it concurrently, the event delivery path is
/// its only writer.
pub struct ModelHolder<M: Model> {
    factory: ModelFactory<M>,
    model: OnceLock<RwLock<M>>,
}

impl<M: Model> ModelHolder<M> {
    /// Creates a holder that builds the model with `factory`.
    pub fn new(factory: ModelFactory<M>) -> Self {
        Self {
            factory,
            model: OnceLock::new(),
        }
    }

    /// Returns the model, constructing it exactly once.
    pub fn get_or_create(&self) -> &RwLock<M> {
        self.model.get_or_init(|| {
            tracing::debug!(model = std::any::type_name::<M>(), "model created");
            RwLock::new((self.factory)())
        })
    }

    /// Returns true once the model has been constructed.
    pub fn is_created(&self) -> bool {
        self.model.get().is_some()
    }
}

impl<M: Model + Default> Default for ModelHolder<M> {
    fn default() -> Self {
        Self::new(Box::new(M::default))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[derive(Default)]
    struct Counter {
        value: u64,
    }

    impl Model for Counter {}

    #[tokio::test]
    async fn test_model_is_created_once() {
        let constructed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&constructed);
        let holder = ModelHolder::new(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Counter::default()
        }));

        assert!(!holder.is_created());

        holder.get_or_create().write().await.value = 5;
        assert_eq!(holder.get_or_create().read().await.value, 5);

        assert!(holder.is_created());
        assert_eq!(constructed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_default_holder_uses_default_model() {
        let holder: ModelHolder<Counter> = ModelHolder::default();
        assert_eq!(holder.get_or_create().read().await.value, 0);
    }
}
