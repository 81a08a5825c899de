//! Model Loader and Inference Runner Traits
//!
//! The cache never knows what a "model" is. Loading is delegated to a
//! [`ModelLoader`] and inference to an [`InferenceRunner`], both object-safe
//! async traits so the host application can plug in any model library:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     FeatureManager                       │
//! └──────────────┬──────────────────────────────┬────────────┘
//!                │ acquire()                    │ run(&lease)
//! ┌──────────────┴───────────────┐  ┌───────────┴────────────┐
//! │          ModelCache          │  │  dyn InferenceRunner   │
//! │   ┌──────────────────────┐   │  └────────────────────────┘
//! │   │   dyn ModelLoader    │   │
//! │   │ load / unload hooks  │   │
//! │   └──────────────────────┘   │
//! └──────────────────────────────┘
//! ```
//!
//! Loaded models are type-erased as [`LoadedModel`]; runners downcast them
//! back through [`ModelLease::downcast_ref`](super::cache::ModelLease::downcast_ref).
//!
//! ## Hooks
//!
//! Beyond `load`, loaders may override hooks the recovery ladder calls:
//!
//! | Hook | When |
//! |---|---|
//! | `unload` | a handle leaves the cache |
//! | `is_alive` | before serving a cache hit |
//! | `clear_accelerator_cache` | recovery levels 1 and 4 |
//! | `reclaim` | recovery level 4 (garbage-collection analogue) |

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;

use super::cache::ModelLease;
use super::types::{AnalysisContext, InferenceError, LoaderError, ModelDescriptor};

/// A loaded, type-erased model object.
pub type LoadedModel = Arc<dyn Any + Send + Sync>;

/// Loads model objects on behalf of the cache.
///
/// `load` runs while the cache lock is held, so at most one load is in
/// flight per cache.
#[async_trait]
pub trait ModelLoader: Send + Sync {
    fn name(&self) -> &str;

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<LoadedModel, LoaderError>;

    /// Release resources held by an evicted model.
    async fn unload(&self, _key: &str, _model: LoadedModel) {}

    /// A resident model that reports `false` is dropped and reloaded.
    fn is_alive(&self, _model: &LoadedModel) -> bool {
        true
    }

    /// Ask the accelerator allocator to return cached blocks.
    async fn clear_accelerator_cache(&self) {}

    /// Reclaim memory held by dropped models.
    async fn reclaim(&self) {}
}

/// Runs inference against a leased model.
#[async_trait]
pub trait InferenceRunner: Send + Sync {
    fn name(&self) -> &str;

    async fn run(
        &self,
        lease: &ModelLease,
        text: &str,
        context: &AnalysisContext,
    ) -> Result<serde_json::Value, InferenceError>;
}

// ============================================================================
// BlockingLoader
// ============================================================================

/// Adapts a synchronous load function (most model libraries) into a
/// [`ModelLoader`] by running it on the blocking thread pool.
pub struct BlockingLoader<F> {
    name: String,
    load_fn: Arc<F>,
}

impl<F> BlockingLoader<F>
where
    F: Fn(&ModelDescriptor) -> Result<LoadedModel, LoaderError> + Send + Sync + 'static,
{
    pub fn new(name: impl Into<String>, load_fn: F) -> Self {
        Self {
            name: name.into(),
            load_fn: Arc::new(load_fn),
        }
    }
}

impl<F> std::fmt::Debug for BlockingLoader<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockingLoader")
            .field("name", &self.name)
            .finish()
    }
}

#[async_trait]
impl<F> ModelLoader for BlockingLoader<F>
where
    F: Fn(&ModelDescriptor) -> Result<LoadedModel, LoaderError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<LoadedModel, LoaderError> {
        let load_fn = self.load_fn.clone();
        let descriptor = descriptor.clone();
        tokio::task::spawn_blocking(move || load_fn(&descriptor))
            .await
            .map_err(|e| LoaderError::Failed(format!("load task failed: {}", e)))?
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::types::Capability;

    #[allow(dead_code)]
    fn assert_object_safe(_: &dyn ModelLoader, _: &dyn InferenceRunner) {}

    #[allow(dead_code)]
    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_trait_bounds() {
        assert_send_sync::<Box<dyn ModelLoader>>();
        assert_send_sync::<Box<dyn InferenceRunner>>();
    }

    #[tokio::test]
    async fn test_blocking_loader() {
        let loader = BlockingLoader::new("blocking", |d: &ModelDescriptor| {
            if d.model_name == "missing" {
                return Err(LoaderError::NotFound(d.model_name.clone()));
            }
            Ok(Arc::new(d.model_name.len()) as LoadedModel)
        });

        let ok = loader
            .load(&ModelDescriptor::new(Capability::Sentiment, "tiny", 10))
            .await
            .unwrap();
        assert_eq!(ok.downcast_ref::<usize>(), Some(&4));

        let err = loader
            .load(&ModelDescriptor::new(Capability::Sentiment, "missing", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, LoaderError::NotFound(_)));

        assert!(loader.is_alive(&ok));
    }
}
