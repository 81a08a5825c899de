//! End-to-end scenarios across the profiler, cache, feature manager and
//! hardware monitor, driven through a settable probe.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use mofa_adaptive::adaptive::{
    AdaptiveRuntime, AnalysisContext, CacheConfig, Capability, ChangeKind, FeatureMethod,
    InferenceError, InferenceRunner, LoadedModel, LoaderError, ModelCache, ModelDescriptor,
    ModelLease, ModelLoader, ResourceMonitor, RuntimeConfig, StaticProbe, Tier,
};

// ============================================================================
// Test plugins
// ============================================================================

struct CountingLoader {
    loads: AtomicU64,
    fail: bool,
    delay: Duration,
}

impl CountingLoader {
    fn new() -> Self {
        Self {
            loads: AtomicU64::new(0),
            fail: false,
            delay: Duration::ZERO,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }
}

#[async_trait]
impl ModelLoader for CountingLoader {
    fn name(&self) -> &str {
        "counting"
    }

    async fn load(&self, descriptor: &ModelDescriptor) -> Result<LoadedModel, LoaderError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(LoaderError::NotFound(descriptor.model_name.clone()));
        }
        Ok(Arc::new(descriptor.model_name.clone()))
    }
}

struct NameRunner;

#[async_trait]
impl InferenceRunner for NameRunner {
    fn name(&self) -> &str {
        "name"
    }

    async fn run(
        &self,
        lease: &ModelLease,
        _text: &str,
        _context: &AnalysisContext,
    ) -> Result<Value, InferenceError> {
        let name = lease
            .downcast_ref::<String>()
            .ok_or_else(|| InferenceError::IncompatibleModel(lease.key().to_string()))?;
        Ok(json!({ "model": name }))
    }
}

async fn runtime_with(probe: StaticProbe, loader: CountingLoader) -> (Arc<StaticProbe>, Arc<AdaptiveRuntime>) {
    let probe = Arc::new(probe);
    let runtime = AdaptiveRuntime::new(
        RuntimeConfig::default().with_foreign_termination(false),
        probe.clone(),
        Arc::new(loader),
        Arc::new(NameRunner),
    )
    .await
    .unwrap();
    (probe, runtime)
}

fn roomy_cache(loader: Arc<CountingLoader>, budget_mb: u64) -> ModelCache {
    let resources = Arc::new(ResourceMonitor::new(Arc::new(
        StaticProbe::new().with_ram_mb(65_536, 60_000),
    )));
    ModelCache::new(loader, resources, CacheConfig::default(), budget_mb)
}

// ============================================================================
// Classification
// ============================================================================

#[tokio::test]
async fn low_ram_is_minimal_regardless_of_gpu_and_cpu() {
    let probe = StaticProbe::new()
        .with_ram_mb(2560, 1024)
        .with_cpu(32, 5000)
        .with_gpu("RTX 4090", 24_576, 24_000);
    let (_, runtime) = runtime_with(probe, CountingLoader::new()).await;
    assert_eq!(runtime.current_tier(), Tier::Minimal);
}

#[tokio::test]
async fn workstation_with_idle_gpu_is_high_end() {
    let probe = StaticProbe::new()
        .with_ram_mb(16_384, 8192)
        .with_gpu("RTX 3070", 8192, 7800);
    let (_, runtime) = runtime_with(probe, CountingLoader::new()).await;
    assert_eq!(runtime.current_tier(), Tier::HighEnd);
    assert!(runtime.features().can_perform(Capability::Semantic));
}

#[tokio::test]
async fn critical_gpu_pressure_forces_minimal() {
    let probe = StaticProbe::new()
        .with_ram_mb(16_384, 8192)
        .with_gpu("RTX 3070", 8192, 100);
    let (_, runtime) = runtime_with(probe, CountingLoader::new()).await;
    assert_eq!(runtime.current_tier(), Tier::Minimal);
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn repeated_acquire_returns_same_handle() {
    let loader = Arc::new(CountingLoader::new());
    let cache = roomy_cache(loader.clone(), 4096);
    let descriptor = ModelDescriptor::new(Capability::Sentiment, "distilbert", 270);

    let first = cache.acquire(Capability::Sentiment, &descriptor).await.unwrap();
    let second = cache.acquire(Capability::Sentiment, &descriptor).await.unwrap();
    let third = cache.acquire(Capability::Sentiment, &descriptor).await.unwrap();

    assert_eq!(first.id(), second.id());
    assert_eq!(second.id(), third.id());
    assert!(first.access_count() < second.access_count());
    assert!(second.access_count() < third.access_count());
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn idle_model_is_evicted_to_make_room() {
    let loader = Arc::new(CountingLoader::new());
    let cache = roomy_cache(loader, 1000);

    let idle = ModelDescriptor::new(Capability::Emotion, "emotion-small", 600);
    drop(cache.acquire(Capability::Emotion, &idle).await.unwrap());
    tokio::time::advance(Duration::from_secs(30)).await;

    let large = ModelDescriptor::new(Capability::Topics, "topics-large", 800);
    let lease = cache.acquire(Capability::Topics, &large).await.unwrap();

    assert!(!cache.contains(&idle.cache_key(Capability::Emotion)).await);
    assert_eq!(cache.usage_mb().await, 800);
    assert_eq!(lease.memory_mb(), 800);
}

#[tokio::test(start_paused = true)]
async fn eviction_is_least_recently_used_first() {
    let loader = Arc::new(CountingLoader::new());
    let cache = roomy_cache(loader, 1000);

    let a = ModelDescriptor::new(Capability::Sentiment, "a", 400);
    let b = ModelDescriptor::new(Capability::Emotion, "b", 400);
    drop(cache.acquire(Capability::Sentiment, &a).await.unwrap());
    tokio::time::advance(Duration::from_secs(1)).await;
    drop(cache.acquire(Capability::Emotion, &b).await.unwrap());
    tokio::time::advance(Duration::from_secs(1)).await;

    let c = ModelDescriptor::new(Capability::Topics, "c", 400);
    drop(cache.acquire(Capability::Topics, &c).await.unwrap());

    assert!(!cache.contains(&a.cache_key(Capability::Sentiment)).await);
    assert!(cache.contains(&b.cache_key(Capability::Emotion)).await);
    assert!(cache.usage_mb().await <= cache.budget_mb().await);
}

#[tokio::test]
async fn concurrent_acquires_share_one_load() {
    let loader = Arc::new(CountingLoader::slow(Duration::from_millis(50)));
    let cache = Arc::new(roomy_cache(loader.clone(), 4096));
    let descriptor = ModelDescriptor::new(Capability::Topics, "bart-large-mnli", 1650);

    let (left, right) = tokio::join!(
        cache.acquire(Capability::Topics, &descriptor),
        cache.acquire(Capability::Topics, &descriptor),
    );

    assert_eq!(left.unwrap().id(), right.unwrap().id());
    assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Features and runtime
// ============================================================================

#[tokio::test]
async fn ai_path_uses_loaded_model() {
    let (_, runtime) = runtime_with(StaticProbe::new().with_ram_mb(16_384, 8192), CountingLoader::new()).await;
    let result = runtime
        .analyze("what a day", Capability::Sentiment, &AnalysisContext::new())
        .await
        .unwrap();

    assert_eq!(result.method_used, FeatureMethod::Ai);
    assert!(!result.fallback_used);
    assert_eq!(result.value["model"], result.model_name.clone().unwrap().as_str());
}

#[tokio::test]
async fn loader_failure_falls_back() {
    let (_, runtime) = runtime_with(StaticProbe::new().with_ram_mb(16_384, 8192), CountingLoader::failing()).await;
    let result = runtime
        .analyze("I love this", Capability::Sentiment, &AnalysisContext::new())
        .await
        .unwrap();

    assert!(result.fallback_used);
    assert_eq!(result.method_used, FeatureMethod::Algorithmic);
    assert_eq!(result.value["label"], "positive");
    assert_eq!(runtime.cache().stats().await.load_failures, 1);
}

#[tokio::test]
async fn feature_table_round_trip() {
    let (_, runtime) = runtime_with(StaticProbe::new().with_ram_mb(16_384, 8192), CountingLoader::new()).await;
    let features = runtime.features();
    let table = runtime.profiler().capability_table();

    features.upgrade_features(Tier::Minimal, table.minimal.clone());
    assert!(!features.can_perform(Capability::Topics));
    let result = features
        .analyze("stock market and shares", Capability::Topics, &AnalysisContext::new())
        .await
        .unwrap();
    assert!(result.fallback_used);

    features.upgrade_features(Tier::Standard, table.standard.clone());
    assert!(features.can_perform(Capability::Topics));
}

#[tokio::test]
async fn cleanup_twice_evicts_nothing_second_time() {
    let (_, runtime) = runtime_with(StaticProbe::new().with_ram_mb(16_384, 8192), CountingLoader::new()).await;
    runtime
        .analyze("fine", Capability::Sentiment, &AnalysisContext::new())
        .await
        .unwrap();

    runtime.cleanup_unused_models().await;
    let second = runtime.cleanup_unused_models().await;
    assert!(second.evicted.is_empty());
}

#[tokio::test]
async fn gpu_hot_plug_migrates_tier_live() {
    let (probe, runtime) = runtime_with(StaticProbe::new().with_ram_mb(16_384, 8192), CountingLoader::new()).await;
    assert_eq!(runtime.current_tier(), Tier::Standard);
    assert!(!runtime.features().can_perform(Capability::Semantic));

    probe.set_gpu("RTX 4080", 16_384, 15_000);
    let report = runtime.force_hardware_refresh().await;
    assert_eq!(report.tier, Tier::HighEnd);
    assert!(report.changes.iter().any(|c| c.kind == ChangeKind::GpuAdded));
    assert!(runtime.features().can_perform(Capability::Semantic));

    probe.remove_gpu();
    let report = runtime.force_hardware_refresh().await;
    assert_eq!(report.tier, Tier::Standard);
    assert!(report.changes.iter().any(|c| c.kind == ChangeKind::GpuRemoved));
    assert!(runtime.cache().resident_models().await.is_empty());
}

#[tokio::test]
async fn unknown_capability_is_rejected_at_boundary() {
    let (_, runtime) = runtime_with(StaticProbe::new(), CountingLoader::new()).await;
    assert!(runtime
        .analyze_str("text", "mind_reading", &AnalysisContext::new())
        .await
        .is_err());
    let stats = runtime
        .analyze_str("one two three", "stats", &AnalysisContext::new())
        .await
        .unwrap();
    assert!(!stats.fallback_used);
}
