//! AdaptiveRuntime: the context object that owns every component.
//!
//! ```text
//! ┌──────────────────────────── AdaptiveRuntime ────────────────────────────┐
//! │                                                                         │
//! │  analyze ──▶ FeatureManager ──▶ ModelCache ──▶ ModelLoader              │
//! │                   │                 │                                   │
//! │                   │                 └──▶ ResourceMonitor ──▶ probe      │
//! │                   ▼                                                     │
//! │             fallback::run                                               │
//! │                                                                         │
//! │  HardwareMonitor ──▶ HardwareProfiler ──▶ probe                         │
//! │        └── reconfigures ModelCache budget and FeatureManager table      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! There is no global instance. Construct one per process (or per test) and
//! share the returned `Arc`.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Serialize;

use super::backend::{InferenceRunner, ModelLoader};
use super::cache::{CacheStats, CleanupReport, HandleInfo, ModelCache};
use super::config::RuntimeConfig;
use super::features::{AnalysisResult, FeatureAvailability, FeatureManager};
use super::monitor::{HardwareMonitor, MonitorStatus};
use super::probe::{PlatformProbe, SystemProbe};
use super::profiler::{ClassificationInfo, HardwareProfiler, NextTierRequirements};
use super::telemetry::{ProcessConflict, ResourceMonitor, ResourceSnapshot};
use super::types::{
    AnalysisContext, Capability, ChangeEvent, ConfigError, FeatureError, HardwareSnapshot,
    PressureLevel, Tier,
};

// ============================================================================
// Ops surface reports
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct SystemStatus {
    pub tier: Tier,
    pub classification: ClassificationInfo,
    pub hardware: HardwareSnapshot,
    pub memory: ResourceSnapshot,
    pub enabled_features: Vec<Capability>,
    pub cache: CacheStats,
    pub next_tier: NextTierRequirements,
    pub monitor: MonitorStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub previous_tier: Tier,
    pub tier: Tier,
    pub changes: Vec<ChangeEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemoryInfo {
    pub memory: ResourceSnapshot,
    pub pressure: PressureLevel,
    pub cache_usage_mb: u64,
    pub cache_budget_mb: u64,
    pub emergency_mode: bool,
    pub models: Vec<HandleInfo>,
    pub accelerator_processes: Vec<ProcessConflict>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OptimizationReport {
    pub tier: Tier,
    pub pressure: PressureLevel,
    pub suggestions: Vec<String>,
}

// ============================================================================
// AdaptiveRuntime
// ============================================================================

pub struct AdaptiveRuntime {
    config: RuntimeConfig,
    profiler: Arc<HardwareProfiler>,
    resources: Arc<ResourceMonitor>,
    cache: Arc<ModelCache>,
    features: Arc<FeatureManager>,
    monitor: Arc<HardwareMonitor>,
}

impl std::fmt::Debug for AdaptiveRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveRuntime")
            .field("tier", &self.monitor.current_tier())
            .field("cache", &self.cache)
            .field("monitor", &self.monitor)
            .finish()
    }
}

impl AdaptiveRuntime {
    /// Detect the hardware, classify it and wire every component for the
    /// resulting tier. Background tasks are not started; call [`start`].
    ///
    /// [`start`]: AdaptiveRuntime::start
    pub async fn new(
        config: RuntimeConfig,
        probe: Arc<dyn PlatformProbe>,
        loader: Arc<dyn ModelLoader>,
        runner: Arc<dyn InferenceRunner>,
    ) -> Result<Arc<Self>, ConfigError> {
        let profiler = Arc::new(
            HardwareProfiler::new(probe.clone(), config.capabilities.clone())?
                .with_cache_ttl(config.monitor.detection_cache_ttl),
        );
        let resources = Arc::new(ResourceMonitor::with_config(probe, &config.resources));

        let initial = profiler.detect().await;
        let (tier, info) = profiler.classify(&initial);

        let cache = Arc::new(ModelCache::new(loader, resources.clone(), config.cache.clone(), 0));
        let features = Arc::new(FeatureManager::new(
            cache.clone(),
            runner,
            tier,
            profiler.get_tier_capabilities(tier),
        ));
        let monitor = Arc::new(HardwareMonitor::new(
            profiler.clone(),
            cache.clone(),
            features.clone(),
            config.monitor.clone(),
            initial.clone(),
        ));
        cache.set_budget(monitor.budget_for(tier, &initial)).await;

        tracing::info!(
            "AdaptiveRuntime: initialized at tier {} (score {:.1}, budget {}MB)",
            tier,
            info.total_score,
            cache.budget_mb().await
        );

        Ok(Arc::new(Self {
            config,
            profiler,
            resources,
            cache,
            features,
            monitor,
        }))
    }

    /// Build on the host's real hardware.
    pub async fn with_system_probe(
        config: RuntimeConfig,
        loader: Arc<dyn ModelLoader>,
        runner: Arc<dyn InferenceRunner>,
    ) -> Result<Arc<Self>, ConfigError> {
        Self::new(config, Arc::new(SystemProbe::new()), loader, runner).await
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn profiler(&self) -> &Arc<HardwareProfiler> {
        &self.profiler
    }

    pub fn resources(&self) -> &Arc<ResourceMonitor> {
        &self.resources
    }

    pub fn cache(&self) -> &Arc<ModelCache> {
        &self.cache
    }

    pub fn features(&self) -> &Arc<FeatureManager> {
        &self.features
    }

    pub fn monitor(&self) -> &Arc<HardwareMonitor> {
        &self.monitor
    }

    pub fn current_tier(&self) -> Tier {
        self.monitor.current_tier()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Start the cache sweeps and the hardware poll.
    pub fn start(&self) {
        self.cache.start();
        self.monitor.start();
        tracing::info!("AdaptiveRuntime: background tasks started");
    }

    /// Stop background tasks. Resident models stay loaded.
    pub async fn stop(&self) {
        self.monitor.stop().await;
        self.cache.stop().await;
        tracing::info!("AdaptiveRuntime: background tasks stopped");
    }

    /// Stop background tasks and unload every model.
    pub async fn shutdown(&self) {
        self.monitor.stop().await;
        let unloaded = self.cache.shutdown().await;
        tracing::info!("AdaptiveRuntime: shut down ({} model(s) unloaded)", unloaded);
    }

    // ========================================================================
    // Analysis
    // ========================================================================

    pub async fn analyze(
        &self,
        text: &str,
        capability: Capability,
        context: &AnalysisContext,
    ) -> Result<AnalysisResult, FeatureError> {
        self.features.analyze(text, capability, context).await
    }

    pub async fn analyze_str(
        &self,
        text: &str,
        capability: &str,
        context: &AnalysisContext,
    ) -> Result<AnalysisResult, FeatureError> {
        self.features.analyze_str(text, capability, context).await
    }

    // ========================================================================
    // Ops surface
    // ========================================================================

    pub async fn get_system_status(&self) -> SystemStatus {
        let hardware = self.profiler.detect_cached().await;
        let monitor = self.monitor.status();
        SystemStatus {
            tier: monitor.tier,
            classification: monitor.classification.clone(),
            next_tier: self.profiler.next_tier_requirements(monitor.tier, &hardware),
            hardware,
            memory: self.resources.snapshot().await,
            enabled_features: self.features.enabled_features(),
            cache: self.cache.stats().await,
            monitor,
        }
    }

    pub fn get_available_features(&self) -> BTreeMap<Capability, FeatureAvailability> {
        self.features.available_features()
    }

    /// Run one hardware check now instead of waiting for the poll.
    pub async fn force_hardware_refresh(&self) -> RefreshReport {
        let previous_tier = self.monitor.current_tier();
        let changes = self.monitor.force_check().await;
        RefreshReport {
            previous_tier,
            tier: self.monitor.current_tier(),
            changes,
        }
    }

    pub async fn get_memory_info(&self) -> MemoryInfo {
        let memory = self.resources.snapshot().await;
        let pressure = self.resources.current_pressure().await;
        let stats = self.cache.stats().await;
        MemoryInfo {
            memory,
            pressure,
            cache_usage_mb: stats.usage_mb,
            cache_budget_mb: stats.budget_mb,
            emergency_mode: stats.emergency_mode,
            models: self.cache.resident_models().await,
            accelerator_processes: self.resources.process_conflicts().await,
        }
    }

    /// Evict models idle longer than the recovery idle threshold.
    pub async fn cleanup_unused_models(&self) -> CleanupReport {
        let report = self
            .cache
            .cleanup_unused(self.config.cache.recovery_idle_threshold)
            .await;
        tracing::info!(
            "AdaptiveRuntime: cleanup evicted {} model(s), freed {}MB",
            report.evicted.len(),
            report.freed_mb
        );
        report
    }

    /// Re-read the capability table and apply it to the current tier.
    pub async fn reload_capabilities(&self) -> Result<(), ConfigError> {
        self.profiler.reload_config()?;
        let tier = self.monitor.current_tier();
        self.features
            .upgrade_features(tier, self.profiler.get_tier_capabilities(tier));
        let budget = self.monitor.budget_for(tier, &self.monitor.current_snapshot());
        self.cache.set_budget(budget).await;
        Ok(())
    }

    /// Advice for the current tier and memory situation.
    pub async fn suggest_optimizations(&self) -> OptimizationReport {
        let tier = self.monitor.current_tier();
        let snapshot = self.monitor.current_snapshot();
        let pressure = self.resources.current_pressure().await;
        let stats = self.cache.stats().await;
        let models = self.cache.resident_models().await;
        let foreign: Vec<ProcessConflict> = self
            .resources
            .process_conflicts()
            .await
            .into_iter()
            .filter(|p| !p.is_own)
            .collect();

        let mut suggestions = Vec::new();

        if pressure >= PressureLevel::High {
            suggestions.push(format!(
                "Memory pressure is {}: close other applications or unload idle models",
                pressure
            ));
        }
        if stats.emergency_mode {
            suggestions.push(
                "Model cache is in emergency mode and keeps only the most recent model".to_string(),
            );
        }
        if !foreign.is_empty() {
            let held: u64 = foreign.iter().map(|p| p.memory_mb).sum();
            let names: Vec<String> = foreign
                .iter()
                .map(|p| format!("{} (pid {})", p.name, p.pid))
                .collect();
            suggestions.push(format!(
                "Other processes hold {}MB of GPU memory: {}",
                held,
                names.join(", ")
            ));
        }

        let idle_threshold = self.config.cache.recovery_idle_threshold.as_secs_f64();
        let idle: Vec<&HandleInfo> = models
            .iter()
            .filter(|m| m.leases == 0 && m.idle_secs > idle_threshold)
            .collect();
        if !idle.is_empty() {
            suggestions.push(format!(
                "{} idle model(s) hold {}MB; run cleanup to release them",
                idle.len(),
                idle.iter().map(|m| m.memory_mb).sum::<u64>()
            ));
        }

        let next = self.profiler.next_tier_requirements(tier, &snapshot);
        if next.next_tier.is_some() {
            suggestions.extend(
                next.notes
                    .iter()
                    .map(|note| format!("To unlock the next tier: {}", note)),
            );
        }

        if tier == Tier::Minimal {
            suggestions.push(
                "Only keyword and statistics analysis run natively at the minimal tier".to_string(),
            );
        }

        if suggestions.is_empty() {
            suggestions.push("No optimizations needed".to_string());
        }

        OptimizationReport {
            tier,
            pressure,
            suggestions,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
