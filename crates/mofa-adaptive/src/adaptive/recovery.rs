//! Memory Recovery: Escalating Cleanup and Pressure Sweeps
//!
//! When LRU eviction alone cannot make room for a model, the cache climbs a
//! four-level ladder. Each level runs only if the previous one left too little
//! headroom, and each is logged with usage before and after:
//!
//! ```text
//! Level 1  clear accelerator allocator cache          (loader hook)
//!    │ still short
//! Level 2  evict handles idle > 2min
//!    │ still short
//! Level 3  evict everything but the most recently used handle
//!    │ still short
//! Level 4  evict everything, reclaim, clear caches again,
//!          terminate foreign accelerator processes (GPU models only)
//!    │ still short
//!    ▼
//! CacheError::InsufficientMemory   (never retried automatically)
//! ```
//!
//! Leased handles are skipped at every level.
//!
//! The pressure sweep applies the same machinery on a timer: MEDIUM and HIGH
//! pressure run an idle sweep with half the normal timeout, CRITICAL enters
//! emergency mode and keeps only the most recently used handle. Emergency mode
//! sticks until pressure is back to LOW.

use serde::Serialize;
use tokio::time::Duration;

use super::cache::{CacheInner, EvictionResult, ModelCache};
use super::telemetry::TerminationReport;
use super::types::{DeviceAffinity, PressureLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryLevel {
    ClearAcceleratorCache = 1,
    EvictIdle = 2,
    KeepMostRecent = 3,
    FullCleanup = 4,
}

impl RecoveryLevel {
    pub const ALL: [RecoveryLevel; 4] = [
        RecoveryLevel::ClearAcceleratorCache,
        RecoveryLevel::EvictIdle,
        RecoveryLevel::KeepMostRecent,
        RecoveryLevel::FullCleanup,
    ];

    pub fn number(self) -> u8 {
        self as u8
    }
}

/// What a ladder run did.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    pub required_mb: u64,
    pub levels_run: Vec<RecoveryLevel>,
    pub satisfied: bool,
    pub evicted: Vec<EvictionResult>,
    pub usage_before_mb: u64,
    pub usage_after_mb: u64,
    pub termination: Option<TerminationReport>,
}

/// What a pressure sweep did.
#[derive(Debug, Clone, Serialize)]
pub struct PressureSweep {
    pub pressure: PressureLevel,
    pub emergency_mode: bool,
    pub evicted: Vec<EvictionResult>,
}

/// Idle timeout for a pressure sweep, `None` when no sweep is needed.
fn pressure_idle_timeout(pressure: PressureLevel, idle_timeout: Duration) -> Option<Duration> {
    match pressure {
        PressureLevel::Low => None,
        PressureLevel::Medium | PressureLevel::High => Some(idle_timeout / 2),
        PressureLevel::Critical => Some(Duration::ZERO),
    }
}

impl ModelCache {
    /// Escalate until `required_mb` fits or every level has run.
    pub(crate) async fn run_recovery_ladder(
        &self,
        inner: &mut CacheInner,
        affinity: DeviceAffinity,
        required_mb: u64,
    ) -> RecoveryOutcome {
        let mut outcome = RecoveryOutcome {
            required_mb,
            levels_run: Vec::new(),
            satisfied: false,
            evicted: Vec::new(),
            usage_before_mb: inner.usage_mb,
            usage_after_mb: inner.usage_mb,
            termination: None,
        };

        tracing::warn!(
            "ModelCache: starting recovery for {}MB (usage {}/{}MB)",
            required_mb,
            inner.usage_mb,
            inner.budget_mb
        );

        for level in RecoveryLevel::ALL {
            let before = inner.usage_mb;
            inner.stats.recovery_runs[level as usize - 1] += 1;
            outcome.levels_run.push(level);

            match level {
                RecoveryLevel::ClearAcceleratorCache => {
                    self.loader.clear_accelerator_cache().await;
                }
                RecoveryLevel::EvictIdle => {
                    let idle = self.config.recovery_idle_threshold;
                    outcome
                        .evicted
                        .extend(self.evict_idle(inner, idle, "recovery L2").await);
                }
                RecoveryLevel::KeepMostRecent => {
                    outcome
                        .evicted
                        .extend(self.evict_all_but_most_recent(inner, "recovery L3").await);
                }
                RecoveryLevel::FullCleanup => {
                    for key in inner.lru_candidates() {
                        if let Some(result) = self.evict_key(inner, &key, "recovery L4").await {
                            outcome.evicted.push(result);
                        }
                    }
                    self.loader.reclaim().await;
                    self.loader.clear_accelerator_cache().await;
                    if self.config.terminate_foreign_processes && affinity == DeviceAffinity::Gpu {
                        outcome.termination = Some(self.resources.terminate_foreign_processes().await);
                    }
                }
            }

            let satisfied = self.has_headroom(inner, affinity, required_mb).await;
            tracing::warn!(
                "ModelCache: recovery level {} done, usage {}MB → {}MB, {}",
                level.number(),
                before,
                inner.usage_mb,
                if satisfied { "recovered" } else { "still short" }
            );

            if satisfied {
                outcome.satisfied = true;
                break;
            }
        }

        outcome.usage_after_mb = inner.usage_mb;
        if !outcome.satisfied {
            tracing::error!(
                "ModelCache: recovery exhausted, {}MB still does not fit",
                required_mb
            );
        }
        outcome
    }

    /// Evict every unleased handle except the most recently used one.
    pub(crate) async fn evict_all_but_most_recent(
        &self,
        inner: &mut CacheInner,
        reason: &str,
    ) -> Vec<EvictionResult> {
        let keep = inner.most_recent_key();
        let mut evicted = Vec::new();
        for key in inner.lru_candidates() {
            if Some(&key) == keep.as_ref() {
                continue;
            }
            if let Some(result) = self.evict_key(inner, &key, reason).await {
                evicted.push(result);
            }
        }
        evicted
    }

    /// One pressure sweep. Runs on a timer after [`ModelCache::start`].
    pub async fn pressure_sweep(&self) -> PressureSweep {
        let pressure = self.resources.current_pressure().await;
        let mut inner = self.inner.lock().await;

        if pressure == PressureLevel::Critical && !inner.emergency_mode {
            tracing::warn!("ModelCache: critical memory pressure, entering emergency mode");
            inner.emergency_mode = true;
        } else if pressure == PressureLevel::Low && inner.emergency_mode {
            tracing::info!("ModelCache: pressure back to low, leaving emergency mode");
            inner.emergency_mode = false;
        }

        let evicted = if inner.emergency_mode {
            let evicted = self.evict_all_but_most_recent(&mut inner, "emergency").await;
            self.loader.clear_accelerator_cache().await;
            evicted
        } else {
            match pressure_idle_timeout(pressure, self.config.idle_timeout) {
                Some(timeout) => {
                    tracing::debug!(
                        "ModelCache: {} pressure, sweeping models idle > {:?}",
                        pressure,
                        timeout
                    );
                    self.evict_idle(&mut inner, timeout, "pressure sweep").await
                }
                None => Vec::new(),
            }
        };

        PressureSweep {
            pressure,
            emergency_mode: inner.emergency_mode,
            evicted,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::cache::tests::MockLoader;
    use crate::adaptive::config::CacheConfig;
    use crate::adaptive::probe::{AcceleratorProcess, StaticProbe};
    use crate::adaptive::telemetry::ResourceMonitor;
    use crate::adaptive::types::{CacheError, Capability, ModelDescriptor};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn desc(name: &str, mb: u64) -> ModelDescriptor {
        ModelDescriptor::new(Capability::Topics, name, mb)
    }

    fn gpu_desc(name: &str, mb: u64) -> ModelDescriptor {
        desc(name, mb).on_gpu()
    }

    fn setup(probe: StaticProbe, budget_mb: u64) -> (Arc<StaticProbe>, Arc<MockLoader>, ModelCache) {
        let probe = Arc::new(probe);
        let resources = Arc::new(ResourceMonitor::new(probe.clone()));
        let loader = Arc::new(MockLoader::new());
        let cache = ModelCache::new(loader.clone(), resources, CacheConfig::default(), budget_mb);
        (probe, loader, cache)
    }

    #[test]
    fn test_pressure_idle_timeout() {
        let ten = Duration::from_secs(600);
        assert_eq!(pressure_idle_timeout(PressureLevel::Low, ten), None);
        assert_eq!(
            pressure_idle_timeout(PressureLevel::Medium, ten),
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            pressure_idle_timeout(PressureLevel::High, ten),
            Some(Duration::from_secs(300))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ladder_stops_at_idle_level() {
        let (_probe, loader, cache) = setup(StaticProbe::new().with_ram_mb(65_536, 60_000), 3_000);
        drop(cache.acquire(Capability::Topics, &desc("stale", 2_000)).await.unwrap());
        tokio::time::advance(Duration::from_secs(180)).await;

        let mut inner = cache.inner.lock().await;
        let outcome = cache.run_recovery_ladder(&mut inner, DeviceAffinity::Cpu, 2_000).await;

        assert!(outcome.satisfied);
        assert_eq!(
            outcome.levels_run,
            vec![RecoveryLevel::ClearAcceleratorCache, RecoveryLevel::EvictIdle]
        );
        assert_eq!(outcome.usage_before_mb, 2_000);
        assert_eq!(outcome.usage_after_mb, 0);
        assert_eq!(outcome.evicted.len(), 1);
        assert!(outcome.termination.is_none());
        assert_eq!(loader.cache_clears.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ladder_exhausts_and_terminates_foreign_processes() {
        let (probe, loader, cache) = setup(
            StaticProbe::new()
                .with_ram_mb(32_768, 30_000)
                .with_gpu("gpu", 8_192, 3_000),
            100_000,
        );
        drop(cache.acquire(Capability::Topics, &gpu_desc("a", 1_000)).await.unwrap());
        tokio::time::advance(Duration::from_secs(1)).await;
        drop(cache.acquire(Capability::Topics, &gpu_desc("b", 1_000)).await.unwrap());

        probe.set_processes(vec![AcceleratorProcess {
            pid: 70_001,
            name: "trainer".into(),
            memory_mb: 1_000,
        }]);

        // 3_000 free - 500 buffer = 2_500 < 4_000; freeing 1_000 from the
        // foreign process still leaves it short.
        let err = cache
            .acquire(Capability::Topics, &gpu_desc("huge", 4_000))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InsufficientMemory { .. }));

        assert_eq!(probe.terminated_pids(), vec![70_001]);
        assert_eq!(loader.reclaims.load(Ordering::SeqCst), 1);
        assert_eq!(cache.usage_mb().await, 0);

        let stats = cache.stats().await;
        assert_eq!(stats.recovery_runs, [1, 1, 1, 1]);
        assert_eq!(stats.insufficient_memory_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_foreign_termination_unblocks_load() {
        let (probe, _loader, cache) = setup(
            StaticProbe::new()
                .with_ram_mb(32_768, 30_000)
                .with_gpu("gpu", 8_192, 1_000),
            100_000,
        );
        probe.set_processes(vec![AcceleratorProcess {
            pid: 70_002,
            name: "miner".into(),
            memory_mb: 6_000,
        }]);

        let lease = cache.acquire(Capability::Topics, &gpu_desc("model", 2_000)).await.unwrap();
        assert_eq!(lease.memory_mb(), 2_000);
        assert_eq!(probe.terminated_pids(), vec![70_002]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cpu_model_ignores_saturated_accelerator() {
        let (probe, loader, cache) = setup(
            StaticProbe::new()
                .with_ram_mb(65_536, 60_000)
                .with_gpu("gpu", 8_192, 300),
            4_000,
        );
        probe.set_processes(vec![AcceleratorProcess {
            pid: 70_003,
            name: "renderer".into(),
            memory_mb: 7_000,
        }]);

        let lease = cache
            .acquire(Capability::Sentiment, &ModelDescriptor::new(Capability::Sentiment, "cpu-model", 500))
            .await
            .unwrap();
        assert_eq!(lease.memory_mb(), 500);
        assert!(probe.terminated_pids().is_empty());
        assert_eq!(cache.stats().await.recovery_runs, [0, 0, 0, 0]);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cpu_model_short_on_host_never_terminates() {
        let (probe, _loader, cache) = setup(
            StaticProbe::new()
                .with_ram_mb(16_384, 1_000)
                .with_gpu("gpu", 8_192, 300),
            100_000,
        );
        probe.set_processes(vec![AcceleratorProcess {
            pid: 70_004,
            name: "renderer".into(),
            memory_mb: 7_000,
        }]);

        let err = cache
            .acquire(Capability::Topics, &desc("cpu-heavy", 2_000))
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::InsufficientMemory { required_mb: 2_000, .. }));
        assert!(probe.terminated_pids().is_empty());
        assert_eq!(cache.stats().await.recovery_runs, [1, 1, 1, 1]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_mode_keeps_mru_until_low() {
        let (probe, _loader, cache) = setup(StaticProbe::new().with_ram_mb(16_384, 12_000), 100_000);
        for name in ["a", "b", "c"] {
            drop(cache.acquire(Capability::Topics, &desc(name, 100)).await.unwrap());
            tokio::time::advance(Duration::from_secs(1)).await;
        }

        probe.set_ram_mb(16_384, 100);
        let sweep = cache.pressure_sweep().await;
        assert_eq!(sweep.pressure, PressureLevel::Critical);
        assert!(sweep.emergency_mode);
        assert_eq!(sweep.evicted.len(), 2);
        assert!(cache.contains("topics:c").await);

        // High pressure does not leave emergency mode
        probe.set_ram_mb(16_384, 1_500);
        let sweep = cache.pressure_sweep().await;
        assert_eq!(sweep.pressure, PressureLevel::High);
        assert!(sweep.emergency_mode);

        probe.set_ram_mb(16_384, 12_000);
        let sweep = cache.pressure_sweep().await;
        assert!(!sweep.emergency_mode);
        assert!(!cache.in_emergency_mode().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_medium_pressure_halves_idle_timeout() {
        let (probe, _loader, cache) = setup(StaticProbe::new().with_ram_mb(16_384, 12_000), 100_000);
        drop(cache.acquire(Capability::Topics, &desc("old", 100)).await.unwrap());
        tokio::time::advance(Duration::from_secs(6 * 60)).await;
        drop(cache.acquire(Capability::Topics, &desc("fresh", 100)).await.unwrap());

        // 16_384 total, 4_000 free → 75% used → Medium
        probe.set_ram_mb(16_384, 4_000);
        let sweep = cache.pressure_sweep().await;
        assert_eq!(sweep.pressure, PressureLevel::Medium);
        assert!(!sweep.emergency_mode);
        assert_eq!(sweep.evicted.len(), 1);
        assert_eq!(sweep.evicted[0].key, "topics:old");
    }
}
