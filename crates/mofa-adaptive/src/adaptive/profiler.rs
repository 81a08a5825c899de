//! Hardware Profiler: Detection and Tier Classification
//!
//! Turns raw probe readings into a [`HardwareSnapshot`] and maps that snapshot
//! onto a discrete [`Tier`].
//!
//! ## Classification
//!
//! ```text
//!  RAM score (40%) ─┐
//!  GPU score (40%) ─┼─▶ weighted total ─▶ score tier ─┐
//!  CPU score (20%) ─┘                                 ├─▶ min ─▶ pressure override ─▶ tier
//!                         RAM / accelerator ceilings ─┘
//! ```
//!
//! | total     | score tier |
//! |-----------|------------|
//! | ≥ 75      | high_end   |
//! | ≥ 50      | standard   |
//! | ≥ 25      | basic      |
//! | otherwise | minimal    |
//!
//! Ceilings: RAM < 3GB forces `minimal`, RAM < 6GB caps at `basic`, RAM < 12GB
//! caps at `standard`, and `high_end` needs an accelerator with at least 6GB.
//!
//! When an accelerator is present its live pressure can pull the tier further
//! down: CRITICAL forces `minimal`, HIGH drops one step, and less than 1GB of
//! free accelerator memory caps the tier at `basic`.
//!
//! ## Failure handling
//!
//! Detection never fails. A probe error is logged and the affected fields take
//! their values from [`HardwareSnapshot::conservative_default`].

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;

use super::config::{CapabilitySource, CapabilityTable, TierCapabilities};
use super::probe::PlatformProbe;
use super::telemetry::pressure_for;
use super::types::{ConfigError, HardwareSnapshot, PressureLevel, Tier};

// ============================================================================
// Constants
// ============================================================================

const RAM_WEIGHT: f64 = 0.4;
const GPU_WEIGHT: f64 = 0.4;
const CPU_WEIGHT: f64 = 0.2;

const HIGH_END_SCORE: f64 = 75.0;
const STANDARD_SCORE: f64 = 50.0;
const BASIC_SCORE: f64 = 25.0;

const MINIMAL_RAM_CEILING_GB: f64 = 3.0;
const BASIC_RAM_CEILING_GB: f64 = 6.0;
const STANDARD_RAM_CEILING_GB: f64 = 12.0;
const HIGH_END_MIN_GPU_MB: u64 = 6144;
const LOW_GPU_AVAILABLE_MB: u64 = 1024;

const DEFAULT_DETECTION_CACHE_TTL: Duration = Duration::from_secs(30);

// ============================================================================
// Scores
// ============================================================================

pub fn ram_score(ram_gb: f64) -> f64 {
    match ram_gb {
        gb if gb < 2.0 => 0.0,
        gb if gb < 3.0 => 15.0,
        gb if gb < 4.0 => 30.0,
        gb if gb < 8.0 => 55.0,
        gb if gb < 16.0 => 80.0,
        _ => 100.0,
    }
}

pub fn gpu_score(gpu_present: bool, gpu_total_mb: u64) -> f64 {
    if !gpu_present {
        return 0.0;
    }
    match gpu_total_mb {
        mb if mb < 2048 => 20.0,
        mb if mb < 4096 => 40.0,
        mb if mb < 6144 => 60.0,
        mb if mb < 8192 => 80.0,
        _ => 100.0,
    }
}

/// Half the score from core count (8 cores saturate), half from clock speed
/// (4GHz saturates).
pub fn cpu_score(cores: usize, freq_mhz: u64) -> f64 {
    let core_part = (cores as f64 * 6.25).min(50.0);
    let ghz = freq_mhz as f64 / 1000.0;
    let freq_part = (ghz / 4.0 * 50.0).min(50.0);
    core_part + freq_part
}

fn tier_for_score(total: f64) -> Tier {
    if total >= HIGH_END_SCORE {
        Tier::HighEnd
    } else if total >= STANDARD_SCORE {
        Tier::Standard
    } else if total >= BASIC_SCORE {
        Tier::Basic
    } else {
        Tier::Minimal
    }
}

/// How a tier was reached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationInfo {
    pub ram_score: f64,
    pub gpu_score: f64,
    pub cpu_score: f64,
    pub total_score: f64,
    /// Tier implied by the weighted score alone.
    pub score_tier: Tier,
    /// Highest tier the RAM and accelerator ceilings allow.
    pub ceiling_tier: Tier,
    pub final_tier: Tier,
    pub reasons: Vec<String>,
}

/// Classify a snapshot. Pure.
pub fn classify_snapshot(snapshot: &HardwareSnapshot) -> (Tier, ClassificationInfo) {
    let ram_gb = snapshot.ram_total_gb();
    let ram = ram_score(ram_gb);
    let gpu = gpu_score(snapshot.gpu_present, snapshot.gpu_total_mb);
    let cpu = cpu_score(snapshot.cpu_cores, snapshot.cpu_freq_mhz);
    let total = RAM_WEIGHT * ram + GPU_WEIGHT * gpu + CPU_WEIGHT * cpu;
    let score_tier = tier_for_score(total);

    let mut reasons = vec![format!(
        "score {:.1} (ram {:.0}, gpu {:.0}, cpu {:.1}) → {}",
        total, ram, gpu, cpu, score_tier
    )];

    let mut ceiling = if ram_gb < MINIMAL_RAM_CEILING_GB {
        reasons.push(format!("{:.1}GB RAM forces minimal", ram_gb));
        Tier::Minimal
    } else if ram_gb < BASIC_RAM_CEILING_GB {
        reasons.push(format!("{:.1}GB RAM caps at basic", ram_gb));
        Tier::Basic
    } else if ram_gb < STANDARD_RAM_CEILING_GB {
        reasons.push(format!("{:.1}GB RAM caps at standard", ram_gb));
        Tier::Standard
    } else {
        Tier::HighEnd
    };

    if ceiling == Tier::HighEnd
        && !(snapshot.gpu_present && snapshot.gpu_total_mb >= HIGH_END_MIN_GPU_MB)
    {
        reasons.push(format!(
            "high_end requires an accelerator with at least {}MB",
            HIGH_END_MIN_GPU_MB
        ));
        ceiling = Tier::Standard;
    }

    let mut tier = score_tier.min(ceiling);

    if snapshot.gpu_present {
        match snapshot.gpu_pressure_level {
            PressureLevel::Critical => {
                reasons.push("critical accelerator pressure forces minimal".to_string());
                tier = Tier::Minimal;
            }
            PressureLevel::High => {
                let lowered = tier.downgrade();
                if lowered != tier {
                    reasons.push(format!("high accelerator pressure: {} → {}", tier, lowered));
                }
                tier = lowered;
            }
            PressureLevel::Medium | PressureLevel::Low => {}
        }
        if snapshot.gpu_available_mb < LOW_GPU_AVAILABLE_MB && tier > Tier::Basic {
            reasons.push(format!(
                "only {}MB accelerator memory free, capping at basic",
                snapshot.gpu_available_mb
            ));
            tier = Tier::Basic;
        }
    }

    let info = ClassificationInfo {
        ram_score: ram,
        gpu_score: gpu,
        cpu_score: cpu,
        total_score: total,
        score_tier,
        ceiling_tier: ceiling,
        final_tier: tier,
        reasons,
    };
    (tier, info)
}

/// What the host would need to reach the next tier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NextTierRequirements {
    pub current_tier: Tier,
    /// `None` when already at the top.
    pub next_tier: Option<Tier>,
    pub min_ram_mb: Option<u64>,
    pub min_gpu_mb: Option<u64>,
    pub notes: Vec<String>,
}

/// Hardware needed for the tier above `current`. Pure.
pub fn next_tier_requirements(current: Tier, snapshot: &HardwareSnapshot) -> NextTierRequirements {
    let next = current.upgrade();
    if next == current {
        return NextTierRequirements {
            current_tier: current,
            next_tier: None,
            min_ram_mb: None,
            min_gpu_mb: None,
            notes: vec!["already at the highest tier".to_string()],
        };
    }

    let (ram_gb, gpu_mb) = match next {
        Tier::Minimal => (0.0, None),
        Tier::Basic => (MINIMAL_RAM_CEILING_GB, None),
        Tier::Standard => (BASIC_RAM_CEILING_GB, None),
        Tier::HighEnd => (STANDARD_RAM_CEILING_GB, Some(HIGH_END_MIN_GPU_MB)),
    };
    let min_ram_mb = (ram_gb * 1024.0) as u64;

    let mut notes = Vec::new();
    if snapshot.ram_total_mb < min_ram_mb {
        notes.push(format!(
            "{} needs at least {}MB RAM (have {}MB)",
            next, min_ram_mb, snapshot.ram_total_mb
        ));
    }
    if let Some(gpu_mb) = gpu_mb {
        if !snapshot.gpu_present {
            notes.push(format!("{} needs an accelerator with at least {}MB", next, gpu_mb));
        } else if snapshot.gpu_total_mb < gpu_mb {
            notes.push(format!(
                "{} needs at least {}MB accelerator memory (have {}MB)",
                next, gpu_mb, snapshot.gpu_total_mb
            ));
        }
    }
    if snapshot.gpu_present && snapshot.gpu_pressure_level >= PressureLevel::High {
        notes.push("free accelerator memory by closing other GPU workloads".to_string());
    }
    if notes.is_empty() {
        notes.push(format!(
            "{} needs a higher combined score (faster CPU or more memory)",
            next
        ));
    }

    NextTierRequirements {
        current_tier: current,
        next_tier: Some(next),
        min_ram_mb: Some(min_ram_mb),
        min_gpu_mb: gpu_mb,
        notes,
    }
}

// ============================================================================
// HardwareProfiler
// ============================================================================

/// Hardware detection, classification and capability lookups.
///
/// ```rust,ignore
/// let profiler = HardwareProfiler::new(Arc::new(SystemProbe::new()), CapabilitySource::Builtin)?;
/// let snapshot = profiler.detect().await;
/// let (tier, info) = profiler.classify(&snapshot);
/// println!("{} ({:.1})", tier, info.total_score);
/// ```
pub struct HardwareProfiler {
    probe: Arc<dyn PlatformProbe>,
    source: CapabilitySource,
    table: RwLock<Arc<CapabilityTable>>,
    cache_ttl: Duration,
    cached: Mutex<Option<(Instant, HardwareSnapshot)>>,
}

impl std::fmt::Debug for HardwareProfiler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareProfiler")
            .field("probe", &self.probe.name())
            .field("source", &self.source)
            .field("cache_ttl", &self.cache_ttl)
            .finish()
    }
}

impl HardwareProfiler {
    /// Load the capability table from `source` and build a profiler.
    pub fn new(probe: Arc<dyn PlatformProbe>, source: CapabilitySource) -> Result<Self, ConfigError> {
        let table = source.load()?;
        Ok(Self::with_table(probe, source, table))
    }

    pub fn with_table(
        probe: Arc<dyn PlatformProbe>,
        source: CapabilitySource,
        table: CapabilityTable,
    ) -> Self {
        Self {
            probe,
            source,
            table: RwLock::new(Arc::new(table)),
            cache_ttl: DEFAULT_DETECTION_CACHE_TTL,
            cached: Mutex::new(None),
        }
    }

    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    // ========================================================================
    // Detection
    // ========================================================================

    /// Probe the host and build a fresh snapshot. Never fails.
    pub async fn detect(&self) -> HardwareSnapshot {
        let defaults = HardwareSnapshot::conservative_default();

        let (host, cpu, accelerator, storage) = futures::join!(
            self.probe.host_memory(),
            self.probe.cpu(),
            self.probe.accelerator(),
            self.probe.storage_free_mb(),
        );

        let (ram_total_mb, ram_available_mb) = match host {
            Ok(reading) => (reading.total_mb, reading.free_mb),
            Err(e) => {
                tracing::warn!(
                    "HardwareProfiler: host memory detection failed, assuming {}MB: {}",
                    defaults.ram_total_mb,
                    e
                );
                (defaults.ram_total_mb, defaults.ram_available_mb)
            }
        };

        let (cpu_cores, cpu_freq_mhz) = match cpu {
            Ok(info) => (
                info.cores.max(1),
                if info.freq_mhz == 0 {
                    defaults.cpu_freq_mhz
                } else {
                    info.freq_mhz
                },
            ),
            Err(e) => {
                tracing::warn!("HardwareProfiler: CPU detection failed: {}", e);
                (defaults.cpu_cores, defaults.cpu_freq_mhz)
            }
        };

        let gpu = match accelerator {
            Ok(gpu) => gpu,
            Err(e) => {
                tracing::warn!(
                    "HardwareProfiler: accelerator detection failed, assuming none: {}",
                    e
                );
                None
            }
        };

        let storage_free_mb = storage.unwrap_or_else(|e| {
            tracing::warn!("HardwareProfiler: storage detection failed: {}", e);
            defaults.storage_free_mb
        });

        let snapshot = match gpu {
            Some(info) => HardwareSnapshot {
                ram_total_mb,
                ram_available_mb,
                cpu_cores,
                cpu_freq_mhz,
                gpu_present: true,
                gpu_name: Some(info.name),
                gpu_total_mb: info.memory.total_mb,
                gpu_available_mb: info.memory.free_mb,
                gpu_pressure_level: pressure_for(
                    info.memory.total_mb,
                    info.memory.used_mb,
                    info.memory.free_mb,
                ),
                storage_free_mb,
                captured_at: Utc::now(),
            },
            None => HardwareSnapshot {
                ram_total_mb,
                ram_available_mb,
                cpu_cores,
                cpu_freq_mhz,
                storage_free_mb,
                captured_at: Utc::now(),
                ..defaults
            },
        };

        tracing::debug!(
            "HardwareProfiler: detected ram={}MB cores={} gpu={:?} ({}MB)",
            snapshot.ram_total_mb,
            snapshot.cpu_cores,
            snapshot.gpu_name,
            snapshot.gpu_total_mb
        );

        self.store_cached(snapshot.clone());
        snapshot
    }

    /// Last snapshot if younger than the cache TTL, otherwise a fresh one.
    pub async fn detect_cached(&self) -> HardwareSnapshot {
        {
            let cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
            if let Some((at, snapshot)) = cached.as_ref() {
                if at.elapsed() < self.cache_ttl {
                    return snapshot.clone();
                }
            }
        }
        self.detect().await
    }

    fn store_cached(&self, snapshot: HardwareSnapshot) {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        *cached = Some((Instant::now(), snapshot));
    }

    fn clear_cached(&self) {
        let mut cached = self.cached.lock().unwrap_or_else(|e| e.into_inner());
        *cached = None;
    }

    // ========================================================================
    // Classification and lookups
    // ========================================================================

    pub fn classify(&self, snapshot: &HardwareSnapshot) -> (Tier, ClassificationInfo) {
        classify_snapshot(snapshot)
    }

    pub fn next_tier_requirements(
        &self,
        current: Tier,
        snapshot: &HardwareSnapshot,
    ) -> NextTierRequirements {
        next_tier_requirements(current, snapshot)
    }

    pub fn capability_table(&self) -> Arc<CapabilityTable> {
        self.table
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn get_tier_capabilities(&self, tier: Tier) -> TierCapabilities {
        self.capability_table().for_tier(tier).clone()
    }

    pub fn get_memory_limit(&self, tier: Tier) -> u64 {
        self.capability_table().for_tier(tier).memory_limit_mb
    }

    pub fn source(&self) -> &CapabilitySource {
        &self.source
    }

    /// Re-read the capability table from its source and drop the cached
    /// snapshot. On error the previous table stays active.
    pub fn reload_config(&self) -> Result<(), ConfigError> {
        let table = self.source.load()?;
        *self.table.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(table);
        self.clear_cached();
        tracing::info!("HardwareProfiler: reloaded capability table from {:?}", self.source);
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
