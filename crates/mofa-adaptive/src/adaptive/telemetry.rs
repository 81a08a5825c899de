//! Resource Monitor: Memory Pressure and Accelerator Conflicts
//!
//! This module answers two questions for the rest of the crate:
//!
//! 1. **How much memory is left, and how close to exhaustion are we?**
//!    [`ResourceMonitor::current_memory`] reads the accelerator when one is
//!    present (models live there) and host RAM otherwise, and derives a
//!    [`PressureLevel`] from the raw totals.
//! 2. **Who else is using the accelerator?**
//!    [`ResourceMonitor::process_conflicts`] lists foreign processes holding
//!    accelerator memory, and [`ResourceMonitor::terminate_foreign_processes`]
//!    reclaims it as the last rung of the recovery ladder.
//!
//! ## Pressure thresholds
//!
//! ```text
//! CRITICAL  usage > 95%  or  free < 200MB
//! HIGH      usage > 85%  or  free < 1000MB
//! MEDIUM    usage > 70%  or  free < 2000MB
//! LOW       otherwise
//! ```
//!
//! Pressure is computed from the unreduced totals. The safety buffer (default
//! 500MB) is applied only to the "available for models" planning figure:
//!
//! ```text
//! ┌──────────────────────── total ─────────────────────────┐
//! │      used      │ available for models │ safety buffer  │
//! │                │ ←── free - buffer ──→│ ←── 500MB ───→ │
//! └────────────────┴──────────────────────┴────────────────┘
//! ```
//!
//! ## Fail safe
//!
//! A failed probe produces [`MemoryState::Unknown`]. Consumers treat unknown as
//! HIGH pressure via [`MemoryState::effective_pressure`], never as LOW, and
//! admission into an unknown pool is refused.
//!
//! ## Device affinity
//!
//! CPU-resident models are admitted against host RAM. GPU-resident models are
//! admitted against the accelerator, or host RAM when there is none.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use super::config::ResourceConfig;
use super::probe::{MemoryReading, PlatformProbe, TerminationOutcome};
use super::types::{DeviceAffinity, PressureLevel, TerminationError};

// ============================================================================
// Constants
// ============================================================================

pub const CRITICAL_USAGE_PERCENT: f64 = 95.0;
pub const CRITICAL_FREE_MB: u64 = 200;
pub const HIGH_USAGE_PERCENT: f64 = 85.0;
pub const HIGH_FREE_MB: u64 = 1000;
pub const MEDIUM_USAGE_PERCENT: f64 = 70.0;
pub const MEDIUM_FREE_MB: u64 = 2000;

/// Pressure level for a memory pool with the given raw totals.
pub fn pressure_for(total_mb: u64, used_mb: u64, free_mb: u64) -> PressureLevel {
    if total_mb == 0 {
        return PressureLevel::Critical;
    }
    let usage = used_mb as f64 / total_mb as f64 * 100.0;

    if usage > CRITICAL_USAGE_PERCENT || free_mb < CRITICAL_FREE_MB {
        PressureLevel::Critical
    } else if usage > HIGH_USAGE_PERCENT || free_mb < HIGH_FREE_MB {
        PressureLevel::High
    } else if usage > MEDIUM_USAGE_PERCENT || free_mb < MEDIUM_FREE_MB {
        PressureLevel::Medium
    } else {
        PressureLevel::Low
    }
}

// ============================================================================
// MemoryStatus / MemoryState
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryDevice {
    Host,
    Accelerator,
}

/// A successful memory reading with its derived pressure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryStatus {
    pub device: MemoryDevice,
    pub total_mb: u64,
    pub used_mb: u64,
    pub free_mb: u64,
    /// `free - safety_buffer`, saturating at zero.
    pub available_for_models_mb: u64,
    pub usage_percent: f64,
    pub pressure: PressureLevel,
}

impl MemoryStatus {
    fn from_reading(device: MemoryDevice, reading: MemoryReading, safety_buffer_mb: u64) -> Self {
        let usage_percent = if reading.total_mb == 0 {
            100.0
        } else {
            reading.used_mb as f64 / reading.total_mb as f64 * 100.0
        };
        Self {
            device,
            total_mb: reading.total_mb,
            used_mb: reading.used_mb,
            free_mb: reading.free_mb,
            available_for_models_mb: reading.free_mb.saturating_sub(safety_buffer_mb),
            usage_percent,
            pressure: pressure_for(reading.total_mb, reading.used_mb, reading.free_mb),
        }
    }
}

/// Result of a memory query: either a reading or an explicit unknown.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MemoryState {
    Known(MemoryStatus),
    Unknown { reason: String },
}

impl MemoryState {
    /// Pressure to act on. Unknown is treated as HIGH.
    pub fn effective_pressure(&self) -> PressureLevel {
        match self {
            MemoryState::Known(status) => status.pressure,
            MemoryState::Unknown { .. } => PressureLevel::High,
        }
    }

    pub fn available_for_models_mb(&self) -> Option<u64> {
        match self {
            MemoryState::Known(status) => Some(status.available_for_models_mb),
            MemoryState::Unknown { .. } => None,
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, MemoryState::Known(_))
    }
}

/// Host and accelerator memory side by side.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceSnapshot {
    pub host: MemoryState,
    /// `None` when no accelerator is present.
    pub accelerator: Option<MemoryState>,
    pub safety_buffer_mb: u64,
}

// ============================================================================
// Process conflicts
// ============================================================================

/// A process holding accelerator memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessConflict {
    pub pid: u32,
    pub name: String,
    pub memory_mb: u64,
    /// Whether this entry is the current process.
    pub is_own: bool,
}

/// Per-process outcome of a termination attempt.
#[derive(Debug, Clone, Serialize)]
pub struct TerminationRecord {
    pub pid: u32,
    pub name: String,
    pub memory_mb: u64,
    pub outcome: Option<TerminationOutcome>,
    pub error: Option<String>,
}

impl TerminationRecord {
    pub fn succeeded(&self) -> bool {
        self.outcome.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TerminationReport {
    pub records: Vec<TerminationRecord>,
    /// Sum of accelerator memory held by successfully terminated processes.
    pub reclaimed_mb: u64,
}

impl TerminationReport {
    pub fn terminated(&self) -> usize {
        self.records.iter().filter(|r| r.succeeded()).count()
    }

    pub fn failed(&self) -> usize {
        self.records.len() - self.terminated()
    }
}

// ============================================================================
// ResourceMonitor
// ============================================================================

/// Memory pressure probe and accelerator conflict manager.
///
/// ```rust,ignore
/// let monitor = ResourceMonitor::new(Arc::new(SystemProbe::new()));
///
/// match monitor.current_memory().await {
///     MemoryState::Known(status) => println!("{} pressure", status.pressure),
///     MemoryState::Unknown { reason } => println!("unknown: {}", reason),
/// }
/// ```
pub struct ResourceMonitor {
    probe: Arc<dyn PlatformProbe>,
    safety_buffer_mb: AtomicU64,
    termination_grace: Duration,
    own_pid: u32,
}

impl std::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("probe", &self.probe.name())
            .field("safety_buffer_mb", &self.safety_buffer_mb())
            .field("termination_grace", &self.termination_grace)
            .finish()
    }
}

impl ResourceMonitor {
    pub fn new(probe: Arc<dyn PlatformProbe>) -> Self {
        Self::with_config(probe, &ResourceConfig::default())
    }

    pub fn with_config(probe: Arc<dyn PlatformProbe>, config: &ResourceConfig) -> Self {
        Self {
            probe,
            safety_buffer_mb: AtomicU64::new(config.safety_buffer_mb),
            termination_grace: config.termination_grace,
            own_pid: std::process::id(),
        }
    }

    pub fn probe(&self) -> &Arc<dyn PlatformProbe> {
        &self.probe
    }

    pub fn safety_buffer_mb(&self) -> u64 {
        self.safety_buffer_mb.load(Ordering::Relaxed)
    }

    pub fn set_safety_buffer_mb(&self, mb: u64) {
        self.safety_buffer_mb.store(mb, Ordering::Relaxed);
    }

    /// Host RAM reading.
    pub async fn host_memory(&self) -> MemoryState {
        match self.probe.host_memory().await {
            Ok(reading) => MemoryState::Known(MemoryStatus::from_reading(
                MemoryDevice::Host,
                reading,
                self.safety_buffer_mb(),
            )),
            Err(e) => {
                tracing::warn!("ResourceMonitor: host memory probe failed: {}", e);
                MemoryState::Unknown {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Accelerator reading, `None` when no accelerator is present.
    pub async fn accelerator_memory(&self) -> Option<MemoryState> {
        match self.probe.accelerator().await {
            Ok(Some(info)) => Some(MemoryState::Known(MemoryStatus::from_reading(
                MemoryDevice::Accelerator,
                info.memory,
                self.safety_buffer_mb(),
            ))),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!("ResourceMonitor: accelerator probe failed: {}", e);
                Some(MemoryState::Unknown {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Memory of the pool models are loaded into: the accelerator when one
    /// is present, host RAM otherwise.
    pub async fn current_memory(&self) -> MemoryState {
        match self.accelerator_memory().await {
            Some(state) => state,
            None => self.host_memory().await,
        }
    }

    pub async fn current_pressure(&self) -> PressureLevel {
        self.current_memory().await.effective_pressure()
    }

    pub async fn snapshot(&self) -> ResourceSnapshot {
        let (host, accelerator) = futures::join!(self.host_memory(), self.accelerator_memory());
        ResourceSnapshot {
            host,
            accelerator,
            safety_buffer_mb: self.safety_buffer_mb(),
        }
    }

    /// Memory of the pool a model with `affinity` is loaded into.
    pub async fn memory_for(&self, affinity: DeviceAffinity) -> MemoryState {
        match affinity {
            DeviceAffinity::Cpu => self.host_memory().await,
            DeviceAffinity::Gpu => self.current_memory().await,
        }
    }

    /// Whether `required_mb` more can be placed in [`current_memory`] without
    /// dipping into the safety buffer. Unknown memory is never admitted.
    ///
    /// [`current_memory`]: ResourceMonitor::current_memory
    pub async fn can_admit(&self, required_mb: u64) -> bool {
        admit(&self.current_memory().await, required_mb)
    }

    /// [`can_admit`](ResourceMonitor::can_admit) against the pool `affinity`
    /// selects.
    pub async fn can_admit_on(&self, affinity: DeviceAffinity, required_mb: u64) -> bool {
        admit(&self.memory_for(affinity).await, required_mb)
    }

    /// Processes holding accelerator memory, including this one if it does.
    pub async fn process_conflicts(&self) -> Vec<ProcessConflict> {
        match self.probe.accelerator_processes().await {
            Ok(processes) => processes
                .into_iter()
                .map(|p| ProcessConflict {
                    is_own: p.pid == self.own_pid,
                    pid: p.pid,
                    name: p.name,
                    memory_mb: p.memory_mb,
                })
                .collect(),
            Err(e) => {
                tracing::warn!("ResourceMonitor: accelerator process query failed: {}", e);
                Vec::new()
            }
        }
    }

    /// Terminate every foreign process holding accelerator memory.
    ///
    /// The current process is filtered out before any signal is sent, and
    /// [`Self::terminate`] rejects it again, so this can never kill itself.
    /// A failure for one process is recorded and the rest are still attempted.
    pub async fn terminate_foreign_processes(&self) -> TerminationReport {
        let foreign: Vec<ProcessConflict> = self
            .process_conflicts()
            .await
            .into_iter()
            .filter(|c| !c.is_own && c.pid != self.own_pid)
            .collect();

        let mut report = TerminationReport::default();
        if foreign.is_empty() {
            tracing::debug!("ResourceMonitor: no foreign accelerator processes to terminate");
            return report;
        }

        tracing::warn!(
            "ResourceMonitor: terminating {} foreign accelerator process(es) holding {}MB",
            foreign.len(),
            foreign.iter().map(|c| c.memory_mb).sum::<u64>(),
        );

        for conflict in foreign {
            let result = self.terminate(conflict.pid).await;
            let record = match result {
                Ok(outcome) => {
                    tracing::info!(
                        "ResourceMonitor: terminated pid {} ('{}', {}MB, {:?})",
                        conflict.pid,
                        conflict.name,
                        conflict.memory_mb,
                        outcome
                    );
                    report.reclaimed_mb += conflict.memory_mb;
                    TerminationRecord {
                        pid: conflict.pid,
                        name: conflict.name,
                        memory_mb: conflict.memory_mb,
                        outcome: Some(outcome),
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        "ResourceMonitor: failed to terminate pid {} ('{}'): {}",
                        conflict.pid,
                        conflict.name,
                        e
                    );
                    TerminationRecord {
                        pid: conflict.pid,
                        name: conflict.name,
                        memory_mb: conflict.memory_mb,
                        outcome: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            report.records.push(record);
        }

        report
    }

    async fn terminate(&self, pid: u32) -> Result<TerminationOutcome, TerminationError> {
        if pid == self.own_pid {
            return Err(TerminationError::OwnProcess(pid));
        }
        self.probe.terminate_process(pid, self.termination_grace).await
    }
}

fn admit(state: &MemoryState, required_mb: u64) -> bool {
    match state {
        MemoryState::Known(status) => {
            let admit = status.available_for_models_mb >= required_mb;
            tracing::debug!(
                "ResourceMonitor: {:?} available={}MB, required={}MB → {}",
                status.device,
                status.available_for_models_mb,
                required_mb,
                if admit { "ADMIT" } else { "DENY" },
            );
            admit
        }
        MemoryState::Unknown { reason } => {
            tracing::warn!(
                "ResourceMonitor: memory unknown ({}), refusing {}MB",
                reason,
                required_mb
            );
            false
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::probe::{AcceleratorProcess, StaticProbe};

    fn monitor_with(probe: StaticProbe) -> (Arc<StaticProbe>, ResourceMonitor) {
        let probe = Arc::new(probe);
        let monitor = ResourceMonitor::new(probe.clone());
        (probe, monitor)
    }

    #[test]
    fn test_pressure_thresholds() {
        // 16GB pool
        assert_eq!(pressure_for(16_000, 4_000, 12_000), PressureLevel::Low);
        assert_eq!(pressure_for(16_000, 12_000, 4_000), PressureLevel::Medium);
        assert_eq!(pressure_for(16_000, 14_000, 2_000), PressureLevel::High);
        assert_eq!(pressure_for(16_000, 15_500, 500), PressureLevel::Critical);
    }

    #[test]
    fn test_pressure_absolute_free_dominates_small_pools() {
        // 2GB pool at 40% usage still has under 2000MB free
        assert_eq!(pressure_for(2_048, 820, 1_228), PressureLevel::Medium);
        assert_eq!(pressure_for(1_024, 100, 924), PressureLevel::High);
        assert_eq!(pressure_for(0, 0, 0), PressureLevel::Critical);
    }

    #[tokio::test]
    async fn test_host_memory_when_no_gpu() {
        let (_probe, monitor) = monitor_with(StaticProbe::new().with_ram_mb(16_384, 12_000));
        let state = monitor.current_memory().await;

        let MemoryState::Known(status) = state else {
            panic!("expected known state");
        };
        assert_eq!(status.device, MemoryDevice::Host);
        assert_eq!(status.available_for_models_mb, 12_000 - 500);
        assert_eq!(status.pressure, PressureLevel::Low);
    }

    #[tokio::test]
    async fn test_accelerator_preferred_when_present() {
        let (_probe, monitor) = monitor_with(
            StaticProbe::new()
                .with_ram_mb(16_384, 12_000)
                .with_gpu("gpu", 8_192, 150),
        );
        let state = monitor.current_memory().await;
        assert!(matches!(
            &state,
            MemoryState::Known(s) if s.device == MemoryDevice::Accelerator
        ));
        assert_eq!(state.effective_pressure(), PressureLevel::Critical);
        assert_eq!(state.available_for_models_mb(), Some(0));
    }

    #[tokio::test]
    async fn test_unknown_is_treated_as_high() {
        let (probe, monitor) = monitor_with(StaticProbe::new());
        probe.fail_accelerator("driver crashed");

        let state = monitor.current_memory().await;
        assert!(!state.is_known());
        assert_eq!(state.effective_pressure(), PressureLevel::High);
        assert!(!monitor.can_admit(100).await);
    }

    #[tokio::test]
    async fn test_unknown_host_memory_refuses_any_size() {
        let (probe, monitor) = monitor_with(StaticProbe::new().with_ram_mb(8_192, 4_096));
        assert!(monitor.can_admit(1_000).await);

        probe.fail_host_memory();
        assert!(!monitor.can_admit(1).await);
        assert!(!monitor.can_admit(1_000_000).await);
        assert!(!monitor.can_admit_on(DeviceAffinity::Cpu, 1).await);
    }

    #[tokio::test]
    async fn test_affinity_selects_pool() {
        // Saturated accelerator, roomy host
        let (probe, monitor) = monitor_with(
            StaticProbe::new()
                .with_ram_mb(65_536, 60_000)
                .with_gpu("gpu", 8_192, 300),
        );
        assert!(monitor.can_admit_on(DeviceAffinity::Cpu, 500).await);
        assert!(!monitor.can_admit_on(DeviceAffinity::Gpu, 500).await);
        assert!(!monitor.can_admit(500).await);

        // A broken accelerator does not block CPU models
        probe.fail_accelerator("driver crashed");
        assert!(monitor.can_admit_on(DeviceAffinity::Cpu, 500).await);
        assert!(!monitor.can_admit_on(DeviceAffinity::Gpu, 500).await);

        // Without an accelerator GPU models fall back to host RAM
        probe.remove_gpu();
        assert!(monitor.can_admit_on(DeviceAffinity::Gpu, 500).await);
    }

    #[tokio::test]
    async fn test_can_admit_respects_safety_buffer() {
        let (_probe, monitor) = monitor_with(StaticProbe::new().with_ram_mb(8_192, 1_500));
        assert!(monitor.can_admit(1_000).await);
        assert!(!monitor.can_admit(1_001).await);

        monitor.set_safety_buffer_mb(0);
        assert!(monitor.can_admit(1_500).await);
    }

    #[tokio::test]
    async fn test_conflicts_flag_own_process() {
        let own = std::process::id();
        let (probe, monitor) = monitor_with(StaticProbe::new().with_gpu("gpu", 8192, 2000));
        probe.set_processes(vec![
            AcceleratorProcess {
                pid: own,
                name: "self".into(),
                memory_mb: 1000,
            },
            AcceleratorProcess {
                pid: 55_555,
                name: "miner".into(),
                memory_mb: 5000,
            },
        ]);

        let conflicts = monitor.process_conflicts().await;
        assert_eq!(conflicts.len(), 2);
        assert!(conflicts.iter().any(|c| c.is_own && c.pid == own));
        assert!(conflicts.iter().any(|c| !c.is_own && c.pid == 55_555));
    }

    #[tokio::test]
    async fn test_terminate_never_touches_own_process() {
        let own = std::process::id();
        let (probe, monitor) = monitor_with(StaticProbe::new().with_gpu("gpu", 8192, 1000));
        probe.set_processes(vec![
            AcceleratorProcess {
                pid: own,
                name: "self".into(),
                memory_mb: 1000,
            },
            AcceleratorProcess {
                pid: 60_001,
                name: "a".into(),
                memory_mb: 3000,
            },
            AcceleratorProcess {
                pid: 60_002,
                name: "b".into(),
                memory_mb: 2000,
            },
        ]);
        probe.refuse_termination_of(60_002);

        let report = monitor.terminate_foreign_processes().await;

        assert_eq!(report.records.len(), 2);
        assert_eq!(report.terminated(), 1);
        assert_eq!(report.failed(), 1);
        assert_eq!(report.reclaimed_mb, 3000);
        assert_eq!(probe.terminated_pids(), vec![60_001]);
        assert!(report.records.iter().all(|r| r.pid != own));
    }

    #[tokio::test]
    async fn test_terminate_with_no_conflicts_is_noop() {
        let (probe, monitor) = monitor_with(StaticProbe::new());
        let report = monitor.terminate_foreign_processes().await;
        assert!(report.records.is_empty());
        assert!(probe.terminated_pids().is_empty());
    }

    #[test]
    fn test_monitor_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ResourceMonitor>();
    }
}
