//! Hardware-Adaptive Model Management
//!
//! Runs variably-sized inference models on anything from a 2GB laptop to a
//! multi-GPU workstation without exhausting memory:
//!
//! - **[`HardwareProfiler`]**: detect the host and classify it into a [`Tier`]
//! - **[`ResourceMonitor`]**: memory pressure, admission, accelerator conflicts
//! - **[`ModelCache`]**: single-lock get-or-load with LRU eviction and a
//!   four-level recovery ladder
//! - **[`FeatureManager`]**: per-capability AI path or algorithmic fallback
//! - **[`HardwareMonitor`]**: periodic re-detection and live tier migration
//! - **[`AdaptiveRuntime`]**: owns all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                   caller: analyze(text, capability)           │
//! └────────────────────────┬──────────────────────────────────────┘
//!                          ▼
//! ┌───────────────────────────────────────────────────────────────┐
//! │                    FeatureManager                             │
//! │  ┌─────────────────┐      ┌─────────────────────────────┐     │
//! │  │ tier table      │─────▶│ capability enabled + model? │     │
//! │  └─────────────────┘      └──────────┬──────────────────┘     │
//! │                              YES ┌───┴───┐ NO                 │
//! │                                  ▼       ▼                    │
//! │                          ┌──────────┐ ┌──────────────┐        │
//! │                          │ModelCache│ │ fallback::run│        │
//! │                          │ acquire  │ └──────────────┘        │
//! │                          └────┬─────┘        ▲                │
//! │                  evict LRU ─▶ recovery ladder│ any error      │
//! │                               └──────────────┘                │
//! └───────────────────────────────────────────────────────────────┘
//!            ▲ budget + feature table
//! ┌──────────┴────────────┐
//! │   HardwareMonitor     │◀── HardwareProfiler ◀── PlatformProbe
//! └───────────────────────┘
//! ```

// ---------------------------------------------------------------------------
// Core types and configuration
// ---------------------------------------------------------------------------

/// Tiers, capabilities, snapshots, change events and error enums.
pub mod types;

/// Capability table and per-component tuning.
pub mod config;

// ---------------------------------------------------------------------------
// Hardware
// ---------------------------------------------------------------------------

/// Host introspection seam (`sysinfo`, `nvidia-smi`) and a settable probe.
pub mod probe;

/// Detection and tier classification.
pub mod profiler;

/// Memory pressure, admission control and accelerator process conflicts.
pub mod telemetry;

// ---------------------------------------------------------------------------
// Models
// ---------------------------------------------------------------------------

/// `ModelLoader` and `InferenceRunner` plugin traits.
pub mod backend;

/// Model cache with LRU eviction and background sweeps.
pub mod cache;

/// Escalating memory recovery for the model cache.
pub mod recovery;

// ---------------------------------------------------------------------------
// Features and runtime
// ---------------------------------------------------------------------------

/// Algorithmic implementations of every capability.
pub mod fallback;

/// Capability routing between models and fallbacks.
pub mod features;

/// Live hardware migration.
pub mod monitor;

/// The context object tying everything together.
pub mod runtime;

pub(crate) mod tasks;

// ── Re-exports ──

pub use backend::{BlockingLoader, InferenceRunner, LoadedModel, ModelLoader};
pub use cache::{CacheStats, CleanupReport, EvictionResult, HandleInfo, HandleState, ModelCache, ModelLease};
pub use config::{
    CacheConfig, CapabilitySource, CapabilityTable, MonitorConfig, ResourceConfig, RuntimeConfig,
    TierCapabilities,
};
pub use features::{AnalysisResult, FeatureAvailability, FeatureManager, FeatureMethod};
pub use monitor::{ChangeListener, HardwareMonitor, MonitorStatus, NotificationSink};
pub use probe::{PlatformProbe, StaticProbe, SystemProbe};
pub use profiler::{ClassificationInfo, HardwareProfiler, NextTierRequirements};
pub use recovery::{PressureSweep, RecoveryLevel, RecoveryOutcome};
pub use runtime::{AdaptiveRuntime, MemoryInfo, OptimizationReport, RefreshReport, SystemStatus};
pub use telemetry::{MemoryState, MemoryStatus, ResourceMonitor, ResourceSnapshot, TerminationReport};
pub use types::{
    AnalysisContext, CacheError, CallbackError, Capability, ChangeEvent, ChangeKind, ConfigError,
    FeatureError, HardwareSnapshot, InferenceError, LoaderError, ModelDescriptor, PressureLevel,
    ProbeError, TerminationError, Tier,
};
