//! Core types shared by every component of the adaptive resource manager.
//!
//! Everything in here is a plain value: tiers, pressure levels, hardware
//! snapshots, model descriptors, change events and the error taxonomy. None of
//! these types carry locks; snapshots and events are immutable once built and
//! can be cloned freely across tasks.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Free-form per-request context handed to inference runners and fallbacks.
pub type AnalysisContext = serde_json::Map<String, serde_json::Value>;

// ============================================================================
// Tier
// ============================================================================

/// Discrete hardware-capability class.
///
/// The ordering is total: `Minimal < Basic < Standard < HighEnd`. Upgrade and
/// downgrade decisions compare tiers with this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Minimal,
    Basic,
    Standard,
    HighEnd,
}

impl Tier {
    /// All tiers in ascending order.
    pub const ALL: [Tier; 4] = [Tier::Minimal, Tier::Basic, Tier::Standard, Tier::HighEnd];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Minimal => "minimal",
            Tier::Basic => "basic",
            Tier::Standard => "standard",
            Tier::HighEnd => "high_end",
        }
    }

    /// One step up, saturating at `HighEnd`.
    pub fn upgrade(self) -> Self {
        match self {
            Tier::Minimal => Tier::Basic,
            Tier::Basic => Tier::Standard,
            Tier::Standard | Tier::HighEnd => Tier::HighEnd,
        }
    }

    /// One step down, saturating at `Minimal`.
    pub fn downgrade(self) -> Self {
        match self {
            Tier::HighEnd => Tier::Standard,
            Tier::Standard => Tier::Basic,
            Tier::Basic | Tier::Minimal => Tier::Minimal,
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "minimal" => Ok(Tier::Minimal),
            "basic" => Ok(Tier::Basic),
            "standard" => Ok(Tier::Standard),
            "high_end" | "highend" => Ok(Tier::HighEnd),
            other => Err(ConfigError::UnknownTier(other.to_string())),
        }
    }
}

// ============================================================================
// PressureLevel
// ============================================================================

/// Coarse classification of how close a memory pool is to exhaustion.
///
/// Derived on demand from raw totals (see
/// [`pressure_for`](super::telemetry::pressure_for)); never cached beyond the
/// check that produced it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum PressureLevel {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl PressureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Low => "low",
            PressureLevel::Medium => "medium",
            PressureLevel::High => "high",
            PressureLevel::Critical => "critical",
        }
    }
}

impl fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Capability
// ============================================================================

/// Closed set of analysis capabilities the feature layer can serve.
///
/// String names coming from outside are normalized exactly once, through
/// [`FromStr`], and unknown names are rejected with
/// [`FeatureError::UnknownCapability`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Sentiment,
    Emotion,
    Topics,
    Semantic,
    Keywords,
    Stats,
}

impl Capability {
    pub const ALL: [Capability; 6] = [
        Capability::Sentiment,
        Capability::Emotion,
        Capability::Topics,
        Capability::Semantic,
        Capability::Keywords,
        Capability::Stats,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Sentiment => "sentiment",
            Capability::Emotion => "emotion",
            Capability::Topics => "topics",
            Capability::Semantic => "semantic",
            Capability::Keywords => "keywords",
            Capability::Stats => "stats",
        }
    }

    /// Keyword and statistics capabilities are purely algorithmic and are
    /// available on every tier.
    pub fn is_algorithmic(&self) -> bool {
        matches!(self, Capability::Keywords | Capability::Stats)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = FeatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "sentiment" | "sentiment_analysis" => Ok(Capability::Sentiment),
            "emotion" | "emotions" | "emotion_detection" => Ok(Capability::Emotion),
            "topic" | "topics" | "topic_extraction" => Ok(Capability::Topics),
            "semantic" | "semantic_analysis" | "themes" => Ok(Capability::Semantic),
            "keyword" | "keywords" | "keyword_extraction" => Ok(Capability::Keywords),
            "stats" | "statistics" | "text_stats" => Ok(Capability::Stats),
            _ => Err(FeatureError::UnknownCapability(s.to_string())),
        }
    }
}

// ============================================================================
// ModelDescriptor
// ============================================================================

/// Where a model's weights are expected to live once loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceAffinity {
    #[default]
    Cpu,
    Gpu,
}

/// Relative quality bucket of a catalog model.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AccuracyTier {
    Basic,
    #[default]
    Good,
    High,
    Best,
}

/// Static description of a catalog model, drawn from the active tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Logical capability this model serves.
    pub model_type: Capability,
    /// Opaque key handed to the loader.
    pub model_name: String,
    /// Planned resident size. The cache accounts with this number only.
    pub estimated_memory_mb: u64,
    #[serde(default)]
    pub device_affinity: DeviceAffinity,
    #[serde(default)]
    pub accuracy_tier: AccuracyTier,
}

impl ModelDescriptor {
    pub fn new(model_type: Capability, model_name: impl Into<String>, estimated_memory_mb: u64) -> Self {
        Self {
            model_type,
            model_name: model_name.into(),
            estimated_memory_mb,
            device_affinity: DeviceAffinity::Cpu,
            accuracy_tier: AccuracyTier::Good,
        }
    }

    pub fn on_gpu(mut self) -> Self {
        self.device_affinity = DeviceAffinity::Gpu;
        self
    }

    pub fn with_accuracy(mut self, accuracy: AccuracyTier) -> Self {
        self.accuracy_tier = accuracy;
        self
    }

    /// Cache key for this descriptor under the given capability.
    pub fn cache_key(&self, model_type: Capability) -> String {
        format!("{}:{}", model_type, self.model_name)
    }
}

// ============================================================================
// HardwareSnapshot
// ============================================================================

/// Immutable record of the host's hardware state at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    pub ram_total_mb: u64,
    pub ram_available_mb: u64,
    pub cpu_cores: usize,
    pub cpu_freq_mhz: u64,
    pub gpu_present: bool,
    pub gpu_name: Option<String>,
    pub gpu_total_mb: u64,
    pub gpu_available_mb: u64,
    pub gpu_pressure_level: PressureLevel,
    pub storage_free_mb: u64,
    pub captured_at: DateTime<Utc>,
}

impl HardwareSnapshot {
    /// The snapshot used when probes fail: a small CPU-only machine.
    pub fn conservative_default() -> Self {
        Self {
            ram_total_mb: 2048,
            ram_available_mb: 1024,
            cpu_cores: 1,
            cpu_freq_mhz: 1000,
            gpu_present: false,
            gpu_name: None,
            gpu_total_mb: 0,
            gpu_available_mb: 0,
            gpu_pressure_level: PressureLevel::Low,
            storage_free_mb: 0,
            captured_at: Utc::now(),
        }
    }

    pub fn ram_total_gb(&self) -> f64 {
        self.ram_total_mb as f64 / 1024.0
    }

    /// Returns `true` when any tracked dimension moved by more than `ratio`
    /// (relative to `self`), or when accelerator presence flipped. Pressure
    /// level is derived from the memory figures and is not compared on its own.
    pub fn differs_significantly(&self, other: &HardwareSnapshot, ratio: f64) -> bool {
        self.gpu_present != other.gpu_present
            || exceeds_ratio(self.ram_total_mb, other.ram_total_mb, ratio)
            || exceeds_ratio(self.ram_available_mb, other.ram_available_mb, ratio)
            || exceeds_ratio(self.cpu_cores as u64, other.cpu_cores as u64, ratio)
            || exceeds_ratio(self.cpu_freq_mhz, other.cpu_freq_mhz, ratio)
            || exceeds_ratio(self.gpu_total_mb, other.gpu_total_mb, ratio)
            || exceeds_ratio(self.gpu_available_mb, other.gpu_available_mb, ratio)
            || exceeds_ratio(self.storage_free_mb, other.storage_free_mb, ratio)
    }
}

/// Relative change from `before` to `after` is strictly greater than `ratio`.
pub(crate) fn exceeds_ratio(before: u64, after: u64, ratio: f64) -> bool {
    if before == after {
        return false;
    }
    if before == 0 {
        return true;
    }
    let delta = before.abs_diff(after) as f64;
    delta / before as f64 > ratio
}

// ============================================================================
// ChangeEvent
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    TierUpgrade,
    TierDowngrade,
    MemoryUpgrade,
    MemoryDowngrade,
    GpuAdded,
    GpuRemoved,
    GpuChanged,
}

/// One detected hardware change, produced by diffing two snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub before: HardwareSnapshot,
    pub after: HardwareSnapshot,
    pub previous_tier: Tier,
    pub new_tier: Tier,
    /// User-facing description, also used as the notification message.
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

// ============================================================================
// Errors
// ============================================================================

/// Failure inside a platform probe. Never surfaces past the profiler or the
/// resource monitor; both convert it into a conservative default.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe unavailable: {0}")]
    Unavailable(String),

    #[error("failed to parse probe output: {0}")]
    Parse(String),

    #[error("probe I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure reported by a pluggable model loader.
#[derive(Debug, Clone, Error)]
pub enum LoaderError {
    #[error("model '{0}' is not available to this loader")]
    NotFound(String),

    #[error("loader ran out of memory: {0}")]
    OutOfMemory(String),

    #[error("model load failed: {0}")]
    Failed(String),
}

/// Failure reported by a pluggable inference runner.
#[derive(Debug, Clone, Error)]
pub enum InferenceError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("model handle cannot serve this request: {0}")]
    IncompatibleModel(String),

    #[error("inference failed: {0}")]
    Failed(String),
}

/// Errors returned by [`ModelCache`](super::cache::ModelCache).
#[derive(Debug, Error)]
pub enum CacheError {
    /// The full recovery ladder ran and still could not free enough memory.
    #[error(
        "insufficient memory for '{model_key}': required {required_mb}MB, \
         available {available_mb}MB (pressure {pressure})"
    )]
    InsufficientMemory {
        model_key: String,
        required_mb: u64,
        available_mb: u64,
        pressure: PressureLevel,
    },

    #[error("failed to load '{model_key}': {source}")]
    Load {
        model_key: String,
        #[source]
        source: LoaderError,
    },

    #[error("model cache is shutting down")]
    ShuttingDown,
}

/// Errors escaping the feature layer.
#[derive(Debug, Error)]
pub enum FeatureError {
    /// Rejected at the API boundary during capability normalization.
    #[error("unknown capability '{0}'")]
    UnknownCapability(String),

    /// The always-available algorithmic implementation failed. This is a
    /// defect, not an expected runtime condition.
    #[error("fallback for '{capability}' failed: {reason}")]
    FallbackFailed {
        capability: Capability,
        reason: String,
    },
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read capability table {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse capability table: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("unknown tier '{0}'")]
    UnknownTier(String),

    #[error("invalid capability table: {0}")]
    Invalid(String),

    #[error("invalid value '{value}' for environment variable {var}")]
    Env { var: String, value: String },
}

/// Failure to terminate a single foreign process.
#[derive(Debug, Clone, Error)]
pub enum TerminationError {
    #[error("refusing to terminate own process {0}")]
    OwnProcess(u32),

    #[error("process {0} not found")]
    NotFound(u32),

    #[error("process {pid} could not be signalled: {reason}")]
    Refused { pid: u32, reason: String },

    #[error("process {0} still running after forced kill")]
    StillRunning(u32),
}

/// Failure raised by a change listener or notification sink.
#[derive(Debug, Clone, Error)]
#[error("callback failed: {0}")]
pub struct CallbackError(pub String);

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tier_ordering_is_total() {
        assert!(Tier::Minimal < Tier::Basic);
        assert!(Tier::Basic < Tier::Standard);
        assert!(Tier::Standard < Tier::HighEnd);
        assert_eq!(Tier::HighEnd.upgrade(), Tier::HighEnd);
        assert_eq!(Tier::Minimal.downgrade(), Tier::Minimal);
        assert_eq!(Tier::Standard.downgrade(), Tier::Basic);
    }

    #[test]
    fn test_tier_parse_and_serde_names() {
        assert_eq!("high-end".parse::<Tier>().unwrap(), Tier::HighEnd);
        assert_eq!(serde_json::to_string(&Tier::HighEnd).unwrap(), "\"high_end\"");
        assert!(matches!(
            "ultra".parse::<Tier>(),
            Err(ConfigError::UnknownTier(_))
        ));
    }

    #[test]
    fn test_capability_normalization() {
        assert_eq!(" Sentiment-Analysis ".parse::<Capability>().unwrap(), Capability::Sentiment);
        assert_eq!("emotions".parse::<Capability>().unwrap(), Capability::Emotion);
        assert_eq!("text stats".parse::<Capability>().unwrap(), Capability::Stats);

        let err = "telepathy".parse::<Capability>().unwrap_err();
        assert!(matches!(err, FeatureError::UnknownCapability(name) if name == "telepathy"));
    }

    #[test]
    fn test_algorithmic_capabilities() {
        let algorithmic: Vec<_> = Capability::ALL
            .iter()
            .filter(|c| c.is_algorithmic())
            .collect();
        assert_eq!(algorithmic, vec![&Capability::Keywords, &Capability::Stats]);
    }

    #[test]
    fn test_significant_change_threshold() {
        let base = HardwareSnapshot {
            ram_total_mb: 16_384,
            ram_available_mb: 8_000,
            cpu_cores: 8,
            cpu_freq_mhz: 3000,
            storage_free_mb: 100_000,
            ..HardwareSnapshot::conservative_default()
        };

        // 5% RAM change is noise
        let small = HardwareSnapshot {
            ram_available_mb: 8_400,
            ..base.clone()
        };
        assert!(!base.differs_significantly(&small, 0.10));

        // 25% is significant
        let big = HardwareSnapshot {
            ram_available_mb: 6_000,
            ..base.clone()
        };
        assert!(base.differs_significantly(&big, 0.10));

        // GPU presence flip is always significant
        let gpu = HardwareSnapshot {
            gpu_present: true,
            ..base.clone()
        };
        assert!(base.differs_significantly(&gpu, 0.10));

        // pressure level alone is not a hardware change
        let pressured = HardwareSnapshot {
            gpu_pressure_level: PressureLevel::Critical,
            ..base.clone()
        };
        assert!(!base.differs_significantly(&pressured, 0.10));
    }

    #[test]
    fn test_exceeds_ratio_edges() {
        assert!(!exceeds_ratio(0, 0, 0.1));
        assert!(exceeds_ratio(0, 10, 0.1));
        assert!(!exceeds_ratio(1000, 1100, 0.1));
        assert!(exceeds_ratio(1000, 1101, 0.1));
    }

    #[test]
    fn test_cache_error_message_carries_context() {
        let err = CacheError::InsufficientMemory {
            model_key: "emotion:distilroberta".into(),
            required_mb: 800,
            available_mb: 120,
            pressure: PressureLevel::Critical,
        };
        let msg = err.to_string();
        assert!(msg.contains("800MB"));
        assert!(msg.contains("120MB"));
        assert!(msg.contains("critical"));
    }
}
