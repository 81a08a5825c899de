//! Configuration: the per-tier capability table and runtime tuning knobs.
//!
//! The capability table is the static, externally loaded description of what
//! each [`Tier`] may do:
//!
//! ```json
//! {
//!   "basic": {
//!     "memory_limit_mb": 1536,
//!     "features": ["sentiment", "keywords", "stats"],
//!     "models": {
//!       "sentiment": {
//!         "model_type": "sentiment",
//!         "model_name": "distilbert-base-uncased-finetuned-sst-2-english",
//!         "estimated_memory_mb": 270
//!       }
//!     }
//!   },
//!   "minimal": { ... }, "standard": { ... }, "high_end": { ... }
//! }
//! ```
//!
//! Tables are validated on load and can be re-read at runtime through
//! [`HardwareProfiler::reload_config`](super::profiler::HardwareProfiler::reload_config).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::types::{AccuracyTier, Capability, ConfigError, ModelDescriptor, Tier};

// ============================================================================
// Defaults
// ============================================================================

const DEFAULT_HARDWARE_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
const DEFAULT_PRESSURE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_RECOVERY_IDLE_THRESHOLD: Duration = Duration::from_secs(2 * 60);
const DEFAULT_SAFETY_BUFFER_MB: u64 = 500;
const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_DETECTION_CACHE_TTL: Duration = Duration::from_secs(30);
const DEFAULT_SIGNIFICANT_CHANGE_RATIO: f64 = 0.10;

// ============================================================================
// Capability table
// ============================================================================

/// What one tier is allowed to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierCapabilities {
    /// Upper bound for resident model memory at this tier.
    pub memory_limit_mb: u64,
    /// Capabilities whose AI path is enabled at this tier.
    pub features: Vec<Capability>,
    /// Model catalog, keyed by the capability each model serves.
    #[serde(default)]
    pub models: BTreeMap<Capability, ModelDescriptor>,
}

impl TierCapabilities {
    pub fn supports(&self, capability: Capability) -> bool {
        self.features.contains(&capability)
    }

    pub fn model_for(&self, capability: Capability) -> Option<&ModelDescriptor> {
        self.models.get(&capability)
    }
}

/// Per-tier capability table. Every tier is always present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityTable {
    pub minimal: TierCapabilities,
    pub basic: TierCapabilities,
    pub standard: TierCapabilities,
    pub high_end: TierCapabilities,
}

impl CapabilityTable {
    pub fn for_tier(&self, tier: Tier) -> &TierCapabilities {
        match tier {
            Tier::Minimal => &self.minimal,
            Tier::Basic => &self.basic,
            Tier::Standard => &self.standard,
            Tier::HighEnd => &self.high_end,
        }
    }

    /// Parse and validate a table from JSON text.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let table: CapabilityTable = serde_json::from_str(json)?;
        table.validate()?;
        Ok(table)
    }

    /// Read, parse and validate a table from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    /// Structural checks a hand-written table can get wrong.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut previous_limit = 0;
        for tier in Tier::ALL {
            let caps = self.for_tier(tier);

            if caps.memory_limit_mb < previous_limit {
                return Err(ConfigError::Invalid(format!(
                    "tier '{}' has a smaller memory limit ({}MB) than the tier below it ({}MB)",
                    tier, caps.memory_limit_mb, previous_limit
                )));
            }
            previous_limit = caps.memory_limit_mb;

            for (capability, descriptor) in &caps.models {
                if descriptor.model_type != *capability {
                    return Err(ConfigError::Invalid(format!(
                        "tier '{}': model '{}' is keyed as '{}' but declares model_type '{}'",
                        tier, descriptor.model_name, capability, descriptor.model_type
                    )));
                }
                if capability.is_algorithmic() {
                    return Err(ConfigError::Invalid(format!(
                        "tier '{}': '{}' is algorithmic and cannot have a model",
                        tier, capability
                    )));
                }
                if descriptor.estimated_memory_mb > caps.memory_limit_mb {
                    return Err(ConfigError::Invalid(format!(
                        "tier '{}': model '{}' ({}MB) exceeds the tier memory limit ({}MB)",
                        tier, descriptor.model_name, descriptor.estimated_memory_mb, caps.memory_limit_mb
                    )));
                }
            }

            for feature in &caps.features {
                if !feature.is_algorithmic() && !caps.models.contains_key(feature) {
                    return Err(ConfigError::Invalid(format!(
                        "tier '{}': feature '{}' is enabled but has no model in the catalog",
                        tier, feature
                    )));
                }
            }
        }
        Ok(())
    }

    /// The table shipped with the crate.
    pub fn builtin() -> Self {
        use Capability::*;

        let sentiment_small = ModelDescriptor::new(
            Sentiment,
            "distilbert-base-uncased-finetuned-sst-2-english",
            270,
        )
        .with_accuracy(AccuracyTier::Basic);
        let sentiment_large =
            ModelDescriptor::new(Sentiment, "cardiffnlp/twitter-roberta-base-sentiment-latest", 520)
                .with_accuracy(AccuracyTier::High);
        let emotion = ModelDescriptor::new(
            Emotion,
            "j-hartmann/emotion-english-distilroberta-base",
            330,
        );
        let emotion_large = ModelDescriptor::new(Emotion, "SamLowe/roberta-base-go_emotions", 520)
            .on_gpu()
            .with_accuracy(AccuracyTier::High);
        let topics = ModelDescriptor::new(Topics, "facebook/bart-large-mnli", 1650)
            .with_accuracy(AccuracyTier::Good);
        let topics_large = topics.clone().on_gpu().with_accuracy(AccuracyTier::High);
        let semantic = ModelDescriptor::new(Semantic, "sentence-transformers/all-mpnet-base-v2", 440)
            .on_gpu()
            .with_accuracy(AccuracyTier::Best);

        let models = |entries: Vec<ModelDescriptor>| -> BTreeMap<Capability, ModelDescriptor> {
            entries.into_iter().map(|d| (d.model_type, d)).collect()
        };

        Self {
            minimal: TierCapabilities {
                memory_limit_mb: 256,
                features: vec![Keywords, Stats],
                models: BTreeMap::new(),
            },
            basic: TierCapabilities {
                memory_limit_mb: 1024,
                features: vec![Sentiment, Keywords, Stats],
                models: models(vec![sentiment_small]),
            },
            standard: TierCapabilities {
                memory_limit_mb: 3072,
                features: vec![Sentiment, Emotion, Topics, Keywords, Stats],
                models: models(vec![sentiment_large.clone(), emotion, topics]),
            },
            high_end: TierCapabilities {
                memory_limit_mb: 8192,
                features: vec![Sentiment, Emotion, Topics, Semantic, Keywords, Stats],
                models: models(vec![sentiment_large, emotion_large, topics_large, semantic]),
            },
        }
    }
}

impl Default for CapabilityTable {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Where the capability table comes from. Re-read on every reload.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CapabilitySource {
    #[default]
    Builtin,
    File(PathBuf),
}

impl CapabilitySource {
    pub fn load(&self) -> Result<CapabilityTable, ConfigError> {
        match self {
            CapabilitySource::Builtin => Ok(CapabilityTable::builtin()),
            CapabilitySource::File(path) => CapabilityTable::from_json_file(path),
        }
    }
}

// ============================================================================
// Component configuration
// ============================================================================

/// Tuning for [`ModelCache`](super::cache::ModelCache) sweeps and recovery.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// How often the idle sweep runs. Default: 5 minutes.
    pub idle_sweep_interval: Duration,
    /// Handles untouched for longer than this are evicted by the idle sweep.
    /// Default: 10 minutes.
    pub idle_timeout: Duration,
    /// How often memory pressure is re-evaluated. Default: 1 minute.
    pub pressure_sweep_interval: Duration,
    /// Idle threshold used by recovery level 2. Default: 2 minutes.
    pub recovery_idle_threshold: Duration,
    /// Whether recovery level 4 may terminate foreign accelerator processes.
    pub terminate_foreign_processes: bool,
    /// Grace period for background tasks on `stop()`. Default: 5 seconds.
    pub shutdown_grace: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            idle_sweep_interval: DEFAULT_IDLE_SWEEP_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            pressure_sweep_interval: DEFAULT_PRESSURE_SWEEP_INTERVAL,
            recovery_idle_threshold: DEFAULT_RECOVERY_IDLE_THRESHOLD,
            terminate_foreign_processes: true,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Tuning for [`ResourceMonitor`](super::telemetry::ResourceMonitor).
#[derive(Debug, Clone)]
pub struct ResourceConfig {
    /// Subtracted from free memory before it is reported as available for
    /// models. Default: 500MB.
    pub safety_buffer_mb: u64,
    /// How long a foreign process gets to exit after a graceful terminate
    /// before it is force-killed. Default: 5 seconds.
    pub termination_grace: Duration,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            safety_buffer_mb: DEFAULT_SAFETY_BUFFER_MB,
            termination_grace: DEFAULT_TERMINATION_GRACE,
        }
    }
}

/// Tuning for [`HardwareMonitor`](super::monitor::HardwareMonitor).
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Hardware poll interval. Default: 5 minutes.
    pub poll_interval: Duration,
    /// Relative delta above which a dimension counts as changed. Default: 10%.
    pub significant_change_ratio: f64,
    /// How long `detect_cached()` serves the previous snapshot. Default: 30s.
    pub detection_cache_ttl: Duration,
    /// Grace period for the poll task on `stop()`.
    pub shutdown_grace: Duration,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_HARDWARE_POLL_INTERVAL,
            significant_change_ratio: DEFAULT_SIGNIFICANT_CHANGE_RATIO,
            detection_cache_ttl: DEFAULT_DETECTION_CACHE_TTL,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

// ============================================================================
// RuntimeConfig
// ============================================================================

/// Top-level configuration for an [`AdaptiveRuntime`](super::runtime::AdaptiveRuntime).
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use mofa_adaptive::adaptive::config::RuntimeConfig;
///
/// let config = RuntimeConfig::default()
///     .with_capability_file("/etc/journal/capabilities.json")
///     .with_idle_timeout(Duration::from_secs(300))
///     .with_safety_buffer_mb(1024);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub capabilities: CapabilitySource,
    pub cache: CacheConfig,
    pub resources: ResourceConfig,
    pub monitor: MonitorConfig,
}

impl RuntimeConfig {
    /// Build a configuration from defaults overridden by `MOFA_ADAPTIVE_*`
    /// environment variables.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `MOFA_ADAPTIVE_CAPABILITIES` | path to a JSON capability table |
    /// | `MOFA_ADAPTIVE_POLL_SECS` | hardware poll interval |
    /// | `MOFA_ADAPTIVE_IDLE_TIMEOUT_SECS` | idle eviction timeout |
    /// | `MOFA_ADAPTIVE_SAFETY_BUFFER_MB` | memory safety buffer |
    /// | `MOFA_ADAPTIVE_TERMINATE_FOREIGN` | `true`/`false` |
    pub fn try_from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(path) = lookup("MOFA_ADAPTIVE_CAPABILITIES") {
            config.capabilities = CapabilitySource::File(PathBuf::from(path));
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "MOFA_ADAPTIVE_POLL_SECS")? {
            config.monitor.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var::<u64>(&lookup, "MOFA_ADAPTIVE_IDLE_TIMEOUT_SECS")? {
            config.cache.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(mb) = parse_var::<u64>(&lookup, "MOFA_ADAPTIVE_SAFETY_BUFFER_MB")? {
            config.resources.safety_buffer_mb = mb;
        }
        if let Some(enabled) = parse_var::<bool>(&lookup, "MOFA_ADAPTIVE_TERMINATE_FOREIGN")? {
            config.cache.terminate_foreign_processes = enabled;
        }

        Ok(config)
    }

    pub fn with_capability_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.capabilities = CapabilitySource::File(path.into());
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.monitor.poll_interval = interval;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.cache.idle_timeout = timeout;
        self
    }

    pub fn with_safety_buffer_mb(mut self, mb: u64) -> Self {
        self.resources.safety_buffer_mb = mb;
        self
    }

    pub fn with_foreign_termination(mut self, enabled: bool) -> Self {
        self.cache.terminate_foreign_processes = enabled;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.cache.shutdown_grace = grace;
        self.monitor.shutdown_grace = grace;
        self
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(value) => value.trim().parse::<T>().map(Some).map_err(|_| ConfigError::Env {
            var: var.to_string(),
            value,
        }),
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_builtin_table_is_valid() {
        let table = CapabilityTable::builtin();
        table.validate().unwrap();

        assert!(table.for_tier(Tier::HighEnd).supports(Capability::Semantic));
        assert!(!table.for_tier(Tier::Standard).supports(Capability::Semantic));
        assert!(table.for_tier(Tier::Minimal).models.is_empty());
    }

    #[test]
    fn test_builtin_limits_increase_with_tier() {
        let table = CapabilityTable::builtin();
        let limits: Vec<u64> = Tier::ALL
            .iter()
            .map(|t| table.for_tier(*t).memory_limit_mb)
            .collect();
        assert!(limits.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_json_round_trip_through_file() {
        let json = serde_json::to_string_pretty(&CapabilityTable::builtin()).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(json.as_bytes()).unwrap();

        let loaded = CapabilityTable::from_json_file(file.path()).unwrap();
        assert_eq!(loaded, CapabilityTable::builtin());
    }

    #[test]
    fn test_feature_without_model_is_rejected() {
        let mut table = CapabilityTable::builtin();
        table.basic.features.push(Capability::Emotion);

        let err = table.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("emotion")));
    }

    #[test]
    fn test_mismatched_model_key_is_rejected() {
        let mut table = CapabilityTable::builtin();
        let wrong = ModelDescriptor::new(Capability::Emotion, "mislabeled", 100);
        table.basic.models.insert(Capability::Sentiment, wrong);

        assert!(matches!(table.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = CapabilityTable::from_json_file("/nonexistent/capabilities.json").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_malformed_json_is_parse_error() {
        let err = CapabilityTable::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("MOFA_ADAPTIVE_POLL_SECS", "30"),
            ("MOFA_ADAPTIVE_SAFETY_BUFFER_MB", "1024"),
            ("MOFA_ADAPTIVE_TERMINATE_FOREIGN", "false"),
            ("MOFA_ADAPTIVE_CAPABILITIES", "/tmp/caps.json"),
        ]
        .into_iter()
        .collect();

        let config =
            RuntimeConfig::from_lookup(|var| vars.get(var).map(|v| v.to_string())).unwrap();

        assert_eq!(config.monitor.poll_interval, Duration::from_secs(30));
        assert_eq!(config.resources.safety_buffer_mb, 1024);
        assert!(!config.cache.terminate_foreign_processes);
        assert_eq!(
            config.capabilities,
            CapabilitySource::File(PathBuf::from("/tmp/caps.json"))
        );
        // untouched values keep their defaults
        assert_eq!(config.cache.idle_timeout, DEFAULT_IDLE_TIMEOUT);
    }

    #[test]
    fn test_env_invalid_value() {
        let err = RuntimeConfig::from_lookup(|var| {
            (var == "MOFA_ADAPTIVE_POLL_SECS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Env { var, .. } if var == "MOFA_ADAPTIVE_POLL_SECS"));
    }
}
