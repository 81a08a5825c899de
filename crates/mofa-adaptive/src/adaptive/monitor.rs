//! HardwareMonitor: Live Tier Migration
//!
//! Polls the profiler on a fixed interval and reconfigures the running
//! service when the machine changes underneath it:
//!
//! ```text
//!   every poll_interval (or force_check)
//!          │
//!          ▼
//!   detect ─▶ classify ─▶ diff against last snapshot
//!                               │
//!                 no events ◀───┤
//!                               ▼
//!                ┌──────────── react ─────────────┐
//!                │ GpuRemoved   → evict_all        │
//!                │ tier change  → upgrade_features │
//!                │ any change   → set_budget       │
//!                └──────────────┬─────────────────┘
//!                               ▼
//!                 notify listeners and sinks (errors logged, never fatal)
//!                               ▼
//!                 commit snapshot, tier, history
//! ```
//!
//! Checks are serialized: a `force_check` issued while the poll task is mid
//! iteration waits for it and then diffs against the committed result.

use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use super::cache::ModelCache;
use super::config::MonitorConfig;
use super::features::FeatureManager;
use super::profiler::{ClassificationInfo, HardwareProfiler};
use super::tasks::TaskSet;
use super::types::{exceeds_ratio, CallbackError, ChangeEvent, ChangeKind, HardwareSnapshot, Tier};

/// Most recent change events kept for status queries.
pub const CHANGE_HISTORY_LIMIT: usize = 50;

// ============================================================================
// Callbacks
// ============================================================================

/// Receives every structured change event.
#[async_trait]
pub trait ChangeListener: Send + Sync {
    async fn on_change(&self, event: &ChangeEvent) -> Result<(), CallbackError>;
}

#[async_trait]
impl<F, Fut> ChangeListener for F
where
    F: Fn(ChangeEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
    async fn on_change(&self, event: &ChangeEvent) -> Result<(), CallbackError> {
        (self)(event.clone()).await
    }
}

/// Receives a user-facing message per change.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(&self, message: &str) -> Result<(), CallbackError>;
}

#[async_trait]
impl<F, Fut> NotificationSink for F
where
    F: Fn(String) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), CallbackError>> + Send + 'static,
{
    async fn notify(&self, message: &str) -> Result<(), CallbackError> {
        (self)(message.to_string()).await
    }
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Diff two snapshots into change events. Pure.
///
/// Tier events come first, then memory, then accelerator events. Memory and
/// accelerator events are only considered when the snapshots differ
/// significantly (see [`HardwareSnapshot::differs_significantly`]).
pub fn diff_snapshots(
    before: &HardwareSnapshot,
    after: &HardwareSnapshot,
    previous_tier: Tier,
    new_tier: Tier,
    ratio: f64,
) -> Vec<ChangeEvent> {
    let mut changes: Vec<(ChangeKind, String)> = Vec::new();

    if new_tier > previous_tier {
        changes.push((
            ChangeKind::TierUpgrade,
            format!("Hardware upgraded: tier {} → {}", previous_tier, new_tier),
        ));
    } else if new_tier < previous_tier {
        changes.push((
            ChangeKind::TierDowngrade,
            format!("Hardware downgraded: tier {} → {}", previous_tier, new_tier),
        ));
    }

    let significant = before.differs_significantly(after, ratio);

    if significant && exceeds_ratio(before.ram_total_mb, after.ram_total_mb, ratio) {
        let kind = if after.ram_total_mb > before.ram_total_mb {
            ChangeKind::MemoryUpgrade
        } else {
            ChangeKind::MemoryDowngrade
        };
        let verb = if kind == ChangeKind::MemoryUpgrade { "increased" } else { "decreased" };
        changes.push((
            kind,
            format!(
                "System memory {}: {}MB → {}MB",
                verb, before.ram_total_mb, after.ram_total_mb
            ),
        ));
    }

    match (before.gpu_present, after.gpu_present) {
        _ if !significant => {}
        (false, true) => changes.push((
            ChangeKind::GpuAdded,
            format!(
                "GPU detected: {} ({}MB)",
                after.gpu_name.as_deref().unwrap_or("unknown"),
                after.gpu_total_mb
            ),
        )),
        (true, false) => changes.push((
            ChangeKind::GpuRemoved,
            format!(
                "GPU removed: {}",
                before.gpu_name.as_deref().unwrap_or("unknown")
            ),
        )),
        (true, true) if exceeds_ratio(before.gpu_total_mb, after.gpu_total_mb, ratio) => {
            changes.push((
                ChangeKind::GpuChanged,
                format!(
                    "GPU memory changed: {}MB → {}MB",
                    before.gpu_total_mb, after.gpu_total_mb
                ),
            ))
        }
        _ => {}
    }

    let timestamp = Utc::now();
    changes
        .into_iter()
        .map(|(kind, description)| ChangeEvent {
            kind,
            before: before.clone(),
            after: after.clone(),
            previous_tier,
            new_tier,
            description,
            timestamp,
        })
        .collect()
}

/// Model memory budget for a snapshot: half the host RAM, or the accelerator
/// total minus the safety buffer when that is larger, never above the tier
/// limit.
pub fn model_budget_mb(tier_limit_mb: u64, snapshot: &HardwareSnapshot, safety_buffer_mb: u64) -> u64 {
    let host_share = snapshot.ram_total_mb / 2;
    let accelerator_share = if snapshot.gpu_present {
        snapshot.gpu_total_mb.saturating_sub(safety_buffer_mb)
    } else {
        0
    };
    tier_limit_mb.min(host_share.max(accelerator_share))
}

// ============================================================================
// HardwareMonitor
// ============================================================================

/// Read-only view of the monitor's committed state.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatus {
    pub tier: Tier,
    pub snapshot: HardwareSnapshot,
    pub classification: ClassificationInfo,
    pub last_check: Option<DateTime<Utc>>,
    pub running: bool,
    pub poll_interval_secs: u64,
    pub recent_changes: Vec<ChangeEvent>,
}

#[derive(Debug)]
struct MonitorState {
    snapshot: HardwareSnapshot,
    tier: Tier,
    classification: ClassificationInfo,
    last_check: Option<DateTime<Utc>>,
    history: VecDeque<ChangeEvent>,
}

pub struct HardwareMonitor {
    profiler: Arc<HardwareProfiler>,
    cache: Arc<ModelCache>,
    features: Arc<FeatureManager>,
    config: MonitorConfig,
    state: RwLock<MonitorState>,
    check_lock: Mutex<()>,
    listeners: RwLock<Vec<Arc<dyn ChangeListener>>>,
    sinks: RwLock<Vec<Arc<dyn NotificationSink>>>,
    tasks: TaskSet,
}

impl std::fmt::Debug for HardwareMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareMonitor")
            .field("tier", &self.current_tier())
            .field("poll_interval", &self.config.poll_interval)
            .field("running", &self.is_running())
            .finish()
    }
}

impl HardwareMonitor {
    /// Build a monitor whose baseline is `initial`, already applied to the
    /// cache and feature manager by the caller.
    pub fn new(
        profiler: Arc<HardwareProfiler>,
        cache: Arc<ModelCache>,
        features: Arc<FeatureManager>,
        config: MonitorConfig,
        initial: HardwareSnapshot,
    ) -> Self {
        let (tier, classification) = profiler.classify(&initial);
        tracing::info!(
            "HardwareMonitor: initialized at tier {} (poll every {:?})",
            tier,
            config.poll_interval
        );
        Self {
            profiler,
            cache,
            features,
            config,
            state: RwLock::new(MonitorState {
                snapshot: initial,
                tier,
                classification,
                last_check: None,
                history: VecDeque::with_capacity(CHANGE_HISTORY_LIMIT),
            }),
            check_lock: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
            sinks: RwLock::new(Vec::new()),
            tasks: TaskSet::new("HardwareMonitor"),
        }
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    pub fn current_tier(&self) -> Tier {
        self.state.read().unwrap_or_else(|e| e.into_inner()).tier
    }

    pub fn current_snapshot(&self) -> HardwareSnapshot {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .snapshot
            .clone()
    }

    pub fn classification(&self) -> ClassificationInfo {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .classification
            .clone()
    }

    pub fn last_check(&self) -> Option<DateTime<Utc>> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).last_check
    }

    /// Recorded changes, oldest first.
    pub fn change_history(&self) -> Vec<ChangeEvent> {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .history
            .iter()
            .cloned()
            .collect()
    }

    pub fn status(&self) -> MonitorStatus {
        let state = self.state.read().unwrap_or_else(|e| e.into_inner());
        MonitorStatus {
            tier: state.tier,
            snapshot: state.snapshot.clone(),
            classification: state.classification.clone(),
            last_check: state.last_check,
            running: self.tasks.is_running(),
            poll_interval_secs: self.config.poll_interval.as_secs(),
            recent_changes: state.history.iter().rev().take(10).cloned().collect(),
        }
    }

    pub fn add_change_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn add_notification_sink(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(sink);
    }

    /// Budget the cache should run with for `snapshot` at `tier`.
    pub fn budget_for(&self, tier: Tier, snapshot: &HardwareSnapshot) -> u64 {
        model_budget_mb(
            self.profiler.get_memory_limit(tier),
            snapshot,
            self.cache.resources().safety_buffer_mb(),
        )
    }

    // ========================================================================
    // Check iteration
    // ========================================================================

    /// Run one detect → classify → diff → react → notify → commit iteration.
    pub async fn force_check(&self) -> Vec<ChangeEvent> {
        let _guard = self.check_lock.lock().await;

        let after = self.profiler.detect().await;
        let (new_tier, classification) = self.profiler.classify(&after);
        let (before, previous_tier) = {
            let state = self.state.read().unwrap_or_else(|e| e.into_inner());
            (state.snapshot.clone(), state.tier)
        };

        let events = diff_snapshots(
            &before,
            &after,
            previous_tier,
            new_tier,
            self.config.significant_change_ratio,
        );

        if events.is_empty() {
            tracing::debug!("HardwareMonitor: no significant change (tier {})", new_tier);
        } else {
            for event in &events {
                tracing::info!("HardwareMonitor: {}", event.description);
            }
            self.react(&events, previous_tier, new_tier, &after).await;
            self.notify(&events).await;
        }

        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.snapshot = after;
        state.tier = new_tier;
        state.classification = classification;
        state.last_check = Some(Utc::now());
        for event in &events {
            if state.history.len() == CHANGE_HISTORY_LIMIT {
                state.history.pop_front();
            }
            state.history.push_back(event.clone());
        }

        events
    }

    async fn react(
        &self,
        events: &[ChangeEvent],
        previous_tier: Tier,
        new_tier: Tier,
        after: &HardwareSnapshot,
    ) {
        if events.iter().any(|e| e.kind == ChangeKind::GpuRemoved) {
            let report = self.cache.evict_all().await;
            tracing::warn!(
                "HardwareMonitor: accelerator gone, evicted {} model(s) ({}MB)",
                report.evicted.len(),
                report.freed_mb
            );
        }

        if new_tier != previous_tier {
            self.features
                .upgrade_features(new_tier, self.profiler.get_tier_capabilities(new_tier));
        }

        let budget = self.budget_for(new_tier, after);
        let report = self.cache.set_budget(budget).await;
        if !report.evicted.is_empty() {
            tracing::info!(
                "HardwareMonitor: budget {}MB freed {}MB from {} model(s)",
                budget,
                report.freed_mb,
                report.evicted.len()
            );
        }
    }

    async fn notify(&self, events: &[ChangeEvent]) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let sinks = self.sinks.read().unwrap_or_else(|e| e.into_inner()).clone();

        for event in events {
            let listener_calls = listeners.iter().map(|l| l.on_change(event));
            let sink_calls = sinks.iter().map(|s| s.notify(&event.description));
            let (listener_results, sink_results) = futures::join!(
                futures::future::join_all(listener_calls),
                futures::future::join_all(sink_calls),
            );

            for err in listener_results.into_iter().filter_map(Result::err) {
                tracing::warn!("HardwareMonitor: change listener failed: {}", err);
            }
            for err in sink_results.into_iter().filter_map(Result::err) {
                tracing::warn!("HardwareMonitor: notification sink failed: {}", err);
            }
        }
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the poll loop.
    pub fn start(self: &Arc<Self>) {
        if !self.tasks.begin() {
            tracing::debug!("HardwareMonitor: already running");
            return;
        }
        self.tasks.spawn_periodic(
            "hardware poll",
            Arc::downgrade(self),
            self.config.poll_interval,
            |monitor: Arc<HardwareMonitor>| async move {
                monitor.force_check().await;
            },
        );
        tracing::info!("HardwareMonitor: started");
    }

    pub async fn stop(&self) {
        self.tasks.stop(self.config.shutdown_grace).await;
        tracing::info!("HardwareMonitor: stopped");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive::cache::tests::MockLoader;
    use crate::adaptive::config::{CacheConfig, CapabilitySource, CapabilityTable};
    use crate::adaptive::features::tests::EchoRunner;
    use crate::adaptive::probe::StaticProbe;
    use crate::adaptive::telemetry::ResourceMonitor;
    use crate::adaptive::types::{AnalysisContext, Capability, PressureLevel};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn snapshot(ram_mb: u64, gpu_mb: Option<u64>) -> HardwareSnapshot {
        HardwareSnapshot {
            ram_total_mb: ram_mb,
            ram_available_mb: ram_mb / 2,
            cpu_cores: 8,
            cpu_freq_mhz: 3000,
            gpu_present: gpu_mb.is_some(),
            gpu_name: gpu_mb.map(|_| "Test GPU".to_string()),
            gpu_total_mb: gpu_mb.unwrap_or(0),
            gpu_available_mb: gpu_mb.unwrap_or(0),
            ..HardwareSnapshot::conservative_default()
        }
    }

    struct Fixture {
        probe: Arc<StaticProbe>,
        cache: Arc<ModelCache>,
        features: Arc<FeatureManager>,
        monitor: Arc<HardwareMonitor>,
    }

    async fn fixture(probe: StaticProbe) -> Fixture {
        let probe = Arc::new(probe);
        let profiler = Arc::new(HardwareProfiler::with_table(
            probe.clone(),
            CapabilitySource::Builtin,
            CapabilityTable::builtin(),
        ));
        let initial = profiler.detect().await;
        let (tier, _) = profiler.classify(&initial);
        let resources = Arc::new(ResourceMonitor::new(probe.clone()));
        let cache = Arc::new(ModelCache::new(
            Arc::new(MockLoader::new()),
            resources,
            CacheConfig::default(),
            0,
        ));
        let features = Arc::new(FeatureManager::new(
            cache.clone(),
            Arc::new(EchoRunner::new()),
            tier,
            profiler.get_tier_capabilities(tier),
        ));
        let monitor = Arc::new(HardwareMonitor::new(
            profiler,
            cache.clone(),
            features.clone(),
            MonitorConfig::default(),
            initial.clone(),
        ));
        cache.set_budget(monitor.budget_for(tier, &initial)).await;
        Fixture {
            probe,
            cache,
            features,
            monitor,
        }
    }

    #[test]
    fn test_diff_no_change() {
        let a = snapshot(8192, None);
        let events = diff_snapshots(&a, &a.clone(), Tier::Standard, Tier::Standard, 0.1);
        assert!(events.is_empty());
    }

    #[test]
    fn test_diff_small_ram_change_ignored() {
        let a = snapshot(8192, None);
        let b = snapshot(8600, None);
        assert!(diff_snapshots(&a, &b, Tier::Standard, Tier::Standard, 0.1).is_empty());
    }

    #[test]
    fn test_diff_pressure_only_change_ignored() {
        let a = snapshot(16384, Some(8192));
        let b = HardwareSnapshot {
            gpu_pressure_level: PressureLevel::Critical,
            ..a.clone()
        };
        assert!(!a.differs_significantly(&b, 0.1));
        assert!(diff_snapshots(&a, &b, Tier::HighEnd, Tier::HighEnd, 0.1).is_empty());
    }

    #[test]
    fn test_diff_tier_and_gpu_added() {
        let a = snapshot(16384, None);
        let b = snapshot(16384, Some(8192));
        let events = diff_snapshots(&a, &b, Tier::Standard, Tier::HighEnd, 0.1);
        let kinds: Vec<ChangeKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(kinds, vec![ChangeKind::TierUpgrade, ChangeKind::GpuAdded]);
        assert_eq!(events[0].description, "Hardware upgraded: tier standard → high_end");
    }

    #[test]
    fn test_diff_gpu_removed_and_memory_down() {
        let a = snapshot(16384, Some(8192));
        let b = snapshot(8192, None);
        let events = diff_snapshots(&a, &b, Tier::HighEnd, Tier::Standard, 0.1);
        let kinds: Vec<ChangeKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ChangeKind::TierDowngrade,
                ChangeKind::MemoryDowngrade,
                ChangeKind::GpuRemoved
            ]
        );
    }

    #[test]
    fn test_diff_gpu_changed() {
        let a = snapshot(16384, Some(8192));
        let b = snapshot(16384, Some(12288));
        let events = diff_snapshots(&a, &b, Tier::HighEnd, Tier::HighEnd, 0.1);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChangeKind::GpuChanged);
    }

    #[test]
    fn test_model_budget() {
        // Host share wins without an accelerator.
        assert_eq!(model_budget_mb(8192, &snapshot(8192, None), 500), 4096);
        // Accelerator share minus buffer when larger.
        assert_eq!(model_budget_mb(8192, &snapshot(8192, Some(8192)), 500), 7692);
        // Capped by the tier limit.
        assert_eq!(model_budget_mb(1024, &snapshot(65536, Some(24576)), 500), 1024);
    }

    #[tokio::test]
    async fn test_force_check_no_change() {
        let fx = fixture(StaticProbe::new().with_ram_mb(16384, 8192)).await;
        let events = fx.monitor.force_check().await;
        assert!(events.is_empty());
        assert!(fx.monitor.last_check().is_some());
    }

    #[tokio::test]
    async fn test_gpu_added_upgrades_tier_and_features() {
        let fx = fixture(StaticProbe::new().with_ram_mb(16384, 8192).with_cpu(8, 3000)).await;
        assert_ne!(fx.monitor.current_tier(), Tier::HighEnd);
        assert!(!fx.features.can_perform(Capability::Semantic));

        let messages = Arc::new(std::sync::Mutex::new(Vec::<String>::new()));
        let sink_messages = messages.clone();
        fx.monitor.add_notification_sink(Arc::new(move |msg: String| {
            let sink_messages = sink_messages.clone();
            async move {
                sink_messages.lock().unwrap().push(msg);
                Ok::<(), CallbackError>(())
            }
        }));

        fx.probe.set_gpu("RTX 4070", 12288, 11000);
        let events = fx.monitor.force_check().await;

        assert!(events.iter().any(|e| e.kind == ChangeKind::TierUpgrade));
        assert!(events.iter().any(|e| e.kind == ChangeKind::GpuAdded));
        assert_eq!(fx.monitor.current_tier(), Tier::HighEnd);
        assert!(fx.features.can_perform(Capability::Semantic));
        assert_eq!(fx.cache.budget_mb().await, 8192);
        assert!(messages
            .lock()
            .unwrap()
            .iter()
            .any(|m| m.starts_with("Hardware upgraded")));
        assert_eq!(fx.monitor.change_history().len(), events.len());
    }

    #[tokio::test]
    async fn test_gpu_removed_evicts_everything() {
        let fx = fixture(
            StaticProbe::new()
                .with_ram_mb(16384, 8192)
                .with_cpu(8, 3000)
                .with_gpu("RTX 4070", 12288, 11000),
        )
        .await;
        assert_eq!(fx.monitor.current_tier(), Tier::HighEnd);

        fx.features
            .analyze("good news", Capability::Sentiment, &AnalysisContext::new())
            .await
            .unwrap();
        assert_eq!(fx.cache.resident_models().await.len(), 1);

        fx.probe.remove_gpu();
        let events = fx.monitor.force_check().await;

        assert!(events.iter().any(|e| e.kind == ChangeKind::GpuRemoved));
        assert!(fx.cache.resident_models().await.is_empty());
        assert!(fx.monitor.current_tier() < Tier::HighEnd);
        assert!(!fx.features.can_perform(Capability::Semantic));
    }

    #[tokio::test]
    async fn test_failing_callbacks_do_not_block() {
        let fx = fixture(StaticProbe::new().with_ram_mb(16384, 8192)).await;
        let calls = Arc::new(AtomicUsize::new(0));

        fx.monitor.add_change_listener(Arc::new(|_event: ChangeEvent| async {
            Err::<(), _>(CallbackError("listener down".to_string()))
        }));
        let counted = calls.clone();
        fx.monitor.add_change_listener(Arc::new(move |_event: ChangeEvent| {
            let counted = counted.clone();
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok::<(), CallbackError>(())
            }
        }));

        fx.probe.set_ram_mb(4096, 2048);
        let events = fx.monitor.force_check().await;
        assert!(!events.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), events.len());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_loop_detects_change() {
        let fx = fixture(StaticProbe::new().with_ram_mb(16384, 8192)).await;
        fx.monitor.start();
        assert!(fx.monitor.is_running());

        fx.probe.set_ram_mb(4096, 2048);
        tokio::time::sleep(fx.monitor.config().poll_interval + Duration::from_secs(1)).await;
        assert!(!fx.monitor.change_history().is_empty());

        fx.monitor.stop().await;
        assert!(!fx.monitor.is_running());
    }

    #[test]
    fn test_monitor_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<HardwareMonitor>();
    }
}
