//! ModelCache: Budgeted Model Residency with LRU Eviction
//!
//! The cache owns every loaded model object in the process. It guarantees:
//!
//! 1. **One load per key.** A single `tokio::sync::Mutex` covers the whole
//!    check → evict → load → register sequence, including the loader call. A
//!    second `acquire` for a key that is loading waits on the lock and then
//!    finds the handle resident.
//! 2. **Bounded residency.** Resident memory stays within the active budget.
//!    When a new model does not fit, least-recently-used handles are evicted
//!    first, then the recovery ladder in [`super::recovery`] escalates.
//! 3. **Leased handles stay put.** [`ModelCache::acquire`] returns a
//!    [`ModelLease`]; while any lease for a handle is alive the handle is
//!    never an eviction candidate.
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                  ModelCache                   │
//! │  ┌─────────────────────────────────────────┐  │
//! │  │ Mutex<CacheInner>                       │  │
//! │  │   budget: 3072MB   usage: 2170MB        │  │
//! │  │                                         │  │
//! │  │   "sentiment:roberta" → ModelHandle {   │  │
//! │  │      state: Active, leases: 1,          │  │ ← never evicted
//! │  │      last_accessed: 2s ago, 520MB       │  │
//! │  │   }                                     │  │
//! │  │   "topics:bart-large" → ModelHandle {   │  │
//! │  │      state: Loaded, leases: 0,          │  │ ← LRU candidate
//! │  │      last_accessed: 14min ago, 1650MB   │  │
//! │  │   }                                     │  │
//! │  └─────────────────────────────────────────┘  │
//! │  idle sweep (5min)   pressure sweep (1min)    │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Handle states
//!
//! `Unloaded → Loading → Loaded → Active → CleanupScheduled → Unloaded`.
//! `Loading` lasts exactly as long as the loader call. A hit marks the handle
//! `Active`; `Loaded` and `Active` are equivalent for eviction.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::{Duration, Instant};
use uuid::Uuid;

use super::backend::{LoadedModel, ModelLoader};
use super::config::CacheConfig;
use super::tasks::TaskSet;
use super::telemetry::ResourceMonitor;
use super::types::{CacheError, Capability, DeviceAffinity, ModelDescriptor};

// ============================================================================
// ModelHandle
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HandleState {
    Unloaded,
    Loading,
    Loaded,
    Active,
    CleanupScheduled,
}

/// A resident model. Owned exclusively by the cache.
pub(crate) struct ModelHandle {
    pub(crate) id: Uuid,
    pub(crate) key: String,
    pub(crate) descriptor: ModelDescriptor,
    pub(crate) memory_mb: u64,
    pub(crate) state: HandleState,
    pub(crate) last_accessed_at: Instant,
    pub(crate) load_completed_at: Instant,
    pub(crate) access_count: u64,
    leases: Arc<AtomicUsize>,
    object: LoadedModel,
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("memory_mb", &self.memory_mb)
            .field("state", &self.state)
            .field("access_count", &self.access_count)
            .field("leases", &self.lease_count())
            .finish()
    }
}

impl ModelHandle {
    pub(crate) fn lease_count(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    pub(crate) fn is_leased(&self) -> bool {
        self.lease_count() > 0
    }

    fn lease(&self) -> ModelLease {
        self.leases.fetch_add(1, Ordering::AcqRel);
        ModelLease {
            id: self.id,
            key: self.key.clone(),
            model_name: self.descriptor.model_name.clone(),
            memory_mb: self.memory_mb,
            access_count: self.access_count,
            object: self.object.clone(),
            leases: self.leases.clone(),
        }
    }

    fn info(&self) -> HandleInfo {
        HandleInfo {
            id: self.id,
            key: self.key.clone(),
            model_name: self.descriptor.model_name.clone(),
            memory_mb: self.memory_mb,
            state: self.state,
            access_count: self.access_count,
            idle_secs: self.last_accessed_at.elapsed().as_secs_f64(),
            resident_secs: self.load_completed_at.elapsed().as_secs_f64(),
            leases: self.lease_count(),
        }
    }
}

/// A borrowed, reference-counted view of a resident model.
///
/// Dropping the lease releases it. The underlying object stays valid for the
/// lifetime of the lease even if the cache is later forced to drop the handle.
pub struct ModelLease {
    id: Uuid,
    key: String,
    model_name: String,
    memory_mb: u64,
    access_count: u64,
    object: LoadedModel,
    leases: Arc<AtomicUsize>,
}

impl ModelLease {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    pub fn memory_mb(&self) -> u64 {
        self.memory_mb
    }

    /// Access count of the handle at the time this lease was taken.
    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn model(&self) -> &LoadedModel {
        &self.object
    }

    pub fn downcast_ref<T: std::any::Any>(&self) -> Option<&T> {
        self.object.downcast_ref::<T>()
    }
}

impl Clone for ModelLease {
    fn clone(&self) -> Self {
        self.leases.fetch_add(1, Ordering::AcqRel);
        Self {
            id: self.id,
            key: self.key.clone(),
            model_name: self.model_name.clone(),
            memory_mb: self.memory_mb,
            access_count: self.access_count,
            object: self.object.clone(),
            leases: self.leases.clone(),
        }
    }
}

impl Drop for ModelLease {
    fn drop(&mut self) {
        self.leases.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for ModelLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelLease")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("memory_mb", &self.memory_mb)
            .finish()
    }
}

// ============================================================================
// Reports
// ============================================================================

/// Read-only view of a resident handle.
#[derive(Debug, Clone, Serialize)]
pub struct HandleInfo {
    pub id: Uuid,
    pub key: String,
    pub model_name: String,
    pub memory_mb: u64,
    pub state: HandleState,
    pub access_count: u64,
    pub idle_secs: f64,
    pub resident_secs: f64,
    pub leases: usize,
}

/// One evicted handle.
#[derive(Debug, Clone, Serialize)]
pub struct EvictionResult {
    pub key: String,
    pub model_name: String,
    pub freed_mb: u64,
    pub idle_secs: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CleanupReport {
    pub evicted: Vec<EvictionResult>,
    pub freed_mb: u64,
    pub usage_mb: u64,
    pub resident: usize,
}

impl CleanupReport {
    fn from_evictions(evicted: Vec<EvictionResult>, inner: &CacheInner) -> Self {
        Self {
            freed_mb: evicted.iter().map(|e| e.freed_mb).sum(),
            evicted,
            usage_mb: inner.usage_mb,
            resident: inner.handles.len(),
        }
    }
}

/// Counters plus current occupancy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
    /// How many times each recovery level (1-4) ran.
    pub recovery_runs: [u64; 4],
    pub insufficient_memory_errors: u64,
    pub resident: usize,
    pub usage_mb: u64,
    pub budget_mb: u64,
    pub emergency_mode: bool,
}

// ============================================================================
// ModelCache
// ============================================================================

pub(crate) struct CacheInner {
    pub(crate) handles: HashMap<String, ModelHandle>,
    pub(crate) usage_mb: u64,
    pub(crate) budget_mb: u64,
    pub(crate) emergency_mode: bool,
    pub(crate) stats: CacheStats,
}

impl CacheInner {
    pub(crate) fn budget_room_mb(&self) -> u64 {
        self.budget_mb.saturating_sub(self.usage_mb)
    }

    /// Unleased handles, least recently used first (ties: fewest accesses).
    pub(crate) fn lru_candidates(&self) -> Vec<String> {
        let mut candidates: Vec<&ModelHandle> =
            self.handles.values().filter(|h| !h.is_leased()).collect();
        candidates.sort_by(|a, b| {
            a.last_accessed_at
                .cmp(&b.last_accessed_at)
                .then(a.access_count.cmp(&b.access_count))
        });
        candidates.into_iter().map(|h| h.key.clone()).collect()
    }

    /// Key of the most recently used handle, leased or not.
    pub(crate) fn most_recent_key(&self) -> Option<String> {
        self.handles
            .values()
            .max_by(|a, b| {
                a.last_accessed_at
                    .cmp(&b.last_accessed_at)
                    .then(a.access_count.cmp(&b.access_count))
            })
            .map(|h| h.key.clone())
    }
}

/// Budgeted, lock-serialized model cache.
///
/// ```rust,ignore
/// let cache = Arc::new(ModelCache::new(loader, resources, CacheConfig::default(), 3072));
/// cache.start();
///
/// let lease = cache.acquire(Capability::Sentiment, &descriptor).await?;
/// let model = lease.downcast_ref::<MyModel>().unwrap();
/// ```
pub struct ModelCache {
    pub(crate) inner: Mutex<CacheInner>,
    pub(crate) loader: Arc<dyn ModelLoader>,
    pub(crate) resources: Arc<ResourceMonitor>,
    pub(crate) config: CacheConfig,
    loading: StdMutex<Option<String>>,
    shutting_down: AtomicBool,
    tasks: TaskSet,
}

impl std::fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelCache")
            .field("loader", &self.loader.name())
            .field("resources", &self.resources)
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl ModelCache {
    pub fn new(
        loader: Arc<dyn ModelLoader>,
        resources: Arc<ResourceMonitor>,
        config: CacheConfig,
        budget_mb: u64,
    ) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                handles: HashMap::new(),
                usage_mb: 0,
                budget_mb,
                emergency_mode: false,
                stats: CacheStats::default(),
            }),
            loader,
            resources,
            config,
            loading: StdMutex::new(None),
            shutting_down: AtomicBool::new(false),
            tasks: TaskSet::new("ModelCache"),
        }
    }

    pub fn resources(&self) -> &Arc<ResourceMonitor> {
        &self.resources
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    // ========================================================================
    // Acquire
    // ========================================================================

    /// Get a resident model for `descriptor`, loading it if needed.
    ///
    /// On a miss this evicts LRU handles until the model fits the budget and
    /// the resource monitor admits it, then escalates through the recovery
    /// ladder. A loader failure leaves the key absent.
    pub async fn acquire(
        &self,
        model_type: Capability,
        descriptor: &ModelDescriptor,
    ) -> Result<ModelLease, CacheError> {
        if self.is_shutting_down() {
            return Err(CacheError::ShuttingDown);
        }
        let key = descriptor.cache_key(model_type);

        let mut inner = self.inner.lock().await;
        if self.is_shutting_down() {
            return Err(CacheError::ShuttingDown);
        }

        let stale = match inner.handles.get_mut(&key) {
            Some(handle) if self.loader.is_alive(&handle.object) => {
                handle.access_count += 1;
                handle.last_accessed_at = Instant::now();
                handle.state = HandleState::Active;
                let lease = handle.lease();
                inner.stats.hits += 1;
                tracing::debug!(
                    "ModelCache: hit '{}' (access #{})",
                    key,
                    lease.access_count()
                );
                return Ok(lease);
            }
            Some(_) => true,
            None => false,
        };
        if stale {
            tracing::warn!("ModelCache: resident model '{}' is no longer alive, reloading", key);
            self.evict_key(&mut inner, &key, "stale").await;
        }

        inner.stats.misses += 1;
        let required_mb = descriptor.estimated_memory_mb;
        let affinity = descriptor.device_affinity;

        if !self.has_headroom(&inner, affinity, required_mb).await {
            self.evict_lru_until_headroom(&mut inner, affinity, required_mb).await;
        }

        if !self.has_headroom(&inner, affinity, required_mb).await {
            let outcome = self.run_recovery_ladder(&mut inner, affinity, required_mb).await;
            if !outcome.satisfied {
                let memory = self.resources.memory_for(affinity).await;
                let room = inner.budget_room_mb();
                let available_mb = memory
                    .available_for_models_mb()
                    .map(|a| a.min(room))
                    .unwrap_or(room);
                inner.stats.insufficient_memory_errors += 1;
                tracing::warn!(
                    "ModelCache: cannot fit '{}' ({}MB) after recovery, {}MB available",
                    key,
                    required_mb,
                    available_mb
                );
                return Err(CacheError::InsufficientMemory {
                    model_key: key,
                    required_mb,
                    available_mb,
                    pressure: memory.effective_pressure(),
                });
            }
        }

        self.set_loading(Some(key.clone()));
        let started = Instant::now();
        let result = self.loader.load(descriptor).await;
        self.set_loading(None);

        let object = match result {
            Ok(object) => object,
            Err(source) => {
                inner.stats.load_failures += 1;
                tracing::warn!("ModelCache: loader '{}' failed for '{}': {}", self.loader.name(), key, source);
                return Err(CacheError::Load {
                    model_key: key,
                    source,
                });
            }
        };

        let now = Instant::now();
        let handle = ModelHandle {
            id: Uuid::new_v4(),
            key: key.clone(),
            descriptor: descriptor.clone(),
            memory_mb: required_mb,
            state: HandleState::Loaded,
            last_accessed_at: now,
            load_completed_at: now,
            access_count: 1,
            leases: Arc::new(AtomicUsize::new(0)),
            object,
        };
        let lease = handle.lease();

        inner.usage_mb += required_mb;
        inner.stats.loads += 1;
        inner.handles.insert(key.clone(), handle);

        tracing::info!(
            "ModelCache: loaded '{}' ({}MB in {:?}), usage {}/{}MB",
            key,
            required_mb,
            started.elapsed(),
            inner.usage_mb,
            inner.budget_mb
        );

        Ok(lease)
    }

    /// Budget room and device admission for a model bound to `affinity`.
    pub(crate) async fn has_headroom(
        &self,
        inner: &CacheInner,
        affinity: DeviceAffinity,
        required_mb: u64,
    ) -> bool {
        inner.budget_room_mb() >= required_mb
            && self.resources.can_admit_on(affinity, required_mb).await
    }

    async fn evict_lru_until_headroom(
        &self,
        inner: &mut CacheInner,
        affinity: DeviceAffinity,
        required_mb: u64,
    ) -> Vec<EvictionResult> {
        let mut evicted = Vec::new();
        while !self.has_headroom(inner, affinity, required_mb).await {
            let Some(key) = inner.lru_candidates().into_iter().next() else {
                tracing::debug!(
                    "ModelCache: no more eviction candidates ({}MB room, need {}MB)",
                    inner.budget_room_mb(),
                    required_mb
                );
                break;
            };
            if let Some(result) = self.evict_key(inner, &key, "LRU").await {
                evicted.push(result);
            }
        }
        evicted
    }

    /// Remove `key` and hand its object back to the loader.
    pub(crate) async fn evict_key(
        &self,
        inner: &mut CacheInner,
        key: &str,
        reason: &str,
    ) -> Option<EvictionResult> {
        let mut handle = inner.handles.remove(key)?;
        handle.state = HandleState::CleanupScheduled;

        inner.usage_mb = inner.usage_mb.saturating_sub(handle.memory_mb);
        inner.stats.evictions += 1;

        let idle = handle.last_accessed_at.elapsed();
        tracing::info!(
            "ModelCache: {} evicting '{}' (idle for {:?}, freeing {}MB, usage now {}MB)",
            reason,
            key,
            idle,
            handle.memory_mb,
            inner.usage_mb
        );
        if handle.is_leased() {
            tracing::warn!(
                "ModelCache: '{}' evicted with {} outstanding lease(s)",
                key,
                handle.lease_count()
            );
        }

        self.loader.unload(key, handle.object.clone()).await;

        Some(EvictionResult {
            key: handle.key,
            model_name: handle.descriptor.model_name,
            freed_mb: handle.memory_mb,
            idle_secs: idle.as_secs_f64(),
        })
    }

    /// Evict every unleased handle idle for longer than `idle`.
    pub(crate) async fn evict_idle(
        &self,
        inner: &mut CacheInner,
        idle: Duration,
        reason: &str,
    ) -> Vec<EvictionResult> {
        let stale: Vec<String> = inner
            .lru_candidates()
            .into_iter()
            .filter(|key| {
                inner
                    .handles
                    .get(key)
                    .map(|h| h.last_accessed_at.elapsed() > idle)
                    .unwrap_or(false)
            })
            .collect();

        let mut evicted = Vec::with_capacity(stale.len());
        for key in stale {
            if let Some(result) = self.evict_key(inner, &key, reason).await {
                evicted.push(result);
            }
        }
        evicted
    }

    // ========================================================================
    // Explicit operations
    // ========================================================================

    /// Force `key` out of the cache even if leased. Returns the freed MB.
    pub async fn unload(&self, key: &str) -> Option<u64> {
        let mut inner = self.inner.lock().await;
        self.evict_key(&mut inner, key, "explicit").await.map(|e| e.freed_mb)
    }

    /// Idle sweep: evict handles untouched for longer than `timeout`.
    pub async fn idle_sweep(&self, timeout: Duration) -> CleanupReport {
        let mut inner = self.inner.lock().await;
        let evicted = self.evict_idle(&mut inner, timeout, "idle sweep").await;
        if !evicted.is_empty() {
            tracing::info!(
                "ModelCache: idle sweep evicted {} model(s) idle > {:?}",
                evicted.len(),
                timeout
            );
        }
        CleanupReport::from_evictions(evicted, &inner)
    }

    /// Evict handles unused for longer than `idle`. Running it twice in a row
    /// evicts nothing the second time.
    pub async fn cleanup_unused(&self, idle: Duration) -> CleanupReport {
        let mut inner = self.inner.lock().await;
        let evicted = self.evict_idle(&mut inner, idle, "cleanup").await;
        CleanupReport::from_evictions(evicted, &inner)
    }

    /// Change the budget. Shrinking below current usage evicts LRU handles
    /// until usage fits.
    pub async fn set_budget(&self, budget_mb: u64) -> CleanupReport {
        let mut inner = self.inner.lock().await;
        let previous = inner.budget_mb;
        inner.budget_mb = budget_mb;

        let mut evicted = Vec::new();
        if inner.usage_mb > budget_mb {
            tracing::info!(
                "ModelCache: budget {}MB → {}MB, evicting {}MB deficit",
                previous,
                budget_mb,
                inner.usage_mb - budget_mb
            );
            while inner.usage_mb > inner.budget_mb {
                let Some(key) = inner.lru_candidates().into_iter().next() else {
                    tracing::warn!(
                        "ModelCache: {}MB over budget but every resident model is leased",
                        inner.usage_mb - inner.budget_mb
                    );
                    break;
                };
                if let Some(result) = self.evict_key(&mut inner, &key, "budget").await {
                    evicted.push(result);
                }
            }
        } else if previous != budget_mb {
            tracing::info!("ModelCache: budget {}MB → {}MB", previous, budget_mb);
        }

        CleanupReport::from_evictions(evicted, &inner)
    }

    /// Evict every unleased handle.
    pub async fn evict_all(&self) -> CleanupReport {
        let mut inner = self.inner.lock().await;
        let keys = inner.lru_candidates();
        let mut evicted = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(result) = self.evict_key(&mut inner, &key, "full").await {
                evicted.push(result);
            }
        }
        CleanupReport::from_evictions(evicted, &inner)
    }

    pub async fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().await;
        CacheStats {
            resident: inner.handles.len(),
            usage_mb: inner.usage_mb,
            budget_mb: inner.budget_mb,
            emergency_mode: inner.emergency_mode,
            ..inner.stats.clone()
        }
    }

    /// Resident handles, most recently used first.
    pub async fn resident_models(&self) -> Vec<HandleInfo> {
        let inner = self.inner.lock().await;
        let mut infos: Vec<HandleInfo> = inner.handles.values().map(ModelHandle::info).collect();
        infos.sort_by(|a, b| a.idle_secs.total_cmp(&b.idle_secs));
        infos
    }

    pub async fn usage_mb(&self) -> u64 {
        self.inner.lock().await.usage_mb
    }

    pub async fn budget_mb(&self) -> u64 {
        self.inner.lock().await.budget_mb
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.lock().await.handles.contains_key(key)
    }

    /// State of `key`. Answers `Loading` without waiting for the lock.
    pub async fn state_of(&self, key: &str) -> HandleState {
        if self.loading_key().as_deref() == Some(key) {
            return HandleState::Loading;
        }
        self.inner
            .lock()
            .await
            .handles
            .get(key)
            .map(|h| h.state)
            .unwrap_or(HandleState::Unloaded)
    }

    pub async fn in_emergency_mode(&self) -> bool {
        self.inner.lock().await.emergency_mode
    }

    fn set_loading(&self, key: Option<String>) {
        *self.loading.lock().unwrap_or_else(|e| e.into_inner()) = key;
    }

    fn loading_key(&self) -> Option<String> {
        self.loading.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawn the idle and pressure sweeps.
    pub fn start(self: &Arc<Self>) {
        if !self.tasks.begin() {
            tracing::debug!("ModelCache: sweeps already running");
            return;
        }

        self.tasks.spawn_periodic(
            "idle sweep",
            Arc::downgrade(self),
            self.config.idle_sweep_interval,
            |cache: Arc<ModelCache>| async move {
                let timeout = cache.config.idle_timeout;
                cache.idle_sweep(timeout).await;
            },
        );
        self.tasks.spawn_periodic(
            "pressure sweep",
            Arc::downgrade(self),
            self.config.pressure_sweep_interval,
            |cache: Arc<ModelCache>| async move {
                cache.pressure_sweep().await;
            },
        );

        tracing::info!(
            "ModelCache: sweeps started (idle every {:?}, pressure every {:?})",
            self.config.idle_sweep_interval,
            self.config.pressure_sweep_interval
        );
    }

    /// Cancel the sweeps, waiting at most the configured grace period.
    pub async fn stop(&self) {
        self.tasks.stop(self.config.shutdown_grace).await;
        tracing::info!("ModelCache: sweeps stopped");
    }

    pub fn is_running(&self) -> bool {
        self.tasks.is_running()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Stop the sweeps, refuse further acquires and unload every model,
    /// leased or not. Returns how many models were unloaded.
    pub async fn shutdown(&self) -> usize {
        self.shutting_down.store(true, Ordering::Release);
        self.stop().await;

        let mut inner = self.inner.lock().await;
        let keys: Vec<String> = inner.handles.keys().cloned().collect();
        let mut count = 0;
        for key in keys {
            if self.evict_key(&mut inner, &key, "shutdown").await.is_some() {
                count += 1;
            }
        }
        tracing::info!("ModelCache: shut down, {} model(s) unloaded", count);
        count
    }
}

// ============================================================================
// Tests
// ============================================================================
