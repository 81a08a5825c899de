//! FeatureManager: Capability Routing with Algorithmic Fallback
//!
//! Decides, per request, whether a capability runs on a model or on its
//! algorithmic implementation:
//!
//! ```text
//!                 analyze(text, capability)
//!                          │
//!                          ▼
//!              ┌────────────────────────┐   algorithmic-class
//!              │ keywords / stats?      │──────────────────────▶ fallback (0.7)
//!              └──────────┬─────────────┘
//!                         │ no
//!                         ▼
//!              ┌────────────────────────┐   no
//!              │ tier enables the AI    │──────────────────────▶ fallback (0.6)
//!              │ path and has a model?  │
//!              └──────────┬─────────────┘
//!                         │ yes
//!                         ▼
//!              ┌────────────────────────┐   any error
//!              │ ModelCache::acquire    │──────────────────────▶ fallback (0.6)
//!              │ InferenceRunner::run   │
//!              └──────────┬─────────────┘
//!                         │ ok
//!                         ▼
//!                    AI result (0.8)
//! ```
//!
//! The caller never sees a failure for a capability that has any working
//! implementation. Only [`FeatureError::FallbackFailed`] escapes `analyze`,
//! and that is a defect in the fallback itself.
//!
//! The active feature table is swapped atomically by
//! [`FeatureManager::upgrade_features`] when the hardware monitor migrates
//! tiers. Requests already in flight finish on the table they started with.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use serde::Serialize;
use serde_json::Value;

use super::backend::InferenceRunner;
use super::cache::ModelCache;
use super::config::TierCapabilities;
use super::fallback;
use super::types::{AnalysisContext, Capability, FeatureError, Tier};

const AI_CONFIDENCE: f64 = 0.8;
const FALLBACK_CONFIDENCE: f64 = 0.6;
const ALGORITHMIC_CONFIDENCE: f64 = 0.7;

// ============================================================================
// Results
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureMethod {
    Ai,
    Algorithmic,
}

/// Outcome of one analysis.
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisResult {
    pub capability: Capability,
    pub value: Value,
    pub confidence: f64,
    pub method_used: FeatureMethod,
    pub fallback_used: bool,
    /// Model that produced the value, for AI results.
    pub model_name: Option<String>,
    pub tier: Tier,
    /// Why the AI path was skipped or abandoned.
    pub fallback_reason: Option<String>,
}

/// How a capability would be served right now.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeatureAvailability {
    pub capability: Capability,
    pub available: bool,
    pub method: FeatureMethod,
    pub model_name: Option<String>,
    pub estimated_memory_mb: Option<u64>,
}

/// Why the AI path did not produce a value.
enum AiUnavailable {
    Disabled,
    NoModel,
    Failed(String),
}

impl AiUnavailable {
    fn reason(&self, capability: Capability, tier: Tier) -> String {
        match self {
            AiUnavailable::Disabled => format!("{} is not enabled at tier {}", capability, tier),
            AiUnavailable::NoModel => format!("tier {} has no model for {}", tier, capability),
            AiUnavailable::Failed(reason) => reason.clone(),
        }
    }
}

#[derive(Debug)]
struct ActiveFeatures {
    tier: Tier,
    capabilities: TierCapabilities,
}

// ============================================================================
// FeatureManager
// ============================================================================

/// Capability routing for the active tier.
///
/// ```rust,ignore
/// let features = FeatureManager::new(cache, runner, Tier::Basic, table.basic.clone());
/// let result = features.analyze_str("what a lovely morning", "sentiment", &ctx).await?;
/// assert!(result.confidence > 0.0);
/// ```
pub struct FeatureManager {
    active: RwLock<Arc<ActiveFeatures>>,
    cache: Arc<ModelCache>,
    runner: Arc<dyn InferenceRunner>,
}

impl std::fmt::Debug for FeatureManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureManager")
            .field("tier", &self.current_tier())
            .field("runner", &self.runner.name())
            .finish()
    }
}

impl FeatureManager {
    pub fn new(
        cache: Arc<ModelCache>,
        runner: Arc<dyn InferenceRunner>,
        tier: Tier,
        capabilities: TierCapabilities,
    ) -> Self {
        Self {
            active: RwLock::new(Arc::new(ActiveFeatures { tier, capabilities })),
            cache,
            runner,
        }
    }

    fn active(&self) -> Arc<ActiveFeatures> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn current_tier(&self) -> Tier {
        self.active().tier
    }

    pub fn enabled_features(&self) -> Vec<Capability> {
        self.active().capabilities.features.clone()
    }

    /// Whether `capability` can be performed at all: enabled by the active
    /// tier, or algorithmic-class.
    pub fn can_perform(&self, capability: Capability) -> bool {
        capability.is_algorithmic() || self.active().capabilities.supports(capability)
    }

    /// Whether the active tier would try a model for `capability`.
    pub fn has_ai_path(&self, capability: Capability) -> bool {
        let active = self.active();
        !capability.is_algorithmic()
            && active.capabilities.supports(capability)
            && active.capabilities.model_for(capability).is_some()
    }

    /// Swap the active table. Pure state change, no model is loaded or
    /// unloaded here.
    pub fn upgrade_features(&self, tier: Tier, capabilities: TierCapabilities) {
        let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
        let previous = active.tier;
        *active = Arc::new(ActiveFeatures { tier, capabilities });
        tracing::info!(
            "FeatureManager: features reconfigured {} → {} ({:?})",
            previous,
            tier,
            active.capabilities.features
        );
    }

    /// Per capability, how it would be served right now.
    pub fn available_features(&self) -> BTreeMap<Capability, FeatureAvailability> {
        let active = self.active();
        Capability::ALL
            .into_iter()
            .map(|capability| {
                let model = (!capability.is_algorithmic()
                    && active.capabilities.supports(capability))
                .then(|| active.capabilities.model_for(capability))
                .flatten();
                let availability = FeatureAvailability {
                    capability,
                    available: capability.is_algorithmic()
                        || active.capabilities.supports(capability),
                    method: if model.is_some() {
                        FeatureMethod::Ai
                    } else {
                        FeatureMethod::Algorithmic
                    },
                    model_name: model.map(|m| m.model_name.clone()),
                    estimated_memory_mb: model.map(|m| m.estimated_memory_mb),
                };
                (capability, availability)
            })
            .collect()
    }

    // ========================================================================
    // Analysis
    // ========================================================================

    /// Analyze with a capability name as received at the API boundary.
    pub async fn analyze_str(
        &self,
        text: &str,
        capability: &str,
        context: &AnalysisContext,
    ) -> Result<AnalysisResult, FeatureError> {
        let capability: Capability = capability.parse()?;
        self.analyze(text, capability, context).await
    }

    pub async fn analyze(
        &self,
        text: &str,
        capability: Capability,
        context: &AnalysisContext,
    ) -> Result<AnalysisResult, FeatureError> {
        let active = self.active();

        if capability.is_algorithmic() {
            let value = run_fallback(capability, text, context)?;
            return Ok(AnalysisResult {
                capability,
                value,
                confidence: ALGORITHMIC_CONFIDENCE,
                method_used: FeatureMethod::Algorithmic,
                fallback_used: false,
                model_name: None,
                tier: active.tier,
                fallback_reason: None,
            });
        }

        let unavailable = match self.try_ai(&active, text, capability, context).await {
            Ok((value, model_name)) => {
                return Ok(AnalysisResult {
                    capability,
                    value,
                    confidence: AI_CONFIDENCE,
                    method_used: FeatureMethod::Ai,
                    fallback_used: false,
                    model_name: Some(model_name),
                    tier: active.tier,
                    fallback_reason: None,
                });
            }
            Err(unavailable) => unavailable,
        };

        let reason = unavailable.reason(capability, active.tier);
        match unavailable {
            AiUnavailable::Failed(_) => {
                tracing::warn!("FeatureManager: AI path for {} failed, using fallback: {}", capability, reason)
            }
            AiUnavailable::Disabled | AiUnavailable::NoModel => {
                tracing::debug!("FeatureManager: {}, using fallback", reason)
            }
        }

        let value = run_fallback(capability, text, context)?;
        Ok(AnalysisResult {
            capability,
            value,
            confidence: FALLBACK_CONFIDENCE,
            method_used: FeatureMethod::Algorithmic,
            fallback_used: true,
            model_name: None,
            tier: active.tier,
            fallback_reason: Some(reason),
        })
    }

    async fn try_ai(
        &self,
        active: &ActiveFeatures,
        text: &str,
        capability: Capability,
        context: &AnalysisContext,
    ) -> Result<(Value, String), AiUnavailable> {
        if !active.capabilities.supports(capability) {
            return Err(AiUnavailable::Disabled);
        }
        let descriptor = active
            .capabilities
            .model_for(capability)
            .ok_or(AiUnavailable::NoModel)?;

        let lease = self
            .cache
            .acquire(capability, descriptor)
            .await
            .map_err(|e| AiUnavailable::Failed(e.to_string()))?;

        let value = self
            .runner
            .run(&lease, text, context)
            .await
            .map_err(|e| AiUnavailable::Failed(format!("inference on '{}' failed: {}", lease.key(), e)))?;

        Ok((value, descriptor.model_name.clone()))
    }
}

fn run_fallback(
    capability: Capability,
    text: &str,
    context: &AnalysisContext,
) -> Result<Value, FeatureError> {
    fallback::run(capability, text, context).map_err(|e| {
        tracing::error!("FeatureManager: fallback for {} failed: {}", capability, e);
        FeatureError::FallbackFailed {
            capability,
            reason: e.to_string(),
        }
    })
}

// ============================================================================
// Tests
// ============================================================================
