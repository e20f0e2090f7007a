// Copyright 2025 the Understory Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Layered document configuration.
//!
//! Every concern (lanes, convergence, plan cache, diagnostics) starts from a
//! builtin default and is then patched, in order, by the runtime default,
//! the runtime's per-module override, the provider, and the provider's
//! per-module override. The most specific layer that set a value wins, and
//! the resolved config remembers which layer last touched each concern.

use std::time::Duration;

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use understory_converge::{
    ConvergeMode, ConvergeOptions, DEFAULT_PLAN_CACHE_CAPACITY, DegradePolicy, DiagnosticsLevel,
};

/// Error raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The JSON text is not a valid set of layers.
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}

/// The layer a resolved value came from.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfigScope {
    /// Compiled-in default.
    #[default]
    Builtin,
    /// Runtime-wide default.
    RuntimeDefault,
    /// Runtime override for one module id.
    RuntimeModule,
    /// Provider override (module-specific or not).
    Provider,
}

/// Forces the lane machinery off.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideMode {
    /// Lanes off; transactions run in arrival order.
    ForcedOff,
    /// Lanes off; every transaction commits as soon as it is admitted.
    ForcedSync,
}

/// How the queue orders transactions.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueMode {
    /// One queue, strict arrival order.
    Fifo,
    /// Urgent and non-urgent lanes.
    Lanes,
}

/// Patch of the lane policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LanesPatch {
    /// Enables lanes.
    pub enabled: Option<bool>,
    /// Forces lanes off.
    pub override_mode: Option<OverrideMode>,
    /// Quiet time before a non-urgent batch flushes.
    pub debounce_ms: Option<u64>,
    /// Longest a non-urgent transaction may wait.
    pub max_lag_ms: Option<u64>,
    /// Merges pending non-urgent transactions into one commit.
    pub allow_coalesce: Option<bool>,
}

/// Patch of the convergence policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConvergePatch {
    /// Scheduling mode.
    pub mode: Option<ConvergeMode>,
    /// Wall-clock budget; zero is ignored.
    pub budget_ms: Option<u64>,
    /// Degrade policy.
    pub degrade: Option<DegradePolicy>,
    /// Runs checks downstream of each change.
    pub validate_on_change: Option<bool>,
}

/// Patch of the plan cache policy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlanCachePatch {
    /// Number of cached plans; zero disables the cache.
    pub capacity: Option<usize>,
}

/// One configuration layer. Every field is optional.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigPatch {
    /// Lane policy.
    pub txn_lanes: Option<LanesPatch>,
    /// Convergence policy.
    pub converge: Option<ConvergePatch>,
    /// Plan cache policy.
    pub plan_cache: Option<PlanCachePatch>,
    /// Diagnostics level.
    pub diagnostics: Option<DiagnosticsLevel>,
}

/// All configuration layers of a runtime.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigLayers {
    /// Patch over the compiled-in defaults.
    pub builtin: ConfigPatch,
    /// Runtime-wide default.
    pub runtime_default: ConfigPatch,
    /// Runtime overrides by module id.
    pub runtime_modules: HashMap<String, ConfigPatch>,
    /// Provider override.
    pub provider: ConfigPatch,
    /// Provider overrides by module id.
    pub provider_modules: HashMap<String, ConfigPatch>,
}

/// Resolved lane policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LanePolicy {
    /// Effective flag (false whenever an override mode is set).
    pub enabled: bool,
    /// Override mode, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub override_mode: Option<OverrideMode>,
    /// Queue mode derived from `enabled`.
    pub queue_mode: QueueMode,
    /// Debounce window in milliseconds.
    pub debounce_ms: u64,
    /// Max lag in milliseconds.
    pub max_lag_ms: u64,
    /// Coalescing flag.
    pub allow_coalesce: bool,
    /// Layer that last changed this policy.
    pub scope: ConfigScope,
}

impl LanePolicy {
    /// Debounce window.
    #[must_use]
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Max lag.
    #[must_use]
    pub fn max_lag(&self) -> Duration {
        Duration::from_millis(self.max_lag_ms)
    }
}

/// Resolved convergence policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConvergePolicy {
    /// Scheduling mode.
    pub mode: ConvergeMode,
    /// Budget in milliseconds.
    pub budget_ms: u64,
    /// Degrade policy.
    pub degrade: DegradePolicy,
    /// Runs checks downstream of each change.
    pub validate_on_change: bool,
    /// Layer that last changed this policy.
    pub scope: ConfigScope,
}

impl ConvergePolicy {
    /// Converger options for this policy.
    #[must_use]
    pub fn options(&self, diagnostics: DiagnosticsLevel) -> ConvergeOptions {
        ConvergeOptions {
            mode: self.mode,
            budget: Some(Duration::from_millis(self.budget_ms)),
            degrade: self.degrade,
            trace_deps: diagnostics >= DiagnosticsLevel::Full,
            collect_timings: diagnostics >= DiagnosticsLevel::Full,
        }
    }
}

/// Resolved plan cache policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanCachePolicy {
    /// Capacity.
    pub capacity: usize,
    /// Layer that last changed this policy.
    pub scope: ConfigScope,
}

/// Resolved diagnostics policy.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsPolicy {
    /// Level.
    pub level: DiagnosticsLevel,
    /// Layer that last changed this policy.
    pub scope: ConfigScope,
}

/// Configuration of one document module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedConfig {
    /// Module id it was resolved for.
    pub module_id: String,
    /// Lanes.
    pub lanes: LanePolicy,
    /// Convergence.
    pub converge: ConvergePolicy,
    /// Plan cache.
    pub plan_cache: PlanCachePolicy,
    /// Diagnostics.
    pub diagnostics: DiagnosticsPolicy,
}

impl ResolvedConfig {
    /// The builtin defaults.
    #[must_use]
    pub fn builtin(module_id: impl Into<String>) -> Self {
        Self {
            module_id: module_id.into(),
            lanes: LanePolicy {
                enabled: true,
                override_mode: None,
                queue_mode: QueueMode::Lanes,
                debounce_ms: 0,
                max_lag_ms: 50,
                allow_coalesce: true,
                scope: ConfigScope::Builtin,
            },
            converge: ConvergePolicy {
                mode: ConvergeMode::Auto,
                budget_ms: 200,
                degrade: DegradePolicy::FullRecompute,
                validate_on_change: true,
                scope: ConfigScope::Builtin,
            },
            plan_cache: PlanCachePolicy {
                capacity: DEFAULT_PLAN_CACHE_CAPACITY,
                scope: ConfigScope::Builtin,
            },
            diagnostics: DiagnosticsPolicy {
                level: DiagnosticsLevel::Off,
                scope: ConfigScope::Builtin,
            },
        }
    }

    /// Applies one layer.
    pub fn apply(&mut self, patch: &ConfigPatch, scope: ConfigScope) {
        if let Some(lanes) = &patch.txn_lanes {
            self.apply_lanes(lanes, scope);
        }
        if let Some(converge) = &patch.converge {
            let policy = &mut self.converge;
            let mut changed = false;
            changed |= assign(&mut policy.mode, converge.mode);
            changed |= assign(&mut policy.budget_ms, converge.budget_ms.filter(|ms| *ms > 0));
            changed |= assign(&mut policy.degrade, converge.degrade);
            changed |= assign(&mut policy.validate_on_change, converge.validate_on_change);
            if changed {
                policy.scope = scope;
            }
        }
        if let Some(capacity) = patch.plan_cache.as_ref().and_then(|p| p.capacity) {
            self.plan_cache = PlanCachePolicy { capacity, scope };
        }
        if let Some(level) = patch.diagnostics {
            self.diagnostics = DiagnosticsPolicy { level, scope };
        }
    }

    fn apply_lanes(&mut self, patch: &LanesPatch, scope: ConfigScope) {
        let lanes = &mut self.lanes;
        let mut changed = false;
        changed |= assign(&mut lanes.enabled, patch.enabled);
        if let Some(mode) = patch.override_mode {
            lanes.override_mode = Some(mode);
            changed = true;
        }
        changed |= assign(&mut lanes.debounce_ms, patch.debounce_ms);
        changed |= assign(&mut lanes.max_lag_ms, patch.max_lag_ms);
        changed |= assign(&mut lanes.allow_coalesce, patch.allow_coalesce);
        if changed {
            lanes.scope = scope;
        }
    }

    fn normalize(&mut self) {
        if self.lanes.override_mode.is_some() {
            self.lanes.enabled = false;
        }
        self.lanes.queue_mode = if self.lanes.enabled {
            QueueMode::Lanes
        } else {
            QueueMode::Fifo
        };
    }
}

fn assign<T>(slot: &mut T, value: Option<T>) -> bool {
    match value {
        Some(value) => {
            *slot = value;
            true
        }
        None => false,
    }
}

impl ConfigLayers {
    /// Parses layers from JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed input.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Resolves the configuration of `module_id`.
    ///
    /// # Example
    ///
    /// ```
    /// use understory_transaction::{ConfigLayers, ConfigScope};
    ///
    /// let layers = ConfigLayers::from_json(r#"{
    ///     "runtimeDefault": { "txnLanes": { "debounceMs": 10 } },
    ///     "runtimeModules": { "cart": { "txnLanes": { "debounceMs": 20 } } }
    /// }"#).unwrap();
    /// let cart = layers.resolve("cart");
    /// assert_eq!(cart.lanes.debounce_ms, 20);
    /// assert_eq!(cart.lanes.scope, ConfigScope::RuntimeModule);
    /// assert_eq!(layers.resolve("other").lanes.debounce_ms, 10);
    /// ```
    #[must_use]
    pub fn resolve(&self, module_id: &str) -> ResolvedConfig {
        let mut config = ResolvedConfig::builtin(module_id);
        config.apply(&self.builtin, ConfigScope::Builtin);
        config.apply(&self.runtime_default, ConfigScope::RuntimeDefault);
        if let Some(patch) = self.runtime_modules.get(module_id) {
            config.apply(patch, ConfigScope::RuntimeModule);
        }
        config.apply(&self.provider, ConfigScope::Provider);
        if let Some(patch) = self.provider_modules.get(module_id) {
            config.apply(patch, ConfigScope::Provider);
        }
        config.normalize();
        tracing::trace!(
            module_id,
            lanes = ?config.lanes.queue_mode,
            lanes_scope = ?config.lanes.scope,
            converge_scope = ?config.converge.scope,
            "configuration resolved"
        );
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_defaults() {
        let config = ConfigLayers::default().resolve("m");
        assert!(config.lanes.enabled);
        assert_eq!(config.lanes.queue_mode, QueueMode::Lanes);
        assert_eq!(config.lanes.max_lag_ms, 50);
        assert_eq!(config.converge.budget_ms, 200);
        assert_eq!(config.converge.degrade, DegradePolicy::FullRecompute);
        assert_eq!(config.plan_cache.capacity, 128);
        assert_eq!(config.diagnostics.level, DiagnosticsLevel::Off);
        assert_eq!(config.lanes.scope, ConfigScope::Builtin);
    }

    #[test]
    fn most_specific_layer_wins() {
        let layers = ConfigLayers::from_json(
            r#"{
                "runtimeDefault": { "converge": { "budgetMs": 50 }, "planCache": { "capacity": 8 } },
                "runtimeModules": { "m": { "converge": { "budgetMs": 80 } } },
                "provider": { "txnLanes": { "maxLagMs": 10 } },
                "providerModules": { "m": { "converge": { "mode": "full" } } }
            }"#,
        )
        .unwrap();
        let config = layers.resolve("m");
        assert_eq!(config.converge.budget_ms, 80);
        assert_eq!(config.converge.mode, ConvergeMode::Full);
        assert_eq!(config.converge.scope, ConfigScope::Provider);
        assert_eq!(config.lanes.max_lag_ms, 10);
        assert_eq!(config.lanes.scope, ConfigScope::Provider);
        assert_eq!(config.plan_cache.capacity, 8);
        assert_eq!(config.plan_cache.scope, ConfigScope::RuntimeDefault);

        let other = layers.resolve("other");
        assert_eq!(other.converge.budget_ms, 50);
        assert_eq!(other.converge.scope, ConfigScope::RuntimeDefault);
    }

    #[test]
    fn normalization() {
        let layers = ConfigLayers::from_json(
            r#"{
                "runtimeDefault": { "converge": { "budgetMs": 0 } },
                "provider": { "txnLanes": { "overrideMode": "forced_off", "enabled": true } }
            }"#,
        )
        .unwrap();
        let config = layers.resolve("m");
        assert_eq!(config.converge.budget_ms, 200, "zero budget is ignored");
        assert_eq!(config.converge.scope, ConfigScope::Builtin);
        assert!(!config.lanes.enabled);
        assert_eq!(config.lanes.queue_mode, QueueMode::Fifo);
        assert_eq!(config.lanes.override_mode, Some(OverrideMode::ForcedOff));
    }

    #[test]
    fn module_overrides_built_in_code() {
        let mut layers = ConfigLayers::default();
        layers.runtime_modules.insert(
            "m".to_owned(),
            ConfigPatch {
                diagnostics: Some(DiagnosticsLevel::Full),
                ..ConfigPatch::default()
            },
        );
        assert_eq!(layers.resolve("m").diagnostics.level, DiagnosticsLevel::Full);
        assert_eq!(layers.resolve("m").diagnostics.scope, ConfigScope::RuntimeModule);

        let text = serde_json::to_string(&layers).unwrap();
        assert_eq!(ConfigLayers::from_json(&text).unwrap(), layers);
    }

    #[test]
    fn malformed_layers_are_rejected() {
        let err = ConfigLayers::from_json(r#"{ "txnLanes": 3, "provider": [] }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
