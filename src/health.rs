//! Deployment health tracking: failure counting, cooldown state machine,
//! and EWMA latency (spec §4.3).
//!
//! Grounded on the teacher's `ProviderHealthStatus` / `update_health_success`
//! / `update_health_failure` (`src/llm/router.rs`), generalized from a
//! binary healthy/unhealthy flag per *provider* to a cooldown-with-backoff
//! state machine per *deployment*, since the spec tracks health at
//! deployment granularity and requires exponential cooldown growth rather
//! than a flat "3 strikes" cutoff.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{CooldownClass, RouterError};

/// EWMA smoothing factor for latency tracking (spec §4.3 "recent latency
/// weighted more heavily than historical").
const LATENCY_EWMA_ALPHA: f64 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Healthy,
    Cooldown,
}

/// Rolling counters used by the routing strategies (spec §4.5) and by the
/// health tracker itself. Rpm/tpm usage is deliberately not tracked here —
/// it lives in the Cache-backed minute-bucket counters in
/// [`crate::usage`] (spec §3's `CounterKey`/`CounterValue`), which survive
/// differently than in-process health state (e.g. a shared Redis tier
/// keeps counting across a process restart).
#[derive(Debug, Clone, Default)]
pub struct DeploymentStats {
    pub active_requests: u64,
    pub ewma_latency_ms: f64,
}

#[derive(Debug, Clone)]
struct DeploymentHealth {
    state: HealthState,
    /// Failures inside the current `allowed_fails_window_s` window.
    recent_failures: Vec<Instant>,
    /// How many consecutive cooldowns this deployment has entered without an
    /// intervening success — drives exponential growth (spec §4.3).
    consecutive_cooldowns: u32,
    cooldown_until: Option<Instant>,
    stats: DeploymentStats,
}

impl Default for DeploymentHealth {
    fn default() -> Self {
        Self {
            state: HealthState::Healthy,
            recent_failures: Vec::new(),
            consecutive_cooldowns: 0,
            cooldown_until: None,
            stats: DeploymentStats::default(),
        }
    }
}

/// Tuning knobs mirrored from [`crate::config::RouterConfig`] so this module
/// doesn't depend on the whole config type.
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub allowed_fails: u32,
    pub allowed_fails_window: Duration,
    pub cooldown_time: Duration,
    pub cooldown_growth_factor: u32,
    pub cooldown_cap: Duration,
    /// Cooldown applied immediately on a non-retryable, deployment-identity
    /// failure (auth, not-found, permanent context-window-exceeded),
    /// bypassing the rolling failure window entirely (spec §4.3).
    pub long_cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            allowed_fails: 3,
            allowed_fails_window: Duration::from_secs(60),
            cooldown_time: Duration::from_secs(1),
            cooldown_growth_factor: 2,
            cooldown_cap: Duration::from_secs(60),
            long_cooldown: Duration::from_secs(60),
        }
    }
}

/// Thread-safe per-process health registry. One instance is shared across
/// the whole Router (spec §4.3).
pub struct HealthTracker {
    config: HealthConfig,
    deployments: DashMap<String, DeploymentHealth>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            deployments: DashMap::new(),
        }
    }

    /// `true` if the deployment may be selected right now.
    pub fn is_available(&self, deployment_id: &str) -> bool {
        match self.deployments.get(deployment_id) {
            None => true,
            Some(entry) => match entry.state {
                HealthState::Healthy => true,
                HealthState::Cooldown => match entry.cooldown_until {
                    Some(until) => Instant::now() >= until,
                    None => false,
                },
            },
        }
    }

    pub fn stats(&self, deployment_id: &str) -> DeploymentStats {
        self.deployments
            .get(deployment_id)
            .map(|e| e.stats.clone())
            .unwrap_or_default()
    }

    pub fn snapshot_stats(&self) -> HashMap<String, DeploymentStats> {
        self.deployments
            .iter()
            .map(|e| (e.key().clone(), e.value().stats.clone()))
            .collect()
    }

    pub fn begin_request(&self, deployment_id: &str) {
        let mut entry = self.deployments.entry(deployment_id.to_string()).or_default();
        entry.stats.active_requests += 1;
    }

    /// `success` gates the EWMA latency update (spec §4.3 only specifies it
    /// on the success transition): a fast-failing deployment (e.g.
    /// connection-refused) must not drag its own `ewma_latency_ms` down,
    /// which would bias `latency-based`/`least-busy` selection toward it.
    /// `active_requests` is decremented either way.
    pub fn end_request(&self, deployment_id: &str, latency_ms: u64, success: bool) {
        let mut entry = self.deployments.entry(deployment_id.to_string()).or_default();
        entry.stats.active_requests = entry.stats.active_requests.saturating_sub(1);
        if success {
            entry.stats.ewma_latency_ms = if entry.stats.ewma_latency_ms == 0.0 {
                latency_ms as f64
            } else {
                LATENCY_EWMA_ALPHA * latency_ms as f64
                    + (1.0 - LATENCY_EWMA_ALPHA) * entry.stats.ewma_latency_ms
            };
        }
    }

    /// A call succeeded: clears the failure window and resets cooldown
    /// growth to its base (spec §4.3 "a success resets backoff").
    pub fn record_success(&self, deployment_id: &str) {
        let mut entry = self.deployments.entry(deployment_id.to_string()).or_default();
        entry.recent_failures.clear();
        entry.consecutive_cooldowns = 0;
        entry.state = HealthState::Healthy;
        entry.cooldown_until = None;
    }

    /// A call failed. Returns `true` if this failure pushed the deployment
    /// into cooldown.
    pub fn record_failure(&self, deployment_id: &str, error: &RouterError) -> bool {
        match error.cooldown_class() {
            CooldownClass::None => false,
            CooldownClass::Immediate => {
                let mut entry = self.deployments.entry(deployment_id.to_string()).or_default();
                let now = Instant::now();
                entry.state = HealthState::Cooldown;
                entry.cooldown_until = Some(now + self.config.long_cooldown);
                entry.recent_failures.clear();
                warn!(
                    deployment_id,
                    cooldown_s = self.config.long_cooldown.as_secs(),
                    "deployment entering cooldown immediately (non-retryable failure class)"
                );
                true
            }
            CooldownClass::Transient => {
                let mut entry = self.deployments.entry(deployment_id.to_string()).or_default();
                let now = Instant::now();
                entry
                    .recent_failures
                    .retain(|t| now.duration_since(*t) <= self.config.allowed_fails_window);
                entry.recent_failures.push(now);

                if entry.recent_failures.len() as u32 >= self.config.allowed_fails {
                    let growth = self
                        .config
                        .cooldown_growth_factor
                        .saturating_pow(entry.consecutive_cooldowns);
                    let duration = self
                        .config
                        .cooldown_time
                        .saturating_mul(growth.max(1))
                        .min(self.config.cooldown_cap);

                    entry.state = HealthState::Cooldown;
                    entry.cooldown_until = Some(now + duration);
                    entry.consecutive_cooldowns += 1;
                    entry.recent_failures.clear();

                    warn!(
                        deployment_id,
                        cooldown_s = duration.as_secs(),
                        "deployment entering cooldown"
                    );
                    true
                } else {
                    debug!(
                        deployment_id,
                        failures = entry.recent_failures.len(),
                        "deployment failure recorded, below cooldown threshold"
                    );
                    false
                }
            }
        }
    }

    /// Called by the background sweeper (spec §4.10): transitions any
    /// deployment whose cooldown has elapsed back to healthy so a later
    /// `is_available` doesn't need to recompute `Instant::now()` itself.
    pub fn sweep_expired_cooldowns(&self) {
        let now = Instant::now();
        for mut entry in self.deployments.iter_mut() {
            if entry.state == HealthState::Cooldown {
                if let Some(until) = entry.cooldown_until {
                    if now >= until {
                        entry.state = HealthState::Healthy;
                        entry.cooldown_until = None;
                    }
                }
            }
        }
    }
}

pub type SharedHealthTracker = Arc<HealthTracker>;
