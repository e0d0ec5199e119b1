//! Background loops (spec §4.10): the periodic work a long-running Router
//! process needs beyond what a single request triggers.
//!
//! No teacher file covers a background task runner — the teacher's
//! `CircuitBreaker` was driven entirely by call-site checks, no spawned
//! loop. This module is new, grounded on the `tokio::spawn` + `interval`
//! idiom used throughout the teacher's async call sites (e.g. its
//! `tokio::time::timeout` usage in `src/llm/router.rs`) and on spec §4.10's
//! three named loops.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::health::HealthTracker;

/// Handles for the loops a `Router` keeps running for its lifetime.
/// Dropping this struct aborts every loop it owns.
pub struct BackgroundLoops {
    cooldown_sweeper: JoinHandle<()>,
    health_refresh: Option<JoinHandle<()>>,
}

impl BackgroundLoops {
    /// Starts the cooldown sweeper (spec §4.10 "cooldown expiry sweep"),
    /// which wakes once per second and clears any deployment whose cooldown
    /// has elapsed. Optionally starts the health-refresh loop if
    /// `enable_health_monitoring` is set (spec §6.2); this crate has no
    /// active health-probe implementation to run, so when enabled the loop
    /// only logs a heartbeat — a host process that wants real active
    /// probing supplies its own loop against the same `HealthTracker`.
    pub fn spawn(
        health: Arc<HealthTracker>,
        enable_health_monitoring: bool,
        health_check_interval: Duration,
    ) -> Self {
        let cooldown_sweeper = tokio::spawn(sweep_cooldowns_forever(Arc::clone(&health)));
        let health_refresh = enable_health_monitoring
            .then(|| tokio::spawn(health_refresh_heartbeat(health_check_interval)));

        Self {
            cooldown_sweeper,
            health_refresh,
        }
    }
}

impl Drop for BackgroundLoops {
    fn drop(&mut self) {
        self.cooldown_sweeper.abort();
        if let Some(handle) = &self.health_refresh {
            handle.abort();
        }
    }
}

async fn sweep_cooldowns_forever(health: Arc<HealthTracker>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        ticker.tick().await;
        health.sweep_expired_cooldowns();
    }
}

/// Placeholder for active health probing (spec §4.10 "periodic health
/// refresh"). The Router core has no opinion on what a probe request looks
/// like per provider — that's adapter territory — so this loop only proves
/// the wiring is live. A counter-flush loop isn't needed here: this crate's
/// cache is write-through (spec §4.1), so there is nothing to flush.
async fn health_refresh_heartbeat(interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        debug!("health refresh tick (no active probes configured in this crate)");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorContext, RouterError};
    use crate::health::HealthConfig;

    #[tokio::test]
    async fn cooldown_sweeper_clears_an_expired_cooldown() {
        let health = Arc::new(HealthTracker::new(HealthConfig {
            allowed_fails: 1,
            cooldown_time: Duration::from_millis(5),
            ..HealthConfig::default()
        }));
        health.record_failure(
            "d1",
            &RouterError::ApiConnection {
                message: "boom".into(),
                context: ErrorContext::default(),
            },
        );
        assert!(!health.is_available("d1"));

        let _loops = BackgroundLoops::spawn(Arc::clone(&health), false, Duration::from_secs(300));
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert!(health.is_available("d1"));
    }
}
