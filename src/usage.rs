//! Rolling per-minute rpm/tpm usage counters (spec §3 `CounterKey`/
//! `CounterValue`, §4.1, §4.4 item 5, §4.5 "usage-based").
//!
//! These live in the [`Cache`], not in [`crate::health::HealthTracker`]:
//! health tracks in-process availability, while rpm/tpm usage is meant to
//! be shared across processes behind the same deployment (spec §3 "across
//! processes, atomicity is delegated to the shared tier when present").
//! Grounded on the teacher's `RateLimiter` (`src/api/agents/middleware.rs`),
//! which keys per-identity rate state in a `DashMap` rather than a single
//! global counter; this module keeps that per-identity keying but swaps the
//! teacher's token bucket for fixed one-minute windows, since the Cache
//! tier (not an in-process `Mutex<TokenBucket>`) is what has to survive a
//! process restart here.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::cache::Cache;

/// Counters are kept alive a little past their one-minute window so a
/// request arriving right at a bucket boundary still sees the prior
/// bucket's count during its own read (best-effort; spec §4.1 tolerates
/// this kind of slack).
const COUNTER_TTL: Duration = Duration::from_secs(120);

fn minute_bucket(now: SystemTime) -> u64 {
    now.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
        / 60
}

fn rpm_key(provider: &str, model: &str, deployment_id: &str, bucket: u64) -> String {
    format!("{provider}:{model}:{deployment_id}:rpm:{bucket}")
}

fn tpm_key(provider: &str, model: &str, deployment_id: &str, bucket: u64) -> String {
    format!("{provider}:{model}:{deployment_id}:tpm:{bucket}")
}

/// Records one call's worth of usage against the current minute bucket.
/// Called once per attempt, regardless of whether the attempt ultimately
/// succeeds — the counters measure load placed on the deployment, not
/// successful completions (spec §3 "Usage keys (for usage-based
/// routing)").
pub async fn record_call(cache: &Cache, provider: &str, model: &str, deployment_id: &str, estimated_tokens: u64) {
    let bucket = minute_bucket(SystemTime::now());
    cache
        .incr(&rpm_key(provider, model, deployment_id, bucket), 1, Some(COUNTER_TTL))
        .await;
    if estimated_tokens > 0 {
        cache
            .incr(
                &tpm_key(provider, model, deployment_id, bucket),
                estimated_tokens as i64,
                Some(COUNTER_TTL),
            )
            .await;
    }
}

/// Reads back the current minute bucket's rpm/tpm usage. A cache miss reads
/// as zero — spec §4.1 "a missed counter read means a rate-limit headroom
/// check may be over-optimistic ... acceptable".
pub async fn current_usage(cache: &Cache, provider: &str, model: &str, deployment_id: &str) -> (u64, u64) {
    let bucket = minute_bucket(SystemTime::now());
    let rpm = cache
        .get(&rpm_key(provider, model, deployment_id, bucket))
        .await
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
        .max(0) as u64;
    let tpm = cache
        .get(&tpm_key(provider, model, deployment_id, bucket))
        .await
        .and_then(|v| v.as_i64())
        .unwrap_or(0)
        .max(0) as u64;
    (rpm, tpm)
}
