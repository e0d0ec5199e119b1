//! Routing strategies (spec §4.5) — turns a list of healthy candidates into
//! one chosen deployment.
//!
//! Grounded on the teacher's `RoutingStrategy` enum
//! (`src/llm/mod.rs`), generalized from a descriptive tag attached to a
//! response into an actual selection algorithm, since the teacher's router
//! never implemented more than round-robin-by-position.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::health::DeploymentStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategyKind {
    SimpleShuffle,
    WeightedPick,
    LeastBusy,
    LatencyBased,
    UsageBased,
}

/// Injectable randomness so strategy selection is deterministic under test
/// (spec §4.5 "must be testable without statistical flakiness").
pub trait RandomSource: Send + Sync {
    /// Returns a value in `[0, 1)`.
    fn next_f64(&self) -> f64;
}

pub struct ThreadRngSource;

impl RandomSource for ThreadRngSource {
    fn next_f64(&self) -> f64 {
        rand::random::<f64>()
    }
}

/// A candidate deployment, as the strategy layer sees it: just enough to
/// rank, nothing provider-specific.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub deployment_id: String,
    pub weight: u32,
    pub active_requests: u64,
    pub ewma_latency_ms: f64,
    pub tpm_used: u64,
    pub tpm_limit: Option<u64>,
    pub rpm_used: u64,
    pub rpm_limit: Option<u64>,
}

impl Candidate {
    /// `stats` supplies `active_requests`/`ewma_latency_ms` (from
    /// [`HealthTracker`](crate::health::HealthTracker)); `rpm`/`tpm` limits
    /// come from the deployment's configured `litellm_params`, and
    /// `rpm_used`/`tpm_used` from [`crate::usage::current_usage`]'s current
    /// minute-bucket readback (spec §3 "Usage keys ... for usage-based
    /// routing"). These two are deliberately separate stores — health
    /// tracks availability, usage counters track the Cache-backed rolling
    /// rpm/tpm, which a fresh process restart resets independently of
    /// in-memory health state.
    pub fn new(
        deployment_id: impl Into<String>,
        weight: u32,
        stats: &DeploymentStats,
        rpm_limit: Option<u32>,
        tpm_limit: Option<u32>,
        rpm_used: u64,
        tpm_used: u64,
    ) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            weight,
            active_requests: stats.active_requests,
            ewma_latency_ms: stats.ewma_latency_ms,
            tpm_used,
            tpm_limit: tpm_limit.map(u64::from),
            rpm_used,
            rpm_limit: rpm_limit.map(u64::from),
        }
    }
}

/// No healthy candidates were passed in; the caller (retry/fallback engine)
/// turns this into `RouterError::NoDeploymentsAvailable`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NoCandidates;

/// Picks one candidate deterministically, given a tie-break key so results
/// don't depend on `HashMap`/`Vec` ordering (spec §4.5 "ties broken by
/// deployment_id, lexicographically").
pub fn select(
    strategy: RoutingStrategyKind,
    candidates: &[Candidate],
    requested_tokens: u64,
    random_source: &dyn RandomSource,
) -> Result<String, NoCandidates> {
    if candidates.is_empty() {
        return Err(NoCandidates);
    }

    let chosen = match strategy {
        RoutingStrategyKind::SimpleShuffle => select_simple_shuffle(candidates, random_source),
        RoutingStrategyKind::WeightedPick => select_weighted(candidates, random_source),
        RoutingStrategyKind::LeastBusy => select_least_busy(candidates, random_source),
        RoutingStrategyKind::LatencyBased => select_latency_based(candidates, random_source),
        RoutingStrategyKind::UsageBased => select_usage_based(candidates, requested_tokens, random_source),
    };

    Ok(chosen)
}

/// Picks uniformly among a (usually tied) subset, lowest `deployment_id`
/// first when `random_source` rolls exactly the boundary (spec §4.5 "ties
/// broken by ... then random" / "lowest deployment_id" depending on
/// strategy) — `candidates` is expected pre-sorted by id when a
/// lexicographic tie-break is wanted, as-is when a random tie-break is
/// wanted.
fn pick_uniform(candidates: &[&Candidate], random_source: &dyn RandomSource) -> String {
    let idx = (random_source.next_f64() * candidates.len() as f64) as usize;
    let idx = idx.min(candidates.len().saturating_sub(1));
    candidates[idx].deployment_id.clone()
}

fn select_simple_shuffle(candidates: &[Candidate], random_source: &dyn RandomSource) -> String {
    let idx = (random_source.next_f64() * candidates.len() as f64) as usize;
    let idx = idx.min(candidates.len() - 1);
    candidates[idx].deployment_id.clone()
}

fn select_weighted(candidates: &[Candidate], random_source: &dyn RandomSource) -> String {
    let total_weight: u64 = candidates.iter().map(|c| c.weight.max(1) as u64).sum();
    if total_weight == 0 {
        return select_simple_shuffle(candidates, random_source);
    }
    let mut roll = (random_source.next_f64() * total_weight as f64) as u64;
    for c in candidates {
        let w = c.weight.max(1) as u64;
        if roll < w {
            return c.deployment_id.clone();
        }
        roll -= w;
    }
    candidates.last().expect("non-empty").deployment_id.clone()
}

/// Smallest `active_requests`; ties broken by lowest `ewma_latency_ms`,
/// then random (spec §4.5 "least-busy").
fn select_least_busy(candidates: &[Candidate], random_source: &dyn RandomSource) -> String {
    let min_active = candidates.iter().map(|c| c.active_requests).min().unwrap();
    let tied: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.active_requests == min_active)
        .collect();
    if tied.len() == 1 {
        return tied[0].deployment_id.clone();
    }

    let min_latency = tied
        .iter()
        .map(|c| c.ewma_latency_ms)
        .fold(f64::INFINITY, f64::min);
    let latency_tied: Vec<&Candidate> = tied
        .into_iter()
        .filter(|c| (c.ewma_latency_ms - min_latency).abs() < f64::EPSILON)
        .collect();
    pick_uniform(&latency_tied, random_source)
}

/// Lowest `ewma_latency_ms`; any candidate within 10% of the best is
/// considered tied and picked uniformly at random, to allow exploration
/// rather than always hammering the single fastest deployment (spec §4.5
/// "latency-based").
fn select_latency_based(candidates: &[Candidate], random_source: &dyn RandomSource) -> String {
    let min_latency = candidates
        .iter()
        .map(|c| c.ewma_latency_ms)
        .fold(f64::INFINITY, f64::min);
    let threshold = min_latency * 1.1;
    let within_window: Vec<&Candidate> = candidates
        .iter()
        .filter(|c| c.ewma_latency_ms <= threshold)
        .collect();
    pick_uniform(&within_window, random_source)
}

/// `headroom = min(rpm_remaining, tpm_remaining / estimated_tokens)` for
/// each candidate (spec §4.5 "usage-based"). A limit that isn't configured
/// contributes unlimited headroom; a zero `estimated_tokens` makes the tpm
/// term irrelevant (any remaining tpm budget, however small, covers a
/// zero-token request).
fn headroom(candidate: &Candidate, requested_tokens: u64) -> f64 {
    let rpm_remaining = match candidate.rpm_limit {
        Some(limit) => (limit as i64 - candidate.rpm_used as i64).max(0) as f64,
        None => f64::INFINITY,
    };
    let tpm_remaining = match candidate.tpm_limit {
        Some(limit) => {
            let remaining = (limit as i64 - candidate.tpm_used as i64).max(0) as f64;
            if requested_tokens == 0 {
                f64::INFINITY
            } else {
                remaining / requested_tokens as f64
            }
        }
        None => f64::INFINITY,
    };
    rpm_remaining.min(tpm_remaining)
}

fn headroom_eq(a: f64, b: f64) -> bool {
    if a.is_infinite() && b.is_infinite() {
        return a.is_sign_positive() == b.is_sign_positive();
    }
    (a - b).abs() < f64::EPSILON
}

/// Largest headroom wins; ties broken by random. If every candidate is
/// already at its limit (headroom `<= 0`), falls back to simple-shuffle
/// (spec §4.5 "usage-based").
fn select_usage_based(candidates: &[Candidate], requested_tokens: u64, random_source: &dyn RandomSource) -> String {
    let headrooms: Vec<f64> = candidates.iter().map(|c| headroom(c, requested_tokens)).collect();
    let max_headroom = headrooms.iter().copied().fold(f64::NEG_INFINITY, f64::max);

    if max_headroom <= 0.0 {
        return select_simple_shuffle(candidates, random_source);
    }

    let tied: Vec<&Candidate> = candidates
        .iter()
        .zip(headrooms.iter())
        .filter(|(_, h)| headroom_eq(**h, max_headroom))
        .map(|(c, _)| c)
        .collect();
    pick_uniform(&tied, random_source)
}

/// Convenience used by `retry.rs` to rank a whole group for fallback
/// ordering rather than pick a single winner.
pub fn rank_by_weight(candidates: &[Candidate]) -> HashMap<String, u32> {
    candidates
        .iter()
        .map(|c| (c.deployment_id.clone(), c.weight))
        .collect()
}
