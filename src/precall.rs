//! Pre-call checks: the filter pipeline that narrows "all deployments in a
//! model group" down to "deployments eligible for this specific request"
//! before a routing strategy ever sees them (spec §4.4).
//!
//! Grounded on the teacher's `is_provider_available` / health-gating in
//! `src/llm/router.rs`, extended from a single health check into the
//! ordered filter chain the spec requires (cooldown, context window,
//! region, tags, rate-limit headroom, prompt-cache affinity) — and on
//! `examples/original_source/litellm/router_utils/pre_call_checks/prompt_caching_deployment_check.py`,
//! whose `call_type != completion.value or call_type != acompletion.value`
//! is always true (a string can't equal two different values at once) and
//! so silently wrote affinity for every call type. The corrected allow-list
//! lives on [`crate::types::EndpointKind::writes_prompt_cache_affinity`];
//! this module just calls it.

use std::collections::HashSet;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use crate::health::HealthTracker;
use crate::registry::{Deployment, DeploymentRegistry};
use crate::types::NormalizedRequest;

/// Why a candidate was dropped, kept around for `NoDeploymentsAvailable`'s
/// `reasons` map (spec §6.1).
#[derive(Debug, Clone)]
pub enum RejectReason {
    Cooldown,
    ContextWindowExceeded { limit: u32, estimated: u32 },
    RegionMismatch,
    MissingRequiredTags,
    RpmExceeded { limit: u32, used: u64 },
    TpmExceeded { limit: u32, used: u64 },
    AtCapacity { limit: u32, outstanding: u64 },
}

impl RejectReason {
    /// The stable identifier spec §7 shows surfacing verbatim in
    /// `NoDeploymentsAvailable`'s `reasons` map (e.g. `"in_cooldown"`,
    /// `"context_window_too_small"`), as distinct from [`Display`]'s
    /// human-readable message used in logs.
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::Cooldown => "in_cooldown",
            RejectReason::ContextWindowExceeded { .. } => "context_window_too_small",
            RejectReason::RegionMismatch => "region_not_allowed",
            RejectReason::MissingRequiredTags => "missing_required_tags",
            RejectReason::RpmExceeded { .. } => "rpm_exceeded",
            RejectReason::TpmExceeded { .. } => "tpm_exceeded",
            RejectReason::AtCapacity { .. } => "at_capacity",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Cooldown => write!(f, "in cooldown"),
            RejectReason::ContextWindowExceeded { limit, estimated } => write!(
                f,
                "estimated {estimated} prompt tokens exceeds max_input_tokens {limit}"
            ),
            RejectReason::RegionMismatch => write!(f, "region does not match requested region"),
            RejectReason::MissingRequiredTags => write!(f, "missing one or more required tags"),
            RejectReason::RpmExceeded { limit, used } => {
                write!(f, "rpm_exceeded: {used} used against limit {limit}")
            }
            RejectReason::TpmExceeded { limit, used } => {
                write!(f, "tpm_exceeded: {used} used against limit {limit}")
            }
            RejectReason::AtCapacity { limit, outstanding } => write!(
                f,
                "at_capacity: {outstanding} outstanding requests at max_parallel_requests {limit}"
            ),
        }
    }
}

pub struct FilterOutcome {
    pub eligible: Vec<Deployment>,
    pub rejected: Vec<(String, RejectReason)>,
}

/// Current-minute-bucket rpm/tpm usage per deployment, read back from
/// [`crate::usage`] by the caller before filtering (reading the Cache is
/// async; this module stays synchronous by taking a pre-fetched snapshot
/// instead of a `Cache` handle directly). A deployment missing from the map
/// is treated as zero usage (spec §4.1 "a missed counter read ... is
/// acceptable").
pub type UsageSnapshot = std::collections::HashMap<String, (u64, u64)>;

/// Runs the ordered filter chain. Each filter only narrows the candidate
/// set further — order doesn't change the final result, but running
/// cheapest/most-likely-to-reject filters first (cooldown, then context
/// window) keeps the common case fast (spec §4.4).
pub fn filter_candidates(
    candidates: Vec<Deployment>,
    request: &NormalizedRequest,
    registry: &DeploymentRegistry,
    health: &HealthTracker,
    usage: &UsageSnapshot,
) -> FilterOutcome {
    let mut eligible = Vec::with_capacity(candidates.len());
    let mut rejected = Vec::new();

    for deployment in candidates {
        if let Some(reason) = reject_reason(&deployment, request, registry, health, usage) {
            rejected.push((deployment.id.clone(), reason));
            continue;
        }
        eligible.push(deployment);
    }

    FilterOutcome { eligible, rejected }
}

fn reject_reason(
    deployment: &Deployment,
    request: &NormalizedRequest,
    registry: &DeploymentRegistry,
    health: &HealthTracker,
    usage: &UsageSnapshot,
) -> Option<RejectReason> {
    if !health.is_available(&deployment.id) {
        return Some(RejectReason::Cooldown);
    }

    if let Some(limit) = registry.resolve_max_input_tokens(deployment) {
        // A `None` token estimate must not drop a candidate (spec §4.4 item
        // 2) — only an estimate we actually have can fail this check.
        if let Some(estimated) = request.estimate_prompt_tokens() {
            if estimated > limit {
                return Some(RejectReason::ContextWindowExceeded { limit, estimated });
            }
        }
    }

    if let Some(requested_region) = &request.requested_region {
        if !deployment.params.allowed_regions.is_empty()
            && !deployment
                .params
                .allowed_regions
                .iter()
                .any(|r| r == requested_region)
        {
            return Some(RejectReason::RegionMismatch);
        }
    }

    if !request.required_tags.is_empty() {
        let deployment_tags: HashSet<&String> = deployment.model_info.tags.iter().collect();
        let has_all = request
            .required_tags
            .iter()
            .all(|tag| deployment_tags.contains(tag));
        if !has_all {
            return Some(RejectReason::MissingRequiredTags);
        }
    }

    if let Some(reason) = rate_limit_headroom_exhausted(deployment, usage) {
        return Some(reason);
    }

    if let Some(limit) = deployment.params.max_parallel_requests {
        let outstanding = health.stats(&deployment.id).active_requests;
        if outstanding >= limit as u64 {
            return Some(RejectReason::AtCapacity { limit, outstanding });
        }
    }

    None
}

fn rate_limit_headroom_exhausted(deployment: &Deployment, usage: &UsageSnapshot) -> Option<RejectReason> {
    let (rpm_used, tpm_used) = usage.get(&deployment.id).copied().unwrap_or((0, 0));
    if let Some(limit) = deployment.params.rpm {
        if rpm_used >= limit as u64 {
            return Some(RejectReason::RpmExceeded { limit, used: rpm_used });
        }
    }
    if let Some(limit) = deployment.params.tpm {
        if tpm_used >= limit as u64 {
            return Some(RejectReason::TpmExceeded { limit, used: tpm_used });
        }
    }
    None
}

/// Whether this request should have its chosen deployment recorded for
/// prompt-cache affinity (spec §4.4, the corrected allow-list; see module
/// doc comment for the source bug this fixes).
pub fn should_record_cache_affinity(request: &NormalizedRequest) -> bool {
    request.endpoint_kind.writes_prompt_cache_affinity()
}

/// Content hash of a request's verbatim messages, used as the prompt-cache
/// affinity key (spec §4.4 item 6: "the content hash of the verbatim
/// messages up to the last cache-control boundary"). This crate's
/// `ChatMessage` has no cache-control-boundary concept, so the full message
/// list stands in for it.
pub fn request_fingerprint(request: &NormalizedRequest) -> String {
    let mut hasher = DefaultHasher::new();
    for message in &request.messages {
        message.text_content().hash(&mut hasher);
    }
    format!("{:016x}", hasher.finish())
}

/// Applies a prompt-cache affinity hit: if the named deployment is present
/// in `candidates` and currently healthy, moves it to the front without
/// dropping anything else (spec §4.4 item 6). A no-op if the deployment
/// isn't in this candidate set (e.g. it was removed, or belongs to a
/// different model group) or is in cooldown.
pub fn apply_cache_affinity(candidates: &mut Vec<Deployment>, affine_deployment_id: &str, health: &HealthTracker) {
    if !health.is_available(affine_deployment_id) {
        return;
    }
    if let Some(pos) = candidates.iter().position(|d| d.id == affine_deployment_id) {
        let winner = candidates.remove(pos);
        candidates.insert(0, winner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeploymentConfigEntry, DeploymentModelInfo, DeploymentParams};
    use crate::health::HealthConfig;
    use crate::providers::ProviderKind;
    use crate::types::EndpointKind;

    fn registry_with_one_deployment(params: DeploymentParams, tags: HashSet<String>) -> (DeploymentRegistry, Deployment) {
        let registry = DeploymentRegistry::with_empty_model_info_lookup();
        let deployment = registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt-4".to_string(),
            litellm_params: params,
            model_info: DeploymentModelInfo {
                base_model: None,
                tags,
            },
        });
        (registry, deployment)
    }

    #[test]
    fn cooldown_deployment_is_rejected() {
        let params = DeploymentParams {
            provider: ProviderKind::OpenAI,
            upstream_model: "gpt-4".to_string(),
            ..DeploymentParams::default()
        };
        let (registry, deployment) = registry_with_one_deployment(params, HashSet::new());
        let health = HealthTracker::new(HealthConfig {
            allowed_fails: 1,
            ..HealthConfig::default()
        });
        let err = router_error_for_test();
        health.record_failure(&deployment.id, &err);

        let request = NormalizedRequest::new("gpt-4", vec![]);
        let outcome = filter_candidates(vec![deployment], &request, &registry, &health, &UsageSnapshot::new());
        assert!(outcome.eligible.is_empty());
        assert_eq!(outcome.rejected.len(), 1);
    }

    #[test]
    fn missing_required_tag_is_rejected() {
        let params = DeploymentParams {
            provider: ProviderKind::OpenAI,
            upstream_model: "gpt-4".to_string(),
            ..DeploymentParams::default()
        };
        let mut tags = HashSet::new();
        tags.insert("eu-only".to_string());
        let (registry, deployment) = registry_with_one_deployment(params, tags);
        let health = HealthTracker::new(HealthConfig::default());

        let mut request = NormalizedRequest::new("gpt-4", vec![]);
        request.required_tags = vec!["pii-safe".to_string()];
        let outcome = filter_candidates(vec![deployment], &request, &registry, &health, &UsageSnapshot::new());
        assert!(outcome.eligible.is_empty());
    }

    /// spec §5 back-pressure: a deployment at its `max_parallel_requests`
    /// limit is dropped with reason `at_capacity` rather than queued.
    #[test]
    fn deployment_at_max_parallel_requests_is_rejected() {
        let params = DeploymentParams {
            provider: ProviderKind::OpenAI,
            upstream_model: "gpt-4".to_string(),
            max_parallel_requests: Some(1),
            ..DeploymentParams::default()
        };
        let (registry, deployment) = registry_with_one_deployment(params, HashSet::new());
        let health = HealthTracker::new(HealthConfig::default());
        health.begin_request(&deployment.id);

        let request = NormalizedRequest::new("gpt-4", vec![]);
        let outcome = filter_candidates(vec![deployment], &request, &registry, &health, &UsageSnapshot::new());
        assert!(outcome.eligible.is_empty());
        assert!(matches!(outcome.rejected[0].1, RejectReason::AtCapacity { .. }));
    }

    /// spec §4.4 item 5: a deployment whose current-minute rpm usage has
    /// already reached its configured limit is dropped, via the
    /// Cache-backed usage snapshot rather than anything health tracks.
    #[test]
    fn deployment_over_rpm_limit_is_rejected() {
        let params = DeploymentParams {
            provider: ProviderKind::OpenAI,
            upstream_model: "gpt-4".to_string(),
            rpm: Some(5),
            ..DeploymentParams::default()
        };
        let (registry, deployment) = registry_with_one_deployment(params, HashSet::new());
        let health = HealthTracker::new(HealthConfig::default());

        let mut usage = UsageSnapshot::new();
        usage.insert(deployment.id.clone(), (5, 0));

        let request = NormalizedRequest::new("gpt-4", vec![]);
        let outcome = filter_candidates(vec![deployment], &request, &registry, &health, &usage);
        assert!(outcome.eligible.is_empty());
        assert!(matches!(outcome.rejected[0].1, RejectReason::RpmExceeded { .. }));
    }

    /// A missed usage-cache read must not drop a candidate (spec §4.1
    /// "a missed counter read means a rate-limit headroom check may be
    /// over-optimistic ... acceptable").
    #[test]
    fn missing_usage_entry_does_not_reject() {
        let params = DeploymentParams {
            provider: ProviderKind::OpenAI,
            upstream_model: "gpt-4".to_string(),
            rpm: Some(5),
            ..DeploymentParams::default()
        };
        let (registry, deployment) = registry_with_one_deployment(params, HashSet::new());
        let health = HealthTracker::new(HealthConfig::default());

        let request = NormalizedRequest::new("gpt-4", vec![]);
        let outcome = filter_candidates(vec![deployment], &request, &registry, &health, &UsageSnapshot::new());
        assert_eq!(outcome.eligible.len(), 1);
    }

    #[test]
    fn none_token_estimate_does_not_reject() {
        let params = DeploymentParams {
            provider: ProviderKind::OpenAI,
            upstream_model: "gpt-4".to_string(),
            max_input_tokens: Some(10),
            ..DeploymentParams::default()
        };
        let (registry, deployment) = registry_with_one_deployment(params, HashSet::new());
        let health = HealthTracker::new(HealthConfig::default());

        let request = NormalizedRequest::new("gpt-4", vec![]);
        let outcome = filter_candidates(vec![deployment], &request, &registry, &health, &UsageSnapshot::new());
        assert_eq!(outcome.eligible.len(), 1);
    }

    #[test]
    fn cache_affinity_allowed_for_completion_and_anthropic_messages_only() {
        let mut request = NormalizedRequest::new("gpt-4", vec![]);
        request.endpoint_kind = EndpointKind::Completion;
        assert!(should_record_cache_affinity(&request));

        request.endpoint_kind = EndpointKind::AnthropicMessages;
        assert!(should_record_cache_affinity(&request));

        request.endpoint_kind = EndpointKind::Embedding;
        assert!(!should_record_cache_affinity(&request));
    }

    #[test]
    fn fingerprint_is_stable_for_identical_messages() {
        let a = NormalizedRequest::new("gpt-4", vec![crate::types::ChatMessage::user("hi there")]);
        let b = NormalizedRequest::new("gpt-4", vec![crate::types::ChatMessage::user("hi there")]);
        assert_eq!(request_fingerprint(&a), request_fingerprint(&b));

        let c = NormalizedRequest::new("gpt-4", vec![crate::types::ChatMessage::user("something else")]);
        assert_ne!(request_fingerprint(&a), request_fingerprint(&c));
    }

    #[test]
    fn cache_affinity_moves_healthy_candidate_to_front_without_dropping_others() {
        let params = DeploymentParams {
            provider: ProviderKind::OpenAI,
            upstream_model: "gpt-4".to_string(),
            ..DeploymentParams::default()
        };
        let registry = DeploymentRegistry::with_empty_model_info_lookup();
        let first = registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt-4".to_string(),
            litellm_params: params.clone(),
            model_info: DeploymentModelInfo::default(),
        });
        let second = registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt-4".to_string(),
            litellm_params: params,
            model_info: DeploymentModelInfo::default(),
        });
        let health = HealthTracker::new(HealthConfig::default());

        let mut candidates = vec![first.clone(), second.clone()];
        apply_cache_affinity(&mut candidates, &second.id, &health);
        assert_eq!(candidates[0].id, second.id);
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn cache_affinity_is_a_no_op_for_a_cooling_down_deployment() {
        let params = DeploymentParams {
            provider: ProviderKind::OpenAI,
            upstream_model: "gpt-4".to_string(),
            ..DeploymentParams::default()
        };
        let registry = DeploymentRegistry::with_empty_model_info_lookup();
        let first = registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt-4".to_string(),
            litellm_params: params.clone(),
            model_info: DeploymentModelInfo::default(),
        });
        let second = registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt-4".to_string(),
            litellm_params: params,
            model_info: DeploymentModelInfo::default(),
        });
        let health = HealthTracker::new(HealthConfig {
            allowed_fails: 1,
            ..HealthConfig::default()
        });
        health.record_failure(&second.id, &router_error_for_test());

        let mut candidates = vec![first.clone(), second.clone()];
        apply_cache_affinity(&mut candidates, &second.id, &health);
        assert_eq!(candidates[0].id, first.id);
    }

    fn router_error_for_test() -> crate::error::RouterError {
        crate::error::RouterError::ApiConnection {
            message: "boom".into(),
            context: crate::error::ErrorContext::default(),
        }
    }
}
