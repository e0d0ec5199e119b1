//! Retry and fallback orchestration (spec §4.6) — the piece that ties
//! together the registry, pre-call checks, routing strategy, health
//! tracker, and a provider adapter into one `complete` call.
//!
//! Grounded on the teacher's `chat_completion` retry loop
//! (`src/llm/router.rs`): the `retry_count <= max_retries` loop with linear
//! `retry_delay_ms * retry_count` backoff is the starting shape. This
//! module generalizes it along three axes the teacher's loop didn't have:
//! a fallback *chain* across model groups (not just retries against the
//! same provider), a global retry budget shared across that whole chain,
//! and jittered exponential backoff that honors a provider's `Retry-After`
//! when one is given (spec §4.6 items 3–5).

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::Cache;
use crate::config::{Credentials, RouterConfig};
use crate::error::{ErrorContext, RouterError, RouterResult};
use crate::health::HealthTracker;
use crate::precall::{self, RejectReason};
use crate::providers::adapter::StreamState;
use crate::providers::{AdapterRegistry, ProviderAdapter};
use crate::registry::{Deployment, DeploymentRegistry};
use crate::strategies::{self, Candidate, RandomSource, RoutingStrategyKind};
use crate::streaming::{ReceiverStream, StreamEvent, StreamingAggregator};
use crate::types::{NormalizedRequest, NormalizedResponse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

/// Which errors are worth a retry at all. A `BadRequest` retried against a
/// different deployment would just fail again identically (spec §4.6 item 1
/// "retrying a caller error burns budget for nothing").
pub fn classify_error(error: &RouterError) -> ErrorClass {
    match error {
        RouterError::ApiConnection { .. }
        | RouterError::Timeout { .. }
        | RouterError::RateLimit { .. }
        | RouterError::Api { .. } => ErrorClass::Retryable,
        RouterError::Authentication { .. }
        | RouterError::PermissionDenied { .. }
        | RouterError::BadRequest { .. }
        | RouterError::ContextWindowExceeded { .. }
        | RouterError::NotFound { .. }
        | RouterError::NoDeploymentsAvailable { .. }
        | RouterError::Internal(_) => ErrorClass::NonRetryable,
    }
}

/// Exponential backoff with full jitter, capped, honoring a server-supplied
/// `Retry-After` when the error carried one (spec §4.6 item 4).
fn backoff_delay(
    attempt: u32,
    base: Duration,
    cap: Duration,
    retry_after_s: Option<u64>,
    random: &dyn RandomSource,
) -> Duration {
    if let Some(retry_after) = retry_after_s {
        return Duration::from_secs(retry_after).min(cap);
    }
    let exp = base.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = exp.min(cap);
    Duration::from_secs_f64(capped.as_secs_f64() * random.next_f64())
}

pub struct RetryFallbackEngine {
    config: RouterConfig,
    registry: Arc<DeploymentRegistry>,
    health: Arc<HealthTracker>,
    adapters: Arc<AdapterRegistry>,
    random: Arc<dyn RandomSource>,
    cache: Arc<Cache>,
}

/// One attempt's outcome, kept for `NoDeploymentsAvailable`'s `reasons` map
/// and for populating `RoutingMetadata::attempted_groups`.
struct Attempt {
    model_group: String,
    deployment_id: Option<String>,
    error: Option<String>,
}

/// Unique model groups touched so far, in first-seen order, with `current`
/// appended if not already present (spec §8 property: `attempted_groups`
/// lists each group in the fallback chain once, in traversal order).
fn attempted_group_order(attempts: &[Attempt], current: &str) -> Vec<String> {
    let mut seen = Vec::new();
    for attempt in attempts {
        if !seen.contains(&attempt.model_group) {
            seen.push(attempt.model_group.clone());
        }
    }
    if !seen.iter().any(|g| g == current) {
        seen.push(current.to_string());
    }
    seen
}

impl RetryFallbackEngine {
    pub fn new(
        config: RouterConfig,
        registry: Arc<DeploymentRegistry>,
        health: Arc<HealthTracker>,
        adapters: Arc<AdapterRegistry>,
        random: Arc<dyn RandomSource>,
        cache: Arc<Cache>,
    ) -> Self {
        Self {
            config,
            registry,
            health,
            adapters,
            random,
            cache,
        }
    }

    /// Resolves the chain of model groups to try: the requested group, then
    /// its configured fallbacks, each visited at most once (spec §4.6 item 2
    /// "a fallback cycle must not hang the request").
    fn fallback_chain(&self, model_group: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut frontier = vec![model_group.to_string()];

        while let Some(group) = frontier.pop() {
            if !visited.insert(group.clone()) {
                continue;
            }
            chain.push(group.clone());
            if let Some(fallbacks) = self.config.fallbacks.get(&group) {
                for fb in fallbacks.iter().rev() {
                    if !visited.contains(fb) {
                        frontier.push(fb.clone());
                    }
                }
            }
        }
        chain
    }

    fn deployment_retry_budget(&self, deployment: &Deployment, request: &NormalizedRequest) -> u32 {
        request
            .num_retries_override
            .or(deployment.params.num_retries)
            .unwrap_or(self.config.num_retries)
    }

    /// Reads back each candidate's current-minute rpm/tpm usage from the
    /// Cache (spec §3, §4.4 item 5, §4.5 "usage-based"). Computed once per
    /// group and reused for both the rate-limit headroom filter and the
    /// usage-based strategy's candidate ranking, so the two see a
    /// consistent snapshot.
    async fn usage_snapshot(&self, deployments: &[Deployment]) -> precall::UsageSnapshot {
        let mut snapshot = precall::UsageSnapshot::new();
        for d in deployments {
            let provider = d.params.provider.to_string();
            let usage = crate::usage::current_usage(&self.cache, &provider, &d.params.upstream_model, &d.id).await;
            snapshot.insert(d.id.clone(), usage);
        }
        snapshot
    }

    /// Reads back a prompt-cache affinity hit, if any, and moves its
    /// deployment to the front of `candidates` (spec §4.4 item 6). Reading
    /// is unconditional on call type — only the write side is restricted to
    /// the chat-like allow-list (spec §8 property 10).
    async fn apply_cache_affinity(&self, candidates: &mut Vec<Deployment>, request: &NormalizedRequest) {
        let key = format!("prompt_cache:{}", precall::request_fingerprint(request));
        if let Some(affine_id) = self.cache.get(&key).await.and_then(|v| v.as_str().map(str::to_string)) {
            precall::apply_cache_affinity(candidates, &affine_id, &self.health);
        }
    }

    pub async fn complete(&self, request: NormalizedRequest) -> RouterResult<NormalizedResponse> {
        let model_group = request.model.clone();
        let chain = self.fallback_chain(&model_group);
        let mut attempts: Vec<Attempt> = Vec::new();
        // Total provider calls made so far, across every group and
        // deployment — reported in `RoutingMetadata::retry_count` for
        // observability. This is deliberately NOT used to cut a
        // deployment's own retry budget short: each deployment's budget is
        // resolved independently by `deployment_retry_budget` (request
        // override > deployment `num_retries` > router default, spec
        // §4.6.1), and the fallback chain is already finite and cycle-free
        // (`fallback_chain`), so total work is bounded without an extra
        // artificial cross-group cap — one was tried here previously and
        // silently truncated a deployment's configured `num_retries` down
        // to the router default, breaking the documented per-deployment
        // override precedence.
        let mut global_retries_used = 0u32;
        // The *last* real provider-facing error observed across every group
        // in the fallback chain (spec §7: "the surfaced error is the last
        // error observed, not the first"). `NoDeploymentsAvailable` is only
        // surfaced when no group ever produced a real attempt — i.e. every
        // group was either unconfigured or fully filtered out by pre-call
        // checks before a single provider call was made.
        let mut last_hard_error: Option<RouterError> = None;

        for group in &chain {
            let candidates = self.registry.list_group(group);
            if candidates.is_empty() {
                attempts.push(Attempt {
                    model_group: group.clone(),
                    deployment_id: None,
                    error: Some("no deployments configured".to_string()),
                });
                continue;
            }

            let usage_snapshot = self.usage_snapshot(&candidates).await;
            let outcome = precall::filter_candidates(candidates, &request, &self.registry, &self.health, &usage_snapshot);
            for (deployment_id, reason) in &outcome.rejected {
                attempts.push(Attempt {
                    model_group: group.clone(),
                    deployment_id: Some(deployment_id.clone()),
                    // The canonical code (spec §7's "in_cooldown",
                    // "context_window_too_small", ...), not the human
                    // Display message — this is what ends up in
                    // `NoDeploymentsAvailable::reasons`, read by callers.
                    error: Some(reason.code().to_string()),
                });
            }

            let mut remaining = outcome.eligible;
            self.apply_cache_affinity(&mut remaining, &request).await;
            if remaining.is_empty() {
                continue;
            }

            // One shared attempt budget for the whole group, not one per
            // deployment (spec §8 property 3: "≤ max(num_retries) + 1 calls
            // per group", summed over groups — a group with several
            // deployments must not multiply the budget by how many of them
            // there are). Resolved once from each eligible candidate's own
            // effective budget and depleted across deployment switches
            // within this group; reset only when the engine advances to the
            // next fallback group.
            let group_budget = remaining
                .iter()
                .map(|d| self.deployment_retry_budget(d, &request))
                .max()
                .unwrap_or(0);
            // `request.num_retries_override`, if set, is left in place —
            // it wins over every deployment's own `num_retries` for the
            // whole request, not just the first deployment picked
            // (spec §4.6.1).

            let mut last_error: Option<RouterError> = None;
            let mut last_deployment_id: Option<String> = None;

            for attempt_idx in 0..=group_budget {
                if remaining.is_empty() {
                    break;
                }

                let stats_candidates: Vec<Candidate> = remaining
                    .iter()
                    .map(|d| {
                        let weight = d.params.weight.or(d.params.rpm).or(d.params.tpm).unwrap_or(1);
                        let (rpm_used, tpm_used) = usage_snapshot.get(&d.id).copied().unwrap_or((0, 0));
                        Candidate::new(&d.id, weight, &self.health.stats(&d.id), d.params.rpm, d.params.tpm, rpm_used, tpm_used)
                    })
                    .collect();

                let requested_tokens = request.estimate_prompt_tokens().unwrap_or(0) as u64;
                let chosen_id = match strategies::select(
                    self.config.routing_strategy,
                    &stats_candidates,
                    requested_tokens,
                    self.random.as_ref(),
                ) {
                    Ok(id) => id,
                    Err(_) => break,
                };

                let deployment = remaining
                    .iter()
                    .find(|d| d.id == chosen_id)
                    .cloned()
                    .expect("strategy only selects from the candidates it was given");
                last_deployment_id = Some(deployment.id.clone());

                if attempt_idx > 0 {
                    global_retries_used += 1;
                }

                match self.try_once(&deployment, &request).await {
                    Ok(mut response) => {
                        response.routing.model_group = model_group.clone();
                        response.routing.deployment_id = deployment.id.clone();
                        response.routing.provider = deployment.params.provider.to_string();
                        response.routing.attempted_groups = attempted_group_order(&attempts, group.as_str());
                        response.routing.retry_count = global_retries_used;
                        self.health.record_success(&deployment.id);
                        return Ok(response);
                    }
                    Err(error) => {
                        self.health.record_failure(&deployment.id, &error);
                        let class = classify_error(&error);
                        let retry_after = match &error {
                            RouterError::RateLimit { retry_after_s, .. } => *retry_after_s,
                            _ => None,
                        };

                        if class == ErrorClass::NonRetryable {
                            // A non-retryable error on one deployment does
                            // not license trying a sibling deployment in
                            // the *same* model group with different
                            // credentials (spec §7: "falling back only
                            // happens to a different model group") —
                            // abandon the rest of this group's candidates
                            // and move to the next fallback group.
                            last_error = Some(error);
                            break;
                        }

                        if attempt_idx < group_budget {
                            let cap = Duration::from_secs(self.config.retry_after_cap_s);
                            let delay = backoff_delay(
                                attempt_idx,
                                Duration::from_millis(200),
                                cap,
                                retry_after,
                                self.random.as_ref(),
                            );
                            debug!(deployment_id = %deployment.id, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                            tokio::time::sleep(delay).await;
                        }
                        last_error = Some(error);
                    }
                }
            }

            attempts.push(Attempt {
                model_group: group.clone(),
                deployment_id: last_deployment_id,
                error: last_error.as_ref().map(ToString::to_string),
            });
            if let Some(error) = last_error {
                last_hard_error = Some(error);
            }
        }

        warn!(model_group = %model_group, attempts = attempts.len(), attempted_groups = ?attempted_group_order(&attempts, &model_group), "no deployments available after fallback chain exhausted");
        if let Some(error) = last_hard_error {
            return Err(error.with_context(|ctx| {
                ctx.num_retries_attempted = global_retries_used;
                if ctx.model.is_none() {
                    ctx.model = Some(model_group.clone());
                }
            }));
        }
        let mut reasons = std::collections::HashMap::new();
        for attempt in attempts {
            let key = attempt
                .deployment_id
                .unwrap_or_else(|| format!("group:{}", attempt.model_group));
            reasons.insert(key, attempt.error.unwrap_or_else(|| "unknown".to_string()));
        }
        Err(RouterError::NoDeploymentsAvailable {
            model_group,
            reasons,
        })
    }

    /// Streaming counterpart of [`Self::complete`] (spec §4.6 "streaming
    /// returns a chunk iterator that itself may switch deployments only
    /// before the first byte; once a stream has emitted data to the
    /// client, retry is not possible"). Selection and connection-opening
    /// retry across the fallback chain happen here, synchronously, before
    /// any bytes reach the caller; once `execute_stream` succeeds, exactly
    /// one background task owns the rest of the stream's lifetime (spec §5
    /// "streaming uses a single task that reads from the upstream client
    /// and writes to the downstream sink").
    pub async fn complete_stream(
        &self,
        mut request: NormalizedRequest,
    ) -> RouterResult<Pin<Box<dyn Stream<Item = RouterResult<StreamEvent>> + Send>>> {
        request.stream = true;
        let model_group = request.model.clone();
        let chain = self.fallback_chain(&model_group);
        let mut reasons = std::collections::HashMap::new();

        'group: for group in &chain {
            let candidates = self.registry.list_group(group);
            let usage_snapshot = self.usage_snapshot(&candidates).await;
            let mut outcome = precall::filter_candidates(candidates, &request, &self.registry, &self.health, &usage_snapshot);
            for (deployment_id, reason) in &outcome.rejected {
                reasons.insert(deployment_id.clone(), reason.code().to_string());
            }
            if outcome.eligible.is_empty() {
                continue;
            }
            self.apply_cache_affinity(&mut outcome.eligible, &request).await;
            let mut remaining = outcome.eligible;

            // Pre-first-byte failures try every remaining candidate in this
            // group before falling back to the next model group (spec §4.6
            // "may switch deployments only before the first byte" — read
            // together with the unary algorithm's retry-within-group-first
            // behavior, this means exhaust the group's candidates, not just
            // the first one picked).
            while !remaining.is_empty() {
                let stats_candidates: Vec<Candidate> = remaining
                    .iter()
                    .map(|d| {
                        let weight = d.params.weight.or(d.params.rpm).or(d.params.tpm).unwrap_or(1);
                        let (rpm_used, tpm_used) = usage_snapshot.get(&d.id).copied().unwrap_or((0, 0));
                        Candidate::new(&d.id, weight, &self.health.stats(&d.id), d.params.rpm, d.params.tpm, rpm_used, tpm_used)
                    })
                    .collect();
                let requested_tokens = request.estimate_prompt_tokens().unwrap_or(0) as u64;
                let chosen_id = match strategies::select(
                    self.config.routing_strategy,
                    &stats_candidates,
                    requested_tokens,
                    self.random.as_ref(),
                ) {
                    Ok(id) => id,
                    Err(_) => continue 'group,
                };
                let deployment = remaining
                    .iter()
                    .find(|d| d.id == chosen_id)
                    .cloned()
                    .expect("strategy only selects from the candidates it was given");

                let adapter = match self.adapters.get(&deployment.params.provider) {
                    Some(a) => a,
                    None => {
                        reasons.insert(deployment.id.clone(), "no adapter registered".to_string());
                        remaining.retain(|d| d.id != deployment.id);
                        continue;
                    }
                };
                let base_url = match &deployment.params.credentials.api_base {
                    Some(url) => url.clone(),
                    None => {
                        reasons.insert(deployment.id.clone(), "missing api_base".to_string());
                        remaining.retain(|d| d.id != deployment.id);
                        continue;
                    }
                };

                let client = reqwest::Client::new();
                let wire = match adapter.transform_stream_request(
                    &base_url,
                    &deployment.params.upstream_model,
                    &request,
                    &deployment.params.credentials,
                ) {
                    Ok(w) => w,
                    Err(e) => {
                        reasons.insert(deployment.id.clone(), e.to_string());
                        remaining.retain(|d| d.id != deployment.id);
                        continue;
                    }
                };
                let stream_timeout = Duration::from_secs(
                    request
                        .timeout_s
                        .or(deployment.params.stream_timeout_s)
                        .unwrap_or(self.config.timeout_s),
                );

                self.health.begin_request(&deployment.id);
                crate::usage::record_call(
                    &self.cache,
                    &deployment.params.provider.to_string(),
                    &deployment.params.upstream_model,
                    &deployment.id,
                    request.estimate_prompt_tokens().unwrap_or(0) as u64,
                )
                .await;
                let started = Instant::now();
                let raw = match adapter.execute_stream(&client, wire, stream_timeout).await {
                    Ok(s) => s,
                    Err(e) => {
                        // No bytes have reached the client yet — still
                        // within the pre-first-byte window, so this
                        // candidate's failure can be absorbed by trying a
                        // sibling deployment in the same group before
                        // falling back (spec §4.6).
                        self.health.record_failure(&deployment.id, &e);
                        self.health.end_request(&deployment.id, started.elapsed().as_millis() as u64, false);
                        reasons.insert(deployment.id.clone(), e.to_string());
                        remaining.retain(|d| d.id != deployment.id);
                        continue;
                    }
                };

                return Ok(Box::pin(ReceiverStream::new(spawn_stream_pump(
                    raw,
                    adapter,
                    Arc::clone(&self.health),
                    deployment.id.clone(),
                    started,
                ))));
            }
        }

        Err(RouterError::NoDeploymentsAvailable {
            model_group,
            reasons,
        })
    }

    async fn try_once(&self, deployment: &Deployment, request: &NormalizedRequest) -> RouterResult<NormalizedResponse> {
        if request.mock_timeout {
            return Err(RouterError::Timeout {
                message: "mock_timeout forced by request".to_string(),
                context: ErrorContext::default(),
            });
        }
        if let Some(mock) = &request.mock_response {
            return Ok(mock_response(deployment, mock));
        }

        let adapter = self.adapters.get(&deployment.params.provider).ok_or_else(|| {
            RouterError::Internal(format!("no adapter registered for provider {}", deployment.params.provider))
        })?;

        let base_url = deployment
            .params
            .credentials
            .api_base
            .clone()
            .ok_or_else(|| RouterError::Internal(format!("deployment {} has no api_base", deployment.id)))?;

        self.health.begin_request(&deployment.id);
        crate::usage::record_call(
            &self.cache,
            &deployment.params.provider.to_string(),
            &deployment.params.upstream_model,
            &deployment.id,
            request.estimate_prompt_tokens().unwrap_or(0) as u64,
        )
        .await;
        let start = Instant::now();

        let result = self
            .call_adapter(adapter.as_ref(), &base_url, deployment, request)
            .await;

        self.health.end_request(&deployment.id, start.elapsed().as_millis() as u64, result.is_ok());
        result
    }

    async fn call_adapter(
        &self,
        adapter: &dyn ProviderAdapter,
        base_url: &str,
        deployment: &Deployment,
        request: &NormalizedRequest,
    ) -> RouterResult<NormalizedResponse> {
        let client = reqwest::Client::new();
        let wire = adapter.transform_request(
            base_url,
            &deployment.params.upstream_model,
            request,
            &deployment.params.credentials,
        )?;
        let timeout = Duration::from_secs(
            request
                .timeout_s
                .or(deployment.params.timeout_s)
                .unwrap_or(self.config.timeout_s),
        );
        let wire_response = adapter.execute(&client, wire, timeout).await?;
        adapter.transform_response(wire_response, &deployment.params.upstream_model)
    }
}

/// The single task that owns an open stream end-to-end (spec §5): reads raw
/// frames from the adapter, normalizes and aggregates them, and forwards
/// the result over an unbounded channel. Runs until the upstream stream
/// ends, errors, or the receiving end is dropped (client cancellation) —
/// in every case `outstanding_requests` is decremented exactly once on the
/// way out (spec §4.3 "paired with decrementing under every exit path").
fn spawn_stream_pump(
    mut raw: Pin<Box<dyn Stream<Item = RouterResult<String>> + Send>>,
    adapter: Arc<dyn ProviderAdapter>,
    health: Arc<HealthTracker>,
    deployment_id: String,
    started: Instant,
) -> mpsc::UnboundedReceiver<RouterResult<StreamEvent>> {
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let mut state = StreamState::default();
        let mut aggregator = StreamingAggregator::new();
        let mut failed = false;

        loop {
            let frame = match raw.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    health.record_failure(&deployment_id, &e);
                    failed = true;
                    let _ = tx.send(Err(e));
                    break;
                }
                None => break,
            };

            match adapter.transform_stream_chunk(&frame, &mut state) {
                Ok(Some(chunk)) => {
                    let corrected = aggregator.ingest(&chunk);
                    if tx.send(Ok(StreamEvent::Chunk(corrected))).is_err() {
                        // Client disconnected or cancelled (spec §5
                        // "cancellation ... does NOT perform retries").
                        // Not a failure of the deployment itself.
                        break;
                    }
                }
                Ok(None) => {
                    // Keepalive / sentinel frame (e.g. OpenAI's `[DONE]`) —
                    // nothing to emit or aggregate.
                }
                Err(e) => {
                    health.record_failure(&deployment_id, &e);
                    failed = true;
                    let _ = tx.send(Err(e));
                    break;
                }
            }
        }

        health.end_request(&deployment_id, started.elapsed().as_millis() as u64, !failed);
        if !failed {
            health.record_success(&deployment_id);
            let response = aggregator.finalize();
            let _ = tx.send(Ok(StreamEvent::End {
                usage: response.usage.clone(),
                finish_reason: response.choices.first().and_then(|c| c.finish_reason.clone()),
                response: Box::new(response),
            }));
        }
    });

    rx
}

fn mock_response(deployment: &Deployment, mock_text: &str) -> NormalizedResponse {
    use crate::types::{ChatMessage, ContentPart, MessageRole, ResponseChoice, RoutingMetadata, TokenUsage};

    NormalizedResponse {
        id: uuid::Uuid::new_v4().to_string(),
        created: 0,
        model: deployment.params.upstream_model.clone(),
        choices: vec![ResponseChoice {
            index: 0,
            message: ChatMessage {
                role: MessageRole::Assistant,
                content: vec![ContentPart::text(mock_text.to_string())],
                name: None,
                tool_calls: None,
                tool_call_id: None,
            },
            finish_reason: Some("stop".to_string()),
        }],
        usage: TokenUsage::default(),
        reasoning_content: None,
        provider_specific_fields: Default::default(),
        routing: RoutingMetadata {
            model_group: deployment.model_group.clone(),
            deployment_id: deployment.id.clone(),
            provider: deployment.params.provider.to_string(),
            attempted_groups: vec![deployment.model_group.clone()],
            retry_count: 0,
            latency_ms: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorContext;

    #[test]
    fn bad_request_is_not_retryable() {
        let err = RouterError::BadRequest {
            message: "x".into(),
            context: ErrorContext::default(),
        };
        assert_eq!(classify_error(&err), ErrorClass::NonRetryable);
    }

    #[test]
    fn connection_error_is_retryable() {
        let err = RouterError::ApiConnection {
            message: "x".into(),
            context: ErrorContext::default(),
        };
        assert_eq!(classify_error(&err), ErrorClass::Retryable);
    }

    struct FixedRandom(f64);
    impl RandomSource for FixedRandom {
        fn next_f64(&self) -> f64 {
            self.0
        }
    }

    #[test]
    fn retry_after_overrides_exponential_backoff() {
        let delay = backoff_delay(
            3,
            Duration::from_millis(200),
            Duration::from_secs(60),
            Some(5),
            &FixedRandom(0.0),
        );
        assert_eq!(delay, Duration::from_secs(5));
    }

    #[test]
    fn backoff_is_capped() {
        let delay = backoff_delay(
            20,
            Duration::from_millis(200),
            Duration::from_secs(10),
            None,
            &FixedRandom(1.0),
        );
        assert!(delay <= Duration::from_secs(10));
    }

    #[tokio::test]
    async fn fallback_chain_visits_each_group_once_even_with_a_cycle() {
        let registry = Arc::new(DeploymentRegistry::with_empty_model_info_lookup());
        let health = Arc::new(HealthTracker::new(crate::health::HealthConfig::default()));
        let adapters = Arc::new(AdapterRegistry::with_builtin_adapters());
        let mut config = RouterConfig::default();
        config
            .fallbacks
            .insert("a".to_string(), vec!["b".to_string()]);
        config
            .fallbacks
            .insert("b".to_string(), vec!["a".to_string()]);

        let engine = RetryFallbackEngine::new(
            config,
            registry,
            health,
            adapters,
            Arc::new(FixedRandom(0.0)),
            Arc::new(Cache::new()),
        );
        let chain = engine.fallback_chain("a");
        assert_eq!(chain, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn mock_response_short_circuits_the_network() {
        use crate::config::{DeploymentConfigEntry, DeploymentModelInfo, DeploymentParams};
        use crate::providers::ProviderKind;

        let registry = Arc::new(DeploymentRegistry::with_empty_model_info_lookup());
        let deployment = registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt-4".to_string(),
            litellm_params: DeploymentParams {
                provider: ProviderKind::OpenAI,
                upstream_model: "gpt-4".to_string(),
                ..DeploymentParams::default()
            },
            model_info: DeploymentModelInfo::default(),
        });
        let health = Arc::new(HealthTracker::new(crate::health::HealthConfig::default()));
        let adapters = Arc::new(AdapterRegistry::with_builtin_adapters());
        let engine = RetryFallbackEngine::new(
            RouterConfig::default(),
            registry,
            health,
            adapters,
            Arc::new(FixedRandom(0.0)),
            Arc::new(Cache::new()),
        );

        let mut request = NormalizedRequest::new("gpt-4", vec![]);
        request.mock_response = Some("hello from mock".to_string());
        let response = engine.complete(request).await.unwrap();
        assert_eq!(response.routing.deployment_id, deployment.id);
    }

    /// Spec §9 S3: a prompt too large for one deployment's context window
    /// must route to the one that fits, and (spec §7) the dropped
    /// candidate's surfaced reason must be the stable `context_window_too_small`
    /// code, not a human sentence.
    #[tokio::test]
    async fn context_window_filter_routes_around_the_too_small_deployment() {
        use crate::config::{DeploymentConfigEntry, DeploymentModelInfo, DeploymentParams};
        use crate::providers::ProviderKind;
        use crate::types::ChatMessage;

        let registry = Arc::new(DeploymentRegistry::with_empty_model_info_lookup());
        registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt".to_string(),
            litellm_params: DeploymentParams {
                provider: ProviderKind::OpenAI,
                upstream_model: "gpt-small-ctx".to_string(),
                max_input_tokens: Some(100),
                ..DeploymentParams::default()
            },
            model_info: DeploymentModelInfo::default(),
        });
        let big = registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt".to_string(),
            litellm_params: DeploymentParams {
                provider: ProviderKind::OpenAI,
                upstream_model: "gpt-big-ctx".to_string(),
                max_input_tokens: Some(100_000),
                ..DeploymentParams::default()
            },
            model_info: DeploymentModelInfo::default(),
        });

        let health = Arc::new(HealthTracker::new(crate::health::HealthConfig::default()));
        let adapters = Arc::new(AdapterRegistry::with_builtin_adapters());
        let engine = RetryFallbackEngine::new(
            RouterConfig::default(),
            registry,
            health,
            adapters,
            Arc::new(FixedRandom(0.0)),
            Arc::new(Cache::new()),
        );

        let long_prompt = "word ".repeat(4_000); // ~5000 estimated tokens
        let mut request = NormalizedRequest::new("gpt", vec![ChatMessage::user(long_prompt)]);
        request.mock_response = Some("ok".to_string());

        let response = engine.complete(request).await.unwrap();
        assert_eq!(response.routing.deployment_id, big.id);
    }

    /// Spec §8 S4: a non-retryable failure on the primary model group must
    /// fall back to the next model group in the chain with a fresh attempt
    /// budget, not abort the whole request — regression for a bug where the
    /// engine returned the non-retryable error directly instead of
    /// advancing `group_idx`.
    #[tokio::test]
    async fn non_retryable_failure_falls_back_to_the_next_model_group() {
        use crate::config::{Credentials, DeploymentConfigEntry, DeploymentModelInfo, DeploymentParams};
        use crate::providers::ProviderKind;
        use crate::types::ChatMessage;

        let registry = Arc::new(DeploymentRegistry::with_empty_model_info_lookup());
        // No `api_base` configured: `try_once` fails with a non-retryable
        // `RouterError::Internal` before ever touching the network.
        registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt-4".to_string(),
            litellm_params: DeploymentParams {
                provider: ProviderKind::OpenAI,
                upstream_model: "gpt-4".to_string(),
                ..DeploymentParams::default()
            },
            model_info: DeploymentModelInfo::default(),
        });
        let fallback_deployment = registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt-3.5".to_string(),
            litellm_params: DeploymentParams {
                provider: ProviderKind::OpenAI,
                upstream_model: "gpt-3.5-turbo".to_string(),
                credentials: Credentials {
                    api_base: Some("https://example.invalid".to_string()),
                    ..Credentials::default()
                },
                ..DeploymentParams::default()
            },
            model_info: DeploymentModelInfo::default(),
        });

        let health = Arc::new(HealthTracker::new(crate::health::HealthConfig::default()));
        let adapters = Arc::new(AdapterRegistry::with_builtin_adapters());
        let mut config = RouterConfig::default();
        config
            .fallbacks
            .insert("gpt-4".to_string(), vec!["gpt-3.5".to_string()]);

        let engine = RetryFallbackEngine::new(
            config,
            registry,
            health,
            adapters,
            Arc::new(FixedRandom(0.0)),
            Arc::new(Cache::new()),
        );

        let mut request = NormalizedRequest::new("gpt-4", vec![ChatMessage::user("hi")]);
        request.mock_response = Some("from fallback".to_string());

        let response = engine.complete(request).await.unwrap();
        assert_eq!(response.routing.deployment_id, fallback_deployment.id);
        assert_eq!(response.routing.model_group, "gpt-3.5");
        assert_eq!(
            response.routing.attempted_groups,
            vec!["gpt-4".to_string(), "gpt-3.5".to_string()]
        );
    }

    /// Spec §8 S6: a deployment-level `num_retries` higher than the router
    /// default must be fully honored — regression for a bug where an
    /// unrelated cross-group retry counter silently capped every
    /// deployment's retries at the router default regardless of its own
    /// configured budget.
    #[tokio::test]
    async fn per_deployment_num_retries_overrides_the_router_default() {
        use crate::config::{Credentials, DeploymentConfigEntry, DeploymentModelInfo, DeploymentParams};
        use crate::providers::ProviderKind;
        use crate::types::ChatMessage;

        let registry = Arc::new(DeploymentRegistry::with_empty_model_info_lookup());
        registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt".to_string(),
            litellm_params: DeploymentParams {
                provider: ProviderKind::OpenAI,
                upstream_model: "gpt-4".to_string(),
                credentials: Credentials {
                    api_base: Some("https://example.invalid".to_string()),
                    ..Credentials::default()
                },
                num_retries: Some(6),
                ..DeploymentParams::default()
            },
            model_info: DeploymentModelInfo::default(),
        });

        let health = Arc::new(HealthTracker::new(crate::health::HealthConfig::default()));
        let adapters = Arc::new(AdapterRegistry::with_builtin_adapters());
        let mut config = RouterConfig::default();
        config.num_retries = 1;

        let engine = RetryFallbackEngine::new(
            config,
            registry,
            health,
            adapters,
            Arc::new(FixedRandom(0.0)),
            Arc::new(Cache::new()),
        );

        let mut request = NormalizedRequest::new("gpt", vec![ChatMessage::user("hi")]);
        request.mock_timeout = true; // forces a retryable Timeout on every attempt

        let err = engine.complete(request).await.unwrap_err();
        match err {
            RouterError::Timeout { context, .. } => assert_eq!(context.num_retries_attempted, 6),
            other => panic!("expected Timeout after exhausting the deployment's own retry budget, got {other:?}"),
        }
    }

    /// Spec §8 property 3: the retry budget is shared by the whole group,
    /// not multiplied by the number of deployments in it — regression for a
    /// bug where a group with 2 deployments each budgeted for 2 retries
    /// could draw up to 6 calls (3 per deployment) instead of ≤3.
    #[tokio::test]
    async fn retry_budget_is_shared_across_deployments_in_the_same_group_not_multiplied() {
        use crate::config::{Credentials, DeploymentConfigEntry, DeploymentModelInfo, DeploymentParams};
        use crate::providers::ProviderKind;
        use crate::types::ChatMessage;

        let registry = Arc::new(DeploymentRegistry::with_empty_model_info_lookup());
        for _ in 0..2 {
            registry.add_deployment(DeploymentConfigEntry {
                model_name: "multi".to_string(),
                litellm_params: DeploymentParams {
                    provider: ProviderKind::OpenAI,
                    upstream_model: "gpt-4".to_string(),
                    credentials: Credentials {
                        api_base: Some("https://example.invalid".to_string()),
                        ..Credentials::default()
                    },
                    num_retries: Some(2),
                    ..DeploymentParams::default()
                },
                model_info: DeploymentModelInfo::default(),
            });
        }

        let health = Arc::new(HealthTracker::new(crate::health::HealthConfig::default()));
        let adapters = Arc::new(AdapterRegistry::with_builtin_adapters());
        let engine = RetryFallbackEngine::new(
            RouterConfig::default(),
            registry,
            health,
            adapters,
            Arc::new(FixedRandom(0.0)),
            Arc::new(Cache::new()),
        );

        let mut request = NormalizedRequest::new("multi", vec![ChatMessage::user("hi")]);
        request.mock_timeout = true; // forces a retryable Timeout on every attempt

        let err = engine.complete(request).await.unwrap_err();
        match err {
            // 2 retries shared across the group → ≤3 calls total, never the
            // 4+ (let alone 6) a per-deployment-multiplied budget would draw.
            RouterError::Timeout { context, .. } => assert_eq!(context.num_retries_attempted, 2),
            other => panic!("expected Timeout after exhausting the shared group retry budget, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn no_deployments_available_surfaces_canonical_reason_codes() {
        use crate::config::{DeploymentConfigEntry, DeploymentModelInfo, DeploymentParams};
        use crate::providers::ProviderKind;
        use crate::types::ChatMessage;

        let registry = Arc::new(DeploymentRegistry::with_empty_model_info_lookup());
        let small = registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt".to_string(),
            litellm_params: DeploymentParams {
                provider: ProviderKind::OpenAI,
                upstream_model: "gpt-small-ctx".to_string(),
                max_input_tokens: Some(100),
                ..DeploymentParams::default()
            },
            model_info: DeploymentModelInfo::default(),
        });

        let health = Arc::new(HealthTracker::new(crate::health::HealthConfig::default()));
        let adapters = Arc::new(AdapterRegistry::with_builtin_adapters());
        let engine = RetryFallbackEngine::new(
            RouterConfig::default(),
            registry,
            health,
            adapters,
            Arc::new(FixedRandom(0.0)),
            Arc::new(Cache::new()),
        );

        let long_prompt = "word ".repeat(4_000);
        let request = NormalizedRequest::new("gpt", vec![ChatMessage::user(long_prompt)]);

        let err = engine.complete(request).await.unwrap_err();
        match err {
            RouterError::NoDeploymentsAvailable { reasons, .. } => {
                assert_eq!(reasons.get(&small.id).map(String::as_str), Some("context_window_too_small"));
            }
            other => panic!("expected NoDeploymentsAvailable, got {other:?}"),
        }
    }

    /// Spec §4.5 "usage-based": the candidate with more rpm headroom wins,
    /// reading usage back from the Cache-backed counters (spec §3), not
    /// anything health-tracked.
    #[tokio::test]
    async fn usage_based_strategy_prefers_the_deployment_with_more_cache_backed_headroom() {
        use crate::config::{DeploymentConfigEntry, DeploymentModelInfo, DeploymentParams};
        use crate::providers::ProviderKind;
        use crate::types::ChatMessage;

        let registry = Arc::new(DeploymentRegistry::with_empty_model_info_lookup());
        let params = DeploymentParams {
            provider: ProviderKind::OpenAI,
            upstream_model: "gpt-4".to_string(),
            rpm: Some(10),
            ..DeploymentParams::default()
        };
        let near_limit = registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt-4".to_string(),
            litellm_params: params.clone(),
            model_info: DeploymentModelInfo::default(),
        });
        let roomy = registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt-4".to_string(),
            litellm_params: params,
            model_info: DeploymentModelInfo::default(),
        });

        let health = Arc::new(HealthTracker::new(crate::health::HealthConfig::default()));
        let adapters = Arc::new(AdapterRegistry::with_builtin_adapters());
        let cache = Arc::new(Cache::new());
        for _ in 0..9 {
            crate::usage::record_call(&cache, "openai", "gpt-4", &near_limit.id, 0).await;
        }

        let mut config = RouterConfig::default();
        config.routing_strategy = RoutingStrategyKind::UsageBased;
        let engine = RetryFallbackEngine::new(config, registry, health, adapters, Arc::new(FixedRandom(0.0)), cache);

        let mut request = NormalizedRequest::new("gpt-4", vec![ChatMessage::user("hi")]);
        request.mock_response = Some("ok".to_string());
        let response = engine.complete(request).await.unwrap();
        assert_eq!(response.routing.deployment_id, roomy.id);
    }

    #[tokio::test]
    async fn cache_affinity_hit_biases_selection_toward_the_recorded_deployment() {
        use crate::config::{DeploymentConfigEntry, DeploymentModelInfo, DeploymentParams};
        use crate::providers::ProviderKind;

        let registry = Arc::new(DeploymentRegistry::with_empty_model_info_lookup());
        let params = DeploymentParams {
            provider: ProviderKind::OpenAI,
            upstream_model: "gpt-4".to_string(),
            ..DeploymentParams::default()
        };
        registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt-4".to_string(),
            litellm_params: params.clone(),
            model_info: DeploymentModelInfo::default(),
        });
        let affine = registry.add_deployment(DeploymentConfigEntry {
            model_name: "gpt-4".to_string(),
            litellm_params: params,
            model_info: DeploymentModelInfo::default(),
        });

        let health = Arc::new(HealthTracker::new(crate::health::HealthConfig::default()));
        let adapters = Arc::new(AdapterRegistry::with_builtin_adapters());
        let cache = Arc::new(Cache::new());

        let mut request = NormalizedRequest::new("gpt-4", vec![]);
        request.mock_response = Some("hi".to_string());
        let fingerprint = crate::precall::request_fingerprint(&request);
        cache
            .set(
                &format!("prompt_cache:{fingerprint}"),
                serde_json::json!(affine.id),
                None,
            )
            .await;

        let engine = RetryFallbackEngine::new(
            RouterConfig::default(),
            registry,
            health,
            adapters,
            Arc::new(FixedRandom(0.0)),
            cache,
        );

        let response = engine.complete(request).await.unwrap();
        assert_eq!(response.routing.deployment_id, affine.id);
    }
}
