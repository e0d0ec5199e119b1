//! `Router`: the public entry point (spec §4.9).
//!
//! Glues [`crate::registry::DeploymentRegistry`], [`crate::health::HealthTracker`],
//! [`crate::retry::RetryFallbackEngine`], and [`crate::cache::Cache`] into the
//! one object a host process holds. No teacher file maps onto this
//! directly — the teacher's `LLMRouter` (`src/llm/router.rs`) only ever
//! exposed `chat_completion`/`chat_completion_stream`; this module
//! generalizes that single entry point into the full set of endpoint kinds
//! spec §4.9 lists, all sharing one `RetryFallbackEngine` call path since
//! the Router core treats them identically (routing/retry/fallback/health
//! don't care whether the payload is a chat message, an embedding input, or
//! an image prompt — only the provider adapter's wire translation differs,
//! and that is out of scope per spec §1).

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;

use crate::background::BackgroundLoops;
use crate::cache::Cache;
use crate::config::{DeploymentConfigEntry, DeploymentParamsPatch, RouterConfig};
use crate::error::{RouterError, RouterResult};
use crate::health::{HealthConfig, HealthTracker};
use crate::providers::AdapterRegistry;
use crate::registry::{Deployment, DeploymentRegistry, ModelInfoLookup, ResolvedModelInfo};
use crate::retry::RetryFallbackEngine;
use crate::strategies::{RandomSource, ThreadRngSource};
use crate::streaming::StreamEvent;
use crate::types::{EndpointKind, NormalizedRequest, NormalizedResponse};

/// Everything a fresh `Router` needs that isn't defaulted. Mirrors the
/// teacher's `LLMRouter::new` constructor arguments (provider table, retry
/// config) widened to cover the whole of spec §6.2's router-level config.
pub struct RouterOptions {
    pub config: RouterConfig,
    pub adapters: Arc<AdapterRegistry>,
    pub model_info_lookup: Arc<dyn ModelInfoLookup>,
    pub random: Arc<dyn RandomSource>,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            config: RouterConfig::default(),
            adapters: Arc::new(AdapterRegistry::with_builtin_adapters()),
            model_info_lookup: Arc::new(crate::registry::EmptyModelInfoLookup),
            random: Arc::new(ThreadRngSource),
        }
    }
}

pub struct Router {
    registry: Arc<DeploymentRegistry>,
    health: Arc<HealthTracker>,
    cache: Arc<Cache>,
    engine: RetryFallbackEngine,
    /// Kept alive for the Router's lifetime; dropping it aborts the
    /// background loops (spec §4.10).
    _background: BackgroundLoops,
}

impl Router {
    pub fn new(options: RouterOptions) -> Self {
        let health_config = HealthConfig {
            allowed_fails: options.config.allowed_fails,
            allowed_fails_window: std::time::Duration::from_secs(options.config.allowed_fails_window_s),
            cooldown_time: std::time::Duration::from_secs(options.config.cooldown_time_s),
            cooldown_growth_factor: options.config.cooldown_growth_factor,
            cooldown_cap: std::time::Duration::from_secs(options.config.cooldown_cap_s),
            long_cooldown: std::time::Duration::from_secs(options.config.long_cooldown_time_s),
        };

        let registry = Arc::new(DeploymentRegistry::new(options.model_info_lookup));
        let health = Arc::new(HealthTracker::new(health_config));
        let cache = Arc::new(Cache::new());
        let background = BackgroundLoops::spawn(
            Arc::clone(&health),
            options.config.enable_health_monitoring,
            std::time::Duration::from_secs(options.config.health_check_interval_s),
        );
        let engine = RetryFallbackEngine::new(
            options.config,
            Arc::clone(&registry),
            Arc::clone(&health),
            options.adapters,
            options.random,
            Arc::clone(&cache),
        );

        Self {
            registry,
            health,
            cache,
            engine,
            _background: background,
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RouterOptions::default())
    }

    // ---- Deployment lifecycle (spec §4.2) -------------------------------

    pub fn add_deployment(&self, entry: DeploymentConfigEntry) -> Deployment {
        self.registry.add_deployment(entry)
    }

    pub fn update_deployment(
        &self,
        deployment_id: &str,
        patch: DeploymentParamsPatch,
    ) -> RouterResult<()> {
        self.registry.update_deployment(deployment_id, patch)
    }

    /// Removes a deployment (spec §3 "Removal cancels outstanding requests
    /// for that deployment"). Requests already in flight against it hold
    /// their own `Deployment` snapshot (cloned at selection time) and run
    /// to completion or failure; only future selection is affected.
    pub fn delete_deployment(&self, deployment_id: &str) -> RouterResult<()> {
        self.registry.remove_deployment(deployment_id)
    }

    pub fn resolve_model_info(&self, deployment: &Deployment) -> ResolvedModelInfo {
        self.registry.resolve_model_info(deployment)
    }

    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    pub fn registry(&self) -> &Arc<DeploymentRegistry> {
        &self.registry
    }

    // ---- Chat / completion -----------------------------------------------

    pub async fn acompletion(&self, mut request: NormalizedRequest) -> RouterResult<NormalizedResponse> {
        request.endpoint_kind = EndpointKind::Completion;
        request.stream = false;
        let fingerprint = crate::precall::request_fingerprint(&request);
        let response = self.engine.complete(request).await?;
        self.write_prompt_cache_affinity(&fingerprint, &response).await;
        Ok(response)
    }

    pub fn completion(&self, request: NormalizedRequest) -> RouterResult<NormalizedResponse> {
        block_on_current_runtime(self.acompletion(request))
    }

    pub async fn acompletion_stream(
        &self,
        mut request: NormalizedRequest,
    ) -> RouterResult<Pin<Box<dyn Stream<Item = RouterResult<StreamEvent>> + Send>>> {
        request.endpoint_kind = EndpointKind::Completion;
        request.stream = true;
        self.engine.complete_stream(request).await
    }

    pub fn completion_stream(
        &self,
        request: NormalizedRequest,
    ) -> RouterResult<Pin<Box<dyn Stream<Item = RouterResult<StreamEvent>> + Send>>> {
        block_on_current_runtime(self.acompletion_stream(request))
    }

    // ---- Anthropic messages (same path as chat completion, spec §4.9) ---

    pub async fn anthropic_messages(&self, mut request: NormalizedRequest) -> RouterResult<NormalizedResponse> {
        request.endpoint_kind = EndpointKind::AnthropicMessages;
        request.stream = false;
        let fingerprint = crate::precall::request_fingerprint(&request);
        let response = self.engine.complete(request).await?;
        self.write_prompt_cache_affinity(&fingerprint, &response).await;
        Ok(response)
    }

    pub async fn anthropic_messages_stream(
        &self,
        mut request: NormalizedRequest,
    ) -> RouterResult<Pin<Box<dyn Stream<Item = RouterResult<StreamEvent>> + Send>>> {
        request.endpoint_kind = EndpointKind::AnthropicMessages;
        request.stream = true;
        self.engine.complete_stream(request).await
    }

    // ---- Embedding (never streams) ----------------------------------------

    pub async fn aembedding(&self, mut request: NormalizedRequest) -> RouterResult<NormalizedResponse> {
        request.endpoint_kind = EndpointKind::Embedding;
        request.stream = false;
        self.engine.complete(request).await
    }

    pub fn embedding(&self, request: NormalizedRequest) -> RouterResult<NormalizedResponse> {
        block_on_current_runtime(self.aembedding(request))
    }

    // ---- Images ------------------------------------------------------------

    pub async fn aimage_generation(&self, mut request: NormalizedRequest) -> RouterResult<NormalizedResponse> {
        request.endpoint_kind = EndpointKind::ImageGeneration;
        request.stream = false;
        self.engine.complete(request).await
    }

    pub fn image_generation(&self, request: NormalizedRequest) -> RouterResult<NormalizedResponse> {
        block_on_current_runtime(self.aimage_generation(request))
    }

    // ---- Audio ---------------------------------------------------------------

    pub async fn aaudio_speech(&self, mut request: NormalizedRequest) -> RouterResult<NormalizedResponse> {
        request.endpoint_kind = EndpointKind::AudioSpeech;
        request.stream = false;
        self.engine.complete(request).await
    }

    pub fn audio_speech(&self, request: NormalizedRequest) -> RouterResult<NormalizedResponse> {
        block_on_current_runtime(self.aaudio_speech(request))
    }

    pub async fn aaudio_transcription(&self, mut request: NormalizedRequest) -> RouterResult<NormalizedResponse> {
        request.endpoint_kind = EndpointKind::AudioTranscription;
        request.stream = false;
        self.engine.complete(request).await
    }

    pub fn audio_transcription(&self, request: NormalizedRequest) -> RouterResult<NormalizedResponse> {
        block_on_current_runtime(self.aaudio_transcription(request))
    }

    // ---- Responses API -------------------------------------------------------

    pub async fn aresponses(&self, mut request: NormalizedRequest) -> RouterResult<NormalizedResponse> {
        request.endpoint_kind = EndpointKind::Responses;
        request.stream = false;
        self.engine.complete(request).await
    }

    pub fn responses(&self, request: NormalizedRequest) -> RouterResult<NormalizedResponse> {
        block_on_current_runtime(self.aresponses(request))
    }

    pub async fn aresponses_stream(
        &self,
        mut request: NormalizedRequest,
    ) -> RouterResult<Pin<Box<dyn Stream<Item = RouterResult<StreamEvent>> + Send>>> {
        request.endpoint_kind = EndpointKind::Responses;
        request.stream = true;
        self.engine.complete_stream(request).await
    }

    /// Writes the prompt-cache affinity entry (spec §4.4 item 6, §8 property
    /// 10), keyed by the same request-content fingerprint the read side in
    /// [`crate::retry::RetryFallbackEngine::apply_cache_affinity`] looks up —
    /// not by anything derived from the response, which carries no relation
    /// to the next call's prompt. Callers only invoke this for the call
    /// types the corrected allow-list permits (`Completion`,
    /// `AnthropicMessages`); a cache write failure never surfaces to the
    /// caller (spec §4.1 graceful degradation).
    async fn write_prompt_cache_affinity(&self, fingerprint: &str, response: &NormalizedResponse) {
        let key = format!("prompt_cache:{fingerprint}");
        self.cache
            .set(
                &key,
                serde_json::json!(response.routing.deployment_id),
                Some(std::time::Duration::from_secs(300)),
            )
            .await;
    }
}

/// Runs an async call to completion from sync code (spec §4.9 "Synchronous
/// variants run their async core on a blocking adapter"). Requires a
/// multi-threaded Tokio runtime already running on the calling thread,
/// matching `tokio::main`/`#[tokio::test(flavor = "multi_thread")]` hosts.
fn block_on_current_runtime<F, T>(future: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}
