//! Shared test support for the integration suite: an in-process
//! `ProviderAdapter` test double (no real network calls) plus small builders
//! for wiring it into a real `Router`.
//!
//! Grounded the same way `src/providers/openai/mod.rs` implements the
//! `ProviderAdapter` contract — this just scripts the outcomes instead of
//! calling out to a real HTTP endpoint.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use reqwest::header::HeaderMap;

use litellm_router::config::{Credentials, DeploymentConfigEntry, DeploymentModelInfo, DeploymentParams};
use litellm_router::providers::{AdapterRegistry, Capabilities, ProviderAdapter, ProviderKind, StreamState, WireRequest};
use litellm_router::registry::EmptyModelInfoLookup;
use litellm_router::strategies::RandomSource;
use litellm_router::types::{ContentPart, MessageRole};
use litellm_router::{
    ChatMessage, NormalizedRequest, NormalizedResponse, ResponseChoice, RouterError, RouterResult,
    RoutingMetadata, StreamChunk, StreamDelta, TokenUsage,
};
use litellm_router::{Router, RouterOptions};

/// One scripted outcome for a unary call against a given deployment's
/// `api_base` (used as the lookup key, since `execute`/`transform_request`
/// only ever see `base_url`, not the `Deployment` itself).
pub enum ScriptedCall {
    Success(&'static str),
    ConnectionError,
    NotFound,
}

/// One scripted outcome for opening a stream. `Frames` are raw wire frames
/// fed verbatim to `transform_stream_chunk`, one at a time.
pub enum ScriptedStream {
    Frames(Vec<String>),
    ConnectionError,
}

#[derive(Default)]
pub struct MockProviderAdapter {
    unary: Mutex<HashMap<String, VecDeque<ScriptedCall>>>,
    streams: Mutex<HashMap<String, VecDeque<ScriptedStream>>>,
}

impl MockProviderAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_unary(&self, api_base: &str, calls: Vec<ScriptedCall>) {
        self.unary.lock().unwrap().insert(api_base.to_string(), calls.into_iter().collect());
    }

    pub fn script_stream(&self, api_base: &str, streams: Vec<ScriptedStream>) {
        self.streams.lock().unwrap().insert(api_base.to_string(), streams.into_iter().collect());
    }
}

#[async_trait]
impl ProviderAdapter for MockProviderAdapter {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_streaming: true,
            supports_tools: false,
            supports_response_format: false,
            supports_vision: false,
        }
    }

    fn token_count(&self, _messages: &[ChatMessage]) -> Option<u32> {
        None
    }

    fn validate_environment(&self, _credentials: &Credentials) -> RouterResult<HeaderMap> {
        Ok(HeaderMap::new())
    }

    fn transform_request(
        &self,
        base_url: &str,
        upstream_model: &str,
        _request: &NormalizedRequest,
        _credentials: &Credentials,
    ) -> RouterResult<WireRequest> {
        Ok(WireRequest {
            url: base_url.to_string(),
            headers: HeaderMap::new(),
            body: serde_json::json!({ "model": upstream_model }),
        })
    }

    async fn execute(&self, _client: &reqwest::Client, wire: WireRequest, _timeout: Duration) -> RouterResult<serde_json::Value> {
        let next = self.unary.lock().unwrap().get_mut(&wire.url).and_then(VecDeque::pop_front);
        match next.unwrap_or(ScriptedCall::Success("mock reply")) {
            ScriptedCall::Success(text) => Ok(serde_json::json!({ "content": text })),
            ScriptedCall::ConnectionError => Err(RouterError::ApiConnection {
                message: "mock connection refused".to_string(),
                context: Default::default(),
            }),
            ScriptedCall::NotFound => Err(RouterError::NotFound {
                message: "mock model not found".to_string(),
                context: Default::default(),
            }),
        }
    }

    fn transform_response(&self, wire_response: serde_json::Value, upstream_model: &str) -> RouterResult<NormalizedResponse> {
        let text = wire_response.get("content").and_then(|v| v.as_str()).unwrap_or("").to_string();
        Ok(NormalizedResponse {
            id: "mock-response".to_string(),
            created: 0,
            model: upstream_model.to_string(),
            choices: vec![ResponseChoice {
                index: 0,
                message: ChatMessage {
                    role: MessageRole::Assistant,
                    content: vec![ContentPart::text(text)],
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
                model_group: String::new(),
                deployment_id: String::new(),
                provider: "mock".to_string(),
                attempted_groups: Vec::new(),
                retry_count: 0,
                latency_ms: 0,
            },
        })
    }

    async fn execute_stream(
        &self,
        _client: &reqwest::Client,
        wire: WireRequest,
        _connect_timeout: Duration,
    ) -> RouterResult<Pin<Box<dyn Stream<Item = RouterResult<String>> + Send>>> {
        let next = self.streams.lock().unwrap().get_mut(&wire.url).and_then(VecDeque::pop_front);
        match next.unwrap_or(ScriptedStream::Frames(Vec::new())) {
            ScriptedStream::Frames(frames) => Ok(Box::pin(futures::stream::iter(frames.into_iter().map(Ok)))),
            ScriptedStream::ConnectionError => Err(RouterError::ApiConnection {
                message: "mock stream connection refused".to_string(),
                context: Default::default(),
            }),
        }
    }

    fn transform_stream_chunk(&self, raw_frame: &str, _state: &mut StreamState) -> RouterResult<Option<StreamChunk>> {
        let parsed: serde_json::Value =
            serde_json::from_str(raw_frame).map_err(|e| RouterError::Internal(format!("malformed mock frame: {e}")))?;
        let content = parsed.get("content").and_then(|v| v.as_str()).map(str::to_string);
        let finish_reason = parsed.get("finish_reason").and_then(|v| v.as_str()).map(str::to_string);
        let usage = parsed.get("usage").map(|u| TokenUsage {
            prompt_tokens: u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            completion_tokens: u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            total_tokens: u.get("total_tokens").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            cost: u.get("cost").and_then(|v| v.as_f64()),
        });
        Ok(Some(StreamChunk {
            id: "mock-stream".to_string(),
            created: 0,
            model: "mock".to_string(),
            choices: vec![StreamDelta {
                index: 0,
                role: None,
                content,
                reasoning_content: None,
                tool_calls: None,
                finish_reason,
            }],
            usage,
        }))
    }
}

/// Deterministic `RandomSource` that walks a fixed sequence of `[0, 1)`
/// values, one per `next_f64` call, repeating the last value once the
/// sequence is exhausted. Plain `FixedRandom(0.0)` always picks the first
/// candidate in a list; this lets a test steer a simple-shuffle selection
/// through a specific sequence of deployments across retries/requests.
pub struct SequenceRandom {
    values: Mutex<VecDeque<f64>>,
}

impl SequenceRandom {
    pub fn new(values: Vec<f64>) -> Self {
        assert!(!values.is_empty(), "SequenceRandom needs at least one value");
        Self {
            values: Mutex::new(values.into_iter().collect()),
        }
    }
}

impl RandomSource for SequenceRandom {
    fn next_f64(&self) -> f64 {
        let mut values = self.values.lock().unwrap();
        if values.len() > 1 {
            values.pop_front().unwrap()
        } else {
            *values.front().expect("non-empty")
        }
    }
}

/// A `Router` wired to a single shared `MockProviderAdapter`, registered
/// under a custom provider kind so no real provider adapter is ever reached.
pub fn router_with_mock_adapter(config: litellm_router::RouterConfig, random: impl RandomSource + 'static) -> (Router, std::sync::Arc<MockProviderAdapter>) {
    let mock = std::sync::Arc::new(MockProviderAdapter::new());
    let mut adapters = AdapterRegistry::new();
    adapters.register(ProviderKind::Custom("mock".to_string()), mock.clone() as std::sync::Arc<dyn ProviderAdapter>);

    let router = Router::new(RouterOptions {
        config,
        adapters: std::sync::Arc::new(adapters),
        model_info_lookup: std::sync::Arc::new(EmptyModelInfoLookup),
        random: std::sync::Arc::new(random),
    });
    (router, mock)
}

/// A deployment entry pointed at the mock adapter, keyed by `api_base` (the
/// `MockProviderAdapter`'s lookup key).
pub fn mock_deployment_entry(model_group: &str, api_base: &str) -> DeploymentConfigEntry {
    DeploymentConfigEntry {
        model_name: model_group.to_string(),
        litellm_params: DeploymentParams {
            provider: ProviderKind::Custom("mock".to_string()),
            upstream_model: "mock-model".to_string(),
            credentials: Credentials {
                api_base: Some(api_base.to_string()),
                ..Credentials::default()
            },
            ..DeploymentParams::default()
        },
        model_info: DeploymentModelInfo::default(),
    }
}
