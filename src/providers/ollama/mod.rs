//! Ollama adapter — local inference, typically no auth (spec §4.7 "not every
//! provider needs credentials").
//!
//! Grounded on the teacher's `OllamaClient`
//! (`src/llm/providers/ollama/client.rs`): `num_predict` for `max_tokens`,
//! the system-message-as-separate-field convention, and `done`/`eval_count`
//! response fields carry over. Streaming here uses newline-delimited JSON
//! (`ndjson_lines`), not SSE — Ollama's `/api/chat` emits one JSON object
//! per line, unlike every other adapter in this crate.

mod types;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use std::pin::Pin;
use std::time::Duration;

use crate::config::Credentials;
use crate::error::{ErrorContext, RouterError, RouterResult};
use crate::providers::adapter::{Capabilities, ProviderAdapter, StreamState, WireRequest};
use crate::types::{
    ChatMessage, ContentPart, MessageRole, NormalizedRequest, NormalizedResponse, ResponseChoice,
    RoutingMetadata, StreamChunk, StreamDelta, TokenUsage,
};

use types::{OllamaChatMessage, OllamaOptions, OllamaRequest, OllamaResponse, OllamaStreamChunk};

#[derive(Default)]
pub struct OllamaAdapter;

impl OllamaAdapter {
    pub fn new() -> Self {
        Self
    }

    fn convert_request(&self, upstream_model: &str, request: &NormalizedRequest) -> OllamaRequest {
        let mut system = None;
        let messages = request
            .messages
            .iter()
            .filter_map(|m| {
                if m.role == MessageRole::System {
                    system = Some(m.text_content());
                    None
                } else {
                    Some(OllamaChatMessage {
                        role: match m.role {
                            MessageRole::Assistant => "assistant".to_string(),
                            MessageRole::Tool => "tool".to_string(),
                            _ => "user".to_string(),
                        },
                        content: m.text_content(),
                    })
                }
            })
            .collect();

        OllamaRequest {
            model: upstream_model.to_string(),
            messages,
            stream: request.stream,
            options: Some(OllamaOptions {
                temperature: request.temperature,
                top_p: request.top_p,
                num_predict: request.max_tokens.map(|t| t as i32),
            }),
            system,
        }
    }
}

#[async_trait]
impl ProviderAdapter for OllamaAdapter {
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
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn transform_request(
        &self,
        base_url: &str,
        upstream_model: &str,
        request: &NormalizedRequest,
        credentials: &Credentials,
    ) -> RouterResult<WireRequest> {
        let headers = self.validate_environment(credentials)?;
        let body = serde_json::to_value(self.convert_request(upstream_model, request))
            .map_err(|e| RouterError::Internal(e.to_string()))?;
        Ok(WireRequest {
            url: format!("{base_url}/api/chat"),
            headers,
            body,
        })
    }

    async fn execute(
        &self,
        client: &reqwest::Client,
        wire: WireRequest,
        timeout: Duration,
    ) -> RouterResult<serde_json::Value> {
        let response = client
            .post(&wire.url)
            .headers(wire.headers)
            .json(&wire.body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    RouterError::Timeout {
                        message: e.to_string(),
                        context: ErrorContext::default(),
                    }
                } else {
                    RouterError::ApiConnection {
                        message: e.to_string(),
                        context: ErrorContext::default(),
                    }
                }
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RouterError::Api {
                message: body,
                status_code: Some(status),
                context: ErrorContext::default(),
            });
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| RouterError::Internal(format!("malformed ollama response: {e}")))
    }

    fn transform_response(
        &self,
        wire_response: serde_json::Value,
        _upstream_model: &str,
    ) -> RouterResult<NormalizedResponse> {
        let parsed: OllamaResponse = serde_json::from_value(wire_response)
            .map_err(|e| RouterError::Internal(format!("malformed ollama response: {e}")))?;

        Ok(NormalizedResponse {
            id: uuid::Uuid::new_v4().to_string(),
            created: chrono::Utc::now().timestamp() as u64,
            model: parsed.model.clone(),
            choices: vec![ResponseChoice {
                index: 0,
                message: ChatMessage {
                    role: MessageRole::Assistant,
                    content: vec![ContentPart::text(parsed.message.content)],
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                },
                finish_reason: if parsed.done { Some("stop".to_string()) } else { None },
            }],
            usage: TokenUsage {
                prompt_tokens: parsed.prompt_eval_count.unwrap_or(0),
                completion_tokens: parsed.eval_count.unwrap_or(0),
                total_tokens: parsed.prompt_eval_count.unwrap_or(0) + parsed.eval_count.unwrap_or(0),
                // Local inference has no billed cost, but that's still a
                // known zero, not "unreported" (spec §4.8, §9 property 7).
                cost: Some(0.0),
            },
            reasoning_content: None,
            provider_specific_fields: Default::default(),
            routing: RoutingMetadata {
                model_group: String::new(),
                deployment_id: String::new(),
                provider: "ollama".to_string(),
                attempted_groups: Vec::new(),
                retry_count: 0,
                latency_ms: 0,
            },
        })
    }

    async fn execute_stream(
        &self,
        client: &reqwest::Client,
        wire: WireRequest,
        connect_timeout: Duration,
    ) -> RouterResult<Pin<Box<dyn futures::Stream<Item = RouterResult<String>> + Send>>> {
        let response = client
            .post(&wire.url)
            .headers(wire.headers)
            .json(&wire.body)
            .timeout(connect_timeout)
            .send()
            .await
            .map_err(|e| RouterError::ApiConnection {
                message: e.to_string(),
                context: ErrorContext::default(),
            })?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(RouterError::Api {
                message: body,
                status_code: Some(status),
                context: ErrorContext::default(),
            });
        }

        let byte_stream = response.bytes_stream().map(|chunk| {
            chunk
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .map_err(|e| RouterError::ApiConnection {
                    message: e.to_string(),
                    context: ErrorContext::default(),
                })
        });

        Ok(Box::pin(crate::sse::ndjson_lines(byte_stream)))
    }

    fn transform_stream_chunk(
        &self,
        raw_frame: &str,
        state: &mut StreamState,
    ) -> RouterResult<Option<StreamChunk>> {
        let parsed: OllamaStreamChunk = serde_json::from_str(raw_frame)
            .map_err(|e| RouterError::Internal(format!("malformed ollama stream chunk: {e}")))?;

        state.model = parsed.model.clone();

        Ok(Some(StreamChunk {
            id: state.request_id.clone(),
            created: chrono::Utc::now().timestamp() as u64,
            model: parsed.model,
            choices: vec![StreamDelta {
                index: 0,
                role: None,
                content: Some(parsed.message.content),
                reasoning_content: None,
                tool_calls: None,
                finish_reason: if parsed.done { Some("stop".to_string()) } else { None },
            }],
            usage: if parsed.done {
                Some(TokenUsage {
                    prompt_tokens: parsed.prompt_eval_count.unwrap_or(0),
                    completion_tokens: parsed.eval_count.unwrap_or(0),
                    total_tokens: parsed.prompt_eval_count.unwrap_or(0) + parsed.eval_count.unwrap_or(0),
                    cost: Some(0.0),
                })
            } else {
                None
            },
        }))
    }
}
