//! vLLM adapter — OpenAI-compatible wire format, optional auth.
//!
//! Grounded on the teacher's `VLLMClient`
//! (`src/llm/providers/vllm/client.rs`), whose own comment calls out that it
//! reuses `super::openai::types::OpenAIChatMessage` for message conversion.
//! This adapter does the same, delegating to
//! [`crate::providers::openai`]'s wire types rather than redefining an
//! identical shape, and differs from [`crate::providers::openai::OpenAIAdapter`]
//! only in that a missing `api_key` is not an error (spec §4.7: vLLM
//! deployments commonly run with no auth in front of them).

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::pin::Pin;
use std::time::Duration;

use crate::config::Credentials;
use crate::error::{ErrorContext, RouterError, RouterResult};
use crate::providers::adapter::{Capabilities, ProviderAdapter, StreamState, WireRequest};
use crate::providers::openai::types::{OpenAIChatMessage, OpenAIRequest, OpenAIResponse, OpenAIStreamChunk};
use crate::types::{
    ChatMessage, MessageRole, NormalizedRequest, NormalizedResponse, ResponseChoice,
    RoutingMetadata, StreamChunk, StreamDelta, StreamToolCallDelta, TokenUsage,
};

#[derive(Default)]
pub struct VLlmAdapter;

impl VLlmAdapter {
    pub fn new() -> Self {
        Self
    }

    fn convert_request(&self, upstream_model: &str, request: &NormalizedRequest) -> OpenAIRequest {
        OpenAIRequest {
            model: upstream_model.to_string(),
            messages: request.messages.iter().map(OpenAIChatMessage::from_normalized).collect(),
            temperature: request.temperature.map(|t| t as f64),
            max_tokens: request.max_tokens,
            max_completion_tokens: None,
            top_p: request.top_p.map(|p| p as f64),
            stream: if request.stream { Some(true) } else { None },
            response_format: request.response_format.clone(),
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for VLlmAdapter {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_streaming: true,
            supports_tools: true,
            supports_response_format: true,
            supports_vision: false,
        }
    }

    fn token_count(&self, _messages: &[ChatMessage]) -> Option<u32> {
        None
    }

    fn validate_environment(&self, credentials: &Credentials) -> RouterResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(api_key) = &credentials.api_key {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|e| RouterError::Internal(e.to_string()))?,
            );
        }
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
            url: format!("{base_url}/v1/chat/completions"),
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
            .map_err(|e| RouterError::Internal(format!("malformed vllm response: {e}")))
    }

    fn transform_response(
        &self,
        wire_response: serde_json::Value,
        _upstream_model: &str,
    ) -> RouterResult<NormalizedResponse> {
        let parsed: OpenAIResponse = serde_json::from_value(wire_response)
            .map_err(|e| RouterError::Internal(format!("malformed vllm response: {e}")))?;

        let choices = parsed
            .choices
            .into_iter()
            .map(|c| ResponseChoice {
                index: c.index,
                message: c.message.into_normalized(),
                finish_reason: c.finish_reason,
            })
            .collect();

        Ok(NormalizedResponse {
            id: parsed.id,
            created: parsed.created,
            model: parsed.model,
            choices,
            usage: TokenUsage {
                prompt_tokens: parsed.usage.prompt_tokens,
                completion_tokens: parsed.usage.completion_tokens,
                total_tokens: parsed.usage.total_tokens,
                // Self-hosted inference has no billed cost, a known zero
                // rather than an absent one (spec §4.8, §9 property 7).
                cost: Some(0.0),
            },
            reasoning_content: None,
            provider_specific_fields: Default::default(),
            routing: RoutingMetadata {
                model_group: String::new(),
                deployment_id: String::new(),
                provider: "vllm".to_string(),
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

        Ok(Box::pin(crate::sse::sse_lines(byte_stream)))
    }

    fn transform_stream_chunk(
        &self,
        raw_frame: &str,
        state: &mut StreamState,
    ) -> RouterResult<Option<StreamChunk>> {
        if raw_frame.trim() == "[DONE]" {
            return Ok(None);
        }

        let parsed: OpenAIStreamChunk = serde_json::from_str(raw_frame)
            .map_err(|e| RouterError::Internal(format!("malformed vllm stream chunk: {e}")))?;

        state.model = parsed.model.clone();

        let choices = parsed
            .choices
            .into_iter()
            .map(|c| StreamDelta {
                index: c.index,
                role: c.delta.role.map(|r| match r.as_str() {
                    "system" => MessageRole::System,
                    "assistant" => MessageRole::Assistant,
                    "tool" => MessageRole::Tool,
                    _ => MessageRole::User,
                }),
                content: c.delta.content,
                reasoning_content: None,
                tool_calls: c.delta.tool_calls.map(|calls| {
                    calls
                        .into_iter()
                        .map(|tc| StreamToolCallDelta {
                            index: tc.index,
                            id: tc.id,
                            kind: tc.call_type,
                            function_name: tc.function.as_ref().and_then(|f| f.name.clone()),
                            function_arguments_fragment: tc
                                .function
                                .as_ref()
                                .and_then(|f| f.arguments.clone()),
                        })
                        .collect()
                }),
                finish_reason: c.finish_reason,
            })
            .collect();

        Ok(Some(StreamChunk {
            id: parsed.id,
            created: parsed.created,
            model: parsed.model,
            choices,
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
                cost: Some(0.0),
            }),
        }))
    }
}
