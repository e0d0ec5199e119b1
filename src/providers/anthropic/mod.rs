//! Anthropic adapter.
//!
//! Grounded on the teacher's `AnthropicClient`
//! (`src/llm/providers/anthropic/client.rs`): the system-message split
//! (Anthropic has no `system` role inside `messages`, only a top-level
//! `system` field), the `x-api-key`/`anthropic-version` headers, and the
//! error-response JSON shape are carried over. The streaming side is new —
//! the teacher never implemented `chat_completion_stream` for Anthropic
//! beyond a stub — so `transform_stream_chunk` is grounded instead on the
//! content-block event sequence Anthropic's own docs and the teacher's
//! `AnthropicStreamingChunk` type sketch out.

mod types;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use std::pin::Pin;
use std::time::Duration;

use crate::config::Credentials;
use crate::error::{ErrorContext, RouterError, RouterResult};
use crate::providers::adapter::{Capabilities, ProviderAdapter, StreamState, WireRequest};
use crate::types::{
    ChatMessage, ContentPart, MessageRole, NormalizedRequest, NormalizedResponse, ResponseChoice,
    RoutingMetadata, StreamChunk, StreamDelta, TokenUsage,
};

use types::{
    AnthropicDelta, AnthropicMessage, AnthropicRequest, AnthropicResponse, AnthropicStreamEvent,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Default)]
pub struct AnthropicAdapter;

impl AnthropicAdapter {
    pub fn new() -> Self {
        Self
    }

    fn convert_request(&self, upstream_model: &str, request: &NormalizedRequest) -> AnthropicRequest {
        let mut system_prompt = None;
        let mut messages = Vec::new();

        for msg in &request.messages {
            match msg.role {
                MessageRole::System => system_prompt = Some(msg.text_content()),
                _ => messages.push(AnthropicMessage {
                    role: match msg.role {
                        MessageRole::Assistant => "assistant".to_string(),
                        _ => "user".to_string(),
                    },
                    content: msg.text_content(),
                }),
            }
        }

        AnthropicRequest {
            model: upstream_model.to_string(),
            messages,
            // Anthropic requires max_tokens on every call; the Router's
            // contract allows it to be unset (spec §4.7 "must supply a
            // provider-required default the normalized request doesn't
            // carry").
            max_tokens: request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            temperature: request.temperature.map(|t| t as f64),
            top_p: request.top_p.map(|p| p as f64),
            stream: if request.stream { Some(true) } else { None },
            system: system_prompt,
            tools: None,
        }
    }

    fn handle_error_response(&self, status: u16, body: &str) -> RouterError {
        let context = ErrorContext::default();
        let message = serde_json::from_str::<types::AnthropicError>(body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| body.to_string());

        match status {
            401 => RouterError::Authentication {
                message,
                status_code: Some(status),
                context,
            },
            403 => RouterError::PermissionDenied { message, context },
            404 => RouterError::NotFound { message, context },
            429 => RouterError::RateLimit {
                message,
                retry_after_s: None,
                context,
            },
            400 | 422 => RouterError::BadRequest { message, context },
            _ => RouterError::Api {
                message,
                status_code: Some(status),
                context,
            },
        }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_streaming: true,
            supports_tools: true,
            supports_response_format: false,
            supports_vision: true,
        }
    }

    fn token_count(&self, _messages: &[ChatMessage]) -> Option<u32> {
        None
    }

    fn validate_environment(&self, credentials: &Credentials) -> RouterResult<HeaderMap> {
        let api_key = credentials.api_key.as_deref().ok_or_else(|| RouterError::Authentication {
            message: "missing api_key for anthropic deployment".to_string(),
            status_code: None,
            context: ErrorContext::default(),
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_str(api_key).map_err(|e| RouterError::Internal(e.to_string()))?,
        );
        headers.insert(
            HeaderName::from_static("anthropic-version"),
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
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
            url: format!("{base_url}/v1/messages"),
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
            return Err(self.handle_error_response(status, &body));
        }

        response
            .json::<serde_json::Value>()
            .await
            .map_err(|e| RouterError::Internal(format!("malformed anthropic response: {e}")))
    }

    fn transform_response(
        &self,
        wire_response: serde_json::Value,
        _upstream_model: &str,
    ) -> RouterResult<NormalizedResponse> {
        let parsed: AnthropicResponse = serde_json::from_value(wire_response)
            .map_err(|e| RouterError::Internal(format!("malformed anthropic response: {e}")))?;

        let text = parsed
            .content
            .iter()
            .filter(|b| b.content_type == "text")
            .filter_map(|b| b.text.clone())
            .collect::<Vec<_>>()
            .join("");

        Ok(NormalizedResponse {
            id: parsed.id,
            created: chrono::Utc::now().timestamp() as u64,
            model: parsed.model,
            choices: vec![ResponseChoice {
                index: 0,
                message: ChatMessage {
                    role: MessageRole::Assistant,
                    content: vec![ContentPart::text(text)],
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                },
                finish_reason: parsed.stop_reason,
            }],
            usage: TokenUsage {
                prompt_tokens: parsed.usage.input_tokens,
                completion_tokens: parsed.usage.output_tokens,
                total_tokens: parsed.usage.input_tokens + parsed.usage.output_tokens,
                cost: None,
            },
            reasoning_content: None,
            provider_specific_fields: Default::default(),
            routing: RoutingMetadata {
                model_group: String::new(),
                deployment_id: String::new(),
                provider: "anthropic".to_string(),
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
            return Err(self.handle_error_response(status, &body));
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
        let event: AnthropicStreamEvent = serde_json::from_str(raw_frame)
            .map_err(|e| RouterError::Internal(format!("malformed anthropic stream event: {e}")))?;

        match event {
            AnthropicStreamEvent::MessageStart { message } => {
                state.request_id = message.id;
                state.model = message.model;
                Ok(None)
            }
            AnthropicStreamEvent::ContentBlockDelta { index, delta } => {
                let content = match delta {
                    AnthropicDelta::TextDelta { text } => Some(text),
                    AnthropicDelta::InputJsonDelta { .. } => None,
                };
                if content.is_none() {
                    return Ok(None);
                }
                Ok(Some(StreamChunk {
                    id: state.request_id.clone(),
                    created: chrono::Utc::now().timestamp() as u64,
                    model: state.model.clone(),
                    choices: vec![StreamDelta {
                        index,
                        role: None,
                        content,
                        reasoning_content: None,
                        tool_calls: None,
                        finish_reason: None,
                    }],
                    usage: None,
                }))
            }
            AnthropicStreamEvent::MessageDelta { delta, usage } => Ok(Some(StreamChunk {
                id: state.request_id.clone(),
                created: chrono::Utc::now().timestamp() as u64,
                model: state.model.clone(),
                choices: vec![StreamDelta {
                    index: 0,
                    role: None,
                    content: Some(String::new()),
                    reasoning_content: None,
                    tool_calls: None,
                    finish_reason: delta.stop_reason,
                }],
                usage: usage.map(|u| TokenUsage {
                    prompt_tokens: u.input_tokens,
                    completion_tokens: u.output_tokens,
                    total_tokens: u.input_tokens + u.output_tokens,
                    cost: None,
                }),
            })),
            AnthropicStreamEvent::Error { error } => Err(RouterError::Api {
                message: error.message,
                status_code: None,
                context: ErrorContext::default(),
            }),
            AnthropicStreamEvent::ContentBlockStart { .. }
            | AnthropicStreamEvent::ContentBlockStop { .. }
            | AnthropicStreamEvent::MessageStop
            | AnthropicStreamEvent::Ping => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NormalizedRequest;

    #[test]
    fn system_message_is_lifted_out_of_the_message_list() {
        let adapter = AnthropicAdapter::new();
        let mut request = NormalizedRequest::new("claude-3-opus", vec![]);
        request.messages = vec![
            ChatMessage {
                role: MessageRole::System,
                content: vec![ContentPart::text("be terse")],
                name: None,
                tool_calls: None,
                tool_call_id: None,
            },
            ChatMessage::user("hi"),
        ];

        let wire = adapter.convert_request("claude-3-opus", &request);
        assert_eq!(wire.system, Some("be terse".to_string()));
        assert_eq!(wire.messages.len(), 1);
    }

    #[test]
    fn missing_max_tokens_falls_back_to_default() {
        let adapter = AnthropicAdapter::new();
        let request = NormalizedRequest::new("claude-3-opus", vec![ChatMessage::user("hi")]);
        let wire = adapter.convert_request("claude-3-opus", &request);
        assert_eq!(wire.max_tokens, DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn message_delta_terminal_chunk_has_empty_string_content() {
        let adapter = AnthropicAdapter::new();
        let mut state = StreamState::default();
        let frame = r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"input_tokens":5,"output_tokens":10}}"#;
        let chunk = adapter.transform_stream_chunk(frame, &mut state).unwrap().unwrap();
        assert_eq!(chunk.choices[0].content, Some(String::new()));
        assert_eq!(chunk.choices[0].finish_reason, Some("end_turn".to_string()));
    }
}
