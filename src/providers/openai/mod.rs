//! OpenAI adapter.
//!
//! Grounded on the teacher's `OpenAIClient`
//! (`src/llm/providers/openai/client.rs`) — header building, the
//! `max_completion_tokens` + forced `temperature: 1.0` special case for o-
//! series models, and error-response classification are all carried over
//! nearly verbatim, retargeted at [`crate::providers::adapter::ProviderAdapter`]
//! instead of the teacher's `LLMProviderClient`.

pub(crate) mod types;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use std::pin::Pin;
use std::time::Duration;

use crate::config::Credentials;
use crate::error::{ErrorContext, RouterError, RouterResult};
use crate::providers::adapter::{Capabilities, ProviderAdapter, StreamState, WireRequest};
use crate::types::{
    ChatMessage, ContentPart, MessageRole, NormalizedRequest, NormalizedResponse, ResponseChoice,
    RoutingMetadata, StreamChunk, StreamDelta, StreamToolCallDelta, TokenUsage, ToolCall,
};

use types::{OpenAIChatMessage, OpenAIRequest, OpenAIResponse, OpenAIStreamChunk};

/// Models whose API shape diverges from the standard chat-completions
/// request (o1/o3/o4 reasoning models): `max_tokens` becomes
/// `max_completion_tokens` and `temperature` is pinned to 1.0 (spec §4.7
/// "provider adapters absorb model-family quirks so the Router never
/// special-cases a model name").
fn is_reasoning_model(model: &str) -> bool {
    model.starts_with("o1") || model.starts_with("o3") || model.starts_with("o4")
}

#[derive(Default)]
pub struct OpenAIAdapter;

impl OpenAIAdapter {
    pub fn new() -> Self {
        Self
    }

    fn convert_request(&self, upstream_model: &str, request: &NormalizedRequest) -> OpenAIRequest {
        let messages = request
            .messages
            .iter()
            .map(OpenAIChatMessage::from_normalized)
            .collect();

        let reasoning = is_reasoning_model(upstream_model);

        OpenAIRequest {
            model: upstream_model.to_string(),
            messages,
            temperature: if reasoning { Some(1.0) } else { request.temperature.map(|t| t as f64) },
            max_tokens: if reasoning { None } else { request.max_tokens },
            max_completion_tokens: if reasoning { request.max_tokens } else { None },
            top_p: request.top_p.map(|p| p as f64),
            stream: if request.stream { Some(true) } else { None },
            response_format: request.response_format.clone(),
            tools: request.tools.clone(),
            tool_choice: request.tool_choice.clone(),
        }
    }

    fn handle_error_response(&self, status: u16, body: &str) -> RouterError {
        let context = ErrorContext::default();
        let message = parse_openai_error_message(body).unwrap_or_else(|| body.to_string());
        match status {
            401 => RouterError::Authentication {
                message,
                status_code: Some(status),
                context,
            },
            403 => RouterError::PermissionDenied { message, context },
            404 => RouterError::NotFound { message, context },
            408 => RouterError::Timeout { message, context },
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

fn parse_openai_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value
        .get("error")?
        .get("message")?
        .as_str()
        .map(|s| s.to_string())
}

#[async_trait]
impl ProviderAdapter for OpenAIAdapter {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_streaming: true,
            supports_tools: true,
            supports_response_format: true,
            supports_vision: true,
        }
    }

    fn token_count(&self, _messages: &[ChatMessage]) -> Option<u32> {
        // No tiktoken-equivalent bundled; callers fall back to the
        // char-heuristic in `NormalizedRequest::estimate_prompt_tokens`.
        None
    }

    fn validate_environment(&self, credentials: &Credentials) -> RouterResult<HeaderMap> {
        let api_key = credentials.api_key.as_deref().ok_or_else(|| RouterError::Authentication {
            message: "missing api_key for openai deployment".to_string(),
            status_code: None,
            context: ErrorContext::default(),
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {api_key}")).map_err(|e| RouterError::Internal(e.to_string()))?,
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
            url: format!("{base_url}/chat/completions"),
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
            .map_err(|e| RouterError::Internal(format!("malformed openai response: {e}")))
    }

    fn transform_response(
        &self,
        wire_response: serde_json::Value,
        upstream_model: &str,
    ) -> RouterResult<NormalizedResponse> {
        let parsed: OpenAIResponse = serde_json::from_value(wire_response)
            .map_err(|e| RouterError::Internal(format!("malformed openai response: {e}")))?;

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
                cost: None,
            },
            reasoning_content: None,
            provider_specific_fields: Default::default(),
            routing: RoutingMetadata {
                model_group: String::new(),
                deployment_id: String::new(),
                provider: "openai".to_string(),
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
        if raw_frame.trim() == "[DONE]" {
            return Ok(None);
        }

        let parsed: OpenAIStreamChunk = serde_json::from_str(raw_frame)
            .map_err(|e| RouterError::Internal(format!("malformed openai stream chunk: {e}")))?;

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
                cost: None,
            }),
        }))
    }
}

impl ChatMessage {
    pub(crate) fn role_str(&self) -> &'static str {
        match self.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        }
    }
}

impl OpenAIChatMessage {
    pub(crate) fn from_normalized(msg: &ChatMessage) -> Self {
        Self {
            role: msg.role_str().to_string(),
            content: msg.text_content(),
            name: msg.name.clone(),
            tool_calls: msg.tool_calls.as_ref().map(|calls| {
                calls
                    .iter()
                    .map(|tc| types::ToolCallWire {
                        id: tc.id.clone(),
                        call_type: tc.kind.clone(),
                        function: types::FunctionCallWire {
                            name: tc.function_name.clone(),
                            arguments: tc.function_arguments.clone(),
                        },
                    })
                    .collect()
            }),
            tool_call_id: msg.tool_call_id.clone(),
        }
    }
}

impl types::OpenAIChatMessage {
    pub(crate) fn into_normalized(self) -> ChatMessage {
        ChatMessage {
            role: match self.role.as_str() {
                "system" => MessageRole::System,
                "assistant" => MessageRole::Assistant,
                "tool" => MessageRole::Tool,
                _ => MessageRole::User,
            },
            content: vec![ContentPart::text(self.content)],
            name: self.name,
            tool_calls: self.tool_calls.map(|calls| {
                calls
                    .into_iter()
                    .map(|tc| ToolCall {
                        id: tc.id,
                        kind: tc.call_type,
                        function_name: tc.function.name,
                        function_arguments: tc.function.arguments,
                    })
                    .collect()
            }),
            tool_call_id: self.tool_call_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NormalizedRequest;

    #[test]
    fn reasoning_models_get_max_completion_tokens_and_forced_temperature() {
        let adapter = OpenAIAdapter::new();
        let mut request = NormalizedRequest::new("o4-mini", vec![ChatMessage::user("hi")]);
        request.max_tokens = Some(100);
        request.temperature = Some(0.2);

        let wire = adapter.convert_request("o4-mini", &request);
        assert_eq!(wire.max_tokens, None);
        assert_eq!(wire.max_completion_tokens, Some(100));
        assert_eq!(wire.temperature, Some(1.0));
    }

    #[test]
    fn regular_models_keep_max_tokens_and_requested_temperature() {
        let adapter = OpenAIAdapter::new();
        let mut request = NormalizedRequest::new("gpt-4o", vec![ChatMessage::user("hi")]);
        request.max_tokens = Some(100);
        request.temperature = Some(0.2);

        let wire = adapter.convert_request("gpt-4o", &request);
        assert_eq!(wire.max_tokens, Some(100));
        assert_eq!(wire.max_completion_tokens, None);
        assert_eq!(wire.temperature, Some(0.2_f64).map(|v| v as f64));
    }

    #[test]
    fn error_response_maps_status_codes() {
        let adapter = OpenAIAdapter::new();
        let body = r#"{"error":{"message":"bad key"}}"#;
        match adapter.handle_error_response(401, body) {
            RouterError::Authentication { message, .. } => assert_eq!(message, "bad key"),
            other => panic!("unexpected variant: {other:?}"),
        }
    }
}
