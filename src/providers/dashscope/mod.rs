//! Dashscope adapter — multimodal (`qwen3-vl-plus` et al.), OpenAI-shaped
//! transport.
//!
//! New module grounded on `crate::providers::openai` for the transport
//! mechanics (headers, error classification, SSE framing) combined with
//! `crate::types::ContentPart` preserved verbatim into `image_url` parts —
//! the property spec §4.7 calls out by name ("a multimodal request's
//! image_url parts must not be collapsed into a text-only string by any
//! adapter that round-trips them").

mod types;

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
    RoutingMetadata, StreamChunk, StreamDelta, TokenUsage,
};

use types::{
    DashscopeContentPart, DashscopeMessage, DashscopeRequest, DashscopeResponse, DashscopeStreamChunk,
};

#[derive(Default)]
pub struct DashscopeAdapter;

impl DashscopeAdapter {
    pub fn new() -> Self {
        Self
    }

    fn convert_message(msg: &ChatMessage) -> DashscopeMessage {
        DashscopeMessage {
            role: match msg.role {
                MessageRole::System => "system".to_string(),
                MessageRole::Assistant => "assistant".to_string(),
                MessageRole::Tool => "tool".to_string(),
                MessageRole::User => "user".to_string(),
            },
            content: msg
                .content
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => DashscopeContentPart::Text { text: text.clone() },
                    ContentPart::ImageUrl { url, .. } => DashscopeContentPart::ImageUrl {
                        image_url: types::DashscopeImageUrl { url: url.clone() },
                    },
                })
                .collect(),
        }
    }

    fn convert_request(&self, upstream_model: &str, request: &NormalizedRequest) -> DashscopeRequest {
        DashscopeRequest {
            model: upstream_model.to_string(),
            messages: request.messages.iter().map(Self::convert_message).collect(),
            temperature: request.temperature.map(|t| t as f64),
            max_tokens: request.max_tokens,
            stream: if request.stream { Some(true) } else { None },
        }
    }

    fn handle_error_response(&self, status: u16, body: &str) -> RouterError {
        let context = ErrorContext::default();
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("message")?.as_str().map(str::to_string))
            .unwrap_or_else(|| body.to_string());

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
impl ProviderAdapter for DashscopeAdapter {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_streaming: true,
            supports_tools: false,
            supports_response_format: false,
            supports_vision: true,
        }
    }

    fn token_count(&self, _messages: &[ChatMessage]) -> Option<u32> {
        None
    }

    fn validate_environment(&self, credentials: &Credentials) -> RouterResult<HeaderMap> {
        let api_key = credentials.api_key.as_deref().ok_or_else(|| RouterError::Authentication {
            message: "missing api_key for dashscope deployment".to_string(),
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
            url: format!("{base_url}/compatible-mode/v1/chat/completions"),
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
            .map_err(|e| RouterError::Internal(format!("malformed dashscope response: {e}")))
    }

    fn transform_response(
        &self,
        wire_response: serde_json::Value,
        _upstream_model: &str,
    ) -> RouterResult<NormalizedResponse> {
        let parsed: DashscopeResponse = serde_json::from_value(wire_response)
            .map_err(|e| RouterError::Internal(format!("malformed dashscope response: {e}")))?;

        let choices = parsed
            .choices
            .into_iter()
            .map(|c| ResponseChoice {
                index: c.index,
                message: ChatMessage {
                    role: MessageRole::Assistant,
                    content: vec![ContentPart::text(c.message.content)],
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                },
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
                provider: "dashscope".to_string(),
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

        let parsed: DashscopeStreamChunk = serde_json::from_str(raw_frame)
            .map_err(|e| RouterError::Internal(format!("malformed dashscope stream chunk: {e}")))?;

        state.model = parsed.model.clone();

        Ok(Some(StreamChunk {
            id: parsed.id,
            created: parsed.created,
            model: parsed.model,
            choices: parsed
                .choices
                .into_iter()
                .map(|c| StreamDelta {
                    index: c.index,
                    role: None,
                    content: c.delta.content,
                    reasoning_content: None,
                    tool_calls: None,
                    finish_reason: c.finish_reason,
                })
                .collect(),
            usage: parsed.usage.map(|u| TokenUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
                cost: None,
            }),
        }))
    }
}
