//! Google Gemini adapter.
//!
//! Grounded on the teacher's `GoogleClient`
//! (`src/llm/providers/google/client.rs`): the `contents`/`parts` request
//! shape and `usageMetadata` response field carry over directly. Unlike the
//! teacher, the API key travels as a `?key=` query parameter rather than a
//! header (matching Gemini's actual auth scheme, which the teacher's header
//! builder never set for Google specifically either — `build_headers` there
//! only threads through custom headers).

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

use types::{GoogleContent, GooglePart, GoogleRequest, GoogleResponse, GoogleStreamChunk};

#[derive(Default)]
pub struct GoogleAdapter;

impl GoogleAdapter {
    pub fn new() -> Self {
        Self
    }

    fn convert_request(&self, request: &NormalizedRequest) -> GoogleRequest {
        let contents = request
            .messages
            .iter()
            .filter(|m| m.role != MessageRole::System)
            .map(|m| GoogleContent {
                parts: vec![GooglePart {
                    text: Some(m.text_content()),
                }],
                role: Some(match m.role {
                    MessageRole::Assistant => "model".to_string(),
                    _ => "user".to_string(),
                }),
            })
            .collect();

        GoogleRequest {
            contents,
            generation_config: Some(types::GoogleGenerationConfig {
                temperature: request.temperature.map(|t| t as f64),
                top_p: request.top_p.map(|p| p as f64),
                max_output_tokens: request.max_tokens,
            }),
        }
    }

    fn handle_error_response(&self, status: u16, body: &str) -> RouterError {
        let context = ErrorContext::default();
        let message = serde_json::from_str::<types::GoogleError>(body)
            .map(|e| e.error.message)
            .unwrap_or_else(|_| body.to_string());

        match status {
            401 | 403 => RouterError::Authentication {
                message,
                status_code: Some(status),
                context,
            },
            404 => RouterError::NotFound { message, context },
            429 => RouterError::RateLimit {
                message,
                retry_after_s: None,
                context,
            },
            400 => RouterError::BadRequest { message, context },
            _ => RouterError::Api {
                message,
                status_code: Some(status),
                context,
            },
        }
    }

    fn content_to_text(content: &Option<GoogleContent>) -> String {
        content
            .as_ref()
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.clone())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ProviderAdapter for GoogleAdapter {
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
        if credentials.api_key.is_none() {
            return Err(RouterError::Authentication {
                message: "missing api_key for google deployment".to_string(),
                status_code: None,
                context: ErrorContext::default(),
            });
        }
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
        let api_key = credentials.api_key.as_deref().unwrap_or_default();
        let body = serde_json::to_value(self.convert_request(request))
            .map_err(|e| RouterError::Internal(e.to_string()))?;
        Ok(WireRequest {
            url: format!("{base_url}/v1beta/models/{upstream_model}:generateContent?key={api_key}"),
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
            .map_err(|e| RouterError::Internal(format!("malformed google response: {e}")))
    }

    fn transform_response(
        &self,
        wire_response: serde_json::Value,
        upstream_model: &str,
    ) -> RouterResult<NormalizedResponse> {
        let parsed: GoogleResponse = serde_json::from_value(wire_response)
            .map_err(|e| RouterError::Internal(format!("malformed google response: {e}")))?;

        let candidate = parsed.candidates.into_iter().next();
        let (content, finish_reason) = match &candidate {
            Some(c) => (Self::content_to_text(&c.content), c.finish_reason.clone()),
            None => (String::new(), None),
        };

        let usage = parsed
            .usage_metadata
            .map(|u| TokenUsage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
                cost: None,
            })
            .unwrap_or_default();

        Ok(NormalizedResponse {
            id: format!("google-{}", uuid::Uuid::new_v4()),
            created: chrono::Utc::now().timestamp() as u64,
            model: upstream_model.to_string(),
            choices: vec![ResponseChoice {
                index: 0,
                message: ChatMessage {
                    role: MessageRole::Assistant,
                    content: vec![ContentPart::text(content)],
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                },
                finish_reason,
            }],
            usage,
            reasoning_content: None,
            provider_specific_fields: Default::default(),
            routing: RoutingMetadata {
                model_group: String::new(),
                deployment_id: String::new(),
                provider: "google".to_string(),
                attempted_groups: Vec::new(),
                retry_count: 0,
                latency_ms: 0,
            },
        })
    }

    fn transform_stream_request(
        &self,
        base_url: &str,
        upstream_model: &str,
        request: &NormalizedRequest,
        credentials: &Credentials,
    ) -> RouterResult<WireRequest> {
        let headers = self.validate_environment(credentials)?;
        let api_key = credentials.api_key.as_deref().unwrap_or_default();
        let body = serde_json::to_value(self.convert_request(request))
            .map_err(|e| RouterError::Internal(e.to_string()))?;
        Ok(WireRequest {
            url: format!(
                "{base_url}/v1beta/models/{upstream_model}:streamGenerateContent?alt=sse&key={api_key}"
            ),
            headers,
            body,
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
        let parsed: GoogleStreamChunk = serde_json::from_str(raw_frame)
            .map_err(|e| RouterError::Internal(format!("malformed google stream chunk: {e}")))?;

        let candidate = parsed.candidates.into_iter().next();
        let (content, finish_reason) = match &candidate {
            Some(c) => (Self::content_to_text(&c.content), c.finish_reason.clone()),
            None => (String::new(), None),
        };

        Ok(Some(StreamChunk {
            id: state.request_id.clone(),
            created: chrono::Utc::now().timestamp() as u64,
            model: state.model.clone(),
            choices: vec![StreamDelta {
                index: 0,
                role: None,
                content: Some(content),
                reasoning_content: None,
                tool_calls: None,
                finish_reason,
            }],
            usage: parsed.usage_metadata.map(|u| TokenUsage {
                prompt_tokens: u.prompt_token_count,
                completion_tokens: u.candidates_token_count,
                total_tokens: u.total_token_count,
                cost: None,
            }),
        }))
    }
}
