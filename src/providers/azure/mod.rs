//! Azure OpenAI adapter.
//!
//! The teacher never shipped an Azure client (SPEC_FULL.md Section B calls
//! this out as a supplemented feature), but Azure's chat-completions wire
//! format is identical to OpenAI's — only auth (`api-key` header instead of
//! `Authorization: Bearer`) and the URL shape (`/openai/deployments/{name}/chat/completions?api-version=...`)
//! differ. So this adapter is grounded on
//! [`crate::providers::openai::OpenAIAdapter`] directly, reusing its wire
//! types, with those two differences factored out.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
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

const DEFAULT_API_VERSION: &str = "2024-02-15-preview";

#[derive(Default)]
pub struct AzureAdapter;

impl AzureAdapter {
    pub fn new() -> Self {
        Self
    }

    fn convert_request(&self, request: &NormalizedRequest) -> OpenAIRequest {
        OpenAIRequest {
            // Azure's `model` field is ignored — the deployment name in the
            // URL path selects the model (spec §4.2 "Azure base_model
            // fallback" note: the deployment alias carries no model
            // identity of its own).
            model: String::new(),
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

    fn handle_error_response(&self, status: u16, body: &str) -> RouterError {
        let context = ErrorContext::default();
        let message = serde_json::from_str::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("error")?.get("message")?.as_str().map(str::to_string))
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
impl ProviderAdapter for AzureAdapter {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            supports_streaming: true,
            supports_tools: true,
            supports_response_format: true,
            supports_vision: true,
        }
    }

    fn token_count(&self, _messages: &[ChatMessage]) -> Option<u32> {
        None
    }

    fn validate_environment(&self, credentials: &Credentials) -> RouterResult<HeaderMap> {
        let api_key = credentials.api_key.as_deref().ok_or_else(|| RouterError::Authentication {
            message: "missing api_key for azure deployment".to_string(),
            status_code: None,
            context: ErrorContext::default(),
        })?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("api-key"),
            HeaderValue::from_str(api_key).map_err(|e| RouterError::Internal(e.to_string()))?,
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
        let api_version = credentials.api_version.as_deref().unwrap_or(DEFAULT_API_VERSION);
        let body = serde_json::to_value(self.convert_request(request))
            .map_err(|e| RouterError::Internal(e.to_string()))?;
        Ok(WireRequest {
            // `upstream_model` here is the Azure *deployment name*, not a
            // model identifier — it's caller-chosen and may be anything.
            url: format!(
                "{base_url}/openai/deployments/{upstream_model}/chat/completions?api-version={api_version}"
            ),
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
            .map_err(|e| RouterError::Internal(format!("malformed azure response: {e}")))
    }

    fn transform_response(
        &self,
        wire_response: serde_json::Value,
        upstream_model: &str,
    ) -> RouterResult<NormalizedResponse> {
        let parsed: OpenAIResponse = serde_json::from_value(wire_response)
            .map_err(|e| RouterError::Internal(format!("malformed azure response: {e}")))?;

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
            model: upstream_model.to_string(),
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
                provider: "azure".to_string(),
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
        self.transform_request(base_url, upstream_model, request, credentials)
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
            .map_err(|e| RouterError::Internal(format!("malformed azure stream chunk: {e}")))?;

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
            model: state.model.clone(),
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_api_key_header_not_bearer_auth() {
        let adapter = AzureAdapter::new();
        let creds = Credentials {
            api_key: Some("azure-key".to_string()),
            ..Credentials::default()
        };
        let headers = adapter.validate_environment(&creds).unwrap();
        assert_eq!(headers.get("api-key").unwrap(), "azure-key");
        assert!(!headers.contains_key(reqwest::header::AUTHORIZATION));
    }

    #[test]
    fn url_embeds_deployment_name_and_api_version() {
        let adapter = AzureAdapter::new();
        let creds = Credentials {
            api_key: Some("k".to_string()),
            api_version: Some("2024-06-01".to_string()),
            ..Credentials::default()
        };
        let request = NormalizedRequest::new("my-deployment", vec![ChatMessage::user("hi")]);
        let wire = adapter
            .transform_request("https://my-resource.openai.azure.com", "my-deployment", &request, &creds)
            .unwrap();
        assert!(wire.url.contains("/openai/deployments/my-deployment/chat/completions"));
        assert!(wire.url.contains("api-version=2024-06-01"));
    }

    #[test]
    fn missing_api_version_falls_back_to_default() {
        let adapter = AzureAdapter::new();
        let creds = Credentials {
            api_key: Some("k".to_string()),
            ..Credentials::default()
        };
        let request = NormalizedRequest::new("my-deployment", vec![ChatMessage::user("hi")]);
        let wire = adapter
            .transform_request("https://my-resource.openai.azure.com", "my-deployment", &request, &creds)
            .unwrap();
        assert!(wire.url.contains(DEFAULT_API_VERSION));
    }
}
