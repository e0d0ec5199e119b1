//! Provider-agnostic request/response contract (spec §3, §4.7)
//!
//! These are the shapes the Router hands to a [`crate::providers::ProviderAdapter`]
//! and gets back. Provider-specific wire formats live only inside adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// The kind of call being routed. Drives fallback-chain selection and the
/// prompt-cache affinity call-type allow-list (spec §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointKind {
    Completion,
    AnthropicMessages,
    Embedding,
    ImageGeneration,
    AudioSpeech,
    AudioTranscription,
    Responses,
}

impl EndpointKind {
    /// Call types the prompt-cache affinity hook is allowed to write for
    /// (spec §4.4: the original filter excluded `anthropic_messages`; this
    /// is the corrected allow-list).
    pub fn writes_prompt_cache_affinity(self) -> bool {
        matches!(self, EndpointKind::Completion | EndpointKind::AnthropicMessages)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One part of a (possibly multimodal) message's content.
///
/// Kept as a vector of parts rather than a single string so that
/// `transform_request` / `transform_response` round-trips preserve
/// `image_url` parts verbatim (spec §4.7, property 9 — e.g. Dashscope's
/// `qwen3-vl-plus`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { url: String, detail: Option<String> },
}

impl ContentPart {
    pub fn text(s: impl Into<String>) -> Self {
        ContentPart::Text { text: s.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub kind: String,
    pub function_name: String,
    pub function_arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub content: Vec<ContentPart>,
    pub name: Option<String>,
    pub tool_calls: Option<Vec<ToolCall>>,
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentPart::text(text)],
            name: None,
            tool_calls: None,
            tool_call_id: None,
        }
    }

    /// Concatenation of all text parts, ignoring non-text parts. Used for
    /// token estimation and prompt-cache fingerprinting.
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.as_str()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamOptions {
    pub include_usage: bool,
}

/// The normalized request the Router passes to a [`crate::providers::ProviderAdapter`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedRequest {
    pub request_id: Uuid,
    pub endpoint_kind: EndpointKind,
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Option<Vec<ToolDefinition>>,
    pub tool_choice: Option<serde_json::Value>,
    pub response_format: Option<serde_json::Value>,
    pub stream: bool,
    pub stream_options: Option<StreamOptions>,
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub reasoning_effort: Option<String>,
    pub extra_body: HashMap<String, serde_json::Value>,
    pub extra_headers: HashMap<String, String>,
    pub timeout_s: Option<u64>,
    /// Request-level retry override (spec §4.6.1). `None` means "defer to
    /// deployment/router default".
    pub num_retries_override: Option<u32>,
    /// Caller-requested region, used by the region-allowlist pre-call check.
    pub requested_region: Option<String>,
    /// Caller-requested tags, used by the tag-match pre-call check.
    pub required_tags: Vec<String>,
    /// Test-only: force a synthetic timeout without hitting the network
    /// (spec §5 — a supported contract, not a debugging aid).
    pub mock_timeout: bool,
    /// Test-only: return this canned response instead of calling upstream.
    pub mock_response: Option<String>,
}

impl NormalizedRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            endpoint_kind: EndpointKind::Completion,
            model: model.into(),
            messages,
            tools: None,
            tool_choice: None,
            response_format: None,
            stream: false,
            stream_options: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            reasoning_effort: None,
            extra_body: HashMap::new(),
            extra_headers: HashMap::new(),
            timeout_s: None,
            num_retries_override: None,
            requested_region: None,
            required_tags: Vec::new(),
            mock_timeout: false,
            mock_response: None,
        }
    }

    /// Best-effort estimate of prompt tokens; used only by pre-call checks
    /// that tolerate an unavailable estimate (spec §4.4 item 2, 5).
    pub fn estimate_prompt_tokens(&self) -> Option<u32> {
        let chars: usize = self.messages.iter().map(|m| m.text_content().len()).sum();
        // Coarse chars-per-token heuristic; adapters with a real tokenizer
        // override this via `ProviderAdapter::token_count`.
        Some(((chars as f64) / 4.0).ceil() as u32)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    /// Provider-reported cost (e.g. OpenRouter's `usage.cost`). `None` means
    /// "not reported"; `Some(0.0)` means "reported as zero" — these are
    /// distinct (spec §4.8, §9, property 7).
    pub cost: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: Option<String>,
}

/// Everything the Router attaches to a response for observability. Not part
/// of the provider wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingMetadata {
    pub model_group: String,
    pub deployment_id: String,
    pub provider: String,
    pub attempted_groups: Vec<String>,
    pub retry_count: u32,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedResponse {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ResponseChoice>,
    pub usage: TokenUsage,
    /// Reasoning content, for providers that separate it from normal
    /// content (spec §4.8 item 2 "Reasoning content").
    pub reasoning_content: Option<String>,
    pub provider_specific_fields: HashMap<String, serde_json::Value>,
    pub routing: RoutingMetadata,
}

/// One partial update in a streamed response (spec §3, §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamDelta {
    pub index: u32,
    pub role: Option<MessageRole>,
    /// `Some("")` is a meaningful value distinct from `None` — see spec
    /// §4.8 rule on the terminal chunk's content.
    pub content: Option<String>,
    pub reasoning_content: Option<String>,
    pub tool_calls: Option<Vec<StreamToolCallDelta>>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamToolCallDelta {
    pub index: u32,
    pub id: Option<String>,
    pub kind: Option<String>,
    pub function_name: Option<String>,
    pub function_arguments_fragment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamChunk {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<StreamDelta>,
    /// Present only on the (often trailing, choices-empty) usage chunk that
    /// some providers emit (spec §4.8 edge case).
    pub usage: Option<TokenUsage>,
}

/// Per-request, short-lived record emitted to external logging sinks
/// (spec §3 UsagePayload). The Router never persists this itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsagePayload {
    pub model_group: String,
    pub request_id: Uuid,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub cost: Option<f64>,
    pub cache_hit: bool,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub deployment_id: String,
    pub provider: String,
    pub model_id: String,
}
