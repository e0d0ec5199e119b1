//! Dashscope (Alibaba) wire format — OpenAI-compatible chat completions
//! with OpenAI-vision-style multipart content, used for multimodal models
//! such as `qwen3-vl-plus`. New module; no teacher file covers this
//! provider (see `SPEC_FULL.md` Section B "Dashscope image-part
//! preservation").

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct DashscopeRequest {
    pub model: String,
    pub messages: Vec<DashscopeMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DashscopeMessage {
    pub role: String,
    pub content: Vec<DashscopeContentPart>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DashscopeContentPart {
    Text { text: String },
    ImageUrl { image_url: DashscopeImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashscopeImageUrl {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct DashscopeResponse {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<DashscopeChoice>,
    pub usage: DashscopeUsage,
}

#[derive(Debug, Deserialize)]
pub struct DashscopeChoice {
    pub index: u32,
    pub message: DashscopeResponseMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DashscopeResponseMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct DashscopeUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

#[derive(Debug, Deserialize)]
pub struct DashscopeStreamChunk {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<DashscopeStreamChoice>,
    #[serde(default)]
    pub usage: Option<DashscopeUsage>,
}

#[derive(Debug, Deserialize)]
pub struct DashscopeStreamChoice {
    pub index: u32,
    pub delta: DashscopeDelta,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DashscopeDelta {
    #[serde(default)]
    pub content: Option<String>,
}
