//! Provider adapters (spec §4.7) — the only place provider wire formats are known.
//!
//! Each submodule mirrors the teacher's per-provider layout
//! (`client.rs` does the HTTP call, `config.rs` holds model/cost tables,
//! `types.rs` holds the provider's wire shapes). A provider is looked up by
//! its [`ProviderKind`] tag; unknown tags fail at config load (spec §9
//! "Duck-typed adapter discovery" → registry keyed by enum).

pub mod adapter;
pub mod anthropic;
pub mod azure;
pub mod dashscope;
pub mod google;
pub mod ollama;
pub mod openai;
pub mod vllm;

pub use adapter::{Capabilities, ProviderAdapter, StreamState, WireRequest};

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Provider tag (spec §3). Deployments are tagged with one of these;
/// `Custom` covers the long tail spec.md lists (hyperbolic, inference,
/// heroku, wandb, snowflake, nebius, openrouter, vertex_ai, bedrock,
/// cohere, mistral, groq, together, replicate, …) that this crate does not
/// ship a concrete adapter for but whose deployments can still be
/// registered once a host process supplies one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAI,
    Azure,
    Anthropic,
    Google,
    Gemini,
    Ollama,
    #[serde(rename = "vllm")]
    VLlm,
    Dashscope,
    Custom(String),
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderKind::OpenAI => write!(f, "openai"),
            ProviderKind::Azure => write!(f, "azure"),
            ProviderKind::Anthropic => write!(f, "anthropic"),
            ProviderKind::Google => write!(f, "google"),
            ProviderKind::Gemini => write!(f, "gemini"),
            ProviderKind::Ollama => write!(f, "ollama"),
            ProviderKind::VLlm => write!(f, "vllm"),
            ProviderKind::Dashscope => write!(f, "dashscope"),
            ProviderKind::Custom(name) => write!(f, "custom-{name}"),
        }
    }
}

/// Registry of adapters, populated once at process start (spec §9: "link
/// adapters into a registry at process start; there is no analogous
/// load-time cost to optimize" — unlike the source's lazy-module trick).
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<ProviderKind, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Registry with the built-in adapters this crate ships.
    pub fn with_builtin_adapters() -> Self {
        let mut registry = Self::new();
        registry.register(ProviderKind::OpenAI, Arc::new(openai::OpenAIAdapter::new()));
        registry.register(ProviderKind::Azure, Arc::new(azure::AzureAdapter::new()));
        registry.register(
            ProviderKind::Anthropic,
            Arc::new(anthropic::AnthropicAdapter::new()),
        );
        registry.register(ProviderKind::Google, Arc::new(google::GoogleAdapter::new()));
        registry.register(ProviderKind::Gemini, Arc::new(google::GoogleAdapter::new()));
        registry.register(ProviderKind::Ollama, Arc::new(ollama::OllamaAdapter::new()));
        registry.register(ProviderKind::VLlm, Arc::new(vllm::VLlmAdapter::new()));
        registry.register(
            ProviderKind::Dashscope,
            Arc::new(dashscope::DashscopeAdapter::new()),
        );
        registry
    }

    pub fn register(&mut self, kind: ProviderKind, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(kind, adapter);
    }

    pub fn get(&self, kind: &ProviderKind) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(kind).cloned()
    }
}
