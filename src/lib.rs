//! A multi-provider LLM gateway Router core: deployment registry,
//! health-aware selection, retry/fallback across deployments and model
//! groups, pre-call filtering, and streaming response aggregation.
//!
//! This crate implements the Router's routing/retry/health/streaming
//! decisions; it does not implement provider wire protocols beyond the
//! handful of built-in adapters in [`providers`], and it does not serve
//! HTTP itself — both are left to a host process (spec §1).
//!
//! ## Layout
//!
//! - [`types`] — the provider-agnostic request/response contract.
//! - [`config`] — deployment and router-level configuration shapes.
//! - [`error`] — the `RouterError` taxonomy and its cooldown classification.
//! - [`cache`] — the two-tier (local + optional shared) key/value store.
//! - [`registry`] — the deployment registry and model-info resolution.
//! - [`health`] — per-deployment failure tracking and the cooldown state
//!   machine.
//! - [`precall`] — the ordered pre-call filter pipeline.
//! - [`strategies`] — the routing strategy family.
//! - [`retry`] — the retry/fallback engine tying the above together.
//! - [`sse`] / [`streaming`] — SSE/NDJSON framing and stream-chunk
//!   aggregation.
//! - [`usage`] — Cache-backed rolling rpm/tpm counters for rate-limit
//!   headroom checks and usage-based routing.
//! - [`providers`] — the `ProviderAdapter` trait and built-in adapters.
//! - [`facade`] — [`Router`], the public entry point.
//! - [`background`] — periodic loops a long-running Router keeps alive.

pub mod background;
pub mod cache;
pub mod config;
pub mod error;
pub mod facade;
pub mod health;
pub mod precall;
pub mod providers;
pub mod registry;
pub mod retry;
pub mod sse;
pub mod strategies;
pub mod streaming;
pub mod types;
pub mod usage;

pub use cache::Cache;
pub use config::{DeploymentConfigEntry, DeploymentParams, RouterConfig};
pub use error::{RouterError, RouterResult};
pub use facade::{Router, RouterOptions};
pub use health::{HealthConfig, HealthTracker};
pub use providers::{AdapterRegistry, ProviderAdapter, ProviderKind};
pub use registry::{Deployment, DeploymentRegistry, ModelInfoLookup, ResolvedModelInfo};
pub use retry::RetryFallbackEngine;
pub use streaming::StreamEvent;
pub use types::{
    ChatMessage, ContentPart, EndpointKind, NormalizedRequest, NormalizedResponse, ResponseChoice,
    RoutingMetadata, StreamChunk, StreamDelta, TokenUsage, ToolCall, ToolDefinition, UsagePayload,
};
