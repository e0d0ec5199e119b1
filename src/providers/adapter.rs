//! The narrow contract the Router uses to talk to any provider (spec §4.7).
//!
//! Each provider implements this independently; the Router never inspects a
//! provider's wire format beyond what crosses this boundary.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use std::time::Duration;

use crate::config::Credentials;
use crate::error::RouterResult;
use crate::types::{ChatMessage, NormalizedRequest, NormalizedResponse, StreamChunk};

/// Per-stream state handed fresh to `transform_stream_chunk` for each new
/// stream (spec §4.7: "stateful per-stream; the Router gives each stream a
/// fresh state object").
#[derive(Debug, Default)]
pub struct StreamState {
    pub request_id: String,
    pub model: String,
    /// Provider-specific scratch space (e.g. accumulating a partial JSON
    /// object across SSE frames).
    pub scratch: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Capabilities {
    pub supports_streaming: bool,
    pub supports_tools: bool,
    pub supports_response_format: bool,
    pub supports_vision: bool,
}

/// A single upstream call, already wire-encoded and ready to send.
pub struct WireRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: serde_json::Value,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn capabilities(&self) -> Capabilities;

    /// Best-effort token count for a prompt. `None` means "no tokenizer
    /// available" — pre-call checks must not drop a candidate on `None`
    /// (spec §4.4 item 2).
    fn token_count(&self, messages: &[ChatMessage]) -> Option<u32>;

    /// Pure, idempotent: build request headers from credentials. Must
    /// perform no I/O (spec §4.7 contract).
    fn validate_environment(&self, credentials: &Credentials) -> RouterResult<HeaderMap>;

    /// Translate a normalized request into a ready-to-send wire request
    /// for a single, unary (non-streaming) call.
    fn transform_request(
        &self,
        base_url: &str,
        upstream_model: &str,
        request: &NormalizedRequest,
        credentials: &Credentials,
    ) -> RouterResult<WireRequest>;

    /// Execute one unary call and return the raw provider JSON body.
    async fn execute(
        &self,
        client: &reqwest::Client,
        wire: WireRequest,
        timeout: Duration,
    ) -> RouterResult<serde_json::Value>;

    /// Translate the raw provider JSON body into the normalized shape.
    /// Must preserve structural content — including `image_url` parts for
    /// multimodal models (spec §4.7, property 9).
    fn transform_response(
        &self,
        wire_response: serde_json::Value,
        upstream_model: &str,
    ) -> RouterResult<NormalizedResponse>;

    /// Same as `transform_request` but for the streaming variant of the
    /// same endpoint (e.g. sets `stream: true`).
    fn transform_stream_request(
        &self,
        base_url: &str,
        upstream_model: &str,
        request: &NormalizedRequest,
        credentials: &Credentials,
    ) -> RouterResult<WireRequest> {
        self.transform_request(base_url, upstream_model, request, credentials)
    }

    /// Open the stream; returns raw SSE/line frames as they arrive.
    async fn execute_stream(
        &self,
        client: &reqwest::Client,
        wire: WireRequest,
        connect_timeout: Duration,
    ) -> RouterResult<std::pin::Pin<Box<dyn futures::Stream<Item = RouterResult<String>> + Send>>>;

    /// Translate one raw frame into zero-or-one normalized chunks. Stateful
    /// per-stream via `state` (spec §4.7).
    fn transform_stream_chunk(
        &self,
        raw_frame: &str,
        state: &mut StreamState,
    ) -> RouterResult<Option<StreamChunk>>;
}
