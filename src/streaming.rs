//! Streaming chunk aggregator (spec §4.8).
//!
//! Consumes the normalized [`StreamChunk`] sequence a [`crate::providers::ProviderAdapter`]
//! produces and does two things with it: (a) rewrites each chunk into the
//! corrected wire shape the client is promised (non-null terminal
//! `delta.content`) and (b) accumulates a [`NormalizedResponse`] equivalent
//! to what the non-streaming call would have returned, for logging and
//! usage accounting.
//!
//! No teacher file covers this — the teacher's streaming path
//! (`src/llm/providers/*/client.rs`) forwards provider SSE frames directly
//! to the client without reconstructing a final response. This module is
//! new, grounded on the normalized [`StreamChunk`]/[`StreamDelta`] shapes
//! in `crate::types` and the reconstruction rules spec.md §4.8 spells out
//! chunk-by-chunk.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;

use crate::types::{
    ChatMessage, ContentPart, MessageRole, NormalizedResponse, ResponseChoice, RoutingMetadata,
    StreamChunk, TokenUsage, ToolCall,
};

#[derive(Debug, Default)]
struct ToolCallAccumulator {
    id: Option<String>,
    kind: Option<String>,
    function_name: Option<String>,
    arguments: String,
}

#[derive(Debug, Default)]
struct ChoiceAccumulator {
    role: Option<MessageRole>,
    content: String,
    reasoning_content: String,
    saw_reasoning: bool,
    tool_calls: BTreeMap<u32, ToolCallAccumulator>,
    finish_reason: Option<String>,
}

/// Per-stream reconstruction state. One instance per open stream, mirroring
/// the fresh-per-stream contract `ProviderAdapter::transform_stream_chunk`
/// gets for its own state (spec §4.7).
#[derive(Debug, Default)]
pub struct StreamingAggregator {
    id: String,
    created: u64,
    model: String,
    choices: BTreeMap<u32, ChoiceAccumulator>,
    /// Many providers (OpenRouter, some Bedrock paths) emit `usage` only on
    /// a trailing chunk; the last non-null one wins (spec §4.8 item 2
    /// "Usage").
    usage: Option<TokenUsage>,
}

impl StreamingAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one chunk into the running reconstruction and returns the
    /// chunk the client should actually see — identical to the input
    /// except for the spec §4.8 correction: a delta whose `finish_reason`
    /// is set but whose `content` is `None`/absent becomes `content =
    /// Some("")`, never null (spec §8 property 6).
    pub fn ingest(&mut self, chunk: &StreamChunk) -> StreamChunk {
        if self.id.is_empty() {
            self.id = chunk.id.clone();
            self.created = chunk.created;
        }
        if !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }
        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }

        let mut corrected_choices = Vec::with_capacity(chunk.choices.len());
        for delta in &chunk.choices {
            let acc = self.choices.entry(delta.index).or_default();

            if let Some(role) = delta.role {
                if acc.role.is_none() {
                    acc.role = Some(role);
                }
            }
            if let Some(content) = &delta.content {
                acc.content.push_str(content);
            }
            if let Some(reasoning) = &delta.reasoning_content {
                acc.reasoning_content.push_str(reasoning);
                acc.saw_reasoning = true;
            }
            if let Some(tool_calls) = &delta.tool_calls {
                for tc in tool_calls {
                    let entry = acc.tool_calls.entry(tc.index).or_default();
                    // `id`/`type`/`function.name` come from the first chunk
                    // that provides them; a later chunk repeating them just
                    // overwrites with its (matching, or — per spec §4.8 —
                    // winning) value (spec §4.8 item 2 "Tool calls").
                    if let Some(id) = &tc.id {
                        entry.id = Some(id.clone());
                    }
                    if let Some(kind) = &tc.kind {
                        entry.kind = Some(kind.clone());
                    }
                    if let Some(name) = &tc.function_name {
                        entry.function_name = Some(name.clone());
                    }
                    if let Some(fragment) = &tc.function_arguments_fragment {
                        entry.arguments.push_str(fragment);
                    }
                }
            }
            if let Some(finish_reason) = &delta.finish_reason {
                acc.finish_reason = Some(finish_reason.clone());
            }

            let mut corrected = delta.clone();
            if corrected.finish_reason.is_some() && corrected.content.is_none() {
                corrected.content = Some(String::new());
            }
            corrected_choices.push(corrected);
        }

        StreamChunk {
            id: chunk.id.clone(),
            created: chunk.created,
            model: chunk.model.clone(),
            choices: corrected_choices,
            usage: chunk.usage.clone(),
        }
    }

    /// Builds the reconstructed response equivalent to what a non-streaming
    /// call would have returned (spec §4.8 item 1).
    pub fn finalize(&self) -> NormalizedResponse {
        let mut choices: Vec<ResponseChoice> = self
            .choices
            .iter()
            .map(|(index, acc)| {
                let tool_calls = if acc.tool_calls.is_empty() {
                    None
                } else {
                    Some(
                        acc.tool_calls
                            .values()
                            .map(|t| ToolCall {
                                id: t.id.clone().unwrap_or_default(),
                                kind: t.kind.clone().unwrap_or_default(),
                                function_name: t.function_name.clone().unwrap_or_default(),
                                function_arguments: t.arguments.clone(),
                            })
                            .collect(),
                    )
                };

                ResponseChoice {
                    index: *index,
                    message: ChatMessage {
                        role: acc.role.unwrap_or(MessageRole::Assistant),
                        content: vec![ContentPart::text(acc.content.clone())],
                        name: None,
                        tool_calls,
                        tool_call_id: None,
                    },
                    finish_reason: acc.finish_reason.clone(),
                }
            })
            .collect();

        if choices.is_empty() {
            // A stream that only ever emitted usage-only trailing chunks
            // (spec §4.8 edge case) still needs a well-formed response.
            choices.push(ResponseChoice {
                index: 0,
                message: ChatMessage {
                    role: MessageRole::Assistant,
                    content: vec![ContentPart::text(String::new())],
                    name: None,
                    tool_calls: None,
                    tool_call_id: None,
                },
                finish_reason: None,
            });
        }

        let reasoning_content = self
            .choices
            .values()
            .find(|acc| acc.saw_reasoning)
            .map(|acc| acc.reasoning_content.clone());

        NormalizedResponse {
            id: self.id.clone(),
            created: self.created,
            model: self.model.clone(),
            choices,
            usage: self.usage.clone().unwrap_or_default(),
            reasoning_content,
            provider_specific_fields: Default::default(),
            routing: RoutingMetadata {
                model_group: String::new(),
                deployment_id: String::new(),
                provider: String::new(),
                attempted_groups: Vec::new(),
                retry_count: 0,
                latency_ms: 0,
            },
        }
    }
}

/// Terminal event a stream yields after its last chunk (spec §3 "Stream
/// yields a sequence of `StreamChunk` objects plus a terminal
/// `StreamEnd(usage, finish_reason)`").
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    End {
        usage: TokenUsage,
        finish_reason: Option<String>,
        response: Box<NormalizedResponse>,
    },
}

/// Minimal `futures::Stream` wrapper around an unbounded mpsc receiver, so
/// the single streaming task (spec §5 "streaming uses a single task that
/// reads from the upstream client and writes to the downstream sink") can
/// hand its output to callers as a plain `Stream` without pulling in
/// `tokio-stream` for the one adapter this crate needs.
pub struct ReceiverStream<T> {
    inner: mpsc::UnboundedReceiver<T>,
}

impl<T> ReceiverStream<T> {
    pub fn new(inner: mpsc::UnboundedReceiver<T>) -> Self {
        Self { inner }
    }
}

impl<T> futures::Stream for ReceiverStream<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.inner.poll_recv(cx)
    }
}
