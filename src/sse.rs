//! Generic SSE framing shared by every streaming adapter.
//!
//! Adapted from the teacher's hand-rolled `SSEParser`
//! (`src/llm/sse.rs`) — same double-newline event-boundary algorithm — but
//! narrowed to just the `data:` field, since every provider this crate
//! talks to (OpenAI, Azure, Anthropic, Google, Dashscope) puts its whole
//! payload there and none of the adapters need the SSE `event:`/`id:`
//! fields once `data:` carries a `"type"` discriminator of its own.

use futures::{Stream, StreamExt};

use crate::error::RouterResult;

/// Incremental double-newline-delimited SSE parser. One instance per open
/// stream; `push` is called once per received network chunk.
#[derive(Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a raw chunk in, returns however many complete `data:` payloads
    /// it produced (zero, one, or several if the chunk closed out more than
    /// one event).
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);

        let mut payloads = Vec::new();
        while let Some(boundary) = self.buffer.find("\n\n") {
            let block = self.buffer[..boundary].to_string();
            self.buffer.drain(..boundary + 2);
            if let Some(payload) = parse_data_payload(&block) {
                payloads.push(payload);
            }
        }
        payloads
    }
}

fn parse_data_payload(block: &str) -> Option<String> {
    let mut data_lines = Vec::new();
    for line in block.lines() {
        let line = line.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            continue;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim_start().to_string());
        }
        // event:/id:/retry: fields are intentionally ignored — see module doc.
    }
    if data_lines.is_empty() {
        None
    } else {
        Some(data_lines.join("\n"))
    }
}

/// Wraps a raw byte-chunk stream (already UTF-8-decoded) into a stream of
/// individual `data:` payloads, handling chunks that split an event across
/// network reads.
pub fn sse_lines<S>(byte_stream: S) -> impl Stream<Item = RouterResult<String>> + Send
where
    S: Stream<Item = RouterResult<String>> + Send + 'static,
{
    byte_stream
        .scan(SseParser::new(), |parser, chunk| {
            let out: Vec<RouterResult<String>> = match chunk {
                Ok(s) => parser.push(&s).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            futures::future::ready(Some(out))
        })
        .flat_map(futures::stream::iter)
}

/// Incremental newline-delimited-JSON framer, for providers (Ollama) that
/// stream one JSON object per line rather than SSE `data:` frames.
#[derive(Default)]
pub struct NdjsonParser {
    buffer: String,
}

impl NdjsonParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.buffer.push_str(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line = self.buffer[..pos].trim().to_string();
            self.buffer.drain(..=pos);
            if !line.is_empty() {
                lines.push(line);
            }
        }
        lines
    }
}

/// Same framing contract as [`sse_lines`] but for newline-delimited JSON.
pub fn ndjson_lines<S>(byte_stream: S) -> impl Stream<Item = RouterResult<String>> + Send
where
    S: Stream<Item = RouterResult<String>> + Send + 'static,
{
    byte_stream
        .scan(NdjsonParser::new(), |parser, chunk| {
            let out: Vec<RouterResult<String>> = match chunk {
                Ok(s) => parser.push(&s).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            };
            futures::future::ready(Some(out))
        })
        .flat_map(futures::stream::iter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_chunk_with_one_complete_event() {
        let mut parser = SseParser::new();
        let payloads = parser.push("data: {\"a\":1}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn event_split_across_two_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push("data: {\"a\"").is_empty());
        let payloads = parser.push(":1}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn multiline_data_is_joined_with_newline() {
        let mut parser = SseParser::new();
        let payloads = parser.push("data: line1\ndata: line2\n\n");
        assert_eq!(payloads, vec!["line1\nline2".to_string()]);
    }

    #[test]
    fn comment_lines_are_ignored() {
        let mut parser = SseParser::new();
        let payloads = parser.push(": heartbeat\ndata: {\"a\":1}\n\n");
        assert_eq!(payloads, vec!["{\"a\":1}".to_string()]);
    }

    #[test]
    fn ndjson_parser_splits_on_newline() {
        let mut parser = NdjsonParser::new();
        let lines = parser.push("{\"a\":1}\n{\"a\":2}\n");
        assert_eq!(lines, vec!["{\"a\":1}".to_string(), "{\"a\":2}".to_string()]);
    }

    #[test]
    fn ndjson_parser_buffers_partial_line() {
        let mut parser = NdjsonParser::new();
        assert!(parser.push("{\"a\":1").is_empty());
        let lines = parser.push("}\n");
        assert_eq!(lines, vec!["{\"a\":1}".to_string()]);
    }
}
