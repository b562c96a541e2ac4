//! Line framing, chunk parsing and aggregation for upstream completion streams.

use bytes::{Bytes, BytesMut};
use serde_json::{Map, Value};

use crate::openai::{
    AssistantMessage, ChatCompletion, CompletionChoice, OutputText, ResponseOutput,
    ResponsesResponse, ResponsesUsage, StreamChunk, Usage, unix_nanos, unix_now,
};

pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Longest upstream line accepted before the stream is abandoned.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
#[error("upstream line exceeds {max} bytes")]
pub struct LineTooLong {
    pub max: usize,
}

/// Reassembles newline-delimited lines from arbitrarily split network frames.
/// Bytes already searched for a newline are not scanned again.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    scanned: usize,
    max_line: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn with_max_line(max_line: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            scanned: 0,
            max_line,
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<String>, LineTooLong> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') {
            let line = self.buf.split_to(self.scanned + offset + 1);
            self.scanned = 0;
            let line = &line[..line.len() - 1];
            if line.len() > self.max_line {
                return Err(LineTooLong { max: self.max_line });
            }
            lines.push(decode_line(line));
        }
        self.scanned = self.buf.len();
        if self.buf.len() > self.max_line {
            return Err(LineTooLong { max: self.max_line });
        }
        Ok(lines)
    }

    /// The trailing line that never saw a newline, if any.
    pub fn finish(&mut self) -> Option<String> {
        self.scanned = 0;
        if self.buf.is_empty() {
            return None;
        }
        let line = self.buf.split();
        Some(decode_line(&line))
    }
}

fn decode_line(line: &[u8]) -> String {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

#[derive(Debug, Clone, PartialEq)]
pub enum DirectLine {
    Blank,
    Done,
    Chunk(StreamChunk),
    /// Not JSON, or an SSE field other than `data`.
    Malformed,
}

pub fn parse_direct_line(line: &str) -> DirectLine {
    let line = line.trim();
    if line.is_empty() {
        return DirectLine::Blank;
    }
    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None => line,
    };
    if payload == "[DONE]" {
        return DirectLine::Done;
    }
    match serde_json::from_str::<StreamChunk>(payload) {
        Ok(chunk) => DirectLine::Chunk(chunk),
        Err(_) => DirectLine::Malformed,
    }
}

/// SSE framing for a direct upstream line. Lines that already carry an SSE
/// field pass through verbatim; bare JSON gets a `data: ` prefix.
pub fn forward_line(line: &str) -> Option<Bytes> {
    if line.trim().is_empty() {
        return None;
    }
    let is_sse_field = ["data:", "event:", "id:", "retry:", ":"]
        .iter()
        .any(|p| line.starts_with(p));
    let framed = if is_sse_field {
        format!("{line}\n\n")
    } else {
        format!("data: {line}\n\n")
    };
    Some(Bytes::from(framed))
}

pub fn sse_frame(chunk: &StreamChunk) -> Bytes {
    match serde_json::to_string(chunk) {
        Ok(json) => Bytes::from(format!("data: {json}\n\n")),
        Err(_) => Bytes::new(),
    }
}

/// Folds a chunk stream into one completion.
#[derive(Debug, Default)]
pub struct ChatAggregator {
    id: String,
    model: String,
    content: String,
    reasoning: String,
    finish_reason: Option<String>,
    usage: Option<Usage>,
    chunks: usize,
}

impl ChatAggregator {
    pub fn push(&mut self, chunk: &StreamChunk) {
        self.chunks += 1;
        if self.id.is_empty() && !chunk.id.is_empty() {
            self.id = chunk.id.clone();
        }
        if self.model.is_empty() && !chunk.model.is_empty() {
            self.model = chunk.model.clone();
        }
        for choice in &chunk.choices {
            if let Some(c) = &choice.delta.content {
                self.content.push_str(c);
            }
            if let Some(r) = &choice.delta.reasoning_content {
                self.reasoning.push_str(r);
            }
            if let Some(f) = &choice.finish_reason {
                self.finish_reason = Some(f.clone());
            }
        }
        if let Some(u) = &chunk.usage {
            self.usage = Some(u.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty() && self.reasoning.is_empty()
    }

    pub fn content_len(&self) -> usize {
        self.content.len()
    }

    pub fn reasoning_len(&self) -> usize {
        self.reasoning.len()
    }

    pub fn chunks(&self) -> usize {
        self.chunks
    }

    pub fn total_tokens(&self) -> u64 {
        self.usage.as_ref().map(|u| u.total_tokens).unwrap_or(0)
    }

    pub fn summary(&self) -> String {
        format!(
            "content={} reasoning={} tokens={}",
            self.content_len(),
            self.reasoning_len(),
            self.total_tokens()
        )
    }

    fn model_or(&self, fallback: &str) -> String {
        if self.model.is_empty() {
            fallback.to_string()
        } else {
            self.model.clone()
        }
    }

    fn id_or_generated(&self) -> String {
        if self.id.is_empty() {
            format!("chatcmpl-{}", unix_nanos())
        } else {
            self.id.clone()
        }
    }

    pub fn into_completion(self, fallback_model: &str) -> ChatCompletion {
        let model = self.model_or(fallback_model);
        ChatCompletion {
            id: self.id_or_generated(),
            object: "chat.completion".to_string(),
            created: unix_now(),
            model,
            choices: vec![CompletionChoice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: self.content,
                    reasoning_content: Some(self.reasoning).filter(|r| !r.is_empty()),
                },
                finish_reason: self.finish_reason,
            }],
            usage: self.usage,
        }
    }

    pub fn into_responses(
        self,
        fallback_model: &str,
        temperature: Option<f64>,
        top_p: Option<f64>,
        metadata: Option<Map<String, Value>>,
    ) -> ResponsesResponse {
        let model = self.model_or(fallback_model);
        let id = self.id_or_generated();
        ResponsesResponse {
            id: format!("resp_{id}"),
            object: "response",
            created_at: unix_now(),
            status: "completed",
            error: None,
            model,
            output: vec![ResponseOutput {
                kind: "message",
                id: format!("msg_{id}"),
                status: "completed",
                role: "assistant",
                content: vec![OutputText {
                    kind: "output_text",
                    text: self.content,
                    annotations: Vec::new(),
                }],
            }],
            usage: self.usage.as_ref().map(ResponsesUsage::from),
            temperature: temperature.unwrap_or(1.0),
            top_p: top_p.unwrap_or(1.0),
            metadata: metadata.unwrap_or_default(),
        }
    }
}
