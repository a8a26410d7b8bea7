//! State machine turning upstream stream events into chat-completion chunks.
//!
//! The upstream repeats `finishReason` on every event once a candidate starts
//! finishing, while clients expect `finish_reason: null` on every content
//! delta and the real reason only on one empty delta at the very end. The
//! [`StreamTranscoder`] therefore withholds finish reasons (and usage) per
//! candidate and releases them when the input is exhausted.

use std::collections::BTreeMap;

use bytes::Bytes;

use super::framer::Frame;
use super::gemini_types::GenerateContentResponse;
use super::openai_types::{ChatCompletionChunk, ChatUsage, ChunkChoice, ChunkDelta, ChunkToolCall};
use super::response::{block_reason, map_finish_reason, map_usage, split_parts, CONTENT_FILTER, TOOL_CALLS};
use crate::error::Result;

/// The final frame of every completed stream.
pub const DONE_SENTINEL: &str = "data: [DONE]\n\n";

/// One downstream event, ready to be written to the client.
#[derive(Debug, Clone)]
pub enum DownstreamFrame {
    Chunk(ChatCompletionChunk),
    /// Upstream payload that did not decode as an event, passed on untouched.
    Passthrough { payload: String, terminated: bool },
    Done,
}

impl DownstreamFrame {
    pub fn into_bytes(self) -> Result<Bytes> {
        let wire = match self {
            DownstreamFrame::Chunk(chunk) => format!("data: {}\n\n", serde_json::to_string(&chunk)?),
            DownstreamFrame::Passthrough {
                payload,
                terminated: true,
            } => format!("data: {payload}\n\n"),
            DownstreamFrame::Passthrough {
                payload,
                terminated: false,
            } => payload,
            DownstreamFrame::Done => DONE_SENTINEL.to_string(),
        };
        Ok(Bytes::from(wire))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Streaming,
    Flushing,
    Done,
}

/// What is still owed to the client for one candidate.
#[derive(Debug, Default)]
struct CandidateRecord {
    finish_reason: Option<String>,
    saw_tool_calls: bool,
    next_tool_index: u64,
    usage: Option<ChatUsage>,
}

impl CandidateRecord {
    fn final_reason(&self) -> Option<String> {
        if self.saw_tool_calls {
            Some(TOOL_CALLS.to_string())
        } else {
            self.finish_reason.clone()
        }
    }
}

/// Per-stream transcoder. One instance per client stream, never shared.
///
/// Usage:
///   let mut transcoder = StreamTranscoder::new(id, "gemini-2.5-flash", false);
///   for frame in frames {
///       for out in transcoder.process(&frame) { /* write out */ }
///   }
///   for out in transcoder.flush() { /* write out */ }
#[derive(Debug)]
pub struct StreamTranscoder {
    id: String,
    model: String,
    created: i64,
    include_usage: bool,
    phase: Phase,
    candidates: BTreeMap<u64, CandidateRecord>,
    events_seen: u64,
}

impl StreamTranscoder {
    pub fn new(id: impl Into<String>, model: impl Into<String>, include_usage: bool) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created: chrono::Utc::now().timestamp(),
            include_usage,
            phase: Phase::Streaming,
            candidates: BTreeMap::new(),
            events_seen: 0,
        }
    }

    pub fn events_seen(&self) -> u64 {
        self.events_seen
    }

    /// Transcode one framed upstream payload into zero or more downstream frames.
    pub fn process(&mut self, frame: &Frame) -> Vec<DownstreamFrame> {
        if self.phase != Phase::Streaming {
            tracing::debug!("Ignoring frame after flush");
            return Vec::new();
        }
        self.events_seen += 1;

        let Some(event) = decode_event(&frame.payload) else {
            return vec![self.passthrough(frame)];
        };

        let usage = event.usage_metadata.as_ref().map(map_usage);

        let blocked = block_reason(&event).map(str::to_string);
        let candidates = event.candidates.unwrap_or_default();
        if candidates.is_empty() {
            return vec![self.prompt_block(blocked)];
        }

        let mut out = Vec::new();
        for candidate in candidates {
            let index = candidate.index.unwrap_or(0);

            if !self.candidates.contains_key(&index) {
                self.candidates.insert(index, CandidateRecord::default());
                out.push(self.chunk(
                    index,
                    ChunkDelta {
                        role: Some("assistant".to_string()),
                        content: Some(String::new()),
                        tool_calls: None,
                    },
                ));
            }

            let (content, tool_calls) = split_parts(candidate.content.as_ref());

            let Some(record) = self.candidates.get_mut(&index) else {
                continue;
            };
            if let Some(ref reason) = candidate.finish_reason {
                record.finish_reason = Some(map_finish_reason(reason));
            }
            if usage.is_some() {
                record.usage.clone_from(&usage);
            }

            let tool_calls: Vec<ChunkToolCall> = tool_calls
                .into_iter()
                .map(|call| {
                    let tool_index = record.next_tool_index;
                    record.next_tool_index += 1;
                    ChunkToolCall {
                        index: tool_index,
                        id: call.id,
                        call_type: call.call_type,
                        function: call.function,
                    }
                })
                .collect();
            record.saw_tool_calls |= !tool_calls.is_empty();

            let delta = ChunkDelta {
                role: None,
                content,
                tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            };
            if !delta.is_empty() {
                out.push(self.chunk(index, delta));
            }
        }
        out
    }

    /// Release the withheld finish reasons and close the stream.
    /// Only the first call emits anything.
    pub fn flush(&mut self) -> Vec<DownstreamFrame> {
        if self.phase != Phase::Streaming {
            return Vec::new();
        }
        self.phase = Phase::Flushing;

        let mut out: Vec<DownstreamFrame> = self
            .candidates
            .iter()
            .map(|(&index, record)| {
                DownstreamFrame::Chunk(ChatCompletionChunk {
                    usage: record.usage.clone().filter(|_| self.include_usage),
                    ..self.chunk_with(index, Some(ChunkDelta::default()), record.final_reason())
                })
            })
            .collect();

        out.push(DownstreamFrame::Done);
        self.phase = Phase::Done;

        tracing::debug!(
            candidates = self.candidates.len(),
            events = self.events_seen,
            "Stream flushed"
        );
        out
    }

    fn chunk(&self, index: u64, delta: ChunkDelta) -> DownstreamFrame {
        DownstreamFrame::Chunk(self.chunk_with(index, Some(delta), None))
    }

    fn chunk_with(
        &self,
        index: u64,
        delta: Option<ChunkDelta>,
        finish_reason: Option<String>,
    ) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice {
                index,
                delta,
                finish_reason,
                logprobs: None,
            }],
            usage: None,
        }
    }

    fn prompt_block(&self, reason: Option<String>) -> DownstreamFrame {
        let mut chunk = self.chunk_with(0, None, None);
        match reason {
            Some(reason) => {
                tracing::warn!(block_reason = %reason, "Prompt blocked upstream");
                chunk.choices[0].finish_reason = Some(CONTENT_FILTER.to_string());
            }
            None => chunk.choices.clear(),
        }
        DownstreamFrame::Chunk(chunk)
    }

    fn passthrough(&self, frame: &Frame) -> DownstreamFrame {
        tracing::warn!(
            partial = frame.partial,
            payload = %truncate(&frame.payload, 200),
            "Passing through unrecognized upstream payload"
        );
        DownstreamFrame::Passthrough {
            payload: frame.payload.clone(),
            terminated: !frame.partial,
        }
    }
}

/// Decode a payload as an upstream event. Error-shaped payloads carry no
/// candidate list and are rejected here.
fn decode_event(payload: &str) -> Option<GenerateContentResponse> {
    let json = payload.strip_prefix("data: ").unwrap_or(payload);
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    if !value.get("candidates").is_some_and(serde_json::Value::is_array) {
        return None;
    }
    serde_json::from_value(value).ok()
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}
