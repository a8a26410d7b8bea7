//! Mapping between client tool-call ids and upstream function calls.
//!
//! The upstream identifies a function result by its position relative to the
//! calls of the preceding model turn, the client by an opaque id. A [`CallTable`]
//! built while encoding an assistant turn resolves one into the other when the
//! following `tool` messages are folded into a single function-result turn.

use std::collections::HashMap;

use super::gemini_types::{Content, FunctionCall, FunctionResponse, Part};
use super::openai_types::{ChatMessage, ChatToolCall};
use crate::error::{GatewayError, Result};

/// Prefix of ids we mint ourselves; such ids are never sent upstream.
pub const SYNTHETIC_ID_PREFIX: &str = "call_";

const GENERATED_ID_LEN: usize = 29;

/// Upstream role of a turn carrying function results.
pub const FUNCTION_ROLE: &str = "function";

/// A random 29-character alphanumeric identifier.
pub fn generate_id() -> String {
    std::iter::repeat_with(fastrand::alphanumeric)
        .take(GENERATED_ID_LEN)
        .collect()
}

/// A client-visible tool-call id for a call the upstream left unnamed.
pub fn synthesize_client_id() -> String {
    format!("{SYNTHETIC_ID_PREFIX}{}", generate_id())
}

pub fn is_synthetic(id: &str) -> bool {
    id.starts_with(SYNTHETIC_ID_PREFIX)
}

fn upstream_id(client_id: &str) -> Option<String> {
    if is_synthetic(client_id) {
        None
    } else {
        Some(client_id.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallEntry {
    pub position: usize,
    pub name: String,
}

/// Client call id -> position and name within one model turn.
#[derive(Debug, Clone, Default)]
pub struct CallTable {
    entries: HashMap<String, CallEntry>,
    len: usize,
}

impl CallTable {
    pub fn get(&self, id: &str) -> Option<&CallEntry> {
        self.entries.get(id)
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

/// Turn an assistant message's tool calls into upstream `functionCall` parts.
pub fn encode_function_calls(tool_calls: &[ChatToolCall]) -> Result<(Vec<Part>, CallTable)> {
    let mut table = CallTable {
        entries: HashMap::with_capacity(tool_calls.len()),
        len: tool_calls.len(),
    };
    let mut parts = Vec::with_capacity(tool_calls.len());

    for (position, call) in tool_calls.iter().enumerate() {
        if call.call_type != "function" {
            return Err(GatewayError::UnsupportedToolCallType(call.call_type.clone()));
        }

        let args: serde_json::Value = serde_json::from_str(&call.function.arguments)
            .map_err(|_| GatewayError::InvalidToolArguments(call.function.arguments.clone()))?;

        table.entries.insert(
            call.id.clone(),
            CallEntry {
                position,
                name: call.function.name.clone(),
            },
        );

        parts.push(Part::FunctionCall {
            function_call: FunctionCall {
                id: upstream_id(&call.id),
                name: call.function.name.clone(),
                args,
            },
        });
    }

    Ok((parts, table))
}

/// Resolve a `tool` message against the calls it answers.
/// Returns the position the result must occupy and the upstream part.
pub fn decode_function_result(msg: &ChatMessage, calls: &CallTable) -> Result<(usize, Part)> {
    let call_id = msg.tool_call_id.clone().unwrap_or_default();
    let entry = calls
        .get(&call_id)
        .ok_or_else(|| GatewayError::UnknownToolCallId(call_id.clone()))?;

    let raw = msg
        .content
        .as_ref()
        .map(|c| c.as_text())
        .unwrap_or_default();

    let response = match serde_json::from_str::<serde_json::Value>(&raw) {
        Ok(value @ serde_json::Value::Object(_)) => value,
        Ok(other) => serde_json::json!({ "result": other }),
        Err(_) => serde_json::json!({ "result": raw }),
    };

    let part = Part::FunctionResponse {
        function_response: FunctionResponse {
            id: upstream_id(&call_id),
            name: entry.name.clone(),
            response,
        },
    };

    Ok((entry.position, part))
}

/// The function-result turn being assembled from consecutive `tool` messages.
#[derive(Debug)]
pub struct ResultGroup {
    calls: CallTable,
    slots: Vec<Option<Part>>,
}

impl ResultGroup {
    pub fn new(calls: CallTable) -> Self {
        let slots = vec![None; calls.len()];
        Self { calls, slots }
    }

    pub fn add(&mut self, msg: &ChatMessage) -> Result<()> {
        let (position, part) = decode_function_result(msg, &self.calls)?;
        let slot = &mut self.slots[position];
        if slot.is_some() {
            return Err(GatewayError::DuplicatedToolCallId(
                msg.tool_call_id.clone().unwrap_or_default(),
            ));
        }
        *slot = Some(part);
        Ok(())
    }

    /// Results in call order; calls left unanswered are skipped.
    pub fn into_content(self) -> Content {
        Content::new(FUNCTION_ROLE, self.slots.into_iter().flatten().collect())
    }
}
