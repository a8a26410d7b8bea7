use super::gemini_types::{Content, GenerateContentResponse, Part, UsageMetadata};
use super::openai_types::{
    ChatCompletionResponse, ChatToolCall, ChatToolCallFunction, ChatUsage, Choice, ChoiceMessage,
};
use super::tool_calls::synthesize_client_id;

/// Joins multiple text parts of one candidate so they stay distinguishable.
pub const MULTI_PART_SEPARATOR: &str = "\n\n|>";

pub const CONTENT_FILTER: &str = "content_filter";
pub const TOOL_CALLS: &str = "tool_calls";

/// Translate one complete upstream response into a chat completion.
/// Pure function: `model` is echoed back, `id` is the response id to report.
pub fn gemini_to_openai(
    resp: &GenerateContentResponse,
    model: &str,
    id: &str,
) -> ChatCompletionResponse {
    let candidates = resp.candidates.as_deref().unwrap_or_default();

    let mut choices: Vec<Choice> = candidates
        .iter()
        .enumerate()
        .map(|(position, candidate)| {
            let (content, tool_calls) = split_parts(candidate.content.as_ref());
            let finish_reason = if tool_calls.is_empty() {
                candidate.finish_reason.as_deref().map(map_finish_reason)
            } else {
                Some(TOOL_CALLS.to_string())
            };

            Choice {
                index: candidate.index.unwrap_or(position as u64),
                message: Some(ChoiceMessage {
                    role: "assistant".to_string(),
                    content,
                    tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
                }),
                finish_reason,
                logprobs: None,
            }
        })
        .collect();

    if choices.is_empty() {
        if let Some(reason) = block_reason(resp) {
            tracing::warn!(block_reason = %reason, "Prompt blocked upstream");
            choices.push(Choice {
                index: 0,
                message: None,
                finish_reason: Some(CONTENT_FILTER.to_string()),
                logprobs: None,
            });
        }
    }

    ChatCompletionResponse {
        id: id.to_string(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices,
        usage: resp.usage_metadata.as_ref().map(map_usage),
    }
}

/// Split a candidate's parts into joined text and tool calls.
///
/// Text is `None` when the candidate carried no text part at all. Parts with
/// no client-side counterpart (inline media, executable code) are dropped.
pub fn split_parts(content: Option<&Content>) -> (Option<String>, Vec<ChatToolCall>) {
    let mut texts: Vec<&str> = Vec::new();
    let mut tool_calls = Vec::new();

    for part in content.map(|c| c.parts.as_slice()).unwrap_or_default() {
        match part {
            Part::Text { text } => texts.push(text),
            Part::FunctionCall { function_call } => tool_calls.push(ChatToolCall {
                id: function_call
                    .id
                    .clone()
                    .unwrap_or_else(synthesize_client_id),
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: function_call.name.clone(),
                    arguments: function_call.args.to_string(),
                },
            }),
            Part::InlineData { .. } | Part::FunctionResponse { .. } | Part::Other(_) => {
                tracing::debug!("Dropping non-text candidate part");
            }
        }
    }

    let text = (!texts.is_empty()).then(|| texts.join(MULTI_PART_SEPARATOR));
    (text, tool_calls)
}

/// Map an upstream finishReason to an OpenAI finish_reason.
pub fn map_finish_reason(reason: &str) -> String {
    match reason {
        "STOP" => "stop".to_string(),
        "MAX_TOKENS" => "length".to_string(),
        "SAFETY" | "RECITATION" => CONTENT_FILTER.to_string(),
        other => other.to_string(),
    }
}

pub fn map_usage(usage: &UsageMetadata) -> ChatUsage {
    ChatUsage {
        prompt_tokens: usage.prompt_token_count,
        completion_tokens: usage.candidates_token_count,
        total_tokens: usage.total_token_count,
    }
}

pub fn block_reason(resp: &GenerateContentResponse) -> Option<&str> {
    resp.prompt_feedback
        .as_ref()
        .and_then(|f| f.block_reason.as_deref())
}
