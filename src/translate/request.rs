//! Translate OpenAI Chat Completions requests into Gemini `generateContent` requests.
//!
//! The first system message moves into the system-instruction slot, assistant
//! turns become `model` turns, and consecutive `tool` messages fold into one
//! `function` turn answering the calls of the model turn before it. Image
//! references may need a network fetch, which is why this is async.

use super::gemini_types::{
    Content, FunctionCallingConfig, FunctionDeclaration, GenerateContentRequest,
    GenerationConfig, Part, SafetySetting, ThinkingConfig, Tool, ToolConfig,
};
use super::media::{audio_part, resolve_image};
use super::openai_types::{
    ChatCompletionRequest, ChatMessage, ChatTool, ChatToolChoice, ContentPart, MessageContent,
    ResponseFormat,
};
use super::schema::{adjust_schema, SchemaDirection};
use super::tool_calls::{encode_function_calls, CallTable, ResultGroup};
use crate::error::{GatewayError, Result};

const HARM_CATEGORIES: [&str; 5] = [
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

const ENUM_MIME: &str = "text/x.enum";
const JSON_MIME: &str = "application/json";
const TEXT_MIME: &str = "text/plain";

/// Translate an OpenAI chat request into a Gemini request body.
/// `client` is only used to fetch remote image references.
pub async fn openai_to_gemini(
    req: &ChatCompletionRequest,
    client: &reqwest::Client,
) -> Result<GenerateContentRequest> {
    if !req.extra.is_empty() {
        let mut dropped: Vec<&str> = req.extra.keys().map(String::as_str).collect();
        dropped.sort_unstable();
        tracing::debug!(fields = ?dropped, "Dropping unrecognized request fields");
    }

    let mut system_parts: Option<Vec<Part>> = None;
    let mut builder = ContentsBuilder::default();

    for (index, msg) in req.messages.iter().enumerate() {
        match msg.role.as_str() {
            "system" if system_parts.is_some() => {
                tracing::debug!(index, "Ignoring system message after the first");
            }
            "system" => system_parts = Some(translate_content(client, msg, index).await?),
            "tool" => builder.push_tool_result(msg)?,
            "assistant" => {
                let parts = match msg.tool_calls.as_deref() {
                    Some(calls) if !calls.is_empty() => {
                        let (parts, table) = encode_function_calls(calls)?;
                        builder.push_turn("model", parts, Some(table));
                        continue;
                    }
                    _ => translate_content(client, msg, index).await?,
                };
                builder.push_turn("model", parts, None);
            }
            "user" => {
                let parts = translate_content(client, msg, index).await?;
                builder.push_turn("user", parts, None);
            }
            other => return Err(GatewayError::UnsupportedRole(other.to_string())),
        }
    }

    let mut contents = builder.finish();

    let system_instruction = match system_parts.filter(|parts| !parts.is_empty()) {
        Some(parts) => {
            // The upstream rejects a leading turn without text once a system
            // instruction is present.
            if !contents.first().is_some_and(Content::has_text) {
                contents.insert(0, Content::new("user", vec![Part::text(" ")]));
            }
            Some(Content { role: None, parts })
        }
        None => None,
    };

    let (tools, tool_config) = translate_tools(req);

    Ok(GenerateContentRequest {
        contents,
        system_instruction,
        safety_settings: safety_settings(),
        generation_config: generation_config(req)?,
        tools,
        tool_config,
    })
}

/// Accumulates upstream turns, holding back the function-result turn until
/// the run of `tool` messages feeding it ends.
#[derive(Default)]
struct ContentsBuilder {
    contents: Vec<Content>,
    last_calls: Option<CallTable>,
    results: Option<ResultGroup>,
}

impl ContentsBuilder {
    fn push_turn(&mut self, role: &str, parts: Vec<Part>, calls: Option<CallTable>) {
        self.close_results();
        self.contents.push(Content::new(role, parts));
        self.last_calls = calls;
    }

    fn push_tool_result(&mut self, msg: &ChatMessage) -> Result<()> {
        let last_calls = &mut self.last_calls;
        let group = self
            .results
            .get_or_insert_with(|| ResultGroup::new(last_calls.take().unwrap_or_default()));
        group.add(msg)
    }

    fn close_results(&mut self) {
        if let Some(group) = self.results.take() {
            self.contents.push(group.into_content());
        }
    }

    fn finish(mut self) -> Vec<Content> {
        self.close_results();
        self.contents
    }
}

async fn translate_content(
    client: &reqwest::Client,
    msg: &ChatMessage,
    index: usize,
) -> Result<Vec<Part>> {
    let items = match &msg.content {
        None => return Ok(vec![Part::text("")]),
        Some(MessageContent::Text(text)) => return Ok(vec![Part::text(text.clone())]),
        Some(MessageContent::Parts(items)) => items,
    };

    let mut parts = Vec::with_capacity(items.len() + 1);
    for item in items {
        let part = match item {
            ContentPart::Text { text } => Part::text(text.clone()),
            ContentPart::ImageUrl { image_url } => resolve_image(client, &image_url.url).await?,
            ContentPart::InputAudio { input_audio } => audio_part(input_audio),
            ContentPart::Unsupported => return Err(GatewayError::UnsupportedContentType(index)),
        };
        parts.push(part);
    }

    // Image-only turns still need a text parameter upstream.
    if !items.is_empty()
        && items
            .iter()
            .all(|i| matches!(i, ContentPart::ImageUrl { .. }))
    {
        parts.push(Part::text(""));
    }

    Ok(parts)
}

fn generation_config(req: &ChatCompletionRequest) -> Result<GenerationConfig> {
    let mut cfg = GenerationConfig {
        stop_sequences: req.stop.as_ref().map(|s| s.to_vec()),
        candidate_count: req.n,
        max_output_tokens: req.max_completion_tokens.or(req.max_tokens),
        temperature: req.temperature,
        top_p: req.top_p,
        top_k: req.top_k,
        presence_penalty: req.presence_penalty,
        frequency_penalty: req.frequency_penalty,
        seed: req.seed,
        ..GenerationConfig::default()
    };

    if let Some(ref format) = req.response_format {
        apply_response_format(&mut cfg, format)?;
    }

    if let Some(ref effort) = req.reasoning_effort {
        match thinking_budget(effort) {
            Some(budget) => {
                cfg.thinking_config = Some(ThinkingConfig {
                    thinking_budget: budget,
                });
            }
            None => tracing::debug!(effort = %effort, "Ignoring unknown reasoning_effort"),
        }
    }

    Ok(cfg)
}

fn apply_response_format(cfg: &mut GenerationConfig, format: &ResponseFormat) -> Result<()> {
    match format.format_type.as_str() {
        "json_schema" => {
            let schema = format
                .json_schema
                .as_ref()
                .and_then(|js| js.schema.clone())
                .map(|s| adjust_schema(s, SchemaDirection::ToUpstream));
            let is_enum = schema.as_ref().is_some_and(|s| s.get("enum").is_some());
            cfg.response_mime_type = Some(if is_enum { ENUM_MIME } else { JSON_MIME }.to_string());
            cfg.response_schema = schema;
        }
        "json_object" => cfg.response_mime_type = Some(JSON_MIME.to_string()),
        "text" => cfg.response_mime_type = Some(TEXT_MIME.to_string()),
        other => return Err(GatewayError::UnsupportedResponseFormat(other.to_string())),
    }
    Ok(())
}

fn thinking_budget(effort: &str) -> Option<u64> {
    match effort {
        "none" => Some(0),
        "low" => Some(1024),
        "medium" => Some(8192),
        "high" => Some(24576),
        _ => None,
    }
}

fn translate_tools(req: &ChatCompletionRequest) -> (Option<Vec<Tool>>, Option<ToolConfig>) {
    let declarations: Vec<FunctionDeclaration> = req
        .tools
        .iter()
        .flatten()
        .filter_map(function_declaration)
        .collect();

    let tools = if declarations.is_empty() {
        None
    } else {
        Some(vec![Tool {
            function_declarations: declarations,
        }])
    };

    let tool_config = req.tool_choice.as_ref().and_then(translate_tool_choice);

    (tools, tool_config)
}

fn function_declaration(tool: &ChatTool) -> Option<FunctionDeclaration> {
    if tool.tool_type != "function" {
        return None;
    }
    let function = tool.function.as_ref()?;
    Some(FunctionDeclaration {
        name: function.name.clone(),
        description: function.description.clone(),
        parameters: function
            .parameters
            .clone()
            .map(|p| adjust_schema(p, SchemaDirection::ToUpstream)),
    })
}

fn translate_tool_choice(tc: &ChatToolChoice) -> Option<ToolConfig> {
    let function_calling_config = match tc {
        ChatToolChoice::String(mode) => FunctionCallingConfig {
            mode: mode.to_uppercase(),
            allowed_function_names: None,
        },
        ChatToolChoice::Specific(specific) if specific.choice_type == "function" => {
            FunctionCallingConfig {
                mode: "ANY".to_string(),
                allowed_function_names: Some(vec![specific.function.name.clone()]),
            }
        }
        ChatToolChoice::Specific(_) => return None,
    };
    Some(ToolConfig {
        function_calling_config,
    })
}

fn safety_settings() -> Vec<SafetySetting> {
    HARM_CATEGORIES
        .iter()
        .map(|category| SafetySetting {
            category: (*category).to_string(),
            threshold: "BLOCK_NONE".to_string(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translate::openai_types::*;
    use serde_json::json;

    fn request(messages: serde_json::Value) -> ChatCompletionRequest {
        serde_json::from_value(json!({ "model": "gemini-2.5-flash", "messages": messages }))
            .unwrap()
    }

    async fn translate(req: &ChatCompletionRequest) -> Result<GenerateContentRequest> {
        openai_to_gemini(req, &reqwest::Client::new()).await
    }

    #[tokio::test]
    async fn test_system_message_moves_to_instruction() {
        let req = request(json!([
            {"role": "system", "content": "You are helpful"},
            {"role": "user", "content": "Hello"},
            {"role": "assistant", "content": "Hi!"}
        ]));

        let out = translate(&req).await.unwrap();

        let system = out.system_instruction.unwrap();
        assert_eq!(system.parts, vec![Part::text("You are helpful")]);
        assert_eq!(out.contents.len(), 2);
        assert_eq!(out.contents[0].role.as_deref(), Some("user"));
        assert_eq!(out.contents[1].role.as_deref(), Some("model"));
        assert_eq!(out.safety_settings.len(), 5);
        assert!(out.safety_settings.iter().all(|s| s.threshold == "BLOCK_NONE"));
    }

    #[tokio::test]
    async fn test_only_first_system_message_is_the_instruction() {
        let req = request(json!([
            {"role": "system", "content": "First"},
            {"role": "user", "content": "Hello"},
            {"role": "system", "content": "Second"}
        ]));

        let out = translate(&req).await.unwrap();

        assert_eq!(out.system_instruction.unwrap().parts, vec![Part::text("First")]);
        assert_eq!(out.contents.len(), 1);
        assert_eq!(out.contents[0].parts, vec![Part::text("Hello")]);
    }

    #[tokio::test]
    async fn test_placeholder_turn_for_textless_start() {
        let req = request(json!([
            {"role": "system", "content": "Describe images"},
            {"role": "user", "content": [
                {"type": "input_audio", "input_audio": {"data": "AAAA", "format": "mp3"}}
            ]}
        ]));

        let out = translate(&req).await.unwrap();

        assert_eq!(out.contents.len(), 2);
        assert_eq!(out.contents[0].parts, vec![Part::text(" ")]);
        assert_eq!(out.contents[1].parts, vec![Part::inline_data("audio/mp3", "AAAA")]);
    }

    #[tokio::test]
    async fn test_no_placeholder_without_system() {
        let req = request(json!([
            {"role": "user", "content": [
                {"type": "input_audio", "input_audio": {"data": "AAAA", "format": "wav"}}
            ]}
        ]));
        let out = translate(&req).await.unwrap();
        assert_eq!(out.contents.len(), 1);
    }

    #[tokio::test]
    async fn test_image_only_message_gets_empty_text() {
        let req = request(json!([
            {"role": "user", "content": [
                {"type": "image_url", "image_url": {"url": "data:image/jpeg;base64,/9j/4AAQ"}}
            ]}
        ]));

        let out = translate(&req).await.unwrap();

        assert_eq!(
            out.contents[0].parts,
            vec![Part::inline_data("image/jpeg", "/9j/4AAQ"), Part::text("")]
        );
    }

    #[tokio::test]
    async fn test_tool_messages_fold_into_function_turn() {
        let req = request(json!([
            {"role": "user", "content": "Weather in Paris and Rome?"},
            {"role": "assistant", "content": null, "tool_calls": [
                {"id": "call_a", "type": "function", "function": {"name": "weather", "arguments": "{\"city\":\"Paris\"}"}},
                {"id": "call_b", "type": "function", "function": {"name": "weather", "arguments": "{\"city\":\"Rome\"}"}}
            ]},
            {"role": "tool", "tool_call_id": "call_b", "content": "{\"temp\":20}"},
            {"role": "tool", "tool_call_id": "call_a", "content": "{\"temp\":15}"},
            {"role": "user", "content": "Thanks"}
        ]));

        let out = translate(&req).await.unwrap();

        let roles: Vec<_> = out.contents.iter().map(|c| c.role.as_deref().unwrap()).collect();
        assert_eq!(roles, vec!["user", "model", "function", "user"]);
        let results = &out.contents[2].parts;
        assert_eq!(results.len(), 2);
        let v = serde_json::to_value(results).unwrap();
        assert_eq!(v[0]["functionResponse"]["response"]["temp"], 15);
        assert_eq!(v[1]["functionResponse"]["response"]["temp"], 20);
        assert!(v[0]["functionResponse"].get("id").is_none());
    }

    #[tokio::test]
    async fn test_tool_result_without_calls_is_unknown() {
        let req = request(json!([
            {"role": "user", "content": "hi"},
            {"role": "tool", "tool_call_id": "call_x", "content": "{}"}
        ]));
        let err = translate(&req).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnknownToolCallId(_)));
    }

    #[tokio::test]
    async fn test_unsupported_role() {
        let req = request(json!([{"role": "developer", "content": "x"}]));
        let err = translate(&req).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedRole(r) if r == "developer"));
    }

    #[tokio::test]
    async fn test_unsupported_content_part() {
        let req = request(json!([
            {"role": "user", "content": [{"type": "file", "file": {"file_id": "f"}}]}
        ]));
        let err = translate(&req).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedContentType(0)));
    }

    #[tokio::test]
    async fn test_generation_params_mapping() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "stop": "END",
            "max_tokens": 100,
            "temperature": 0.5,
            "top_p": 0.9,
            "top_k": 40,
            "n": 2,
            "frequency_penalty": 0.1,
            "presence_penalty": 0.2,
            "seed": 7,
            "reasoning_effort": "low",
            "logit_bias": {"50256": -100},
            "user": "someone"
        }))
        .unwrap();

        let out = translate(&req).await.unwrap();
        let cfg = serde_json::to_value(&out.generation_config).unwrap();

        assert_eq!(
            cfg,
            json!({
                "stopSequences": ["END"],
                "candidateCount": 2,
                "maxOutputTokens": 100,
                "temperature": 0.5,
                "topP": 0.9,
                "topK": 40,
                "presencePenalty": 0.2,
                "frequencyPenalty": 0.1,
                "seed": 7,
                "thinkingConfig": {"thinkingBudget": 1024}
            })
        );
    }

    #[tokio::test]
    async fn test_response_formats() {
        let mut req = request(json!([{"role": "user", "content": "pick"}]));

        req.response_format = Some(ResponseFormat {
            format_type: "json_schema".to_string(),
            json_schema: Some(JsonSchemaFormat {
                name: Some("choice".to_string()),
                description: None,
                schema: Some(json!({"type": "string", "enum": ["a", "b"]})),
                strict: Some(true),
            }),
        });
        let out = translate(&req).await.unwrap();
        assert_eq!(out.generation_config.response_mime_type.as_deref(), Some("text/x.enum"));

        req.response_format = Some(ResponseFormat {
            format_type: "json_schema".to_string(),
            json_schema: Some(JsonSchemaFormat {
                name: None,
                description: None,
                schema: Some(json!({
                    "type": "object",
                    "properties": {"a": {"type": "string"}},
                    "additionalProperties": false
                })),
                strict: Some(true),
            }),
        });
        let out = translate(&req).await.unwrap();
        assert_eq!(out.generation_config.response_mime_type.as_deref(), Some("application/json"));
        assert!(out
            .generation_config
            .response_schema
            .unwrap()
            .get("additionalProperties")
            .is_none());

        req.response_format = Some(ResponseFormat {
            format_type: "text".to_string(),
            json_schema: None,
        });
        let out = translate(&req).await.unwrap();
        assert_eq!(out.generation_config.response_mime_type.as_deref(), Some("text/plain"));

        req.response_format = Some(ResponseFormat {
            format_type: "xml".to_string(),
            json_schema: None,
        });
        let err = translate(&req).await.unwrap_err();
        assert!(matches!(err, GatewayError::UnsupportedResponseFormat(_)));
    }

    #[tokio::test]
    async fn test_tools_and_choice() {
        let req: ChatCompletionRequest = serde_json::from_value(json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "tools": [
                {"type": "function", "function": {
                    "name": "lookup",
                    "description": "Look something up",
                    "strict": true,
                    "parameters": {
                        "type": "object",
                        "properties": {"q": {"type": "string"}},
                        "additionalProperties": false
                    }
                }},
                {"type": "code_interpreter"}
            ],
            "tool_choice": {"type": "function", "function": {"name": "lookup"}}
        }))
        .unwrap();

        let out = translate(&req).await.unwrap();

        let tools = out.tools.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function_declarations.len(), 1);
        let params = tools[0].function_declarations[0].parameters.as_ref().unwrap();
        assert!(params.get("additionalProperties").is_none());

        let cfg = out.tool_config.unwrap().function_calling_config;
        assert_eq!(cfg.mode, "ANY");
        assert_eq!(cfg.allowed_function_names, Some(vec!["lookup".to_string()]));
    }

    #[tokio::test]
    async fn test_string_tool_choice_is_uppercased() {
        let mut req = request(json!([{"role": "user", "content": "hi"}]));
        req.tool_choice = Some(ChatToolChoice::String("none".to_string()));
        let out = translate(&req).await.unwrap();
        assert_eq!(out.tool_config.unwrap().function_calling_config.mode, "NONE");
    }
}
