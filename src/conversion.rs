//! Format translation between Anthropic Messages and OpenAI Chat Completions.
//!
//! All functions here are pure; the only state lives in the two streaming
//! translators, which coalesce OpenAI deltas into Anthropic's block-oriented
//! event model and back.

use serde_json::{json, Value};

use crate::models::anthropic::{
    ContentBlock, Message, MessageContent, MessagesRequest, MessagesResponse, Role, StreamEvent,
    SystemPrompt, ToolDefinition, Usage,
};
use crate::models::openai::{
    ChatChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatDelta,
    ChatMessage, ChatResponseMessage, ChatStreamChoice, ChatUsage, FunctionCall, FunctionCallDelta,
    FunctionDef, ToolCall, ToolCallDelta, ToolDefinition as OpenAiToolDefinition,
};

/// OpenAI finish reason → Anthropic stop reason.
pub fn finish_reason_to_stop_reason(finish_reason: &str) -> &'static str {
    match finish_reason {
        "stop" => "end_turn",
        "length" => "max_tokens",
        "tool_calls" | "function_call" => "tool_use",
        "content_filter" => "stop_sequence",
        _ => "end_turn",
    }
}

/// Anthropic stop reason → OpenAI finish reason.
pub fn stop_reason_to_finish_reason(stop_reason: &str) -> &'static str {
    match stop_reason {
        "end_turn" => "stop",
        "max_tokens" => "length",
        "tool_use" => "tool_calls",
        "stop_sequence" => "stop",
        _ => "stop",
    }
}

fn image_data_url(media_type: &str, data: &str) -> String {
    format!("data:{};base64,{}", media_type, data)
}

/// Parse a `data:<media_type>;base64,<data>` URL back into its parts.
fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (header, data) = rest.split_once(',')?;
    let media_type = header.strip_suffix(";base64")?;
    Some((media_type.to_string(), data.to_string()))
}

fn tool_result_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => {
            let mut parts = Vec::new();
            for block in blocks {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    parts.push(text.to_string());
                }
            }
            if parts.is_empty() {
                content.to_string()
            } else {
                parts.join("\n")
            }
        }
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Translate a canonical request into the OpenAI Chat Completions shape.
///
/// Tool results are hoisted into leading `tool` messages (the OpenAI wire
/// expects them as standalone turns keyed by `tool_call_id`); client metadata
/// is dropped.
pub fn anthropic_to_openai_request(request: &MessagesRequest) -> ChatCompletionRequest {
    let mut messages = Vec::new();

    if let Some(system) = &request.system {
        let text = system.as_text();
        if !text.is_empty() {
            messages.push(ChatMessage::text("system", text));
        }
    }

    for message in &request.messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };

        match &message.content {
            MessageContent::Text(text) => {
                messages.push(ChatMessage::text(role, text.clone()));
            }
            MessageContent::Blocks(blocks) => {
                let mut parts: Vec<Value> = Vec::new();
                let mut has_image = false;
                let mut tool_calls: Vec<ToolCall> = Vec::new();

                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => {
                            parts.push(json!({"type": "text", "text": text}));
                        }
                        ContentBlock::Image { source } => {
                            has_image = true;
                            parts.push(json!({
                                "type": "image_url",
                                "image_url": {
                                    "url": image_data_url(&source.media_type, &source.data)
                                }
                            }));
                        }
                        ContentBlock::ToolUse { id, name, input } => {
                            tool_calls.push(ToolCall {
                                id: id.clone(),
                                call_type: "function".to_string(),
                                function: FunctionCall {
                                    name: name.clone(),
                                    arguments: serde_json::to_string(input)
                                        .unwrap_or_else(|_| "{}".to_string()),
                                },
                            });
                        }
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                        } => {
                            messages.push(ChatMessage {
                                role: "tool".to_string(),
                                content: Some(Value::String(tool_result_text(content))),
                                name: None,
                                tool_call_id: Some(tool_use_id.clone()),
                                tool_calls: None,
                            });
                        }
                    }
                }

                let content = if parts.is_empty() {
                    None
                } else if !has_image {
                    // Text-only collapses to the plain string form.
                    let joined = parts
                        .iter()
                        .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                        .collect::<Vec<_>>()
                        .join("");
                    Some(Value::String(joined))
                } else {
                    Some(Value::Array(parts))
                };

                if content.is_some() || !tool_calls.is_empty() {
                    messages.push(ChatMessage {
                        role: role.to_string(),
                        content,
                        name: None,
                        tool_call_id: None,
                        tool_calls: if tool_calls.is_empty() {
                            None
                        } else {
                            Some(tool_calls)
                        },
                    });
                }
            }
        }
    }

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| OpenAiToolDefinition {
                kind: "function".to_string(),
                function: FunctionDef {
                    name: t.name.clone(),
                    description: t.description.clone(),
                    parameters: t.input_schema.clone(),
                },
            })
            .collect()
    });

    let stop = request.stop_sequences.as_ref().map(|seqs| json!(seqs));

    ChatCompletionRequest {
        model: request.model.clone(),
        messages,
        max_tokens: Some(request.max_tokens),
        temperature: request.temperature,
        top_p: request.top_p,
        stop,
        stream: if request.stream { Some(true) } else { None },
        tools,
        tool_choice: None,
        user: None,
        extra: request.extra.clone(),
    }
}

/// Translate an OpenAI Chat Completions request into the canonical shape.
///
/// System turns concatenate into the top-level `system`; `tool` turns become
/// user messages carrying a `tool_result` block.
pub fn openai_to_anthropic_request(request: &ChatCompletionRequest) -> MessagesRequest {
    let mut system_text: Option<String> = None;
    let mut messages: Vec<Message> = Vec::new();

    for msg in &request.messages {
        match msg.role.as_str() {
            "system" => {
                let text = msg
                    .content
                    .as_ref()
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string();
                system_text = Some(match system_text {
                    Some(existing) => format!("{}\n\n{}", existing, text),
                    None => text,
                });
            }
            "tool" => {
                messages.push(Message {
                    role: Role::User,
                    content: MessageContent::Blocks(vec![ContentBlock::ToolResult {
                        tool_use_id: msg.tool_call_id.clone().unwrap_or_default(),
                        content: msg.content.clone().unwrap_or(Value::Null),
                    }]),
                });
            }
            role @ ("user" | "assistant") => {
                let mut blocks: Vec<ContentBlock> = Vec::new();

                match &msg.content {
                    Some(Value::String(text)) => {
                        if !text.is_empty() {
                            blocks.push(ContentBlock::Text { text: text.clone() });
                        }
                    }
                    Some(Value::Array(parts)) => {
                        for part in parts {
                            match part.get("type").and_then(|t| t.as_str()) {
                                Some("text") => {
                                    if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                                        blocks.push(ContentBlock::Text {
                                            text: text.to_string(),
                                        });
                                    }
                                }
                                Some("image_url") => {
                                    let url = part
                                        .get("image_url")
                                        .and_then(|i| i.get("url"))
                                        .and_then(|u| u.as_str())
                                        .unwrap_or_default();
                                    if let Some((media_type, data)) = parse_data_url(url) {
                                        blocks.push(ContentBlock::Image {
                                            source: crate::models::anthropic::ImageSource {
                                                kind: "base64".to_string(),
                                                media_type,
                                                data,
                                            },
                                        });
                                    } else if !url.is_empty() {
                                        blocks.push(ContentBlock::Text {
                                            text: format!("[Image: {}]", url),
                                        });
                                    }
                                }
                                _ => {}
                            }
                        }
                    }
                    _ => {}
                }

                if let Some(tool_calls) = &msg.tool_calls {
                    for call in tool_calls {
                        let input = serde_json::from_str(&call.function.arguments)
                            .unwrap_or(Value::String(call.function.arguments.clone()));
                        blocks.push(ContentBlock::ToolUse {
                            id: call.id.clone(),
                            name: call.function.name.clone(),
                            input,
                        });
                    }
                }

                if !blocks.is_empty() {
                    messages.push(Message {
                        role: if role == "user" {
                            Role::User
                        } else {
                            Role::Assistant
                        },
                        content: MessageContent::Blocks(blocks),
                    });
                }
            }
            _ => {}
        }
    }

    let stop_sequences = request.stop.as_ref().and_then(|stop| match stop {
        Value::String(s) => Some(vec![s.clone()]),
        Value::Array(arr) => Some(
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect(),
        ),
        _ => None,
    });

    let tools = request.tools.as_ref().map(|tools| {
        tools
            .iter()
            .map(|t| ToolDefinition {
                name: t.function.name.clone(),
                description: t.function.description.clone(),
                input_schema: t.function.parameters.clone(),
            })
            .collect()
    });

    MessagesRequest {
        model: request.model.clone(),
        messages,
        system: system_text.filter(|s| !s.is_empty()).map(SystemPrompt::Text),
        max_tokens: request.max_tokens.unwrap_or(1024),
        temperature: request.temperature,
        top_p: request.top_p,
        top_k: None,
        stop_sequences,
        tools,
        stream: request.stream.unwrap_or(false),
        metadata: None,
        extra: serde_json::Map::new(),
    }
}

/// Translate an OpenAI unary response into the Anthropic response shape.
pub fn openai_to_anthropic_response(response: &ChatCompletionResponse) -> MessagesResponse {
    let mut content: Vec<ContentBlock> = Vec::new();
    let mut stop_reason = "end_turn".to_string();

    if let Some(choice) = response.choices.first() {
        if let Some(text) = &choice.message.content {
            if !text.is_empty() {
                content.push(ContentBlock::Text { text: text.clone() });
            }
        }
        if let Some(tool_calls) = &choice.message.tool_calls {
            for call in tool_calls {
                let input = serde_json::from_str(&call.function.arguments)
                    .unwrap_or(Value::String(call.function.arguments.clone()));
                content.push(ContentBlock::ToolUse {
                    id: call.id.clone(),
                    name: call.function.name.clone(),
                    input,
                });
            }
        }
        if let Some(reason) = &choice.finish_reason {
            stop_reason = finish_reason_to_stop_reason(reason).to_string();
        }
    }

    let usage = response.usage.as_ref().map(|u| Usage {
        input_tokens: u.prompt_tokens,
        output_tokens: u.completion_tokens,
        extra: serde_json::Map::new(),
    });

    MessagesResponse {
        id: response.id.clone(),
        kind: "message".to_string(),
        role: Role::Assistant,
        content,
        model: response.model.clone(),
        stop_reason: Some(stop_reason),
        stop_sequence: None,
        usage,
    }
}

/// Translate an Anthropic unary response into the OpenAI response shape.
pub fn anthropic_to_openai_response(response: &MessagesResponse) -> ChatCompletionResponse {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();

    for block in &response.content {
        match block {
            ContentBlock::Text { text: t } => text.push_str(t),
            ContentBlock::ToolUse { id, name, input } => tool_calls.push(ToolCall {
                id: id.clone(),
                call_type: "function".to_string(),
                function: FunctionCall {
                    name: name.clone(),
                    arguments: serde_json::to_string(input).unwrap_or_else(|_| "{}".to_string()),
                },
            }),
            _ => {}
        }
    }

    let finish_reason = response
        .stop_reason
        .as_deref()
        .map(|r| stop_reason_to_finish_reason(r).to_string())
        .or_else(|| Some("stop".to_string()));

    let usage = response.usage.as_ref().map(|u| ChatUsage {
        prompt_tokens: u.input_tokens,
        completion_tokens: u.output_tokens,
        total_tokens: u.input_tokens + u.output_tokens,
    });

    ChatCompletionResponse {
        id: response.id.clone(),
        object: "chat.completion".to_string(),
        created: unix_now(),
        model: response.model.clone(),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatResponseMessage {
                role: "assistant".to_string(),
                content: if text.is_empty() && !tool_calls.is_empty() {
                    None
                } else {
                    Some(text)
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            },
            finish_reason,
        }],
        usage,
    }
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Replay a unary Anthropic response as the equivalent event sequence.
///
/// Used for cache hits on streaming requests and for the non-proxy OK reply.
pub fn unary_to_stream_events(response: &MessagesResponse) -> Vec<StreamEvent> {
    let mut events = Vec::new();

    let input_tokens = response
        .usage
        .as_ref()
        .map(|u| u.input_tokens)
        .unwrap_or(0);
    events.push(StreamEvent::MessageStart {
        message: json!({
            "id": &response.id,
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": &response.model,
            "stop_reason": null,
            "stop_sequence": null,
            "usage": {"input_tokens": input_tokens, "output_tokens": 0}
        }),
    });

    for (index, block) in response.content.iter().enumerate() {
        match block {
            ContentBlock::Text { text } => {
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: json!({"type": "text", "text": ""}),
                });
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: json!({"type": "text_delta", "text": text}),
                });
            }
            ContentBlock::ToolUse { id, name, input } => {
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: json!({
                        "type": "tool_use",
                        "id": id,
                        "name": name,
                        "input": {}
                    }),
                });
                events.push(StreamEvent::ContentBlockDelta {
                    index,
                    delta: json!({
                        "type": "input_json_delta",
                        "partial_json": serde_json::to_string(input).unwrap_or_default()
                    }),
                });
            }
            other => {
                events.push(StreamEvent::ContentBlockStart {
                    index,
                    content_block: serde_json::to_value(other).unwrap_or(Value::Null),
                });
            }
        }
        events.push(StreamEvent::ContentBlockStop { index });
    }

    let output_tokens = response
        .usage
        .as_ref()
        .map(|u| u.output_tokens)
        .unwrap_or(0);
    events.push(StreamEvent::MessageDelta {
        delta: json!({
            "stop_reason": response.stop_reason.clone().unwrap_or_else(|| "end_turn".to_string()),
            "stop_sequence": &response.stop_sequence
        }),
        usage: Some(json!({"output_tokens": output_tokens})),
    });
    events.push(StreamEvent::MessageStop);
    events
}

/// Reconstruct the unary response equivalent from a buffered event sequence.
///
/// Returns `None` unless the sequence terminated cleanly with `message_stop`;
/// partial streams must never be admitted to the cache.
pub fn stream_events_to_unary(events: &[StreamEvent]) -> Option<MessagesResponse> {
    let mut id = String::from("msg_stream");
    let mut model = String::new();
    let mut input_tokens = 0u64;
    let mut output_tokens = 0u64;
    let mut stop_reason: Option<String> = None;
    let mut stop_sequence: Option<String> = None;
    let mut blocks: Vec<Value> = Vec::new();
    let mut saw_stop = false;

    for event in events {
        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(s) = message.get("id").and_then(|v| v.as_str()) {
                    id = s.to_string();
                }
                if let Some(s) = message.get("model").and_then(|v| v.as_str()) {
                    model = s.to_string();
                }
                if let Some(n) = message
                    .get("usage")
                    .and_then(|u| u.get("input_tokens"))
                    .and_then(|v| v.as_u64())
                {
                    input_tokens = n;
                }
            }
            StreamEvent::ContentBlockStart {
                index,
                content_block,
            } => {
                while blocks.len() <= *index {
                    blocks.push(Value::Null);
                }
                blocks[*index] = content_block.clone();
            }
            StreamEvent::ContentBlockDelta { index, delta } => {
                let Some(block) = blocks.get_mut(*index) else {
                    continue;
                };
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        if let (Some(obj), Some(text)) = (
                            block.as_object_mut(),
                            delta.get("text").and_then(|t| t.as_str()),
                        ) {
                            let existing =
                                obj.get("text").and_then(|t| t.as_str()).unwrap_or_default();
                            obj.insert(
                                "text".to_string(),
                                Value::String(format!("{}{}", existing, text)),
                            );
                        }
                    }
                    Some("input_json_delta") => {
                        if let (Some(obj), Some(partial)) = (
                            block.as_object_mut(),
                            delta.get("partial_json").and_then(|t| t.as_str()),
                        ) {
                            let existing = obj
                                .get("partial_json")
                                .and_then(|t| t.as_str())
                                .unwrap_or_default();
                            obj.insert(
                                "partial_json".to_string(),
                                Value::String(format!("{}{}", existing, partial)),
                            );
                        }
                    }
                    _ => {}
                }
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(s) = delta.get("stop_reason").and_then(|v| v.as_str()) {
                    stop_reason = Some(s.to_string());
                }
                if let Some(s) = delta.get("stop_sequence").and_then(|v| v.as_str()) {
                    stop_sequence = Some(s.to_string());
                }
                if let Some(n) = usage
                    .as_ref()
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|v| v.as_u64())
                {
                    output_tokens = n;
                }
            }
            StreamEvent::MessageStop => saw_stop = true,
            _ => {}
        }
    }

    if !saw_stop {
        return None;
    }

    // Accumulated tool-use argument fragments parse back into the input field.
    let content: Vec<ContentBlock> = blocks
        .into_iter()
        .filter(|b| !b.is_null())
        .filter_map(|mut b| {
            if b.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                if let Some(obj) = b.as_object_mut() {
                    if let Some(partial) = obj.remove("partial_json") {
                        if let Some(raw) = partial.as_str() {
                            let input: Value = serde_json::from_str(raw).unwrap_or(json!({}));
                            obj.insert("input".to_string(), input);
                        }
                    }
                }
            }
            serde_json::from_value(b).ok()
        })
        .collect();

    Some(MessagesResponse {
        id,
        kind: "message".to_string(),
        role: Role::Assistant,
        content,
        model,
        stop_reason: stop_reason.or_else(|| Some("end_turn".to_string())),
        stop_sequence,
        usage: Some(Usage {
            input_tokens,
            output_tokens,
            extra: serde_json::Map::new(),
        }),
    })
}

/// Stateful translator coalescing OpenAI stream chunks into Anthropic events.
///
/// Tracks the current block index, whether a block is open, and whether that
/// block is a tool call; `finish` corresponds to the upstream `[DONE]` marker.
#[derive(Debug, Default)]
pub struct OpenAiStreamTranslator {
    started: bool,
    block_index: usize,
    block_open: bool,
    in_tool_block: bool,
    stop_reason: Option<String>,
    usage: Option<ChatUsage>,
    finished: bool,
}

impl OpenAiStreamTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    fn close_block(&mut self, events: &mut Vec<StreamEvent>) {
        if self.block_open {
            events.push(StreamEvent::ContentBlockStop {
                index: self.block_index,
            });
            self.block_index += 1;
            self.block_open = false;
            self.in_tool_block = false;
        }
    }

    pub fn on_chunk(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                message: json!({
                    "id": &chunk.id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": &chunk.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }),
            });
        }

        if let Some(usage) = &chunk.usage {
            self.usage = Some(usage.clone());
        }

        let Some(choice) = chunk.choices.first() else {
            return events;
        };

        if let Some(content) = choice.delta.content.as_deref().filter(|c| !c.is_empty()) {
            if self.in_tool_block {
                self.close_block(&mut events);
            }
            if !self.block_open {
                events.push(StreamEvent::ContentBlockStart {
                    index: self.block_index,
                    content_block: json!({"type": "text", "text": ""}),
                });
                self.block_open = true;
            }
            events.push(StreamEvent::ContentBlockDelta {
                index: self.block_index,
                delta: json!({"type": "text_delta", "text": content}),
            });
        }

        if let Some(tool_calls) = &choice.delta.tool_calls {
            for call in tool_calls {
                let starts_new_call = call.id.is_some()
                    || call
                        .function
                        .as_ref()
                        .map(|f| f.name.is_some())
                        .unwrap_or(false);
                if starts_new_call {
                    self.close_block(&mut events);
                    events.push(StreamEvent::ContentBlockStart {
                        index: self.block_index,
                        content_block: json!({
                            "type": "tool_use",
                            "id": call.id.clone().unwrap_or_default(),
                            "name": call
                                .function
                                .as_ref()
                                .and_then(|f| f.name.clone())
                                .unwrap_or_default(),
                            "input": {}
                        }),
                    });
                    self.block_open = true;
                    self.in_tool_block = true;
                }
                if let Some(args) = call
                    .function
                    .as_ref()
                    .and_then(|f| f.arguments.as_deref())
                    .filter(|a| !a.is_empty())
                {
                    events.push(StreamEvent::ContentBlockDelta {
                        index: self.block_index,
                        delta: json!({"type": "input_json_delta", "partial_json": args}),
                    });
                }
            }
        }

        if let Some(reason) = &choice.finish_reason {
            self.stop_reason = Some(finish_reason_to_stop_reason(reason).to_string());
        }

        events
    }

    /// Emit the closing events for the stream (`[DONE]` received).
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.finished {
            return Vec::new();
        }
        self.finished = true;

        let mut events = Vec::new();
        if !self.started {
            self.started = true;
            events.push(StreamEvent::MessageStart {
                message: json!({
                    "id": "msg_stream",
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": "",
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": {"input_tokens": 0, "output_tokens": 0}
                }),
            });
        }
        self.close_block(&mut events);

        let stop_reason = self
            .stop_reason
            .clone()
            .unwrap_or_else(|| "end_turn".to_string());
        let output_tokens = self
            .usage
            .as_ref()
            .map(|u| u.completion_tokens)
            .unwrap_or(0);
        events.push(StreamEvent::MessageDelta {
            delta: json!({"stop_reason": stop_reason, "stop_sequence": null}),
            usage: Some(json!({"output_tokens": output_tokens})),
        });
        events.push(StreamEvent::MessageStop);
        events
    }
}

/// Stateful translator from Anthropic events to OpenAI stream chunks.
///
/// Drives the streaming half of the `/v1/chat/completions` shim. `done()`
/// reports when the caller should append the `[DONE]` sentinel.
#[derive(Debug)]
pub struct AnthropicStreamToChatChunks {
    id: String,
    model: String,
    created: u64,
    tool_ordinal: u32,
    in_tool_block: bool,
    finish_reason: Option<String>,
    usage: Option<ChatUsage>,
    done: bool,
}

impl AnthropicStreamToChatChunks {
    pub fn new(model: &str) -> Self {
        Self {
            id: "chatcmpl-stream".to_string(),
            model: model.to_string(),
            created: unix_now(),
            tool_ordinal: 0,
            in_tool_block: false,
            finish_reason: None,
            usage: None,
            done: false,
        }
    }

    fn chunk(&self, delta: ChatDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatStreamChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
        }
    }

    pub fn done(&self) -> bool {
        self.done
    }

    pub fn on_event(&mut self, event: &StreamEvent) -> Vec<ChatCompletionChunk> {
        match event {
            StreamEvent::MessageStart { message } => {
                if let Some(id) = message.get("id").and_then(|v| v.as_str()) {
                    self.id = id.to_string();
                }
                if let Some(model) = message.get("model").and_then(|v| v.as_str()) {
                    if !model.is_empty() {
                        self.model = model.to_string();
                    }
                }
                vec![self.chunk(
                    ChatDelta {
                        role: Some("assistant".to_string()),
                        ..ChatDelta::default()
                    },
                    None,
                )]
            }
            StreamEvent::ContentBlockStart { content_block, .. } => {
                if content_block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
                    self.in_tool_block = true;
                    let chunk = self.chunk(
                        ChatDelta {
                            tool_calls: Some(vec![ToolCallDelta {
                                index: self.tool_ordinal,
                                id: content_block
                                    .get("id")
                                    .and_then(|v| v.as_str())
                                    .map(|s| s.to_string()),
                                call_type: Some("function".to_string()),
                                function: Some(FunctionCallDelta {
                                    name: content_block
                                        .get("name")
                                        .and_then(|v| v.as_str())
                                        .map(|s| s.to_string()),
                                    arguments: Some(String::new()),
                                }),
                            }]),
                            ..ChatDelta::default()
                        },
                        None,
                    );
                    vec![chunk]
                } else {
                    self.in_tool_block = false;
                    Vec::new()
                }
            }
            StreamEvent::ContentBlockDelta { delta, .. } => {
                match delta.get("type").and_then(|t| t.as_str()) {
                    Some("text_delta") => {
                        let text = delta.get("text").and_then(|t| t.as_str()).unwrap_or("");
                        vec![self.chunk(
                            ChatDelta {
                                content: Some(text.to_string()),
                                ..ChatDelta::default()
                            },
                            None,
                        )]
                    }
                    Some("input_json_delta") => {
                        let partial = delta
                            .get("partial_json")
                            .and_then(|t| t.as_str())
                            .unwrap_or("");
                        vec![self.chunk(
                            ChatDelta {
                                tool_calls: Some(vec![ToolCallDelta {
                                    index: self.tool_ordinal,
                                    id: None,
                                    call_type: None,
                                    function: Some(FunctionCallDelta {
                                        name: None,
                                        arguments: Some(partial.to_string()),
                                    }),
                                }]),
                                ..ChatDelta::default()
                            },
                            None,
                        )]
                    }
                    _ => Vec::new(),
                }
            }
            StreamEvent::ContentBlockStop { .. } => {
                if self.in_tool_block {
                    self.tool_ordinal += 1;
                    self.in_tool_block = false;
                }
                Vec::new()
            }
            StreamEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.get("stop_reason").and_then(|v| v.as_str()) {
                    self.finish_reason = Some(stop_reason_to_finish_reason(reason).to_string());
                }
                if let Some(n) = usage
                    .as_ref()
                    .and_then(|u| u.get("output_tokens"))
                    .and_then(|v| v.as_u64())
                {
                    self.usage = Some(ChatUsage {
                        prompt_tokens: 0,
                        completion_tokens: n,
                        total_tokens: n,
                    });
                }
                Vec::new()
            }
            StreamEvent::MessageStop => {
                self.done = true;
                let mut chunk = self.chunk(
                    ChatDelta::default(),
                    Some(
                        self.finish_reason
                            .clone()
                            .unwrap_or_else(|| "stop".to_string()),
                    ),
                );
                chunk.usage = self.usage.clone();
                vec![chunk]
            }
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(value: Value) -> MessagesRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn system_and_text_map_to_openai() {
        let req = request(json!({
            "model": "m",
            "max_tokens": 128,
            "system": "Be brief.",
            "messages": [{"role": "user", "content": "hello"}],
            "stop_sequences": ["END"]
        }));
        let openai = anthropic_to_openai_request(&req);
        assert_eq!(openai.messages[0].role, "system");
        assert_eq!(openai.messages[1].role, "user");
        assert_eq!(openai.messages[1].content, Some(json!("hello")));
        assert_eq!(openai.max_tokens, Some(128));
        assert_eq!(openai.stop, Some(json!(["END"])));
    }

    #[test]
    fn image_blocks_become_data_urls() {
        let req = request(json!({
            "model": "m",
            "max_tokens": 1,
            "messages": [{
                "role": "user",
                "content": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image", "source": {"type": "base64", "media_type": "image/png", "data": "AAAA"}}
                ]
            }]
        }));
        let openai = anthropic_to_openai_request(&req);
        let parts = openai.messages[0]
            .content
            .as_ref()
            .unwrap()
            .as_array()
            .unwrap();
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,AAAA");
    }

    #[test]
    fn tool_use_and_result_round_trip() {
        let req = request(json!({
            "model": "m",
            "max_tokens": 1,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_1", "name": "search", "input": {"q": "x"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_1", "content": "found it"}
                ]}
            ]
        }));
        let openai = anthropic_to_openai_request(&req);
        let calls = openai.messages[0].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "toolu_1");
        assert_eq!(calls[0].function.arguments, "{\"q\":\"x\"}");
        assert_eq!(openai.messages[1].role, "tool");
        assert_eq!(openai.messages[1].tool_call_id.as_deref(), Some("toolu_1"));

        let back = openai_to_anthropic_request(&openai);
        assert!(matches!(
            back.messages[0].content,
            MessageContent::Blocks(ref blocks)
                if matches!(blocks[0], ContentBlock::ToolUse { .. })
        ));
        assert!(matches!(
            back.messages[1].content,
            MessageContent::Blocks(ref blocks)
                if matches!(blocks[0], ContentBlock::ToolResult { .. })
        ));
    }

    #[test]
    fn finish_reasons_map_both_ways() {
        assert_eq!(finish_reason_to_stop_reason("stop"), "end_turn");
        assert_eq!(finish_reason_to_stop_reason("length"), "max_tokens");
        assert_eq!(finish_reason_to_stop_reason("tool_calls"), "tool_use");
        assert_eq!(
            finish_reason_to_stop_reason("content_filter"),
            "stop_sequence"
        );
        assert_eq!(stop_reason_to_finish_reason("end_turn"), "stop");
        assert_eq!(stop_reason_to_finish_reason("max_tokens"), "length");
        assert_eq!(stop_reason_to_finish_reason("tool_use"), "tool_calls");
    }

    #[test]
    fn openai_response_translates_to_anthropic() {
        let resp: ChatCompletionResponse = serde_json::from_value(json!({
            "id": "chatcmpl-1",
            "object": "chat.completion",
            "created": 1,
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": "hi"},
                "finish_reason": "length"
            }],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        }))
        .unwrap();
        let anthropic = openai_to_anthropic_response(&resp);
        assert_eq!(anthropic.stop_reason.as_deref(), Some("max_tokens"));
        assert!(matches!(anthropic.content[0], ContentBlock::Text { ref text } if text == "hi"));
        assert_eq!(anthropic.usage.as_ref().unwrap().input_tokens, 3);
    }

    #[test]
    fn stream_translator_emits_block_oriented_events() {
        let mut translator = OpenAiStreamTranslator::new();
        let first: ChatCompletionChunk = serde_json::from_value(json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"role": "assistant", "content": "Hel"}}]
        }))
        .unwrap();
        let events = translator.on_chunk(&first);
        assert_eq!(events[0].name(), "message_start");
        assert_eq!(events[1].name(), "content_block_start");
        assert_eq!(events[2].name(), "content_block_delta");

        let second: ChatCompletionChunk = serde_json::from_value(json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"content": "lo"}, "finish_reason": "stop"}]
        }))
        .unwrap();
        let events = translator.on_chunk(&second);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name(), "content_block_delta");

        let closing = translator.finish();
        let names: Vec<_> = closing.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec!["content_block_stop", "message_delta", "message_stop"]
        );
        if let StreamEvent::MessageDelta { delta, .. } = &closing[1] {
            assert_eq!(delta["stop_reason"], "end_turn");
        } else {
            panic!("expected message_delta");
        }
    }

    #[test]
    fn stream_translator_switches_to_tool_block() {
        let mut translator = OpenAiStreamTranslator::new();
        let text: ChatCompletionChunk = serde_json::from_value(json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"content": "thinking"}}]
        }))
        .unwrap();
        translator.on_chunk(&text);

        let tool: ChatCompletionChunk = serde_json::from_value(json!({
            "id": "c1", "object": "chat.completion.chunk", "created": 1, "model": "m",
            "choices": [{"index": 0, "delta": {"tool_calls": [{
                "index": 0, "id": "call_1", "type": "function",
                "function": {"name": "search", "arguments": "{\"q\":"}
            }]}}]
        }))
        .unwrap();
        let events = translator.on_chunk(&tool);
        let names: Vec<_> = events.iter().map(|e| e.name()).collect();
        assert_eq!(
            names,
            vec![
                "content_block_stop",
                "content_block_start",
                "content_block_delta"
            ]
        );
        if let StreamEvent::ContentBlockStart { content_block, .. } = &events[1] {
            assert_eq!(content_block["type"], "tool_use");
            assert_eq!(content_block["name"], "search");
        } else {
            panic!("expected tool_use block start");
        }
    }

    #[test]
    fn unary_replay_reconstructs_round_trip() {
        let response: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1",
            "type": "message",
            "role": "assistant",
            "content": [{"type": "text", "text": "cached"}],
            "model": "m",
            "stop_reason": "end_turn",
            "stop_sequence": null,
            "usage": {"input_tokens": 5, "output_tokens": 2}
        }))
        .unwrap();
        let events = unary_to_stream_events(&response);
        assert_eq!(events.first().unwrap().name(), "message_start");
        assert_eq!(events.last().unwrap().name(), "message_stop");

        let rebuilt = stream_events_to_unary(&events).unwrap();
        assert_eq!(rebuilt.id, "msg_1");
        assert!(matches!(
            rebuilt.content[0],
            ContentBlock::Text { ref text } if text == "cached"
        ));
        assert_eq!(rebuilt.usage.as_ref().unwrap().output_tokens, 2);
    }

    #[test]
    fn partial_stream_is_not_reconstructed() {
        let response: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1", "type": "message", "role": "assistant",
            "content": [{"type": "text", "text": "partial"}],
            "model": "m", "stop_reason": "end_turn", "stop_sequence": null,
            "usage": {"input_tokens": 1, "output_tokens": 1}
        }))
        .unwrap();
        let mut events = unary_to_stream_events(&response);
        events.pop();
        assert!(stream_events_to_unary(&events).is_none());
    }

    #[test]
    fn shim_chunks_carry_text_and_finish() {
        let response: MessagesResponse = serde_json::from_value(json!({
            "id": "msg_1", "type": "message", "role": "assistant",
            "content": [{"type": "text", "text": "hi"}],
            "model": "claude-3-5-sonnet-20241022",
            "stop_reason": "end_turn", "stop_sequence": null,
            "usage": {"input_tokens": 1, "output_tokens": 1}
        }))
        .unwrap();
        let mut shim = AnthropicStreamToChatChunks::new("claude-3-5-sonnet-20241022");
        let mut chunks = Vec::new();
        for event in unary_to_stream_events(&response) {
            chunks.extend(shim.on_event(&event));
        }
        assert!(shim.done());
        assert_eq!(
            chunks[0].choices[0].delta.role.as_deref(),
            Some("assistant")
        );
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("hi"));
        assert_eq!(
            chunks.last().unwrap().choices[0].finish_reason.as_deref(),
            Some("stop")
        );
    }
}
