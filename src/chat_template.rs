//! Chat-template conversion.
//!
//! Flattens an Anthropic Messages request into the Hugging Face chat-template
//! message list (plain role/content pairs) and renders a ChatML string. The
//! flattened form also feeds the classifier.

use serde::{Deserialize, Serialize};

use crate::models::anthropic::{ContentBlock, MessageContent, MessagesRequest, Role, SystemPrompt};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateMessage {
    pub role: String,
    pub content: String,
}

/// Convert a Messages request into chat-template form.
///
/// System text becomes a leading `system` message. Non-text blocks are
/// rendered as bracketed placeholders so the classifier still sees that they
/// were there.
pub fn convert_to_chat_template(request: &MessagesRequest) -> Vec<TemplateMessage> {
    let mut out = Vec::new();

    if let Some(system) = &request.system {
        let text = match system {
            SystemPrompt::Text(s) => s.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n\n"),
        };
        if !text.is_empty() {
            out.push(TemplateMessage {
                role: "system".to_string(),
                content: text,
            });
        }
    }

    for message in &request.messages {
        let role = match message.role {
            Role::User => "user",
            Role::Assistant => "assistant",
        };
        let content = match &message.content {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => {
                let mut parts = Vec::new();
                for block in blocks {
                    match block {
                        ContentBlock::Text { text } => parts.push(text.clone()),
                        ContentBlock::Image { .. } => parts.push("[Image]".to_string()),
                        ContentBlock::ToolUse { name, input, .. } => parts.push(format!(
                            "[Tool Use: {}]\n{}",
                            name,
                            serde_json::to_string_pretty(input).unwrap_or_default()
                        )),
                        ContentBlock::ToolResult {
                            tool_use_id,
                            content,
                        } => {
                            let rendered = match content {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            };
                            parts.push(format!("[Tool Result: {}]\n{}", tool_use_id, rendered));
                        }
                    }
                }
                parts.join("\n\n")
            }
        };
        out.push(TemplateMessage {
            role: role.to_string(),
            content,
        });
    }

    out
}

/// Render messages in ChatML framing.
pub fn apply_chat_template(messages: &[TemplateMessage], add_generation_prompt: bool) -> String {
    let mut parts: Vec<String> = messages
        .iter()
        .map(|m| format!("<|im_start|>{}\n{}<|im_end|>", m.role, m.content))
        .collect();
    if add_generation_prompt {
        parts.push("<|im_start|>assistant\n".to_string());
    }
    parts.join("\n")
}

/// Last user message text, used as the classifier's query.
pub fn last_user_query(messages: &[TemplateMessage]) -> Option<&str> {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
}
