//! Provider-neutral request and stream types for tool-calling chat models.

use serde::{Deserialize, Serialize};

use alarmsage_core::{Message, ToolCall};

/// LLM provider identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LLMProvider {
    OpenAI,
    Anthropic,
    Groq,
}

impl std::fmt::Display for LLMProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LLMProvider::OpenAI => write!(f, "openai"),
            LLMProvider::Anthropic => write!(f, "anthropic"),
            LLMProvider::Groq => write!(f, "groq"),
        }
    }
}

/// One message as sent to a model.
#[derive(Debug, Clone, PartialEq)]
pub enum ChatMessage {
    System(String),
    User {
        text: String,
        /// `data:image/jpeg;base64,...` URLs sent alongside the text.
        images: Vec<String>,
    },
    Assistant {
        text: String,
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        tool_call_id: String,
        name: String,
        content: String,
        is_error: bool,
    },
}

impl ChatMessage {
    pub fn user(text: impl Into<String>) -> Self {
        ChatMessage::User {
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn user_with_images(text: impl Into<String>, images: Vec<String>) -> Self {
        ChatMessage::User {
            text: text.into(),
            images,
        }
    }

    /// Project a stored conversation into model messages.
    pub fn from_history(messages: &[Message]) -> Vec<ChatMessage> {
        messages
            .iter()
            .map(|m| match m {
                Message::Human { text, .. } => ChatMessage::user(text.clone()),
                Message::Ai {
                    text, tool_calls, ..
                } => ChatMessage::Assistant {
                    text: text.clone(),
                    tool_calls: tool_calls.clone(),
                },
                Message::Tool {
                    tool_call_id,
                    name,
                    text,
                    is_error,
                    ..
                } => ChatMessage::Tool {
                    tool_call_id: tool_call_id.clone(),
                    name: name.clone(),
                    content: text.clone(),
                    is_error: *is_error,
                },
            })
            .collect()
    }
}

/// A function the model may call: name, description, JSON schema.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// Everything needed for one model invocation.
#[derive(Debug, Clone)]
pub struct ModelRequest {
    pub messages: Vec<ChatMessage>,
    /// Empty means the model is not bound to any tools.
    pub tools: Vec<ToolSpec>,
    pub temperature: f64,
    pub max_tokens: usize,
}

impl ModelRequest {
    pub fn new(messages: Vec<ChatMessage>) -> Self {
        Self {
            messages,
            tools: Vec::new(),
            temperature: 0.0,
            max_tokens: 2048,
        }
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }
}

/// Fragment of a tool call as it arrives on the stream. Fragments with the
/// same `index` belong to the same call; `arguments` pieces concatenate.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ToolCallDelta {
    pub index: usize,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: String,
}

/// A single streamed item.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Token(String),
    ToolCall(ToolCallDelta),
    Done { tokens_used: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_projection() {
        let history = vec![
            Message::human("What is SW0100?"),
            Message::Ai {
                id: "a1".into(),
                text: String::new(),
                tool_calls: vec![ToolCall {
                    id: "call_1".into(),
                    name: "find_solution_for_machine_alarm".into(),
                    arguments: serde_json::json!({"alarmCode": "SW0100"}),
                }],
            },
            Message::Tool {
                id: "t1".into(),
                tool_call_id: "call_1".into(),
                name: "find_solution_for_machine_alarm".into(),
                text: "Turn the switch off".into(),
                is_error: false,
            },
        ];
        let projected = ChatMessage::from_history(&history);
        assert_eq!(projected[0], ChatMessage::user("What is SW0100?"));
        assert!(matches!(&projected[1], ChatMessage::Assistant { tool_calls, .. } if tool_calls.len() == 1));
        assert!(matches!(&projected[2], ChatMessage::Tool { tool_call_id, .. } if tool_call_id == "call_1"));
    }
}
