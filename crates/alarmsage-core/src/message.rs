//! Conversation messages persisted per thread.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// A tool invocation requested by the language model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// One entry of a conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Message {
    Human {
        id: String,
        text: String,
    },
    Ai {
        id: String,
        text: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },
    Tool {
        id: String,
        tool_call_id: String,
        name: String,
        text: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl Message {
    pub fn human(text: impl Into<String>) -> Self {
        Message::Human {
            id: new_message_id(),
            text: text.into(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Message::Human { id, .. } | Message::Ai { id, .. } | Message::Tool { id, .. } => id,
        }
    }

    pub fn text(&self) -> &str {
        match self {
            Message::Human { text, .. } | Message::Ai { text, .. } | Message::Tool { text, .. } => {
                text
            }
        }
    }

    /// Tool calls carried by an AI message (empty for every other variant).
    pub fn tool_calls(&self) -> &[ToolCall] {
        match self {
            Message::Ai { tool_calls, .. } => tool_calls,
            _ => &[],
        }
    }

    /// Only human messages and AI messages with text are shown to users.
    pub fn is_visible(&self) -> bool {
        match self {
            Message::Human { .. } => true,
            Message::Ai { text, .. } => !text.is_empty(),
            Message::Tool { .. } => false,
        }
    }
}

/// User-facing projection of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisibleMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
}

/// Filter a thread down to what the chat UI displays.
pub fn visible_messages(messages: &[Message]) -> Vec<VisibleMessage> {
    messages
        .iter()
        .filter(|m| m.is_visible())
        .map(|m| VisibleMessage {
            id: m.id().to_string(),
            kind: match m {
                Message::Human { .. } => "HumanMessage".into(),
                _ => "AIMessage".into(),
            },
            content: m.text().to_string(),
        })
        .collect()
}

/// Check that every tool call is answered by a tool message before the next
/// human message, and that no tool message answers an unknown call.
pub fn validate_sequence(messages: &[Message]) -> Result<()> {
    unanswered_calls(messages).map(|_| ())
}

/// Like [`validate_sequence`], but also rejects trailing unanswered tool calls.
/// A thread must be in this state at every turn boundary.
pub fn validate_complete(messages: &[Message]) -> Result<()> {
    match unanswered_calls(messages)? {
        0 => Ok(()),
        n => Err(Error::Consistency(format!(
            "thread ends with {} unanswered tool call(s)",
            n
        ))),
    }
}

fn unanswered_calls(messages: &[Message]) -> Result<usize> {
    let mut pending: HashSet<&str> = HashSet::new();
    for message in messages {
        match message {
            Message::Human { id, .. } => {
                if !pending.is_empty() {
                    return Err(Error::Consistency(format!(
                        "human message {} arrived with {} unanswered tool call(s)",
                        id,
                        pending.len()
                    )));
                }
            }
            Message::Ai { tool_calls, .. } => {
                if !pending.is_empty() {
                    return Err(Error::Consistency(
                        "AI message arrived before pending tool results".into(),
                    ));
                }
                pending.extend(tool_calls.iter().map(|c| c.id.as_str()));
            }
            Message::Tool { tool_call_id, .. } => {
                if !pending.remove(tool_call_id.as_str()) {
                    return Err(Error::Consistency(format!(
                        "tool result for unknown call {}",
                        tool_call_id
                    )));
                }
            }
        }
    }
    Ok(pending.len())
}

pub fn new_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

pub fn new_thread_id() -> String {
    format!("thr_{}", uuid::Uuid::new_v4().simple())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ai(text: &str, calls: Vec<ToolCall>) -> Message {
        Message::Ai {
            id: new_message_id(),
            text: text.into(),
            tool_calls: calls,
        }
    }

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "find_info_from_manual".into(),
            arguments: serde_json::json!({"question": "spindle"}),
        }
    }

    fn tool(call_id: &str) -> Message {
        Message::Tool {
            id: new_message_id(),
            tool_call_id: call_id.into(),
            name: "find_info_from_manual".into(),
            text: "answer".into(),
            is_error: false,
        }
    }

    #[test]
    fn test_visible_filter_hides_tool_traffic() {
        let messages = vec![
            Message::human("What is SW0100?"),
            ai("", vec![call("c1")]),
            tool("c1"),
            ai("Turn the parameter switch off.", vec![]),
        ];
        let visible = visible_messages(&messages);
        assert_eq!(visible.len(), 2);
        assert_eq!(visible[0].kind, "HumanMessage");
        assert_eq!(visible[1].kind, "AIMessage");
        assert_eq!(visible[1].content, "Turn the parameter switch off.");
    }

    #[test]
    fn test_sequence_accepts_answered_calls() {
        let messages = vec![
            Message::human("q"),
            ai("", vec![call("c1"), call("c2")]),
            tool("c2"),
            tool("c1"),
            ai("done", vec![]),
            Message::human("next"),
        ];
        assert!(validate_sequence(&messages).is_ok());
    }

    #[test]
    fn test_sequence_rejects_unanswered_call() {
        let messages = vec![Message::human("q"), ai("", vec![call("c1")]), Message::human("again")];
        assert!(matches!(validate_sequence(&messages), Err(Error::Consistency(_))));
    }

    #[test]
    fn test_complete_rejects_trailing_call() {
        let messages = vec![Message::human("q"), ai("", vec![call("c1")])];
        assert!(validate_sequence(&messages).is_ok());
        assert!(matches!(validate_complete(&messages), Err(Error::Consistency(_))));
    }

    #[test]
    fn test_sequence_rejects_orphan_tool_result() {
        let messages = vec![Message::human("q"), tool("missing")];
        assert!(validate_sequence(&messages).is_err());
    }

    #[test]
    fn test_serde_tagging() {
        let msg = ai("hello", vec![]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "ai");
        assert!(json.get("tool_calls").is_none());
        let back: Message = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }
}
