//! The chat model seam and decoding of a streamed response into a turn.

use std::collections::{BTreeMap, HashSet};
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_stream::StreamExt;

use crate::types::{ModelRequest, StreamChunk, ToolCallDelta};
use alarmsage_core::{Error, Result, ToolCall};

/// Boxed stream type for returning different stream implementations.
pub type BoxedStream = Pin<Box<dyn Stream<Item = Result<StreamChunk>> + Send>>;

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Start a streaming completion. Errors (including HTTP status errors)
    /// arrive as stream items; the stream ends after `Done` or an error.
    fn stream(&self, request: ModelRequest) -> BoxedStream;

    fn name(&self) -> &str;

    /// Non-streaming convenience: the concatenated text of one completion.
    async fn complete(&self, request: ModelRequest) -> Result<String> {
        let mut stream = self.stream(request);
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::Token(t) => text.push_str(&t),
                StreamChunk::ToolCall(_) => {}
                StreamChunk::Done { .. } => break,
            }
        }
        Ok(text)
    }
}

/// A model response, decoded once.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelTurn {
    PlainAnswer(String),
    ToolRequest { text: String, calls: Vec<ToolCall> },
}

impl ModelTurn {
    pub fn text(&self) -> &str {
        match self {
            ModelTurn::PlainAnswer(text) | ModelTurn::ToolRequest { text, .. } => text,
        }
    }
}

#[derive(Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Accumulates streamed chunks into a [`ModelTurn`].
#[derive(Default)]
pub struct TurnCollector {
    text: String,
    calls: BTreeMap<usize, PartialCall>,
    done: bool,
}

impl TurnCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one chunk. Returns the cumulative text when the chunk added text.
    pub fn push(&mut self, chunk: StreamChunk) -> Option<&str> {
        match chunk {
            StreamChunk::Token(t) if !t.is_empty() => {
                self.text.push_str(&t);
                Some(&self.text)
            }
            StreamChunk::Token(_) => None,
            StreamChunk::ToolCall(delta) => {
                self.add_call_delta(delta);
                None
            }
            StreamChunk::Done { .. } => {
                self.done = true;
                None
            }
        }
    }

    fn add_call_delta(&mut self, delta: ToolCallDelta) {
        let entry = self.calls.entry(delta.index).or_default();
        if let Some(id) = delta.id.filter(|id| !id.is_empty()) {
            entry.id = Some(id);
        }
        if let Some(name) = delta.name {
            entry.name.push_str(&name);
        }
        entry.arguments.push_str(&delta.arguments);
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Decode the accumulated response.
    ///
    /// A call without a name, whose arguments are not a JSON object, or whose
    /// id repeats an earlier call's id, is `Error::MalformedToolCall`.
    pub fn finish(self) -> Result<ModelTurn> {
        if self.calls.is_empty() {
            return Ok(ModelTurn::PlainAnswer(self.text));
        }

        let mut calls = Vec::with_capacity(self.calls.len());
        let mut ids = HashSet::new();
        for (index, partial) in self.calls {
            let name = partial.name.trim().to_string();
            if name.is_empty() {
                return Err(Error::MalformedToolCall(format!(
                    "tool call #{} has no name",
                    index
                )));
            }
            let raw = partial.arguments.trim();
            let arguments: serde_json::Value = if raw.is_empty() {
                serde_json::json!({})
            } else {
                serde_json::from_str(raw).map_err(|e| {
                    Error::MalformedToolCall(format!(
                        "arguments of {} are not valid JSON: {}",
                        name, e
                    ))
                })?
            };
            if !arguments.is_object() {
                return Err(Error::MalformedToolCall(format!(
                    "arguments of {} must be a JSON object",
                    name
                )));
            }
            let id = partial
                .id
                .unwrap_or_else(|| format!("call_{}", uuid::Uuid::new_v4().simple()));
            if !ids.insert(id.clone()) {
                return Err(Error::MalformedToolCall(format!(
                    "tool call id {} is used more than once",
                    id
                )));
            }
            calls.push(ToolCall {
                id,
                name,
                arguments,
            });
        }

        Ok(ModelTurn::ToolRequest {
            text: self.text,
            calls,
        })
    }
}
