//! A chat model that replays canned responses. Used by tests across the
//! workspace in place of a live provider.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::model::{BoxedStream, ChatModel};
use crate::types::{ModelRequest, StreamChunk, ToolCallDelta};
use alarmsage_core::{Error, Result};

/// One scripted reply.
#[derive(Debug)]
pub enum Script {
    /// Stream these text pieces, then finish.
    Text(Vec<String>),
    /// Optional text, then tool calls as `(id, name, raw JSON arguments)`.
    Calls(String, Vec<(String, String, String)>),
    /// Stream these pieces, then fail mid-stream.
    TextThenError(Vec<String>, Error),
    /// Fail before producing anything.
    Error(Error),
    /// Produce nothing for this long, then answer.
    Stall(Duration, String),
}

impl Script {
    pub fn text(text: &str) -> Self {
        Script::Text(vec![text.to_string()])
    }

    pub fn call(id: &str, name: &str, arguments: serde_json::Value) -> Self {
        Script::Calls(
            String::new(),
            vec![(id.to_string(), name.to_string(), arguments.to_string())],
        )
    }
}

/// Replays scripts in order and records every request it receives.
#[derive(Default)]
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    pub fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().clone()
    }

    pub fn remaining(&self) -> usize {
        self.scripts.lock().len()
    }
}

#[async_trait]
impl ChatModel for ScriptedModel {
    fn stream(&self, request: ModelRequest) -> BoxedStream {
        self.requests.lock().push(request);
        let script = self.scripts.lock().pop_front();

        Box::pin(async_stream::try_stream! {
            let script = script.ok_or_else(|| Error::Internal("scripted model exhausted".into()))?;
            match script {
                Script::Text(pieces) => {
                    let n = pieces.len();
                    for p in pieces {
                        yield StreamChunk::Token(p);
                    }
                    yield StreamChunk::Done { tokens_used: n };
                }
                Script::Calls(text, calls) => {
                    if !text.is_empty() {
                        yield StreamChunk::Token(text);
                    }
                    for (index, (id, name, arguments)) in calls.into_iter().enumerate() {
                        yield StreamChunk::ToolCall(ToolCallDelta {
                            index,
                            id: Some(id),
                            name: Some(name),
                            arguments,
                        });
                    }
                    yield StreamChunk::Done { tokens_used: 0 };
                }
                Script::TextThenError(pieces, err) => {
                    for p in pieces {
                        yield StreamChunk::Token(p);
                    }
                    Err::<(), Error>(err)?;
                }
                Script::Error(err) => {
                    Err::<(), Error>(err)?;
                }
                Script::Stall(delay, text) => {
                    tokio::time::sleep(delay).await;
                    yield StreamChunk::Token(text);
                    yield StreamChunk::Done { tokens_used: 1 };
                }
            }
        })
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ModelTurn, TurnCollector};
    use crate::types::ChatMessage;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_replays_in_order_and_records_requests() {
        let model = ScriptedModel::new(vec![
            Script::call("c1", "find_info_from_manual", serde_json::json!({"question": "q"})),
            Script::text("done"),
        ]);

        let mut collector = TurnCollector::new();
        let mut stream = model.stream(ModelRequest::new(vec![ChatMessage::user("hi")]));
        while let Some(chunk) = stream.next().await {
            collector.push(chunk.unwrap());
        }
        assert!(matches!(collector.finish().unwrap(), ModelTurn::ToolRequest { .. }));

        let text = model
            .complete(ModelRequest::new(vec![ChatMessage::user("again")]))
            .await
            .unwrap();
        assert_eq!(text, "done");
        assert_eq!(model.requests().len(), 2);
        assert_eq!(model.remaining(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_script_is_an_error() {
        let model = ScriptedModel::default();
        let err = model
            .complete(ModelRequest::new(vec![ChatMessage::user("hi")]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
