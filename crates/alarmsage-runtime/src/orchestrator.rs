//! Agent orchestrator: the AGENT → TOOLS → AGENT loop for one conversation
//! turn, streaming of the answer, and the turn-boundary checkpoint.

use std::sync::Arc;

use futures::future::join_all;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::generation::{self, next_chunk};
use crate::locks::ThreadLocks;
use crate::tools::{ToolOutput, Toolbox};
use crate::types::*;
use alarmsage_chat::{ChatMessage, ChatModel, ModelRequest, ModelTurn, TurnCollector};
use alarmsage_core::message::new_message_id;
use alarmsage_core::retry::with_timeout;
use alarmsage_core::{Error, Message, Result, ToolCall};
use alarmsage_store::SqliteStore;

/// Buffered events per streamed turn before the producer waits for the reader.
const EVENT_BUFFER: usize = 64;

pub struct Agent {
    store: Arc<SqliteStore>,
    model: Arc<dyn ChatModel>,
    tools: Arc<Toolbox>,
    locks: ThreadLocks,
    settings: AgentSettings,
}

impl Agent {
    pub fn new(
        store: Arc<SqliteStore>,
        model: Arc<dyn ChatModel>,
        tools: Arc<Toolbox>,
        settings: AgentSettings,
    ) -> Self {
        info!(
            "Agent initialized: model={}, max_iterations={}",
            model.name(),
            settings.max_iterations
        );
        Self {
            store,
            model,
            tools,
            locks: ThreadLocks::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// The machine model a turn should use: the requested one, or the
    /// configured default. Unknown models are rejected before a turn starts.
    pub fn resolve_machine_model(&self, requested: Option<&str>) -> Result<String> {
        let model = requested
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .unwrap_or(&self.settings.default_machine_model);
        if !self.tools.manuals().registry().contains(model) {
            return Err(Error::Validation(format!("unknown machine model '{}'", model)));
        }
        Ok(model.to_string())
    }

    /// Run a turn in its own task and stream its events.
    ///
    /// Dropping the receiver cancels the turn: in-flight model and tool calls
    /// are dropped and nothing is checkpointed.
    pub fn stream_turn(self: &Arc<Self>, request: TurnRequest) -> mpsc::Receiver<TurnEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let agent = Arc::clone(self);

        tokio::spawn(async move {
            let thread_id = request.thread_id.clone();
            tokio::select! {
                _ = tx.closed() => {
                    info!("Consumer went away; turn on thread {} cancelled", thread_id);
                }
                result = agent.run_turn(&request, &tx) => {
                    let event = match result {
                        Ok(outcome) => TurnEvent::Completed(outcome),
                        Err(e) => {
                            error!("Turn on thread {} failed: {}", thread_id, e);
                            TurnEvent::Failed(e)
                        }
                    };
                    let _ = tx.send(event).await;
                }
            }
        });

        rx
    }

    /// Run one turn to completion and checkpoint it.
    ///
    /// Text deltas go to `events` as they arrive. The thread's checkpoint is
    /// written only if the turn reaches the end; any error leaves the thread
    /// exactly as it was.
    pub async fn run_turn(
        &self,
        request: &TurnRequest,
        events: &mpsc::Sender<TurnEvent>,
    ) -> Result<TurnOutcome> {
        let thread_id = request.thread_id.as_str();
        let _guard = self.locks.acquire(thread_id).await;

        let prior = self.store.latest_checkpoint(thread_id)?;
        let first_turn = prior.is_none();
        let mut messages = prior.map(|c| c.messages).unwrap_or_default();
        messages.push(Message::human(request.question.clone()));
        debug!(
            "Turn on thread {} starts with {} message(s)",
            thread_id,
            messages.len()
        );

        let mut alarms = Vec::new();
        let mut iteration = 0;
        loop {
            if iteration >= self.settings.max_iterations {
                return Err(Error::IterationLimit(self.settings.max_iterations));
            }
            iteration += 1;

            let (message_id, turn) = self.call_model(thread_id, &messages, events).await?;
            match turn {
                ModelTurn::PlainAnswer(text) => {
                    messages.push(Message::Ai {
                        id: message_id,
                        text,
                        tool_calls: Vec::new(),
                    });
                    break;
                }
                ModelTurn::ToolRequest { text, calls } => {
                    debug!("Agent step {} requested {} tool call(s)", iteration, calls.len());
                    let results = self.run_tools(&calls, &request.machine_model).await?;
                    messages.push(Message::Ai {
                        id: message_id,
                        text,
                        tool_calls: calls,
                    });
                    for (message, found) in results {
                        messages.push(message);
                        alarms.extend(found);
                    }
                }
            }
        }

        let title = if first_turn {
            self.derive_title(&request.question).await
        } else {
            None
        };
        let seq = self
            .store
            .save_turn(thread_id, title.as_deref(), &messages)?;
        info!(
            "Turn on thread {} checkpointed at seq {} after {} agent step(s)",
            thread_id, seq, iteration
        );

        Ok(TurnOutcome {
            thread_id: thread_id.to_string(),
            seq,
            title,
            messages,
            alarms,
        })
    }

    /// AGENT step: one tool-bound model call, decoded into a [`ModelTurn`].
    ///
    /// Transient failures are retried only while nothing has been streamed
    /// for this message; after the first delta they end the turn.
    async fn call_model(
        &self,
        thread_id: &str,
        messages: &[Message],
        events: &mpsc::Sender<TurnEvent>,
    ) -> Result<(String, ModelTurn)> {
        let message_id = new_message_id();
        let request =
            ModelRequest::new(ChatMessage::from_history(messages)).with_tools(self.tools.specs());
        let policy = &self.settings.retry;
        let max_attempts = policy.max_attempts.max(1);

        let mut attempt = 1;
        loop {
            let mut streamed = false;
            match self
                .stream_once(thread_id, &message_id, request.clone(), events, &mut streamed)
                .await
            {
                Ok(turn) => return Ok((message_id, turn)),
                Err(e) if !streamed && e.is_retryable() && attempt < max_attempts => {
                    let delay = policy.delay_for(&e, attempt);
                    warn!(
                        "Model call failed (attempt {}/{}): {}; retrying in {:?}",
                        attempt, max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn stream_once(
        &self,
        thread_id: &str,
        message_id: &str,
        request: ModelRequest,
        events: &mpsc::Sender<TurnEvent>,
        streamed: &mut bool,
    ) -> Result<ModelTurn> {
        let mut stream = self.model.stream(request);
        let mut collector = TurnCollector::new();
        let mut started = false;

        while let Some(chunk) = next_chunk(&mut stream, &self.settings.timeouts, started).await? {
            started = true;
            if let Some(text) = collector.push(chunk) {
                let frame = ResponseFrame {
                    thread_id: thread_id.to_string(),
                    message_id: message_id.to_string(),
                    message: text.to_string(),
                };
                *streamed = true;
                events
                    .send(TurnEvent::Delta(frame))
                    .await
                    .map_err(|_| Error::Cancelled("consumer disconnected".into()))?;
            }
            if collector.is_done() {
                break;
            }
        }

        collector.finish()
    }

    /// TOOLS step: run every requested call concurrently and answer each one
    /// in request order. Failures become error results the model can react
    /// to, except those that end the turn.
    async fn run_tools(
        &self,
        calls: &[ToolCall],
        machine_model: &str,
    ) -> Result<Vec<(Message, Vec<alarmsage_store::AlarmRecord>)>> {
        let outputs = join_all(
            calls
                .iter()
                .map(|call| self.tools.invoke(call, machine_model)),
        )
        .await;

        let mut results = Vec::with_capacity(calls.len());
        for (call, output) in calls.iter().zip(outputs) {
            let (text, is_error, alarms) = match output {
                Ok(ToolOutput { content, alarms }) => (content, false, alarms),
                Err(e) if e.is_fatal_for_turn() => return Err(e),
                Err(Error::Validation(message)) => {
                    warn!("Tool call {} rejected: {}", call.id, message);
                    let body = json!({"error": "validation", "message": message});
                    (body.to_string(), true, Vec::new())
                }
                Err(e) => {
                    warn!("Tool call {} ({}) failed: {}", call.id, call.name, e);
                    (format!("Error: {}", e), true, Vec::new())
                }
            };
            results.push((
                Message::Tool {
                    id: new_message_id(),
                    tool_call_id: call.id.clone(),
                    name: call.name.clone(),
                    text,
                    is_error,
                },
                alarms,
            ));
        }
        Ok(results)
    }

    /// Short thread title from the first question. Failure is not an error;
    /// the store falls back to its placeholder title.
    async fn derive_title(&self, question: &str) -> Option<String> {
        let prompt = format!(
            "Summarise the question into a phrase: {} and do not respond with quotation marks.",
            question
        );
        let timeouts = &self.settings.timeouts;
        let request = ModelRequest::new(vec![ChatMessage::user(prompt)]);
        let limit = timeouts.model_first_chunk() + timeouts.model_idle();
        match with_timeout(
            "thread title",
            limit,
            generation::complete(self.model.as_ref(), request, timeouts),
        )
        .await
        {
            Ok(title) => {
                let title = title.trim().trim_matches('"').trim();
                (!title.is_empty()).then(|| title.to_string())
            }
            Err(e) => {
                warn!("Title generation failed: {}", e);
                None
            }
        }
    }
}
