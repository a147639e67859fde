//! Runtime types.

use serde::Serialize;

use alarmsage_core::{AlarmSageConfig, Error, Message, RetryPolicy, Timeouts};
use alarmsage_store::AlarmRecord;

/// Knobs for the agent loop, taken from the application config.
#[derive(Debug, Clone)]
pub struct AgentSettings {
    /// Upper bound on model calls within one turn.
    pub max_iterations: usize,
    pub default_machine_model: String,
    pub timeouts: Timeouts,
    pub retry: RetryPolicy,
}

impl AgentSettings {
    pub fn from_config(config: &AlarmSageConfig) -> Self {
        Self {
            max_iterations: config.max_agent_iterations,
            default_machine_model: config.default_machine_model.clone(),
            timeouts: config.timeouts.clone(),
            retry: config.retry.clone(),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            default_machine_model: "Model A".into(),
            timeouts: Timeouts::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// A user question addressed to a thread.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub thread_id: String,
    pub question: String,
    pub machine_model: String,
}

/// One streamed snapshot of the AI message being generated.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseFrame {
    pub thread_id: String,
    pub message_id: String,
    /// Cumulative text of the message so far.
    pub message: String,
}

/// What a finished turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub thread_id: String,
    /// Checkpoint sequence number written for this turn.
    pub seq: i64,
    /// Title derived on the thread's first turn.
    pub title: Option<String>,
    pub messages: Vec<Message>,
    /// Alarm records the alarm tool looked at during the turn.
    pub alarms: Vec<AlarmRecord>,
}

impl TurnOutcome {
    /// Text of the final AI message.
    pub fn answer(&self) -> &str {
        self.messages.last().map(|m| m.text()).unwrap_or_default()
    }
}

/// Events sent to the consumer of a streamed turn, in order. Exactly one of
/// `Completed` or `Failed` ends the stream.
#[derive(Debug)]
pub enum TurnEvent {
    Delta(ResponseFrame),
    Completed(TurnOutcome),
    Failed(Error),
}
