//! AlarmSage runtime: the tool-calling agent.
//!
//! [`Agent`] runs one conversation turn as a small state machine (AGENT →
//! TOOLS → AGENT … → END), streams the answer as it is generated and
//! checkpoints the thread when the turn completes. [`Toolbox`] holds the two
//! tools the model may call.

mod generation;
pub mod locks;
pub mod orchestrator;
pub mod tools;
pub mod types;

#[cfg(test)]
mod testing;

pub use locks::{ThreadGuard, ThreadLocks};
pub use orchestrator::Agent;
pub use tools::{tool_specs, Toolbox, ToolInvocation, ToolOutput, ALARM_TOOL, MANUAL_TOOL};
pub use types::*;
