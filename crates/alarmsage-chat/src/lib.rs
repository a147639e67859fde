//! Tool-calling chat models with streaming (OpenAI/Anthropic/Groq).
//!
//! The agent talks to a [`ChatModel`]; responses stream as text tokens and
//! tool-call fragments and are decoded once into a [`ModelTurn`].

pub mod config;
pub mod model;
pub mod providers;
pub mod scripted;
pub mod types;

pub use config::{create_chat_model, LLMConfig};
pub use model::{BoxedStream, ChatModel, ModelTurn, TurnCollector};
pub use providers::HttpChatModel;
pub use scripted::{Script, ScriptedModel};
pub use types::*;
