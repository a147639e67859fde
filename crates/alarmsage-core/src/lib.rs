//! AlarmSage Core: configuration, error taxonomy, retry policy, conversation model.

pub mod config;
pub mod error;
pub mod message;
pub mod retry;

pub use config::{
    collection_name, AlarmSageConfig, DataPaths, EmbeddingProviderKind, ManualCatalog, Timeouts,
};
pub use error::{Error, Result};
pub use message::{Message, ToolCall, VisibleMessage};
pub use retry::RetryPolicy;
