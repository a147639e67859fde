//! AlarmSage Store: SQLite alarms with FTS5 trigram + uint8 vector search,
//! manual chunk collections, conversation checkpoints.

pub mod checkpoint;
pub mod embedding;
pub mod manual;
pub mod schema;
pub mod sqlite;
pub mod types;
pub mod vector;

pub use checkpoint::PLACEHOLDER_TITLE;
pub use sqlite::{AlarmField, SqliteStore};
pub use types::*;
pub use vector::VectorIndex;
