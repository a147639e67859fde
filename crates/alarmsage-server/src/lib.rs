//! AlarmSage HTTP server: routes, shared state and offline indexing.

pub mod error;
pub mod indexing;
pub mod routes;
pub mod state;

pub use routes::build_router;
pub use state::AppState;
