//! Worker server
//!
//! HTTP surface of a worker pool, reached by `pool::HttpPool`.

pub mod handlers;
pub mod state;

pub use handlers::create_router;
pub use state::WorkerState;
