//! Sluice Web - HTTP surface of the stream proxy
//!
//! Exposes source resolution, HLS segment serving and session release to the
//! browser catalog, plus operational endpoints for inspecting sessions.

pub mod handlers;
pub mod server;

// Re-export main types
pub use handlers::ApiError;
pub use server::{AppState, ServerError, build_router, run_server};
