//! API Layer Module
//!
//! HTTP server and routes.

pub mod server;

// Re-exports for convenience
pub use server::{create_router, start_server};
