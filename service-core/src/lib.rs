//! service-core: Shared infrastructure for control-plane services.
pub mod api;
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;

pub use axum;
pub use serde;
pub use serde_json;
pub use tracing;
