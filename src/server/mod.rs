//! HTTP server exposing the offload endpoint.
//!
//! - [`api`]: routes, application state and error responses

pub mod api;

pub use api::{build_router, AppState};
