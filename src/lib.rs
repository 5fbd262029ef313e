//! offload-gateway: exposes a GPU vector-add kernel over HTTP.
//!
//! Requests go through three layers:
//!   handler (validate) → session manager (acquire) → invocation (copy, launch, copy back)
//!
//! Device sessions and buffers are owned RAII handles, so every path out of
//! a request releases what it acquired.

pub mod config;
pub mod device;
pub mod error;
pub mod metrics;
pub mod offload;
pub mod server;

pub use error::OffloadError;
