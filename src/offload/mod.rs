//! The offload path.
//!
//! - [`invocation`]: buffer transfer and kernel launch on a live session
//! - [`handler`]: request validation and the scoped acquire → run → release unit

pub mod handler;
pub mod invocation;

pub use handler::{Gateway, OffloadRequest, OffloadResult};
