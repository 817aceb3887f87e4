//! The two ends of an in-flight call.
//!
//! - [`CallContext`]: the caller's handle for streaming updates, waiting on
//!   the result or cancelling.
//! - [`ServerContext`]: the handler's handle for emitting updates, finishing
//!   the call and making nested calls.

mod client;
mod server;

pub use client::{CallContext, CallState};
pub use server::ServerContext;
