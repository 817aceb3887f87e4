//! Plexus Core - broker-mediated RPC over Unix domain sockets.
//!
//! Participants connect to a [`Broker`], register named handlers with a
//! priority, and call functions by name without knowing who serves them. The
//! broker routes each call to the highest-priority handler and falls through
//! to the next one whenever a handler answers `NotHandled`. Handlers may
//! stream updates before their final result, and callers may cancel.
//!
//! # Example
//!
//! ```rust,ignore
//! use plexus_core::{handler_fn, Broker, Connection, RpcResult};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> plexus_core::Result<()> {
//!     let broker = Broker::start("/tmp/plexus.sock").await?;
//!
//!     let server = Connection::connect(broker.path()).await?;
//!     server
//!         .register("math.add", 100, handler_fn(|mut ctx, args| async move {
//!             let sum = args["a"].as_i64().unwrap_or(0) + args["b"].as_i64().unwrap_or(0);
//!             let _ = ctx.finish(RpcResult::ok(json!({ "sum": sum })));
//!         }))
//!         .await?;
//!
//!     let client = Connection::connect(broker.path()).await?;
//!     let mut call = client.call_rpc("math.add", json!({ "a": 2, "b": 3 }))?;
//!     println!("{:?}", call.wait().await?);
//!
//!     Ok(())
//! }
//! ```

pub mod broker;
pub mod config;
pub mod connection;
pub mod context;
pub mod error;
pub mod handler;
pub mod ipc;
pub mod platform;
pub mod registry;
pub mod rpc;

// Re-export commonly used types
pub use broker::{Broker, BrokerHandle};
pub use config::{IpcConfig, PriorityConfig};
pub use connection::Connection;
pub use context::{CallContext, CallState, ServerContext};
pub use error::{Error, Result};
pub use handler::{handler_fn, FnHandler, RpcHandler};
pub use rpc::{ErrorKind, RpcError, RpcResult};
pub use tokio_util::sync::CancellationToken;
