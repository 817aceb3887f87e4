//! Handler side of a call.

use super::CallContext;
use crate::config::IpcConfig;
use crate::connection::{Command, CommandSender};
use crate::rpc::RpcResult;
use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Handler-side handle for one inbound call.
///
/// Every call ends with exactly one [`Self::finish`]. A handler that returns
/// without finishing answers `NotHandled`, so the broker moves on to the next
/// handler.
#[derive(Debug)]
pub struct ServerContext {
    id: String,
    args: Value,
    depth: u32,
    cancellation: CancellationToken,
    finished: bool,
    commands: CommandSender,
}

impl ServerContext {
    pub(crate) fn new(
        id: String,
        args: Value,
        depth: u32,
        cancellation: CancellationToken,
        commands: CommandSender,
    ) -> Self {
        Self {
            id,
            args,
            depth,
            cancellation,
            finished: false,
            commands,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    /// Nesting depth of this call (0 for top-level calls).
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Whether the caller cancelled or the connection closed.
    pub fn cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Token tripped on cancellation, for `select!`-style waiting.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Stream a partial result to the caller.
    ///
    /// Updates after cancellation are silently dropped.
    pub fn update(&self, value: Value) -> Result<()> {
        if self.finished {
            return Err(Error::RpcDone);
        }
        self.commands
            .send(Command::Update {
                context: self.id.clone(),
                value,
            })
            .map_err(|_| Error::Disconnected)
    }

    /// Serialize `value` and stream it as an update.
    pub fn update_with<T: Serialize>(&self, value: &T) -> Result<()> {
        self.update(serde_json::to_value(value)?)
    }

    /// End the call with `result`.
    ///
    /// Fails with [`Error::RpcDone`] on a second call. If the caller cancelled
    /// or the connection is gone the result is dropped.
    pub fn finish(&mut self, result: RpcResult) -> Result<()> {
        if self.finished {
            return Err(Error::RpcDone);
        }
        self.finished = true;

        if self
            .commands
            .send(Command::Finish {
                context: self.id.clone(),
                result,
            })
            .is_err()
        {
            debug!("Connection gone; dropping result for {}", self.id);
        }
        Ok(())
    }

    /// Start a nested call on the same connection.
    ///
    /// Fails with [`Error::CallDepthExceeded`] once the chain grows past
    /// [`IpcConfig::MAX_CALL_DEPTH`].
    pub fn call_rpc(&self, name: &str, args: Value) -> Result<CallContext> {
        let depth = self.depth + 1;
        if depth > IpcConfig::MAX_CALL_DEPTH {
            return Err(Error::CallDepthExceeded {
                depth,
                max: IpcConfig::MAX_CALL_DEPTH,
            });
        }
        CallContext::start(&self.commands, name, args, depth)
    }

    /// [`Self::call_rpc`] with arguments serialized from `args`.
    pub fn call_rpc_with<T: Serialize>(&self, name: &str, args: &T) -> Result<CallContext> {
        self.call_rpc(name, serde_json::to_value(args)?)
    }
}

impl Drop for ServerContext {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if !self.cancellation.is_cancelled() {
            warn!("Handler for {} returned without finishing; passing it on", self.id);
        }
        let _ = self.commands.send(Command::Finish {
            context: self.id.clone(),
            result: RpcResult::not_handled(),
        });
    }
}
