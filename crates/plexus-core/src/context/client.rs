//! Caller side of a call.

use crate::connection::{CallEvent, Command, CommandSender};
use crate::ipc::{new_context_id, Call};
use crate::rpc::{ErrorKind, RpcError, RpcResult};
use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::debug;

/// Lifecycle of a call as seen by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Pending,
    Completed,
    Cancelled,
}

/// Caller-side handle for one outbound call.
///
/// Updates are delivered in the order the handler emitted them and always
/// before the final result. Dropping a context that is still pending cancels
/// the call.
#[derive(Debug)]
pub struct CallContext {
    id: String,
    function: String,
    args: Value,
    state: CallState,
    result: Option<RpcResult>,
    events: mpsc::UnboundedReceiver<CallEvent>,
    commands: CommandSender,
}

impl CallContext {
    /// Hand a new call to the connection loop.
    pub(crate) fn start(
        commands: &CommandSender,
        function: &str,
        args: Value,
        depth: u32,
    ) -> Result<Self> {
        let id = new_context_id();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let call = Call {
            context: id.clone(),
            function: function.to_string(),
            args: args.clone(),
            depth,
            handler: None,
        };

        commands
            .send(Command::Call {
                call,
                events: events_tx,
            })
            .map_err(|_| Error::Disconnected)?;

        debug!("Calling {} ({}, depth {})", function, id, depth);
        Ok(Self {
            id,
            function: function.to_string(),
            args,
            state: CallState::Pending,
            result: None,
            events: events_rx,
            commands: commands.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn function(&self) -> &str {
        &self.function
    }

    pub fn args(&self) -> &Value {
        &self.args
    }

    pub fn state(&self) -> CallState {
        self.state
    }

    /// Whether a final result has been observed or the call was cancelled.
    ///
    /// Reflects only what this handle has consumed; a result still queued
    /// counts once `recv`, `try_recv` or `wait` picks it up.
    pub fn done(&self) -> bool {
        self.state != CallState::Pending
    }

    /// Wait for the next update.
    ///
    /// Returns `Ok(None)` when the stream ends because the final result
    /// arrived; fetch it with [`Self::wait`]. Fails with [`Error::RpcDone`] if
    /// the call was already done and with [`Error::Disconnected`] if the
    /// connection went away first.
    pub async fn recv(&mut self) -> Result<Option<Value>> {
        if self.done() {
            return Err(Error::RpcDone);
        }
        match self.events.recv().await {
            Some(event) => Ok(self.observe(event)),
            None => Err(Error::Disconnected),
        }
    }

    /// Non-blocking [`Self::recv`].
    ///
    /// `Ok(None)` means no update is available right now, the stream just
    /// ended, or the call is already done; check [`Self::done`] to tell them
    /// apart.
    pub fn try_recv(&mut self) -> Result<Option<Value>> {
        if self.done() {
            return Ok(None);
        }
        match self.events.try_recv() {
            Ok(event) => Ok(self.observe(event)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(Error::Disconnected),
        }
    }

    /// Wait for the final result, discarding any unread updates.
    ///
    /// Once done, further calls return the same result.
    pub async fn wait(&mut self) -> Result<RpcResult> {
        loop {
            if let Some(result) = &self.result {
                return Ok(result.clone());
            }
            self.recv().await?;
        }
    }

    /// Wait for the final result and decode its `Ok` payload as `T`.
    ///
    /// An in-band error becomes [`Error::Rpc`] and a declined call
    /// [`Error::NotHandled`].
    pub async fn wait_for<T: DeserializeOwned>(&mut self) -> Result<T> {
        match self.wait().await? {
            RpcResult::Ok(value) => {
                serde_json::from_value(value).map_err(|e| Error::UnexpectedResult {
                    message: e.to_string(),
                    source: Some(e),
                })
            }
            RpcResult::Error(err) => Err(Error::Rpc(err)),
            RpcResult::NotHandled => Err(Error::NotHandled),
        }
    }

    /// Cancel the call.
    ///
    /// Takes effect locally at once: the context becomes done with an
    /// `Error(Cancelled)` result, and anything the handler sends afterwards is
    /// discarded. Fails with [`Error::RpcDone`] if the call already finished.
    pub fn cancel(&mut self) -> Result<()> {
        if self.done() {
            return Err(Error::RpcDone);
        }
        self.state = CallState::Cancelled;
        self.result = Some(RpcResult::Error(RpcError::new(ErrorKind::Cancelled)));
        self.events.close();

        if self
            .commands
            .send(Command::Cancel {
                context: self.id.clone(),
            })
            .is_err()
        {
            debug!("Connection gone; {} cancelled locally only", self.id);
        }
        Ok(())
    }

    fn observe(&mut self, event: CallEvent) -> Option<Value> {
        match event {
            CallEvent::Update(value) => Some(value),
            CallEvent::Finished(result) => {
                self.result = Some(result);
                self.state = CallState::Completed;
                None
            }
        }
    }
}

impl Drop for CallContext {
    fn drop(&mut self) {
        if self.state == CallState::Pending {
            let _ = self.commands.send(Command::Cancel {
                context: self.id.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn start_call() -> (
        CallContext,
        mpsc::UnboundedReceiver<Command>,
        mpsc::UnboundedSender<CallEvent>,
    ) {
        let (commands, mut loop_rx) = mpsc::unbounded_channel();
        let context = CallContext::start(&commands, "test.fn", json!({"x": 1}), 0).unwrap();
        let events = match loop_rx.try_recv() {
            Ok(Command::Call { call, events }) => {
                assert_eq!(call.context, context.id());
                assert_eq!(call.function, "test.fn");
                events
            }
            _ => panic!("expected a call command"),
        };
        (context, loop_rx, events)
    }

    #[tokio::test]
    async fn test_updates_then_result() {
        let (mut ctx, _loop_rx, events) = start_call();
        events.send(CallEvent::Update(json!(1))).unwrap();
        events.send(CallEvent::Update(json!(2))).unwrap();
        events
            .send(CallEvent::Finished(RpcResult::ok(json!("done"))))
            .unwrap();

        assert_eq!(ctx.recv().await.unwrap(), Some(json!(1)));
        assert_eq!(ctx.recv().await.unwrap(), Some(json!(2)));
        assert_eq!(ctx.recv().await.unwrap(), None);
        assert!(ctx.done());
        assert!(matches!(ctx.recv().await, Err(Error::RpcDone)));
        assert_eq!(ctx.state(), CallState::Completed);
    }

    #[tokio::test]
    async fn test_wait_skips_updates_and_is_idempotent() {
        let (mut ctx, _loop_rx, events) = start_call();
        events.send(CallEvent::Update(json!("ignored"))).unwrap();
        events
            .send(CallEvent::Finished(RpcResult::ok(json!(5))))
            .unwrap();

        assert_eq!(ctx.wait().await.unwrap(), RpcResult::ok(json!(5)));
        assert_eq!(ctx.wait().await.unwrap(), RpcResult::ok(json!(5)));
    }

    #[test]
    fn test_try_recv_does_not_block() {
        let (mut ctx, _loop_rx, events) = start_call();
        assert_eq!(ctx.try_recv().unwrap(), None);
        assert!(!ctx.done());

        events.send(CallEvent::Update(json!("a"))).unwrap();
        assert_eq!(ctx.try_recv().unwrap(), Some(json!("a")));

        events
            .send(CallEvent::Finished(RpcResult::not_handled()))
            .unwrap();
        assert_eq!(ctx.try_recv().unwrap(), None);
        assert!(ctx.done());
        assert_eq!(ctx.try_recv().unwrap(), None);
    }

    #[tokio::test]
    async fn test_wait_for_decodes_payload() {
        #[derive(serde::Deserialize)]
        struct Sum {
            sum: i64,
        }

        let (mut ctx, _loop_rx, events) = start_call();
        events
            .send(CallEvent::Finished(RpcResult::ok(json!({"sum": 5}))))
            .unwrap();

        let sum: Sum = ctx.wait_for().await.unwrap();
        assert_eq!(sum.sum, 5);

        let mismatch = ctx.wait_for::<String>().await;
        assert!(matches!(mismatch, Err(Error::UnexpectedResult { source: Some(_), .. })));
    }

    #[tokio::test]
    async fn test_wait_for_maps_error_and_not_handled() {
        let (mut failed, _loop_rx, events) = start_call();
        events
            .send(CallEvent::Finished(RpcResult::error(
                ErrorKind::InvalidArgs,
                json!("bad"),
            )))
            .unwrap();
        match failed.wait_for::<Value>().await {
            Err(Error::Rpc(err)) => {
                assert_eq!(err.kind, ErrorKind::InvalidArgs);
                assert_eq!(err.details, json!("bad"));
            }
            other => panic!("expected an rpc error, got {:?}", other),
        }

        let (mut declined, _loop_rx, events) = start_call();
        events
            .send(CallEvent::Finished(RpcResult::not_handled()))
            .unwrap();
        assert!(matches!(declined.wait_for::<Value>().await, Err(Error::NotHandled)));

        let (mut cancelled, _loop_rx, _events) = start_call();
        cancelled.cancel().unwrap();
        match cancelled.wait_for::<Value>().await {
            Err(Error::Rpc(err)) => assert_eq!(err.kind, ErrorKind::Cancelled),
            other => panic!("expected a cancelled error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_is_immediate_and_sends_cancel() {
        let (mut ctx, mut loop_rx, events) = start_call();
        ctx.cancel().unwrap();

        assert!(ctx.done());
        assert_eq!(ctx.state(), CallState::Cancelled);
        assert!(ctx.wait().await.unwrap().is_cancelled());
        assert!(matches!(ctx.cancel(), Err(Error::RpcDone)));

        match loop_rx.try_recv() {
            Ok(Command::Cancel { context }) => assert_eq!(context, ctx.id()),
            _ => panic!("expected a cancel command"),
        }

        // A late result from the handler is not observed.
        let _ = events.send(CallEvent::Finished(RpcResult::ok(json!(1))));
        assert!(ctx.wait().await.unwrap().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_after_completion_fails() {
        let (mut ctx, _loop_rx, events) = start_call();
        events
            .send(CallEvent::Finished(RpcResult::ok(json!(null))))
            .unwrap();
        ctx.wait().await.unwrap();
        assert!(matches!(ctx.cancel(), Err(Error::RpcDone)));
    }

    #[tokio::test]
    async fn test_closed_channel_reports_disconnected() {
        let (mut ctx, _loop_rx, events) = start_call();
        drop(events);

        assert!(matches!(ctx.recv().await, Err(Error::Disconnected)));
        assert!(matches!(ctx.wait().await, Err(Error::Disconnected)));
        assert!(matches!(ctx.try_recv(), Err(Error::Disconnected)));
        assert!(!ctx.done());
    }

    #[test]
    fn test_drop_while_pending_cancels() {
        let (ctx, mut loop_rx, _events) = start_call();
        let id = ctx.id().to_string();
        drop(ctx);

        match loop_rx.try_recv() {
            Ok(Command::Cancel { context }) => assert_eq!(context, id),
            _ => panic!("expected a cancel command"),
        }
    }

    #[tokio::test]
    async fn test_drop_after_completion_sends_nothing() {
        let (mut ctx, mut loop_rx, events) = start_call();
        events
            .send(CallEvent::Finished(RpcResult::ok(json!(0))))
            .unwrap();
        ctx.wait().await.unwrap();
        drop(ctx);
        assert!(loop_rx.try_recv().is_err());
    }

    #[test]
    fn test_start_on_closed_loop_fails() {
        let (commands, loop_rx) = mpsc::unbounded_channel();
        drop(loop_rx);
        let result = CallContext::start(&commands, "f", json!({}), 0);
        assert!(matches!(result, Err(Error::Disconnected)));
    }
}
