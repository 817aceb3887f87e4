//! One participant's session with the broker.
//!
//! A [`Connection`] owns a Unix socket and two background tasks:
//!
//! - a **reader** that decodes frames and forwards them to the I/O loop, so
//!   frame reads are never cancelled halfway through;
//! - the **I/O loop**, which exclusively owns the per-connection state
//!   (pending calls, running handlers, local registry) and writes every
//!   outbound frame.
//!
//! Public operations, [`CallContext`] and [`ServerContext`] talk to the loop
//! through an unbounded command channel; nothing else touches its state.

use crate::config::IpcConfig;
use crate::context::{CallContext, ServerContext};
use crate::handler::RpcHandler;
use crate::ipc::{
    new_context_id, read_envelope, write_envelope, Call, Envelope, HandlerId, Register, Update,
};
use crate::registry::HandlerRegistry;
use crate::rpc::RpcResult;
use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Inbound frames buffered between the reader task and the I/O loop.
const INBOUND_QUEUE: usize = 64;

pub(crate) type CommandSender = mpsc::UnboundedSender<Command>;

/// Requests from the public API to the I/O loop.
pub(crate) enum Command {
    Register {
        name: String,
        priority: u16,
        handler: Arc<dyn RpcHandler>,
        ack: oneshot::Sender<Result<()>>,
    },
    Call {
        call: Call,
        events: mpsc::UnboundedSender<CallEvent>,
    },
    Cancel {
        context: String,
    },
    Update {
        context: String,
        value: Value,
    },
    Finish {
        context: String,
        result: RpcResult,
    },
    Shutdown,
}

/// What the loop delivers to a [`CallContext`].
#[derive(Debug)]
pub(crate) enum CallEvent {
    Update(Value),
    Finished(RpcResult),
}

enum Pending {
    Call(mpsc::UnboundedSender<CallEvent>),
    Register {
        handler: HandlerId,
        ack: oneshot::Sender<Result<()>>,
    },
}

/// A participant's connection to the broker.
pub struct Connection {
    path: PathBuf,
    commands: CommandSender,
    closed: CancellationToken,
    io_task: Option<JoinHandle<()>>,
}

impl Connection {
    /// Connect to the broker listening at `path`.
    ///
    /// Fails with [`Error::Io`] if the socket cannot be opened within
    /// [`IpcConfig::CONNECT_TIMEOUT`].
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let stream = tokio::time::timeout(IpcConfig::CONNECT_TIMEOUT, UnixStream::connect(&path))
            .await
            .map_err(|_| Error::io(format!("Timed out connecting to {}", path.display())))??;

        debug!("Connected to broker at {}", path.display());

        let (read_half, write_half) = stream.into_split();
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();

        let reader_task = tokio::spawn(read_loop(read_half, inbound_tx));
        let io_loop = IoLoop {
            writer: write_half,
            commands: command_rx,
            command_sender: command_tx.clone(),
            inbound: inbound_rx,
            reader_task,
            closed: closed.clone(),
            pending: HashMap::new(),
            running: HashMap::new(),
            registry: HandlerRegistry::new(),
        };
        let io_task = tokio::spawn(io_loop.run());

        Ok(Self {
            path,
            commands: command_tx,
            closed,
            io_task: Some(io_task),
        })
    }

    /// Socket path this connection was opened on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the I/O loop is still running.
    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Register `handler` for calls to `name`.
    ///
    /// Returns once the broker has acknowledged the registration, so calls made
    /// afterwards by any participant can reach the handler. Fails with
    /// [`Error::RpcDone`] if this exact handler is already registered under
    /// `name`.
    pub async fn register(
        &self,
        name: impl Into<String>,
        priority: u16,
        handler: Arc<dyn RpcHandler>,
    ) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.commands
            .send(Command::Register {
                name: name.into(),
                priority,
                handler,
                ack: ack_tx,
            })
            .map_err(|_| Error::Disconnected)?;
        ack_rx.await.map_err(|_| Error::Disconnected)?
    }

    /// Start a call to `name`. Does not wait for the handler.
    pub fn call_rpc(&self, name: &str, args: Value) -> Result<CallContext> {
        if self.closed.is_cancelled() {
            return Err(Error::Disconnected);
        }
        CallContext::start(&self.commands, name, args, 0)
    }

    /// [`Self::call_rpc`] with arguments serialized from `args`.
    pub fn call_rpc_with<T: Serialize>(&self, name: &str, args: &T) -> Result<CallContext> {
        self.call_rpc(name, serde_json::to_value(args)?)
    }

    /// Close the session.
    ///
    /// Pending calls fail with [`Error::Disconnected`], running handlers see
    /// their context cancelled, local registrations are released. Calling it
    /// again is a no-op.
    pub async fn disconnect(&mut self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Some(task) = self.io_task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // The loop tears itself down; nothing to await here.
        let _ = self.commands.send(Command::Shutdown);
    }
}

async fn read_loop(mut reader: OwnedReadHalf, inbound: mpsc::Sender<Result<Envelope>>) {
    loop {
        let item = match read_envelope(&mut reader).await {
            Ok(Some(envelope)) => Ok(envelope),
            Ok(None) => return,
            Err(e) => Err(e),
        };
        let fatal = matches!(&item, Err(e) if e.is_fatal());
        if inbound.send(item).await.is_err() || fatal {
            return;
        }
    }
}

struct IoLoop {
    writer: OwnedWriteHalf,
    commands: mpsc::UnboundedReceiver<Command>,
    command_sender: CommandSender,
    inbound: mpsc::Receiver<Result<Envelope>>,
    reader_task: JoinHandle<()>,
    closed: CancellationToken,
    pending: HashMap<String, Pending>,
    running: HashMap<String, CancellationToken>,
    registry: HandlerRegistry,
}

impl IoLoop {
    async fn run(mut self) {
        let outcome = loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown) | None => break Ok(()),
                    Some(command) => {
                        if let Err(e) = self.on_command(command).await {
                            break Err(e);
                        }
                    }
                },
                inbound = self.inbound.recv() => match inbound {
                    Some(Ok(envelope)) => {
                        if let Err(e) = self.on_envelope(envelope).await {
                            break Err(e);
                        }
                    }
                    Some(Err(e)) if e.is_fatal() => break Err(e),
                    Some(Err(e)) => warn!("Skipping inbound frame: {}", e),
                    None => break Err(Error::Disconnected),
                },
            }
        };

        match &outcome {
            Ok(()) => debug!("Connection closed"),
            Err(Error::Disconnected) => info!("Broker closed the connection"),
            Err(e) => warn!("Connection terminated: {}", e),
        }
        self.teardown().await;
    }

    async fn send(&mut self, envelope: Envelope) -> Result<()> {
        write_envelope(&mut self.writer, &envelope).await
    }

    async fn on_command(&mut self, command: Command) -> Result<()> {
        match command {
            Command::Register {
                name,
                priority,
                handler,
                ack,
            } => {
                let handler_id = match self.registry.register(&name, priority, handler) {
                    Ok(id) => id,
                    Err(e) => {
                        let _ = ack.send(Err(e));
                        return Ok(());
                    }
                };
                let context = new_context_id();
                debug!("Registering {} (priority {}) as handler {}", name, priority, handler_id);
                self.pending.insert(
                    context.clone(),
                    Pending::Register {
                        handler: handler_id,
                        ack,
                    },
                );
                self.send(Envelope::Register(Register {
                    context,
                    function: name,
                    priority,
                    handler: handler_id,
                }))
                .await
            }
            Command::Call { call, events } => {
                self.pending
                    .insert(call.context.clone(), Pending::Call(events));
                self.send(Envelope::Call(call)).await
            }
            Command::Cancel { context } => {
                if self.pending.remove(&context).is_some() {
                    debug!("Cancelling call {}", context);
                    self.send(Envelope::cancel(context)).await?;
                }
                Ok(())
            }
            Command::Update { context, value } => {
                if !self.running.contains_key(&context) {
                    debug!("Dropping update for inactive call {}", context);
                    return Ok(());
                }
                self.send(Envelope::Update(Update { context, value })).await
            }
            Command::Finish { context, result } => {
                if self.running.remove(&context).is_none() {
                    debug!("Dropping result for inactive call {}", context);
                    return Ok(());
                }
                self.send(Envelope::result(context, result)).await
            }
            Command::Shutdown => Ok(()),
        }
    }

    async fn on_envelope(&mut self, envelope: Envelope) -> Result<()> {
        match envelope {
            Envelope::Call(call) => self.dispatch(call).await,
            Envelope::Update(update) => {
                match self.pending.get(&update.context) {
                    Some(Pending::Call(events)) => {
                        // The caller may have dropped its context already.
                        let _ = events.send(CallEvent::Update(update.value));
                    }
                    _ => debug!("Update for unknown call {}", update.context),
                }
                Ok(())
            }
            Envelope::Result(response) => {
                match self.pending.remove(&response.context) {
                    Some(Pending::Call(events)) => {
                        let _ = events.send(CallEvent::Finished(response.result));
                    }
                    Some(Pending::Register { handler, ack }) => {
                        let outcome = if response.result.is_ok() {
                            Ok(())
                        } else {
                            self.registry.remove(handler);
                            Err(Error::io(format!(
                                "Broker rejected registration: {:?}",
                                response.result
                            )))
                        };
                        let _ = ack.send(outcome);
                    }
                    None => debug!("Result for unknown call {}", response.context),
                }
                Ok(())
            }
            Envelope::Cancel(cancel) => {
                if let Some(token) = self.running.remove(&cancel.context) {
                    debug!("Call {} cancelled by caller", cancel.context);
                    token.cancel();
                }
                Ok(())
            }
            Envelope::Register(register) => {
                warn!("Ignoring register envelope from broker for {}", register.function);
                Ok(())
            }
        }
    }

    /// Run the handler the broker picked, on its own task.
    async fn dispatch(&mut self, call: Call) -> Result<()> {
        let handler = call.handler.and_then(|id| self.registry.get(id)).cloned();

        let Some(handler) = handler else {
            // Deregistered while the call was in flight: let the broker try the next one.
            debug!("No local handler for {} ({:?})", call.function, call.handler);
            return self
                .send(Envelope::result(call.context, RpcResult::not_handled()))
                .await;
        };

        if self.running.contains_key(&call.context) {
            warn!("Ignoring duplicate dispatch of call {}", call.context);
            return Ok(());
        }

        let token = CancellationToken::new();
        self.running.insert(call.context.clone(), token.clone());

        debug!("Dispatching {} ({})", call.function, call.context);
        let context = ServerContext::new(
            call.context,
            call.args.clone(),
            call.depth,
            token,
            self.command_sender.clone(),
        );
        tokio::spawn(async move {
            handler.call(context, call.args).await;
        });
        Ok(())
    }

    async fn teardown(mut self) {
        self.closed.cancel();
        self.reader_task.abort();

        for (_, pending) in self.pending.drain() {
            // Dropping a call's event sender is what reports Disconnected to it.
            if let Pending::Register { ack, .. } = pending {
                let _ = ack.send(Err(Error::Disconnected));
            }
        }
        for (_, token) in self.running.drain() {
            token.cancel();
        }
        if !self.registry.is_empty() {
            debug!("Releasing {} local handlers", self.registry.len());
            self.registry.clear();
        }
        self.commands.close();
        let _ = self.writer.shutdown().await;
    }
}
