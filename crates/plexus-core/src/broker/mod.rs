//! Unix socket broker that routes calls between participants.
//!
//! The broker accepts connections, runs one session task per client and a
//! single router task that owns all routing state. Sessions only decode
//! frames and forward them; the router decides where each envelope goes.
//!
//! # Thread Safety
//!
//! Sessions and the router communicate over unbounded channels. Each session
//! owns a writer task that drains its outbound queue, so a slow client never
//! stalls routing for the others.

mod router;

use crate::config::IpcConfig;
use crate::ipc::{read_envelope, write_envelope, Envelope};
use crate::{Error, Result};
use router::{ClientId, Router, RouterCommand};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

/// Handle to a running broker. Dropping shuts it down and removes the socket file.
pub struct BrokerHandle {
    path: PathBuf,
    shutdown_tx: Option<oneshot::Sender<()>>,
    conn_shutdown_tx: watch::Sender<bool>,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl BrokerHandle {
    /// Socket path the broker is listening on.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stop accepting connections and close every client session.
    pub fn shutdown(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = self.conn_shutdown_tx.send(true);
    }
}

impl Drop for BrokerHandle {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove socket {}: {}", self.path.display(), e);
            }
        }
    }
}

/// The routing broker.
pub struct Broker;

impl Broker {
    /// Listen on `path` and start routing.
    ///
    /// A stale socket file left at `path` by an earlier run is replaced.
    pub async fn start(path: impl AsRef<Path>) -> Result<BrokerHandle> {
        let path = path.as_ref().to_path_buf();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let listener = UnixListener::bind(&path)?;
        info!("Broker listening on {}", path.display());

        let (router_tx, router_rx) = mpsc::unbounded_channel();
        tokio::spawn(Router::new().run(router_rx));

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let active_connections = Arc::new(AtomicUsize::new(0));

        let task_handle = tokio::spawn(Self::accept_loop(
            listener,
            router_tx,
            shutdown_rx,
            conn_shutdown_rx,
            active_connections,
        ));

        Ok(BrokerHandle {
            path,
            shutdown_tx: Some(shutdown_tx),
            conn_shutdown_tx,
            task_handle: Some(task_handle),
        })
    }

    async fn accept_loop(
        listener: UnixListener,
        router: mpsc::UnboundedSender<RouterCommand>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        let mut next_client: ClientId = 0;
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Broker shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, _)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= IpcConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting connection: at max capacity ({})",
                                    IpcConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }

                            next_client += 1;
                            let client = next_client;
                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let router = router.clone();
                            let conns = active_connections.clone();
                            let mut conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("Client {} accepted", client);
                                if let Err(e) = Self::handle_client(stream, client, &router, &mut conn_shutdown).await {
                                    warn!("Client {} session ended: {}", client, e);
                                }
                                let _ = router.send(RouterCommand::Disconnected(client));
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
            }
        }
    }

    async fn handle_client(
        stream: UnixStream,
        client: ClientId,
        router: &mpsc::UnboundedSender<RouterCommand>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Result<()> {
        let (mut reader, mut writer) = stream.into_split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Envelope>();
        router
            .send(RouterCommand::Connected(client, outbound_tx))
            .map_err(|_| Error::Disconnected)?;

        let writer_task = tokio::spawn(async move {
            while let Some(envelope) = outbound_rx.recv().await {
                if let Err(e) = write_envelope(&mut writer, &envelope).await {
                    debug!("Write to client {} failed: {}", client, e);
                    break;
                }
            }
        });

        let outcome = loop {
            let envelope = tokio::select! {
                result = read_envelope(&mut reader) => match result {
                    Ok(Some(envelope)) => envelope,
                    Ok(None) => break Ok(()),
                    Err(e) => break Err(e),
                },
                _ = shutdown_rx.changed() => break Ok(()),
            };
            if router.send(RouterCommand::Received(client, envelope)).is_err() {
                break Err(Error::Disconnected);
            }
        };

        writer_task.abort();
        outcome
    }
}
