//! The TCP connector entity.
//!
//! Resolves its configured endpoints, connects, and runs one I/O handler
//! at a time. With reconnect enabled the connector re-enters the connect
//! phase after a failed attempt or a lost connection, waiting the
//! configured backoff in between; otherwise the first terminal condition
//! shuts the entity down.

use crate::callback::{ErrorReporter, IoStateChange, ShutdownChange};
use crate::config::ConnectorConfig;
use crate::entity::{EntityCallbacks, EntityCommon, IoParent, Runtime};
use crate::handle::BasicIoInterface;
use crate::io::tcp::TcpIoHandler;
use crate::stop::StopListener;
use crate::{Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

pub(crate) struct TcpConnectorEntity {
    common: EntityCommon,
    config: ConnectorConfig,
    me: Weak<Self>,
    /// The active connection's handler, at most one.
    current: Mutex<Option<(u64, Arc<TcpIoHandler>)>>,
    next_id: AtomicU64,
    runtime: Mutex<Option<Runtime>>,
    /// Why the last connection ended; becomes the terminal error when
    /// reconnect is disabled.
    last_error: Mutex<Option<Error>>,
    /// Interface of the most recently closed handler, carried in the
    /// terminal shutdown notification.
    last_interface: Mutex<BasicIoInterface>,
}

impl TcpConnectorEntity {
    pub(crate) fn new(config: ConnectorConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            common: EntityCommon::new(),
            config,
            me: me.clone(),
            current: Mutex::new(None),
            next_id: AtomicU64::new(0),
            runtime: Mutex::new(None),
            last_error: Mutex::new(None),
            last_interface: Mutex::new(BasicIoInterface::default()),
        })
    }

    pub(crate) fn is_started(&self) -> bool {
        self.common.is_started()
    }

    pub(crate) fn local_endpoint(&self) -> Option<std::net::SocketAddr> {
        self.runtime
            .lock()
            .unwrap()
            .as_ref()
            .and_then(|runtime| runtime.local_endpoint)
    }

    pub(crate) async fn start(
        &self,
        io_state: IoStateChange,
        error: ErrorReporter,
        shutdown_change: ShutdownChange,
    ) -> Result<()> {
        if !self.common.start(shutdown_change) {
            return Err(Error::EntityAlreadyStarted);
        }
        let entity = match self.me.upgrade() {
            Some(entity) => entity,
            None => {
                self.common.cancel_start();
                return Err(Error::WeakReferenceExpired);
            }
        };
        if self.config.remote_endpoints.is_empty() {
            self.common.cancel_start();
            return Err(Error::Resolver("no remote endpoints configured".into()));
        }

        let (notify_shutdown, _) = broadcast::channel(1);
        let callbacks = EntityCallbacks { io_state, error };
        *self.runtime.lock().unwrap() = Some(Runtime {
            notify_shutdown: notify_shutdown.clone(),
            callbacks: callbacks.clone(),
            local_endpoint: None,
        });

        let stop = StopListener::entity_wide(notify_shutdown.subscribe());
        tokio::spawn(connect_loop(entity, notify_shutdown, callbacks, stop));
        Ok(())
    }

    pub(crate) fn stop(&self) -> Result<()> {
        if !self.common.stop() {
            return Err(Error::EntityNotStarted);
        }
        if let Some(runtime) = self.runtime.lock().unwrap().as_ref() {
            let _ = runtime.notify_shutdown.send(());
        }
        Ok(())
    }

    fn callbacks(&self) -> Option<EntityCallbacks> {
        self.runtime
            .lock()
            .unwrap()
            .as_ref()
            .map(|runtime| runtime.callbacks.clone())
    }
}

impl IoParent for TcpConnectorEntity {
    fn handler_closed(&self, id: u64, error: Error) {
        let handler = {
            let mut current = self.current.lock().unwrap();
            match current.take() {
                Some((current_id, handler)) if current_id == id => Some(handler),
                other => {
                    *current = other;
                    None
                }
            }
        };
        let Some(handler) = handler else { return };
        let Some(callbacks) = self.callbacks() else { return };
        (callbacks.error)(handler.interface(), &error);
        (callbacks.io_state)(handler.interface(), 0, false);
        *self.last_error.lock().unwrap() = Some(error);
        *self.last_interface.lock().unwrap() = handler.interface();
    }
}

#[tracing::instrument(skip_all)]
async fn connect_loop(
    entity: Arc<TcpConnectorEntity>,
    notify_shutdown: broadcast::Sender<()>,
    callbacks: EntityCallbacks,
    mut stop: StopListener,
) {
    let terminal = loop {
        let attempt = tokio::select! {
            attempt = connect_once(&entity.config) => attempt,
            _ = stop.recv() => break Error::ConnectionClosedLocally,
        };

        match attempt {
            Ok(socket) => {
                if let Err(err) =
                    run_connection(&entity, socket, &notify_shutdown, &callbacks, &mut stop)
                        .await
                {
                    (callbacks.error)(BasicIoInterface::default(), &err);
                }
            }
            Err(err) => {
                if entity.config.reconnect_backoff.is_none() {
                    break err;
                }
                (callbacks.error)(BasicIoInterface::default(), &err);
            }
        }

        if stop.fired() || !entity.common.is_started() {
            break Error::ConnectionClosedLocally;
        }
        let Some(backoff) = entity.config.reconnect_backoff else {
            break entity
                .last_error
                .lock()
                .unwrap()
                .take()
                .unwrap_or(Error::ConnectionClosedByPeer);
        };
        debug!(?backoff, "waiting before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = stop.recv() => break Error::ConnectionClosedLocally,
        }
    };

    entity.common.stop();
    entity.runtime.lock().unwrap().take();
    info!(cause = %terminal, "connector stopped");
    let last = entity.last_interface.lock().unwrap().clone();
    entity.common.call_shutdown_change(last, terminal, 0);
}

/// Try each configured endpoint in order, resolving per attempt.
async fn connect_once(config: &ConnectorConfig) -> Result<TcpStream> {
    let mut last: Option<Error> = None;

    for endpoint in &config.remote_endpoints {
        let addrs = match tokio::net::lookup_host(endpoint.as_str()).await {
            Ok(addrs) => addrs,
            Err(err) => {
                last = Some(Error::Resolver(format!("{endpoint}: {err}")));
                continue;
            }
        };
        let mut resolved_any = false;
        for addr in addrs {
            resolved_any = true;
            match TcpStream::connect(addr).await {
                Ok(socket) => {
                    debug!(%addr, "connected");
                    return Ok(socket);
                }
                Err(err) => last = Some(err.into()),
            }
        }
        if !resolved_any {
            last = Some(Error::Resolver(format!("{endpoint}: no addresses")));
        }
    }

    Err(last.unwrap_or_else(|| Error::Resolver("no remote endpoints configured".into())))
}

/// Admit the new connection's handler and wait until it closes or the
/// entity stops.
async fn run_connection(
    entity: &Arc<TcpConnectorEntity>,
    socket: TcpStream,
    notify_shutdown: &broadcast::Sender<()>,
    callbacks: &EntityCallbacks,
    stop: &mut StopListener,
) -> Result<()> {
    let local = socket.local_addr()?;
    let peer = socket.peer_addr()?;
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
    let id = entity.next_id.fetch_add(1, Ordering::Relaxed);
    let parent: Weak<dyn IoParent> = entity.me.clone();
    let handler = TcpIoHandler::new(
        socket,
        id,
        local,
        peer,
        parent,
        notify_shutdown.clone(),
        None,
        done_tx,
    );
    *entity.current.lock().unwrap() = Some((id, handler.clone()));
    info!(%peer, "connection established");
    (callbacks.io_state)(handler.interface(), 1, true);
    drop(handler);

    tokio::select! {
        _ = done_rx.recv() => {}
        _ = stop.recv() => {
            let handler = entity
                .current
                .lock()
                .unwrap()
                .as_ref()
                .map(|(_, handler)| handler.clone());
            if let Some(handler) = handler {
                handler.shutdown();
            }
            let _ = done_rx.recv().await;
        }
    }
    Ok(())
}
