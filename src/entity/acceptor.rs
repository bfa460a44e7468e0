//! The TCP acceptor entity.
//!
//! Listens on a configured endpoint and spawns one I/O handler per
//! accepted connection. Recoverable accept failures are reported and
//! retried with an exponential backoff; fatal ones tear the entity down.

use crate::callback::{ErrorReporter, IoStateChange, ShutdownChange};
use crate::config::AcceptorConfig;
use crate::entity::{EntityCallbacks, EntityCommon, IoParent, Runtime};
use crate::handle::BasicIoInterface;
use crate::io::tcp::TcpIoHandler;
use crate::stop::StopListener;
use crate::{Error, Result};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tracing::{debug, error, info, warn};

const LISTEN_BACKLOG: u32 = 1024;

pub(crate) struct TcpAcceptorEntity {
    common: EntityCommon,
    config: AcceptorConfig,
    me: Weak<Self>,
    /// Currently active connection handlers, owned by the entity.
    handlers: Mutex<HashMap<u64, Arc<TcpIoHandler>>>,
    next_id: AtomicU64,
    runtime: Mutex<Option<Runtime>>,
    /// Interface of the most recently closed handler, carried in the
    /// terminal shutdown notification.
    last_interface: Mutex<BasicIoInterface>,
}

impl TcpAcceptorEntity {
    pub(crate) fn new(config: AcceptorConfig) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            common: EntityCommon::new(),
            config,
            me: me.clone(),
            handlers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            runtime: Mutex::new(None),
            last_interface: Mutex::new(BasicIoInterface::default()),
        })
    }

    pub(crate) fn is_started(&self) -> bool {
        self.common.is_started()
    }

    /// The bound endpoint, available while started. With a port of zero in
    /// the configuration this reveals the actual port.
    pub(crate) fn local_endpoint(&self) -> Option<SocketAddr> {
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
        let listener = match bind_listener(&self.config).await {
            Ok(listener) => listener,
            Err(err) => {
                self.common.cancel_start();
                return Err(err);
            }
        };

        let (notify_shutdown, _) = broadcast::channel(1);
        let callbacks = EntityCallbacks { io_state, error };
        *self.runtime.lock().unwrap() = Some(Runtime {
            notify_shutdown: notify_shutdown.clone(),
            callbacks: callbacks.clone(),
            local_endpoint: listener.local_addr().ok(),
        });

        // Subscribe before spawning so a stop racing with task startup is
        // never lost.
        let stop = StopListener::entity_wide(notify_shutdown.subscribe());
        tokio::spawn(accept_loop(entity, listener, notify_shutdown, callbacks, stop));
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

impl IoParent for TcpAcceptorEntity {
    fn handler_closed(&self, id: u64, error: Error) {
        let (handler, remaining) = {
            let mut handlers = self.handlers.lock().unwrap();
            let handler = handlers.remove(&id);
            (handler, handlers.len())
        };
        let Some(handler) = handler else { return };
        let Some(callbacks) = self.callbacks() else { return };
        (callbacks.error)(handler.interface(), &error);
        (callbacks.io_state)(handler.interface(), remaining, false);
        *self.last_interface.lock().unwrap() = handler.interface();
    }
}

async fn bind_listener(config: &AcceptorConfig) -> Result<TcpListener> {
    if config.reuse_address {
        let socket = if config.local_endpoint.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(config.local_endpoint)?;
        Ok(socket.listen(LISTEN_BACKLOG)?)
    } else {
        Ok(TcpListener::bind(config.local_endpoint).await?)
    }
}

/// Accept connections until a stop or a fatal error, then tear every
/// handler down and deliver the single shutdown notification.
#[tracing::instrument(skip_all, fields(local = %entity.config.local_endpoint))]
async fn accept_loop(
    entity: Arc<TcpAcceptorEntity>,
    listener: TcpListener,
    notify_shutdown: broadcast::Sender<()>,
    callbacks: EntityCallbacks,
    mut stop: StopListener,
) {
    info!("accepting inbound connections");
    // Every handler holds a clone; `recv` returns `None` once the last
    // handler has dropped.
    let (done_tx, mut done_rx) = mpsc::channel::<()>(1);
    let limit = entity
        .config
        .max_connections
        .map(|count| Arc::new(Semaphore::new(count)));

    let terminal = loop {
        // Wait for a connection slot when a limit is configured. The
        // permit travels with the handler and frees the slot on close.
        let permit = match &limit {
            Some(limit) => {
                let acquired = tokio::select! {
                    acquired = limit.clone().acquire_owned() => acquired,
                    _ = stop.recv() => break Error::ConnectionClosedLocally,
                };
                // The semaphore is never closed, so this cannot fail.
                Some(acquired.unwrap())
            }
            None => None,
        };

        let socket = tokio::select! {
            accepted = accept_with_backoff(&listener, &callbacks) => match accepted {
                Ok(socket) => socket,
                Err(err) => break err,
            },
            _ = stop.recv() => break Error::ConnectionClosedLocally,
        };

        let (local, peer) = match socket.local_addr().and_then(|local| {
            socket.peer_addr().map(|peer| (local, peer))
        }) {
            Ok(endpoints) => endpoints,
            Err(err) => {
                (callbacks.error)(BasicIoInterface::default(), &err.into());
                continue;
            }
        };

        let id = entity.next_id.fetch_add(1, Ordering::Relaxed);
        let parent: Weak<dyn IoParent> = entity.me.clone();
        let handler = TcpIoHandler::new(
            socket,
            id,
            local,
            peer,
            parent,
            notify_shutdown.clone(),
            permit,
            done_tx.clone(),
        );
        let total = {
            let mut handlers = entity.handlers.lock().unwrap();
            handlers.insert(id, handler.clone());
            handlers.len()
        };
        debug!(%peer, total, "connection admitted");
        (callbacks.io_state)(handler.interface(), total, true);
    };

    drop(listener);

    // Wake every read loop, then sweep handlers the application never
    // started so their closure is reported too.
    let _ = notify_shutdown.send(());
    let snapshot: Vec<_> = entity.handlers.lock().unwrap().values().cloned().collect();
    for handler in snapshot {
        handler.shutdown();
    }
    drop(done_tx);
    let _ = done_rx.recv().await;

    entity.common.stop();
    entity.runtime.lock().unwrap().take();
    info!(cause = %terminal, "acceptor stopped");
    let last = entity.last_interface.lock().unwrap().clone();
    entity.common.call_shutdown_change(last, terminal, 0);
}

/// Accept one connection, retrying recoverable failures with an
/// exponential backoff. After the wait exceeds 64 seconds the error is
/// treated as fatal and returned.
async fn accept_with_backoff(
    listener: &TcpListener,
    callbacks: &EntityCallbacks,
) -> Result<TcpStream> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok((socket, _)) => {
                debug!("accepted inbound connection");
                return Ok(socket);
            }
            Err(err) => {
                if backoff > 64 {
                    error!(cause = %err, "failed to accept inbound connection too many times");
                    return Err(err.into());
                }
                warn!(cause = %err, "accept error, retrying in {backoff} seconds");
                (callbacks.error)(BasicIoInterface::default(), &err.into());
            }
        }

        tokio::time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}
