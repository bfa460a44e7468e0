//! The UDP entity.
//!
//! Owns a single socket and a single I/O handler; there is no fan-out. On
//! start the socket binds (or takes a wildcard ephemeral endpoint for
//! send-only use), joins the configured multicast group, and the opened
//! state-change fires immediately.

use crate::callback::{ErrorReporter, IoStateChange, ShutdownChange};
use crate::config::UdpConfig;
use crate::entity::{EntityCallbacks, EntityCommon, IoParent, Runtime};
use crate::handle::BasicIoInterface;
use crate::io::udp::UdpIoHandler;
use crate::stop::StopListener;
use crate::{Error, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::info;

pub(crate) struct UdpEntity {
    common: EntityCommon,
    config: UdpConfig,
    me: Weak<Self>,
    current: Mutex<Option<(u64, Arc<UdpIoHandler>)>>,
    next_id: AtomicU64,
    runtime: Mutex<Option<Runtime>>,
    last_error: Mutex<Option<Error>>,
    /// Interface of the closed handler, carried in the terminal shutdown
    /// notification.
    last_interface: Mutex<BasicIoInterface>,
}

impl UdpEntity {
    pub(crate) fn new(config: UdpConfig) -> Arc<Self> {
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
        match self.start_inner(io_state, error).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.current.lock().unwrap().take();
                self.runtime.lock().unwrap().take();
                self.common.cancel_start();
                Err(err)
            }
        }
    }

    async fn start_inner(&self, io_state: IoStateChange, error: ErrorReporter) -> Result<()> {
        let entity = self.me.upgrade().ok_or(Error::WeakReferenceExpired)?;

        let bind_addr = self
            .config
            .local_endpoint
            .unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
        let socket = UdpSocket::bind(bind_addr).await?;
        if let Some(group) = self.config.multicast_group {
            match group {
                IpAddr::V4(group) => socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?,
                IpAddr::V6(group) => socket.join_multicast_v6(&group, 0)?,
            }
        }
        let default_remote = match &self.config.default_remote_endpoint {
            Some(endpoint) => Some(resolve_endpoint(endpoint).await?),
            None => None,
        };
        let local = socket.local_addr()?;

        let (notify_shutdown, _) = broadcast::channel(1);
        let callbacks = EntityCallbacks { io_state, error };
        let (done_tx, done_rx) = mpsc::channel::<()>(1);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let parent: Weak<dyn IoParent> = self.me.clone();
        let handler = UdpIoHandler::new(
            Arc::new(socket),
            id,
            local,
            default_remote,
            parent,
            notify_shutdown.clone(),
            done_tx,
        );
        *self.current.lock().unwrap() = Some((id, handler.clone()));
        *self.runtime.lock().unwrap() = Some(Runtime {
            notify_shutdown: notify_shutdown.clone(),
            callbacks: callbacks.clone(),
            local_endpoint: Some(local),
        });

        let stop = StopListener::entity_wide(notify_shutdown.subscribe());
        tokio::spawn(supervise(entity, done_rx, stop));

        info!(%local, "udp endpoint open");
        (callbacks.io_state)(handler.interface(), 1, true);
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

impl IoParent for UdpEntity {
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

async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
    tokio::net::lookup_host(endpoint)
        .await
        .map_err(|err| Error::Resolver(format!("{endpoint}: {err}")))?
        .next()
        .ok_or_else(|| Error::Resolver(format!("{endpoint}: no addresses")))
}

/// Wait for the handler to end or the entity to stop, then report the
/// terminal shutdown.
async fn supervise(entity: Arc<UdpEntity>, mut done_rx: mpsc::Receiver<()>, mut stop: StopListener) {
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

    entity.common.stop();
    let terminal = entity
        .last_error
        .lock()
        .unwrap()
        .take()
        .unwrap_or(Error::ConnectionClosedLocally);
    entity.runtime.lock().unwrap().take();
    info!(cause = %terminal, "udp entity stopped");
    let last = entity.last_interface.lock().unwrap().clone();
    entity.common.call_shutdown_change(last, terminal, 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_joins_the_configured_multicast_group() {
        let config = UdpConfig {
            local_endpoint: Some("0.0.0.0:0".parse().unwrap()),
            default_remote_endpoint: None,
            multicast_group: Some("239.255.0.1".parse().unwrap()),
        };
        let entity = UdpEntity::new(config);

        let io_state: IoStateChange = Arc::new(|_, _, _| {});
        let error: ErrorReporter = Arc::new(|_, _| {});
        let (down_tx, mut down_rx) = mpsc::unbounded_channel();
        let shutdown_change: ShutdownChange = Box::new(move |_, cause, remaining| {
            let _ = down_tx.send((cause, remaining));
        });

        entity.start(io_state, error, shutdown_change).await.unwrap();
        assert!(entity.is_started());
        assert!(entity.local_endpoint().is_some());

        entity.stop().unwrap();
        let (cause, remaining) = down_rx.recv().await.unwrap();
        assert!(matches!(cause, Error::ConnectionClosedLocally));
        assert_eq!(remaining, 0);
    }
}
