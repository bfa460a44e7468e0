//! The per-socket UDP I/O handler.
//!
//! Datagrams are delivered whole, one message-handler invocation each, so
//! there is no framer. Outgoing datagrams ride the same queue discipline as
//! TCP, with an explicit destination per element.

use crate::callback::{MessageFramer, MessageHandler};
use crate::entity::IoParent;
use crate::handle::{BasicIoInterface, IoOutput};
use crate::io::{IoBase, IoHandlerOps, OutputQueueStats};
use crate::stop::StopListener;
use crate::{Error, Result, MAX_UDP_PAYLOAD};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

pub(crate) struct UdpIoHandler {
    base: IoBase,
    id: u64,
    socket: Arc<UdpSocket>,
    local: SocketAddr,
    /// Destination for sends that carry no explicit endpoint.
    default_remote: Option<SocketAddr>,
    parent: Weak<dyn IoParent>,
    me: Weak<Self>,
    stop_tx: broadcast::Sender<()>,
    entity_shutdown: broadcast::Sender<()>,
    state: Mutex<UdpState>,
    _done: mpsc::Sender<()>,
}

struct UdpState {
    write_tx: Option<mpsc::UnboundedSender<(Bytes, SocketAddr)>>,
    failure: Option<Error>,
    phase: Phase,
}

#[derive(PartialEq)]
enum Phase {
    Created,
    Running,
    Closed,
}

impl UdpIoHandler {
    pub(crate) fn new(
        socket: Arc<UdpSocket>,
        id: u64,
        local: SocketAddr,
        default_remote: Option<SocketAddr>,
        parent: Weak<dyn IoParent>,
        entity_shutdown: broadcast::Sender<()>,
        done: mpsc::Sender<()>,
    ) -> Arc<Self> {
        let (stop_tx, _) = broadcast::channel(1);
        Arc::new_cyclic(|me| Self {
            base: IoBase::new(),
            id,
            socket,
            local,
            default_remote,
            parent,
            me: me.clone(),
            stop_tx,
            entity_shutdown,
            state: Mutex::new(UdpState {
                write_tx: None,
                failure: None,
                phase: Phase::Created,
            }),
            _done: done,
        })
    }

    pub(crate) fn interface(&self) -> BasicIoInterface {
        BasicIoInterface::new(self.ops_weak())
    }

    fn ops_weak(&self) -> Weak<dyn IoHandlerOps> {
        let ops: Weak<dyn IoHandlerOps> = self.me.clone();
        ops
    }

    fn output(&self) -> IoOutput {
        IoOutput::new(self.ops_weak())
    }

    /// Entity-side stop; mirrors the TCP handler.
    pub(crate) fn shutdown(&self) {
        if self.base.set_io_stopped() {
            let _ = self.stop_tx.send(());
        } else {
            self.finalize_unstarted();
        }
    }

    fn finalize_unstarted(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Created {
                return;
            }
            state.phase = Phase::Closed;
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.handler_closed(self.id, Error::ConnectionClosedLocally);
        }
    }

    fn write_failed(&self, error: Error) {
        self.state.lock().unwrap().failure.get_or_insert(error);
        let _ = self.stop_tx.send(());
    }

    fn teardown(&self, error: Error) {
        self.base.set_io_stopped();
        let error = {
            let mut state = self.state.lock().unwrap();
            state.write_tx.take();
            state.phase = Phase::Closed;
            state.failure.take().unwrap_or(error)
        };
        if let Some(parent) = self.parent.upgrade() {
            parent.handler_closed(self.id, error);
        }
    }
}

impl IoHandlerOps for UdpIoHandler {
    fn is_io_started(&self) -> bool {
        self.base.is_io_started()
    }

    fn start_io(
        &self,
        read_size: usize,
        _framer: Option<MessageFramer>,
        handler: MessageHandler,
    ) -> Result<()> {
        if !self.base.set_io_started() {
            return Err(Error::IoHandlerAlreadyStarted);
        }
        let me = self.me.upgrade().ok_or(Error::WeakReferenceExpired)?;
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Created {
                self.base.set_io_stopped();
                return Err(Error::ConnectionClosedLocally);
            }
            state.phase = Phase::Running;
            state.write_tx = Some(write_tx);
        }

        let stop =
            StopListener::for_handler(self.entity_shutdown.subscribe(), self.stop_tx.subscribe());
        tokio::spawn(write_loop(me.clone(), write_rx));
        tokio::spawn(read_loop(me, read_size, handler, stop));

        if !self.base.is_io_started() {
            let _ = self.stop_tx.send(());
        }
        Ok(())
    }

    fn stop_io(&self) -> Result<()> {
        if !self.base.set_io_stopped() {
            return Err(Error::IoHandlerNotStarted);
        }
        let _ = self.stop_tx.send(());
        Ok(())
    }

    fn send_to(&self, buf: Bytes, endpoint: Option<SocketAddr>) -> Result<()> {
        if !self.base.is_io_started() {
            return Err(Error::IoHandlerNotStarted);
        }
        if buf.len() > MAX_UDP_PAYLOAD {
            return Err(Error::UdpMaxBufSizeExceeded {
                size: buf.len(),
                max: MAX_UDP_PAYLOAD,
            });
        }
        let destination = endpoint
            .or(self.default_remote)
            .ok_or(Error::NoUdpDestination)?;
        if self.base.start_write_setup(&buf, Some(destination)) {
            let state = self.state.lock().unwrap();
            if let Some(write_tx) = &state.write_tx {
                let _ = write_tx.send((buf, destination));
            }
        }
        Ok(())
    }

    fn queue_stats(&self) -> OutputQueueStats {
        self.base.queue_stats()
    }

    fn local_endpoint(&self) -> SocketAddr {
        self.local
    }

    fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.default_remote
    }
}

async fn write_loop(
    handler: Arc<UdpIoHandler>,
    mut write_rx: mpsc::UnboundedReceiver<(Bytes, SocketAddr)>,
) {
    while let Some(element) = write_rx.recv().await {
        let mut next = Some(element);
        while let Some((buf, destination)) = next {
            if let Err(err) = handler.socket.send_to(&buf, destination).await {
                debug!(cause = %err, "datagram send failed");
                handler.write_failed(err.into());
                return;
            }
            next = handler
                .base
                .get_next_element()
                .map(|(buf, endpoint)| (buf, endpoint.unwrap_or(destination)));
        }
    }
}

#[tracing::instrument(skip_all, fields(local = %handler.local))]
async fn read_loop(
    handler: Arc<UdpIoHandler>,
    max_read_size: usize,
    mut message_handler: MessageHandler,
    mut stop: StopListener,
) {
    let mut scratch = vec![0u8; max_read_size.max(1)];
    let error = loop {
        let received = tokio::select! {
            received = handler.socket.recv_from(&mut scratch) => received,
            _ = stop.recv() => break Error::ConnectionClosedLocally,
        };
        match received {
            Ok((len, peer)) => {
                let message = Bytes::copy_from_slice(&scratch[..len]);
                if !message_handler(message, handler.output(), peer) {
                    break Error::MessageHandlerTerminated;
                }
            }
            Err(err) => break err.into(),
        }
    };
    debug!(cause = %error, "udp handler closing");
    handler.teardown(error);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct TestParent {
        closed: StdMutex<Vec<Error>>,
    }

    impl IoParent for TestParent {
        fn handler_closed(&self, _id: u64, error: Error) {
            self.closed.lock().unwrap().push(error);
        }
    }

    async fn bound_handler(
        default_remote: Option<SocketAddr>,
    ) -> (Arc<UdpIoHandler>, Arc<TestParent>) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let local = socket.local_addr().unwrap();
        let parent = Arc::new(TestParent {
            closed: StdMutex::new(Vec::new()),
        });
        let (done_tx, _done_rx) = mpsc::channel(1);
        let (entity_shutdown, _) = broadcast::channel(1);
        let parent_dyn: Arc<dyn IoParent> = parent.clone();
        let parent_ref: Weak<dyn IoParent> = Arc::downgrade(&parent_dyn);
        let handler = UdpIoHandler::new(
            Arc::new(socket),
            1,
            local,
            default_remote,
            parent_ref,
            entity_shutdown,
            done_tx,
        );
        (handler, parent)
    }

    #[tokio::test]
    async fn datagrams_flow_in_both_directions() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let peer_addr = peer.local_addr().unwrap();

        let (handler, _parent) = bound_handler(Some(peer_addr)).await;
        let handler_addr = handler.local_endpoint();

        let (msg_tx, mut msg_rx) = mpsc::unbounded_channel();
        handler
            .start_io(
                1024,
                None,
                Box::new(move |message, _output, peer| {
                    let _ = msg_tx.send((message, peer));
                    true
                }),
            )
            .unwrap();

        // Outbound: one explicit destination, one default.
        handler
            .send_to(Bytes::from_static(b"first"), Some(peer_addr))
            .unwrap();
        handler.send_to(Bytes::from_static(b"second"), None).unwrap();

        let mut buf = [0u8; 64];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"first");
        assert_eq!(from, handler_addr);
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], b"second");

        // Inbound: one datagram, one handler invocation.
        peer.send_to(b"reply", handler_addr).await.unwrap();
        let (message, from) = msg_rx.recv().await.unwrap();
        assert_eq!(message, Bytes::from_static(b"reply"));
        assert_eq!(from, peer_addr);
    }

    #[tokio::test]
    async fn send_validation() {
        let (handler, _parent) = bound_handler(None).await;

        assert!(matches!(
            handler.send_to(Bytes::from_static(b"x"), None),
            Err(Error::IoHandlerNotStarted)
        ));

        handler
            .start_io(64, None, Box::new(|_, _, _| true))
            .unwrap();

        assert!(matches!(
            handler.send_to(Bytes::from_static(b"x"), None),
            Err(Error::NoUdpDestination)
        ));

        let oversized = Bytes::from(vec![0u8; MAX_UDP_PAYLOAD + 1]);
        let destination = handler.local_endpoint();
        assert!(matches!(
            handler.send_to(oversized, Some(destination)),
            Err(Error::UdpMaxBufSizeExceeded { .. })
        ));
    }
}
