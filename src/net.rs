//! The facade owning every created network entity.

use crate::config::{AcceptorConfig, ConnectorConfig, EntityKind, UdpConfig};
use crate::entity::acceptor::TcpAcceptorEntity;
use crate::entity::connector::TcpConnectorEntity;
use crate::entity::udp::UdpEntity;
use crate::handle::{BasicNetEntity, EntityRef};
use std::sync::{Arc, Mutex, Weak};

/// Owns the collection of network entities and hands out weak handles.
///
/// Entities live as long as the facade holds them (or until [`Net::remove`]
/// releases one); handles never extend lifetimes. Dropping the facade
/// releases every entity once its in-flight teardown completes.
pub struct Net {
    entities: Mutex<Vec<EntityOwner>>,
}

enum EntityOwner {
    Acceptor(Arc<TcpAcceptorEntity>),
    Connector(Arc<TcpConnectorEntity>),
    Udp(Arc<UdpEntity>),
}

impl EntityOwner {
    fn stop(&self) -> crate::Result<()> {
        match self {
            EntityOwner::Acceptor(entity) => entity.stop(),
            EntityOwner::Connector(entity) => entity.stop(),
            EntityOwner::Udp(entity) => entity.stop(),
        }
    }

    fn is_referenced_by(&self, handle: &BasicNetEntity) -> bool {
        match (self, handle.inner()) {
            (EntityOwner::Acceptor(entity), Some(EntityRef::Acceptor(weak))) => {
                same_entity(entity, weak)
            }
            (EntityOwner::Connector(entity), Some(EntityRef::Connector(weak))) => {
                same_entity(entity, weak)
            }
            (EntityOwner::Udp(entity), Some(EntityRef::Udp(weak))) => same_entity(entity, weak),
            _ => false,
        }
    }
}

fn same_entity<T>(entity: &Arc<T>, weak: &Weak<T>) -> bool {
    std::ptr::eq(Arc::as_ptr(entity), weak.as_ptr())
}

impl Net {
    pub fn new() -> Self {
        Self {
            entities: Mutex::new(Vec::new()),
        }
    }

    /// Create a TCP acceptor entity.
    pub fn make_tcp_acceptor(&self, config: AcceptorConfig) -> BasicNetEntity {
        let entity = TcpAcceptorEntity::new(config);
        let handle = BasicNetEntity::from_acceptor(&entity);
        self.entities.lock().unwrap().push(EntityOwner::Acceptor(entity));
        handle
    }

    /// Create a TCP connector entity.
    pub fn make_tcp_connector(&self, config: ConnectorConfig) -> BasicNetEntity {
        let entity = TcpConnectorEntity::new(config);
        let handle = BasicNetEntity::from_connector(&entity);
        self.entities.lock().unwrap().push(EntityOwner::Connector(entity));
        handle
    }

    /// Create a UDP entity.
    pub fn make_udp_entity(&self, config: UdpConfig) -> BasicNetEntity {
        let entity = UdpEntity::new(config);
        let handle = BasicNetEntity::from_udp(&entity);
        self.entities.lock().unwrap().push(EntityOwner::Udp(entity));
        handle
    }

    /// Create an entity of the given kind.
    pub fn make_entity(&self, kind: EntityKind) -> BasicNetEntity {
        match kind {
            EntityKind::TcpAcceptor(config) => self.make_tcp_acceptor(config),
            EntityKind::TcpConnector(config) => self.make_tcp_connector(config),
            EntityKind::Udp(config) => self.make_udp_entity(config),
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.lock().unwrap().len()
    }

    /// Request a stop of every started entity. Entities that are not
    /// started are skipped; each stop is reported through its own
    /// shutdown-change callback.
    pub fn stop_all(&self) {
        for owner in self.entities.lock().unwrap().iter() {
            let _ = owner.stop();
        }
    }

    /// Release the entity behind `handle`. Returns `false` when the handle
    /// does not refer to an entity owned by this facade.
    pub fn remove(&self, handle: &BasicNetEntity) -> bool {
        let mut entities = self.entities.lock().unwrap();
        let before = entities.len();
        entities.retain(|owner| !owner.is_referenced_by(handle));
        before != entities.len()
    }
}

impl Default for Net {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::{ErrorReporter, IoStateChange, ShutdownChange};
    use crate::framing::length_prefix_framer;
    use crate::handle::BasicIoInterface;
    use crate::Error;
    use bytes::{BufMut, Bytes, BytesMut};
    use std::net::SocketAddr;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::net::TcpStream;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn noop_io_state() -> IoStateChange {
        Arc::new(|_, _, _| {})
    }

    fn noop_error() -> ErrorReporter {
        Arc::new(|_, _| {})
    }

    fn shutdown_probe(tx: UnboundedSender<(Error, usize)>) -> ShutdownChange {
        Box::new(move |_, error, remaining| {
            let _ = tx.send((error, remaining));
        })
    }

    async fn recv<T>(rx: &mut UnboundedReceiver<T>) -> T {
        timeout(WAIT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached in time");
    }

    fn frame(body: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(body.len() + 2);
        buf.put_u16(body.len() as u16);
        buf.put_slice(body);
        buf.freeze()
    }

    #[tokio::test]
    async fn double_start_reports_shutdown_to_first_callback_only() {
        let net = Net::new();
        let acceptor = net.make_tcp_acceptor(AcceptorConfig::new(loopback()));
        let (first_tx, mut first_rx) = unbounded_channel();
        let (second_tx, mut second_rx) = unbounded_channel();

        acceptor
            .start(noop_io_state(), noop_error(), shutdown_probe(first_tx))
            .await
            .unwrap();
        let second = acceptor
            .start(noop_io_state(), noop_error(), shutdown_probe(second_tx))
            .await;
        assert!(matches!(second, Err(Error::EntityAlreadyStarted)));

        acceptor.stop().unwrap();
        let (error, remaining) = recv(&mut first_rx).await;
        assert!(matches!(error, Error::ConnectionClosedLocally));
        assert_eq!(remaining, 0);
        assert!(second_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn start_stop_state_machine_guards() {
        let net = Net::new();
        let udp = net.make_udp_entity(UdpConfig::receiver(loopback()));
        assert!(matches!(udp.stop(), Err(Error::EntityNotStarted)));
        assert!(!udp.is_started().unwrap());

        let (down_tx, mut down_rx) = unbounded_channel();
        udp.start(noop_io_state(), noop_error(), shutdown_probe(down_tx))
            .await
            .unwrap();
        assert!(udp.is_started().unwrap());
        assert!(udp.local_endpoint().unwrap().is_some());

        udp.stop().unwrap();
        assert!(matches!(udp.stop(), Err(Error::EntityNotStarted)));
        let (error, remaining) = recv(&mut down_rx).await;
        assert!(matches!(error, Error::ConnectionClosedLocally));
        assert_eq!(remaining, 0);
        assert!(down_rx.try_recv().is_err());
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn framed_echo_round_trip() {
        let net = Net::new();

        // Echo server: send every message back, stop on an empty body.
        let acceptor = net.make_tcp_acceptor(AcceptorConfig::new(loopback()));
        let (server_down_tx, mut server_down_rx) = unbounded_channel();
        let server_io: IoStateChange = Arc::new(|io, _total, opened| {
            if opened {
                let _ = io.start_io_framed(
                    2,
                    length_prefix_framer(2),
                    Box::new(|message, output, _peer| {
                        let empty_body = message.len() == 2;
                        let _ = output.send(message);
                        !empty_body
                    }),
                );
            }
        });
        acceptor
            .start(server_io, noop_error(), shutdown_probe(server_down_tx))
            .await
            .unwrap();
        let server_addr = acceptor.local_endpoint().unwrap().unwrap();

        let bodies: [&[u8]; 6] = [&[0x20], &[0x21], &[0x22], &[0x23], &[0x24], &[]];
        let messages: Vec<Bytes> = bodies.iter().map(|body| frame(body)).collect();

        // Echo client: send everything on open, stop on the empty echo.
        let (echo_tx, mut echo_rx) = unbounded_channel();
        let to_send = messages.clone();
        let client_io: IoStateChange = Arc::new(move |io, _total, opened| {
            if opened {
                let echo_tx = echo_tx.clone();
                let _ = io.start_io_framed(
                    2,
                    length_prefix_framer(2),
                    Box::new(move |message, _output, _peer| {
                        let empty_body = message.len() == 2;
                        let _ = echo_tx.send(message);
                        !empty_body
                    }),
                );
                for message in &to_send {
                    let _ = io.send(message.clone());
                }
            }
        });
        let connector = net.make_tcp_connector(ConnectorConfig::new(server_addr.to_string()));
        let (client_down_tx, mut client_down_rx) = unbounded_channel();
        connector
            .start(client_io, noop_error(), shutdown_probe(client_down_tx))
            .await
            .unwrap();

        for expected in &messages {
            let echoed = recv(&mut echo_rx).await;
            assert_eq!(&echoed, expected);
        }

        let (error, remaining) = recv(&mut client_down_rx).await;
        assert!(matches!(error, Error::MessageHandlerTerminated));
        assert_eq!(remaining, 0);

        acceptor.stop().unwrap();
        let (error, remaining) = recv(&mut server_down_rx).await;
        assert!(matches!(error, Error::ConnectionClosedLocally));
        assert_eq!(remaining, 0);

        assert!(client_down_rx.try_recv().is_err());
        assert!(server_down_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn acceptor_stop_closes_handlers_before_shutdown() {
        let net = Net::new();
        let (events_tx, mut events_rx) = unbounded_channel::<&'static str>();

        let acceptor = net.make_tcp_acceptor(AcceptorConfig::new(loopback()));
        let io_events = events_tx.clone();
        let server_io: IoStateChange = Arc::new(move |io, _total, opened| {
            if opened {
                let _ = io.start_io(64, Box::new(|_, _, _| true));
            }
            let _ = io_events.send(if opened { "opened" } else { "closed" });
        });
        let shutdown_events = events_tx.clone();
        acceptor
            .start(
                server_io,
                noop_error(),
                Box::new(move |_, _, _| {
                    let _ = shutdown_events.send("shutdown");
                }),
            )
            .await
            .unwrap();
        let addr = acceptor.local_endpoint().unwrap().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(recv(&mut events_rx).await, "opened");

        acceptor.stop().unwrap();
        assert_eq!(recv(&mut events_rx).await, "closed");
        assert_eq!(recv(&mut events_rx).await, "shutdown");
        drop(client);
    }

    #[tokio::test]
    async fn udp_datagrams_round_trip_in_per_sender_order() {
        let net = Net::new();

        let receiver = net.make_udp_entity(UdpConfig::receiver(loopback()));
        let (received_tx, mut received_rx) = unbounded_channel::<Bytes>();
        let receiver_io: IoStateChange = Arc::new(move |io, _total, opened| {
            if opened {
                let received_tx = received_tx.clone();
                let _ = io.start_io(
                    2048,
                    Box::new(move |message, _output, _peer| {
                        let _ = received_tx.send(message);
                        true
                    }),
                );
            }
        });
        let (receiver_down_tx, mut receiver_down_rx) = unbounded_channel();
        receiver
            .start(receiver_io, noop_error(), shutdown_probe(receiver_down_tx))
            .await
            .unwrap();
        let receiver_addr = receiver.local_endpoint().unwrap().unwrap();

        let mut sender_handles = Vec::new();
        let mut sender_down_rxs = Vec::new();
        for tag in 0u8..2 {
            let sender = net.make_udp_entity(UdpConfig::default());
            let sender_io: IoStateChange = Arc::new(move |io, _total, opened| {
                if opened {
                    let _ = io.start_io(64, Box::new(|_, _, _| true));
                    for seq in 0u8..10 {
                        let _ = io.send_to(Bytes::from(vec![tag, seq]), receiver_addr);
                    }
                }
            });
            let (sender_down_tx, sender_down_rx) = unbounded_channel();
            sender
                .start(sender_io, noop_error(), shutdown_probe(sender_down_tx))
                .await
                .unwrap();
            sender_handles.push(sender);
            sender_down_rxs.push(sender_down_rx);
        }

        let mut per_sender: [Vec<u8>; 2] = [Vec::new(), Vec::new()];
        for _ in 0..20 {
            let message = recv(&mut received_rx).await;
            assert_eq!(message.len(), 2);
            per_sender[message[0] as usize].push(message[1]);
        }
        for sequence in &per_sender {
            assert_eq!(sequence, &(0u8..10).collect::<Vec<_>>());
        }

        for sender in &sender_handles {
            sender.stop().unwrap();
        }
        for down_rx in &mut sender_down_rxs {
            recv(down_rx).await;
        }
        receiver.stop().unwrap();
        recv(&mut receiver_down_rx).await;
    }

    #[tokio::test]
    async fn connector_reconnects_after_acceptor_restart() {
        let net = Net::new();

        let mut config = AcceptorConfig::new(loopback());
        config.reuse_address = true;
        let first = net.make_tcp_acceptor(config);
        let (first_down_tx, mut first_down_rx) = unbounded_channel();
        first
            .start(noop_io_state(), noop_error(), shutdown_probe(first_down_tx))
            .await
            .unwrap();
        let addr = first.local_endpoint().unwrap().unwrap();

        let (events_tx, mut events_rx) = unbounded_channel::<bool>();
        let client_io: IoStateChange = Arc::new(move |io, _total, opened| {
            if opened {
                let _ = io.start_io(64, Box::new(|_, _, _| true));
            }
            let _ = events_tx.send(opened);
        });
        let connector = net.make_tcp_connector(ConnectorConfig {
            remote_endpoints: vec![addr.to_string()],
            reconnect_backoff: Some(Duration::from_millis(100)),
        });
        let (connector_down_tx, mut connector_down_rx) = unbounded_channel();
        connector
            .start(client_io, noop_error(), shutdown_probe(connector_down_tx))
            .await
            .unwrap();
        assert!(recv(&mut events_rx).await);

        first.stop().unwrap();
        recv(&mut first_down_rx).await;
        assert!(!recv(&mut events_rx).await);

        // Same port, new acceptor; the connector comes back by itself.
        let mut config = AcceptorConfig::new(addr);
        config.reuse_address = true;
        let second = net.make_tcp_acceptor(config);
        let (second_down_tx, mut second_down_rx) = unbounded_channel();
        second
            .start(noop_io_state(), noop_error(), shutdown_probe(second_down_tx))
            .await
            .unwrap();
        assert!(recv(&mut events_rx).await);

        connector.stop().unwrap();
        recv(&mut connector_down_rx).await;
        second.stop().unwrap();
        recv(&mut second_down_rx).await;
    }

    #[tokio::test]
    async fn expired_interface_send_fails_without_callbacks() {
        let net = Net::new();
        let acceptor = net.make_tcp_acceptor(AcceptorConfig::new(loopback()));
        let (acceptor_down_tx, mut acceptor_down_rx) = unbounded_channel();
        acceptor
            .start(noop_io_state(), noop_error(), shutdown_probe(acceptor_down_tx))
            .await
            .unwrap();
        let addr = acceptor.local_endpoint().unwrap().unwrap();

        let captured: Arc<StdMutex<Option<BasicIoInterface>>> = Arc::new(StdMutex::new(None));
        let (opened_tx, mut opened_rx) = unbounded_channel::<()>();
        let slot = captured.clone();
        let client_io: IoStateChange = Arc::new(move |io, _total, opened| {
            if opened {
                let _ = io.start_io(64, Box::new(|_, _, _| true));
                *slot.lock().unwrap() = Some(io.clone());
                let _ = opened_tx.send(());
            }
        });
        let connector = net.make_tcp_connector(ConnectorConfig::new(addr.to_string()));
        let (connector_down_tx, mut connector_down_rx) = unbounded_channel();
        connector
            .start(client_io, noop_error(), shutdown_probe(connector_down_tx))
            .await
            .unwrap();
        recv(&mut opened_rx).await;

        let interface = captured.lock().unwrap().clone().unwrap();
        interface.send(Bytes::from_static(b"ping")).unwrap();

        connector.stop().unwrap();
        recv(&mut connector_down_rx).await;
        acceptor.stop().unwrap();
        recv(&mut acceptor_down_rx).await;
        drop(net);

        wait_until(|| !interface.is_valid()).await;
        assert!(matches!(
            interface.send(Bytes::from_static(b"again")),
            Err(Error::WeakReferenceExpired)
        ));
        wait_until(|| !acceptor.is_valid()).await;
        assert!(matches!(
            acceptor.is_started(),
            Err(Error::WeakReferenceExpired)
        ));
    }

    #[tokio::test]
    async fn facade_owns_and_releases_entities() {
        let net = Net::new();
        let udp = net.make_entity(EntityKind::Udp(UdpConfig::default()));
        let connector =
            net.make_entity(EntityKind::TcpConnector(ConnectorConfig::new("127.0.0.1:1")));
        assert_eq!(net.entity_count(), 2);

        assert!(net.remove(&udp));
        assert!(!net.remove(&udp));
        assert_eq!(net.entity_count(), 1);
        assert!(matches!(udp.is_started(), Err(Error::WeakReferenceExpired)));

        assert!(!connector.is_started().unwrap());
        net.stop_all();
        assert_eq!(net.entity_count(), 1);
    }
}
