//! Weak application-facing handles.
//!
//! Applications never own entities or I/O handlers directly. Every handle
//! wraps a weak reference and upgrades it per operation; an operation on
//! an expired handle fails with [`Error::WeakReferenceExpired`] and has no
//! side effects. Handles are cheap to clone and safe to move across
//! threads.

use crate::callback::{ErrorReporter, IoStateChange, MessageFramer, MessageHandler, ShutdownChange};
use crate::entity::acceptor::TcpAcceptorEntity;
use crate::entity::connector::TcpConnectorEntity;
use crate::entity::udp::UdpEntity;
use crate::io::{IoHandlerOps, OutputQueueStats};
use crate::{Error, Result};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone)]
pub(crate) enum EntityRef {
    Acceptor(Weak<TcpAcceptorEntity>),
    Connector(Weak<TcpConnectorEntity>),
    Udp(Weak<UdpEntity>),
}

/// Weak handle to one network entity.
#[derive(Debug, Clone, Default)]
pub struct BasicNetEntity {
    inner: Option<EntityRef>,
}

impl BasicNetEntity {
    pub(crate) fn from_acceptor(entity: &Arc<TcpAcceptorEntity>) -> Self {
        Self {
            inner: Some(EntityRef::Acceptor(Arc::downgrade(entity))),
        }
    }

    pub(crate) fn from_connector(entity: &Arc<TcpConnectorEntity>) -> Self {
        Self {
            inner: Some(EntityRef::Connector(Arc::downgrade(entity))),
        }
    }

    pub(crate) fn from_udp(entity: &Arc<UdpEntity>) -> Self {
        Self {
            inner: Some(EntityRef::Udp(Arc::downgrade(entity))),
        }
    }

    pub(crate) fn inner(&self) -> Option<&EntityRef> {
        self.inner.as_ref()
    }

    /// Whether the underlying entity still exists.
    pub fn is_valid(&self) -> bool {
        match &self.inner {
            Some(EntityRef::Acceptor(entity)) => entity.strong_count() > 0,
            Some(EntityRef::Connector(entity)) => entity.strong_count() > 0,
            Some(EntityRef::Udp(entity)) => entity.strong_count() > 0,
            None => false,
        }
    }

    pub fn is_started(&self) -> Result<bool> {
        match &self.inner {
            Some(EntityRef::Acceptor(entity)) => Ok(upgrade(entity)?.is_started()),
            Some(EntityRef::Connector(entity)) => Ok(upgrade(entity)?.is_started()),
            Some(EntityRef::Udp(entity)) => Ok(upgrade(entity)?.is_started()),
            None => Err(Error::WeakReferenceExpired),
        }
    }

    /// The entity's bound endpoint while started: the listen endpoint for
    /// an acceptor, the socket endpoint for a UDP entity, `None` for a
    /// connector.
    pub fn local_endpoint(&self) -> Result<Option<SocketAddr>> {
        match &self.inner {
            Some(EntityRef::Acceptor(entity)) => Ok(upgrade(entity)?.local_endpoint()),
            Some(EntityRef::Connector(entity)) => Ok(upgrade(entity)?.local_endpoint()),
            Some(EntityRef::Udp(entity)) => Ok(upgrade(entity)?.local_endpoint()),
            None => Err(Error::WeakReferenceExpired),
        }
    }

    /// Start the entity, installing its callback set.
    ///
    /// Exactly one concurrent `start` wins; the losers get
    /// [`Error::EntityAlreadyStarted`] and their callbacks are dropped
    /// without ever being invoked.
    pub async fn start(
        &self,
        io_state_change: IoStateChange,
        error_reporter: ErrorReporter,
        shutdown_change: ShutdownChange,
    ) -> Result<()> {
        match &self.inner {
            Some(EntityRef::Acceptor(entity)) => {
                upgrade(entity)?
                    .start(io_state_change, error_reporter, shutdown_change)
                    .await
            }
            Some(EntityRef::Connector(entity)) => {
                upgrade(entity)?
                    .start(io_state_change, error_reporter, shutdown_change)
                    .await
            }
            Some(EntityRef::Udp(entity)) => {
                upgrade(entity)?
                    .start(io_state_change, error_reporter, shutdown_change)
                    .await
            }
            None => Err(Error::WeakReferenceExpired),
        }
    }

    /// Request a stop. Teardown completes asynchronously and is reported
    /// through the shutdown-change callback installed at start.
    pub fn stop(&self) -> Result<()> {
        match &self.inner {
            Some(EntityRef::Acceptor(entity)) => upgrade(entity)?.stop(),
            Some(EntityRef::Connector(entity)) => upgrade(entity)?.stop(),
            Some(EntityRef::Udp(entity)) => upgrade(entity)?.stop(),
            None => Err(Error::WeakReferenceExpired),
        }
    }
}

fn upgrade<T>(weak: &Weak<T>) -> Result<Arc<T>> {
    weak.upgrade().ok_or(Error::WeakReferenceExpired)
}

/// Weak handle to one active connection or socket.
///
/// Delivered through the I/O state-change callback when a connection
/// opens. Installing the message handler (and, for TCP, the framer) with
/// `start_io` begins reading; sends are accepted from then on.
#[derive(Debug, Clone, Default)]
pub struct BasicIoInterface {
    inner: Option<Weak<dyn IoHandlerOps>>,
}

impl BasicIoInterface {
    pub(crate) fn new(inner: Weak<dyn IoHandlerOps>) -> Self {
        Self { inner: Some(inner) }
    }

    fn ops(&self) -> Result<Arc<dyn IoHandlerOps>> {
        self.inner
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(Error::WeakReferenceExpired)
    }

    pub fn is_valid(&self) -> bool {
        self.inner.as_ref().is_some_and(|ops| ops.strong_count() > 0)
    }

    pub fn is_io_started(&self) -> Result<bool> {
        Ok(self.ops()?.is_io_started())
    }

    /// Begin reading without framing.
    ///
    /// On TCP each read's bytes are delivered as one message; on UDP each
    /// datagram is one message and `max_read_size` bounds its size.
    pub fn start_io(&self, max_read_size: usize, handler: MessageHandler) -> Result<()> {
        self.ops()?.start_io(max_read_size, None, handler)
    }

    /// Begin reading with an application framer (TCP).
    ///
    /// `initial_read_size` is requested first, typically the header
    /// length. The delivered message holds every byte the framer saw,
    /// header included.
    pub fn start_io_framed(
        &self,
        initial_read_size: usize,
        framer: MessageFramer,
        handler: MessageHandler,
    ) -> Result<()> {
        self.ops()?.start_io(initial_read_size, Some(framer), handler)
    }

    /// Gracefully stop this handler: reads are cancelled, the write in
    /// flight finishes, and the close state-change follows.
    pub fn stop_io(&self) -> Result<()> {
        self.ops()?.stop_io()
    }

    /// Queue `buf` for sending. TCP, or UDP with a default destination.
    pub fn send(&self, buf: Bytes) -> Result<()> {
        self.ops()?.send_to(buf, None)
    }

    /// Queue `buf` for sending to an explicit endpoint (UDP).
    pub fn send_to(&self, buf: Bytes, endpoint: SocketAddr) -> Result<()> {
        self.ops()?.send_to(buf, Some(endpoint))
    }

    pub fn output_queue_stats(&self) -> Result<OutputQueueStats> {
        Ok(self.ops()?.queue_stats())
    }

    pub fn local_endpoint(&self) -> Result<SocketAddr> {
        Ok(self.ops()?.local_endpoint())
    }

    pub fn remote_endpoint(&self) -> Result<Option<SocketAddr>> {
        Ok(self.ops()?.remote_endpoint())
    }

    /// The restricted send-only view of this handler.
    pub fn as_output(&self) -> IoOutput {
        IoOutput {
            inner: self.inner.clone(),
        }
    }
}

/// Restricted send-only handle, passed to message handlers so they can
/// reply without holding the full interface.
#[derive(Debug, Clone, Default)]
pub struct IoOutput {
    inner: Option<Weak<dyn IoHandlerOps>>,
}

impl IoOutput {
    pub(crate) fn new(inner: Weak<dyn IoHandlerOps>) -> Self {
        Self { inner: Some(inner) }
    }

    fn ops(&self) -> Result<Arc<dyn IoHandlerOps>> {
        self.inner
            .as_ref()
            .and_then(Weak::upgrade)
            .ok_or(Error::WeakReferenceExpired)
    }

    pub fn send(&self, buf: Bytes) -> Result<()> {
        self.ops()?.send_to(buf, None)
    }

    pub fn send_to(&self, buf: Bytes, endpoint: SocketAddr) -> Result<()> {
        self.ops()?.send_to(buf, Some(endpoint))
    }

    pub fn output_queue_stats(&self) -> Result<OutputQueueStats> {
        Ok(self.ops()?.queue_stats())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_handles_report_expired() {
        let entity = BasicNetEntity::default();
        assert!(!entity.is_valid());
        assert!(matches!(entity.is_started(), Err(Error::WeakReferenceExpired)));
        assert!(matches!(entity.stop(), Err(Error::WeakReferenceExpired)));

        let interface = BasicIoInterface::default();
        assert!(!interface.is_valid());
        assert!(matches!(
            interface.send(Bytes::from_static(b"x")),
            Err(Error::WeakReferenceExpired)
        ));
        assert!(matches!(interface.stop_io(), Err(Error::WeakReferenceExpired)));

        let output = interface.as_output();
        assert!(matches!(
            output.send(Bytes::from_static(b"x")),
            Err(Error::WeakReferenceExpired)
        ));
    }
}
