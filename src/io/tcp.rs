//! The per-connection TCP I/O handler.
//!
//! A handler is created when its owning entity admits a connection and
//! stays idle until the application calls `start_io` on the interface
//! handle. That spawns two tasks: a read loop that frames incoming bytes
//! and feeds the message handler, and a write loop that drains the
//! outgoing-data queue one buffer at a time.

use crate::callback::{MessageFramer, MessageHandler};
use crate::entity::IoParent;
use crate::handle::{BasicIoInterface, IoOutput};
use crate::io::{IoBase, IoHandlerOps, OutputQueueStats};
use crate::stop::StopListener;
use crate::{Error, Result, MAX_TCP_FRAME_SIZE};
use bytes::{Bytes, BytesMut};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, OwnedSemaphorePermit};
use tracing::debug;

/// A trait for types that can back a TCP I/O handler.
pub(crate) trait IoStream: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types that implement `AsyncRead + AsyncWrite + Unpin + Send`.
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IoStream for T {}

pub(crate) struct TcpIoHandler<S = TcpStream> {
    base: IoBase,
    id: u64,
    local: SocketAddr,
    remote: SocketAddr,
    /// Weak back-reference used solely to report teardown.
    parent: Weak<dyn IoParent>,
    me: Weak<Self>,
    /// Per-handler stop signal, fired by `stop_io` and by write failures.
    stop_tx: broadcast::Sender<()>,
    /// Entity-wide shutdown channel, subscribed when the read loop spawns.
    entity_shutdown: broadcast::Sender<()>,
    state: Mutex<HandlerState<S>>,
    /// Returned to the acceptor's connection limit when the handler drops.
    _permit: Option<OwnedSemaphorePermit>,
    /// Closes the owning entity's completion channel when the handler drops.
    _done: mpsc::Sender<()>,
}

struct HandlerState<S> {
    /// Present until `start_io` claims it or entity stop discards it.
    socket: Option<S>,
    write_tx: Option<mpsc::UnboundedSender<Bytes>>,
    /// First write failure, reported in place of the read loop's own error.
    failure: Option<Error>,
}

impl<S: IoStream + 'static> TcpIoHandler<S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        socket: S,
        id: u64,
        local: SocketAddr,
        remote: SocketAddr,
        parent: Weak<dyn IoParent>,
        entity_shutdown: broadcast::Sender<()>,
        permit: Option<OwnedSemaphorePermit>,
        done: mpsc::Sender<()>,
    ) -> Arc<Self> {
        let (stop_tx, _) = broadcast::channel(1);
        Arc::new_cyclic(|me| Self {
            base: IoBase::new(),
            id,
            local,
            remote,
            parent,
            me: me.clone(),
            stop_tx,
            entity_shutdown,
            state: Mutex::new(HandlerState {
                socket: Some(socket),
                write_tx: None,
                failure: None,
            }),
            _permit: permit,
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

    /// Entity-side stop. A started handler winds down through its read
    /// loop; one the application never started is finalized here so its
    /// closure is still reported.
    pub(crate) fn shutdown(&self) {
        if self.base.set_io_stopped() {
            let _ = self.stop_tx.send(());
        } else {
            self.finalize_unstarted();
        }
    }

    fn finalize_unstarted(&self) {
        let had_socket = self.state.lock().unwrap().socket.take().is_some();
        if had_socket {
            if let Some(parent) = self.parent.upgrade() {
                parent.handler_closed(self.id, Error::ConnectionClosedLocally);
            }
        }
    }

    fn write_failed(&self, error: Error) {
        self.state.lock().unwrap().failure.get_or_insert(error);
        let _ = self.stop_tx.send(());
    }

    /// Terminal step, run once by the read loop on every exit path.
    fn teardown(&self, error: Error) {
        self.base.set_io_stopped();
        let error = {
            let mut state = self.state.lock().unwrap();
            state.write_tx.take();
            state.failure.take().unwrap_or(error)
        };
        if let Some(parent) = self.parent.upgrade() {
            parent.handler_closed(self.id, error);
        }
    }
}

impl<S: IoStream + 'static> IoHandlerOps for TcpIoHandler<S> {
    fn is_io_started(&self) -> bool {
        self.base.is_io_started()
    }

    fn start_io(
        &self,
        read_size: usize,
        framer: Option<MessageFramer>,
        handler: MessageHandler,
    ) -> Result<()> {
        if !self.base.set_io_started() {
            return Err(Error::IoHandlerAlreadyStarted);
        }
        let socket = match self.state.lock().unwrap().socket.take() {
            Some(socket) => socket,
            None => {
                // Entity stop discarded the socket before we got here.
                self.base.set_io_stopped();
                return Err(Error::ConnectionClosedLocally);
            }
        };
        let me = self.me.upgrade().ok_or(Error::WeakReferenceExpired)?;

        let (read_half, write_half) = tokio::io::split(socket);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().write_tx = Some(write_tx);

        let stop =
            StopListener::for_handler(self.entity_shutdown.subscribe(), self.stop_tx.subscribe());
        tokio::spawn(write_loop(me.clone(), write_half, write_rx));
        tokio::spawn(read_loop(me, read_half, read_size, framer, handler, stop));

        // A stop may have raced between the started transition and the
        // subscriptions above; re-signal so the fresh loops observe it.
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

    fn send_to(&self, buf: Bytes, _endpoint: Option<SocketAddr>) -> Result<()> {
        if !self.base.is_io_started() {
            return Err(Error::IoHandlerNotStarted);
        }
        if self.base.start_write_setup(&buf, None) {
            // We own the pending write; hand it to the write loop.
            let state = self.state.lock().unwrap();
            if let Some(write_tx) = &state.write_tx {
                let _ = write_tx.send(buf);
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
        Some(self.remote)
    }
}

/// Write one buffer per kick, then keep draining the queue until the
/// write-in-progress flag clears. Exits when the handler tears down.
async fn write_loop<S: IoStream + 'static>(
    handler: Arc<TcpIoHandler<S>>,
    mut write_half: WriteHalf<S>,
    mut write_rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(buf) = write_rx.recv().await {
        let mut next = Some(buf);
        while let Some(chunk) = next {
            if let Err(err) = write_half.write_all(&chunk).await {
                debug!(cause = %err, "write failed");
                handler.write_failed(err.into());
                return;
            }
            next = handler.base.get_next_element().map(|(buf, _)| buf);
        }
    }
}

#[tracing::instrument(skip_all, fields(remote = %handler.remote))]
async fn read_loop<S: IoStream + 'static>(
    handler: Arc<TcpIoHandler<S>>,
    mut read_half: ReadHalf<S>,
    read_size: usize,
    framer: Option<MessageFramer>,
    mut message_handler: MessageHandler,
    mut stop: StopListener,
) {
    let error = match framer {
        Some(framer) => {
            framed_reads(
                &handler,
                &mut read_half,
                read_size,
                framer,
                &mut message_handler,
                &mut stop,
            )
            .await
        }
        None => {
            unframed_reads(
                &handler,
                &mut read_half,
                read_size,
                &mut message_handler,
                &mut stop,
            )
            .await
        }
    };
    debug!(cause = %error, "connection closing");
    handler.teardown(error);
}

/// Read exactly what the framer asks for, never past a message boundary.
/// A return of zero means the buffer holds exactly one complete message.
async fn framed_reads<S: IoStream>(
    handler: &Arc<TcpIoHandler<S>>,
    read_half: &mut ReadHalf<S>,
    initial_read_size: usize,
    framer: MessageFramer,
    message_handler: &mut MessageHandler,
    stop: &mut StopListener,
) -> Error
where
    S: 'static,
{
    let initial = initial_read_size.max(1);
    let mut buf = BytesMut::with_capacity(initial);
    let mut needed = initial;
    loop {
        while buf.len() < needed {
            let filled = buf.len();
            buf.resize(needed, 0);
            let read = tokio::select! {
                read = read_half.read_exact(&mut buf[filled..]) => read,
                _ = stop.recv() => return Error::ConnectionClosedLocally,
            };
            if let Err(err) = read {
                return err.into();
            }
        }

        let more = framer(&buf);
        if more == 0 {
            let message = buf.split().freeze();
            if !message_handler(message, handler.output(), handler.remote) {
                return Error::MessageHandlerTerminated;
            }
            needed = initial;
        } else {
            needed = buf.len() + more;
            if needed > MAX_TCP_FRAME_SIZE {
                return Error::TcpFramerError;
            }
        }
    }
}

/// No framing: each read's bytes are delivered as one message.
async fn unframed_reads<S: IoStream>(
    handler: &Arc<TcpIoHandler<S>>,
    read_half: &mut ReadHalf<S>,
    max_read_size: usize,
    message_handler: &mut MessageHandler,
    stop: &mut StopListener,
) -> Error
where
    S: 'static,
{
    let mut scratch = vec![0u8; max_read_size.max(1)];
    loop {
        let read = tokio::select! {
            read = read_half.read(&mut scratch) => read,
            _ = stop.recv() => return Error::ConnectionClosedLocally,
        };
        match read {
            Ok(0) => return Error::ConnectionClosedByPeer,
            Ok(n) => {
                let message = Bytes::copy_from_slice(&scratch[..n]);
                if !message_handler(message, handler.output(), handler.remote) {
                    return Error::MessageHandlerTerminated;
                }
            }
            Err(err) => return err.into(),
        }
    }
}
