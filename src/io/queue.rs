use bytes::Bytes;
use std::collections::VecDeque;
use std::net::SocketAddr;

/// Snapshot of an I/O handler's outgoing-data queue, for backpressure
/// monitoring by the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutputQueueStats {
    /// Number of buffers waiting behind the write in progress.
    pub element_count: usize,
    /// Sum of the queued buffer sizes in bytes.
    pub total_bytes: usize,
}

/// FIFO of outgoing buffers with their optional destinations.
///
/// The destination is present only for UDP sends with per-datagram
/// endpoints. Not thread safe by itself; the owning handler serializes
/// access under its write lock.
#[derive(Debug, Default)]
pub(crate) struct OutputQueue {
    queue: VecDeque<(Bytes, Option<SocketAddr>)>,
    total_bytes: usize,
}

impl OutputQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push_back(&mut self, buf: Bytes, endpoint: Option<SocketAddr>) {
        self.total_bytes += buf.len();
        self.queue.push_back((buf, endpoint));
    }

    pub(crate) fn pop_front(&mut self) -> Option<(Bytes, Option<SocketAddr>)> {
        let element = self.queue.pop_front();
        if let Some((buf, _)) = &element {
            self.total_bytes -= buf.len();
        }
        element
    }

    pub(crate) fn stats(&self) -> OutputQueueStats {
        OutputQueueStats {
            element_count: self.queue.len(),
            total_bytes: self.total_bytes,
        }
    }
}
