//! Per-connection I/O handlers and the state they share.

use crate::callback::{MessageFramer, MessageHandler};
use crate::Result;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

mod queue;
pub(crate) mod tcp;
pub(crate) mod udp;

pub use queue::OutputQueueStats;
pub(crate) use queue::OutputQueue;

/// State shared by the TCP and UDP I/O handlers: the started flag, the
/// outgoing-data queue, and the write-in-progress guard.
///
/// The write-in-progress flag and the queue live under one lock, so the
/// write-completion path and the application-side send path cannot both
/// conclude that a write must be initiated: exactly one of them observes an
/// empty queue with no write in progress.
#[derive(Debug, Default)]
pub(crate) struct IoBase {
    io_started: AtomicBool,
    write: Mutex<WriteState>,
}

#[derive(Debug, Default)]
struct WriteState {
    in_progress: bool,
    queue: OutputQueue,
}

impl IoBase {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Transition to started. `false` if already started.
    pub(crate) fn set_io_started(&self) -> bool {
        self.io_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Transition to stopped. `false` if not currently started.
    pub(crate) fn set_io_stopped(&self) -> bool {
        self.io_started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn is_io_started(&self) -> bool {
        self.io_started.load(Ordering::Acquire)
    }

    pub(crate) fn is_write_in_progress(&self) -> bool {
        self.write.lock().unwrap().in_progress
    }

    /// Register an outgoing buffer.
    ///
    /// Returns `true` when the caller now owns the pending write and must
    /// start it; the buffer is not enqueued in that case. Returns `false`
    /// when a write is already outstanding and the buffer was appended to
    /// the queue, or when the handler is not started.
    pub(crate) fn start_write_setup(&self, buf: &Bytes, endpoint: Option<SocketAddr>) -> bool {
        if !self.is_io_started() {
            return false;
        }
        let mut write = self.write.lock().unwrap();
        if write.in_progress {
            write.queue.push_back(buf.clone(), endpoint);
            false
        } else {
            write.in_progress = true;
            true
        }
    }

    /// Called by the write loop when a write completes. Dequeues the next
    /// buffer, or clears the write-in-progress flag when none is left.
    pub(crate) fn get_next_element(&self) -> Option<(Bytes, Option<SocketAddr>)> {
        let mut write = self.write.lock().unwrap();
        let element = write.queue.pop_front();
        if element.is_none() {
            write.in_progress = false;
        }
        element
    }

    pub(crate) fn queue_stats(&self) -> OutputQueueStats {
        self.write.lock().unwrap().queue.stats()
    }
}

/// Operations every I/O handler offers through its weak handles.
pub(crate) trait IoHandlerOps: Send + Sync {
    fn is_io_started(&self) -> bool;
    fn start_io(
        &self,
        read_size: usize,
        framer: Option<MessageFramer>,
        handler: MessageHandler,
    ) -> Result<()>;
    fn stop_io(&self) -> Result<()>;
    fn send_to(&self, buf: Bytes, endpoint: Option<SocketAddr>) -> Result<()>;
    fn queue_stats(&self) -> OutputQueueStats;
    fn local_endpoint(&self) -> SocketAddr;
    fn remote_endpoint(&self) -> Option<SocketAddr>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_setup_requires_started() {
        let base = IoBase::new();
        let buf = Bytes::from_static(b"data!");

        assert!(!base.start_write_setup(&buf, None));
        assert_eq!(base.queue_stats(), OutputQueueStats::default());
        assert!(!base.is_write_in_progress());
    }

    #[test]
    fn started_flag_is_single_winner() {
        let base = IoBase::new();
        assert!(!base.set_io_stopped());
        assert!(base.set_io_started());
        assert!(!base.set_io_started());
        assert!(base.is_io_started());
        assert!(base.set_io_stopped());
        assert!(!base.set_io_stopped());
        assert!(!base.is_io_started());
    }

    #[test]
    fn queue_accounting_over_twenty_writes() {
        let base = IoBase::new();
        let buf = Bytes::from_static(b"12345");
        assert!(base.set_io_started());

        // The first send claims the write, the other 19 queue behind it.
        assert!(base.start_write_setup(&buf, None));
        for _ in 0..19 {
            assert!(!base.start_write_setup(&buf, None));
        }
        let stats = base.queue_stats();
        assert_eq!(stats.element_count, 19);
        assert_eq!(stats.total_bytes, 95);
        assert!(base.is_write_in_progress());

        for _ in 0..18 {
            assert!(base.get_next_element().is_some());
        }
        let stats = base.queue_stats();
        assert_eq!(stats.element_count, 1);
        assert_eq!(stats.total_bytes, 5);

        let (last, endpoint) = base.get_next_element().unwrap();
        assert_eq!(last, buf);
        assert_eq!(endpoint, None);
        assert!(base.is_write_in_progress());

        assert!(base.get_next_element().is_none());
        assert!(!base.is_write_in_progress());
        assert_eq!(base.queue_stats(), OutputQueueStats::default());
    }
}
