//! Network entities and the lifecycle state they share.

use crate::callback::{ErrorReporter, IoStateChange, ShutdownChange};
use crate::handle::BasicIoInterface;
use crate::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

pub(crate) mod acceptor;
pub(crate) mod connector;
pub(crate) mod udp;

/// Start/stop core shared by the concrete entities.
///
/// `start` and `stop` may race from multiple threads, so both transitions
/// are compare-and-set with a single winner. The shutdown-change callback
/// is stored only by the winning `start` and taken at most once.
#[derive(Default)]
pub(crate) struct EntityCommon {
    started: AtomicBool,
    shutdown_cb: Mutex<Option<ShutdownChange>>,
}

impl EntityCommon {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Claim the start transition. The losing caller's callback is dropped
    /// without overwriting the stored one.
    pub(crate) fn start(&self, shutdown_cb: ShutdownChange) -> bool {
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        *self.shutdown_cb.lock().unwrap() = Some(shutdown_cb);
        true
    }

    /// Claim the stop transition. Does not invoke the shutdown callback;
    /// the concrete entity reports terminal shutdown when teardown is done.
    pub(crate) fn stop(&self) -> bool {
        self.started
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Roll back a won `start` whose setup failed before any work began.
    pub(crate) fn cancel_start(&self) {
        self.shutdown_cb.lock().unwrap().take();
        self.stop();
    }

    /// Deliver the terminal shutdown notification. At most once per start:
    /// the callback is consumed.
    pub(crate) fn call_shutdown_change(
        &self,
        interface: BasicIoInterface,
        error: Error,
        remaining: usize,
    ) {
        let callback = self.shutdown_cb.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(interface, error, remaining);
        }
    }
}

/// How an I/O handler reports its own teardown to the entity that owns it.
///
/// Handlers hold the entity only weakly; an entity already torn down makes
/// the report a no-op.
pub(crate) trait IoParent: Send + Sync {
    fn handler_closed(&self, id: u64, error: Error);
}

/// The two repeatable callbacks installed at entity start.
#[derive(Clone)]
pub(crate) struct EntityCallbacks {
    pub(crate) io_state: IoStateChange,
    pub(crate) error: ErrorReporter,
}

/// Per-start state of an entity, cleared when teardown completes.
pub(crate) struct Runtime {
    pub(crate) notify_shutdown: broadcast::Sender<()>,
    pub(crate) callbacks: EntityCallbacks,
    pub(crate) local_endpoint: Option<std::net::SocketAddr>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting_cb(counter: Arc<AtomicUsize>) -> ShutdownChange {
        Box::new(move |_, _, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn start_has_a_single_winner() {
        let common = Arc::new(EntityCommon::new());
        let wins = Arc::new(AtomicUsize::new(0));
        let calls = Arc::new(AtomicUsize::new(0));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let common = common.clone();
                let wins = wins.clone();
                let calls = calls.clone();
                std::thread::spawn(move || {
                    if common.start(counting_cb(calls)) {
                        wins.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert!(common.is_started());

        assert!(common.stop());
        assert!(!common.stop());

        // Only the winner's callback was stored, and it fires once.
        common.call_shutdown_change(BasicIoInterface::default(), Error::ConnectionClosedLocally, 0);
        common.call_shutdown_change(BasicIoInterface::default(), Error::ConnectionClosedLocally, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn cancel_start_discards_the_callback() {
        let common = EntityCommon::new();
        let calls = Arc::new(AtomicUsize::new(0));

        assert!(common.start(counting_cb(calls.clone())));
        common.cancel_start();
        assert!(!common.is_started());

        common.call_shutdown_change(BasicIoInterface::default(), Error::ConnectionClosedLocally, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // The entity may be started again after a failed setup.
        assert!(common.start(counting_cb(calls.clone())));
        common.call_shutdown_change(BasicIoInterface::default(), Error::ConnectionClosedLocally, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
