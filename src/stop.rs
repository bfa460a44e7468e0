use tokio::sync::broadcast;

/// Listens for the signals that end a long-running loop.
///
/// Two kinds of signal exist: the entity-wide shutdown broadcast fired by
/// `stop`, and a handler's own stop signal fired by `stop_io` and by write
/// failures. An entity's supervision loop watches only the former; the
/// read loop of one I/O handler watches both. Merging the sources here
/// keeps every `select!` site to a single stop arm, and the sticky flag
/// makes `recv` safe to poll again across loop iterations.
#[derive(Debug)]
pub(crate) struct StopListener {
    /// `true` once any signal has been received.
    fired: bool,
    entity: broadcast::Receiver<()>,
    handler: Option<broadcast::Receiver<()>>,
}

impl StopListener {
    /// Listener for an entity's supervision loop.
    pub(crate) fn entity_wide(entity: broadcast::Receiver<()>) -> Self {
        Self {
            fired: false,
            entity,
            handler: None,
        }
    }

    /// Listener for an I/O handler's loops, watching the entity-wide
    /// channel and the handler's own stop signal.
    pub(crate) fn for_handler(
        entity: broadcast::Receiver<()>,
        handler: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            fired: false,
            entity,
            handler: Some(handler),
        }
    }

    /// Whether a stop signal has been received.
    pub(crate) fn fired(&self) -> bool {
        self.fired
    }

    /// Receive a stop signal from either source, waiting if necessary.
    pub(crate) async fn recv(&mut self) {
        if self.fired {
            return;
        }

        // Any outcome on either source counts, including the sender side
        // going away during teardown.
        match &mut self.handler {
            Some(handler) => {
                tokio::select! {
                    _ = self.entity.recv() => {}
                    _ = handler.recv() => {}
                }
            }
            None => {
                let _ = self.entity.recv().await;
            }
        }
        self.fired = true;
    }
}
