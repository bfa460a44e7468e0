use std::io;
use thiserror::Error;

/// Errors reported by the library, both as return values of handle
/// operations and through the error-reporter and shutdown-change callbacks.
#[derive(Debug, Error)]
pub enum Error {
    /// A message handler returned `false`, requesting a stop of its handler.
    #[error("message handler requested stop")]
    MessageHandlerTerminated,
    /// The entity or I/O handler behind a handle no longer exists.
    #[error("weak reference expired")]
    WeakReferenceExpired,
    #[error("entity is not started")]
    EntityNotStarted,
    #[error("entity is already started")]
    EntityAlreadyStarted,
    #[error("io handler is not started")]
    IoHandlerNotStarted,
    #[error("io handler is already started")]
    IoHandlerAlreadyStarted,
    /// A datagram was larger than the maximum UDP payload.
    #[error("datagram of {size} bytes exceeds the maximum of {max}")]
    UdpMaxBufSizeExceeded { size: usize, max: usize },
    /// The message framer demanded more bytes than a message may hold.
    #[error("message framer rejected the input")]
    TcpFramerError,
    #[error("connection closed by peer")]
    ConnectionClosedByPeer,
    #[error("connection closed locally")]
    ConnectionClosedLocally,
    /// A datagram send had neither an explicit nor a default destination.
    #[error("datagram has no destination endpoint")]
    NoUdpDestination,
    #[error("endpoint resolution failed: {0}")]
    Resolver(String),
    #[error("endpoint is already in use")]
    EndpointAlreadyInUse,
    /// Any network error not covered by a more specific variant.
    #[error("network error: {0}")]
    Network(#[source] io::Error),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        use io::ErrorKind::*;
        match err.kind() {
            AddrInUse => Error::EndpointAlreadyInUse,
            ConnectionReset | ConnectionAborted | BrokenPipe | UnexpectedEof => {
                Error::ConnectionClosedByPeer
            }
            _ => Error::Network(err),
        }
    }
}
