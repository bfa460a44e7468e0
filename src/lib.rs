//! A callback-driven asynchronous TCP/UDP endpoint framework.
//!
//! The library does not define any wire protocol. Applications create
//! network entities (TCP acceptors, TCP connectors, UDP endpoints) through
//! the [`Net`] facade and receive weak [`BasicNetEntity`] handles back.
//! Starting an entity installs three callbacks: an I/O state-change
//! callback invoked when a connection opens or closes, an error reporter,
//! and a shutdown-change callback invoked exactly once when the entity
//! terminates. Inside the state-change callback the application installs
//! its message framer and message handler on the newly active
//! [`BasicIoInterface`] and may initiate sends.

pub mod callback;
pub mod config;
pub mod error;
pub mod framing;
pub mod handle;
pub mod net;
pub mod wait_queue;

mod entity;
mod io;
mod stop;

pub use callback::{ErrorReporter, IoStateChange, MessageFramer, MessageHandler, ShutdownChange};
pub use config::{AcceptorConfig, ConnectorConfig, EntityKind, UdpConfig};
pub use error::Error;
pub use handle::{BasicIoInterface, BasicNetEntity, IoOutput};
pub use io::OutputQueueStats;
pub use net::Net;
pub use wait_queue::WaitQueue;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9155;

/// Largest UDP payload accepted by [`BasicIoInterface::send`] and friends.
pub const MAX_UDP_PAYLOAD: usize = 65_507;

/// Ceiling on a single framed TCP message. A framer asking for more than
/// this terminates its handler with [`Error::TcpFramerError`].
pub const MAX_TCP_FRAME_SIZE: usize = 16 * 1024 * 1024;

pub type Result<T> = std::result::Result<T, Error>;
