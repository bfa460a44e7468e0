//! Application-supplied callback types.
//!
//! All callbacks run on runtime threads. The library never invokes a given
//! callback concurrently with itself for the same handler; the application
//! guarantees its callbacks are re-entrancy safe with respect to each other.

use crate::handle::{BasicIoInterface, IoOutput};
use crate::Error;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;

/// Invoked when a connection opens (`true`) and when it closes (`false`),
/// together with the entity's total handler count after the change.
pub type IoStateChange = Arc<dyn Fn(BasicIoInterface, usize, bool) + Send + Sync>;

/// Invoked for transient and terminal errors of an entity or one of its
/// handlers. The interface is empty for entity-level errors.
pub type ErrorReporter = Arc<dyn Fn(BasicIoInterface, &Error) + Send + Sync>;

/// Invoked exactly once per entity start, at terminal teardown, with the
/// final error and the number of handlers remaining (always zero by then).
pub type ShutdownChange = Box<dyn FnOnce(BasicIoInterface, Error, usize) + Send>;

/// Decides when a complete TCP message has been received.
///
/// Called with all bytes accumulated so far; returns the number of
/// additional bytes required, or zero meaning the buffer now holds exactly
/// one complete message. A pure function of its input.
pub type MessageFramer = Box<dyn Fn(&[u8]) -> usize + Send + Sync>;

/// Invoked with one complete message, a restricted reply handle, and the
/// peer endpoint the message came from. Returning `false` requests a
/// graceful stop of the handler.
pub type MessageHandler = Box<dyn FnMut(Bytes, IoOutput, SocketAddr) -> bool + Send>;
