//! Configuration for the three kinds of network entity.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Configuration for a TCP acceptor entity.
#[derive(Debug, Clone)]
pub struct AcceptorConfig {
    /// Endpoint to bind and listen on.
    pub local_endpoint: SocketAddr,
    /// Apply `SO_REUSEADDR` before binding.
    pub reuse_address: bool,
    /// Cap on concurrently accepted connections. Accepting pauses while the
    /// limit is reached and resumes as connections close.
    pub max_connections: Option<usize>,
}

impl AcceptorConfig {
    pub fn new(local_endpoint: SocketAddr) -> Self {
        Self {
            local_endpoint,
            reuse_address: false,
            max_connections: None,
        }
    }
}

/// Configuration for a TCP connector entity.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Remote endpoints as `host:port` strings, tried in order on every
    /// connection attempt. Resolution happens per attempt.
    pub remote_endpoints: Vec<String>,
    /// Fixed interval to wait before re-attempting after a failed connect
    /// or a lost connection. `None` disables reconnect: the first terminal
    /// condition shuts the entity down.
    pub reconnect_backoff: Option<Duration>,
}

impl ConnectorConfig {
    pub fn new(remote_endpoint: impl Into<String>) -> Self {
        Self {
            remote_endpoints: vec![remote_endpoint.into()],
            reconnect_backoff: None,
        }
    }
}

/// Configuration for a UDP entity.
///
/// All fields are optional: a receiver binds `local_endpoint`, a sender
/// relies on `default_remote_endpoint` or per-send destinations, and a
/// multicast receiver additionally joins `multicast_group`.
#[derive(Debug, Clone, Default)]
pub struct UdpConfig {
    /// Endpoint to bind. When absent the socket binds a wildcard ephemeral
    /// endpoint, which suits send-only use.
    pub local_endpoint: Option<SocketAddr>,
    /// Destination used by sends that carry no explicit endpoint, as a
    /// `host:port` string resolved at start.
    pub default_remote_endpoint: Option<String>,
    /// Multicast group to join after binding.
    pub multicast_group: Option<IpAddr>,
}

impl UdpConfig {
    /// Receiver bound to `local_endpoint`.
    pub fn receiver(local_endpoint: SocketAddr) -> Self {
        Self {
            local_endpoint: Some(local_endpoint),
            ..Self::default()
        }
    }

    /// Sender with every datagram going to `remote_endpoint` by default.
    pub fn sender(remote_endpoint: impl Into<String>) -> Self {
        Self {
            default_remote_endpoint: Some(remote_endpoint.into()),
            ..Self::default()
        }
    }
}

/// Tagged variant covering the three entity kinds, for callers that pick
/// the kind at runtime. See [`crate::Net::make_entity`].
#[derive(Debug, Clone)]
pub enum EntityKind {
    TcpAcceptor(AcceptorConfig),
    TcpConnector(ConnectorConfig),
    Udp(UdpConfig),
}
