//! Protocol message types

use serde::{Deserialize, Serialize};

/// Transport protocol of a mirror port
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MirrorNetwork {
    Tcp,
    Udp,
}

impl MirrorNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorNetwork::Tcp => "tcp",
            MirrorNetwork::Udp => "udp",
        }
    }
}

/// A forwarding request from client to server: bind `port` on the server
/// and relay every peer connection back through the stream under `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mirror {
    pub id: String,
    pub port: u16,
    pub network: MirrorNetwork,
}

impl Mirror {
    pub fn tcp(id: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            port,
            network: MirrorNetwork::Tcp,
        }
    }

    pub fn udp(id: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            port,
            network: MirrorNetwork::Udp,
        }
    }
}

/// Messages sent by a tunnel client or operator tooling to the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ClientMessage {
    /// Authenticate the connection. Must be the first message when the
    /// server is configured with a shared secret.
    Auth {
        secret: String,
    },

    /// First message of a tunnel stream: register one or more mirrors.
    /// An empty mirror list is a protocol violation that closes the stream.
    CreateTunnel {
        mirrors: Vec<Mirror>,
    },

    /// Bytes addressed to one peer connection of one mirror.
    /// `close=true` tears down that peer's descriptor on the server.
    TunnelData {
        to_id: String,
        to_remote_addr: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        close: bool,
    },

    /// Issue a correlation domain/token, optionally through a broker mode.
    RequireDomain {
        mode: String,
    },

    /// Query trigger events observed for a previously issued token.
    QueryExistedDnsLog {
        token: String,
        mode: String,
    },

    /// Reserve a tunnel registration (id + server-allocated port).
    RegisterTunnel {
        public_key: Vec<u8>,
        secret: String,
        verbose: String,
        /// Secondary password gating registration, if the server requires one
        auth: String,
    },

    /// Reserve a random ephemeral port correlated to `token`.
    RequireRandomPortTrigger {
        token: String,
        ttl_seconds: u32,
    },

    /// Query SYN triggers observed on the port reserved for `token`.
    QueryExistedRandomPortTrigger {
        token: String,
    },

    /// Query ICMP echo triggers for an attacker-chosen payload size.
    QuerySpecificIcmpLengthTrigger {
        length: u32,
    },

    /// Ask the server for the caller's address as the server sees it.
    RemoteIp,

    /// Ask the server to probe `server` (host:port) for reachability.
    CheckServerReachable {
        server: String,
        http_check: bool,
        http_flow: bool,
    },
}

/// Messages sent by the server
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ServerMessage {
    AuthOk,

    /// Acknowledges `CreateTunnel` with the effective mirrors (ports may
    /// differ from the request when a registration reserved one).
    TunnelCreated {
        mirrors: Vec<Mirror>,
    },

    /// Bytes from one peer connection of one mirror.
    TunnelData {
        from_id: String,
        remote_addr: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
        close: bool,
    },

    DomainAssigned {
        domain: String,
        token: String,
        mode: String,
    },

    DnsLogEvents {
        events: Vec<DnsLogEvent>,
    },

    TunnelRegistered {
        id: String,
    },

    RandomPortAssigned {
        port: u16,
        token: String,
        external_ip: String,
    },

    RandomPortEvents {
        events: Vec<PortTriggerNotification>,
    },

    IcmpNotifications {
        notifications: Vec<IcmpTriggerNotification>,
    },

    RemoteIp {
        ip_address: String,
    },

    ServerReachable {
        reachable: bool,
        verbose: String,
        http_flow: Option<HttpFlow>,
    },

    /// Request-level failure; the connection stays open unless the error
    /// concerned the first message of a tunnel stream.
    Error {
        message: String,
    },
}

/// One observed out-of-band interaction correlated to a token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DnsLogEvent {
    /// DNS record type ("A", "AAAA", "TXT", ...), or "HTTP"/"HTTPS" for
    /// blind web callbacks
    pub event_type: String,
    pub token: String,
    pub domain: String,
    pub remote_addr: String,
    pub remote_ip: String,
    pub remote_port: u16,
    #[serde(with = "serde_bytes")]
    pub raw: Vec<u8>,
    /// Unix timestamp (seconds)
    pub timestamp: i64,
}

/// Point-in-time snapshot of ICMP echo triggers for one total length
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IcmpTriggerNotification {
    /// IP total length the trigger is keyed by (payload size + 28)
    pub size: u32,
    pub current_remote_addr: String,
    /// Distinct source addresses observed for this size within the TTL
    pub history_count: u32,
    /// Distinct sizes cached for the current source address
    pub connection_count: u32,
    /// Unix timestamp of the most recent matching echo
    pub trigger_timestamp: i64,
    /// Unix timestamp at query time
    pub now: i64,
}

/// Point-in-time snapshot of SYN triggers for one listening port
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PortTriggerNotification {
    pub local_port: u16,
    pub current_remote_addr: String,
    /// Source addresses (host:port) observed for this port within the TTL
    pub histories: Vec<String>,
    /// Distinct ports cached for the current source address
    pub local_port_history_count: u32,
    /// Distinct source addresses observed for this port within the TTL
    pub remote_connection_count: u32,
    pub trigger_timestamp: i64,
    pub now: i64,
}

/// Captured request/response pair from an HTTP reachability probe
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpFlow {
    #[serde(with = "serde_bytes")]
    pub request: Vec<u8>,
    #[serde(with = "serde_bytes")]
    pub response: Vec<u8>,
}

// Custom serde helper for byte payloads
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(data)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Vec::<u8>::deserialize(deserializer)
    }
}
