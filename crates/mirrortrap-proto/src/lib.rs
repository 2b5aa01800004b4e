//! Wire protocol for the mirrortrap tunnel and trigger services
//!
//! Defines the message types exchanged between tunnel clients, operator
//! tooling and the server, the length-prefixed bincode codec, and a framed
//! message stream that works over any ordered reliable byte stream.

pub mod codec;
pub mod messages;
pub mod stream;

pub use codec::{CodecError, MessageCodec};
pub use messages::{
    ClientMessage, DnsLogEvent, HttpFlow, IcmpTriggerNotification, Mirror, MirrorNetwork,
    PortTriggerNotification, ServerMessage,
};
pub use stream::{FramedStream, RecvHalf, SendHalf, StreamError};

/// Maximum size of a single encoded message (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
