//! Tunnel server: connection multiplexer and control RPC surface
//!
//! Accepts framed message streams from tunnel clients and operator
//! tooling. A stream that opens with a mirror registration becomes a
//! multiplexed tunnel session; any other stream serves request/response
//! control calls against the trigger, DNS-log and registry services.

pub mod handler;
pub mod mux;
pub mod server;

pub use handler::ControlHandler;
pub use mux::run_mirror_session;
pub use server::{ClaimedPorts, ServerConfig, TunnelServer};

use thiserror::Error;

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// The first message of a tunnel stream must register mirrors
    #[error("empty mirrors")]
    EmptyMirrors,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("Stream error: {0}")]
    Stream(#[from] mirrortrap_proto::StreamError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
