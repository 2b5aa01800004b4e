//! Passive out-of-band trigger engines
//!
//! Two packet-capture correlation engines confirm blind vulnerabilities:
//! the ICMP engine correlates inbound echo requests by payload length to
//! their source address, the port engine correlates inbound TCP SYNs by
//! destination port. Both keep their state in 1-minute TTL caches so idle
//! signals clean themselves up.

pub mod icmp;
pub mod port;
pub mod reservation;

pub use icmp::IcmpTriggerEngine;
pub use port::PortTriggerEngine;
pub use reservation::{PortTriggerReservations, PortUsage};

use std::sync::atomic::{AtomicU8, Ordering};
use thiserror::Error;

/// Trigger errors
#[derive(Debug, Error)]
pub enum TriggerError {
    /// No echo of the requested size has been observed within the TTL
    #[error("empty size connections")]
    EmptySizeConnections,

    /// The token has no live port reservation
    #[error("empty token port mapped")]
    EmptyTokenPortMapped,

    /// No SYN to the requested port has been observed within the TTL
    #[error("empty port connections")]
    EmptyPortConnections,

    #[error("no free trigger port available")]
    NoFreePort,

    #[error("Capture error: {0}")]
    Capture(#[from] mirrortrap_capture::CaptureError),
}

/// Lifecycle of a trigger engine's run loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    NotRunning,
    Running,
    Stopped,
}

pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    pub(crate) fn set(&self, state: EngineState) {
        let raw = match state {
            EngineState::NotRunning => 0,
            EngineState::Running => 1,
            EngineState::Stopped => 2,
        };
        self.0.store(raw, Ordering::SeqCst);
    }

    pub(crate) fn get(&self) -> EngineState {
        match self.0.load(Ordering::SeqCst) {
            1 => EngineState::Running,
            2 => EngineState::Stopped,
            _ => EngineState::NotRunning,
        }
    }
}

pub(crate) fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
