//! Token to random-port reservations for SYN triggers

use crate::TriggerError;
use mirrortrap_cache::TtlCache;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Ephemeral range reserved for random-port triggers
pub const PORT_RANGE_MIN: u16 = 55000;
pub const PORT_RANGE_MAX: u16 = 65534;

const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(60);
const PICK_ATTEMPTS: usize = 128;

/// External view of ports already claimed elsewhere (active mirrors,
/// tunnel registrations). Injected so the reservation store never reaches
/// into other services.
pub trait PortUsage: Send + Sync {
    fn is_port_claimed(&self, port: u16) -> bool;
}

/// Nothing else claims ports; useful standalone and in tests.
pub struct NoPortUsage;

impl PortUsage for NoPortUsage {
    fn is_port_claimed(&self, _port: u16) -> bool {
        false
    }
}

/// Token-keyed reservations of random trigger ports
pub struct PortTriggerReservations {
    token_to_port: TtlCache<String, u16>,
    port_to_token: TtlCache<u16, String>,
    usage: Arc<dyn PortUsage>,
}

impl PortTriggerReservations {
    pub fn new(usage: Arc<dyn PortUsage>) -> Self {
        Self {
            token_to_port: TtlCache::new(DEFAULT_RESERVATION_TTL),
            port_to_token: TtlCache::new(DEFAULT_RESERVATION_TTL),
            usage,
        }
    }

    /// Reserve a random ephemeral port for `token`
    ///
    /// A token with a live reservation keeps its port (TTL refreshed).
    /// Ports claimed by other tokens or by the injected usage probe are
    /// skipped.
    pub fn reserve(&self, token: &str, ttl: Duration) -> Result<u16, TriggerError> {
        let ttl = if ttl.is_zero() {
            DEFAULT_RESERVATION_TTL
        } else {
            ttl
        };

        if let Some(port) = self.token_to_port.get(&token.to_string()) {
            self.token_to_port
                .set_with_ttl(token.to_string(), port, ttl);
            self.port_to_token
                .set_with_ttl(port, token.to_string(), ttl);
            return Ok(port);
        }

        let mut rng = rand::thread_rng();
        for _ in 0..PICK_ATTEMPTS {
            let port = rng.gen_range(PORT_RANGE_MIN..=PORT_RANGE_MAX);
            if self.port_to_token.contains_key(&port) || self.usage.is_port_claimed(port) {
                continue;
            }
            self.token_to_port
                .set_with_ttl(token.to_string(), port, ttl);
            self.port_to_token
                .set_with_ttl(port, token.to_string(), ttl);
            debug!(token = %token, port = port, "Reserved random trigger port");
            return Ok(port);
        }

        Err(TriggerError::NoFreePort)
    }

    /// Port reserved for `token`, if the reservation is still live
    pub fn port_for(&self, token: &str) -> Result<u16, TriggerError> {
        self.token_to_port
            .get(&token.to_string())
            .ok_or(TriggerError::EmptyTokenPortMapped)
    }

    /// Whether `port` is currently reserved by any token
    pub fn is_reserved(&self, port: u16) -> bool {
        self.port_to_token.contains_key(&port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reserved_port_is_in_range() {
        let reservations = PortTriggerReservations::new(Arc::new(NoPortUsage));
        let port = reservations.reserve("tok1", Duration::ZERO).unwrap();
        assert!((PORT_RANGE_MIN..=PORT_RANGE_MAX).contains(&port));
        assert_eq!(reservations.port_for("tok1").unwrap(), port);
    }

    #[tokio::test]
    async fn test_distinct_tokens_get_distinct_ports() {
        let reservations = PortTriggerReservations::new(Arc::new(NoPortUsage));
        let p1 = reservations.reserve("tok1", Duration::ZERO).unwrap();
        let p2 = reservations.reserve("tok2", Duration::ZERO).unwrap();
        assert_ne!(p1, p2);
    }

    #[tokio::test]
    async fn test_same_token_keeps_its_port() {
        let reservations = PortTriggerReservations::new(Arc::new(NoPortUsage));
        let p1 = reservations.reserve("tok1", Duration::ZERO).unwrap();
        let p2 = reservations.reserve("tok1", Duration::ZERO).unwrap();
        assert_eq!(p1, p2);
    }

    #[tokio::test]
    async fn test_unknown_token_is_an_error() {
        let reservations = PortTriggerReservations::new(Arc::new(NoPortUsage));
        let err = reservations.port_for("missing").unwrap_err();
        assert_eq!(err.to_string(), "empty token port mapped");
    }

    #[tokio::test]
    async fn test_expired_reservation_is_an_error() {
        let reservations = PortTriggerReservations::new(Arc::new(NoPortUsage));
        reservations
            .reserve("tok1", Duration::from_millis(20))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(reservations.port_for("tok1").is_err());
    }

    #[tokio::test]
    async fn test_usage_probe_excludes_claimed_ports() {
        struct AllClaimed;
        impl PortUsage for AllClaimed {
            fn is_port_claimed(&self, _port: u16) -> bool {
                true
            }
        }

        let reservations = PortTriggerReservations::new(Arc::new(AllClaimed));
        let err = reservations.reserve("tok1", Duration::ZERO).unwrap_err();
        assert_eq!(err.to_string(), "no free trigger port available");
    }
}
