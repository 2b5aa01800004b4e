//! ICMP echo-request trigger engine
//!
//! Records every inbound ICMP echo request addressed to the local
//! interface, keyed by the IP total length. Operators probe with a chosen
//! payload size; the engine answers point-in-time snapshots of which
//! sources echoed that size within the last minute.

use crate::{unix_now, EngineState, StateCell, TriggerError};
use mirrortrap_cache::TtlCache;
use mirrortrap_capture::{decode_ipv4, DecodedIpv4, TransportInfo};
use mirrortrap_proto::IcmpTriggerNotification;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fixed IPv4 + ICMP header overhead added to the attacker-chosen payload
/// size before lookup
pub const ICMP_HEADER_OVERHEAD: u32 = 28;

const TRIGGER_TTL: Duration = Duration::from_secs(60);
const ICMP_ECHO_REQUEST: u8 = 8;
const BPF_ICMP_ECHO: &str = "icmp and icmp[icmptype] = icmp-echo";

#[derive(Debug, Clone, Default)]
struct SignalRecord {
    current_remote_addr: String,
    history: HashSet<String>,
    last_timestamp: i64,
}

#[derive(Debug, Clone, Default)]
struct AddrRecord {
    connection_history: HashSet<u32>,
}

/// ICMP-length trigger engine
pub struct IcmpTriggerEngine {
    by_length: TtlCache<u32, SignalRecord>,
    by_addr: TtlCache<String, AddrRecord>,
    state: StateCell,
}

impl IcmpTriggerEngine {
    pub fn new() -> Arc<Self> {
        let by_length: TtlCache<u32, SignalRecord> = TtlCache::new(TRIGGER_TTL);
        let by_addr: TtlCache<String, AddrRecord> = TtlCache::new(TRIGGER_TTL);

        // New length entry: register the reverse by-addr entry.
        let reverse = by_addr.clone();
        by_length.set_on_insert(Arc::new(move |length: &u32, record: &SignalRecord| {
            let mut addr_record = reverse.get(&record.current_remote_addr).unwrap_or_default();
            addr_record.connection_history.insert(*length);
            reverse.set(record.current_remote_addr.clone(), addr_record);
        }));

        // Expired length entry: clean every contributing source's history.
        let reverse = by_addr.clone();
        by_length.set_on_expire(Arc::new(move |length: &u32, record: &SignalRecord| {
            for addr in &record.history {
                reverse.mutate(addr, |r| {
                    r.connection_history.remove(length);
                });
            }
        }));

        // Expired source: drop it from every length it echoed; a length
        // with no remaining sources disappears entirely.
        let lengths = by_length.clone();
        by_addr.set_on_expire(Arc::new(move |addr: &String, record: &AddrRecord| {
            for length in &record.connection_history {
                let mut emptied = false;
                lengths.mutate(length, |r| {
                    r.history.remove(addr);
                    emptied = r.history.is_empty();
                });
                if emptied {
                    lengths.remove(length);
                    debug!(length = *length, "Dropped length trigger with no live sources");
                }
            }
        }));

        Arc::new(Self {
            by_length,
            by_addr,
            state: StateCell::new(),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    /// Consume the capture until cancellation
    ///
    /// Capture open failure is fatal to this engine only. A capture that
    /// stops mid-run (device reset, read error) is reopened.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TriggerError> {
        self.state.set(EngineState::Running);
        let result = self.run_inner(&cancel).await;
        self.state.set(EngineState::Stopped);
        result
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<(), TriggerError> {
        loop {
            let mut stream = mirrortrap_capture::open_live(BPF_ICMP_ECHO, cancel.clone())?;
            let local_ip = stream.local_ip();
            let datalink = stream.datalink();
            info!(local_ip = %local_ip, "ICMP trigger engine capturing");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    packet = stream.next() => match packet {
                        Some(packet) => {
                            if let Some(decoded) = decode_ipv4(datalink, &packet.data) {
                                self.observe(&decoded, local_ip);
                            }
                        }
                        None => break,
                    },
                }
            }

            if cancel.is_cancelled() {
                return Ok(());
            }
            warn!("ICMP capture stopped, reopening");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    fn observe(&self, packet: &DecodedIpv4, local_ip: IpAddr) {
        if IpAddr::V4(packet.destination) != local_ip {
            return;
        }
        match packet.transport {
            TransportInfo::Icmp { icmp_type } if icmp_type == ICMP_ECHO_REQUEST => {
                self.record_echo(packet.source.to_string(), packet.total_length as u32);
            }
            _ => {}
        }
    }

    /// Record one echo request of `total_length` from `source`
    fn record_echo(&self, source: String, total_length: u32) {
        let now = unix_now();

        let mut record = self.by_length.get(&total_length).unwrap_or_default();
        record.current_remote_addr = source.clone();
        record.history.insert(source.clone());
        record.last_timestamp = now;
        self.by_length.set(total_length, record);

        let mut addr_record = self.by_addr.get(&source).unwrap_or_default();
        addr_record.connection_history.insert(total_length);
        self.by_addr.set(source, addr_record);
    }

    /// Snapshot the trigger state for an attacker-chosen payload size
    ///
    /// The fixed IP+ICMP overhead is added before lookup, so callers pass
    /// the size they told the target to echo.
    pub fn get_trigger_notification(
        &self,
        payload_size: u32,
    ) -> Result<IcmpTriggerNotification, TriggerError> {
        let size = payload_size + ICMP_HEADER_OVERHEAD;
        let record = self
            .by_length
            .get(&size)
            .ok_or(TriggerError::EmptySizeConnections)?;

        let connection_count = self
            .by_addr
            .get(&record.current_remote_addr)
            .map(|r| r.connection_history.len())
            .unwrap_or(0);

        Ok(IcmpTriggerNotification {
            size,
            current_remote_addr: record.current_remote_addr,
            history_count: record.history.len() as u32,
            connection_count: connection_count as u32,
            trigger_timestamp: record.last_timestamp,
            now: unix_now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_never_seen_size_is_an_error() {
        let engine = IcmpTriggerEngine::new();
        let err = engine.get_trigger_notification(0).unwrap_err();
        assert_eq!(err.to_string(), "empty size connections");
    }

    #[tokio::test]
    async fn test_echo_recorded_with_header_overhead() {
        let engine = IcmpTriggerEngine::new();
        // Target echoes a 64-byte payload: wire total length is 64 + 28
        engine.record_echo("203.0.113.9".to_string(), 64 + ICMP_HEADER_OVERHEAD);

        let notification = engine.get_trigger_notification(64).unwrap();
        assert_eq!(notification.size, 92);
        assert_eq!(notification.current_remote_addr, "203.0.113.9");
        assert_eq!(notification.history_count, 1);
        assert_eq!(notification.connection_count, 1);
        assert!(notification.now >= notification.trigger_timestamp);
    }

    #[tokio::test]
    async fn test_multiple_sources_accumulate_history() {
        let engine = IcmpTriggerEngine::new();
        for i in 1..=4u8 {
            engine.record_echo(format!("203.0.113.{}", i), 92);
        }

        let notification = engine.get_trigger_notification(64).unwrap();
        assert_eq!(notification.history_count, 4);
        assert_eq!(notification.current_remote_addr, "203.0.113.4");
    }

    #[tokio::test]
    async fn test_connection_count_tracks_sizes_per_source() {
        let engine = IcmpTriggerEngine::new();
        engine.record_echo("203.0.113.9".to_string(), 92);
        engine.record_echo("203.0.113.9".to_string(), 128);
        engine.record_echo("203.0.113.9".to_string(), 156);

        let notification = engine.get_trigger_notification(64).unwrap();
        assert_eq!(notification.connection_count, 3);
    }

    #[tokio::test]
    async fn test_observe_ignores_foreign_destination() {
        let engine = IcmpTriggerEngine::new();
        let packet = DecodedIpv4 {
            source: "203.0.113.9".parse().unwrap(),
            destination: "192.0.2.50".parse().unwrap(),
            total_length: 92,
            transport: TransportInfo::Icmp {
                icmp_type: ICMP_ECHO_REQUEST,
            },
        };
        engine.observe(&packet, "198.51.100.1".parse().unwrap());
        assert!(engine.get_trigger_notification(64).is_err());
    }

    #[tokio::test]
    async fn test_expired_source_cascades_to_length_removal() {
        let engine = IcmpTriggerEngine::new();
        engine.by_length.set_ttl(Duration::from_millis(500));
        engine.by_addr.set_ttl(Duration::from_millis(30));

        engine.record_echo("203.0.113.9".to_string(), 92);
        assert!(engine.get_trigger_notification(64).is_ok());

        tokio::time::sleep(Duration::from_millis(80)).await;
        engine.by_addr.sweep();

        // The only source expired; the by-length entry must be gone even
        // though its own TTL has not elapsed.
        assert!(engine.get_trigger_notification(64).is_err());
    }

    #[tokio::test]
    async fn test_engine_state_transitions() {
        let engine = IcmpTriggerEngine::new();
        assert_eq!(engine.state(), EngineState::NotRunning);
        engine.state.set(EngineState::Running);
        assert_eq!(engine.state(), EngineState::Running);
        engine.state.set(EngineState::Stopped);
        assert_eq!(engine.state(), EngineState::Stopped);
    }
}
