//! Random-port TCP SYN trigger engine
//!
//! Mirrors the ICMP engine, keyed by the destination (listening) port of
//! inbound SYNs instead of the echo length. Combined with a per-token port
//! reservation, a single SYN against the reserved port confirms an
//! out-of-band connection attempt.

use crate::{unix_now, EngineState, StateCell, TriggerError};
use mirrortrap_cache::TtlCache;
use mirrortrap_capture::{decode_ipv4, DecodedIpv4, TransportInfo};
use mirrortrap_proto::PortTriggerNotification;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TRIGGER_TTL: Duration = Duration::from_secs(60);
const BPF_TCP_SYN: &str = "tcp[tcpflags] & (tcp-syn|tcp-ack) == tcp-syn";

#[derive(Debug, Clone, Default)]
struct PortRecord {
    /// host:port of the most recent SYN source
    current_remote_addr: String,
    /// SYN sources in observation order, deduplicated
    history: Vec<String>,
    last_timestamp: i64,
}

impl PortRecord {
    fn push_source(&mut self, addr: String) {
        if !self.history.contains(&addr) {
            self.history.push(addr.clone());
        }
        self.current_remote_addr = addr;
    }
}

#[derive(Debug, Clone, Default)]
struct AddrRecord {
    connection_history: HashSet<u16>,
}

/// TCP SYN trigger engine
pub struct PortTriggerEngine {
    by_port: TtlCache<u16, PortRecord>,
    by_addr: TtlCache<String, AddrRecord>,
    state: StateCell,
}

impl PortTriggerEngine {
    pub fn new() -> Arc<Self> {
        let by_port: TtlCache<u16, PortRecord> = TtlCache::new(TRIGGER_TTL);
        let by_addr: TtlCache<String, AddrRecord> = TtlCache::new(TRIGGER_TTL);

        let reverse = by_addr.clone();
        by_port.set_on_insert(Arc::new(move |port: &u16, record: &PortRecord| {
            if let Some(ip) = split_ip(&record.current_remote_addr) {
                let mut addr_record = reverse.get(&ip).unwrap_or_default();
                addr_record.connection_history.insert(*port);
                reverse.set(ip, addr_record);
            }
        }));

        let reverse = by_addr.clone();
        by_port.set_on_expire(Arc::new(move |port: &u16, record: &PortRecord| {
            for addr in &record.history {
                if let Some(ip) = split_ip(addr) {
                    reverse.mutate(&ip, |r| {
                        r.connection_history.remove(port);
                    });
                }
            }
        }));

        let ports = by_port.clone();
        by_addr.set_on_expire(Arc::new(move |ip: &String, record: &AddrRecord| {
            for port in &record.connection_history {
                let mut emptied = false;
                ports.mutate(port, |r| {
                    r.history
                        .retain(|addr| split_ip(addr).as_deref() != Some(ip.as_str()));
                    emptied = r.history.is_empty();
                });
                if emptied {
                    ports.remove(port);
                    debug!(port = *port, "Dropped port trigger with no live sources");
                }
            }
        }));

        Arc::new(Self {
            by_port,
            by_addr,
            state: StateCell::new(),
        })
    }

    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    /// Consume the capture until cancellation; open failure is fatal to
    /// this engine only, a stopped capture is reopened.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), TriggerError> {
        self.state.set(EngineState::Running);
        let result = self.run_inner(&cancel).await;
        self.state.set(EngineState::Stopped);
        result
    }

    async fn run_inner(&self, cancel: &CancellationToken) -> Result<(), TriggerError> {
        loop {
            let mut stream = mirrortrap_capture::open_live(BPF_TCP_SYN, cancel.clone())?;
            let local_ip = stream.local_ip();
            let datalink = stream.datalink();
            info!(local_ip = %local_ip, "Random-port trigger engine capturing");

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
            warn!("SYN capture stopped, reopening");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    fn observe(&self, packet: &DecodedIpv4, local_ip: IpAddr) {
        if IpAddr::V4(packet.destination) != local_ip {
            return;
        }
        if let TransportInfo::Tcp {
            source_port,
            destination_port,
            syn: true,
            ack: false,
        } = packet.transport
        {
            self.record_syn(
                format!("{}:{}", packet.source, source_port),
                destination_port,
            );
        }
    }

    /// Record one SYN from `source` (host:port) to local `port`
    fn record_syn(&self, source: String, port: u16) {
        let now = unix_now();

        let mut record = self.by_port.get(&port).unwrap_or_default();
        record.push_source(source.clone());
        record.last_timestamp = now;
        self.by_port.set(port, record);

        if let Some(ip) = split_ip(&source) {
            let mut addr_record = self.by_addr.get(&ip).unwrap_or_default();
            addr_record.connection_history.insert(port);
            self.by_addr.set(ip, addr_record);
        }
    }

    /// Snapshot the trigger state for one listening port
    pub fn get_trigger_notification(
        &self,
        port: u16,
    ) -> Result<PortTriggerNotification, TriggerError> {
        let record = self
            .by_port
            .get(&port)
            .ok_or(TriggerError::EmptyPortConnections)?;

        let local_port_history_count = split_ip(&record.current_remote_addr)
            .and_then(|ip| self.by_addr.get(&ip))
            .map(|r| r.connection_history.len())
            .unwrap_or(0);

        Ok(PortTriggerNotification {
            local_port: port,
            current_remote_addr: record.current_remote_addr,
            remote_connection_count: record.history.len() as u32,
            histories: record.history,
            local_port_history_count: local_port_history_count as u32,
            trigger_timestamp: record.last_timestamp,
            now: unix_now(),
        })
    }
}

/// Host part of a "host:port" address
fn split_ip(addr: &str) -> Option<String> {
    addr.rsplit_once(':').map(|(host, _)| host.to_string())
}
