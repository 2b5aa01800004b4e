//! Authoritative-style DNS listener feeding the correlation cache

use crate::{broker::split_host_port, dns, DnsLogError, DnsLogService};
use mirrortrap_proto::DnsLogEvent;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 1500;

/// UDP DNS listener bound to one socket
pub struct DnsLogListener {
    socket: UdpSocket,
    service: Arc<DnsLogService>,
}

impl DnsLogListener {
    /// Bind the listener; a bind failure is fatal to this listener only
    pub async fn bind(
        addr: SocketAddr,
        service: Arc<DnsLogService>,
    ) -> Result<Self, DnsLogError> {
        let socket = UdpSocket::bind(addr).await?;
        info!(addr = %socket.local_addr()?, "DNS log listener bound");
        Ok(Self { socket, service })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, DnsLogError> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve queries until cancellation
    pub async fn run(self, cancel: CancellationToken) -> Result<(), DnsLogError> {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, peer) = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        // Transient receive errors never kill the listener
                        warn!("DNS receive failed: {}", e);
                        continue;
                    }
                },
            };

            let datagram = &buf[..len];
            let query = match dns::parse_query(datagram) {
                Some(query) => query,
                None => continue,
            };

            self.observe(&query, datagram, peer);

            let response = dns::build_response(&query, datagram, self.service.external_ip());
            if let Err(e) = self.socket.send_to(&response, peer).await {
                debug!(peer = %peer, "DNS response send failed: {}", e);
            }
        }
    }

    /// Correlate one received query to a token, if any root matches
    fn observe(&self, query: &dns::DnsQuery, datagram: &[u8], peer: SocketAddr) {
        let token = match self.service.match_token(&query.name) {
            Some(token) => token,
            None => return,
        };

        let remote_addr = peer.to_string();
        let (remote_ip, remote_port) = split_host_port(&remote_addr);
        let event = DnsLogEvent {
            event_type: query.qtype_name(),
            token: token.clone(),
            domain: query.name.clone(),
            remote_addr,
            remote_ip,
            remote_port,
            raw: datagram.to_vec(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        self.service.record_query(&token, event);
    }
}
