//! Live packet capture adapter
//!
//! Resolves the default-route interface, opens a live capture with a
//! textual BPF filter, and yields an infinite, restartable sequence of
//! link-layer packets over a tokio channel. The blocking pcap read loop
//! runs on a dedicated thread and stops when the owning cancellation
//! token fires.

pub mod decode;

pub use decode::{decode_ipv4, DecodedIpv4, TransportInfo};

use std::net::IpAddr;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capture errors; fatal to the owning engine's run loop, never to the process
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("No capture interface found for local address {0}")]
    NoInterface(IpAddr),

    #[error("Failed to resolve default route: {0}")]
    RouteProbe(#[from] std::io::Error),

    #[error("Capture error: {0}")]
    Pcap(#[from] pcap::Error),
}

/// Address probed to discover the default outbound interface; no traffic
/// is sent, the UDP connect only selects a route.
const ROUTE_PROBE_ADDR: (&str, u16) = ("8.8.8.8", 53);

const CHANNEL_CAPACITY: usize = 1024;
const READ_TIMEOUT_MS: i32 = 100;

/// One captured link-layer packet
#[derive(Debug, Clone)]
pub struct CapturedPacket {
    pub data: Vec<u8>,
}

/// Resolve the default outbound interface and its local IP
pub fn default_interface() -> Result<(pcap::Device, IpAddr), CaptureError> {
    let probe = std::net::UdpSocket::bind(("0.0.0.0", 0))?;
    probe.connect(ROUTE_PROBE_ADDR)?;
    let local_ip = probe.local_addr()?.ip();

    let device = pcap::Device::list()?
        .into_iter()
        .find(|d| d.addresses.iter().any(|a| a.addr == local_ip))
        .ok_or(CaptureError::NoInterface(local_ip))?;

    debug!(device = %device.name, local_ip = %local_ip, "Resolved capture interface");
    Ok((device, local_ip))
}

/// A running capture: local interface address plus the packet channel
pub struct PacketStream {
    local_ip: IpAddr,
    datalink: pcap::Linktype,
    rx: mpsc::Receiver<CapturedPacket>,
}

impl PacketStream {
    /// Local IP of the capture interface
    pub fn local_ip(&self) -> IpAddr {
        self.local_ip
    }

    /// Link-layer type of the capture handle
    pub fn datalink(&self) -> pcap::Linktype {
        self.datalink
    }

    /// Next captured packet; `None` once the capture stopped (cancellation
    /// or a capture-level error). The owner may open a fresh capture.
    pub async fn next(&mut self) -> Option<CapturedPacket> {
        self.rx.recv().await
    }
}

/// Open a live capture on the default-route interface
///
/// `filter` is a textual BPF expression, e.g.
/// `"icmp and icmp[icmptype] = icmp-echo"` or
/// `"tcp[tcpflags] & (tcp-syn|tcp-ack) == tcp-syn"`.
pub fn open_live(filter: &str, cancel: CancellationToken) -> Result<PacketStream, CaptureError> {
    let (device, local_ip) = default_interface()?;
    let device_name = device.name.clone();

    let mut cap = pcap::Capture::from_device(device)?
        .immediate_mode(true)
        .timeout(READ_TIMEOUT_MS)
        .open()?;
    cap.filter(filter, true)?;
    let datalink = cap.get_datalink();

    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);

    std::thread::Builder::new()
        .name(format!("pcap-{}", device_name))
        .spawn(move || {
            capture_loop(cap, tx, cancel);
        })
        .map_err(CaptureError::RouteProbe)?;

    Ok(PacketStream {
        local_ip,
        datalink,
        rx,
    })
}

fn capture_loop(
    mut cap: pcap::Capture<pcap::Active>,
    tx: mpsc::Sender<CapturedPacket>,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            debug!("Capture loop cancelled");
            break;
        }
        match cap.next_packet() {
            Ok(packet) => {
                let captured = CapturedPacket {
                    data: packet.data.to_vec(),
                };
                // Receiver gone means the owning engine stopped
                if tx.blocking_send(captured).is_err() {
                    break;
                }
            }
            // Poll tick: lets the loop observe cancellation
            Err(pcap::Error::TimeoutExpired) => continue,
            Err(pcap::Error::NoMorePackets) => break,
            Err(e) => {
                warn!("Capture read failed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Live captures need elevated privileges; the adapter's decode path is
    // covered in decode.rs and the interface probe is covered here.

    #[test]
    fn test_default_interface_probe() {
        // The probe only inspects routing state. Environments without a
        // default route (or without pcap visibility) surface a CaptureError,
        // which is the documented fatal-to-engine condition.
        match default_interface() {
            Ok((device, local_ip)) => {
                assert!(!device.name.is_empty());
                assert!(!local_ip.is_unspecified());
            }
            Err(CaptureError::NoInterface(_))
            | Err(CaptureError::RouteProbe(_))
            | Err(CaptureError::Pcap(_)) => {}
        }
    }
}
