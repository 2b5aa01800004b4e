//! Link-layer to IPv4/transport packet decoding

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::icmp::IcmpPacket;
use pnet::packet::ip::IpNextHeaderProtocols;
use pnet::packet::ipv4::Ipv4Packet;
use pnet::packet::tcp::{TcpFlags, TcpPacket};
use pnet::packet::udp::UdpPacket;
use pnet::packet::Packet;
use std::net::Ipv4Addr;

/// Decoded transport header of an IPv4 packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportInfo {
    Tcp {
        source_port: u16,
        destination_port: u16,
        syn: bool,
        ack: bool,
    },
    Udp {
        source_port: u16,
        destination_port: u16,
    },
    Icmp {
        icmp_type: u8,
    },
    Other(u8),
}

/// Decoded IPv4 packet view
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedIpv4 {
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    /// IP total length field: header plus transport payload
    pub total_length: u16,
    pub transport: TransportInfo,
}

/// Decode a captured link-layer packet into an IPv4 view
///
/// Non-IPv4 packets and truncated headers yield `None`.
pub fn decode_ipv4(datalink: pcap::Linktype, data: &[u8]) -> Option<DecodedIpv4> {
    let ip_bytes = strip_link_header(datalink, data)?;
    let ipv4 = Ipv4Packet::new(ip_bytes)?;
    if ipv4.get_version() != 4 {
        return None;
    }

    let transport = match ipv4.get_next_level_protocol() {
        IpNextHeaderProtocols::Tcp => {
            let tcp = TcpPacket::new(ipv4.payload())?;
            let flags = tcp.get_flags();
            TransportInfo::Tcp {
                source_port: tcp.get_source(),
                destination_port: tcp.get_destination(),
                syn: flags & TcpFlags::SYN != 0,
                ack: flags & TcpFlags::ACK != 0,
            }
        }
        IpNextHeaderProtocols::Udp => {
            let udp = UdpPacket::new(ipv4.payload())?;
            TransportInfo::Udp {
                source_port: udp.get_source(),
                destination_port: udp.get_destination(),
            }
        }
        IpNextHeaderProtocols::Icmp => {
            let icmp = IcmpPacket::new(ipv4.payload())?;
            TransportInfo::Icmp {
                icmp_type: icmp.get_icmp_type().0,
            }
        }
        other => TransportInfo::Other(other.0),
    };

    Some(DecodedIpv4 {
        source: ipv4.get_source(),
        destination: ipv4.get_destination(),
        total_length: ipv4.get_total_length(),
        transport,
    })
}

fn strip_link_header(datalink: pcap::Linktype, data: &[u8]) -> Option<&[u8]> {
    match datalink {
        pcap::Linktype::ETHERNET => {
            let eth = EthernetPacket::new(data)?;
            if eth.get_ethertype() != EtherTypes::Ipv4 {
                return None;
            }
            data.get(EthernetPacket::minimum_packet_size()..)
        }
        // BSD loopback: 4-byte address-family header
        pcap::Linktype::NULL | pcap::Linktype::LOOP => data.get(4..),
        // Linux cooked capture: 16-byte pseudo header
        pcap::Linktype::LINUX_SLL => data.get(16..),
        // Raw IP, no link header
        pcap::Linktype::RAW | pcap::Linktype::IPV4 => Some(data),
        _ => {
            // Unknown link type: assume ethernet framing
            let eth = EthernetPacket::new(data)?;
            if eth.get_ethertype() != EtherTypes::Ipv4 {
                return None;
            }
            data.get(EthernetPacket::minimum_packet_size()..)
        }
    }
}
