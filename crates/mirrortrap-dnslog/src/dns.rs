//! Minimal DNS wire handling for the authoritative log listener
//!
//! Only what an observation server needs: decode the question section of
//! inbound queries and build NOERROR answers pointing at the configured
//! external address. Resolution itself is out of scope.

use std::net::Ipv4Addr;

const HEADER_LEN: usize = 12;
const MAX_LABEL_WALK: usize = 128;

pub const QTYPE_A: u16 = 1;
pub const QTYPE_ANY: u16 = 255;

/// Decoded question section of one DNS query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    /// Lowercased query name without the trailing dot
    pub name: String,
    pub qtype: u16,
}

impl DnsQuery {
    /// Record-type mnemonic ("A", "TXT", ...) or the numeric type
    pub fn qtype_name(&self) -> String {
        match self.qtype {
            1 => "A".to_string(),
            2 => "NS".to_string(),
            5 => "CNAME".to_string(),
            6 => "SOA".to_string(),
            12 => "PTR".to_string(),
            15 => "MX".to_string(),
            16 => "TXT".to_string(),
            28 => "AAAA".to_string(),
            33 => "SRV".to_string(),
            255 => "ANY".to_string(),
            other => other.to_string(),
        }
    }
}

/// Decode the first question of a DNS query datagram
pub fn parse_query(data: &[u8]) -> Option<DnsQuery> {
    if data.len() < HEADER_LEN {
        return None;
    }

    let id = u16::from_be_bytes([data[0], data[1]]);
    let flags = u16::from_be_bytes([data[2], data[3]]);
    // Responses (QR set) are not queries
    if flags & 0x8000 != 0 {
        return None;
    }
    let qdcount = u16::from_be_bytes([data[4], data[5]]);
    if qdcount == 0 {
        return None;
    }

    let mut name = String::new();
    let mut offset = HEADER_LEN;
    for _ in 0..MAX_LABEL_WALK {
        let len = *data.get(offset)? as usize;
        if len == 0 {
            offset += 1;
            break;
        }
        // Compression pointers never appear in a well-formed question name
        if len & 0xc0 != 0 {
            return None;
        }
        let label = data.get(offset + 1..offset + 1 + len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.push_str(&String::from_utf8_lossy(label).to_lowercase());
        offset += 1 + len;
    }

    let qtype = u16::from_be_bytes([*data.get(offset)?, *data.get(offset + 1)?]);

    Some(DnsQuery { id, name, qtype })
}

/// Build a NOERROR response to `raw_query`
///
/// A and ANY questions get one A record pointing at `answer_ip`; other
/// types get an empty answer section.
pub fn build_response(query: &DnsQuery, raw_query: &[u8], answer_ip: Ipv4Addr) -> Vec<u8> {
    let question_len = raw_query.len().saturating_sub(HEADER_LEN);
    let answers = query.qtype == QTYPE_A || query.qtype == QTYPE_ANY;

    let mut out = Vec::with_capacity(HEADER_LEN + question_len + 16);
    out.extend_from_slice(&query.id.to_be_bytes());
    // QR + AA + RD + RA, NOERROR
    out.extend_from_slice(&0x8580u16.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    out.extend_from_slice(&(answers as u16).to_be_bytes()); // ANCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // NSCOUNT
    out.extend_from_slice(&0u16.to_be_bytes()); // ARCOUNT
    out.extend_from_slice(&raw_query[HEADER_LEN..]);

    if answers {
        out.extend_from_slice(&0xc00cu16.to_be_bytes()); // pointer to question name
        out.extend_from_slice(&QTYPE_A.to_be_bytes());
        out.extend_from_slice(&1u16.to_be_bytes()); // IN
        out.extend_from_slice(&60u32.to_be_bytes()); // TTL
        out.extend_from_slice(&4u16.to_be_bytes());
        out.extend_from_slice(&answer_ip.octets());
    }

    out
}

/// Encode a question datagram; test helper for driving the listener
pub fn build_query(id: u16, name: &str, qtype: u16) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + name.len() + 6);
    out.extend_from_slice(&id.to_be_bytes());
    out.extend_from_slice(&0x0100u16.to_be_bytes()); // RD
    out.extend_from_slice(&1u16.to_be_bytes());
    out.extend_from_slice(&[0u8; 6]);
    for label in name.split('.').filter(|l| !l.is_empty()) {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    out.extend_from_slice(&qtype.to_be_bytes());
    out.extend_from_slice(&1u16.to_be_bytes()); // IN
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query_roundtrip() {
        let raw = build_query(0x1234, "AbCdEfGhIj.oob.example.com", QTYPE_A);
        let query = parse_query(&raw).unwrap();
        assert_eq!(query.id, 0x1234);
        assert_eq!(query.name, "abcdefghij.oob.example.com");
        assert_eq!(query.qtype, QTYPE_A);
        assert_eq!(query.qtype_name(), "A");
    }

    #[test]
    fn test_parse_rejects_responses() {
        let mut raw = build_query(1, "x.example.com", QTYPE_A);
        raw[2] |= 0x80;
        assert!(parse_query(&raw).is_none());
    }

    #[test]
    fn test_parse_rejects_truncated() {
        assert!(parse_query(&[0u8; 5]).is_none());
        let raw = build_query(1, "x.example.com", QTYPE_A);
        assert!(parse_query(&raw[..raw.len() - 3]).is_none());
    }

    #[test]
    fn test_response_answers_a_queries() {
        let raw = build_query(7, "tok.oob.example.com", QTYPE_A);
        let query = parse_query(&raw).unwrap();
        let response = build_response(&query, &raw, Ipv4Addr::new(198, 51, 100, 1));

        assert_eq!(u16::from_be_bytes([response[0], response[1]]), 7);
        // ANCOUNT == 1
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 1);
        // Last four bytes are the answer address
        assert_eq!(&response[response.len() - 4..], &[198, 51, 100, 1]);
    }

    #[test]
    fn test_response_to_txt_query_has_no_answer() {
        let raw = build_query(7, "tok.oob.example.com", 16);
        let query = parse_query(&raw).unwrap();
        let response = build_response(&query, &raw, Ipv4Addr::new(198, 51, 100, 1));
        assert_eq!(u16::from_be_bytes([response[6], response[7]]), 0);
    }
}
