use pnet::packet::icmp::{IcmpPacket, IcmpTypes};
use pnet::packet::ipv4::Ipv4Packet;
use std::net::Ipv4Addr;

use crate::state::{ProbeId, ReplyKind};

/// ICMP header size (fixed)
pub const ICMP_HEADER_SIZE: usize = 8;
/// IPv4 header without options
pub const IPV4_MIN_HEADER_SIZE: usize = 20;

const IPPROTO_ICMP: u8 = 1;
const ICMP_ECHO_REQUEST: u8 = 8;

/// Get process identifier for ICMP identification field
pub fn get_identifier() -> u16 {
    (std::process::id() & 0xFFFF) as u16
}

/// Internet checksum (RFC 1071): ones'-complement of the ones'-complement sum
/// of all 16-bit big-endian words, odd trailing byte padded with zero.
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += u16::from_be_bytes([word[0], word[1]]) as u32;
    }
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }

    // Fold carries back into the low 16 bits
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !(sum as u16)
}

/// Build a header-only ICMP Echo Request with its checksum filled in
pub fn build_echo_request(identifier: u16, sequence: u16) -> Vec<u8> {
    let mut packet = vec![0u8; ICMP_HEADER_SIZE];
    packet[0] = ICMP_ECHO_REQUEST;
    packet[1] = 0;
    packet[4..6].copy_from_slice(&identifier.to_be_bytes());
    packet[6..8].copy_from_slice(&sequence.to_be_bytes());

    let cksum = internet_checksum(&packet);
    packet[2..4].copy_from_slice(&cksum.to_be_bytes());
    packet
}

/// An ICMP message received on the raw socket, reduced to what correlation needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedReply {
    pub responder: Ipv4Addr,
    pub kind: ReplyKind,
    pub identifier: u16,
    pub sequence: u16,
    /// Destination the probe was sent to. For echo replies this is the
    /// responder; for errors it comes from the quoted datagram.
    pub original_dest: Ipv4Addr,
}

impl ParsedReply {
    /// True if this reply answers the given probe to `dest`
    pub fn matches(&self, identifier: u16, probe: ProbeId, dest: Ipv4Addr) -> bool {
        self.identifier == identifier && self.probe() == probe && self.original_dest == dest
    }

    /// TTL and probe index carried in the sequence field
    pub fn probe(&self) -> ProbeId {
        ProbeId::from_sequence(self.sequence)
    }
}

/// Parse a raw IPv4 datagram carrying ICMP, as delivered by a raw socket.
///
/// Returns None for anything other than Echo Reply, Time Exceeded or
/// Destination Unreachable, and for messages too short to correlate.
pub fn parse_reply(data: &[u8]) -> Option<ParsedReply> {
    let ip_packet = Ipv4Packet::new(data)?;
    if ip_packet.get_version() != 4 {
        return None;
    }
    let ip_header_len = (ip_packet.get_header_length() as usize) * 4;
    if ip_header_len < IPV4_MIN_HEADER_SIZE || data.len() < ip_header_len + ICMP_HEADER_SIZE {
        return None;
    }

    let responder = ip_packet.get_source();
    let icmp_data = &data[ip_header_len..];
    let icmp_packet = IcmpPacket::new(icmp_data)?;

    match icmp_packet.get_icmp_type() {
        IcmpTypes::EchoReply => Some(ParsedReply {
            responder,
            kind: ReplyKind::EchoReply,
            identifier: u16::from_be_bytes([icmp_data[4], icmp_data[5]]),
            sequence: u16::from_be_bytes([icmp_data[6], icmp_data[7]]),
            original_dest: responder,
        }),
        IcmpTypes::TimeExceeded => {
            parse_quoted_probe(&icmp_data[ICMP_HEADER_SIZE..], responder, ReplyKind::TimeExceeded)
        }
        IcmpTypes::DestinationUnreachable => {
            let code = icmp_packet.get_icmp_code().0;
            parse_quoted_probe(
                &icmp_data[ICMP_HEADER_SIZE..],
                responder,
                ReplyKind::DestUnreachable(code),
            )
        }
        _ => None,
    }
}

/// Extract identifier/sequence of our echo request from the original
/// datagram quoted in an ICMP error (its IP header plus 8 bytes).
fn parse_quoted_probe(quoted: &[u8], responder: Ipv4Addr, kind: ReplyKind) -> Option<ParsedReply> {
    if quoted.len() < IPV4_MIN_HEADER_SIZE {
        return None;
    }
    if quoted[0] >> 4 != 4 || quoted[9] != IPPROTO_ICMP {
        return None;
    }

    let inner_header_len = ((quoted[0] & 0x0F) as usize) * 4;
    if inner_header_len < IPV4_MIN_HEADER_SIZE || quoted.len() < inner_header_len + ICMP_HEADER_SIZE {
        return None;
    }

    let inner_icmp = &quoted[inner_header_len..inner_header_len + ICMP_HEADER_SIZE];
    if inner_icmp[0] != ICMP_ECHO_REQUEST {
        return None;
    }

    Some(ParsedReply {
        responder,
        kind,
        identifier: u16::from_be_bytes([inner_icmp[4], inner_icmp[5]]),
        sequence: u16::from_be_bytes([inner_icmp[6], inner_icmp[7]]),
        original_dest: Ipv4Addr::new(quoted[16], quoted[17], quoted[18], quoted[19]),
    })
}

/// Build a minimal IPv4 header (no options) for ICMP payloads.
/// Used to synthesize replies for engine tests.
#[cfg(test)]
pub(crate) fn ipv4_header(src: Ipv4Addr, dst: Ipv4Addr, payload_len: usize) -> Vec<u8> {
    let total = (IPV4_MIN_HEADER_SIZE + payload_len) as u16;
    let mut header = vec![0u8; IPV4_MIN_HEADER_SIZE];
    header[0] = 0x45;
    header[2..4].copy_from_slice(&total.to_be_bytes());
    header[8] = 64;
    header[9] = IPPROTO_ICMP;
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());
    let cksum = internet_checksum(&header);
    header[10..12].copy_from_slice(&cksum.to_be_bytes());
    header
}

#[cfg(test)]
pub(crate) fn time_exceeded_reply(router: Ipv4Addr, local: Ipv4Addr, dest: Ipv4Addr, probe: &[u8]) -> Vec<u8> {
    icmp_error_reply(11, 0, router, local, dest, probe)
}

#[cfg(test)]
pub(crate) fn dest_unreachable_reply(
    sender: Ipv4Addr,
    local: Ipv4Addr,
    dest: Ipv4Addr,
    probe: &[u8],
    code: u8,
) -> Vec<u8> {
    icmp_error_reply(3, code, sender, local, dest, probe)
}

/// ICMP error from `router` quoting our probe to `dest`
#[cfg(test)]
fn icmp_error_reply(
    icmp_type: u8,
    code: u8,
    router: Ipv4Addr,
    local: Ipv4Addr,
    dest: Ipv4Addr,
    probe: &[u8],
) -> Vec<u8> {
    let mut quoted = ipv4_header(local, dest, probe.len());
    quoted.extend_from_slice(probe);

    let mut icmp = vec![icmp_type, code, 0, 0, 0, 0, 0, 0];
    icmp.extend_from_slice(&quoted);
    let cksum = internet_checksum(&icmp);
    icmp[2..4].copy_from_slice(&cksum.to_be_bytes());

    let mut packet = ipv4_header(router, local, icmp.len());
    packet.extend_from_slice(&icmp);
    packet
}

#[cfg(test)]
pub(crate) fn echo_reply(dest: Ipv4Addr, local: Ipv4Addr, probe: &[u8]) -> Vec<u8> {
    let mut icmp = probe.to_vec();
    icmp[0] = 0;
    icmp[2] = 0;
    icmp[3] = 0;
    let cksum = internet_checksum(&icmp);
    icmp[2..4].copy_from_slice(&cksum.to_be_bytes());

    let mut packet = ipv4_header(dest, local, icmp.len());
    packet.extend_from_slice(&icmp);
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const ROUTER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
    const DEST: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

    #[test]
    fn test_build_echo_request() {
        let packet = build_echo_request(1234, 0x0102);
        assert_eq!(packet.len(), ICMP_HEADER_SIZE);
        assert_eq!(packet[0], 8); // Echo Request type
        assert_eq!(packet[1], 0); // Code
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 1234);
        assert_eq!(u16::from_be_bytes([packet[6], packet[7]]), 0x0102);
    }

    #[test]
    fn test_checksum_self_verifies() {
        for (id, seq) in [(0u16, 0u16), (1234, 0x0100), (0xFFFF, 0xFFFF), (0x8000, 0x1E02)] {
            let packet = build_echo_request(id, seq);
            assert_eq!(internet_checksum(&packet), 0, "id={id} seq={seq}");
        }
    }

    #[test]
    fn test_checksum_matches_pnet() {
        let packet = build_echo_request(4321, 0x0502);
        let icmp = IcmpPacket::new(&packet).unwrap();
        assert_eq!(
            pnet::packet::icmp::checksum(&icmp),
            u16::from_be_bytes([packet[2], packet[3]])
        );
    }

    #[test]
    fn test_checksum_odd_length() {
        // 0x0102 + 0x0300 = 0x0402 -> !0x0402
        assert_eq!(internet_checksum(&[0x01, 0x02, 0x03]), !0x0402);
    }

    #[test]
    fn test_checksum_end_around_carry() {
        // 0xFFFF + 0x0001 = 0x10000 -> folded to 0x0001
        assert_eq!(internet_checksum(&[0xFF, 0xFF, 0x00, 0x01]), !0x0001);
    }

    #[test]
    fn test_parse_time_exceeded() {
        let probe = build_echo_request(777, ProbeId::new(3, 1).to_sequence());
        let reply = time_exceeded_reply(ROUTER, LOCAL, DEST, &probe);

        let parsed = parse_reply(&reply).unwrap();
        assert_eq!(parsed.responder, ROUTER);
        assert_eq!(parsed.kind, ReplyKind::TimeExceeded);
        assert_eq!(parsed.original_dest, DEST);
        assert!(parsed.matches(777, ProbeId::new(3, 1), DEST));
        assert!(!parsed.matches(777, ProbeId::new(3, 2), DEST));
        assert!(!parsed.matches(778, ProbeId::new(3, 1), DEST));
        assert!(!parsed.matches(777, ProbeId::new(3, 1), Ipv4Addr::new(1, 1, 1, 1)));
    }

    #[test]
    fn test_parse_echo_reply() {
        let probe = build_echo_request(777, ProbeId::new(9, 0).to_sequence());
        let reply = echo_reply(DEST, LOCAL, &probe);

        let parsed = parse_reply(&reply).unwrap();
        assert_eq!(parsed.kind, ReplyKind::EchoReply);
        assert_eq!(parsed.responder, DEST);
        assert!(parsed.matches(777, ProbeId::new(9, 0), DEST));
    }

    #[test]
    fn test_parse_dest_unreachable_keeps_code() {
        let probe = build_echo_request(5, ProbeId::new(4, 0).to_sequence());
        let reply = dest_unreachable_reply(ROUTER, LOCAL, DEST, &probe, 1);

        let parsed = parse_reply(&reply).unwrap();
        assert_eq!(parsed.kind, ReplyKind::DestUnreachable(1));
        assert_eq!(parsed.responder, ROUTER);
        assert_eq!(parsed.probe(), ProbeId::new(4, 0));
        assert!(parsed.matches(5, ProbeId::new(4, 0), DEST));
        assert!(!parsed.matches(5, ProbeId::new(4, 1), DEST));
    }

    #[test]
    fn test_parse_rejects_other_types() {
        let probe = build_echo_request(5, 1);
        let mut reply = echo_reply(DEST, LOCAL, &probe);
        reply[20] = 8; // someone else's Echo Request
        assert!(parse_reply(&reply).is_none());
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let probe = build_echo_request(5, 1);
        let reply = time_exceeded_reply(ROUTER, LOCAL, DEST, &probe);
        assert!(parse_reply(&reply[..30]).is_none());
        assert!(parse_reply(&reply[..10]).is_none());
        assert!(parse_reply(&[]).is_none());
    }
}
