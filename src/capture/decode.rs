//! Ethernet/IPv4 frame decoding.
//!
//! Every field is read with an explicit bounds check at a validated offset;
//! a frame that is too short for the headers it declares yields no record.

use std::net::Ipv4Addr;

use crate::state::{PacketRecord, TcpFlags, Transport};

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_MIN_HEADER_LEN: usize = 20;
/// Ethernet header plus an option-less IPv4 header
pub const MIN_FRAME_LEN: usize = ETHERNET_HEADER_LEN + IPV4_MIN_HEADER_LEN;

pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const ICMP_HEADER_LEN: usize = 8;

const ETHERTYPE_IPV4: u16 = 0x0800;

// IP protocol numbers
const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

fn be_u16(buf: &[u8], offset: usize) -> Option<u16> {
    let bytes = buf.get(offset..offset + 2)?;
    Some(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn ipv4_at(buf: &[u8], offset: usize) -> Option<Ipv4Addr> {
    let bytes = buf.get(offset..offset + 4)?;
    Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))
}

/// Decode one captured link-layer frame.
///
/// `length` is the frame length reported by the capture facility and is
/// copied into the record; bounds checks use the bytes actually present.
/// Returns None for non-IPv4 frames and frames truncated before the end of
/// their transport header.
pub fn decode_frame(frame: &[u8], length: u32, timestamp: f64) -> Option<PacketRecord> {
    if frame.len() < MIN_FRAME_LEN {
        return None;
    }
    if be_u16(frame, 12)? != ETHERTYPE_IPV4 {
        return None;
    }

    let ip = &frame[ETHERNET_HEADER_LEN..];
    let version = ip[0] >> 4;
    let ip_header_len = ((ip[0] & 0x0F) as usize) * 4;
    if version != 4 || ip_header_len < IPV4_MIN_HEADER_LEN || ip.len() < ip_header_len {
        return None;
    }

    let protocol = ip[9];
    let src_ip = ipv4_at(ip, 12)?;
    let dst_ip = ipv4_at(ip, 16)?;
    let transport = decode_transport(protocol, &ip[ip_header_len..])?;

    Some(PacketRecord {
        timestamp,
        src_ip,
        dst_ip,
        length,
        transport,
    })
}

fn decode_transport(protocol: u8, segment: &[u8]) -> Option<Transport> {
    match protocol {
        IPPROTO_TCP => {
            if segment.len() < TCP_HEADER_LEN {
                return None;
            }
            Some(Transport::Tcp {
                src_port: be_u16(segment, 0)?,
                dst_port: be_u16(segment, 2)?,
                tcp_flags: TcpFlags::from_bits(segment[13]),
            })
        }
        IPPROTO_UDP => {
            if segment.len() < UDP_HEADER_LEN {
                return None;
            }
            Some(Transport::Udp {
                src_port: be_u16(segment, 0)?,
                dst_port: be_u16(segment, 2)?,
            })
        }
        IPPROTO_ICMP => {
            if segment.len() < ICMP_HEADER_LEN {
                return None;
            }
            Some(Transport::Icmp {
                icmp_type: segment[0],
                code: segment[1],
            })
        }
        other => Some(Transport::Other {
            protocol_number: other,
        }),
    }
}

/// Build an Ethernet + IPv4 frame around a transport segment.
#[cfg(test)]
pub(crate) fn build_frame(protocol: u8, src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HEADER_LEN];
    frame[12..14].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());

    let mut ip = vec![0u8; IPV4_MIN_HEADER_LEN];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&((IPV4_MIN_HEADER_LEN + segment.len()) as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = protocol;
    ip[12..16].copy_from_slice(&src.octets());
    ip[16..20].copy_from_slice(&dst.octets());

    frame.extend_from_slice(&ip);
    frame.extend_from_slice(segment);
    frame
}

#[cfg(test)]
pub(crate) fn tcp_segment(src_port: u16, dst_port: u16, flags: u8) -> Vec<u8> {
    let mut tcp = vec![0u8; TCP_HEADER_LEN];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[12] = 0x50; // data offset 5 words
    tcp[13] = flags;
    tcp
}
