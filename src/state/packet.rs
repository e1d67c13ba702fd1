use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// One decoded frame as emitted on the record stream and in chunk files
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketRecord {
    /// Capture time in fractional Unix seconds
    pub timestamp: f64,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    /// Captured frame length in bytes
    pub length: u32,
    #[serde(flatten)]
    pub transport: Transport,
}

impl PacketRecord {
    /// Protocol tag as written in the `protocol` field
    pub fn protocol(&self) -> &'static str {
        self.transport.tag()
    }
}

/// Transport-specific fields. Exactly one variant applies to a record, and
/// serialization only writes that variant's fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "protocol")]
pub enum Transport {
    #[serde(rename = "TCP")]
    Tcp {
        src_port: u16,
        dst_port: u16,
        tcp_flags: TcpFlags,
    },
    #[serde(rename = "UDP")]
    Udp { src_port: u16, dst_port: u16 },
    #[serde(rename = "ICMP")]
    Icmp {
        #[serde(rename = "type")]
        icmp_type: u8,
        code: u8,
    },
    Other { protocol_number: u8 },
}

impl Transport {
    pub fn tag(&self) -> &'static str {
        match self {
            Transport::Tcp { .. } => "TCP",
            Transport::Udp { .. } => "UDP",
            Transport::Icmp { .. } => "ICMP",
            Transport::Other { .. } => "Other",
        }
    }
}

/// The six classic TCP control bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    /// Decode from the low byte of the TCP flags field (byte 13 of the header)
    pub fn from_bits(bits: u8) -> Self {
        Self {
            fin: bits & 0x01 != 0,
            syn: bits & 0x02 != 0,
            rst: bits & 0x04 != 0,
            psh: bits & 0x08 != 0,
            ack: bits & 0x10 != 0,
            urg: bits & 0x20 != 0,
        }
    }
}
