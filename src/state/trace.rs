use serde::{Serialize, Serializer};
use std::net::Ipv4Addr;

/// Responder key used for probes that got no (matching) reply
pub const TIMEOUT_KEY: &str = "*";

/// Identifies a specific probe for correlation
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct ProbeId {
    pub ttl: u8,
    pub seq: u8,
}

impl ProbeId {
    pub fn new(ttl: u8, seq: u8) -> Self {
        Self { ttl, seq }
    }

    /// Encode TTL and probe index into a 16-bit value for ICMP sequence field
    pub fn to_sequence(&self) -> u16 {
        ((self.ttl as u16) << 8) | (self.seq as u16)
    }

    /// Decode from a 16-bit ICMP sequence field
    pub fn from_sequence(seq: u16) -> Self {
        Self {
            ttl: (seq >> 8) as u8,
            seq: (seq & 0xFF) as u8,
        }
    }
}

/// ICMP reply kinds the engine accepts for a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyKind {
    EchoReply,
    TimeExceeded,
    DestUnreachable(u8),
}

/// Outcome of one probe at one TTL
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub success: bool,
    /// Round-trip time in milliseconds, `TIMEOUT_RTT` when nothing matched
    pub rtt_ms: f64,
    /// Replying address, empty when nothing matched
    pub responder: String,
    pub kind: Option<ReplyKind>,
}

impl ProbeResult {
    pub const TIMEOUT_RTT: f64 = -1.0;

    pub fn timeout() -> Self {
        Self {
            success: false,
            rtt_ms: Self::TIMEOUT_RTT,
            responder: String::new(),
            kind: None,
        }
    }

    pub fn reply(responder: Ipv4Addr, rtt_ms: f64, kind: ReplyKind) -> Self {
        Self {
            success: true,
            rtt_ms,
            responder: responder.to_string(),
            kind: Some(kind),
        }
    }

    /// Key this probe is grouped under when building a hop
    pub fn responder_key(&self) -> &str {
        if self.success {
            &self.responder
        } else {
            TIMEOUT_KEY
        }
    }
}

/// All RTTs recorded for one responder at one TTL
#[derive(Debug, Clone, PartialEq)]
pub struct HopResponse {
    pub ip: String,
    pub rtts: Vec<f64>,
}

impl HopResponse {
    pub fn is_timeout(&self) -> bool {
        self.ip == TIMEOUT_KEY
    }
}

/// One TTL level of a traceroute walk
#[derive(Debug, Clone, PartialEq)]
pub struct Hop {
    pub ttl: u8,
    pub responses: Vec<HopResponse>,
}

impl Hop {
    pub fn response(&self, ip: &str) -> Option<&HopResponse> {
        self.responses.iter().find(|r| r.ip == ip)
    }

    /// Number of probes folded into this hop
    pub fn probe_count(&self) -> usize {
        self.responses.iter().map(|r| r.rtts.len()).sum()
    }
}

/// Result of one complete traceroute run
#[derive(Debug, Clone, PartialEq)]
pub struct TraceOutcome {
    pub destination: Ipv4Addr,
    pub hops: Vec<Hop>,
    /// Destination itself answered a probe
    pub reached: bool,
}

/// A single RTT as emitted: milliseconds, or `"*"` for a timed-out probe
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RttEntry {
    Millis(f64),
    Timeout,
}

impl RttEntry {
    fn from_ms(rtt_ms: f64) -> Self {
        if rtt_ms < 0.0 {
            RttEntry::Timeout
        } else {
            RttEntry::Millis(rtt_ms)
        }
    }
}

impl Serialize for RttEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RttEntry::Millis(ms) => serializer.serialize_f64(*ms),
            RttEntry::Timeout => serializer.serialize_str(TIMEOUT_KEY),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportResponse {
    pub ip: String,
    pub rtts: Vec<RttEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportHop {
    pub ttl: u8,
    pub responses: Vec<ReportResponse>,
}

/// Traceroute record written to the record stream
#[derive(Debug, Clone, Serialize)]
pub struct TraceReport {
    pub dst_ip: Ipv4Addr,
    pub protocol: &'static str,
    /// Completion time in Unix seconds
    pub timestamp: i64,
    pub reached: bool,
    pub hops: Vec<ReportHop>,
}

impl TraceReport {
    pub const PROTOCOL: &'static str = "TRACEROUTE";

    pub fn new(outcome: &TraceOutcome, timestamp: i64) -> Self {
        let hops = outcome
            .hops
            .iter()
            .map(|hop| ReportHop {
                ttl: hop.ttl,
                responses: hop
                    .responses
                    .iter()
                    .map(|r| ReportResponse {
                        ip: r.ip.clone(),
                        rtts: r.rtts.iter().copied().map(RttEntry::from_ms).collect(),
                    })
                    .collect(),
            })
            .collect();

        Self {
            dst_ip: outcome.destination,
            protocol: Self::PROTOCOL,
            timestamp,
            reached: outcome.reached,
            hops,
        }
    }
}
