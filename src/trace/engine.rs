use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::TraceConfig;
use crate::error::TraceError;
use crate::probe::{IcmpSocket, ProbeTransport, build_echo_request, get_identifier, parse_reply};
use crate::state::{Hop, HopResponse, ProbeId, ProbeResult, ReplyKind, TraceOutcome};

/// Large enough for any ICMP error quoting our header-only probe
const RECV_BUFFER_SIZE: usize = 1500;

/// Classic incrementing-TTL ICMP traceroute over a `ProbeTransport`.
///
/// Probes are sent strictly one at a time: each waits for its own reply (or
/// the timeout) before the next is sent.
pub struct Tracer<T: ProbeTransport> {
    transport: T,
    config: TraceConfig,
    identifier: u16,
}

impl Tracer<IcmpSocket> {
    /// Tracer over a fresh raw ICMP socket
    pub fn open(config: TraceConfig) -> Result<Self, TraceError> {
        let socket = IcmpSocket::open().map_err(TraceError::SocketCreation)?;
        Ok(Self::new(socket, config))
    }
}

impl<T: ProbeTransport> Tracer<T> {
    pub fn new(transport: T, config: TraceConfig) -> Self {
        Self {
            transport,
            config,
            identifier: get_identifier(),
        }
    }

    pub fn with_identifier(mut self, identifier: u16) -> Self {
        self.identifier = identifier;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Walk TTL 1..=max_hops towards `dest`.
    ///
    /// Stops early once the destination answers, once a Destination
    /// Unreachable for our probe arrives, or when `cancel` fires (checked
    /// between TTLs; the current TTL's probes always complete).
    pub fn run(&mut self, dest: Ipv4Addr, cancel: &CancellationToken) -> Result<TraceOutcome, TraceError> {
        if dest.is_unspecified() || dest.is_broadcast() || dest.is_multicast() {
            return Err(TraceError::InvalidDestination(dest.to_string()));
        }

        let dest_str = dest.to_string();
        let mut hops = Vec::new();
        let mut reached = false;

        for ttl in 1..=self.config.max_hops {
            if cancel.is_cancelled() {
                debug!(%dest, ttl, "traceroute cancelled");
                break;
            }

            let mut probes = Vec::with_capacity(self.config.probes_per_hop as usize);
            let mut unreachable = false;

            for index in 0..self.config.probes_per_hop {
                let result = self.send_probe(dest, ProbeId::new(ttl, index));

                if result.success && result.responder == dest_str {
                    reached = true;
                }
                if matches!(result.kind, Some(ReplyKind::DestUnreachable(_))) {
                    unreachable = true;
                }
                probes.push(result);

                if !self.config.probe_gap.is_zero() {
                    std::thread::sleep(self.config.probe_gap);
                }
            }

            if let Some(hop) = aggregate_hop(ttl, &probes) {
                hops.push(hop);
            }

            if reached || unreachable {
                debug!(%dest, ttl, reached, unreachable, "traceroute finished early");
                break;
            }
        }

        Ok(TraceOutcome {
            destination: dest,
            hops,
            reached,
        })
    }

    /// Send one probe and wait for its reply.
    ///
    /// Every failure here (TTL option, send, receive, nothing matching before
    /// the deadline) is a timeout for this probe, never an error for the run.
    fn send_probe(&mut self, dest: Ipv4Addr, probe: ProbeId) -> ProbeResult {
        if let Err(e) = self.transport.set_ttl(probe.ttl) {
            debug!(%dest, ttl = probe.ttl, error = %e, "failed to set TTL");
            return ProbeResult::timeout();
        }

        let packet = build_echo_request(self.identifier, probe.to_sequence());
        let sent_at = Instant::now();
        if let Err(e) = self.transport.send(&packet, dest) {
            debug!(%dest, ttl = probe.ttl, error = %e, "failed to send probe");
            return ProbeResult::timeout();
        }

        let deadline = sent_at + self.config.timeout;
        let mut buffer = [0u8; RECV_BUFFER_SIZE];

        loop {
            let now = Instant::now();
            if now >= deadline {
                return ProbeResult::timeout();
            }

            match self.transport.recv(&mut buffer, deadline - now) {
                Ok(Some(len)) => {
                    let Some(reply) = parse_reply(&buffer[..len]) else {
                        continue;
                    };
                    if !reply.matches(self.identifier, probe, dest) {
                        // Another worker's probe or a late reply; keep waiting
                        let other = reply.probe();
                        trace!(
                            responder = %reply.responder,
                            id = reply.identifier,
                            ttl = other.ttl,
                            seq = other.seq,
                            "unmatched ICMP reply"
                        );
                        continue;
                    }
                    let rtt_ms = sent_at.elapsed().as_secs_f64() * 1000.0;
                    return ProbeResult::reply(reply.responder, rtt_ms, reply.kind);
                }
                Ok(None) => return ProbeResult::timeout(),
                Err(e) => {
                    debug!(%dest, ttl = probe.ttl, error = %e, "receive failed");
                    return ProbeResult::timeout();
                }
            }
        }
    }
}

/// Fold one TTL's probe outcomes into a hop: one response per distinct
/// responder, timeouts grouped under `"*"`, ordered by responder key.
/// Returns None when there is nothing to report.
pub fn aggregate_hop(ttl: u8, probes: &[ProbeResult]) -> Option<Hop> {
    let mut by_responder: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for probe in probes {
        by_responder
            .entry(probe.responder_key())
            .or_default()
            .push(probe.rtt_ms);
    }

    if by_responder.is_empty() {
        return None;
    }

    Some(Hop {
        ttl,
        responses: by_responder
            .into_iter()
            .map(|(ip, rtts)| HopResponse {
                ip: ip.to_string(),
                rtts,
            })
            .collect(),
    })
}
