//! Error types for capture sessions and traceroute runs.

use std::any::Any;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Failures of the capture facility. All of these end the session.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Interface '{0}' not found (use --list-interfaces to see available interfaces)")]
    InterfaceNotFound(String),

    #[error("Failed to open capture on '{interface}': {source}")]
    Open {
        interface: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Interface '{0}' does not provide an Ethernet capture channel")]
    UnsupportedChannel(String),

    #[error("Failed to prepare chunk directory: {0}")]
    Storage(#[source] std::io::Error),

    #[error("Failed to start traceroute workers: {0}")]
    WorkerSpawn(#[source] std::io::Error),

    #[error("Capture on '{interface}' stopped after repeated read errors: {source}")]
    Read {
        interface: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures that abort a single traceroute run.
///
/// Per-probe problems (timeouts, send errors, unrelated replies) never
/// surface here; they are recorded as timeouts in the hop list.
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Invalid destination address: {0}")]
    InvalidDestination(String),

    #[error("Failed to create raw ICMP socket (root or CAP_NET_RAW required): {0}")]
    SocketCreation(#[source] std::io::Error),

    #[error("Traceroute to {dest} panicked: {message}")]
    Panicked { dest: Ipv4Addr, message: String },
}

/// Text of a caught panic payload (`panic!` with a literal or a formatted message)
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message_literal_and_formatted() {
        let literal = std::panic::catch_unwind(|| panic!("socket gone")).unwrap_err();
        assert_eq!(panic_message(&*literal), "socket gone");

        let ttl = 7;
        let formatted = std::panic::catch_unwind(|| panic!("bad ttl {}", ttl)).unwrap_err();
        assert_eq!(panic_message(&*formatted), "bad ttl 7");

        let other = std::panic::catch_unwind(|| std::panic::panic_any(42u8)).unwrap_err();
        assert_eq!(panic_message(&*other), "unknown panic");
    }
}
