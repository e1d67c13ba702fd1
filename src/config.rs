use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Args;
use crate::export::DEFAULT_CHUNK_SIZE;
use crate::trace::DEFAULT_WORKERS;

/// Settings for a single traceroute run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Highest TTL probed
    pub max_hops: u8,
    /// Probes sent at each TTL
    pub probes_per_hop: u8,
    /// How long to wait for each probe's reply
    #[serde(with = "duration_serde")]
    pub timeout: Duration,
    /// Pause after each probe so routers are not flooded
    #[serde(with = "duration_serde")]
    pub probe_gap: Duration,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            max_hops: 30,
            probes_per_hop: 3,
            timeout: Duration::from_millis(1000),
            probe_gap: Duration::from_millis(50),
        }
    }
}

/// Runtime configuration derived from CLI args
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Interface to capture on
    pub interface: String,
    /// Directory chunk files are written to
    pub output_dir: PathBuf,
    /// Records per chunk file
    pub chunk_size: usize,
    /// Traceroute worker threads
    pub workers: usize,
    /// Run traceroutes for newly seen destinations
    pub trace_enabled: bool,
    /// Capture read timeout; bounds how long a stop request can go unnoticed
    #[serde(with = "duration_serde")]
    pub read_timeout: Duration,
    pub trace: TraceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: String::new(),
            output_dir: PathBuf::from("packets"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            workers: DEFAULT_WORKERS,
            trace_enabled: true,
            read_timeout: Duration::from_millis(1000),
            trace: TraceConfig::default(),
        }
    }
}

impl From<&Args> for Config {
    fn from(args: &Args) -> Self {
        Self {
            interface: args.interface.clone().unwrap_or_default(),
            output_dir: args.output_dir.clone(),
            chunk_size: args.chunk_size,
            workers: args.workers,
            trace_enabled: !args.no_trace,
            read_timeout: Duration::from_millis(1000),
            trace: TraceConfig {
                max_hops: args.max_hops,
                probes_per_hop: 3,
                timeout: Duration::from_millis(args.timeout_ms),
                probe_gap: Duration::from_millis(args.probe_gap_ms),
            },
        }
    }
}

/// Serde helper for Duration
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.chunk_size, 40);
        assert_eq!(config.workers, 4);
        assert_eq!(config.output_dir, PathBuf::from("packets"));
        assert_eq!(config.trace.max_hops, 30);
        assert_eq!(config.trace.probes_per_hop, 3);
        assert_eq!(config.trace.timeout, Duration::from_millis(1000));
        assert_eq!(config.trace.probe_gap, Duration::from_millis(50));
    }

    #[test]
    fn test_from_args() {
        let args = Args::parse_from([
            "netwatch",
            "eth0",
            "--max-hops",
            "20",
            "--timeout-ms",
            "500",
            "--workers",
            "2",
            "--no-trace",
        ]);
        let config = Config::from(&args);
        assert_eq!(config.interface, "eth0");
        assert_eq!(config.trace.max_hops, 20);
        assert_eq!(config.trace.timeout, Duration::from_millis(500));
        assert_eq!(config.workers, 2);
        assert!(!config.trace_enabled);
    }

    #[test]
    fn test_duration_serialization() {
        let json = serde_json::to_value(TraceConfig::default()).unwrap();
        assert_eq!(json["timeout"], 1.0);
        assert_eq!(json["probe_gap"], 0.05);
    }
}
