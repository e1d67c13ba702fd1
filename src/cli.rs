use clap::Parser;
use std::path::PathBuf;

/// Live packet capture with automatic ICMP traceroute of every new destination
#[derive(Parser, Debug, Clone)]
#[command(name = "netwatch")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Network interface to capture on (e.g., eth0, en0)
    #[arg(required_unless_present = "list_interfaces")]
    pub interface: Option<String>,

    /// List capture-capable interfaces and exit
    #[arg(long = "list-interfaces")]
    pub list_interfaces: bool,

    /// Directory for packet chunk files
    #[arg(short = 'o', long = "output-dir", default_value = "packets")]
    pub output_dir: PathBuf,

    /// Packet records per chunk file
    #[arg(long = "chunk-size", default_value = "40")]
    pub chunk_size: usize,

    /// Concurrent traceroute workers
    #[arg(short = 'w', long = "workers", default_value = "4")]
    pub workers: usize,

    /// Maximum TTL probed per traceroute
    #[arg(short = 'm', long = "max-hops", default_value = "30")]
    pub max_hops: u8,

    /// Per-probe reply timeout in milliseconds
    #[arg(long = "timeout-ms", default_value = "1000")]
    pub timeout_ms: u64,

    /// Pause between probes in milliseconds
    #[arg(long = "probe-gap-ms", default_value = "50")]
    pub probe_gap_ms: u64,

    /// Capture only; never send traceroute probes
    #[arg(long = "no-trace")]
    pub no_trace: bool,

    /// Verbose logging (debug level) on stderr
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Args {
    /// Validate arguments
    pub fn validate(&self) -> Result<(), String> {
        if let Some(ref iface) = self.interface {
            if iface.is_empty() {
                return Err("Interface name cannot be empty".into());
            }
            // IFNAMSIZ on Linux is 16 including null terminator
            if iface.len() > 15 {
                return Err(format!("Interface name too long: {} (max 15 chars)", iface));
            }
        }

        if self.chunk_size == 0 {
            return Err("Chunk size must be at least 1".into());
        }

        if self.workers == 0 {
            return Err("Workers must be at least 1".into());
        }
        const MAX_WORKERS: usize = 64;
        if self.workers > MAX_WORKERS {
            return Err(format!("Workers cannot exceed {}", MAX_WORKERS));
        }

        if self.max_hops == 0 {
            return Err("Max hops must be at least 1".into());
        }
        // Sequence numbers carry the TTL in 8 bits; keep well below that
        const MAX_SAFE_HOPS: u8 = 64;
        if self.max_hops > MAX_SAFE_HOPS {
            return Err(format!("Max hops cannot exceed {}", MAX_SAFE_HOPS));
        }

        if self.timeout_ms == 0 {
            return Err("Timeout must be positive".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let args = Args::parse_from(["netwatch", "eth0"]);
        assert_eq!(args.interface.as_deref(), Some("eth0"));
        assert_eq!(args.chunk_size, 40);
        assert_eq!(args.workers, 4);
        assert_eq!(args.max_hops, 30);
        assert!(args.validate().is_ok());
    }

    #[test]
    fn test_interface_required() {
        assert!(Args::try_parse_from(["netwatch"]).is_err());
        let args = Args::parse_from(["netwatch", "--list-interfaces"]);
        assert!(args.interface.is_none());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let args = Args::parse_from(["netwatch", "eth0", "--workers", "0"]);
        assert!(args.validate().is_err());

        let args = Args::parse_from(["netwatch", "eth0", "--max-hops", "65"]);
        assert!(args.validate().is_err());

        let args = Args::parse_from(["netwatch", "a-very-long-interface-name"]);
        assert!(args.validate().is_err());

        let args = Args::parse_from(["netwatch", "eth0", "--chunk-size", "0"]);
        assert!(args.validate().is_err());
    }
}
