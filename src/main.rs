use anyhow::{Context, Result, anyhow};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use netwatch::capture::{CaptureSession, Sniffer, list_interfaces, spawn_capture};
use netwatch::cli::Args;
use netwatch::config::Config;
use netwatch::export::RecordSink;
use netwatch::probe::check_permissions;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Validate arguments
    if let Err(e) = args.validate() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }

    init_logging(args.verbose);

    if args.list_interfaces {
        for iface in list_interfaces() {
            println!("{}", iface);
        }
        return Ok(());
    }

    // Traceroute needs raw sockets; fail before capturing anything
    if !args.no_trace
        && let Err(e) = check_permissions()
    {
        eprintln!("{}", e);
        std::process::exit(1);
    }

    let config = Config::from(&args);

    let sniffer = match Sniffer::open(&config.interface, config.read_timeout) {
        Ok(sniffer) => sniffer,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };
    let handle = sniffer.handle();

    let session = CaptureSession::start(&config, RecordSink::stdout(), handle.token())?;
    info!(session = session.session_id(), interface = %config.interface, "capturing");

    let capture = spawn_capture(sniffer, session).context("Failed to start capture thread")?;

    // Setup Ctrl+C / SIGTERM handler
    let stop_handle = handle.clone();
    tokio::spawn(async move {
        wait_for_shutdown().await;
        info!("stop requested, finishing session");
        stop_handle.stop();
    });

    let stats = tokio::task::spawn_blocking(move || capture.join())
        .await?
        .map_err(|_| anyhow!("Capture thread failed"))??;

    eprintln!(
        "Captured {} packets ({} discarded), {} chunk files, {} traceroutes",
        stats.records, stats.discarded, stats.chunks_written, stats.traces_queued
    );
    Ok(())
}

/// Log to stderr so stdout stays newline-delimited JSON.
/// `RUST_LOG` overrides the level chosen by `--verbose`.
fn init_logging(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("netwatch={}", level)));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(_) => {
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}
