//! Capture loop: reads frames off the interface, streams decoded records,
//! batches them into chunk files and feeds new destinations to the
//! traceroute pool.

use chrono::Utc;
use pnet::datalink::{self, Channel, DataLinkReceiver};
use std::io::ErrorKind;
use std::net::Ipv4Addr;
use std::panic::AssertUnwindSafe;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::decode::decode_frame;
use crate::capture::interface::find_interface;
use crate::config::Config;
use crate::error::{CaptureError, panic_message};
use crate::export::{ChunkWriter, RecordSink};
use crate::state::PacketRecord;
use crate::trace::{IcmpTraceRunner, TracePool};

/// Maximum consecutive read errors before the capture gives up
const MAX_CONSECUTIVE_ERRORS: u32 = 50;

/// Counters reported when a session ends
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureStats {
    /// Frames handed to the decoder
    pub frames: u64,
    /// Frames that produced a record
    pub records: u64,
    /// Non-IPv4 or truncated frames
    pub discarded: u64,
    /// Destinations queued for traceroute
    pub traces_queued: u64,
    pub chunks_written: u32,
}

/// Per-session processing state, owned by the capture thread.
pub struct CaptureSession {
    chunks: ChunkWriter,
    sink: RecordSink,
    pool: Option<TracePool>,
    stats: CaptureStats,
}

impl CaptureSession {
    pub fn new(chunks: ChunkWriter, sink: RecordSink, pool: Option<TracePool>) -> Self {
        Self {
            chunks,
            sink,
            pool,
            stats: CaptureStats::default(),
        }
    }

    /// Prepare the chunk directory and, if enabled, the traceroute workers.
    ///
    /// The pool is cancelled together with `cancel`.
    pub fn start(config: &Config, sink: RecordSink, cancel: &CancellationToken) -> Result<Self, CaptureError> {
        let session_id = ChunkWriter::session_id_for(Utc::now());
        let chunks = ChunkWriter::new(&config.output_dir, session_id, config.chunk_size)
            .map_err(CaptureError::Storage)?;

        let pool = if config.trace_enabled {
            let runner = IcmpTraceRunner::new(config.trace.clone());
            let pool = TracePool::start(config.workers, runner, sink.clone(), cancel.child_token())
                .map_err(CaptureError::WorkerSpawn)?;
            Some(pool)
        } else {
            None
        };

        info!(
            session = chunks.session_id(),
            dir = %config.output_dir.display(),
            workers = pool.as_ref().map_or(0, TracePool::worker_count),
            "capture session started"
        );
        Ok(Self::new(chunks, sink, pool))
    }

    pub fn session_id(&self) -> &str {
        self.chunks.session_id()
    }

    pub fn stats(&self) -> &CaptureStats {
        &self.stats
    }

    /// Decode one frame and route the record to every consumer.
    ///
    /// Output failures are logged and never stop the capture.
    pub fn process_frame(&mut self, frame: &[u8], timestamp: f64) -> Option<PacketRecord> {
        self.stats.frames += 1;

        let Some(record) = decode_frame(frame, frame.len() as u32, timestamp) else {
            self.stats.discarded += 1;
            return None;
        };
        self.stats.records += 1;

        if let Err(e) = self.sink.emit(&record) {
            warn!("failed to emit packet record: {:#}", e);
        }

        match self.chunks.push(record.clone()) {
            Ok(Some(path)) => debug!(path = %path.display(), "chunk written"),
            Ok(None) => {}
            Err(e) => warn!("{:#}", e),
        }

        self.queue_trace(record.dst_ip);
        Some(record)
    }

    fn queue_trace(&mut self, dest: Ipv4Addr) {
        if let Some(pool) = self.pool.as_mut()
            && pool.submit(dest)
        {
            self.stats.traces_queued += 1;
        }
    }

    /// Write the final partial chunk and wait for the traceroute workers.
    pub fn finish(mut self) -> CaptureStats {
        if let Err(e) = self.chunks.flush() {
            warn!("{:#}", e);
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        self.stats.chunks_written = self.chunks.chunks_written();

        info!(
            session = self.chunks.session_id(),
            frames = self.stats.frames,
            records = self.stats.records,
            discarded = self.stats.discarded,
            traces = self.stats.traces_queued,
            chunks = self.stats.chunks_written,
            "capture session finished"
        );
        self.stats
    }
}

/// Stops a running capture from another thread or task
#[derive(Debug, Clone)]
pub struct CaptureHandle {
    cancel: CancellationToken,
}

impl CaptureHandle {
    /// Request a stop. Safe to call more than once.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token the rest of the session should be cancelled with
    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }
}

/// An open link-layer capture on one interface
pub struct Sniffer {
    interface: String,
    rx: Box<dyn DataLinkReceiver>,
    cancel: CancellationToken,
}

impl Sniffer {
    /// Open a promiscuous Ethernet channel on `interface`.
    ///
    /// `read_timeout` bounds how long a stop request can go unnoticed.
    pub fn open(interface: &str, read_timeout: Duration) -> Result<Self, CaptureError> {
        let iface = find_interface(interface)?;
        let config = datalink::Config {
            read_timeout: Some(read_timeout),
            promiscuous: true,
            ..Default::default()
        };

        let rx = match datalink::channel(&iface, config) {
            Ok(Channel::Ethernet(_tx, rx)) => rx,
            Ok(_) => return Err(CaptureError::UnsupportedChannel(interface.to_string())),
            Err(source) => {
                return Err(CaptureError::Open {
                    interface: interface.to_string(),
                    source,
                });
            }
        };

        info!(interface, "capture opened");
        Ok(Self {
            interface: interface.to_string(),
            rx,
            cancel: CancellationToken::new(),
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn handle(&self) -> CaptureHandle {
        CaptureHandle {
            cancel: self.cancel.clone(),
        }
    }

    /// Capture until stopped, then finish the session.
    ///
    /// The session is finished (final chunk flushed, workers joined) even
    /// when the capture ends on read errors.
    pub fn run(mut self, mut session: CaptureSession) -> Result<CaptureStats, CaptureError> {
        let mut consecutive_errors: u32 = 0;
        let mut failure = None;

        while !self.cancel.is_cancelled() {
            match self.rx.next() {
                Ok(frame) => {
                    consecutive_errors = 0;
                    session.process_frame(frame, capture_timestamp());
                }
                Err(e) if is_transient(e.kind()) => {
                    consecutive_errors = 0;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    warn!(
                        "capture read error ({}/{}): {}",
                        consecutive_errors, MAX_CONSECUTIVE_ERRORS, e
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        error!(interface = %self.interface, "capture stopped after repeated read errors");
                        failure = Some(e);
                        break;
                    }
                }
            }
        }

        // Workers watch a child of this token
        self.cancel.cancel();
        let stats = session.finish();

        match failure {
            Some(source) => Err(CaptureError::Read {
                interface: self.interface,
                source,
            }),
            None => Ok(stats),
        }
    }
}

/// Run the capture on its own thread.
///
/// A panic in the capture loop is reported as an error instead of tearing
/// down the process.
pub fn spawn_capture(
    sniffer: Sniffer,
    session: CaptureSession,
) -> std::io::Result<JoinHandle<anyhow::Result<CaptureStats>>> {
    std::thread::Builder::new()
        .name("capture".to_string())
        .spawn(move || {
            match std::panic::catch_unwind(AssertUnwindSafe(|| sniffer.run(session))) {
                Ok(result) => result.map_err(anyhow::Error::from),
                Err(panic_payload) => Err(anyhow::anyhow!(
                    "Capture panicked: {}",
                    panic_message(&*panic_payload)
                )),
            }
        })
}

fn is_transient(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

/// Receipt time as fractional Unix seconds, microsecond resolution
pub fn capture_timestamp() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::decode::{build_frame, tcp_segment};
    use crate::state::Transport;

    const SRC: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
    const DST: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 20);

    fn session(dir: &std::path::Path, chunk_size: usize) -> (CaptureSession, crate::export::MemoryBuffer) {
        let (sink, buffer) = RecordSink::memory();
        let chunks = ChunkWriter::new(dir, "session_test", chunk_size).unwrap();
        (CaptureSession::new(chunks, sink, None), buffer)
    }

    #[test]
    fn test_frame_streamed_and_buffered() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, buffer) = session(dir.path(), 40);

        let frame = build_frame(6, SRC, DST, &tcp_segment(5000, 80, 0x02));
        let record = session.process_frame(&frame, 1700000000.5).unwrap();
        assert_eq!(record.length, 54);
        assert!(matches!(record.transport, Transport::Tcp { .. }));

        let values = buffer.values();
        assert_eq!(values.len(), 1);
        assert_eq!(values[0]["protocol"], "TCP");
        assert_eq!(values[0]["dst_ip"], "192.168.1.20");
        assert_eq!(values[0]["timestamp"], 1700000000.5);

        let stats = session.finish();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.chunks_written, 1);
        assert!(dir.path().join("session_test_chunk_1.json").exists());
    }

    #[test]
    fn test_undecodable_frames_counted_not_emitted() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, buffer) = session(dir.path(), 40);

        // ARP ethertype
        let mut frame = build_frame(6, SRC, DST, &tcp_segment(1, 2, 0));
        frame[12] = 0x08;
        frame[13] = 0x06;
        assert!(session.process_frame(&frame, 0.0).is_none());
        assert!(session.process_frame(&[0u8; 10], 0.0).is_none());

        assert_eq!(session.stats().frames, 2);
        assert_eq!(session.stats().discarded, 2);
        assert!(buffer.lines().is_empty());

        let stats = session.finish();
        assert_eq!(stats.chunks_written, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_chunk_threshold_during_capture() {
        let dir = tempfile::tempdir().unwrap();
        let (mut session, _buffer) = session(dir.path(), 3);

        let frame = build_frame(6, SRC, DST, &tcp_segment(5000, 80, 0x10));
        for _ in 0..7 {
            session.process_frame(&frame, 0.0);
        }
        assert!(dir.path().join("session_test_chunk_2.json").exists());
        assert!(!dir.path().join("session_test_chunk_3.json").exists());

        let stats = session.finish();
        assert_eq!(stats.chunks_written, 3);
    }

    #[test]
    fn test_handle_stop_is_idempotent() {
        let handle = CaptureHandle {
            cancel: CancellationToken::new(),
        };
        assert!(!handle.is_stopped());
        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(ErrorKind::TimedOut));
        assert!(is_transient(ErrorKind::WouldBlock));
        assert!(!is_transient(ErrorKind::PermissionDenied));
    }

    #[test]
    fn test_open_unknown_interface() {
        let err = Sniffer::open("nonexistent_interface_12345", Duration::from_millis(10))
            .err()
            .unwrap();
        assert!(matches!(err, CaptureError::InterfaceNotFound(_)));
    }

    #[test]
    fn test_capture_timestamp_is_current() {
        let now = Utc::now().timestamp() as f64;
        let ts = capture_timestamp();
        assert!((ts - now).abs() < 5.0);
    }
}
