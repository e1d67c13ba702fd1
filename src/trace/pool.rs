//! Traceroute worker pool.
//!
//! The capture thread owns the pool and submits destinations; a fixed set of
//! worker threads share one FIFO channel and run one traceroute at a time
//! each. Every destination is traced at most once per pool lifetime.

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::TraceConfig;
use crate::error::{TraceError, panic_message};
use crate::export::RecordSink;
use crate::state::{TraceOutcome, TraceReport};
use crate::trace::engine::Tracer;

/// Default number of worker threads
pub const DEFAULT_WORKERS: usize = 4;

/// Runs one complete traceroute. Shared by all workers.
pub trait TraceRunner: Send + Sync + 'static {
    fn trace(&self, dest: Ipv4Addr, cancel: &CancellationToken) -> Result<TraceOutcome, TraceError>;
}

/// Real ICMP traceroute; each run opens and owns its own raw socket
#[derive(Debug, Clone)]
pub struct IcmpTraceRunner {
    config: TraceConfig,
}

impl IcmpTraceRunner {
    pub fn new(config: TraceConfig) -> Self {
        Self { config }
    }
}

impl TraceRunner for IcmpTraceRunner {
    fn trace(&self, dest: Ipv4Addr, cancel: &CancellationToken) -> Result<TraceOutcome, TraceError> {
        Tracer::open(self.config.clone())?.run(dest, cancel)
    }
}

/// True for addresses a traceroute is never started for
pub fn is_untraceable(dest: Ipv4Addr) -> bool {
    dest.is_loopback() || dest.is_unspecified() || dest.is_broadcast() || dest.is_multicast()
}

/// Fixed-size pool of traceroute workers fed through a FIFO channel
pub struct TracePool {
    sender: Option<Sender<Ipv4Addr>>,
    traced: HashSet<Ipv4Addr>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl TracePool {
    /// Spawn `workers` threads. Reports go to `sink`; `cancel` stops the
    /// pool cooperatively (also triggered by `shutdown`).
    pub fn start<R: TraceRunner>(
        workers: usize,
        runner: R,
        sink: RecordSink,
        cancel: CancellationToken,
    ) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::channel::<Ipv4Addr>();
        let receiver = Arc::new(Mutex::new(receiver));
        let runner = Arc::new(runner);

        let mut pool = Self {
            sender: Some(sender),
            traced: HashSet::new(),
            workers: Vec::with_capacity(workers),
            cancel,
        };

        for id in 0..workers.max(1) {
            let receiver = receiver.clone();
            let runner = runner.clone();
            let sink = sink.clone();
            let cancel = pool.cancel.clone();
            // On spawn failure, dropping the pool joins the workers already started
            let handle = std::thread::Builder::new()
                .name(format!("trace-worker-{}", id))
                .spawn(move || worker_loop(id, &receiver, &*runner, &sink, &cancel))?;
            pool.workers.push(handle);
        }

        Ok(pool)
    }

    /// Queue a traceroute to `dest` unless it is loopback/unspecified or was
    /// already submitted. Never blocks. Returns true if a task was queued.
    pub fn submit(&mut self, dest: Ipv4Addr) -> bool {
        if is_untraceable(dest) || self.cancel.is_cancelled() {
            return false;
        }
        let Some(sender) = self.sender.as_ref() else {
            return false;
        };
        if !self.traced.insert(dest) {
            return false;
        }

        if sender.send(dest).is_err() {
            // All workers are gone; nothing will ever run this task
            warn!(%dest, "traceroute workers unavailable");
            return false;
        }
        debug!(%dest, "traceroute queued");
        true
    }

    /// Destinations submitted so far
    pub fn traced_count(&self) -> usize {
        self.traced.len()
    }

    pub fn has_traced(&self, dest: Ipv4Addr) -> bool {
        self.traced.contains(&dest)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Stop the pool and wait for every worker to exit.
    ///
    /// Queued tasks that have not started are dropped; a run in progress
    /// finishes its current TTL first.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.cancel.cancel();
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("traceroute worker exited abnormally");
            }
        }
    }
}

impl Drop for TracePool {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn worker_loop(
    id: usize,
    receiver: &Mutex<Receiver<Ipv4Addr>>,
    runner: &dyn TraceRunner,
    sink: &RecordSink,
    cancel: &CancellationToken,
) {
    debug!(worker = id, "traceroute worker started");
    loop {
        // An idle worker blocks in recv() while holding the lock; the others
        // wait on the mutex. The lock is dropped once a task is taken.
        let task = receiver.lock().recv();
        let Ok(dest) = task else {
            break;
        };

        if cancel.is_cancelled() {
            debug!(worker = id, %dest, "shutting down, skipping queued traceroute");
            continue;
        }

        run_task(id, dest, runner, sink, cancel);
    }
    debug!(worker = id, "traceroute worker stopped");
}

fn run_task(
    id: usize,
    dest: Ipv4Addr,
    runner: &dyn TraceRunner,
    sink: &RecordSink,
    cancel: &CancellationToken,
) {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| runner.trace(dest, cancel)))
        .unwrap_or_else(|panic_payload| {
            Err(TraceError::Panicked {
                dest,
                message: panic_message(&*panic_payload),
            })
        });

    match result {
        Ok(outcome) if outcome.hops.is_empty() => {
            debug!(worker = id, %dest, "traceroute produced no hops");
        }
        Ok(outcome) => {
            info!(
                worker = id,
                %dest,
                hops = outcome.hops.len(),
                reached = outcome.reached,
                "traceroute complete"
            );
            let report = TraceReport::new(&outcome, Utc::now().timestamp());
            if let Err(e) = sink.emit(&report) {
                warn!(%dest, error = %e, "failed to write traceroute report");
            }
        }
        Err(e) => {
            warn!(worker = id, %dest, error = %e, "traceroute failed");
        }
    }
}
