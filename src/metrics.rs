//! In-memory metrics counters.
//!
//! All hot-path operations are a single atomic load plus an atomic add, and
//! become no-ops while collection is disabled, so request handling never
//! takes a lock for observability. Snapshots swap the interval counters to
//! zero; the connected-clients gauge survives snapshots.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{Receiver, RecvTimeoutError};

static ENABLED: AtomicBool = AtomicBool::new(false);
static CONNECTED_CLIENTS: AtomicI64 = AtomicI64::new(0);
static REQUEST_COUNT: AtomicU64 = AtomicU64::new(0);
static LATENCY_NS_SUM: AtomicU64 = AtomicU64::new(0);
static LATENCY_COUNT: AtomicU64 = AtomicU64::new(0);

/// Activate metric collection. Safe to call multiple times.
pub fn enable() {
    ENABLED.store(true, Ordering::Relaxed);
}

/// Deactivate metric collection; subsequent hot-path calls are no-ops.
pub fn disable() {
    ENABLED.store(false, Ordering::Relaxed);
}

fn is_enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

pub fn incr_connected_clients() {
    if is_enabled() {
        CONNECTED_CLIENTS.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn decr_connected_clients() {
    if is_enabled() {
        CONNECTED_CLIENTS.fetch_add(-1, Ordering::Relaxed);
    }
}

/// Record a completed request and its wall-clock duration.
pub fn record_request(elapsed: Duration) {
    if !is_enabled() {
        return;
    }
    let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
    REQUEST_COUNT.fetch_add(1, Ordering::Relaxed);
    LATENCY_NS_SUM.fetch_add(nanos, Ordering::Relaxed);
    LATENCY_COUNT.fetch_add(1, Ordering::Relaxed);
}

/// A point-in-time reading of all metrics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Snapshot {
    pub connected_clients: i64,
    pub requests_per_second: f64,
    pub avg_latency_ms: f64,
}

/// Collect a reading and reset the interval accumulators.
///
/// `elapsed_secs` is the time since the previous snapshot and drives the
/// requests-per-second rate; non-positive values yield a zero rate.
pub fn take_snapshot(elapsed_secs: f64) -> Snapshot {
    let requests = REQUEST_COUNT.swap(0, Ordering::Relaxed);
    let latency_ns = LATENCY_NS_SUM.swap(0, Ordering::Relaxed);
    let samples = LATENCY_COUNT.swap(0, Ordering::Relaxed);

    let requests_per_second = if elapsed_secs > 0.0 {
        requests as f64 / elapsed_secs
    } else {
        0.0
    };
    let avg_latency_ms = if samples > 0 {
        latency_ns as f64 / samples as f64 / 1e6
    } else {
        0.0
    };

    Snapshot {
        connected_clients: CONNECTED_CLIENTS.load(Ordering::Relaxed),
        requests_per_second,
        avg_latency_ms,
    }
}

/// Spawn the periodic snapshot reporter.
///
/// Each interval a snapshot is emitted as a structured tracing event under
/// the `metrics` target. The reporter stops when `stop` disconnects or
/// receives a message.
pub fn spawn_reporter(interval: Duration, stop: Receiver<()>) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut last = Instant::now();
        loop {
            match stop.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let elapsed = last.elapsed().as_secs_f64();
                    last = Instant::now();
                    let snapshot = take_snapshot(elapsed);
                    tracing::info!(
                        target: "metrics",
                        connected_clients = snapshot.connected_clients,
                        requests_per_second = snapshot.requests_per_second,
                        avg_latency_ms = snapshot.avg_latency_ms,
                        "metrics snapshot"
                    );
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    })
}
