//! Metrics collection using metrics-rs.

use metrics::{Counter, Histogram, Unit, counter, histogram};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Error, PeerId};
use crate::split::Direction;

/// Whether metrics have been initialized.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Metric names as constants for consistency
const TRANSFERS_TOTAL: &str = "udma_transfers_total";
const TRANSFER_BYTES: &str = "udma_transfer_bytes";
const TRANSFER_FAILURES: &str = "udma_transfer_failures";
const TRANSFER_TIME_NS: &str = "udma_transfer_time_ns";
const PACK_COMMITS: &str = "udma_pack_commits";
const PACK_RECORDS: &str = "udma_pack_records";

/// Initialize metrics descriptions.
///
/// Call this once at application startup before using any metrics.
/// Safe to call multiple times (subsequent calls are no-ops).
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }

    metrics::describe_counter!(
        TRANSFERS_TOTAL,
        Unit::Count,
        "Split transfers completed, by peer and direction"
    );
    metrics::describe_counter!(TRANSFER_BYTES, Unit::Bytes, "Payload bytes moved by split transfers");
    metrics::describe_counter!(
        TRANSFER_FAILURES,
        Unit::Count,
        "Transfers aborted, by error kind"
    );
    metrics::describe_histogram!(
        TRANSFER_TIME_NS,
        Unit::Nanoseconds,
        "Wall time of one split transfer"
    );
    metrics::describe_counter!(PACK_COMMITS, Unit::Count, "Pack buffers committed");
    metrics::describe_counter!(PACK_RECORDS, Unit::Count, "Records carried by committed packs");
}

/// Record an aborted transfer.
#[inline]
pub fn record_failure(peer: PeerId, direction: Direction, error: &Error) {
    counter!(
        TRANSFER_FAILURES,
        "peer" => peer.0.to_string(),
        "direction" => direction.as_str(),
        "kind" => error.kind()
    )
    .increment(1);
}

/// Per-direction instruments of one peer.
#[derive(Clone)]
struct DirectionMetrics {
    transfers: Counter,
    bytes: Counter,
    time: Histogram,
    pack_commits: Counter,
    pack_records: Counter,
}

impl DirectionMetrics {
    fn new(peer: &str, direction: Direction) -> Self {
        let dir = direction.as_str();
        Self {
            transfers: counter!(TRANSFERS_TOTAL, "peer" => peer.to_string(), "direction" => dir),
            bytes: counter!(TRANSFER_BYTES, "peer" => peer.to_string(), "direction" => dir),
            time: histogram!(TRANSFER_TIME_NS, "peer" => peer.to_string(), "direction" => dir),
            pack_commits: counter!(PACK_COMMITS, "peer" => peer.to_string(), "direction" => dir),
            pack_records: counter!(PACK_RECORDS, "peer" => peer.to_string(), "direction" => dir),
        }
    }
}

/// Metrics collector for one peer, with labels resolved up front.
#[derive(Clone)]
pub struct PeerMetrics {
    peer: PeerId,
    send: DirectionMetrics,
    recv: DirectionMetrics,
}

impl PeerMetrics {
    /// Create a collector for `peer`.
    pub fn new(peer: PeerId) -> Self {
        let label = peer.0.to_string();
        Self {
            peer,
            send: DirectionMetrics::new(&label, Direction::Send),
            recv: DirectionMetrics::new(&label, Direction::Recv),
        }
    }

    fn direction(&self, direction: Direction) -> &DirectionMetrics {
        match direction {
            Direction::Send => &self.send,
            Direction::Recv => &self.recv,
        }
    }

    /// Record a completed transfer.
    #[inline]
    pub fn record_transfer(&self, direction: Direction, bytes: usize, elapsed: Duration) {
        let m = self.direction(direction);
        m.transfers.increment(1);
        m.bytes.increment(bytes as u64);
        m.time.record(elapsed.as_nanos() as f64);
    }

    /// Record a committed pack carrying `records` records.
    #[inline]
    pub fn record_pack_commit(&self, direction: Direction, records: usize) {
        let m = self.direction(direction);
        m.pack_commits.increment(1);
        m.pack_records.increment(records as u64);
    }

    /// Record an aborted transfer.
    #[inline]
    pub fn record_failure(&self, direction: Direction, error: &Error) {
        record_failure(self.peer, direction, error);
    }

    /// Start timing a transfer.
    pub fn start_timer(&self, direction: Direction) -> TransferTimer<'_> {
        TransferTimer {
            start: Instant::now(),
            direction,
            metrics: self,
        }
    }

    /// Peer these metrics are labelled with.
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

/// Times one transfer; [`finish`](Self::finish) records it.
pub struct TransferTimer<'a> {
    start: Instant,
    direction: Direction,
    metrics: &'a PeerMetrics,
}

impl TransferTimer<'_> {
    /// Record the outcome of the timed transfer.
    pub fn finish<T>(self, outcome: &crate::Result<T>, bytes: usize) {
        match outcome {
            Ok(_) => self
                .metrics
                .record_transfer(self.direction, bytes, self.start.elapsed()),
            Err(e) => self.metrics.record_failure(self.direction, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        // Should not panic
        init_metrics();
        // Should be idempotent
        init_metrics();
    }

    #[test]
    fn test_peer_metrics() {
        let metrics = PeerMetrics::new(PeerId(3));
        metrics.record_transfer(Direction::Send, 4096, Duration::from_micros(50));
        metrics.record_pack_commit(Direction::Recv, 12);
        metrics.record_failure(Direction::Recv, &Error::PackCorrupt("x".into()));
        assert_eq!(metrics.peer(), PeerId(3));
    }

    #[test]
    fn test_timer_records_either_outcome() {
        let metrics = PeerMetrics::new(PeerId(0));
        let ok: crate::Result<usize> = Ok(8);
        metrics.start_timer(Direction::Send).finish(&ok, 8);
        let err: crate::Result<usize> = Err(Error::PeerBusy(PeerId(0)));
        metrics.start_timer(Direction::Recv).finish(&err, 8);
    }
}
