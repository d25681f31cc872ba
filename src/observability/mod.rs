//! Observability features: metrics and tracing.
//!
//! - **Metrics**: Counters and histograms via `metrics-rs`
//! - **Tracing**: Structured logging and spans via `tracing`
//!
//! ## Metrics
//!
//! | Metric | Type | Description |
//! |--------|------|-------------|
//! | `udma_transfers_total` | Counter | Split transfers completed |
//! | `udma_transfer_bytes` | Counter | Payload bytes moved |
//! | `udma_transfer_failures` | Counter | Transfers aborted, labelled by error kind |
//! | `udma_transfer_time_ns` | Histogram | Wall time per transfer |
//! | `udma_pack_commits` | Counter | Pack buffers committed |
//! | `udma_pack_records` | Counter | Records carried by committed packs |
//!
//! Every metric carries `peer` and `direction` labels.
//!
//! ## Tracing
//!
//! Every public transfer runs inside a `transfer` span; peer setup and
//! teardown run inside a `peer` span.
//!
//! ## Example
//!
//! ```rust,ignore
//! use udma::observability::init_metrics;
//!
//! // Initialize metrics (call once at startup)
//! init_metrics();
//!
//! // Metrics are recorded by every transfer from here on
//! // Use a metrics exporter (prometheus, statsd, etc.) to collect them
//! ```

mod metrics;
mod tracing_support;

pub use metrics::{PeerMetrics, TransferTimer, init_metrics, record_failure};
pub use tracing_support::{
    instrument_transfer, span_peer, span_transfer, trace_plan, trace_transfer_failed,
};
