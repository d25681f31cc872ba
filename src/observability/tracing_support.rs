//! Tracing integration for structured logging and spans.

use tracing::{Level, Span, span};

use crate::error::{Error, PeerId, ProcessId};
use crate::runtime::ContextHandle;
use crate::split::{Direction, SplitPlan};

/// Create a span for one split transfer.
///
/// # Example
///
/// ```rust
/// use udma::observability::span_transfer;
/// use udma::{Direction, PeerId};
///
/// let span = span_transfer(PeerId(0), Direction::Send, 4096);
/// let _guard = span.enter();
/// // Transfer runs here...
/// ```
#[inline]
pub fn span_transfer(peer: PeerId, direction: Direction, len: usize) -> Span {
    span!(
        Level::DEBUG,
        "transfer",
        peer = %peer,
        direction = direction.as_str(),
        len = len
    )
}

/// Create a span for peer setup or teardown.
#[inline]
pub fn span_peer(op: &'static str, process: ProcessId, ctx: ContextHandle) -> Span {
    span!(Level::DEBUG, "peer", op = op, process = %process, ctx = %ctx)
}

/// Enter a transfer span for the rest of the scope.
pub fn instrument_transfer(
    peer: PeerId,
    direction: Direction,
    len: usize,
) -> tracing::span::EnteredSpan {
    span_transfer(peer, direction, len).entered()
}

/// Log the pipeline shape chosen for a transfer.
#[inline]
pub fn trace_plan(direction: Direction, len: usize, plan: SplitPlan) {
    tracing::debug!(
        direction = direction.as_str(),
        len = len,
        split = plan.split,
        chunk = plan.chunk_size,
        "split plan"
    );
}

/// Log an aborted transfer.
#[inline]
pub fn trace_transfer_failed(peer: PeerId, direction: Direction, error: &Error) {
    tracing::error!(
        peer = %peer,
        direction = direction.as_str(),
        transferred = error.transferred().unwrap_or(0),
        error = %error,
        "transfer aborted"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_creation() {
        // These should not panic
        let _span = span_transfer(PeerId(1), Direction::Recv, 10);
        let _span = span_peer("create", ProcessId(0), ContextHandle(7));
    }

    #[test]
    fn test_trace_functions() {
        // These should not panic even without a subscriber
        let _guard = instrument_transfer(PeerId(1), Direction::Send, 10);
        trace_plan(
            Direction::Send,
            10,
            SplitPlan {
                split: 1,
                chunk_size: 512,
            },
        );
        trace_transfer_failed(PeerId(1), Direction::Send, &Error::PeerBusy(PeerId(1)));
    }
}
