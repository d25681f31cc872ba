//! Offload runtime: remote entry points and asynchronous calls.

use super::{CodeHandle, ContextHandle, EntryAddr, ProcessHandle, RequestId};
use crate::error::Result;

/// One marshalled argument of a remote call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallArg {
    /// Unsigned 64-bit scalar.
    U64(u64),
    /// Signed 32-bit scalar.
    I32(i32),
    /// Opaque byte range passed by value.
    Bytes(Vec<u8>),
}

/// Argument list of a remote call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallArgs {
    args: Vec<CallArg>,
}

impl CallArgs {
    /// Create an empty argument list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a `u64` argument.
    pub fn u64(mut self, value: u64) -> Self {
        self.args.push(CallArg::U64(value));
        self
    }

    /// Append an `i32` argument.
    pub fn i32(mut self, value: i32) -> Self {
        self.args.push(CallArg::I32(value));
        self
    }

    /// Append a by-value byte range.
    pub fn bytes(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.args.push(CallArg::Bytes(value.into()));
        self
    }

    /// Number of arguments.
    pub fn len(&self) -> usize {
        self.args.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Argument `index` as a `u64`, if it is one.
    pub fn get_u64(&self, index: usize) -> Option<u64> {
        match self.args.get(index)? {
            CallArg::U64(v) => Some(*v),
            _ => None,
        }
    }

    /// Argument `index` as an `i32`, if it is one.
    pub fn get_i32(&self, index: usize) -> Option<i32> {
        match self.args.get(index)? {
            CallArg::I32(v) => Some(*v),
            _ => None,
        }
    }

    /// Argument `index` as a byte range, if it is one.
    pub fn get_bytes(&self, index: usize) -> Option<&[u8]> {
        match self.args.get(index)? {
            CallArg::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

/// State of an outstanding remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// Still executing on the remote side.
    Running,
    /// Returned with this 64-bit result.
    Finished(u64),
}

/// Accelerator offload runtime.
///
/// Process and context lifecycle belong to the runtime; the transport only
/// resolves entry points in code the caller already loaded and issues calls
/// on contexts the caller already opened.
pub trait OffloadRuntime: Send + Sync {
    /// Locate `name` in loaded code. `None` if the symbol is absent.
    fn resolve_entry_point(
        &self,
        process: ProcessHandle,
        code: CodeHandle,
        name: &str,
    ) -> Option<EntryAddr>;

    /// Start a call on `ctx`; calls on one context run in issue order.
    fn invoke_async(&self, ctx: ContextHandle, entry: EntryAddr, args: CallArgs)
    -> Result<RequestId>;

    /// Block until the call finishes and return its result.
    fn await_result(&self, ctx: ContextHandle, request: RequestId) -> Result<u64>;

    /// Check the call without blocking.
    ///
    /// A [`CallStatus::Finished`] result retires the request; it must not be
    /// awaited or peeked again afterwards.
    fn peek_result(&self, ctx: ContextHandle, request: RequestId) -> Result<CallStatus>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_args_accessors() {
        let args = CallArgs::new().u64(7).i32(-1).bytes(vec![1, 2, 3]);
        assert_eq!(args.len(), 3);
        assert_eq!(args.get_u64(0), Some(7));
        assert_eq!(args.get_i32(1), Some(-1));
        assert_eq!(args.get_bytes(2), Some(&[1u8, 2, 3][..]));
        // Wrong type or out of range
        assert_eq!(args.get_i32(0), None);
        assert_eq!(args.get_u64(9), None);
    }
}
