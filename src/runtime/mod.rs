//! Collaborator seams consumed by the transport.
//!
//! The transport never talks to an accelerator driver directly. Everything
//! it needs from the outside world goes through the traits in this module:
//!
//! - [`OffloadRuntime`]: resolve remote entry points, issue and await calls
//! - [`SegmentProvider`]: create and attach the shared segment of a peer
//! - [`DmaEngine`]: remote-role block transfers between DMA addresses
//! - [`WordAccess`]: remote-role single-word loads and stores with fences
//! - [`AddressSpace`]: the remote role's own memory, where user buffers live
//!
//! [`crate::loopback`] implements all of them in-process.

mod dma;
mod offload;
mod reply;
mod segments;
mod words;

pub use dma::{DmaEngine, DmaPoll, Submit};
pub use offload::{CallArg, CallArgs, CallStatus, OffloadRuntime};
pub use reply::{ReplyStatus, ReplyWord};
pub use segments::{Attachment, SegmentProvider};
pub use words::{AddressSpace, WordAccess};

macro_rules! handle_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name(pub u64);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    };
}

handle_type!(
    /// Accelerator process handle issued by the offload runtime.
    ProcessHandle
);
handle_type!(
    /// Handle of code loaded into an accelerator process.
    CodeHandle
);
handle_type!(
    /// Execution context (remote thread) handle.
    ContextHandle
);
handle_type!(
    /// Outstanding asynchronous remote call.
    RequestId
);
handle_type!(
    /// Resolved address of a remote entry point.
    EntryAddr
);
handle_type!(
    /// Outstanding block-transfer descriptor.
    DmaHandle
);
handle_type!(
    /// Identifier of a shared-memory segment.
    SegmentId
);
handle_type!(
    /// Key a shared-memory segment is created under.
    SegmentKey
);

/// Address in the remote role's own memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct RemoteAddr(pub u64);

impl RemoteAddr {
    /// The null address.
    pub const NULL: Self = Self(0);

    /// Whether this is the null address.
    #[inline]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Address `bytes` past this one.
    #[inline]
    pub fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl std::fmt::Display for RemoteAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Address the block-transfer engine and single-word instructions accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct DmaAddr(pub u64);

impl DmaAddr {
    /// Address `bytes` past this one.
    #[inline]
    pub fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
}

impl std::fmt::Display for DmaAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "dma:{:#x}", self.0)
    }
}
