//! Remote-role side of the transport.
//!
//! An accelerator build links these entry points into the code the offload
//! runtime loads. Each execution context owns one [`RemoteContext`]; the
//! runtime dispatches every call on the context to
//! [`RemoteContext::handle`], which decodes the marshalled arguments and
//! drives the remote half of the transfer.
//!
//! | Entry | Arguments | Result |
//! |---|---|---|
//! | `udma_init` | `Bytes(PeerDescriptor)` | `0` or a status code |
//! | `udma_fini` | none | `0` or a status code |
//! | `udma_recv` | `U64 dst, U64 len, I32 split, U64 chunk, I32 pack` | reply word |
//! | `udma_send` | `U64 src, U64 len, I32 split, U64 chunk` | reply word |
//! | `udma_send_packed` | `Bytes(entries), U64 total, I32 split, U64 chunk` | reply word |

mod descriptor;
mod peer;

pub use descriptor::PeerDescriptor;
pub use peer::RemotePeer;

use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::engine::Aborted;
use crate::pack::decode_entries;
use crate::runtime::{
    AddressSpace, CallArgs, DmaEngine, RemoteAddr, ReplyStatus, ReplyWord, SegmentProvider,
    WordAccess,
};
use crate::split::SplitPlan;

/// Remote peer setup.
pub const ENTRY_INIT: &str = "udma_init";
/// Remote peer teardown.
pub const ENTRY_FINI: &str = "udma_fini";
/// Remote receive; the host sends.
pub const ENTRY_RECV: &str = "udma_recv";
/// Remote send; the host receives.
pub const ENTRY_SEND: &str = "udma_send";
/// Remote gather of a receive batch.
pub const ENTRY_SEND_PACKED: &str = "udma_send_packed";

/// Hardware and memory the remote role runs on.
#[derive(Clone)]
pub struct AccelEnv {
    /// Block-transfer engine.
    pub dma: Arc<dyn DmaEngine>,
    /// Single-word access to the shared segment.
    pub words: Arc<dyn WordAccess>,
    /// Segment attachment.
    pub segments: Arc<dyn SegmentProvider>,
    /// Memory holding user buffers.
    pub memory: Arc<dyn AddressSpace>,
    /// Time source of the liveness bound.
    pub clock: Arc<dyn Clock>,
}

/// Entry-point dispatcher of one execution context.
pub struct RemoteContext {
    env: AccelEnv,
    peer: Option<RemotePeer>,
}

impl RemoteContext {
    /// A context with no peer initialized yet.
    pub fn new(env: AccelEnv) -> Self {
        Self { env, peer: None }
    }

    /// Whether `udma_init` has succeeded on this context.
    pub fn is_initialized(&self) -> bool {
        self.peer.is_some()
    }

    /// Run entry point `entry` and return its 64-bit result.
    pub fn handle(&mut self, entry: &str, args: &CallArgs) -> u64 {
        match entry {
            ENTRY_INIT => self.init(args),
            ENTRY_FINI => self.fini(),
            ENTRY_RECV | ENTRY_SEND | ENTRY_SEND_PACKED => self.transfer(entry, args).encode(),
            _ => {
                warn!("unknown entry point `{}`", entry);
                reject(ReplyStatus::BadArgs)
            }
        }
    }

    fn init(&mut self, args: &CallArgs) -> u64 {
        if self.peer.is_some() {
            warn!("udma_init on a context that already has a peer");
            return ReplyStatus::BadArgs as u64;
        }
        let Some(bytes) = args.get_bytes(0) else {
            return ReplyStatus::BadArgs as u64;
        };
        let peer = PeerDescriptor::decode(bytes)
            .and_then(|desc| RemotePeer::init(self.env.clone(), &desc));
        match peer {
            Ok(peer) => {
                self.peer = Some(peer);
                0
            }
            Err(e) => {
                error!("udma_init failed: {}", e);
                ReplyStatus::of(&e) as u64
            }
        }
    }

    fn fini(&mut self) -> u64 {
        let Some(peer) = self.peer.take() else {
            return ReplyStatus::NotInitialized as u64;
        };
        match peer.fini() {
            Ok(()) => 0,
            Err(e) => {
                error!("udma_fini failed: {}", e);
                ReplyStatus::of(&e) as u64
            }
        }
    }

    fn transfer(&self, entry: &str, args: &CallArgs) -> ReplyWord {
        let Some(peer) = self.peer.as_ref() else {
            return ReplyWord {
                status: ReplyStatus::NotInitialized,
                transferred: 0,
            };
        };
        let outcome = match entry {
            ENTRY_RECV => addr_len(args).zip(plan_at(args, 2)).zip(args.get_i32(4)).map(
                |(((dst, len), plan), pack)| {
                    if pack != 0 {
                        peer.recv_packed(len, plan)
                    } else {
                        peer.recv(dst, len, plan)
                    }
                },
            ),
            ENTRY_SEND => addr_len(args)
                .zip(plan_at(args, 2))
                .map(|((src, len), plan)| peer.send(src, len, plan)),
            _ => gather_args(args).map(|(entries, total, plan)| {
                match decode_entries(entries) {
                    Ok(entries) => peer.send_gathered(&entries, total, plan),
                    Err(e) => Err(Aborted::new(e, 0)),
                }
            }),
        };

        match outcome {
            Some(Ok(moved)) => ReplyWord::ok(moved),
            Some(Err(aborted)) => {
                debug!(
                    "{} on remote peer {} aborted after {} bytes: {}",
                    entry,
                    peer.id(),
                    aborted.transferred,
                    aborted.error
                );
                ReplyWord {
                    status: ReplyStatus::of(&aborted.error),
                    transferred: aborted.transferred,
                }
            }
            None => {
                warn!("{} called with malformed arguments", entry);
                ReplyWord {
                    status: ReplyStatus::BadArgs,
                    transferred: 0,
                }
            }
        }
    }
}

impl std::fmt::Debug for RemoteContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteContext")
            .field("peer", &self.peer)
            .finish_non_exhaustive()
    }
}

fn reject(status: ReplyStatus) -> u64 {
    ReplyWord {
        status,
        transferred: 0,
    }
    .encode()
}

fn addr_len(args: &CallArgs) -> Option<(RemoteAddr, usize)> {
    let addr = RemoteAddr(args.get_u64(0)?);
    let len = usize::try_from(args.get_u64(1)?).ok()?;
    Some((addr, len))
}

fn plan_at(args: &CallArgs, at: usize) -> Option<SplitPlan> {
    Some(SplitPlan {
        split: usize::try_from(args.get_i32(at)?).ok()?,
        chunk_size: usize::try_from(args.get_u64(at + 1)?).ok()?,
    })
}

fn gather_args(args: &CallArgs) -> Option<(&[u8], usize, SplitPlan)> {
    let entries = args.get_bytes(0)?;
    let total = usize::try_from(args.get_u64(1)?).ok()?;
    Some((entries, total, plan_at(args, 2)?))
}

/// Argument list of `udma_recv`.
pub fn recv_args(dst: RemoteAddr, len: usize, plan: SplitPlan, pack: bool) -> CallArgs {
    CallArgs::new()
        .u64(dst.0)
        .u64(len as u64)
        .i32(plan.split as i32)
        .u64(plan.chunk_size as u64)
        .i32(i32::from(pack))
}

/// Argument list of `udma_send`.
pub fn send_args(src: RemoteAddr, len: usize, plan: SplitPlan) -> CallArgs {
    CallArgs::new()
        .u64(src.0)
        .u64(len as u64)
        .i32(plan.split as i32)
        .u64(plan.chunk_size as u64)
}

/// Argument list of `udma_send_packed`.
pub fn send_packed_args(entries: Vec<u8>, total: usize, plan: SplitPlan) -> CallArgs {
    CallArgs::new()
        .bytes(entries)
        .u64(total as u64)
        .i32(plan.split as i32)
        .u64(plan.chunk_size as u64)
}
