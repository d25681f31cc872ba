//! Local-role transfer loops.
//!
//! The local role writes payload straight into the mapped data area and
//! publishes it with a release store to the slot's mailbox. Before a loop
//! starts, the caller issues the matching remote entry point asynchronously
//! and hands it in as a [`RemoteCall`]; the loop peeks at it while waiting so
//! a remote failure ends the wait instead of hanging it.

use std::sync::atomic::Ordering;

use crate::channel::SubChannel;
use crate::error::{Error, Result};
use crate::poll::PollPolicy;
use crate::runtime::{
    CallArgs, CallStatus, ContextHandle, EntryAddr, OffloadRuntime, ReplyStatus, ReplyWord,
    RequestId,
};
use crate::split::SplitPlan;

/// An outstanding asynchronous call to a remote entry point.
pub struct RemoteCall<'r> {
    runtime: &'r dyn OffloadRuntime,
    ctx: ContextHandle,
    request: RequestId,
    result: Option<u64>,
}

impl<'r> RemoteCall<'r> {
    /// Issue `entry` on `ctx`.
    pub fn issue(
        runtime: &'r dyn OffloadRuntime,
        ctx: ContextHandle,
        entry: EntryAddr,
        args: CallArgs,
    ) -> Result<Self> {
        let request = runtime.invoke_async(ctx, entry, args)?;
        Ok(Self {
            runtime,
            ctx,
            request,
            result: None,
        })
    }

    /// The call's result if it has finished.
    pub fn peek(&mut self) -> Result<Option<u64>> {
        if self.result.is_none() {
            if let CallStatus::Finished(raw) = self.runtime.peek_result(self.ctx, self.request)? {
                self.result = Some(raw);
            }
        }
        Ok(self.result)
    }

    /// Block until the call finishes.
    pub fn wait(&mut self) -> Result<u64> {
        if let Some(raw) = self.result {
            return Ok(raw);
        }
        let raw = self.runtime.await_result(self.ctx, self.request)?;
        self.result = Some(raw);
        Ok(raw)
    }
}

/// Send `src` through `channel`; the remote side runs its receive loop.
///
/// Returns `src.len()` on success.
pub fn send(
    channel: &SubChannel,
    plan: SplitPlan,
    src: &[u8],
    call: &mut RemoteCall<'_>,
    policy: &PollPolicy,
) -> Result<usize> {
    plan.validate(channel.layout())?;
    let len = src.len();
    let mut sent = 0;
    let mut j = 0;

    while sent < len {
        let mailbox = channel.mailbox(j);
        wait_until(|| mailbox.load(Ordering::Acquire) == 0, call, len, sent, policy)?;

        let tlen = plan.chunk_size.min(len - sent);
        channel
            .chunk_buffer(j, plan.chunk_size)
            .write_from(&src[sent..sent + tlen])?;
        mailbox.store(tlen as u64, Ordering::Release);

        sent += tlen;
        j = (j + 1) % plan.split;
    }

    finish(call, len, policy)
}

/// Receive into `dst` through `channel`; the remote side runs its send loop.
///
/// Returns `dst.len()` on success. A mailbox announcing more than the
/// remaining length aborts with [`Error::InvalidLength`] before any byte of
/// that chunk is copied.
pub fn recv(
    channel: &SubChannel,
    plan: SplitPlan,
    dst: &mut [u8],
    call: &mut RemoteCall<'_>,
    policy: &PollPolicy,
) -> Result<usize> {
    plan.validate(channel.layout())?;
    let len = dst.len();
    let mut received = 0;
    let mut j = 0;

    while received < len {
        let mailbox = channel.mailbox(j);
        wait_until(|| mailbox.load(Ordering::Acquire) != 0, call, len, received, policy)?;

        let announced = mailbox.load(Ordering::Acquire) as usize;
        let remaining = len - received;
        if announced > remaining || announced > plan.chunk_size {
            return Err(Error::InvalidLength {
                announced,
                remaining,
                transferred: received,
            });
        }
        channel
            .chunk_buffer(j, plan.chunk_size)
            .read_into(&mut dst[received..received + announced])?;
        mailbox.store(0, Ordering::Release);

        received += announced;
        j = (j + 1) % plan.split;
    }

    finish(call, len, policy)
}

fn finish(call: &mut RemoteCall<'_>, len: usize, policy: &PollPolicy) -> Result<usize> {
    ReplyWord::check(call.wait()?, len, policy.timeout)
}

/// Poll `ready` until it holds, peeking at the remote call every
/// `policy.peek_every` polls.
fn wait_until(
    ready: impl Fn() -> bool,
    call: &mut RemoteCall<'_>,
    requested: usize,
    progress: usize,
    policy: &PollPolicy,
) -> Result<()> {
    let peek_every = policy.peek_every.max(1);
    let mut backoff = policy.backoff();
    let mut polls = 0u32;

    loop {
        if ready() {
            return Ok(());
        }
        polls = polls.wrapping_add(1);
        if polls % peek_every == 0 {
            if let Some(raw) = call.peek()? {
                // A finished call either failed, or it completed and every
                // mailbox it owed is already published.
                ReplyWord::check(raw, requested, policy.timeout)?;
                if ready() {
                    return Ok(());
                }
                return Err(Error::RemoteAborted {
                    status: ReplyStatus::Ok,
                    transferred: progress,
                    requested,
                });
            }
        }
        backoff.snooze();
    }
}
