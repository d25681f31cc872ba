//! In-process offload runtime.
//!
//! Each execution context is a worker thread owning one
//! [`RemoteContext`]. Calls reach it over a kanal channel and run in issue
//! order; every call gets its own single-slot reply channel, which
//! `peek_result` polls without blocking.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::accel::{
    AccelEnv, ENTRY_FINI, ENTRY_INIT, ENTRY_RECV, ENTRY_SEND, ENTRY_SEND_PACKED, RemoteContext,
};
use crate::error::{Error, Result};
use crate::runtime::{
    CallArgs, CallStatus, CodeHandle, ContextHandle, EntryAddr, OffloadRuntime, ProcessHandle,
    RequestId,
};

/// Entry points the loopback library exports, at `ENTRY_BASE + index`.
const EXPORTS: [&str; 5] = [ENTRY_INIT, ENTRY_FINI, ENTRY_RECV, ENTRY_SEND, ENTRY_SEND_PACKED];
const ENTRY_BASE: u64 = 0xE000;

struct Job {
    entry: &'static str,
    args: CallArgs,
    reply: kanal::Sender<u64>,
}

struct Context {
    process: u64,
    jobs: kanal::Sender<Job>,
    worker: Option<JoinHandle<()>>,
    pending: HashMap<u64, kanal::Receiver<u64>>,
}

#[derive(Default)]
struct State {
    next: u64,
    /// Loaded code handles per process.
    processes: HashMap<u64, Vec<u64>>,
    contexts: HashMap<u64, Context>,
}

impl State {
    fn handle(&mut self) -> u64 {
        self.next += 1;
        self.next
    }
}

/// [`OffloadRuntime`] running every context on a local thread.
pub struct LoopbackRuntime {
    env: AccelEnv,
    state: Mutex<State>,
    hidden: Mutex<HashSet<&'static str>>,
    calls: [AtomicU64; EXPORTS.len()],
}

impl LoopbackRuntime {
    /// A runtime whose contexts run on `env`.
    pub fn new(env: AccelEnv) -> Self {
        Self {
            env,
            state: Mutex::new(State::default()),
            hidden: Mutex::new(HashSet::new()),
            calls: Default::default(),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start an accelerator process on `node`.
    pub fn spawn_process(&self, node: u32) -> ProcessHandle {
        let mut state = self.state();
        let handle = state.handle();
        state.processes.insert(handle, Vec::new());
        debug!("spawned process {:#x} on node {}", handle, node);
        ProcessHandle(handle)
    }

    /// Load the transport library into `process`.
    pub fn load_library(&self, process: ProcessHandle) -> Result<CodeHandle> {
        let mut state = self.state();
        let handle = state.handle();
        let code = state
            .processes
            .get_mut(&process.0)
            .ok_or_else(|| Error::Offload(format!("no process {process}")))?;
        code.push(handle);
        Ok(CodeHandle(handle))
    }

    /// Open an execution context in `process`.
    pub fn open_context(&self, process: ProcessHandle) -> Result<ContextHandle> {
        let mut state = self.state();
        if !state.processes.contains_key(&process.0) {
            return Err(Error::Offload(format!("no process {process}")));
        }
        let handle = state.handle();
        let (jobs, inbox) = kanal::unbounded::<Job>();
        let mut remote = RemoteContext::new(self.env.clone());
        let worker = std::thread::Builder::new()
            .name(format!("udma-ctx-{handle:x}"))
            .spawn(move || {
                while let Ok(job) = inbox.recv() {
                    let result = remote.handle(job.entry, &job.args);
                    let _ = job.reply.send(result);
                }
            })?;
        state.contexts.insert(
            handle,
            Context {
                process: process.0,
                jobs,
                worker: Some(worker),
                pending: HashMap::new(),
            },
        );
        Ok(ContextHandle(handle))
    }

    /// Stop a context's worker after it drains queued calls.
    pub fn close_context(&self, ctx: ContextHandle) -> Result<()> {
        let context = self
            .state()
            .contexts
            .remove(&ctx.0)
            .ok_or_else(|| Error::Offload(format!("no context {ctx}")))?;
        shutdown(context);
        Ok(())
    }

    /// Make `entry` unresolvable, as if the library did not export it.
    pub fn hide_entry(&self, entry: &'static str) {
        self.hidden
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(entry);
    }

    /// Calls issued to `entry` so far.
    pub fn calls(&self, entry: &str) -> u64 {
        EXPORTS
            .iter()
            .position(|&name| name == entry)
            .map_or(0, |i| self.calls[i].load(Ordering::Relaxed))
    }

    fn lookup(&self, ctx: ContextHandle) -> Result<kanal::Sender<Job>> {
        self.state()
            .contexts
            .get(&ctx.0)
            .map(|c| c.jobs.clone())
            .ok_or_else(|| Error::Offload(format!("no context {ctx}")))
    }
}

fn shutdown(mut context: Context) {
    let _ = context.jobs.close();
    if let Some(worker) = context.worker.take() {
        if worker.join().is_err() {
            warn!("context worker of process {:#x} panicked", context.process);
        }
    }
}

impl OffloadRuntime for LoopbackRuntime {
    fn resolve_entry_point(
        &self,
        process: ProcessHandle,
        code: CodeHandle,
        name: &str,
    ) -> Option<EntryAddr> {
        let loaded = self
            .state()
            .processes
            .get(&process.0)
            .is_some_and(|code_handles| code_handles.contains(&code.0));
        let hidden = self
            .hidden
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(name);
        if !loaded || hidden {
            return None;
        }
        let index = EXPORTS.iter().position(|&export| export == name)?;
        Some(EntryAddr(ENTRY_BASE + index as u64))
    }

    fn invoke_async(&self, ctx: ContextHandle, entry: EntryAddr, args: CallArgs) -> Result<RequestId> {
        let index = entry
            .0
            .checked_sub(ENTRY_BASE)
            .map(|i| i as usize)
            .filter(|&i| i < EXPORTS.len())
            .ok_or_else(|| Error::Offload(format!("no entry point at {entry}")))?;
        let jobs = self.lookup(ctx)?;
        let (reply, result) = kanal::bounded(1);
        jobs.send(Job {
            entry: EXPORTS[index],
            args,
            reply,
        })
        .map_err(|e| Error::Offload(format!("context {ctx} is closed: {e}")))?;
        self.calls[index].fetch_add(1, Ordering::Relaxed);

        let mut state = self.state();
        let request = state.handle();
        let context = state
            .contexts
            .get_mut(&ctx.0)
            .ok_or_else(|| Error::Offload(format!("no context {ctx}")))?;
        context.pending.insert(request, result);
        Ok(RequestId(request))
    }

    fn await_result(&self, ctx: ContextHandle, request: RequestId) -> Result<u64> {
        let result = self
            .state()
            .contexts
            .get_mut(&ctx.0)
            .and_then(|c| c.pending.remove(&request.0))
            .ok_or_else(|| Error::Offload(format!("no request {request} on context {ctx}")))?;
        result
            .recv()
            .map_err(|e| Error::Offload(format!("request {request} lost: {e}")))
    }

    fn peek_result(&self, ctx: ContextHandle, request: RequestId) -> Result<CallStatus> {
        let mut state = self.state();
        let context = state
            .contexts
            .get_mut(&ctx.0)
            .ok_or_else(|| Error::Offload(format!("no context {ctx}")))?;
        let result = context
            .pending
            .get(&request.0)
            .ok_or_else(|| Error::Offload(format!("no request {request} on context {ctx}")))?;
        match result.try_recv() {
            Ok(Some(raw)) => {
                context.pending.remove(&request.0);
                Ok(CallStatus::Finished(raw))
            }
            Ok(None) => Ok(CallStatus::Running),
            Err(e) => Err(Error::Offload(format!("request {request} lost: {e}"))),
        }
    }
}

impl Drop for LoopbackRuntime {
    fn drop(&mut self) {
        let contexts: Vec<Context> = self.state().contexts.drain().map(|(_, c)| c).collect();
        for context in contexts {
            shutdown(context);
        }
    }
}

impl std::fmt::Debug for LoopbackRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("LoopbackRuntime")
            .field("processes", &state.processes.len())
            .field("contexts", &state.contexts.len())
            .finish()
    }
}
