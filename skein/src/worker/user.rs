// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words WEXIT errdesc

//! User workers: a full scheduler hosted on its own OS thread, with its own
//! value environment, addressable from the parent for messages and await.
//!
//! A scripting host would serialize the worker's main function to portable
//! bytecode and load it on the new thread; the Rust seam is a `Send`
//! factory closure invoked on the worker thread to build the main task
//! body.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread::JoinHandle;

use crate::core::ring_channel::RingChannel;
use crate::error::RtError;
use crate::sched::coro::Coro;
use crate::sched::scheduler::{NOTE_WEXIT, RunConfig, SchedSignal, Scheduler};
use crate::worker::async_pool::Completion;

pub(crate) const WORKER_CLOSED: u8 = 0;
pub(crate) const WORKER_OPEN: u8 = 1;
pub(crate) const WORKER_READY: u8 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WorkerKind {
    /// Userspace worker with its own scheduler and value environment.
    User,
    /// Drains the submission queue of blocking syscall requests.
    Async,
}

/// Worker state shared between the parent thread and the worker thread.
/// The waiter list head is atomic because the worker thread reads it at
/// exit to decide whether to capture its error text; only the parent
/// thread writes it.
#[derive(Debug)]
pub(crate) struct WorkerShared {
    pub kind: WorkerKind,
    pub status: AtomicU8,
    /// Head (task index) of the chain of parent tasks awaiting this worker.
    pub waiters: AtomicU32,
    pub exiterr: AtomicBool,
    /// Error text of the worker's main task, captured when someone awaits.
    pub errdesc: Mutex<Option<String>>,
    /// Signal of the scheduler that spawned this worker.
    pub parent_signal: Arc<SchedSignal>,
    /// Completion channel of the parent scheduler (for worker → parent
    /// messages). `None` for async workers, which write completions
    /// directly.
    pub parent_cq: Option<Arc<RingChannel<Completion>>>,
    /// The worker's own scheduler signal, installed once the thread has
    /// built its scheduler.
    pub own_signal: OnceLock<Arc<SchedSignal>>,
    /// The worker's completion channel (parent → worker messages). Created
    /// by the parent so messages can be sent before the thread is ready.
    pub cq: Arc<RingChannel<Completion>>,
    pub thread: Mutex<Option<JoinHandle<()>>>,
}

/// Parent-side handle to a spawned worker.
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    pub(crate) shared: Arc<WorkerShared>,
}

impl WorkerHandle {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.status.load(Ordering::Acquire) == WORKER_CLOSED
    }

    /// Transitions the worker to `Closed` exactly once and asks its
    /// scheduler to shut down. Returns `false` (no-op) when the worker
    /// already raced to `Closed`.
    pub fn close(&self) -> bool { close_worker(&self.shared) }
}

/// CAS `status` to `next`, failing when another thread set `Closed`
/// already (it's a race).
pub(crate) fn cas_status(shared: &WorkerShared, next: u8) -> bool {
    let mut status = shared.status.load(Ordering::Acquire);
    loop {
        if status == WORKER_CLOSED {
            return false;
        }
        match shared.status.compare_exchange_weak(
            status,
            next,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(current) => status = current,
        }
    }
}

pub(crate) fn close_worker(shared: &Arc<WorkerShared>) -> bool {
    if !cas_status(shared, WORKER_CLOSED) {
        return false; // already closed
    }
    tracing::debug!(target: "worker", kind = ?shared.kind, "closing worker");
    if shared.kind == WorkerKind::User
        && let Some(signal) = shared.own_signal.get()
    {
        // tell the worker's scheduler it is time to shut down
        signal.request_shutdown();
    }
    // async workers unblock when the submission queue is shut down
    true
}

/// Spawns a user worker: a fresh OS thread that constructs its own
/// scheduler, builds the main task body via `factory`, and enters the run
/// loop.
pub(crate) fn spawn_user<F>(s: &mut Scheduler, factory: F) -> Result<WorkerHandle, RtError>
where
    F: FnOnce() -> Box<dyn Coro> + Send + 'static,
{
    let cq = Arc::new(RingChannel::with_capacity(s.cfg.asyncwork_chan_cap)?);
    let shared = Arc::new(WorkerShared {
        kind: WorkerKind::User,
        status: AtomicU8::new(WORKER_OPEN),
        waiters: AtomicU32::new(0),
        exiterr: AtomicBool::new(false),
        errdesc: Mutex::new(None),
        parent_signal: s.signal(),
        parent_cq: Some(s.completion_channel()),
        own_signal: OnceLock::new(),
        cq,
        thread: Mutex::new(None),
    });

    let worker_cfg = RunConfig { exit_when_done: false, ..s.cfg.clone() };
    let thread_shared = Arc::clone(&shared);
    let handle = std::thread::Builder::new()
        .name("skein-worker".into())
        .spawn(move || worker_thread(worker_cfg, thread_shared, factory))
        .map_err(RtError::ThreadSpawn)?;
    *shared.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

    s.workers_add(Arc::clone(&shared));
    tracing::debug!(target: "worker", "spawned user worker");
    Ok(WorkerHandle { shared })
}

fn worker_thread<F>(cfg: RunConfig, shared: Arc<WorkerShared>, factory: F)
where
    F: FnOnce() -> Box<dyn Coro> + Send + 'static,
{
    let outcome = (|| {
        let mut sched = Scheduler::for_worker(cfg, Arc::clone(&shared))?;
        let _unused = shared.own_signal.set(sched.signal());
        // switch to READY while checking whether close() won the race
        if !cas_status(&shared, WORKER_READY) {
            tracing::debug!(target: "worker", "closed before getting ready");
            return Ok(None);
        }
        sched.run(factory()).map(Some)
    })();

    match outcome {
        Ok(Some(out)) => {
            if out.exit_err {
                shared.exiterr.store(true, Ordering::Release);
                let msg = out.main_error.unwrap_or_else(|| "unknown error".to_string());
                if shared.waiters.load(Ordering::Acquire) != 0 {
                    *shared.errdesc.lock().unwrap_or_else(|e| e.into_inner()) = Some(msg);
                } else {
                    tracing::error!(target: "worker", error = %msg, "Uncaught error in worker");
                }
            }
        }
        Ok(None) => {}
        Err(e) => {
            shared.exiterr.store(true, Ordering::Release);
            *shared.errdesc.lock().unwrap_or_else(|er| er.into_inner()) = Some(e.to_string());
            tracing::error!(target: "worker", error = %e, "worker scheduler failed");
        }
    }

    shared.status.store(WORKER_CLOSED, Ordering::Release);
    shared.parent_signal.notify(NOTE_WEXIT);
    tracing::debug!(target: "worker", "worker exited");
}
