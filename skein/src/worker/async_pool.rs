// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words ASYNCWORK addrinfo nanosleep getaddrinfo

//! Async workers: OS threads that execute blocking syscalls so the
//! cooperative loop never blocks on them.
//!
//! The parent scheduler lazily creates a submission channel shared by all
//! of its async workers and a completion channel it alone consumes. Each
//! worker loops: read a request from the submission queue, execute it,
//! write the completion, set the `ASYNCWORK` note and interrupt the
//! parent's poller. Workers are permanent once spawned; they exit when the
//! submission queue is shut down.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use crate::core::ring_channel::RingChannel;
use crate::error::RtError;
use crate::sched::scheduler::{NOTE_ASYNCWORK, NOTE_WEXIT, Scheduler};
use crate::worker::user::{WORKER_CLOSED, WORKER_OPEN, WORKER_READY, WorkerKind, WorkerShared, cas_status};

/// A blocking syscall request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SyscallReq {
    Nanosleep { nanos: u64 },
    /// Resolve `host:port` (the libc `getaddrinfo` path; `ToSocketAddrs`
    /// performs exactly that blocking lookup).
    AddrInfo { host: String, port: u16 },
}

/// Result of an async syscall, staged back onto the submitting task.
#[derive(Clone, Debug)]
pub enum SyscallResult {
    /// Plain integer result; `< 0` is `-errno`.
    Int(i64),
    /// Resolved addresses, or the resolver's error text.
    AddrInfo(Result<Vec<SocketAddr>, String>),
}

/// Unit of work queued on the submission channel.
#[derive(Debug)]
pub(crate) struct AsyncWorkReq {
    /// Index of the task waiting for this work (within the parent).
    pub tid_idx: u32,
    pub req: SyscallReq,
}

/// Entries of a scheduler's completion channel.
#[derive(Debug)]
pub(crate) enum Completion {
    /// An async worker finished a request.
    Async { tid_idx: u32, result: SyscallResult },
    /// A structurally-cloned message from another scheduler, to be
    /// delivered to the main task's inbox.
    WorkerMsg { bytes: Vec<u8> },
}

/// Executes a request, blocking the calling thread.
pub(crate) fn perform(req: &SyscallReq) -> SyscallResult {
    match req {
        SyscallReq::Nanosleep { nanos } => {
            std::thread::sleep(Duration::from_nanos(*nanos));
            SyscallResult::Int(0)
        }
        SyscallReq::AddrInfo { host, port } => {
            tracing::debug!(target: "worker", host = %host, port, "getaddrinfo begin");
            let result = (host.as_str(), *port)
                .to_socket_addrs()
                .map(Iterator::collect)
                .map_err(|e| e.to_string());
            tracing::debug!(target: "worker", ok = result.is_ok(), "getaddrinfo finish");
            SyscallResult::AddrInfo(result)
        }
    }
}

/// Spawns one async worker draining the scheduler's submission queue.
pub(crate) fn spawn_async(s: &mut Scheduler) -> Result<(), RtError> {
    let sq = s.submission_channel().expect("submission queue exists before spawning workers");
    let cq = s.completion_channel();
    let signal = s.signal();

    let shared = Arc::new(WorkerShared {
        kind: WorkerKind::Async,
        status: AtomicU8::new(WORKER_OPEN),
        waiters: AtomicU32::new(0),
        exiterr: AtomicBool::new(false),
        errdesc: Mutex::new(None),
        parent_signal: Arc::clone(&signal),
        parent_cq: None,
        own_signal: OnceLock::new(),
        cq: Arc::clone(&cq),
        thread: Mutex::new(None),
    });

    let thread_shared = Arc::clone(&shared);
    let handle = std::thread::Builder::new()
        .name("skein-asyncwork".into())
        .spawn(move || {
            if !cas_status(&thread_shared, WORKER_READY) {
                tracing::debug!(target: "worker", "closed before getting ready");
            } else {
                async_worker_loop(&sq, &cq, &signal);
            }
            thread_shared.status.store(WORKER_CLOSED, Ordering::Release);
            thread_shared.parent_signal.notify(NOTE_WEXIT);
        })
        .map_err(RtError::ThreadSpawn)?;
    *shared.thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

    s.workers_add(shared);
    tracing::debug!(target: "sched", "spawned asyncwork worker");
    Ok(())
}

fn async_worker_loop(
    sq: &RingChannel<AsyncWorkReq>,
    cq: &RingChannel<Completion>,
    signal: &crate::sched::scheduler::SchedSignal,
) {
    // Reads block until work arrives or the submission queue is shut down.
    while let Some(work) = sq.recv() {
        let result = perform(&work.req);
        // The completion invariant: every request read from the submission
        // queue gets exactly one completion (unless the completion channel
        // itself is gone, which only happens during parent teardown).
        if cq.send(Completion::Async { tid_idx: work.tid_idx, result }).is_ok() {
            signal.notify(NOTE_ASYNCWORK);
        }
    }
    tracing::debug!(target: "worker", "asyncwork submission queue shut down");
}
