// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The task-body seam: explicit continuations.
//!
//! A host VM would run task bodies as stackful coroutines that suspend
//! mid-call. Rust task bodies are explicit continuations instead: a
//! body is a [`Coro`], and each call to [`Coro::resume`] runs the body up
//! to its next suspension point, returning a [`Step`] that names it. The
//! scheduler parks the task accordingly and, when the wake condition is
//! satisfied, calls `resume` again with a [`Resume`] payload carrying the
//! wake's result. Closures of type `FnMut(&mut Ctx, Resume) -> Step`
//! implement [`Coro`], with captured state as the continuation state.
//!
//! Synchronous operations that never suspend (timers, sockets, monotonic
//! time, spawning workers) are methods on [`Ctx`], available during the
//! body's time slice.

use crate::codec::Value;
use crate::core::time::DurationNs;
use crate::io::IoHandle;
use crate::sched::inbox::InboxMsg;
use crate::sched::scheduler::Ctx;
use crate::sched::task::{DiedHow, TaskId};
use crate::worker::{SyscallReq, SyscallResult, WorkerHandle};

/// Destination of a `send`.
#[derive(Clone, Debug)]
pub enum SendTarget {
    /// A task on the same scheduler.
    Task(TaskId),
    /// A spawned worker (payload is structurally cloned).
    Worker(WorkerHandle),
    /// The parent scheduler, from inside a worker (payload is structurally
    /// cloned).
    Parent,
}

/// What a task body does at a suspension point (or on exit). Everything
/// here that parks the task corresponds to one suspension point of the
/// runtime: yield, sleep, recv, send to a full inbox, await, async syscall,
/// and not-ready I/O.
pub enum Step {
    /// Give up the rest of the time slice; re-queued at the tail.
    Yield,
    /// Park on a one-shot timer.
    Sleep { delay: DurationNs, leeway: DurationNs },
    /// Pull the next inbox message, parking when the inbox is empty.
    Recv,
    /// Deliver values to a task inbox or across a worker boundary. Resumes
    /// with [`Resume::Sent`]; parks only when the destination inbox is full.
    Send { to: SendTarget, values: Vec<Value> },
    /// Spawn a child task; it runs next, the parent resumes with
    /// [`Resume::Spawned`].
    Spawn(Box<dyn Coro>),
    /// Park until the target task exits.
    AwaitTask(TaskId),
    /// Park until the worker exits.
    AwaitWorker(WorkerHandle),
    /// Dispatch a blocking syscall to the async worker pool.
    Syscall(SyscallReq),
    /// Park until the descriptor reports readiness.
    IoWait(IoHandle),
    /// Clean exit with final values (delivered to awaiters).
    Return(Vec<Value>),
    /// Error exit with an error value.
    Fail(Value),
}

impl std::fmt::Debug for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Step::Yield => "Yield",
            Step::Sleep { .. } => "Sleep",
            Step::Recv => "Recv",
            Step::Send { .. } => "Send",
            Step::Spawn(_) => "Spawn",
            Step::AwaitTask(_) => "AwaitTask",
            Step::AwaitWorker(_) => "AwaitWorker",
            Step::Syscall(_) => "Syscall",
            Step::IoWait(_) => "IoWait",
            Step::Return(_) => "Return",
            Step::Fail(_) => "Fail",
        })
    }
}

/// The payload a task is resumed with; which variant arrives is determined
/// by the step the task suspended on.
#[derive(Debug)]
pub enum Resume {
    /// First resume after spawn.
    Start,
    /// Yield or sleep completed.
    Unit,
    /// Send outcome (`false`: destination gone or channel shut down).
    Sent(bool),
    /// The spawned child's id.
    Spawned(TaskId),
    /// An inbox message (recv).
    Msg(InboxMsg),
    /// Awaited task exited: how, plus its final values (clean exit) or the
    /// error value (error exit).
    TaskDone { how: DiedHow, values: Vec<Value> },
    /// Awaited worker exited.
    WorkerDone { ok: bool, err: Option<String> },
    /// Async syscall completed.
    Syscall(SyscallResult),
    /// The awaited descriptor reported readiness (inspect the handle).
    Io,
}

/// A task body. See the module docs for the continuation contract.
pub trait Coro {
    /// Runs the body until its next suspension point.
    fn resume(&mut self, cx: &mut Ctx<'_>, input: Resume) -> Step;

    /// Scoped cleanup hook, invoked when the task is stopped by its parent
    /// (the counterpart of the host language's to-be-closed handlers).
    /// Tasks that exit on their own do not get this call; `Drop` runs in
    /// every case.
    fn on_stop(&mut self) {}
}

impl<F> Coro for F
where
    F: for<'a> FnMut(&mut Ctx<'a>, Resume) -> Step + 'static,
{
    fn resume(&mut self, cx: &mut Ctx<'_>, input: Resume) -> Step { self(cx, input) }
}

/// Boxes a closure as a task body.
pub fn task_fn<F>(f: F) -> Box<dyn Coro>
where
    F: for<'a> FnMut(&mut Ctx<'a>, Resume) -> Step + 'static,
{
    Box::new(f)
}
