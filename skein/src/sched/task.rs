// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Task identity, status and per-task scheduler state.

use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::codec::Value;
use crate::io::IoHandle;
use crate::sched::coro::{Coro, Resume, Step};
use crate::sched::inbox::Inbox;
use crate::worker::user::WorkerShared;

/// Identifies a task. The index is dense (pool-assigned, main task = 1) and
/// unique within its owning scheduler; the scheduler id makes ids from
/// different schedulers distinguishable, which is what lets `await` reject
/// tasks of another scheduler.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    sid: u32,
    idx: NonZeroU32,
}

impl TaskId {
    pub(crate) fn new(sid: u32, idx: u32) -> TaskId {
        TaskId { sid, idx: NonZeroU32::new(idx).expect("task index is 1-based") }
    }

    /// Test seam; not part of the stable API.
    #[doc(hidden)]
    #[must_use]
    pub fn from_raw(sid: u32, idx: u32) -> TaskId { TaskId::new(sid, idx) }

    /// Dense 1-based index within the owning scheduler.
    #[must_use]
    pub fn index(self) -> u32 { self.idx.get() }

    pub(crate) fn scheduler_id(self) -> u32 { self.sid }

    /// The main task is guaranteed index 1.
    #[must_use]
    pub fn is_main(self) -> bool { self.idx.get() == 1 }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "T{}", self.idx) }
}

impl fmt::Debug for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}#{:x}", self.idx, self.sid)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum TaskStatus {
    /// On the run queue (or staged as runnext).
    Ready,
    /// Currently running.
    Running,
    /// Suspended, waiting for I/O or a sleep timer.
    WaitIo,
    /// Suspended, waiting to send to a full inbox.
    WaitSend,
    /// Suspended, waiting for an inbox message.
    WaitRecv,
    /// Suspended, waiting for a task to exit.
    WaitTask,
    /// Suspended, waiting for a worker to exit.
    WaitWorker,
    /// Suspended, waiting for an async operation (e.g. syscall) to finish.
    WaitAsync,
    Dead,
}

/// How a task exited. The discriminant is the first value `await` returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
#[repr(u8)]
pub enum DiedHow {
    /// Uncaught error.
    Err = 0,
    /// Clean exit.
    Clean = 1,
    /// Stopped by parent task.
    Stopped = 2,
}

/// Continuation-specific data held while a task is suspended, selected by
/// its status.
#[derive(Default)]
pub(crate) enum WaitInfo {
    #[default]
    None,
    /// `WaitIo` on a descriptor (a sleep timer leaves this `None`).
    Io { handle: IoHandle },
    /// `WaitTask`: the awaited task plus the link in its waiter chain.
    Task { wait_tid: TaskId, next_tid: Option<TaskId> },
    /// `WaitSend`: the destination plus the link in its inbox waiter chain.
    /// The values travel in the re-staged send step.
    Send { dst: TaskId, next_tid: Option<TaskId> },
    /// `WaitWorker`: the awaited worker plus the link in its waiter chain.
    Worker { worker: Arc<WorkerShared>, next_tid: Option<TaskId> },
}

impl fmt::Debug for WaitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WaitInfo::None => "None",
            WaitInfo::Io { .. } => "Io",
            WaitInfo::Task { .. } => "Task",
            WaitInfo::Send { .. } => "Send",
            WaitInfo::Worker { .. } => "Worker",
        })
    }
}

/// A live task. Parent/child/sibling links form an intrusive doubly-linked
/// sibling list by id; `first_child` points at the most recently spawned
/// child.
pub(crate) struct Task {
    pub body: Option<Box<dyn Coro>>,
    pub status: TaskStatus,
    pub parent: Option<TaskId>,
    pub first_child: Option<TaskId>,
    pub prev_sibling: Option<TaskId>,
    pub next_sibling: Option<TaskId>,
    /// Head of the chain of tasks blocked in `await` on this task.
    pub waiters: Option<TaskId>,
    pub inbox: Option<Inbox>,
    /// Live timers owned by this task (for cascade cancel).
    pub ntimers: u16,
    /// Value handed to the body on next resume.
    pub staged: Option<Resume>,
    /// A step re-processed before the body runs again (parked sends).
    pub staged_step: Option<Step>,
    pub wait: WaitInfo,
}

impl Task {
    pub(crate) fn new(body: Box<dyn Coro>, parent: Option<TaskId>) -> Task {
        Task {
            body: Some(body),
            status: TaskStatus::Ready,
            parent,
            first_child: None,
            prev_sibling: None,
            next_sibling: None,
            waiters: None,
            inbox: None,
            ntimers: 0,
            staged: Some(Resume::Start),
            staged_step: None,
            wait: WaitInfo::None,
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("status", &self.status)
            .field("parent", &self.parent)
            .field("ntimers", &self.ntimers)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

/// Arena entry. Records of exited tasks are retained so a later `await`
/// can still report the outcome (the role the host GC's references play in
/// keeping exited coroutines observable).
#[derive(Debug)]
pub(crate) enum Slot {
    Live(Task),
    Dead { how: DiedHow, finals: Vec<Value> },
}
