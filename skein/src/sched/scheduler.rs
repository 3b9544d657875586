// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words runq runnext iopoll asyncwork WEXIT ASYNCWORK ntimers nlive

//! The per-OS-thread cooperative scheduler.
//!
//! One [`Scheduler`] owns a run queue (FIFO plus a priority `runnext`
//! slot), a timer heap, the task arena, an I/O poller, and the channels to
//! its async workers. All of that state is mutated only by the owning
//! thread; the only cross-thread state is the atomic `notes` byte and
//! `isclosed` flag in [`SchedSignal`], paired with the poller's waker.
//!
//! The run loop finds a runnable task (servicing timers and notes first,
//! then the run queue, then blocking in the poller with the timer-heap root
//! as deadline) and resumes it, interpreting each [`Step`] the task body
//! returns until the body parks or exits.

use std::os::fd::OwnedFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, Ordering};

use smallvec::SmallVec;

use crate::codec::{Value, format_value};
use crate::core::fifo::Fifo;
use crate::core::id_pool::IdPool;
use crate::core::ring_channel::RingChannel;
use crate::core::time::{DurationNs, MICROSECOND, MILLISECOND, Time, format_duration};
use crate::core::timer_heap::{Timer, TimerAction, TimerHeap};
use crate::error::RtError;
use crate::io::descriptor::{EV_EOF, IoHandle};
use crate::io::poller::Poller;
use crate::io::IoProgress;
use crate::sched::coro::{Coro, Resume, SendTarget, Step};
use crate::sched::inbox::{INBOX_TIMER_CAP, Inbox, InboxMsg, MsgKind, MsgSender};
use crate::sched::task::{DiedHow, Slot, Task, TaskId, TaskStatus, WaitInfo};
use crate::worker::async_pool::{AsyncWorkReq, Completion};
use crate::worker::user::{WORKER_CLOSED, WorkerShared};
use crate::worker::WorkerHandle;

/// A worker spawned by this scheduler has exited.
pub(crate) const NOTE_WEXIT: u8 = 1 << 0;
/// A worker delivered something on the completion channel.
pub(crate) const NOTE_ASYNCWORK: u8 = 1 << 1;

static SID_GEN: AtomicU32 = AtomicU32::new(1);

/// Cross-thread face of a scheduler: the atomic notes byte, the shutdown
/// flag, and the poller's waker. A setter's store happens-before its wake,
/// and the owning thread reads notes after returning from poll.
#[derive(Debug)]
pub struct SchedSignal {
    notes: AtomicU8,
    isclosed: AtomicBool,
    waker: Arc<mio::Waker>,
}

impl SchedSignal {
    pub(crate) fn notify(&self, bits: u8) {
        self.notes.fetch_or(bits, Ordering::AcqRel);
        if let Err(e) = self.waker.wake() {
            tracing::warn!(target: "iopoll", error = %e, "waker failed");
        }
    }

    pub(crate) fn request_shutdown(&self) {
        if !self.isclosed.swap(true, Ordering::AcqRel) {
            tracing::debug!(target: "sched", "interrupting iopoll");
            let _unused = self.waker.wake();
        }
    }

    pub(crate) fn is_closed(&self) -> bool { self.isclosed.load(Ordering::Acquire) }
}

/// Cloneable handle for requesting cooperative shutdown from another
/// thread (the seam a signal handler plugs into).
#[derive(Clone, Debug)]
pub struct ShutdownHandle(pub(crate) Arc<SchedSignal>);

impl ShutdownHandle {
    pub fn shutdown(&self) { self.0.request_shutdown(); }

    #[must_use]
    pub fn is_closed(&self) -> bool { self.0.is_closed() }
}

/// Scheduler tunables.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Exit the process when the scheduler is done (`main` semantics).
    pub exit_when_done: bool,
    /// Messages a task inbox accepts from `send` before senders park.
    pub inbox_cap: u32,
    /// Capacity of the async submission/completion channels.
    pub asyncwork_chan_cap: u32,
    /// Upper bound on async worker threads per scheduler.
    pub max_async_workers: u32,
}

impl Default for RunConfig {
    fn default() -> Self {
        RunConfig {
            exit_when_done: true,
            inbox_cap: 64,
            asyncwork_chan_cap: 64,
            max_async_workers: 64,
        }
    }
}

/// What the scheduler run produced.
#[derive(Debug)]
pub struct RunOutcome {
    /// True when the main task died with an error.
    pub exit_err: bool,
    pub main_how: DiedHow,
    /// Final values of the main task (clean exit) or the error value.
    pub main_values: Vec<Value>,
    /// Formatted error text when `exit_err`.
    pub main_error: Option<String>,
}

impl RunOutcome {
    #[must_use]
    pub fn exit_code(&self) -> i32 { i32::from(self.exit_err) }
}

/// Per-OS-thread cooperative scheduler. See the module docs.
#[derive(Debug)]
pub struct Scheduler {
    pub(crate) cfg: RunConfig,
    sid: u32,
    ids: IdPool,
    slots: Vec<Option<Slot>>,
    /// Number of live (not dead) tasks.
    nlive: u32,
    exiterr: bool,
    main_outcome: Option<(DiedHow, Vec<Value>)>,
    main_error: Option<String>,
    signal: Arc<SchedSignal>,
    poller: Poller,
    runq: Fifo<TaskId>,
    /// Task to be run immediately, skipping the run queue.
    runnext: Option<TaskId>,
    timers: TimerHeap,
    /// Workers spawned by this scheduler (user and async).
    workers: Vec<Arc<WorkerShared>>,
    asyncwork_nworkers: u32,
    /// Outstanding async requests (drives worker spawning).
    asyncwork_nreqs: u32,
    sq: Option<Arc<RingChannel<AsyncWorkReq>>>,
    cq: Arc<RingChannel<Completion>>,
    /// Set when this scheduler is the guts of a user worker.
    worker_self: Option<Arc<WorkerShared>>,
}

/// What interpreting one step did.
enum StepOutcome {
    /// The step completed synchronously; resume the body with this value.
    Continue(Resume),
    /// The task parked (or re-queued itself); hand control to the loop.
    Park,
    /// The task exited.
    Finished { how: DiedHow, finals: Vec<Value> },
}

fn step_fail(msg: impl Into<String>) -> StepOutcome {
    StepOutcome::Finished { how: DiedHow::Err, finals: vec![Value::str(msg.into())] }
}

impl Scheduler {
    /// Creates a scheduler for the current thread.
    ///
    /// # Errors
    ///
    /// Fails when the OS poller or the completion channel cannot be set up.
    pub fn new(cfg: RunConfig) -> Result<Scheduler, RtError> {
        Scheduler::build(cfg, None, None)
    }

    pub(crate) fn for_worker(
        cfg: RunConfig,
        shared: Arc<WorkerShared>,
    ) -> Result<Scheduler, RtError> {
        let cq = Arc::clone(&shared.cq);
        Scheduler::build(cfg, Some(cq), Some(shared))
    }

    fn build(
        cfg: RunConfig,
        cq: Option<Arc<RingChannel<Completion>>>,
        worker_self: Option<Arc<WorkerShared>>,
    ) -> Result<Scheduler, RtError> {
        let poller = Poller::new().map_err(RtError::Poller)?;
        let waker = poller.waker();
        // ASYNCWORK starts set so a worker drains messages its parent
        // queued on the completion channel before this thread was ready.
        let signal = Arc::new(SchedSignal {
            notes: AtomicU8::new(NOTE_ASYNCWORK),
            isclosed: AtomicBool::new(false),
            waker,
        });
        let cq = match cq {
            Some(cq) => cq,
            None => Arc::new(RingChannel::with_capacity(cfg.asyncwork_chan_cap)?),
        };
        Ok(Scheduler {
            cfg,
            sid: SID_GEN.fetch_add(1, Ordering::Relaxed),
            ids: IdPool::new(),
            slots: Vec::new(),
            nlive: 0,
            exiterr: false,
            main_outcome: None,
            main_error: None,
            signal,
            poller,
            runq: Fifo::new(8, u32::MAX as usize),
            runnext: None,
            timers: TimerHeap::new(),
            workers: Vec::new(),
            asyncwork_nworkers: 0,
            asyncwork_nreqs: 0,
            sq: None,
            cq,
            worker_self,
        })
    }

    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle { ShutdownHandle(Arc::clone(&self.signal)) }

    pub(crate) fn signal(&self) -> Arc<SchedSignal> { Arc::clone(&self.signal) }

    pub(crate) fn completion_channel(&self) -> Arc<RingChannel<Completion>> {
        Arc::clone(&self.cq)
    }

    pub(crate) fn submission_channel(&self) -> Option<Arc<RingChannel<AsyncWorkReq>>> {
        self.sq.clone()
    }

    pub(crate) fn workers_add(&mut self, w: Arc<WorkerShared>) { self.workers.push(w); }

    /// Number of live (not dead) tasks.
    #[must_use]
    pub fn live_tasks(&self) -> u32 { self.nlive }

    /// Spawns the main task and drives the run loop until all tasks have
    /// finished or shutdown is requested, then tears everything down.
    ///
    /// # Errors
    ///
    /// Unrecoverable poller failures abort the loop (teardown still runs).
    pub fn run(&mut self, main: Box<dyn Coro>) -> Result<RunOutcome, RtError> {
        let main_tid = self.spawn_task(None, main)?;
        debug_assert!(main_tid.is_main(), "main task was not assigned index 1");

        let loop_result = loop {
            if self.signal.is_closed() {
                tracing::debug!(target: "sched", "scheduler shutting down; exiting loop");
                break Ok(());
            }
            match self.find_runnable() {
                Ok(Some(tid)) => self.resume(tid),
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        self.finalize_scheduler();
        loop_result?;

        let (main_how, main_values) =
            self.main_outcome.take().unwrap_or((DiedHow::Stopped, Vec::new()));
        Ok(RunOutcome {
            exit_err: self.exiterr,
            main_how,
            main_values,
            main_error: self.main_error.take(),
        })
    }

    // ———— arena access ————

    fn slot_ref(&self, tid: TaskId) -> Option<&Slot> {
        if tid.scheduler_id() != self.sid {
            return None;
        }
        self.slots.get(tid.index() as usize - 1)?.as_ref()
    }

    fn task_ref(&self, tid: TaskId) -> Option<&Task> {
        match self.slot_ref(tid) {
            Some(Slot::Live(task)) => Some(task),
            _ => None,
        }
    }

    fn task_mut(&mut self, tid: TaskId) -> Option<&mut Task> {
        if tid.scheduler_id() != self.sid {
            return None;
        }
        match self.slots.get_mut(tid.index() as usize - 1)?.as_mut() {
            Some(Slot::Live(task)) => Some(task),
            _ => None,
        }
    }

    // ———— spawning & task tree ————

    pub(crate) fn spawn_task(
        &mut self,
        parent: Option<TaskId>,
        body: Box<dyn Coro>,
    ) -> Result<TaskId, RtError> {
        let idx = self.ids.alloc();
        if parent.is_none() && idx != 1 {
            self.ids.free(idx);
            return Err(RtError::Invalid("main task must be the first task".into()));
        }
        let slot_idx = idx as usize - 1;
        if self.slots.len() <= slot_idx {
            self.slots.resize_with(slot_idx + 1, || None);
        }
        let tid = TaskId::new(self.sid, idx);
        self.slots[slot_idx] = Some(Slot::Live(Task::new(body, parent)));
        self.nlive += 1;
        self.runq_put_runnext(tid);
        if let Some(parent) = parent {
            self.add_child(parent, tid);
            tracing::debug!(target: "sched", parent = %parent, task = %tid, "spawn task");
        } else {
            tracing::debug!(target: "sched", task = %tid, "spawn main task");
        }
        Ok(tid)
    }

    /// `first_child` points at the most recently spawned child; siblings
    /// form a doubly-linked list by id.
    fn add_child(&mut self, parent: TaskId, child: TaskId) {
        let prev_first = self.task_ref(parent).and_then(|t| t.first_child);
        if let Some(pf) = prev_first
            && let Some(t) = self.task_mut(pf)
        {
            t.prev_sibling = Some(child);
        }
        if let Some(t) = self.task_mut(child) {
            t.next_sibling = prev_first;
        }
        if let Some(t) = self.task_mut(parent) {
            t.first_child = Some(child);
        }
    }

    fn remove_child(&mut self, parent: TaskId, child: TaskId) {
        let (child_prev, child_next) = match self.task_ref(child) {
            Some(t) => (t.prev_sibling, t.next_sibling),
            None => return,
        };
        if let Some(t) = self.task_mut(child) {
            t.parent = None;
            t.prev_sibling = None;
            t.next_sibling = None;
        }
        let parent_first = self.task_ref(parent).and_then(|t| t.first_child);
        if parent_first == Some(child) {
            // removing the most recently spawned child
            if let Some(t) = self.task_mut(parent) {
                t.first_child = child_next;
            }
            if let Some(next) = child_next
                && let Some(t) = self.task_mut(next)
            {
                t.prev_sibling = None;
            }
        } else {
            if let Some(prev) = child_prev
                && let Some(t) = self.task_mut(prev)
            {
                t.next_sibling = child_next;
            }
            if let Some(next) = child_next
                && let Some(t) = self.task_mut(next)
            {
                t.prev_sibling = child_prev;
            }
        }
    }

    // ———— run queue ————

    fn runq_put(&mut self, tid: TaskId) {
        if let Some(t) = self.task_mut(tid) {
            debug_assert!(t.status != TaskStatus::Dead);
            t.status = TaskStatus::Ready;
        }
        tracing::trace!(target: "runq", task = %tid, "put");
        let pushed = self.runq.push(tid);
        debug_assert!(pushed, "run queue exhausted");
    }

    fn runq_put_runnext(&mut self, tid: TaskId) {
        tracing::trace!(target: "runq", task = %tid, "put runnext");
        if let Some(prev) = self.runnext.take()
            && prev != tid
        {
            // kick out previous runnext to the queue tail
            self.runq_put(prev);
        }
        if let Some(t) = self.task_mut(tid) {
            t.status = TaskStatus::Ready;
        }
        self.runnext = Some(tid);
    }

    fn runq_get(&mut self) -> Option<TaskId> {
        let tid = self.runnext.take().or_else(|| self.runq.pop())?;
        tracing::trace!(target: "runq", task = %tid, "get");
        Some(tid)
    }

    fn runq_remove(&mut self, tid: TaskId) {
        if self.runnext == Some(tid) {
            self.runnext = None;
            return;
        }
        if self.runq.remove_where(|t| *t == tid).is_none() {
            tracing::debug!(target: "runq", task = %tid, "remove: not found");
        }
    }

    // ———— timers ————

    /// Pops every timer with `when <= now`. Returns a task made runnable by
    /// a timer, if any (it is resumed directly, skipping the run queue).
    fn timers_check(&mut self) -> Option<TaskId> {
        let mut now = Time::now();
        loop {
            let (when, _) = self.timers.peek_min()?;
            if when > now {
                return None;
            }
            let timer = self.timers.remove_min().expect("heap is non-empty");
            match timer.action {
                TimerAction::Wake(tid) => {
                    // sleep timers are one-shot
                    timer.mark_dead();
                    if let Some(t) = self.task_mut(tid) {
                        t.ntimers = t.ntimers.saturating_sub(1);
                        if t.status == TaskStatus::WaitIo {
                            t.staged = Some(Resume::Unit);
                            t.wait = WaitInfo::None;
                            tracing::trace!(target: "sched", task = %tid, "woken by sleep timer");
                            return Some(tid);
                        }
                        tracing::warn!(target: "sched", task = %tid, status = %t.status,
                            "sleep timer fired for task not sleeping");
                    }
                    now = Time::now();
                }
                TimerAction::Inbox(tid) => {
                    let delivered = if let Some(t) = self.task_mut(tid) {
                        let inbox = t.inbox.get_or_insert_with(Inbox::new);
                        if inbox.try_push(InboxMsg::timer(), INBOX_TIMER_CAP) {
                            true
                        } else {
                            tracing::warn!(target: "sched", task = %tid,
                                "inbox is full; dropping timer message");
                            false
                        }
                    } else {
                        false
                    };
                    if timer.period.get() > 0 {
                        // repeating: steady rhythm, even when a wakeup ran late
                        timer.when.set(timer.when.get() + timer.period.get());
                        self.timers.add(timer);
                    } else {
                        timer.mark_dead();
                        if let Some(t) = self.task_mut(tid) {
                            t.ntimers = t.ntimers.saturating_sub(1);
                        }
                    }
                    if delivered
                        && self.task_ref(tid).is_some_and(|t| t.status == TaskStatus::WaitRecv)
                        && let Some(msg) = self.inbox_take(tid)
                    {
                        let t = self.task_mut(tid).expect("receiver is live");
                        t.staged = Some(Resume::Msg(msg));
                        t.wait = WaitInfo::None;
                        return Some(tid);
                    }
                    now = Time::now();
                }
            }
        }
    }

    fn cancel_timers(&mut self, tid: TaskId) {
        let ntimers = self.task_ref(tid).map_or(0, |t| t.ntimers);
        tracing::trace!(target: "sched", task = %tid, count = ntimers, "canceling timers");
        // Linear scan; tasks are not expected to exit with many timers.
        let removed = self.timers.remove_matching(|t| t.action.task() == tid);
        for timer in &removed {
            timer.mark_dead();
        }
        if let Some(t) = self.task_mut(tid) {
            t.ntimers = 0;
        }
    }

    // ———— notes & cross-thread events ————

    fn check_notes(&mut self, notes: u8) {
        if notes & NOTE_WEXIT != 0 {
            self.reap_workers();
        }
        if notes & NOTE_ASYNCWORK != 0 {
            self.drain_cq();
        }
        // Clear the bits with a single CAS; a racing worker that set more
        // bits loses the exchange and the next loop iteration picks them up.
        let _unused = self.signal.notes.compare_exchange(
            notes,
            0,
            Ordering::AcqRel,
            Ordering::Relaxed,
        );
    }

    fn reap_workers(&mut self) {
        let mut i = 0;
        while i < self.workers.len() {
            if self.workers[i].status.load(Ordering::Acquire) == WORKER_CLOSED {
                let w = self.workers.remove(i);
                tracing::debug!(target: "worker", kind = ?w.kind, "worker exited; reaping");
                self.wake_worker_waiters(&w);
                if let Some(handle) = w.thread.lock().unwrap_or_else(|e| e.into_inner()).take() {
                    let _unused = handle.join();
                }
            } else {
                i += 1;
            }
        }
    }

    fn wake_worker_waiters(&mut self, w: &Arc<WorkerShared>) {
        let ok = !w.exiterr.load(Ordering::Acquire);
        let err = w.errdesc.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut chain: SmallVec<[TaskId; 8]> = SmallVec::new();
        let mut cur_idx = w.waiters.swap(0, Ordering::AcqRel);
        while cur_idx != 0 {
            let wtid = TaskId::new(self.sid, cur_idx);
            let Some(t) = self.task_mut(wtid) else { break };
            let next = match std::mem::take(&mut t.wait) {
                WaitInfo::Worker { next_tid, .. } => next_tid,
                other => {
                    t.wait = other;
                    None
                }
            };
            t.staged = Some(Resume::WorkerDone { ok, err: err.clone() });
            chain.push(wtid);
            cur_idx = next.map_or(0, TaskId::index);
        }
        // chain heads are most-recent-first; wake in park order
        chain.reverse();
        for (i, wtid) in chain.into_iter().enumerate() {
            if i == 0 {
                self.runq_put_runnext(wtid);
            } else {
                self.runq_put(wtid);
            }
        }
    }

    fn drain_cq(&mut self) {
        // Many notes may collapse into one wakeup, so a drain can service
        // several completions or none at all; completions are always
        // written before their note, never after.
        loop {
            let completion = match self.cq.try_recv() {
                Ok(c) => c,
                Err(_) => break,
            };
            match completion {
                Completion::Async { tid_idx, result } => {
                    self.asyncwork_nreqs = self.asyncwork_nreqs.saturating_sub(1);
                    let tid = TaskId::new(self.sid, tid_idx);
                    let ready = match self.task_mut(tid) {
                        Some(t) if t.status == TaskStatus::WaitAsync => {
                            t.staged = Some(Resume::Syscall(result));
                            true
                        }
                        _ => {
                            tracing::debug!(target: "sched", task = %tid,
                                "dropping completion for exited task");
                            false
                        }
                    };
                    if ready {
                        tracing::trace!(target: "sched", task = %tid, "woken by asyncwork");
                        self.runq_put(tid);
                    }
                }
                Completion::WorkerMsg { bytes } => self.deliver_worker_msg(&bytes),
            }
        }
    }

    /// Delivers a structurally-cloned cross-worker message to the main
    /// task's inbox. The bound is effectively unlimited here; the only
    /// alternative would be dropping the message.
    fn deliver_worker_msg(&mut self, bytes: &[u8]) {
        let values = match crate::codec::decode(bytes) {
            Ok(values) => values,
            Err(e) => {
                tracing::warn!(target: "worker", error = %e, "dropping undecodable worker message");
                return;
            }
        };
        let main = TaskId::new(self.sid, 1);
        if self.task_ref(main).is_none() {
            tracing::warn!(target: "worker", "ignoring message from worker received during shutdown");
            return;
        }
        {
            let t = self.task_mut(main).expect("main task is live");
            let inbox = t.inbox.get_or_insert_with(Inbox::new);
            let msg = InboxMsg { kind: MsgKind::Msg, sender: MsgSender::Worker, values };
            if !inbox.try_push(msg, usize::MAX) {
                tracing::warn!(target: "worker", "main inbox is full; dropping message");
                return;
            }
        }
        if self.task_ref(main).is_some_and(|t| t.status == TaskStatus::WaitRecv)
            && let Some(msg) = self.inbox_take(main)
        {
            tracing::trace!(target: "sched", "wake main waiting on recv");
            let t = self.task_mut(main).expect("main task is live");
            t.staged = Some(Resume::Msg(msg));
            t.wait = WaitInfo::None;
            self.runq_put_runnext(main);
        }
    }

    // ———— the run loop ————

    /// Services timers, drains notes, then picks the next task from
    /// `runnext` or the run queue head. When nothing is runnable, blocks in
    /// the poller with the timer-heap root as deadline and loops.
    fn find_runnable(&mut self) -> Result<Option<TaskId>, RtError> {
        loop {
            if let Some(tid) = self.timers_check() {
                tracing::trace!(target: "sched", task = %tid, "taken from timers");
                return Ok(Some(tid));
            }

            let notes = self.signal.notes.load(Ordering::Acquire);
            if notes != 0 {
                self.check_notes(notes);
            }

            if let Some(tid) = self.runq_get() {
                return Ok(Some(tid));
            }

            if self.nlive == 0 || self.signal.is_closed() {
                tracing::debug!(target: "sched", nlive = self.nlive, "no more runnable tasks");
                return Ok(None);
            }

            let (deadline, leeway) =
                self.timers.peek_min().map_or((Time::NONE, 0), |(when, leeway)| (when, leeway));
            if deadline.is_none() {
                tracing::trace!(target: "sched", "iopoll (no timeout)");
            } else {
                tracing::trace!(target: "sched",
                    timeout = %format_duration(Time::until(deadline)), "iopoll");
            }

            let mut woken = Vec::new();
            if let Err(e) = self.poller.poll(deadline, leeway, &mut woken) {
                if self.signal.is_closed() {
                    return Ok(None); // ignore I/O errors during shutdown
                }
                tracing::error!(target: "iopoll", error = %e, "internal I/O error");
                return Err(RtError::Poller(e));
            }

            for tid in woken {
                if let Some(t) = self.task_mut(tid)
                    && t.status == TaskStatus::WaitIo
                {
                    tracing::trace!(target: "sched", task = %tid, "woken by iopoll");
                    t.staged = Some(Resume::Io);
                    t.wait = WaitInfo::None;
                    self.runq_put(tid);
                }
            }
        }
    }

    /// Resumes a task body, interpreting its steps until it parks or exits.
    fn resume(&mut self, tid: TaskId) {
        let Some(task) = self.task_mut(tid) else { return };
        let Some(mut body) = task.body.take() else { return };
        task.status = TaskStatus::Running;
        let mut staged_step = task.staged_step.take();
        let mut input = task.staged.take().unwrap_or(Resume::Unit);
        tracing::trace!(target: "sched", task = %tid, "resume");

        loop {
            let step = match staged_step.take() {
                Some(step) => step,
                None => {
                    let mut cx = Ctx { s: self, tid };
                    body.resume(&mut cx, std::mem::replace(&mut input, Resume::Unit))
                }
            };
            match self.process_step(tid, step) {
                StepOutcome::Continue(resume) => input = resume,
                StepOutcome::Park => {
                    if let Some(task) = self.task_mut(tid) {
                        task.body = Some(body);
                    }
                    return;
                }
                StepOutcome::Finished { how, finals } => {
                    drop(body);
                    self.finalize(tid, how, finals, TaskStatus::Running);
                    return;
                }
            }
        }
    }

    fn process_step(&mut self, tid: TaskId, step: Step) -> StepOutcome {
        match step {
            Step::Yield => {
                if let Some(t) = self.task_mut(tid) {
                    t.staged = Some(Resume::Unit);
                }
                self.runq_put(tid);
                StepOutcome::Park
            }

            Step::Sleep { delay, leeway } => self.process_sleep(tid, delay, leeway),

            Step::Recv => {
                if let Some(msg) = self.inbox_take(tid) {
                    return StepOutcome::Continue(Resume::Msg(msg));
                }
                // A receive that provably can never complete is an error
                // rather than a hang.
                let lonely = self.runnext.is_none()
                    && self.runq.is_empty()
                    && self.nlive == 1
                    && self.workers.is_empty();
                let ntimers = self.task_ref(tid).map_or(0, |t| t.ntimers);
                let worker_main = self.worker_self.is_some() && tid.is_main();
                if lonely && ntimers == 0 && !worker_main {
                    return step_fail("deadlock detected: recv would never return");
                }
                if let Some(t) = self.task_mut(tid) {
                    t.status = TaskStatus::WaitRecv;
                }
                StepOutcome::Park
            }

            Step::Send { to, values } => match to {
                SendTarget::Task(dst) => self.process_send_task(tid, dst, values),
                SendTarget::Worker(handle) => Scheduler::process_send_worker(&handle, values),
                SendTarget::Parent => self.process_send_parent(values),
            },

            Step::Spawn(body) => match self.spawn_task(Some(tid), body) {
                Ok(child) => {
                    // the child runs next; the spawner re-queues behind it
                    if let Some(t) = self.task_mut(tid) {
                        t.staged = Some(Resume::Spawned(child));
                    }
                    self.runq_put(tid);
                    StepOutcome::Park
                }
                Err(e) => step_fail(e.to_string()),
            },

            Step::AwaitTask(other) => self.process_await_task(tid, other),

            Step::AwaitWorker(handle) => self.process_await_worker(tid, &handle),

            Step::Syscall(req) => self.process_syscall(tid, req),

            Step::IoWait(handle) => {
                handle.0.borrow_mut().waiter = Some(tid);
                if let Some(t) = self.task_mut(tid) {
                    t.wait = WaitInfo::Io { handle };
                    t.status = TaskStatus::WaitIo;
                }
                StepOutcome::Park
            }

            Step::Return(values) => StepOutcome::Finished { how: DiedHow::Clean, finals: values },

            Step::Fail(err) => StepOutcome::Finished { how: DiedHow::Err, finals: vec![err] },
        }
    }

    fn process_sleep(&mut self, tid: TaskId, delay: DurationNs, leeway: DurationNs) -> StepOutcome {
        if delay < 0 {
            return step_fail("negative timeout");
        }
        if leeway < 0 {
            tracing::trace!(target: "sched", task = %tid,
                delay_ms = delay / MILLISECOND, "sleep");
        } else {
            tracing::trace!(target: "sched", task = %tid,
                delay_ms = delay / MILLISECOND, leeway_ms = leeway / MILLISECOND, "sleep");
        }
        {
            let Some(t) = self.task_mut(tid) else { return StepOutcome::Park };
            let Some(n) = t.ntimers.checked_add(1) else {
                return step_fail("too many concurrent timers");
            };
            t.ntimers = n;
            t.status = TaskStatus::WaitIo;
            t.wait = WaitInfo::None;
        }
        // biased slightly early so a zero delay fires on the next check
        let when = Time::now() + (delay - MICROSECOND);
        self.timers.add(Timer::new(when, 0, leeway, TimerAction::Wake(tid)));
        StepOutcome::Park
    }

    fn process_send_task(&mut self, tid: TaskId, dst: TaskId, values: Vec<Value>) -> StepOutcome {
        if dst.scheduler_id() != self.sid {
            return step_fail("attempt to send to a task of a different scheduler");
        }
        match self.slot_ref(dst) {
            Some(Slot::Live(_)) => {}
            // destination already exited (or never existed)
            _ => return StepOutcome::Continue(Resume::Sent(false)),
        }

        if self.task_ref(dst).is_some_and(|t| t.status == TaskStatus::WaitRecv) {
            // Destination is parked in recv: deliver directly and let it run
            // next. The sender goes through the scheduler rather than
            // switching straight to the receiver, so two tasks cannot hog
            // the loop by ping-ponging send/recv.
            tracing::trace!(target: "sched", task = %tid, dst = %dst, "send directly");
            let msg = InboxMsg { kind: MsgKind::Msg, sender: MsgSender::Task(tid), values };
            {
                let t = self.task_mut(dst).expect("receiver is live");
                t.staged = Some(Resume::Msg(msg));
                t.wait = WaitInfo::None;
            }
            self.runq_put_runnext(dst);
            if let Some(t) = self.task_mut(tid) {
                t.staged = Some(Resume::Sent(true));
            }
            self.runq_put(tid);
            return StepOutcome::Park;
        }

        let cap = self.cfg.inbox_cap as usize;
        let full = {
            let t = self.task_mut(dst).expect("destination is live");
            let inbox = t.inbox.get_or_insert_with(Inbox::new);
            inbox.len() >= cap
        };
        if full {
            // receiver inbox is full; park until there's space, then retry
            tracing::trace!(target: "sched", task = %tid, dst = %dst, "send later (inbox full)");
            let next = {
                let t = self.task_mut(dst).expect("destination is live");
                let inbox = t.inbox.as_mut().expect("inbox exists");
                let next = inbox.send_waiters;
                inbox.send_waiters = Some(tid);
                next
            };
            let t = self.task_mut(tid).expect("sender is live");
            t.wait = WaitInfo::Send { dst, next_tid: next };
            t.status = TaskStatus::WaitSend;
            t.staged_step = Some(Step::Send { to: SendTarget::Task(dst), values });
            return StepOutcome::Park;
        }

        tracing::trace!(target: "sched", task = %tid, dst = %dst, "send buffered");
        let msg = InboxMsg { kind: MsgKind::Msg, sender: MsgSender::Task(tid), values };
        let t = self.task_mut(dst).expect("destination is live");
        let pushed = t.inbox.get_or_insert_with(Inbox::new).try_push(msg, cap);
        debug_assert!(pushed, "inbox admission checked above");
        StepOutcome::Continue(Resume::Sent(true))
    }

    fn process_send_worker(handle: &WorkerHandle, values: Vec<Value>) -> StepOutcome {
        let bytes = match crate::codec::encode(&values) {
            Ok(bytes) => bytes,
            Err(e) => return step_fail(format!("send: {e}")),
        };
        if handle.shared.status.load(Ordering::Acquire) == WORKER_CLOSED {
            return StepOutcome::Continue(Resume::Sent(false));
        }
        match handle.shared.cq.send(Completion::WorkerMsg { bytes }) {
            Ok(()) => {
                if let Some(signal) = handle.shared.own_signal.get() {
                    signal.notify(NOTE_ASYNCWORK);
                }
                // before the worker publishes its signal, the pre-set
                // ASYNCWORK note covers the startup drain
                StepOutcome::Continue(Resume::Sent(true))
            }
            Err(_) => StepOutcome::Continue(Resume::Sent(false)),
        }
    }

    fn process_send_parent(&mut self, values: Vec<Value>) -> StepOutcome {
        let Some(ws) = &self.worker_self else {
            return step_fail("send: not a worker, no parent scheduler");
        };
        let Some(parent_cq) = &ws.parent_cq else {
            return step_fail("send: worker has no parent channel");
        };
        let bytes = match crate::codec::encode(&values) {
            Ok(bytes) => bytes,
            Err(e) => return step_fail(format!("send: {e}")),
        };
        match parent_cq.send(Completion::WorkerMsg { bytes }) {
            Ok(()) => {
                ws.parent_signal.notify(NOTE_ASYNCWORK);
                StepOutcome::Continue(Resume::Sent(true))
            }
            Err(_) => StepOutcome::Continue(Resume::Sent(false)),
        }
    }

    fn process_await_task(&mut self, tid: TaskId, other: TaskId) -> StepOutcome {
        if other == tid {
            return step_fail("attempt to await itself");
        }
        if other.scheduler_id() != self.sid {
            return step_fail("attempt to await a task of a different scheduler");
        }
        match self.slot_ref(other) {
            None => step_fail("await: not a task"),
            // target already exited; return immediately
            Some(Slot::Dead { how, finals }) => {
                StepOutcome::Continue(Resume::TaskDone { how: *how, values: finals.clone() })
            }
            Some(Slot::Live(_)) => {
                debug_assert!(
                    self.task_ref(other).is_some_and(|t| t.status != TaskStatus::Running),
                    "awaited task cannot be running while the caller runs"
                );
                let prev_head = {
                    let o = self.task_mut(other).expect("target is live");
                    let prev = o.waiters;
                    o.waiters = Some(tid);
                    prev
                };
                let t = self.task_mut(tid).expect("caller is live");
                t.wait = WaitInfo::Task { wait_tid: other, next_tid: prev_head };
                t.status = TaskStatus::WaitTask;
                StepOutcome::Park
            }
        }
    }

    fn process_await_worker(&mut self, tid: TaskId, handle: &WorkerHandle) -> StepOutcome {
        if let Some(ws) = &self.worker_self
            && Arc::ptr_eq(ws, &handle.shared)
        {
            return step_fail("attempt to await itself");
        }
        // Join the waiter list first, then check status: only this thread
        // writes the list, so the add can be undone if the worker raced to
        // closed, and a close after the add is observed by the reaper.
        let prev_head_idx = handle.shared.waiters.load(Ordering::Acquire);
        {
            let t = self.task_mut(tid).expect("caller is live");
            t.wait = WaitInfo::Worker {
                worker: Arc::clone(&handle.shared),
                next_tid: (prev_head_idx != 0).then(|| TaskId::new(tid.scheduler_id(), prev_head_idx)),
            };
        }
        handle.shared.waiters.store(tid.index(), Ordering::Release);

        if handle.shared.status.load(Ordering::Acquire) == WORKER_CLOSED {
            handle.shared.waiters.store(prev_head_idx, Ordering::Release);
            let t = self.task_mut(tid).expect("caller is live");
            t.wait = WaitInfo::None;
            let ok = !handle.shared.exiterr.load(Ordering::Acquire);
            let err = handle.shared.errdesc.lock().unwrap_or_else(|e| e.into_inner()).clone();
            return StepOutcome::Continue(Resume::WorkerDone { ok, err });
        }
        if let Some(t) = self.task_mut(tid) {
            t.status = TaskStatus::WaitWorker;
        }
        StepOutcome::Park
    }

    fn process_syscall(&mut self, tid: TaskId, req: crate::worker::SyscallReq) -> StepOutcome {
        let ntimers = self.task_ref(tid).map_or(0, |t| t.ntimers);
        if self.nlive == 1 && ntimers == 0 {
            // the only live task with no timers: nothing else can run, so
            // just block here and skip the worker round trip
            tracing::trace!(target: "sched", task = %tid, "asyncwork immediate");
            return StepOutcome::Continue(Resume::Syscall(crate::worker::async_pool::perform(&req)));
        }
        let sq = match self.asyncwork_prepare() {
            Ok(sq) => sq,
            Err(e) => return step_fail(e.to_string()),
        };
        if sq.send(AsyncWorkReq { tid_idx: tid.index(), req }).is_err() {
            self.asyncwork_nreqs = self.asyncwork_nreqs.saturating_sub(1);
            return step_fail("asyncwork submission queue shut down");
        }
        tracing::trace!(target: "sched", task = %tid, "asyncwork submitted");
        if let Some(t) = self.task_mut(tid) {
            t.status = TaskStatus::WaitAsync;
            t.wait = WaitInfo::None;
        }
        StepOutcome::Park
    }

    fn asyncwork_prepare(&mut self) -> Result<Arc<RingChannel<AsyncWorkReq>>, RtError> {
        self.asyncwork_nreqs += 1;
        if self.sq.is_none() {
            tracing::debug!(target: "sched", cap = self.cfg.asyncwork_chan_cap,
                "creating asyncwork submission queue");
            self.sq = Some(Arc::new(RingChannel::with_capacity(self.cfg.asyncwork_chan_cap)?));
        }
        if self.asyncwork_nreqs > self.asyncwork_nworkers
            && self.asyncwork_nworkers < self.cfg.max_async_workers
        {
            crate::worker::async_pool::spawn_async(self)?;
            self.asyncwork_nworkers += 1;
        }
        Ok(Arc::clone(self.sq.as_ref().expect("submission queue was just created")))
    }

    // ———— inbox & waiter chains ————

    /// Pops the next inbox message; a successful pop frees inbox space, so
    /// any parked senders are woken to retry.
    fn inbox_take(&mut self, tid: TaskId) -> Option<InboxMsg> {
        let (msg, waiters) = {
            let t = self.task_mut(tid)?;
            let inbox = t.inbox.as_mut()?;
            let msg = inbox.pop()?;
            (msg, inbox.send_waiters.take())
        };
        if let Some(head) = waiters {
            self.wake_send_waiters(head);
        }
        Some(msg)
    }

    /// Wakes parked senders in park order; each retries its send (re-staged
    /// step) and may park again.
    fn wake_send_waiters(&mut self, head: TaskId) {
        let mut chain: SmallVec<[TaskId; 8]> = SmallVec::new();
        let mut cur = Some(head);
        while let Some(wtid) = cur {
            let Some(t) = self.task_mut(wtid) else { break };
            let next = match std::mem::take(&mut t.wait) {
                WaitInfo::Send { next_tid, .. } => next_tid,
                other => {
                    t.wait = other;
                    None
                }
            };
            chain.push(wtid);
            cur = next;
        }
        chain.reverse();
        for (i, wtid) in chain.into_iter().enumerate() {
            tracing::trace!(target: "sched", task = %wtid, "wake sender");
            if i == 0 {
                self.runq_put_runnext(wtid);
            } else {
                self.runq_put(wtid);
            }
        }
    }

    /// Wakes everyone awaiting `tid` with the exit outcome.
    fn wake_task_waiters(&mut self, head: TaskId, how: DiedHow, finals: &[Value]) {
        let mut chain: SmallVec<[TaskId; 8]> = SmallVec::new();
        let mut cur = Some(head);
        while let Some(wtid) = cur {
            let Some(t) = self.task_mut(wtid) else { break };
            let next = match std::mem::take(&mut t.wait) {
                WaitInfo::Task { next_tid, .. } => next_tid,
                other => {
                    t.wait = other;
                    None
                }
            };
            t.staged = Some(Resume::TaskDone { how, values: finals.to_vec() });
            chain.push(wtid);
            cur = next;
        }
        chain.reverse();
        for (i, wtid) in chain.into_iter().enumerate() {
            tracing::trace!(target: "sched", task = %wtid, "wake awaiter");
            if i == 0 {
                self.runq_put_runnext(wtid);
            } else {
                self.runq_put(wtid);
            }
        }
    }

    /// Senders parked on the inbox of an exiting task can never deliver;
    /// they resume with a failed send.
    fn fail_send_waiters(&mut self, head: TaskId) {
        let mut chain: SmallVec<[TaskId; 8]> = SmallVec::new();
        let mut cur = Some(head);
        while let Some(wtid) = cur {
            let Some(t) = self.task_mut(wtid) else { break };
            let next = match std::mem::take(&mut t.wait) {
                WaitInfo::Send { next_tid, .. } => next_tid,
                other => {
                    t.wait = other;
                    None
                }
            };
            t.staged_step = None;
            t.staged = Some(Resume::Sent(false));
            chain.push(wtid);
            cur = next;
        }
        chain.reverse();
        for (i, wtid) in chain.into_iter().enumerate() {
            if i == 0 {
                self.runq_put_runnext(wtid);
            } else {
                self.runq_put(wtid);
            }
        }
    }

    /// Removes `tid` from the waiter chain of the task it was awaiting.
    fn unlink_task_waiter(&mut self, tid: TaskId) {
        let (wait_tid, next_tid) = match self.task_ref(tid).map(|t| &t.wait) {
            Some(WaitInfo::Task { wait_tid, next_tid }) => (*wait_tid, *next_tid),
            _ => return,
        };
        let Some(target) = self.task_mut(wait_tid) else { return };
        if target.waiters == Some(tid) {
            target.waiters = next_tid;
            return;
        }
        let mut cur = target.waiters;
        while let Some(wtid) = cur {
            let link = match self.task_ref(wtid).map(|t| &t.wait) {
                Some(WaitInfo::Task { next_tid, .. }) => *next_tid,
                _ => None,
            };
            if link == Some(tid) {
                if let Some(t) = self.task_mut(wtid)
                    && let WaitInfo::Task { next_tid: slot, .. } = &mut t.wait
                {
                    *slot = next_tid;
                }
                return;
            }
            cur = link;
        }
        tracing::debug!(target: "sched", task = %tid, "not found in waiter chain");
    }

    /// Removes `tid` from the waiter chain of the worker it was awaiting.
    /// Only this thread writes the worker's atomic list head, so plain
    /// list surgery is safe here.
    fn unlink_worker_waiter(&mut self, tid: TaskId) {
        let (shared, next_tid) = match self.task_ref(tid).map(|t| &t.wait) {
            Some(WaitInfo::Worker { worker, next_tid }) => (Arc::clone(worker), *next_tid),
            _ => return,
        };
        let next_idx = next_tid.map_or(0, TaskId::index);
        if shared.waiters.load(Ordering::Acquire) == tid.index() {
            shared.waiters.store(next_idx, Ordering::Release);
            return;
        }
        let mut cur_idx = shared.waiters.load(Ordering::Acquire);
        while cur_idx != 0 {
            let wtid = TaskId::new(self.sid, cur_idx);
            let link = match self.task_ref(wtid).map(|t| &t.wait) {
                Some(WaitInfo::Worker { next_tid, .. }) => *next_tid,
                _ => None,
            };
            if link == Some(tid) {
                if let Some(t) = self.task_mut(wtid)
                    && let WaitInfo::Worker { next_tid: slot, .. } = &mut t.wait
                {
                    *slot = next_tid;
                }
                return;
            }
            cur_idx = link.map_or(0, TaskId::index);
        }
    }

    /// Removes `tid` from the send-waiter chain of its destination inbox.
    fn unlink_send_waiter(&mut self, tid: TaskId) {
        let (dst, next_tid) = match self.task_ref(tid).map(|t| &t.wait) {
            Some(WaitInfo::Send { dst, next_tid }) => (*dst, *next_tid),
            _ => return,
        };
        let Some(target) = self.task_mut(dst) else { return };
        let Some(inbox) = target.inbox.as_mut() else { return };
        if inbox.send_waiters == Some(tid) {
            inbox.send_waiters = next_tid;
            return;
        }
        let mut cur = inbox.send_waiters;
        while let Some(wtid) = cur {
            let link = match self.task_ref(wtid).map(|t| &t.wait) {
                Some(WaitInfo::Send { next_tid, .. }) => *next_tid,
                _ => None,
            };
            if link == Some(tid) {
                if let Some(t) = self.task_mut(wtid)
                    && let WaitInfo::Send { next_tid: slot, .. } = &mut t.wait
                {
                    *slot = next_tid;
                }
                return;
            }
            cur = link;
        }
    }

    // ———— teardown ————

    /// Marks a task dead and unwinds everything attached to it: waiting
    /// state, children (depth-first), awaiters, parked senders, timers, and
    /// the parent link. The record of the outcome is retained for `await`.
    fn finalize(&mut self, tid: TaskId, how: DiedHow, finals: Vec<Value>, prev_status: TaskStatus) {
        debug_assert!(prev_status != TaskStatus::Dead);
        tracing::debug!(target: "sched", task = %tid, how = %how, "task exited");

        if how == DiedHow::Err {
            let err_text = format_value(finals.first().unwrap_or(&Value::Nil));
            if tid.is_main() {
                self.exiterr = true;
                self.main_error = Some(err_text.clone());
            }
            let has_waiters = self.task_ref(tid).is_some_and(|t| t.waiters.is_some());
            if has_waiters {
                // the error is delivered through await instead of reported
                tracing::debug!(target: "sched", task = %tid, error = %err_text,
                    "error not reported: a task is awaiting this task");
            } else {
                let worker_awaited = tid.is_main()
                    && self
                        .worker_self
                        .as_ref()
                        .is_some_and(|w| w.waiters.load(Ordering::Acquire) != 0);
                if !worker_awaited {
                    tracing::error!(target: "sched", task = %tid, error = %err_text,
                        "Uncaught error");
                }
                // when awaited via the worker handle, the text is captured
                // at worker-thread exit
            }
        }
        if tid.is_main() && self.main_outcome.is_none() {
            self.main_outcome = Some((how, finals.clone()));
        }

        if let Some(t) = self.task_mut(tid) {
            t.status = TaskStatus::Dead;
        }
        debug_assert!(self.nlive > 0, "nlive underflow");
        self.nlive = self.nlive.saturating_sub(1);

        // cancel the waiting state the task died in
        match prev_status {
            TaskStatus::WaitTask => self.unlink_task_waiter(tid),
            TaskStatus::WaitSend => self.unlink_send_waiter(tid),
            TaskStatus::WaitWorker => self.unlink_worker_waiter(tid),
            TaskStatus::WaitIo => {
                if let Some(t) = self.task_mut(tid)
                    && let WaitInfo::Io { handle } = std::mem::take(&mut t.wait)
                {
                    handle.0.borrow_mut().waiter = None;
                }
            }
            _ => {}
        }

        // stop child tasks, most recently spawned last
        if let Some(first_child) = self.task_ref(tid).and_then(|t| t.first_child) {
            self.stop_recursive(first_child);
        }

        // wake tasks awaiting this task, fail senders parked on its inbox
        if let Some(head) = self.task_mut(tid).and_then(|t| t.waiters.take()) {
            self.wake_task_waiters(head, how, &finals);
        }
        if let Some(head) =
            self.task_mut(tid).and_then(|t| t.inbox.as_mut().and_then(|i| i.send_waiters.take()))
        {
            self.fail_send_waiters(head);
        }

        // stop still-running timers (skipped when the scheduler is closing;
        // the whole heap is cleared there)
        let ntimers = self.task_ref(tid).map_or(0, |t| t.ntimers);
        if ntimers > 0 && !self.signal.is_closed() {
            self.cancel_timers(tid);
        }

        if let Some(parent) = self.task_ref(tid).and_then(|t| t.parent) {
            self.remove_child(parent, tid);
        }

        self.slots[tid.index() as usize - 1] = Some(Slot::Dead { how, finals });
    }

    /// Depth-first stop: later siblings first, then children, then the
    /// task itself.
    fn stop_recursive(&mut self, child: TaskId) {
        if let Some(next) = self.task_ref(child).and_then(|t| t.next_sibling) {
            self.stop_recursive(next);
        }
        if let Some(grandchild) = self.task_ref(child).and_then(|t| t.first_child) {
            self.stop_recursive(grandchild);
        }
        self.stop_task(child);
    }

    /// Stops one task: runs its scoped cleanup hook, removes it from the
    /// run queue, and finalizes it as stopped.
    fn stop_task(&mut self, tid: TaskId) {
        let (prev, body) = {
            let Some(t) = self.task_mut(tid) else { return };
            let prev = t.status;
            // dead before cleanup runs, so hooks observe a stopped task
            t.status = TaskStatus::Dead;
            t.staged_step = None;
            (prev, t.body.take())
        };
        tracing::debug!(target: "sched", task = %tid, "stop");
        if let Some(mut body) = body {
            body.on_stop();
            drop(body);
        }
        if prev == TaskStatus::Ready && !self.signal.is_closed() {
            self.runq_remove(tid);
        }
        self.finalize(tid, DiedHow::Stopped, Vec::new(), prev);
    }

    /// Scheduler teardown: stop the main task (cascades), clear timers,
    /// shut down the async channels, close every worker and join their
    /// threads.
    fn finalize_scheduler(&mut self) {
        tracing::debug!(target: "sched", "finalize scheduler");
        self.signal.isclosed.store(true, Ordering::Release);

        let main = TaskId::new(self.sid, 1);
        if self.task_ref(main).is_some() {
            self.stop_task(main);
        }

        self.timers.clear();

        if let Some(sq) = &self.sq {
            sq.shutdown();
        }
        self.cq.shutdown();

        let workers: Vec<Arc<WorkerShared>> = self.workers.drain(..).collect();
        for w in &workers {
            crate::worker::user::close_worker(w);
        }
        for w in workers {
            if let Some(handle) = w.thread.lock().unwrap_or_else(|e| e.into_inner()).take()
                && handle.join().is_err()
            {
                tracing::warn!(target: "worker", "failed to join worker thread");
            }
        }
        tracing::debug!(target: "sched", "finalized");
    }
}

// ———— the synchronous task-facing surface ————

/// Shared handle to a scheduled timer. The heap holds its own reference
/// while the timer is scheduled; dropping the handle never cancels a
/// queued timer, and stopping a timer never invalidates the handle.
#[derive(Clone, Debug)]
pub struct TimerHandle(pub(crate) Rc<Timer>);

impl TimerHandle {
    /// True when the timer is not currently scheduled.
    #[must_use]
    pub fn is_expired(&self) -> bool { self.0.is_dead() }
}

/// Handed to a task body for the duration of its time slice; exposes the
/// operations that complete synchronously (suspending operations are
/// [`Step`]s).
pub struct Ctx<'s> {
    pub(crate) s: &'s mut Scheduler,
    pub(crate) tid: TaskId,
}

impl std::fmt::Debug for Ctx<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ctx({})", self.tid)
    }
}

impl Ctx<'_> {
    #[must_use]
    pub fn task_id(&self) -> TaskId { self.tid }

    /// Current monotonic clock value.
    #[must_use]
    pub fn monotime(&self) -> Time { Time::now() }

    /// Starts a timer that posts a message to this task's inbox at `when`
    /// (repeating every `period` when `period > 0`).
    ///
    /// # Errors
    ///
    /// Fails when the task's timer count would overflow.
    pub fn timer_start(
        &mut self,
        when: Time,
        period: DurationNs,
        leeway: DurationNs,
    ) -> Result<TimerHandle, RtError> {
        let t = self
            .s
            .task_mut(self.tid)
            .ok_or_else(|| RtError::Invalid("no such task".into()))?;
        t.ntimers = t
            .ntimers
            .checked_add(1)
            .ok_or_else(|| RtError::Invalid("too many concurrent timers".into()))?;
        let timer = Timer::new(when, period, leeway, TimerAction::Inbox(self.tid));
        self.s.timers.add(Rc::clone(&timer));
        Ok(TimerHandle(timer))
    }

    /// Re-arms a timer with new parameters. Works on both scheduled timers
    /// (re-sifted to their new heap position) and expired ones (scheduled
    /// afresh, like `timer_start`).
    ///
    /// # Errors
    ///
    /// Fails when re-arming an expired timer would overflow the owning
    /// task's timer count.
    pub fn timer_update(
        &mut self,
        handle: &TimerHandle,
        when: Time,
        period: DurationNs,
        leeway: DurationNs,
    ) -> Result<(), RtError> {
        let timer = &handle.0;
        let owner = timer.action.task();
        if !timer.is_dead() {
            // still scheduled: remove and re-add to uphold heap order
            self.s.timers.remove(timer);
            timer.when.set(when);
            timer.period.set(period);
            timer.leeway.set(leeway);
            self.s.timers.add(Rc::clone(timer));
        } else {
            timer.when.set(when);
            timer.period.set(period);
            timer.leeway.set(leeway);
            let t = self
                .s
                .task_mut(owner)
                .ok_or_else(|| RtError::Invalid("timer owner exited".into()))?;
            t.ntimers = t
                .ntimers
                .checked_add(1)
                .ok_or_else(|| RtError::Invalid("too many concurrent timers".into()))?;
            self.s.timers.add(Rc::clone(timer));
        }
        Ok(())
    }

    /// Removes a timer from the heap. A no-op on expired timers.
    pub fn timer_stop(&mut self, handle: &TimerHandle) {
        if handle.0.is_dead() {
            return;
        }
        self.s.timers.remove(&handle.0);
        handle.0.mark_dead();
        let owner = handle.0.action.task();
        if let Some(t) = self.s.task_mut(owner) {
            t.ntimers = t.ntimers.saturating_sub(1);
        }
    }

    /// Starts a parallel OS thread hosting its own scheduler; `factory`
    /// runs on that thread to build the worker's main task body.
    ///
    /// # Errors
    ///
    /// Fails when the thread or the worker's channels cannot be created.
    pub fn spawn_worker<F>(&mut self, factory: F) -> Result<WorkerHandle, RtError>
    where
        F: FnOnce() -> Box<dyn Coro> + Send + 'static,
    {
        crate::worker::user::spawn_user(self.s, factory)
    }

    // ———— I/O ————

    /// Creates a non-blocking TCP socket registered with the poller.
    ///
    /// # Errors
    ///
    /// Propagates socket creation / registration failure.
    pub fn tcp_socket(&mut self) -> Result<IoHandle, RtError> {
        use rustix::net::{AddressFamily, SocketFlags, SocketType, socket_with};
        let fd = socket_with(
            AddressFamily::INET,
            SocketType::STREAM,
            SocketFlags::NONBLOCK | SocketFlags::CLOEXEC,
            None,
        )?;
        self.wrap_fd(fd)
    }

    /// Registers an arbitrary (non-blocking) fd with the poller.
    ///
    /// # Errors
    ///
    /// Propagates registration failure.
    pub fn wrap_fd(&mut self, fd: OwnedFd) -> Result<IoHandle, RtError> {
        let handle = IoHandle::new(fd);
        self.s.poller.register(&handle).map_err(|e| RtError::from_io(&e))?;
        Ok(handle)
    }

    /// Creates a non-blocking pipe pair, both ends registered.
    ///
    /// # Errors
    ///
    /// Propagates pipe creation / registration failure.
    pub fn pipe(&mut self) -> Result<(IoHandle, IoHandle), RtError> {
        use rustix::pipe::{PipeFlags, pipe_with};
        let (rx, tx) = pipe_with(PipeFlags::NONBLOCK | PipeFlags::CLOEXEC)?;
        Ok((self.wrap_fd(rx)?, self.wrap_fd(tx)?))
    }

    /// Initiates a connect. [`IoProgress::WouldBlock`] means the caller
    /// should return [`Step::IoWait`] and re-check on wake.
    ///
    /// # Errors
    ///
    /// Propagates immediate connect failure.
    pub fn connect(
        &mut self,
        handle: &IoHandle,
        addr: std::net::SocketAddr,
    ) -> Result<IoProgress, RtError> {
        let d = handle.0.borrow();
        match rustix::net::connect(&d.fd, &addr) {
            Ok(()) => Ok(IoProgress::Done(0)),
            Err(rustix::io::Errno::INPROGRESS) => Ok(IoProgress::WouldBlock),
            Err(e) => Err(e.into()),
        }
    }

    /// Checks a descriptor for a connect/readiness error reported by the
    /// poller.
    ///
    /// # Errors
    ///
    /// Surfaces the `-errno` recorded in the descriptor.
    pub fn io_result(&self, handle: &IoHandle) -> Result<(), RtError> {
        let d = handle.0.borrow();
        if d.nread < 0 {
            return Err(RtError::from_errno(i32::try_from(-d.nread).unwrap_or(0)));
        }
        if d.nwrite < 0 {
            return Err(RtError::from_errno(i32::try_from(-d.nwrite).unwrap_or(0)));
        }
        Ok(())
    }

    /// Reads up to `limit` bytes (0 = everything available) into `buf`.
    /// [`IoProgress::WouldBlock`] means park with [`Step::IoWait`].
    ///
    /// # Errors
    ///
    /// Surfaces descriptor errors and read failures.
    pub fn read(
        &mut self,
        handle: &IoHandle,
        buf: &mut Vec<u8>,
        limit: usize,
    ) -> Result<IoProgress, RtError> {
        let mut d = handle.0.borrow_mut();
        if d.nread < 0 {
            return Err(RtError::from_errno(i32::try_from(-d.nread).unwrap_or(0)));
        }
        if d.nread == 0 {
            if d.events & EV_EOF != 0 {
                return Ok(IoProgress::Eof);
            }
            return Ok(IoProgress::WouldBlock);
        }
        let avail = usize::try_from(d.nread).unwrap_or(usize::MAX);
        let want = if limit == 0 { avail } else { limit.min(avail) };
        let start = buf.len();
        buf.resize(start + want, 0);
        match rustix::io::read(&d.fd, &mut buf[start..]) {
            Ok(n) => {
                buf.truncate(start + n);
                if n == 0 {
                    d.nread = 0;
                    Ok(IoProgress::Eof)
                } else {
                    d.nread -= i64::try_from(n).unwrap_or(0).min(d.nread);
                    Ok(IoProgress::Done(n))
                }
            }
            Err(rustix::io::Errno::AGAIN) => {
                buf.truncate(start);
                Ok(IoProgress::WouldBlock)
            }
            Err(e) => {
                buf.truncate(start);
                Err(e.into())
            }
        }
    }

    /// Writes `data`; short writes and [`IoProgress::WouldBlock`] are the
    /// caller's signal to park and retry.
    ///
    /// # Errors
    ///
    /// Surfaces write failures.
    pub fn write(&mut self, handle: &IoHandle, data: &[u8]) -> Result<IoProgress, RtError> {
        let mut d = handle.0.borrow_mut();
        match rustix::io::write(&d.fd, data) {
            Ok(n) => Ok(IoProgress::Done(n)),
            Err(rustix::io::Errno::AGAIN) => {
                d.nwrite = 0;
                Ok(IoProgress::WouldBlock)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Deregisters the descriptor from the poller; the fd closes when the
    /// last handle drops.
    pub fn close_io(&mut self, handle: &IoHandle) {
        self.s.poller.deregister(handle);
        handle.0.borrow_mut().waiter = None;
    }

    /// Structural-clone encode (for explicit cross-worker payloads).
    ///
    /// # Errors
    ///
    /// See [`crate::codec::encode`].
    pub fn encode(&self, values: &[Value]) -> Result<Vec<u8>, RtError> {
        Ok(crate::codec::encode(values)?)
    }

    /// Structural-clone decode.
    ///
    /// # Errors
    ///
    /// See [`crate::codec::decode`].
    pub fn decode(&self, bytes: &[u8]) -> Result<Vec<Value>, RtError> {
        Ok(crate::codec::decode(bytes)?)
    }
}

/// Creates a scheduler on the current thread and runs `main` to completion.
///
/// # Errors
///
/// Scheduler construction or unrecoverable poller failures.
pub fn run_main(cfg: RunConfig, main: Box<dyn Coro>) -> Result<RunOutcome, RtError> {
    let mut s = Scheduler::new(cfg)?;
    s.run(main)
}

/// The `main(fn, exit_when_done)` entry point: runs the scheduler and, when
/// `cfg.exit_when_done`, exits the process with 0 on clean main-task
/// termination and non-zero when the main task died with an error.
///
/// # Errors
///
/// Scheduler construction or unrecoverable poller failures (only reachable
/// when `exit_when_done` is false).
pub fn main_with(cfg: RunConfig, main: Box<dyn Coro>) -> Result<RunOutcome, RtError> {
    let exit_when_done = cfg.exit_when_done;
    let outcome = run_main(cfg, main);
    if exit_when_done {
        match outcome {
            Ok(out) => std::process::exit(out.exit_code()),
            Err(e) => {
                tracing::error!(target: "sched", error = %e, "runtime failed");
                std::process::exit(1)
            }
        }
    }
    outcome
}
