// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Per-task bounded message queue.
//!
//! The bound is enforced per delivery source: plain `send` respects the
//! configured inbox capacity (a full inbox parks the sender), timer
//! messages get generous headroom (dropped with a warning beyond it), and
//! cross-worker messages are effectively unbounded (the only alternative
//! would be dropping them).

use crate::codec::Value;
use crate::core::fifo::Fifo;
use crate::sched::task::TaskId;

/// Headroom for timer messages beyond the configured send capacity.
pub(crate) const INBOX_TIMER_CAP: usize = 0xffff;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum_macros::Display)]
pub enum MsgKind {
    /// A timer rang.
    Timer,
    /// Message via `send`, with payload.
    Msg,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MsgSender {
    /// No sender (timer messages).
    None,
    Task(TaskId),
    /// Delivered across a worker boundary.
    Worker,
}

#[derive(Debug)]
pub struct InboxMsg {
    pub kind: MsgKind,
    pub sender: MsgSender,
    pub values: Vec<Value>,
}

impl InboxMsg {
    #[must_use]
    pub(crate) fn timer() -> InboxMsg {
        InboxMsg { kind: MsgKind::Timer, sender: MsgSender::None, values: Vec::new() }
    }
}

#[derive(Debug)]
pub(crate) struct Inbox {
    fifo: Fifo<InboxMsg>,
    /// Chain of tasks blocked trying to send to this inbox.
    pub send_waiters: Option<TaskId>,
}

impl Inbox {
    pub(crate) fn new() -> Inbox {
        Inbox { fifo: Fifo::new(8, u32::MAX as usize), send_waiters: None }
    }

    /// Enqueues unless the queue already holds `cap_limit` messages.
    pub(crate) fn try_push(&mut self, msg: InboxMsg, cap_limit: usize) -> bool {
        if self.fifo.len() >= cap_limit {
            return false;
        }
        self.fifo.push(msg)
    }

    pub(crate) fn pop(&mut self) -> Option<InboxMsg> { self.fifo.pop() }

    pub(crate) fn len(&self) -> usize { self.fifo.len() }
}
