// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words structclone runq runnext iopoll kqueue epoll

//! # skein
//!
//! An embeddable cooperative task runtime: the concurrency substrate a
//! dynamically-typed scripting layer sits on. User code spawns lightweight
//! *tasks* which communicate by message passing, wait on timers, perform
//! asynchronous I/O, and offload blocking syscalls to a worker pool.
//! Independent OS threads can each host their own runtime instance
//! (*workers*), exchanging values via a structurally-cloned serialization
//! format.
//!
//! The moving parts:
//!
//! - [`core::RingChannel`] - bounded lock-free MPMC FIFO between OS threads.
//! - [`sched::Scheduler`] - per-thread cooperative scheduler owning a run
//!   queue, timer heap, task registry and I/O poller.
//! - [`sched::Coro`] / [`sched::Step`] / [`sched::Resume`] - the
//!   explicit-continuation task-body seam.
//! - [`io::Poller`] - epoll/kqueue readiness polling (via mio) with a
//!   cross-thread interrupt.
//! - [`worker`] - user workers (parallel schedulers) and async workers
//!   (blocking syscalls).
//! - [`codec`] - dynamically-typed [`codec::Value`]s and the
//!   structural-clone byte codec that ferries them across threads.
//!
//! ## A tiny program
//!
//! ```
//! use skein::{RunConfig, Resume, Step, run_main, task_fn};
//!
//! let outcome = run_main(
//!     RunConfig { exit_when_done: false, ..RunConfig::default() },
//!     task_fn(|_cx, input| match input {
//!         Resume::Start => Step::Sleep { delay: 1_000_000, leeway: -1 },
//!         _ => Step::Return(vec![skein::Value::Int(42)]),
//!     }),
//! )
//! .expect("runtime");
//! assert!(!outcome.exit_err);
//! ```

// Attach sources.
pub mod codec;
pub mod core;
pub mod error;
pub mod io;
pub mod sched;
pub mod worker;

// Re-export the embedder-facing surface. (`crate::` paths keep the local
// `core` module from colliding with the `core` crate in the extern prelude.)
pub use crate::codec::{DictKey, Value, decode, encode, format_value};
pub use crate::core::time;
pub use crate::core::time::{DurationNs, Time};
pub use crate::core::{Fifo, IdPool, RingChannel, TimerHeap};
pub use error::{ChanError, ErrCode, RtError};
pub use io::{IoHandle, IoProgress};
pub use sched::{
    Coro, Ctx, DiedHow, InboxMsg, MsgKind, MsgSender, Resume, RunConfig, RunOutcome, Scheduler,
    SendTarget, ShutdownHandle, Step, TaskId, TaskStatus, TimerHandle, main_with, run_main,
    task_fn,
};
pub use worker::{SyscallReq, SyscallResult, WorkerHandle};
