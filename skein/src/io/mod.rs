// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! The I/O poll layer: descriptors and the platform poller.

// Attach sources.
pub mod descriptor;
pub mod poller;

// Re-export.
pub use descriptor::*;
pub use poller::*;

/// Outcome of a non-blocking I/O attempt. `WouldBlock` is the caller's cue
/// to park with [`Step::IoWait`](crate::sched::Step::IoWait).
#[derive(Debug, PartialEq, Eq)]
pub enum IoProgress {
    WouldBlock,
    Eof,
    /// Bytes transferred (0 for a completed connect).
    Done(usize),
}
