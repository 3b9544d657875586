// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Cross-thread workers: user workers (parallel schedulers) and the async
//! worker pool for blocking syscalls.

// Attach sources.
pub mod async_pool;
pub mod user;

// Re-export.
pub use async_pool::{SyscallReq, SyscallResult};
pub use user::WorkerHandle;
