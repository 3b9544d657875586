// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words structclone errno

//! Error taxonomy of the runtime.
//!
//! [`ErrCode`] is the numeric code set exported to embedders (and through
//! them to scripts). Native `errno` values map onto these symbolic codes
//! where a mapping exists; unknown codes map to [`ErrCode::Error`].

use rustix::io::Errno;

use crate::codec::CodecError;

/// Symbolic error codes. The discriminants are stable and exported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, strum_macros::Display)]
#[repr(u8)]
pub enum ErrCode {
    /// no error
    Ok = 0,
    /// invalid data or argument
    Invalid,
    /// result out of range
    Range,
    /// invalid input
    Input,
    /// invalid syscall op or syscall op data
    Sysop,
    /// invalid file descriptor
    BadFd,
    /// invalid or misformed name
    BadName,
    /// resource not found
    NotFound,
    /// name too long
    NameTooLong,
    /// operation canceled
    Canceled,
    /// not supported
    NotSupported,
    /// already exists
    Exists,
    /// end of resource
    End,
    /// permission denied
    Access,
    /// cannot allocate memory
    NoMem,
    /// bad memory address
    MFault,
    /// value too large
    Overflow,
    /// read-only
    ReadOnly,
    /// I/O error
    Io,
    /// not a directory
    NotDir,
    /// is a directory
    IsDir,
    /// unspecified error
    Error = 0xff,
}

impl ErrCode {
    /// Maps a raw OS `errno` value to a symbolic code. Goes through
    /// [`rustix::io::Errno`] so the constants carry each platform's actual
    /// values (they differ between Linux and the BSDs/macOS).
    #[must_use]
    pub fn from_errno(errno: i32) -> ErrCode {
        if errno == 0 {
            return ErrCode::Ok;
        }
        ErrCode::from_rustix_errno(Errno::from_raw_os_error(errno))
    }

    /// Maps a platform errno to a symbolic code; unmapped values become
    /// [`ErrCode::Error`].
    #[must_use]
    pub fn from_rustix_errno(errno: Errno) -> ErrCode {
        match errno {
            Errno::INVAL => ErrCode::Invalid,
            Errno::RANGE => ErrCode::Range,
            Errno::BADF => ErrCode::BadFd,
            Errno::NOENT => ErrCode::NotFound,
            Errno::NAMETOOLONG => ErrCode::NameTooLong,
            Errno::CANCELED => ErrCode::Canceled,
            Errno::NOTSUP => ErrCode::NotSupported,
            Errno::EXIST => ErrCode::Exists,
            Errno::ACCESS => ErrCode::Access,
            Errno::NOMEM => ErrCode::NoMem,
            Errno::FAULT => ErrCode::MFault,
            Errno::OVERFLOW => ErrCode::Overflow,
            Errno::ROFS => ErrCode::ReadOnly,
            Errno::IO => ErrCode::Io,
            Errno::NOTDIR => ErrCode::NotDir,
            Errno::ISDIR => ErrCode::IsDir,
            _ => ErrCode::Error,
        }
    }

    #[must_use]
    pub fn description(self) -> &'static str {
        match self {
            ErrCode::Ok => "no error",
            ErrCode::Invalid => "invalid data or argument",
            ErrCode::Range => "result out of range",
            ErrCode::Input => "invalid input",
            ErrCode::Sysop => "invalid syscall op or syscall op data",
            ErrCode::BadFd => "invalid file descriptor",
            ErrCode::BadName => "invalid or misformed name",
            ErrCode::NotFound => "resource not found",
            ErrCode::NameTooLong => "name too long",
            ErrCode::Canceled => "operation canceled",
            ErrCode::NotSupported => "not supported",
            ErrCode::Exists => "already exists",
            ErrCode::End => "end of resource",
            ErrCode::Access => "permission denied",
            ErrCode::NoMem => "cannot allocate memory",
            ErrCode::MFault => "bad memory address",
            ErrCode::Overflow => "value too large",
            ErrCode::ReadOnly => "read-only",
            ErrCode::Io => "I/O error",
            ErrCode::NotDir => "not a directory",
            ErrCode::IsDir => "is a directory",
            ErrCode::Error => "unspecified error",
        }
    }
}

/// Channel open failure.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum ChanError {
    #[error("channel capacity {cap} is invalid (must be a power of two ≥ 2)")]
    #[diagnostic(
        code(skein::chan::invalid_capacity),
        help("The ring uses a bit mask for slot indexing, so capacity must be a power of two.")
    )]
    InvalidCapacity { cap: u32 },
}

/// Errors surfaced by runtime operations to the calling task or embedder.
#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum RtError {
    /// An OS-level operation failed.
    #[error("{}: {errno}", .code.description())]
    #[diagnostic(code(skein::rt::os))]
    Os { code: ErrCode, errno: i32 },

    /// Bad argument or state for a runtime operation.
    #[error("{0}")]
    #[diagnostic(code(skein::rt::invalid))]
    Invalid(String),

    /// The operation can provably never complete.
    #[error("deadlock detected: {0}")]
    #[diagnostic(
        code(skein::rt::deadlock),
        help(
            "The calling task is the only live task with no timers, workers \
             or pending I/O, so nothing can ever wake it."
        )
    )]
    Deadlock(&'static str),

    /// A cross-thread channel was shut down underneath the operation.
    #[error("operation canceled: channel shut down")]
    #[diagnostic(code(skein::rt::canceled))]
    Canceled,

    /// Structural clone encode/decode failure.
    #[error(transparent)]
    #[diagnostic(code(skein::rt::codec))]
    Codec(#[from] CodecError),

    /// `std::thread::Builder::spawn()` failed.
    #[error("failed to spawn worker thread")]
    #[diagnostic(
        code(skein::rt::thread_spawn),
        help(
            "The system may have reached its thread limit - check `ulimit -u` \
             for the per-user limit."
        )
    )]
    ThreadSpawn(#[source] std::io::Error),

    /// Poller setup or polling failed unrecoverably.
    #[error("I/O poller error")]
    #[diagnostic(
        code(skein::rt::iopoll),
        help("Check OS resource limits - use `ulimit -n` for file descriptors.")
    )]
    Poller(#[source] std::io::Error),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Chan(#[from] ChanError),
}

impl RtError {
    /// Symbolic code for exporting to an embedder.
    #[must_use]
    pub fn code(&self) -> ErrCode {
        match self {
            RtError::Os { code, .. } => *code,
            RtError::Invalid(_) => ErrCode::Invalid,
            RtError::Deadlock(_) => ErrCode::Error,
            RtError::Canceled => ErrCode::Canceled,
            RtError::Codec(e) => e.code(),
            RtError::ThreadSpawn(_) | RtError::Poller(_) => ErrCode::Io,
            RtError::Chan(_) => ErrCode::Invalid,
        }
    }

    /// Builds an [`RtError::Os`] from a raw errno.
    #[must_use]
    pub fn from_errno(errno: i32) -> RtError {
        RtError::Os { code: ErrCode::from_errno(errno), errno }
    }

    /// Builds an [`RtError::Os`] from an [`std::io::Error`].
    #[must_use]
    pub fn from_io(err: &std::io::Error) -> RtError {
        RtError::from_errno(err.raw_os_error().unwrap_or(0))
    }
}

impl From<Errno> for RtError {
    fn from(errno: Errno) -> Self {
        RtError::Os { code: ErrCode::from_rustix_errno(errno), errno: errno.raw_os_error() }
    }
}
