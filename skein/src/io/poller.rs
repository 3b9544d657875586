// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words FIONREAD fionread epoll kqueue iopoll

//! Platform I/O facility: wraps [`mio::Poll`] (epoll on Linux, kqueue on
//! macOS) behind the single entry point [`Poller::poll`], which blocks until
//! a registered fd becomes ready, an explicit interrupt is delivered via
//! [`mio::Waker`], or the deadline passes.
//!
//! Registration is edge-triggered for both read and write interest. Each
//! registration is stamped with a sequence number encoded into the
//! [`Token`]; events for a deregistered (or re-registered) fd carry a stale
//! token that no longer resolves, and are dropped.
//!
//! Deadline handling:
//! - [`Time::NONE`]: block forever.
//! - deadline zero or already past: non-blocking.
//! - otherwise: relative timeout until the deadline. A positive leeway
//!   widens the timeout (permission to coalesce); the host facility has no
//!   absolute-timer precision knob, so leeway ≤ 0 simply means the tight
//!   timeout.

use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use rustc_hash::FxHashMap;

use crate::core::time::{DurationNs, Time};
use crate::io::descriptor::{EV_EOF, EV_READ, EV_WRITE, IoHandle};
use crate::sched::TaskId;

/// Sentinel token for the cross-thread interrupt event.
const WAKER_TOKEN: Token = Token(usize::MAX);

#[derive(Debug)]
pub struct Poller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
    seq: u32,
    registered: FxHashMap<Token, IoHandle>,
}

impl Poller {
    /// # Errors
    ///
    /// Propagates OS failure to create the poll instance or the waker.
    pub fn new() -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        Ok(Poller {
            poll,
            events: Events::with_capacity(128),
            waker,
            seq: 0,
            registered: FxHashMap::default(),
        })
    }

    /// The cross-thread interrupt handle. A wake forces a blocked
    /// [`Poller::poll`] to return; used for shutdown and notes delivery
    /// from workers.
    #[must_use]
    pub fn waker(&self) -> Arc<Waker> { Arc::clone(&self.waker) }

    /// Registers `handle` in edge-triggered mode for both read and write.
    ///
    /// # Errors
    ///
    /// Propagates registration failure from the OS facility.
    pub fn register(&mut self, handle: &IoHandle) -> io::Result<()> {
        self.seq = self.seq.wrapping_add(1);
        let token = {
            let mut d = handle.0.borrow_mut();
            d.seq = self.seq;
            Self::token_for(d.fd.as_raw_fd(), d.seq)
        };
        let raw = handle.raw_fd();
        self.poll.registry().register(
            &mut SourceFd(&raw),
            token,
            Interest::READABLE | Interest::WRITABLE,
        )?;
        self.registered.insert(token, handle.clone());
        tracing::trace!(target: "iopoll", fd = raw, seq = self.seq, "register");
        Ok(())
    }

    /// Drops the registration. Implicit kernel-side removal on fd close
    /// still happens; this also invalidates the token so late events are
    /// ignored.
    pub fn deregister(&mut self, handle: &IoHandle) {
        let (token, raw) = {
            let d = handle.0.borrow();
            (Self::token_for(d.fd.as_raw_fd(), d.seq), d.fd.as_raw_fd())
        };
        if self.registered.remove(&token).is_some() {
            let _unused = self.poll.registry().deregister(&mut SourceFd(&raw));
            tracing::trace!(target: "iopoll", fd = raw, "deregister");
        }
    }

    /// Blocks until readiness, interrupt, or deadline. For each woken
    /// descriptor, updates its readiness fields and appends the parked task
    /// (if any) to `woken`. Returns the number of events handled; 0 on
    /// timeout or `EINTR`.
    ///
    /// # Errors
    ///
    /// Propagates unrecoverable poll failures.
    pub fn poll(
        &mut self,
        deadline: Time,
        leeway: DurationNs,
        woken: &mut Vec<TaskId>,
    ) -> io::Result<usize> {
        let timeout = if deadline.is_none() {
            None
        } else {
            let mut until = Time::until(deadline).max(0);
            if leeway > 0 {
                until = until.saturating_add(leeway);
            }
            Some(Duration::from_nanos(until as u64))
        };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
        }

        let mut count = 0usize;
        for ev in self.events.iter() {
            count += 1;
            if ev.token() == WAKER_TOKEN {
                tracing::trace!(target: "iopoll", "interrupt");
                continue;
            }
            let Some(handle) = self.registered.get(&ev.token()) else {
                continue; // stale seq
            };
            let mut d = handle.0.borrow_mut();
            if ev.is_readable() || ev.is_read_closed() {
                d.events |= EV_READ;
                d.nread = match rustix::io::ioctl_fionread(&d.fd) {
                    Ok(n) => i64::try_from(n).unwrap_or(i64::MAX),
                    Err(errno) => -i64::from(errno.raw_os_error()),
                };
            }
            if ev.is_writable() {
                d.events |= EV_WRITE;
                d.nwrite = 1;
            }
            if ev.is_read_closed() || ev.is_write_closed() {
                d.events |= EV_EOF;
            }
            if let Some(tid) = d.waiter.take() {
                woken.push(tid);
            }
        }
        Ok(count)
    }

    fn token_for(fd: i32, seq: u32) -> Token {
        Token(((fd as u32) as usize) | ((seq as usize) << 32))
    }
}
