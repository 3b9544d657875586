// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Inter-thread message queue (MP-MC safe).
//!
//! Design:
//!
//! ```text
//!           consumers           producers
//!         r_tail  r_head      w_tail      w_head
//!   0   1   │   3   │   5   6   │   8   9   │   11  12  13  14  15
//! ┌───┬───┬───┬───┬───┬───┬───┬───┬───┬───┬───┬───┬───┬───┬───┬───┐
//! │ A │ B │ C │ D │ E │ F │ G │ . │ . │ . │   │   │   │   │   │   │
//! └───┴───┴───┴───┴───┴───┴───┴───┴───┴───┴───┴───┴───┴───┴───┴───┘
//!   ┄┄┄┄┄   ╰───╯   ╰───────╯   ╰───────╯   ┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄┄
//!   free    read in   unread     write in    free (unwritten)
//!           progress             progress
//!
//!  total occupied range = w_head - r_tail  (i.e. "C D E F G . . ." above)
//!  available to write   = cap - (w_head - r_tail)
//!  available to read    = w_tail - r_head
//! ```
//!
//! All four counters are monotonically increasing `u32`s using wrap-around
//! arithmetic. Commits publish in claim order: a producer that claimed slot
//! `s` spins (yielding) until `w_tail == s` before publishing `s + 1`, so a
//! reader observing `w_tail > s` observes a fully written entry. The spin is
//! correct but unbounded under pathological scheduling; the channel assumes
//! roughly balanced producer/consumer counts versus capacity.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Condvar, Mutex};
use std::thread;

use crate::error::ChanError;

/// Amount added to the gates on shutdown so every blocked and future caller
/// gets through to observe the shutdown flag.
const SHUTDOWN_FLOOD: u32 = 0xffff;

/// Counting gate for blocking producers/consumers: an atomic fast path and a
/// mutex/condvar slow path with an explicit waiter count (so shutdown knows
/// how many wakes to deliver).
#[derive(Debug, Default)]
struct Gate {
    value: AtomicU32,
    waiters: AtomicU32,
    lock: Mutex<()>,
    cond: Condvar,
}

impl Gate {
    fn new(initial: u32) -> Self {
        Gate { value: AtomicU32::new(initial), ..Gate::default() }
    }

    fn try_acquire(&self) -> bool {
        let mut expected = self.value.load(Ordering::Relaxed);
        while expected > 0 {
            match self.value.compare_exchange_weak(
                expected,
                expected - 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(current) => expected = current,
            }
        }
        false
    }

    fn acquire(&self) {
        if self.try_acquire() {
            return;
        }
        // Slow path. The waiter count is incremented under the lock, and the
        // value re-checked before waiting, so a release between the fast
        // path and the wait cannot be missed.
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.waiters.fetch_add(1, Ordering::AcqRel);
        loop {
            if self.try_acquire() {
                break;
            }
            guard = self.cond.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
        self.waiters.fetch_sub(1, Ordering::AcqRel);
    }

    fn release(&self) {
        self.value.fetch_add(1, Ordering::AcqRel);
        if self.waiters.load(Ordering::Acquire) > 0 {
            // Taking the lock orders this notify after the waiter's re-check.
            drop(self.lock.lock().unwrap_or_else(|e| e.into_inner()));
            self.cond.notify_one();
        }
    }

    fn flood(&self) {
        self.value.fetch_add(SHUTDOWN_FLOOD, Ordering::AcqRel);
        drop(self.lock.lock().unwrap_or_else(|e| e.into_inner()));
        self.cond.notify_all();
    }
}

/// Producer- and consumer-side header halves live on separate cache lines to
/// avoid false sharing.
#[repr(align(64))]
#[derive(Debug)]
struct Side {
    head: AtomicU32,
    tail: AtomicU32,
    shutdown: AtomicBool,
    gate: Gate,
}

impl Side {
    fn new(gate_initial: u32) -> Self {
        Side {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
            shutdown: AtomicBool::new(false),
            gate: Gate::new(gate_initial),
        }
    }
}

struct Slot<T>(UnsafeCell<MaybeUninit<T>>);

/// Bounded lock-free MPMC FIFO of `T` between OS threads.
///
/// Capacity must be a power of two and at least 2; the usable capacity is
/// `cap - 1` entries (one slot is the full/empty disambiguator), reported by
/// [`RingChannel::capacity`].
pub struct RingChannel<T> {
    w: Side,
    r: Side,
    mask: u32,
    slots: Box<[Slot<T>]>,
}

// Entries move between threads; the protocol guarantees exclusive slot
// access between claim and commit.
unsafe impl<T: Send> Send for RingChannel<T> {}
unsafe impl<T: Send> Sync for RingChannel<T> {}

impl<T> std::fmt::Debug for RingChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingChannel")
            .field("capacity", &self.mask)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

/// The channel was shut down; the unsent value is handed back.
#[derive(Debug)]
pub struct SendError<T>(pub T);

#[derive(Debug)]
pub enum TrySendError<T> {
    Full(T),
    Closed(T),
}

#[derive(Debug, PartialEq, Eq)]
pub enum TryRecvError {
    Empty,
    Closed,
}

impl<T> RingChannel<T> {
    /// Opens a channel with ring size `cap` (power of two, ≥ 2).
    ///
    /// # Errors
    ///
    /// [`ChanError::InvalidCapacity`] when `cap` is not a power of two ≥ 2.
    pub fn with_capacity(cap: u32) -> Result<Self, ChanError> {
        if cap < 2 || !cap.is_power_of_two() {
            return Err(ChanError::InvalidCapacity { cap });
        }
        let mut slots = Vec::with_capacity(cap as usize);
        slots.resize_with(cap as usize, || Slot(UnsafeCell::new(MaybeUninit::uninit())));
        Ok(RingChannel {
            w: Side::new(cap - 1),
            r: Side::new(0),
            mask: cap - 1,
            slots: slots.into_boxed_slice(),
        })
    }

    /// Usable capacity in entries.
    #[must_use]
    pub fn capacity(&self) -> u32 { self.mask }

    #[must_use]
    pub fn is_shutdown(&self) -> bool { self.r.shutdown.load(Ordering::Acquire) }

    /// Atomically transitions to the terminal state: already-written entries
    /// may still be read, no new values are accepted, and every blocked
    /// caller is unblocked to observe the failure.
    pub fn shutdown(&self) {
        self.w.shutdown.store(true, Ordering::Release);
        self.r.shutdown.store(true, Ordering::Release);
        self.r.gate.flood();
        self.w.gate.flood();
    }

    /// Blocking write. Returns the value back if the channel was shut down.
    ///
    /// # Errors
    ///
    /// [`SendError`] carrying the value when the channel is shut down.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        self.w.gate.acquire();
        match self.write_claimed(value) {
            Ok(()) => Ok(()),
            Err(v) => Err(SendError(v)),
        }
    }

    /// Non-blocking write.
    ///
    /// # Errors
    ///
    /// [`TrySendError::Full`] when no slot is immediately available,
    /// [`TrySendError::Closed`] when the channel is shut down.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        if !self.w.gate.try_acquire() {
            return if self.is_shutdown() {
                Err(TrySendError::Closed(value))
            } else {
                Err(TrySendError::Full(value))
            };
        }
        match self.write_claimed(value) {
            Ok(()) => Ok(()),
            Err(v) => Err(TrySendError::Closed(v)),
        }
    }

    /// Blocking read. `None` when the channel is shut down and drained.
    pub fn recv(&self) -> Option<T> {
        self.r.gate.acquire();
        self.read_claimed()
    }

    /// Non-blocking read.
    ///
    /// # Errors
    ///
    /// [`TryRecvError::Empty`] when nothing is immediately readable,
    /// [`TryRecvError::Closed`] when shut down and drained.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        if !self.r.gate.try_acquire() {
            return if self.is_shutdown() {
                Err(TryRecvError::Closed)
            } else {
                Err(TryRecvError::Empty)
            };
        }
        self.read_claimed().ok_or(TryRecvError::Closed)
    }

    /// Claims a slot (writer gate already acquired), writes, and commits in
    /// claim order.
    fn write_claimed(&self, value: T) -> Result<(), T> {
        if self.w.shutdown.load(Ordering::Acquire) {
            return Err(value);
        }
        let s = self.w.head.fetch_add(1, Ordering::AcqRel);
        let mut r_tail = self.r.tail.load(Ordering::Acquire);
        while s.wrapping_sub(r_tail) >= self.mask {
            // queue is full; we lost the race to another producer whose
            // consumer hasn't drained yet
            thread::yield_now();
            if self.w.shutdown.load(Ordering::Acquire) {
                return Err(value);
            }
            r_tail = self.r.tail.load(Ordering::Acquire);
        }
        let slot = &self.slots[(s & self.mask) as usize];
        unsafe { (*slot.0.get()).write(value) };
        Self::ordered_commit(&self.w.tail, s);
        self.r.gate.release();
        Ok(())
    }

    fn read_claimed(&self) -> Option<T> {
        let s = self.r.head.fetch_add(1, Ordering::AcqRel);
        let mut w_tail = self.w.tail.load(Ordering::Acquire);
        while w_tail.wrapping_sub(s.wrapping_add(1)) >= self.mask {
            // slot s is not yet committed; wait for w_tail to advance
            if self.r.shutdown.load(Ordering::Acquire) {
                return None;
            }
            thread::yield_now();
            w_tail = self.w.tail.load(Ordering::Acquire);
        }
        let slot = &self.slots[(s & self.mask) as usize];
        let value = unsafe { (*slot.0.get()).assume_init_read() };
        Self::ordered_commit(&self.r.tail, s);
        self.w.gate.release();
        Some(value)
    }

    /// Publishes `my + 1` once every earlier claimant has committed, so no
    /// reader observes an unwritten slot (and no writer reuses an unread
    /// one).
    fn ordered_commit(tail: &AtomicU32, my: u32) {
        while tail.load(Ordering::Acquire) != my {
            thread::yield_now();
        }
        tail.store(my.wrapping_add(1), Ordering::Release);
    }

    #[cfg(test)]
    fn with_counter_origin(cap: u32, origin: u32) -> Result<Self, ChanError> {
        let ch = Self::with_capacity(cap)?;
        ch.w.head.store(origin, Ordering::Relaxed);
        ch.w.tail.store(origin, Ordering::Relaxed);
        ch.r.head.store(origin, Ordering::Relaxed);
        ch.r.tail.store(origin, Ordering::Relaxed);
        Ok(ch)
    }
}

impl<T> Drop for RingChannel<T> {
    fn drop(&mut self) {
        // Exclusive access: drop the committed-but-unread range. A reader
        // that aborted at shutdown may have claimed past w_tail; the wrap
        // check skips that (such slots hold no value).
        let w_tail = self.w.tail.load(Ordering::Acquire);
        let r_head = self.r.head.load(Ordering::Acquire);
        let readable = w_tail.wrapping_sub(r_head);
        if readable == 0 || readable > self.mask {
            return;
        }
        for i in 0..readable {
            let s = r_head.wrapping_add(i);
            let slot = &self.slots[(s & self.mask) as usize];
            unsafe { (*slot.0.get()).assume_init_drop() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_open_rejects_bad_capacity() {
        assert!(RingChannel::<u32>::with_capacity(0).is_err());
        assert!(RingChannel::<u32>::with_capacity(1).is_err());
        assert!(RingChannel::<u32>::with_capacity(3).is_err());
        assert!(RingChannel::<u32>::with_capacity(8).is_ok());
    }

    #[test]
    fn test_fifo_single_thread() {
        let ch = RingChannel::with_capacity(8).unwrap();
        assert_eq!(ch.capacity(), 7);
        for i in 0..7 {
            ch.send(i).unwrap();
        }
        assert!(matches!(ch.try_send(99), Err(TrySendError::Full(99))));
        for i in 0..7 {
            assert_eq!(ch.recv(), Some(i));
        }
        assert_eq!(ch.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_wrap_around_many_times() {
        let ch = RingChannel::with_capacity(4).unwrap();
        for i in 0u32..1_000 {
            ch.send(i).unwrap();
            assert_eq!(ch.recv(), Some(i));
        }
    }

    #[test]
    fn test_counters_wrap_across_u32_overflow() {
        let ch = RingChannel::with_counter_origin(8, u32::MAX - 3).unwrap();
        for i in 0u32..100 {
            ch.send(i).unwrap();
            assert_eq!(ch.recv(), Some(i));
        }
        // batch across the exact wrap point
        let ch = RingChannel::with_counter_origin(8, u32::MAX - 2).unwrap();
        for i in 0u32..6 {
            ch.send(i).unwrap();
        }
        for i in 0u32..6 {
            assert_eq!(ch.recv(), Some(i));
        }
    }

    #[test]
    fn test_shutdown_rejects_writes_but_drains_reads() {
        let ch = RingChannel::with_capacity(8).unwrap();
        ch.send(1).unwrap();
        ch.send(2).unwrap();
        ch.shutdown();
        assert!(ch.send(3).is_err());
        assert_eq!(ch.recv(), Some(1));
        assert_eq!(ch.recv(), Some(2));
        assert_eq!(ch.recv(), None);
        assert_eq!(ch.try_recv(), Err(TryRecvError::Closed));
    }

    #[test]
    fn test_shutdown_unblocks_blocked_reader() {
        let ch: Arc<RingChannel<u32>> = Arc::new(RingChannel::with_capacity(4).unwrap());
        let ch2 = Arc::clone(&ch);
        let reader = std::thread::spawn(move || ch2.recv());
        std::thread::sleep(Duration::from_millis(20));
        ch.shutdown();
        assert_eq!(reader.join().unwrap(), None);
    }

    #[test]
    fn test_shutdown_unblocks_blocked_writer() {
        let ch: Arc<RingChannel<u32>> = Arc::new(RingChannel::with_capacity(2).unwrap());
        ch.send(7).unwrap(); // capacity 1; now full
        let ch2 = Arc::clone(&ch);
        let writer = std::thread::spawn(move || ch2.send(8));
        std::thread::sleep(Duration::from_millis(20));
        ch.shutdown();
        assert!(writer.join().unwrap().is_err());
    }

    #[test]
    fn test_unread_values_dropped_with_channel() {
        let ch = RingChannel::with_capacity(4).unwrap();
        let marker = Arc::new(());
        ch.send(Arc::clone(&marker)).unwrap();
        ch.send(Arc::clone(&marker)).unwrap();
        drop(ch);
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}
