// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Binary min-heap of timers keyed by absolute deadline.
//!
//! Timers are shared between the heap and user-facing handles via [`Rc`]:
//! the heap holds one reference while a timer is scheduled, and a
//! [`TimerHandle`](crate::sched::TimerHandle) may hold another. A `when` of
//! [`Time::NONE`] means "dead / not in heap", so either side can observe
//! whether the other still schedules the timer.

use std::cell::Cell;
use std::rc::Rc;

use crate::core::time::{DurationNs, Time};
use crate::sched::TaskId;

/// What firing the timer does.
#[derive(Clone, Copy, Debug)]
pub enum TimerAction {
    /// Wake a task blocked in `sleep`.
    Wake(TaskId),
    /// Post a timer message to the task's inbox (`timer_start` timers).
    Inbox(TaskId),
}

impl TimerAction {
    #[must_use]
    pub fn task(self) -> TaskId {
        match self {
            TimerAction::Wake(tid) | TimerAction::Inbox(tid) => tid,
        }
    }
}

#[derive(Debug)]
pub struct Timer {
    /// Absolute deadline. [`Time::NONE`] if dead (not in the owning heap).
    pub when: Cell<Time>,
    /// If > 0, the timer repeats every `when + period`.
    pub period: Cell<DurationNs>,
    /// Precision request; how much this timer is willing to fluctuate.
    /// `< 0` means unspecified.
    pub leeway: Cell<DurationNs>,
    pub action: TimerAction,
}

impl Timer {
    #[must_use]
    pub fn new(when: Time, period: DurationNs, leeway: DurationNs, action: TimerAction) -> Rc<Self> {
        Rc::new(Timer { when: Cell::new(when), period: Cell::new(period), leeway: Cell::new(leeway), action })
    }

    #[must_use]
    pub fn is_dead(&self) -> bool { self.when.get().is_none() }

    pub(crate) fn mark_dead(&self) { self.when.set(Time::NONE); }
}

/// Cache friendly heap entry: the key is duplicated next to the pointer so
/// sifting does not chase [`Rc`]s.
#[derive(Debug)]
struct TimerEntry {
    when: Time,
    timer: Rc<Timer>,
}

#[derive(Debug, Default)]
pub struct TimerHeap {
    v: Vec<TimerEntry>,
}

impl TimerHeap {
    #[must_use]
    pub fn new() -> Self { Self { v: Vec::with_capacity(8) } }

    #[must_use]
    pub fn len(&self) -> usize { self.v.len() }

    #[must_use]
    pub fn is_empty(&self) -> bool { self.v.is_empty() }

    /// Deadline and leeway of the soonest timer; used as the iopoll deadline.
    #[must_use]
    pub fn peek_min(&self) -> Option<(Time, DurationNs)> {
        self.v.first().map(|e| (e.when, e.timer.leeway.get()))
    }

    /// Appends the timer and sifts it up.
    pub fn add(&mut self, timer: Rc<Timer>) {
        if timer.when.get().is_none() {
            // uphold the special meaning of the dead sentinel
            timer.when.set(Time::from_nanos(u64::MAX - 1));
        }
        let when = timer.when.get();
        self.v.push(TimerEntry { when, timer });
        self.sift_up(self.v.len() - 1);
    }

    /// Removes and returns the timer with the soonest `when`.
    pub fn remove_min(&mut self) -> Option<Rc<Timer>> {
        if self.v.is_empty() {
            return None;
        }
        let last = self.v.len() - 1;
        self.v.swap(0, last);
        let entry = self.v.pop();
        if !self.v.is_empty() {
            self.sift_down(0);
        }
        entry.map(|e| e.timer)
    }

    /// Removes a specific timer. Linear search: timers per task are expected
    /// to be few, and a `when` past the midpoint is likelier near the back.
    pub fn remove(&mut self, timer: &Rc<Timer>) {
        if self.v.is_empty() || timer.is_dead() {
            return;
        }
        let mid_when = self.v[self.v.len() / 2].when;
        if timer.when.get() > mid_when {
            for i in (0..self.v.len()).rev() {
                if Rc::ptr_eq(&self.v[i].timer, timer) {
                    self.remove_at(i);
                    return;
                }
            }
        } else {
            for i in 0..self.v.len() {
                if Rc::ptr_eq(&self.v[i].timer, timer) {
                    self.remove_at(i);
                    return;
                }
            }
        }
        tracing::warn!(target: "sched", "timer not found in heap");
    }

    /// Removes every timer matching `pred` (task teardown). Returns the
    /// removed timers so the caller can release their bookkeeping.
    ///
    /// One forward sweep swap-removes matches in place (the swapped-in tail
    /// entry is re-examined at the same index), then a single bulk sift
    /// restores heap order.
    pub fn remove_matching(&mut self, pred: impl Fn(&Timer) -> bool) -> Vec<Rc<Timer>> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.v.len() {
            if pred(&self.v[i].timer) {
                removed.push(self.v.swap_remove(i).timer);
            } else {
                i += 1;
            }
        }
        if !removed.is_empty() {
            for i in (0..self.v.len() / 2).rev() {
                self.sift_down(i);
            }
        }
        removed
    }

    pub fn clear(&mut self) { self.v.clear(); }

    fn remove_at(&mut self, i: usize) {
        let last = self.v.len() - 1;
        if i == last {
            self.v.pop();
            return;
        }
        self.v.swap(i, last);
        self.v.pop();
        if i > 0 && self.v[i].when < self.v[(i - 1) / 2].when {
            self.sift_up(i);
        } else {
            self.sift_down(i);
        }
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.v[i].when >= self.v[parent].when {
                break;
            }
            self.v.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.v.len();
        loop {
            let left = i * 2 + 1;
            if left >= len {
                break; // no left child; this is a leaf
            }
            let mut child = left;
            let right = left + 1;
            if right < len && self.v[right].when < self.v[left].when {
                child = right;
            }
            if self.v[child].when >= self.v[i].when {
                break;
            }
            self.v.swap(i, child);
            i = child;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::time::MILLISECOND;
    use pretty_assertions::assert_eq;

    fn tid(n: u32) -> TaskId { TaskId::from_raw(0, n) }

    fn mk(when_ns: u64) -> Rc<Timer> {
        Timer::new(Time::from_nanos(when_ns), 0, -1, TimerAction::Wake(tid(1)))
    }

    #[test]
    fn test_pops_in_nondecreasing_when_order() {
        let mut heap = TimerHeap::new();
        for when in [50u64, 10, 40, 20, 30, 60, 5] {
            heap.add(mk(when));
        }
        let mut prev = 0u64;
        while let Some(t) = heap.remove_min() {
            let w = t.when.get().as_nanos();
            assert!(w >= prev, "{w} >= {prev}");
            prev = w;
        }
        assert!(heap.is_empty());
    }

    #[test]
    fn test_equal_when_values() {
        let mut heap = TimerHeap::new();
        let when = Time::now() + MILLISECOND;
        for _ in 0..5 {
            heap.add(Timer::new(when, 0, -1, TimerAction::Wake(tid(1))));
        }
        assert_eq!(heap.len(), 5);
        for _ in 0..5 {
            assert_eq!(heap.remove_min().unwrap().when.get(), when);
        }
    }

    #[test]
    fn test_remove_specific_timer() {
        let mut heap = TimerHeap::new();
        let a = mk(10);
        let b = mk(20);
        let c = mk(30);
        heap.add(Rc::clone(&a));
        heap.add(Rc::clone(&b));
        heap.add(Rc::clone(&c));

        heap.remove(&b);
        assert_eq!(heap.len(), 2);
        assert!(Rc::ptr_eq(&heap.remove_min().unwrap(), &a));
        assert!(Rc::ptr_eq(&heap.remove_min().unwrap(), &c));
    }

    #[test]
    fn test_peek_min_tracks_soonest() {
        let mut heap = TimerHeap::new();
        assert!(heap.peek_min().is_none());
        heap.add(mk(300));
        heap.add(mk(100));
        heap.add(mk(200));
        assert_eq!(heap.peek_min().unwrap().0, Time::from_nanos(100));
        heap.remove_min();
        assert_eq!(heap.peek_min().unwrap().0, Time::from_nanos(200));
    }

    #[test]
    fn test_remove_matching_by_task() {
        let mut heap = TimerHeap::new();
        for (when, task) in [(10u64, 1u32), (20, 2), (30, 1), (40, 2), (50, 1)] {
            heap.add(Timer::new(Time::from_nanos(when), 0, -1, TimerAction::Wake(tid(task))));
        }
        let removed = heap.remove_matching(|t| t.action.task() == tid(1));
        assert_eq!(removed.len(), 3);
        assert_eq!(heap.len(), 2);
        let mut rest: Vec<u64> =
            std::iter::from_fn(|| heap.remove_min()).map(|t| t.when.get().as_nanos()).collect();
        rest.sort_unstable();
        assert_eq!(rest, vec![20, 40]);
    }

    #[test]
    fn test_dead_sentinel_is_clamped_on_add() {
        let mut heap = TimerHeap::new();
        let t = Timer::new(Time::NONE, 0, -1, TimerAction::Wake(tid(1)));
        heap.add(Rc::clone(&t));
        assert!(!t.is_dead());
        assert_eq!(t.when.get(), Time::from_nanos(u64::MAX - 1));
    }
}
