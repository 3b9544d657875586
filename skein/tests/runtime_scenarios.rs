// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

// cspell:words runq nanosleep addrinfo

//! End-to-end scheduler scenarios: timers, task tree teardown, messaging
//! backpressure, await edge cases, async syscalls, and I/O parking.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use skein::time::{MILLISECOND, SECOND};
use skein::{
    Coro, Ctx, DiedHow, IoProgress, MsgKind, Resume, RunConfig, Scheduler, SendTarget, Step,
    SyscallReq, SyscallResult, TaskId, Time, TimerHandle, Value, run_main, task_fn,
};

/// Opt into scheduler traces with e.g. `RUST_LOG=sched=trace,runq=trace`.
fn cfg() -> RunConfig {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _unused = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
    RunConfig { exit_when_done: false, ..RunConfig::default() }
}

#[test]
fn sleep_wakes_after_deadline() {
    let elapsed = Rc::new(Cell::new(0i64));
    let started = Rc::new(Cell::new(Time::now()));
    let (elapsed2, started2) = (Rc::clone(&elapsed), Rc::clone(&started));

    let out = run_main(
        cfg(),
        task_fn(move |_cx, input| match input {
            Resume::Start => {
                started2.set(Time::now());
                Step::Sleep { delay: 10 * MILLISECOND, leeway: -1 }
            }
            _ => {
                elapsed2.set(Time::since(started2.get()));
                Step::Return(vec![])
            }
        }),
    )
    .expect("run");

    assert!(!out.exit_err);
    let e = elapsed.get();
    assert!(e >= 9 * MILLISECOND, "woke early: {e}ns");
    assert!(e < 500 * MILLISECOND, "excessive scheduler overhead: {e}ns");
}

#[test]
fn sleep_zero_returns_promptly_and_overhead_stays_bounded() {
    const ROUNDS: i64 = 20;
    let start = Time::now();
    let remaining = Rc::new(Cell::new(ROUNDS));
    let remaining2 = Rc::clone(&remaining);

    run_main(
        cfg(),
        task_fn(move |_cx, input| {
            if matches!(input, Resume::Start) {
                return Step::Sleep { delay: 0, leeway: -1 };
            }
            let left = remaining2.get() - 1;
            remaining2.set(left);
            if left == 0 {
                Step::Return(vec![])
            } else {
                Step::Sleep { delay: 0, leeway: -1 }
            }
        }),
    )
    .expect("run");

    let total = Time::since(start);
    assert!(total < 2 * SECOND, "{ROUNDS} zero sleeps took {total}ns");
}

#[test]
fn spawn_await_clean_exit_values() {
    let out = run_main(
        cfg(),
        task_fn(move |_cx, input| match input {
            Resume::Start => Step::Spawn(task_fn(|_cx, _input| Step::Return(vec![Value::Int(7)]))),
            Resume::Spawned(child) => Step::AwaitTask(child),
            Resume::TaskDone { how, values } => {
                assert_eq!(how, DiedHow::Clean);
                assert!(values[0].deep_eq(&Value::Int(7)));
                Step::Return(values)
            }
            other => panic!("unexpected resume: {other:?}"),
        }),
    )
    .expect("run");
    assert_eq!(out.main_how, DiedHow::Clean);
    assert!(out.main_values[0].deep_eq(&Value::Int(7)));
}

#[test]
fn await_parks_until_sleeping_child_exits() {
    let out = run_main(
        cfg(),
        task_fn(move |_cx, input| match input {
            Resume::Start => Step::Spawn(task_fn(|_cx, input| match input {
                Resume::Start => Step::Sleep { delay: 5 * MILLISECOND, leeway: -1 },
                _ => Step::Return(vec![Value::str("done")]),
            })),
            Resume::Spawned(child) => Step::AwaitTask(child),
            Resume::TaskDone { how, values } => {
                assert_eq!(how, DiedHow::Clean);
                assert!(values[0].deep_eq(&Value::str("done")));
                Step::Return(vec![])
            }
            other => panic!("unexpected resume: {other:?}"),
        }),
    )
    .expect("run");
    assert!(!out.exit_err);
}

#[test]
fn await_error_exit_delivers_error_value() {
    let out = run_main(
        cfg(),
        task_fn(move |_cx, input| match input {
            Resume::Start => {
                Step::Spawn(task_fn(|_cx, _input| Step::Fail(Value::str("task exploded"))))
            }
            Resume::Spawned(child) => Step::AwaitTask(child),
            Resume::TaskDone { how, values } => {
                assert_eq!(how, DiedHow::Err);
                assert!(values[0].deep_eq(&Value::str("task exploded")));
                Step::Return(vec![])
            }
            other => panic!("unexpected resume: {other:?}"),
        }),
    )
    .expect("run");
    // the awaiter consumed the error; the run itself is clean
    assert!(!out.exit_err);
}

#[test]
fn await_self_is_an_error() {
    let out = run_main(
        cfg(),
        task_fn(|cx: &mut Ctx<'_>, _input| Step::AwaitTask(cx.task_id())),
    )
    .expect("run");
    assert!(out.exit_err);
    assert!(out.main_error.as_deref().is_some_and(|e| e.contains("await itself")), "{out:?}");
}

#[test]
fn await_foreign_scheduler_task_is_an_error() {
    let out = run_main(
        cfg(),
        task_fn(|_cx, _input| Step::AwaitTask(TaskId::from_raw(u32::MAX, 1))),
    )
    .expect("run");
    assert!(out.exit_err);
    assert!(
        out.main_error.as_deref().is_some_and(|e| e.contains("different scheduler")),
        "{out:?}"
    );
}

/// Grandchild parked in a long sleep; its cleanup hook must run when the
/// main task exits, and the scheduler must not wait out the sleep.
#[test]
fn parent_exit_stops_sleeping_descendants() {
    struct SleepyGrandchild {
        stopped: Rc<Cell<bool>>,
    }
    impl Coro for SleepyGrandchild {
        fn resume(&mut self, _cx: &mut Ctx<'_>, input: Resume) -> Step {
            match input {
                Resume::Start => Step::Sleep { delay: SECOND, leeway: -1 },
                _ => Step::Return(vec![]),
            }
        }
        fn on_stop(&mut self) { self.stopped.set(true); }
    }

    let stopped = Rc::new(Cell::new(false));
    let stopped2 = Rc::clone(&stopped);
    let start = Time::now();

    let out = run_main(
        cfg(),
        task_fn(move |_cx, input| match input {
            Resume::Start => {
                let flag = Rc::clone(&stopped2);
                // the middle task stays parked awaiting the grandchild
                Step::Spawn(task_fn(move |_cx, input| match input {
                    Resume::Start => Step::Spawn(Box::new(SleepyGrandchild { stopped: Rc::clone(&flag) })),
                    Resume::Spawned(grandchild) => Step::AwaitTask(grandchild),
                    _ => Step::Return(vec![]),
                }))
            }
            Resume::Spawned(_) => Step::Return(vec![]),
            other => panic!("unexpected resume: {other:?}"),
        }),
    )
    .expect("run");

    assert_eq!(out.main_how, DiedHow::Clean);
    assert!(stopped.get(), "grandchild cleanup hook did not run");
    let elapsed = Time::since(start);
    assert!(elapsed < 500 * MILLISECOND, "scheduler waited out the sleep: {elapsed}ns");
}

/// Producer sends 100 messages into an inbox capped at 64; the consumer
/// drains after a delay. The producer must park on the full inbox and all
/// messages must arrive in send order.
#[test]
fn inbox_backpressure_preserves_send_order() {
    const TOTAL: i64 = 100;
    let received = Rc::new(RefCell::new(Vec::<i64>::new()));
    let received2 = Rc::clone(&received);

    let consumer = move |_cx: &mut Ctx<'_>, input: Resume| match input {
        Resume::Start => Step::Sleep { delay: 20 * MILLISECOND, leeway: -1 },
        Resume::Unit => Step::Recv,
        Resume::Msg(msg) => {
            assert_eq!(msg.kind, MsgKind::Msg);
            let Value::Int(i) = msg.values[0] else { panic!("expected int payload") };
            received2.borrow_mut().push(i);
            if received2.borrow().len() as i64 == TOTAL {
                Step::Return(vec![])
            } else {
                Step::Recv
            }
        }
        other => panic!("unexpected resume: {other:?}"),
    };

    let consumer_tid: Rc<Cell<Option<TaskId>>> = Rc::new(Cell::new(None));
    let consumer_tid2 = Rc::clone(&consumer_tid);

    let out = run_main(
        cfg(),
        task_fn(move |_cx, input| match input {
            Resume::Start => Step::Spawn(task_fn(consumer.clone())),
            Resume::Spawned(tid) if consumer_tid2.get().is_none() => {
                consumer_tid2.set(Some(tid));
                let next = Rc::new(Cell::new(0i64));
                Step::Spawn(task_fn(move |_cx, input| {
                    match input {
                        Resume::Start => {}
                        Resume::Sent(ok) => assert!(ok, "consumer vanished mid-stream"),
                        other => panic!("unexpected resume: {other:?}"),
                    }
                    let i = next.get();
                    if i == TOTAL {
                        return Step::Return(vec![]);
                    }
                    next.set(i + 1);
                    Step::Send { to: SendTarget::Task(tid), values: vec![Value::Int(i)] }
                }))
            }
            Resume::Spawned(_) => {
                Step::AwaitTask(consumer_tid2.get().expect("consumer spawned first"))
            }
            Resume::TaskDone { how, .. } => {
                assert_eq!(how, DiedHow::Clean);
                Step::Return(vec![])
            }
            other => panic!("unexpected resume: {other:?}"),
        }),
    )
    .expect("run");

    assert!(!out.exit_err, "{out:?}");
    let received = received.borrow();
    assert_eq!(received.len() as i64, TOTAL);
    assert!(received.iter().copied().eq(0..TOTAL), "messages out of order: {received:?}");
}

#[test]
fn recv_with_nothing_pending_is_a_deadlock_error() {
    let out = run_main(cfg(), task_fn(|_cx, _input| Step::Recv)).expect("run");
    assert!(out.exit_err);
    assert!(out.main_error.as_deref().is_some_and(|e| e.contains("deadlock")), "{out:?}");
}

#[test]
fn periodic_timer_fires_into_inbox_until_stopped() {
    let handle: Rc<RefCell<Option<TimerHandle>>> = Rc::new(RefCell::new(None));
    let handle2 = Rc::clone(&handle);
    let fired = Rc::new(Cell::new(0u32));
    let fired2 = Rc::clone(&fired);

    let out = run_main(
        cfg(),
        task_fn(move |cx: &mut Ctx<'_>, input| match input {
            Resume::Start => {
                let when = cx.monotime() + 2 * MILLISECOND;
                match cx.timer_start(when, 2 * MILLISECOND, -1) {
                    Ok(h) => {
                        *handle2.borrow_mut() = Some(h);
                        Step::Recv
                    }
                    Err(e) => Step::Fail(Value::str(e.to_string())),
                }
            }
            Resume::Msg(msg) => {
                assert_eq!(msg.kind, MsgKind::Timer);
                let n = fired2.get() + 1;
                fired2.set(n);
                if n == 3 {
                    let h = handle2.borrow_mut().take().expect("timer handle");
                    cx.timer_stop(&h);
                    assert!(h.is_expired());
                    Step::Return(vec![])
                } else {
                    Step::Recv
                }
            }
            other => panic!("unexpected resume: {other:?}"),
        }),
    )
    .expect("run");

    assert!(!out.exit_err, "{out:?}");
    assert_eq!(fired.get(), 3);
}

#[test]
fn syscall_nanosleep_inline_fast_path() {
    let start = Time::now();
    let out = run_main(
        cfg(),
        task_fn(move |_cx, input| match input {
            // sole live task with no timers: executed inline
            Resume::Start => {
                Step::Syscall(SyscallReq::Nanosleep { nanos: 5 * MILLISECOND as u64 })
            }
            Resume::Syscall(SyscallResult::Int(0)) => Step::Return(vec![]),
            other => panic!("unexpected resume: {other:?}"),
        }),
    )
    .expect("run");
    assert!(!out.exit_err);
    assert!(Time::since(start) >= 4 * MILLISECOND);
}

#[test]
fn syscall_dispatches_to_worker_pool_when_tasks_are_live() {
    let out = run_main(
        cfg(),
        task_fn(move |_cx, input| match input {
            Resume::Start => Step::Spawn(task_fn(|_cx, input| match input {
                Resume::Start => Step::Sleep { delay: 50 * MILLISECOND, leeway: -1 },
                _ => Step::Return(vec![]),
            })),
            // a second task is live, so the request takes the worker path
            Resume::Spawned(_) => {
                Step::Syscall(SyscallReq::Nanosleep { nanos: 5 * MILLISECOND as u64 })
            }
            Resume::Syscall(SyscallResult::Int(0)) => Step::Return(vec![]),
            other => panic!("unexpected resume: {other:?}"),
        }),
    )
    .expect("run");
    assert!(!out.exit_err, "{out:?}");
}

#[test]
fn syscall_addrinfo_resolves() {
    let out = run_main(
        cfg(),
        task_fn(move |_cx, input| match input {
            Resume::Start => {
                Step::Syscall(SyscallReq::AddrInfo { host: "localhost".into(), port: 8080 })
            }
            Resume::Syscall(SyscallResult::AddrInfo(result)) => {
                let addrs = result.expect("localhost resolves");
                assert!(!addrs.is_empty());
                assert!(addrs.iter().all(|a| a.port() == 8080));
                Step::Return(vec![])
            }
            other => panic!("unexpected resume: {other:?}"),
        }),
    )
    .expect("run");
    assert!(!out.exit_err, "{out:?}");
}

#[test]
fn io_wait_parks_until_pipe_is_readable() {
    let got = Rc::new(RefCell::new(Vec::new()));
    let got2 = Rc::clone(&got);
    let rx_slot: Rc<RefCell<Option<skein::IoHandle>>> = Rc::new(RefCell::new(None));
    let rx_slot2 = Rc::clone(&rx_slot);

    let out = run_main(
        cfg(),
        task_fn(move |cx: &mut Ctx<'_>, input| match input {
            Resume::Start => {
                let (rx, tx) = match cx.pipe() {
                    Ok(pair) => pair,
                    Err(e) => return Step::Fail(Value::str(e.to_string())),
                };
                // nothing readable yet: a read reports WouldBlock
                let mut buf = Vec::new();
                assert_eq!(cx.read(&rx, &mut buf, 0).expect("read"), IoProgress::WouldBlock);
                assert_eq!(cx.write(&tx, b"ping").expect("write"), IoProgress::Done(4));
                cx.close_io(&tx);
                *rx_slot2.borrow_mut() = Some(rx.clone());
                Step::IoWait(rx)
            }
            Resume::Io => {
                let rx = rx_slot2.borrow().clone().expect("rx handle");
                let mut buf = Vec::new();
                match cx.read(&rx, &mut buf, 0).expect("read") {
                    IoProgress::Done(n) => {
                        assert_eq!(n, 4);
                        got2.borrow_mut().extend_from_slice(&buf);
                        cx.close_io(&rx);
                        Step::Return(vec![])
                    }
                    other => Step::Fail(Value::str(format!("unexpected read result: {other:?}"))),
                }
            }
            other => panic!("unexpected resume: {other:?}"),
        }),
    )
    .expect("run");

    assert!(!out.exit_err, "{out:?}");
    assert_eq!(&*got.borrow(), b"ping");
}

#[test]
fn cross_thread_shutdown_interrupts_poll_and_stops_tasks() {
    let mut s = Scheduler::new(cfg()).expect("scheduler");
    let handle = s.shutdown_handle();
    let interrupter = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(30));
        handle.shutdown();
    });

    let start = Time::now();
    let out = s
        .run(task_fn(|_cx, input| match input {
            Resume::Start => Step::Sleep { delay: 10 * SECOND, leeway: -1 },
            _ => Step::Return(vec![]),
        }))
        .expect("run");
    interrupter.join().expect("interrupter");

    assert_eq!(out.main_how, DiedHow::Stopped);
    assert_eq!(s.live_tasks(), 0, "shutdown left live tasks behind");
    assert!(Time::since(start) < 5 * SECOND, "shutdown did not interrupt the poll");
}
