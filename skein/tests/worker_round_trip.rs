// Copyright (c) 2025 R3BL LLC. Licensed under Apache License, Version 2.0.

//! Cross-thread worker scenarios: message round trips, error surfacing,
//! close semantics, and shutdown completeness.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use skein::time::{MILLISECOND, SECOND};
use skein::{
    Ctx, MsgSender, Resume, RunConfig, Scheduler, SendTarget, Step, Time, Value, WorkerHandle,
    run_main, task_fn,
};

/// Opt into scheduler traces with e.g. `RUST_LOG=sched=trace,worker=debug`.
fn cfg() -> RunConfig {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _unused = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
    RunConfig { exit_when_done: false, ..RunConfig::default() }
}

/// The parent sends 21, the worker replies with 42, the worker exits
/// cleanly, and `await(worker)` reports success.
#[test]
fn worker_round_trip_doubles_the_payload() {
    let worker: Rc<RefCell<Option<WorkerHandle>>> = Rc::new(RefCell::new(None));
    let worker2 = Rc::clone(&worker);

    let out = run_main(
        cfg(),
        task_fn(move |cx: &mut Ctx<'_>, input| match input {
            Resume::Start => {
                let handle = match cx.spawn_worker(|| {
                    task_fn(|_cx, input| match input {
                        Resume::Start => Step::Recv,
                        Resume::Msg(msg) => {
                            let Value::Int(x) = msg.values[0] else {
                                return Step::Fail(Value::str("expected int payload"));
                            };
                            Step::Send {
                                to: SendTarget::Parent,
                                values: vec![Value::Int(x * 2)],
                            }
                        }
                        Resume::Sent(_) => Step::Return(vec![]),
                        other => panic!("worker: unexpected resume: {other:?}"),
                    })
                }) {
                    Ok(handle) => handle,
                    Err(e) => return Step::Fail(Value::str(e.to_string())),
                };
                *worker2.borrow_mut() = Some(handle.clone());
                Step::Send { to: SendTarget::Worker(handle), values: vec![Value::Int(21)] }
            }
            Resume::Sent(ok) => {
                assert!(ok, "send to worker failed");
                Step::Recv
            }
            Resume::Msg(msg) => {
                assert_eq!(msg.sender, MsgSender::Worker);
                assert!(msg.values[0].deep_eq(&Value::Int(42)), "{:?}", msg.values);
                Step::AwaitWorker(worker2.borrow().clone().expect("worker handle"))
            }
            Resume::WorkerDone { ok, err } => {
                assert!(ok, "worker exited with error: {err:?}");
                Step::Return(vec![])
            }
            other => panic!("unexpected resume: {other:?}"),
        }),
    )
    .expect("run");

    assert!(!out.exit_err, "{out:?}");
    assert!(worker.borrow().as_ref().is_some_and(WorkerHandle::is_closed));
}

/// A worker main task that dies with an error while someone is awaiting
/// the worker: the error text must reach the awaiter.
#[test]
fn worker_error_is_delivered_to_awaiter() {
    let worker: Rc<RefCell<Option<WorkerHandle>>> = Rc::new(RefCell::new(None));
    let worker2 = Rc::clone(&worker);
    let stage = Rc::new(Cell::new(0u8));
    let stage2 = Rc::clone(&stage);

    let out = run_main(
        cfg(),
        task_fn(move |cx: &mut Ctx<'_>, input| match (stage2.get(), input) {
            (0, Resume::Start) => {
                let handle = match cx.spawn_worker(|| {
                    // wait for the go signal, then die with an error
                    task_fn(|_cx, input| match input {
                        Resume::Start => Step::Recv,
                        Resume::Msg(_) => Step::Fail(Value::str("boom in worker")),
                        other => panic!("worker: unexpected resume: {other:?}"),
                    })
                }) {
                    Ok(handle) => handle,
                    Err(e) => return Step::Fail(Value::str(e.to_string())),
                };
                *worker2.borrow_mut() = Some(handle.clone());
                stage2.set(1);
                // the trigger runs after the parent is already awaiting
                Step::Spawn(task_fn(move |_cx, input| match input {
                    Resume::Start => Step::Sleep { delay: 50 * MILLISECOND, leeway: -1 },
                    Resume::Unit => Step::Send {
                        to: SendTarget::Worker(handle.clone()),
                        values: vec![Value::Bool(true)],
                    },
                    Resume::Sent(_) => Step::Return(vec![]),
                    other => panic!("trigger: unexpected resume: {other:?}"),
                }))
            }
            (1, Resume::Spawned(_)) => {
                stage2.set(2);
                Step::AwaitWorker(worker2.borrow().clone().expect("worker handle"))
            }
            (2, Resume::WorkerDone { ok, err }) => {
                assert!(!ok, "worker should have failed");
                assert!(
                    err.as_deref().is_some_and(|e| e.contains("boom in worker")),
                    "missing error text: {err:?}"
                );
                Step::Return(vec![])
            }
            (stage, other) => panic!("unexpected resume at stage {stage}: {other:?}"),
        }),
    )
    .expect("run");

    assert!(!out.exit_err, "{out:?}");
}

/// `close(w)` transitions to closed exactly once; a second close reports
/// no-op, and awaiting the closed worker completes.
#[test]
fn close_stops_a_parked_worker() {
    let worker: Rc<RefCell<Option<WorkerHandle>>> = Rc::new(RefCell::new(None));
    let worker2 = Rc::clone(&worker);

    let out = run_main(
        cfg(),
        task_fn(move |cx: &mut Ctx<'_>, input| match input {
            Resume::Start => {
                let handle = match cx.spawn_worker(|| {
                    // worker main blocks in recv indefinitely
                    task_fn(|_cx, input| match input {
                        Resume::Start => Step::Recv,
                        _ => Step::Return(vec![]),
                    })
                }) {
                    Ok(handle) => handle,
                    Err(e) => return Step::Fail(Value::str(e.to_string())),
                };
                *worker2.borrow_mut() = Some(handle);
                Step::Sleep { delay: 20 * MILLISECOND, leeway: -1 }
            }
            Resume::Unit => {
                let handle = worker2.borrow().clone().expect("worker handle");
                handle.close();
                assert!(!handle.close(), "second close must be a no-op");
                Step::AwaitWorker(handle)
            }
            Resume::WorkerDone { ok, err } => {
                assert!(ok, "a stopped worker is not an error exit: {err:?}");
                Step::Return(vec![])
            }
            other => panic!("unexpected resume: {other:?}"),
        }),
    )
    .expect("run");

    assert!(!out.exit_err, "{out:?}");
    assert!(worker.borrow().as_ref().is_some_and(WorkerHandle::is_closed));
}

/// After scheduler shutdown every task is dead and every worker closed.
#[test]
fn shutdown_reaches_every_task_and_worker() {
    let mut s = Scheduler::new(cfg()).expect("scheduler");
    let shutdown = s.shutdown_handle();
    let worker: Rc<RefCell<Option<WorkerHandle>>> = Rc::new(RefCell::new(None));
    let worker2 = Rc::clone(&worker);

    let interrupter = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        shutdown.shutdown();
    });

    let start = Time::now();
    let out = s
        .run(task_fn(move |cx: &mut Ctx<'_>, input| match input {
            Resume::Start => {
                let handle = match cx.spawn_worker(|| {
                    task_fn(|_cx, input| match input {
                        Resume::Start => Step::Recv,
                        _ => Step::Return(vec![]),
                    })
                }) {
                    Ok(handle) => handle,
                    Err(e) => return Step::Fail(Value::str(e.to_string())),
                };
                *worker2.borrow_mut() = Some(handle);
                Step::Sleep { delay: 10 * SECOND, leeway: -1 }
            }
            _ => Step::Return(vec![]),
        }))
        .expect("run");
    interrupter.join().expect("interrupter");

    assert!(!out.exit_err);
    assert_eq!(s.live_tasks(), 0, "live tasks survived shutdown");
    assert!(
        worker.borrow().as_ref().is_some_and(WorkerHandle::is_closed),
        "worker survived shutdown"
    );
    assert!(Time::since(start) < 5 * SECOND);
}
