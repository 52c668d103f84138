//! Phase-ordering scenarios for the event loop.
//!
//! Covers the documented ordering contract: next-tick microtasks before
//! generic ticks, generic ticks before immediates, immediates before I/O,
//! I/O before timers, and the starvation-avoidance rule after a consumed
//! fatal during tick draining.

use noderun::runtime::{LabSelector, RuntimeConfig, ScriptRuntime, ScriptSource};
use noderun::test_utils::{init_test_logging, TestProcess, TestRegistry};
use noderun::{Sandbox, ScriptError};
use std::sync::{Arc, Mutex};

type Trace = Arc<Mutex<Vec<&'static str>>>;

fn init_test(name: &str) {
    init_test_logging();
    noderun::test_phase!(name);
}

fn mark(trace: &Trace, label: &'static str) {
    trace.lock().unwrap().push(label);
}

fn build_runtime(
    process: &TestProcess,
    registry: TestRegistry,
    selector: Arc<LabSelector>,
) -> ScriptRuntime {
    ScriptRuntime::with_selector(
        ScriptSource::Repl { force: false },
        Vec::new(),
        Box::new(process.clone()),
        Arc::new(registry),
        Sandbox::new(),
        RuntimeConfig::default(),
        selector,
    )
    .expect("runtime construction failed")
}

#[test]
fn next_ticks_run_before_ticks_before_immediates_before_timers() {
    init_test("next_ticks_run_before_ticks_before_immediates_before_timers");
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let process = TestProcess::new();
    let registry = TestRegistry::new();

    {
        let t = Arc::clone(&trace);
        process.push_next_tick(move || mark(&t, "next-tick"));
    }
    {
        let t = Arc::clone(&trace);
        process.push_immediate(move || mark(&t, "immediate"));
    }
    {
        let t = Arc::clone(&trace);
        registry.set_main(Box::new(move |state| {
            let tick_trace = Arc::clone(&t);
            state.handle().enqueue_task(Box::new(move |_| {
                mark(&tick_trace, "tick");
                Ok(())
            }));
            let timer_trace = Arc::clone(&t);
            state.create_timer(
                0,
                false,
                0,
                Box::new(move |_| {
                    mark(&timer_trace, "timer");
                    Ok(())
                }),
            );
            Ok(())
        }));
    }

    let mut runtime = build_runtime(&process, registry, Arc::new(LabSelector::new()));
    let status = runtime.run();
    assert!(status.is_ok(), "unexpected status: {status}");
    let order = trace.lock().unwrap().clone();
    noderun::assert_with_log!(
        order == ["next-tick", "tick", "immediate", "timer"],
        "phases fire in documented order",
        ["next-tick", "tick", "immediate", "timer"],
        order
    );
    noderun::test_complete!("next_ticks_run_before_ticks_before_immediates_before_timers");
}

#[test]
fn next_ticks_enqueued_during_the_drain_still_precede_ticks() {
    init_test("next_ticks_enqueued_during_the_drain_still_precede_ticks");
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let process = TestProcess::new();
    let registry = TestRegistry::new();

    {
        let t = Arc::clone(&trace);
        let p = process.clone();
        process.push_next_tick(move || {
            mark(&t, "next-tick-1");
            let t2 = Arc::clone(&t);
            p.push_next_tick(move || mark(&t2, "next-tick-2"));
        });
    }
    {
        let t = Arc::clone(&trace);
        registry.set_main(Box::new(move |state| {
            let t = Arc::clone(&t);
            state.handle().enqueue_task(Box::new(move |_| {
                mark(&t, "tick");
                Ok(())
            }));
            Ok(())
        }));
    }

    let mut runtime = build_runtime(&process, registry, Arc::new(LabSelector::new()));
    runtime.run();
    assert_eq!(
        *trace.lock().unwrap(),
        vec!["next-tick-1", "next-tick-2", "tick"]
    );
    noderun::test_complete!("next_ticks_enqueued_during_the_drain_still_precede_ticks");
}

#[test]
fn io_readiness_dispatches_before_timers() {
    init_test("io_readiness_dispatches_before_timers");
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let process = TestProcess::new();
    let registry = TestRegistry::new();
    let selector = Arc::new(LabSelector::new());
    selector.inject(noderun::runtime::Event::readable(noderun::runtime::Token::new(1)));

    {
        let t = Arc::clone(&trace);
        registry.set_main(Box::new(move |state| {
            let tick_trace = Arc::clone(&t);
            state.handle().enqueue_task(Box::new(move |_| {
                mark(&tick_trace, "tick");
                Ok(())
            }));

            let io_trace = Arc::clone(&t);
            state.attach_handler(
                noderun::runtime::Token::new(1),
                Box::new(
                    move |_event: noderun::runtime::Event, _state: &mut noderun::RuntimeState|
                          -> Result<(), ScriptError> {
                        mark(&io_trace, "io");
                        Ok(())
                    },
                ),
            );

            let timer_trace = Arc::clone(&t);
            state.create_timer(
                0,
                false,
                0,
                Box::new(move |_| {
                    mark(&timer_trace, "timer");
                    Ok(())
                }),
            );
            Ok(())
        }));
    }

    let mut runtime = build_runtime(&process, registry, selector);
    runtime.run();
    assert_eq!(*trace.lock().unwrap(), vec!["tick", "io", "timer"]);
    noderun::test_complete!("io_readiness_dispatches_before_timers");
}

#[test]
fn consumed_fatal_stops_tick_draining_but_not_timers() {
    init_test("consumed_fatal_stops_tick_draining_but_not_timers");
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let process = TestProcess::new();
    process.set_fatal_handler(|_| Ok(true));
    let registry = TestRegistry::new();

    {
        let t = Arc::clone(&trace);
        registry.set_main(Box::new(move |state| {
            let g1 = Arc::clone(&t);
            state.handle().enqueue_task(Box::new(move |_| {
                mark(&g1, "g1");
                Err(ScriptError::js("g1 failed"))
            }));
            let g2 = Arc::clone(&t);
            state.handle().enqueue_task(Box::new(move |_| {
                mark(&g2, "g2");
                Ok(())
            }));
            let timer = Arc::clone(&t);
            state.create_timer(
                0,
                false,
                0,
                Box::new(move |_| {
                    mark(&timer, "timer");
                    Ok(())
                }),
            );
            Ok(())
        }));
    }

    let mut runtime = build_runtime(&process, registry, Arc::new(LabSelector::new()));
    let status = runtime.run();
    assert!(status.is_ok(), "unexpected status: {status}");
    // g2 stays queued for the next iteration; the same iteration's timer
    // still fires, so errors cannot starve timers.
    let order = trace.lock().unwrap().clone();
    noderun::assert_with_log!(
        order == ["g1", "timer", "g2"],
        "consumed fatal yields to timers before the queue resumes",
        ["g1", "timer", "g2"],
        order
    );
    noderun::test_complete!("consumed_fatal_stops_tick_draining_but_not_timers");
}

#[test]
fn consumed_fatal_in_next_ticks_keeps_the_iteration_going() {
    init_test("consumed_fatal_in_next_ticks_keeps_the_iteration_going");
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let process = TestProcess::new();
    process.set_fatal_handler(|_| Ok(true));
    process.push_next_tick_failing(|| Err(ScriptError::js("next-tick failed")));

    let registry = TestRegistry::new();
    {
        let t = Arc::clone(&trace);
        registry.set_main(Box::new(move |state| {
            let t = Arc::clone(&t);
            state.handle().enqueue_task(Box::new(move |_| {
                mark(&t, "tick");
                Ok(())
            }));
            Ok(())
        }));
    }

    let mut runtime = build_runtime(&process, registry, Arc::new(LabSelector::new()));
    let status = runtime.run();
    assert!(status.is_ok(), "unexpected status: {status}");
    assert_eq!(*trace.lock().unwrap(), vec!["tick"]);
    noderun::test_complete!("consumed_fatal_in_next_ticks_keeps_the_iteration_going");
}

#[test]
fn rejected_fatal_ends_the_loop_with_the_error() {
    init_test("rejected_fatal_ends_the_loop_with_the_error");
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let process = TestProcess::new();
    process.set_fatal_handler(|_| Ok(false));
    let registry = TestRegistry::new();

    {
        let t = Arc::clone(&trace);
        registry.set_main(Box::new(move |state| {
            state
                .handle()
                .enqueue_task(Box::new(|_| Err(ScriptError::js("fatal"))));
            let after = Arc::clone(&t);
            state.handle().enqueue_task(Box::new(move |_| {
                mark(&after, "after");
                Ok(())
            }));
            Ok(())
        }));
    }

    let mut runtime = build_runtime(&process, registry, Arc::new(LabSelector::new()));
    let status = runtime.run();
    assert!(status.cause().is_some());
    assert!(trace.lock().unwrap().is_empty());
    noderun::test_complete!("rejected_fatal_ends_the_loop_with_the_error");
}

#[test]
fn cancelled_tick_is_dequeued_but_skipped() {
    init_test("cancelled_tick_is_dequeued_but_skipped");
    let trace: Trace = Arc::new(Mutex::new(Vec::new()));
    let process = TestProcess::new();
    let registry = TestRegistry::new();

    {
        let t = Arc::clone(&trace);
        registry.set_main(Box::new(move |state| {
            let cancelled_trace = Arc::clone(&t);
            let handle = state.handle();
            handle.create_timed_task(
                Box::new(move || mark(&cancelled_trace, "cancelled")),
                std::time::Duration::ZERO,
                false,
                None,
            )
            .cancel();

            let kept = Arc::clone(&t);
            handle.enqueue_task(Box::new(move |_| {
                mark(&kept, "kept");
                Ok(())
            }));
            Ok(())
        }));
    }

    let mut runtime = build_runtime(&process, registry, Arc::new(LabSelector::new()));
    runtime.run();
    assert_eq!(*trace.lock().unwrap(), vec!["kept"]);
    noderun::test_complete!("cancelled_tick_is_dequeued_but_skipped");
}
