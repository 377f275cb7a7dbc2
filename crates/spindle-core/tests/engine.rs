//! End-to-end engine scenarios: cross-thread submission, deadline
//! ordering, fair scheduling, stall detection, park/wake, and bounded
//! capacity.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use spindle_core::{
    Engine, EngineConfig, Progress, StallHandler, Task, TaskQueueBuilder,
};

fn single_loop_engine(cfs: bool) -> Engine {
    let config = EngineConfig::builder()
        .eventloop_count(1)
        .cfs(cfs)
        .target_latency(Duration::from_millis(1))
        .min_granularity(Duration::from_micros(50))
        .build()
        .expect("config");
    let engine = Engine::new(config).expect("engine");
    engine.start().expect("start");
    engine
}

fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}

fn burn(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        std::hint::spin_loop();
    }
}

#[test]
fn single_loop_echo() {
    let engine = single_loop_engine(false);
    let slot = Arc::new(Mutex::new(String::new()));

    let cell = Arc::clone(&slot);
    assert!(engine.handles()[0].offer(move || {
        *cell.lock().unwrap() = "ok".to_string();
    }));

    assert!(
        wait_until(Duration::from_millis(100), || slot.lock().unwrap().as_str() == "ok"),
        "offered task did not run"
    );

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn deadline_tasks_fire_in_deadline_order() {
    let engine = single_loop_engine(true);
    let firings = Arc::new(Mutex::new(Vec::new()));

    let recorder = Arc::clone(&firings);
    assert!(engine.handles()[0].offer_task(Task::cooperative(move |cx| {
        for (label, offset_ms) in [("p10", 10u64), ("p5", 5), ("p20", 20)] {
            let recorder = Arc::clone(&recorder);
            assert!(cx.schedule(
                move || recorder.lock().unwrap().push(label),
                Duration::from_millis(offset_ms),
            ));
        }
        Progress::Done
    })));

    assert!(
        wait_until(Duration::from_secs(2), || firings.lock().unwrap().len() == 3),
        "deadline tasks did not all fire"
    );
    assert_eq!(*firings.lock().unwrap(), vec!["p5", "p10", "p20"]);

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn one_shot_schedule_fires_no_earlier_than_delay() {
    let engine = single_loop_engine(true);
    let fired_at = Arc::new(Mutex::new(None::<Duration>));
    let scheduled_at = Instant::now();
    let delay = Duration::from_millis(20);

    let cell = Arc::clone(&fired_at);
    assert!(engine.handles()[0].offer_task(Task::cooperative(move |cx| {
        let cell = Arc::clone(&cell);
        assert!(cx.schedule(
            move || {
                *cell.lock().unwrap() = Some(scheduled_at.elapsed());
            },
            delay,
        ));
        Progress::Done
    })));

    assert!(
        wait_until(Duration::from_secs(2), || fired_at.lock().unwrap().is_some()),
        "scheduled task did not fire"
    );
    let elapsed = fired_at.lock().unwrap().expect("fired");
    assert!(elapsed >= delay, "fired early: {elapsed:?}");
    // Under no load the firing lands close to the deadline; the bound
    // here is deliberately loose for busy CI machines.
    assert!(elapsed < delay + Duration::from_millis(50), "fired late: {elapsed:?}");

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn fixed_rate_fires_floor_t_over_p_times() {
    let engine = single_loop_engine(true);
    let count = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&count);
    assert!(engine.handles()[0].offer_task(Task::cooperative(move |cx| {
        let counter = Arc::clone(&counter);
        let handle = cx.default_queue_handle();
        assert!(cx.schedule_at_fixed_rate(
            move || {
                counter.fetch_add(1, Ordering::Relaxed);
            },
            Duration::ZERO,
            Duration::from_millis(10),
            handle,
        ));
        Progress::Done
    })));

    std::thread::sleep(Duration::from_millis(500));
    let fired = count.load(Ordering::Relaxed);
    // ~50 firings in 500ms at 10ms period; wide margins for CI jitter.
    assert!((40..=60).contains(&fired), "fired {fired} times");

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn sleep_promise_completes() {
    let engine = single_loop_engine(true);
    let promise_slot = Arc::new(Mutex::new(None));

    let slot = Arc::clone(&promise_slot);
    assert!(engine.handles()[0].offer_task(Task::cooperative(move |cx| {
        let promise = cx.sleep(Duration::from_millis(10)).expect("sleep accepted");
        *slot.lock().unwrap() = Some(promise);
        Progress::Done
    })));

    assert!(
        wait_until(Duration::from_secs(2), || {
            promise_slot
                .lock()
                .unwrap()
                .as_ref()
                .is_some_and(spindle_core::Promise::is_completed)
        }),
        "sleep promise did not complete"
    );

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn cfs_gives_shares_proportional_cpu() {
    let engine = single_loop_engine(true);
    let count_a = Arc::new(AtomicU64::new(0));
    let count_b = Arc::new(AtomicU64::new(0));

    let a = Arc::clone(&count_a);
    let b = Arc::clone(&count_b);
    assert!(engine.handles()[0].offer_task(Task::cooperative(move |cx| {
        let queue_a = cx
            .create_task_queue(&TaskQueueBuilder::new("shares-1").shares(1))
            .expect("queue a");
        let queue_b = cx
            .create_task_queue(&TaskQueueBuilder::new("shares-3").shares(3))
            .expect("queue b");

        let a = Arc::clone(&a);
        let b = Arc::clone(&b);
        assert!(cx.offer_to(
            queue_a,
            Task::cooperative(move |_cx| {
                burn(Duration::from_micros(100));
                a.fetch_add(1, Ordering::Relaxed);
                Progress::More
            }),
        ));
        assert!(cx.offer_to(
            queue_b,
            Task::cooperative(move |_cx| {
                burn(Duration::from_micros(100));
                b.fetch_add(1, Ordering::Relaxed);
                Progress::More
            }),
        ));
        Progress::Done
    })));

    std::thread::sleep(Duration::from_secs(2));
    let a = count_a.load(Ordering::Relaxed) as f64;
    let b = count_b.load(Ordering::Relaxed) as f64;
    assert!(a > 0.0 && b > 0.0, "burn tasks did not run (a={a}, b={b})");
    let ratio = b / a;
    // Target is 3.0; the window tolerates scheduler jitter on shared
    // CI hardware.
    assert!((2.5..=3.5).contains(&ratio), "cpu ratio {ratio} (a={a}, b={b})");

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(10)));
}

#[derive(Debug, Default)]
struct RecordingStallHandler {
    stalls: Mutex<Vec<u64>>,
}

impl StallHandler for RecordingStallHandler {
    fn on_stall(&self, _loop_index: usize, _queue_name: &str, _start_nanos: u64, exec_nanos: u64) {
        self.stalls.lock().unwrap().push(exec_nanos);
    }
}

#[test]
fn stall_handler_fires_once_for_one_slow_task() {
    let handler = Arc::new(RecordingStallHandler::default());
    let config = EngineConfig::builder()
        .eventloop_count(1)
        .stall_threshold(Duration::from_millis(1))
        .stall_handler(Arc::clone(&handler) as Arc<dyn StallHandler>)
        .build()
        .expect("config");
    let engine = Engine::new(config).expect("engine");
    engine.start().expect("start");

    let done = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&done);
    assert!(engine.handles()[0].offer(move || {
        burn(Duration::from_millis(5));
        flag.store(1, Ordering::Release);
    }));

    assert!(
        wait_until(Duration::from_secs(2), || done.load(Ordering::Acquire) == 1),
        "slow task did not run"
    );

    let stalls = handler.stalls.lock().unwrap().clone();
    assert_eq!(stalls.len(), 1, "expected exactly one stall: {stalls:?}");
    assert!(
        stalls[0] >= 5_000_000,
        "stall exec {}ns < 5ms",
        stalls[0]
    );
    assert_eq!(engine.handles()[0].metrics().stalls, 1);

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn idle_loop_parks_and_wakes_on_offer() {
    let engine = single_loop_engine(true);

    // Give the loop time to drain startup work and park.
    std::thread::sleep(Duration::from_millis(50));
    let parks_before = engine.handles()[0].metrics().parks;
    assert!(parks_before >= 1, "idle loop never parked");

    for _ in 0..20 {
        let ran = Arc::new(AtomicUsize::new(0));
        let flag = Arc::clone(&ran);
        let submitted = Instant::now();
        assert!(engine.handles()[0].offer(move || {
            flag.store(1, Ordering::Release);
        }));
        assert!(
            wait_until(Duration::from_millis(100), || ran.load(Ordering::Acquire) == 1),
            "wakeup took over 100ms"
        );
        let latency = submitted.elapsed();
        assert!(latency < Duration::from_millis(100), "latency {latency:?}");
        // Let the loop re-park between rounds.
        std::thread::sleep(Duration::from_millis(5));
    }

    assert!(engine.handles()[0].metrics().parks > parks_before);

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn bounded_local_queue_rejects_fifth_offer() {
    let engine = single_loop_engine(true);
    let offers = Arc::new(Mutex::new(Vec::new()));
    let ran = Arc::new(AtomicUsize::new(0));

    let offer_results = Arc::clone(&offers);
    let run_counter = Arc::clone(&ran);
    assert!(engine.handles()[0].offer_task(Task::cooperative(move |cx| {
        let queue = cx
            .create_task_queue(&TaskQueueBuilder::new("bounded").local_capacity(4))
            .expect("queue");
        let mut results = Vec::new();
        for _ in 0..5 {
            let counter = Arc::clone(&run_counter);
            results.push(cx.offer_to(
                queue,
                Task::once(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                }),
            ));
        }
        *offer_results.lock().unwrap() = results;
        Progress::Done
    })));

    assert!(
        wait_until(Duration::from_secs(2), || ran.load(Ordering::Relaxed) == 4),
        "accepted tasks did not all run"
    );
    assert_eq!(*offers.lock().unwrap(), vec![true, true, true, true, false]);
    // Exactly the accepted four ran; nothing was silently lost.
    std::thread::sleep(Duration::from_millis(20));
    assert_eq!(ran.load(Ordering::Relaxed), 4);

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn panicking_task_does_not_kill_loop() {
    let engine = single_loop_engine(true);

    assert!(engine.handles()[0].offer(|| panic!("intentional test panic")));

    let ran = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&ran);
    assert!(engine.handles()[0].offer(move || {
        flag.store(1, Ordering::Release);
    }));

    assert!(
        wait_until(Duration::from_secs(2), || ran.load(Ordering::Acquire) == 1),
        "loop died after task panic"
    );
    assert_eq!(engine.handles()[0].metrics().task_failures, 1);

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn work_distributes_across_loops_by_hash() {
    let config = EngineConfig::builder()
        .eventloop_count(2)
        .build()
        .expect("config");
    let engine = Engine::new(config).expect("engine");
    engine.start().expect("start");

    let total = Arc::new(AtomicUsize::new(0));
    for key in 0..64u64 {
        let counter = Arc::clone(&total);
        assert!(engine.loop_for_hash(key).offer(move || {
            counter.fetch_add(1, Ordering::Relaxed);
        }));
    }

    assert!(
        wait_until(Duration::from_secs(2), || total.load(Ordering::Relaxed) == 64),
        "not all routed tasks ran"
    );
    let stats = engine.stats();
    assert_eq!(stats.loops.len(), 2);
    assert!(stats.total_tasks_processed >= 64);

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}

#[test]
fn spin_mode_runs_tasks_without_parking() {
    let config = EngineConfig::builder()
        .eventloop_count(1)
        .spin(true)
        .build()
        .expect("config");
    let engine = Engine::new(config).expect("engine");
    engine.start().expect("start");

    let ran = Arc::new(AtomicUsize::new(0));
    let flag = Arc::clone(&ran);
    assert!(engine.handles()[0].offer(move || {
        flag.store(1, Ordering::Release);
    }));
    assert!(
        wait_until(Duration::from_secs(2), || ran.load(Ordering::Acquire) == 1),
        "spin loop did not run the task"
    );
    assert_eq!(engine.handles()[0].metrics().parks, 0);

    engine.shutdown();
    assert!(engine.await_termination(Duration::from_secs(5)));
}
