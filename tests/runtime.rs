//! Consumer-level scenarios: driving fibers by hand and mixing fiber
//! and callback tasks on a shared scheduler.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use weft::fiber::{self, Fiber, State};
use weft::scheduler::{Scheduler, Task};

#[test]
fn manual_fiber_ping_pong() {
    let log = Arc::new(Mutex::new(Vec::<&'static str>::new()));
    let fiber = fiber::Builder::new().run_in_scheduler(false).spawn({
        let log = log.clone();
        move || {
            log.lock().unwrap().push("fiber in");
            fiber::yield_now();
            log.lock().unwrap().push("fiber back");
        }
    });

    log.lock().unwrap().push("main");
    fiber.resume();
    log.lock().unwrap().push("main between");
    fiber.resume();

    assert_eq!(fiber.state(), State::Term);
    assert_eq!(
        *log.lock().unwrap(),
        vec!["main", "fiber in", "main between", "fiber back"]
    );
}

#[test]
fn mixed_fibers_and_callbacks_drain() {
    // use_caller scheduling on a dedicated thread keeps the harness
    // thread free of runtime bindings.
    std::thread::spawn(|| {
        let sched = Scheduler::new(2, true, "mixed");
        let count = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let count = count.clone();
            if i % 2 == 0 {
                sched.spawn(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                });
            } else {
                sched.schedule(Task::from_fiber(Fiber::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                })));
            }
        }
        sched.start().unwrap();
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 10);
    })
    .join()
    .unwrap();
}

#[test]
fn reused_fiber_runs_again_when_rescheduled() {
    std::thread::spawn(|| {
        let sched = Scheduler::new(1, true, "reuse");
        let count = Arc::new(AtomicUsize::new(0));

        let fiber = Fiber::new({
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
            }
        });
        sched.schedule(Task::from_fiber(fiber.clone()));
        sched.start().unwrap();
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), State::Term);

        // Attach a fresh callback to the terminated fiber and drive it
        // by hand; reset is the only road out of Term.
        fiber.reset({
            let count = count.clone();
            move || {
                count.fetch_add(10, Ordering::SeqCst);
            }
        });
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(count.load(Ordering::SeqCst), 11);
    })
    .join()
    .unwrap();
}
