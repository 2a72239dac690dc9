//! Cooperative task scheduling across a pool of worker threads.
//!
//! A [`Scheduler`] owns a FIFO queue of [`Task`]s (fibers or bare
//! callbacks, optionally pinned to one worker) and a fixed set of OS
//! threads draining it. Each worker alternates between running ready
//! fibers and entering a per-thread idle fiber that gives the thread
//! back when nothing is queued. With `use_caller` the constructing
//! thread itself becomes a worker: a driver fiber wrapping the worker
//! loop is attached to it and runs when [`Scheduler::stop`] is called.
//!
//! The idle routine, the wake-up side channel and the stop predicate
//! are customization points; the I/O manager plugs into all three to
//! replace sleepy idling with readiness-driven blocking.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::error::Result;
use crate::fiber::{self, Fiber, State};
use crate::thread::Thread;

thread_local! {
    static CURRENT: RefCell<Option<Weak<Scheduler>>> = RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// Task
////////////////////////////////////////////////////////////////////////////////

enum Job {
    Fiber(Arc<Fiber>),
    Call(Box<dyn FnOnce() + Send>),
}

/// One unit of schedulable work: a fiber to resume or a callback to run
/// inside a transient fiber, with an optional worker affinity.
pub struct Task {
    job: Job,
    thread: Option<libc::pid_t>,
}

impl Task {
    pub fn from_fn<F>(cb: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Task {
            job: Job::Call(Box::new(cb)),
            thread: None,
        }
    }

    pub fn from_fiber(fiber: Arc<Fiber>) -> Self {
        Task {
            job: Job::Fiber(fiber),
            thread: None,
        }
    }

    /// Restricts the task to the worker with the given kernel thread
    /// id. Other workers skip it and re-tickle so an eligible worker
    /// sees it.
    pub fn pin_to(mut self, thread: libc::pid_t) -> Self {
        self.thread = Some(thread);
        self
    }
}

////////////////////////////////////////////////////////////////////////////////
// Hooks
////////////////////////////////////////////////////////////////////////////////

/// Customization points the I/O manager layers over the scheduler.
pub(crate) trait SchedulerHooks: Send + Sync {
    /// Wake a parked worker because new work appeared.
    fn tickle(&self);

    /// One round of the idle routine. Returns true when the worker
    /// loops may exit; the caller yields between rounds.
    fn idle_tick(&self) -> bool;

    /// Whether the scheduler as a whole may shut down.
    fn stopping(&self) -> bool;

    /// Per-worker-thread bootstrap.
    fn on_thread_start(&self);
}

////////////////////////////////////////////////////////////////////////////////
// Scheduler
////////////////////////////////////////////////////////////////////////////////

/// Multi-producer multi-consumer fiber scheduler.
pub struct Scheduler {
    name: String,
    queue: Mutex<VecDeque<Task>>,
    workers: Mutex<Vec<Thread>>,
    /// Threads to spawn in `start`; excludes the caller.
    spawn_count: usize,
    active: AtomicUsize,
    idle: AtomicUsize,
    use_caller: bool,
    /// Kernel id of the participating caller thread, -1 otherwise.
    root_thread: libc::pid_t,
    driver: OnceCell<Arc<Fiber>>,
    stop_requested: AtomicBool,
    hooks: OnceCell<Weak<dyn SchedulerHooks>>,
}

impl Scheduler {
    /// Creates a scheduler with `threads` workers.
    ///
    /// When `use_caller` is set the calling thread participates as a
    /// worker and counts toward `threads`; a driver fiber wrapping the
    /// worker loop is attached to it and executes during `stop`. The
    /// thread must not already host a scheduler.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Arc<Scheduler> {
        assert!(threads >= 1, "a scheduler needs at least one worker");

        let (spawn_count, root_thread) = if use_caller {
            (threads - 1, Thread::current_id())
        } else {
            (threads, -1)
        };

        let sched = Arc::new(Scheduler {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::new()),
            workers: Mutex::new(Vec::new()),
            spawn_count,
            active: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            use_caller,
            root_thread,
            driver: OnceCell::new(),
            stop_requested: AtomicBool::new(false),
            hooks: OnceCell::new(),
        });

        if use_caller {
            assert!(
                Scheduler::current().is_none(),
                "thread already participates in a scheduler"
            );
            Thread::set_current_name(name);
            bind_current(&sched);

            // Capture the caller's native context before attaching a
            // driver on top of it.
            Fiber::current();
            let weak = Arc::downgrade(&sched);
            let driver = fiber::Builder::new()
                .run_in_scheduler(false)
                .spawn(move || {
                    if let Some(sched) = weak.upgrade() {
                        sched.run();
                    }
                });
            fiber::set_scheduler_fiber(&driver);
            sched
                .driver
                .set(driver)
                .unwrap_or_else(|_| unreachable!("driver attached twice"));
        }

        log::debug!("scheduler {} created", sched.name);
        sched
    }

    /// The scheduler the calling thread works for, if any.
    pub fn current() -> Option<Arc<Scheduler>> {
        CURRENT.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True while at least one worker sits in its idle fiber.
    pub fn has_idle_workers(&self) -> bool {
        self.idle.load(Ordering::SeqCst) > 0
    }

    /// Queues a task. Pushing into an empty queue issues one tickle.
    pub fn schedule(&self, task: Task) {
        let need_tickle = {
            let mut queue = self.queue.lock().expect("task queue poisoned");
            let was_empty = queue.is_empty();
            queue.push_back(task);
            was_empty
        };
        if need_tickle {
            self.tickle();
        }
    }

    /// Queues a bare callback.
    pub fn spawn<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule(Task::from_fn(cb));
    }

    /// Spawns the worker threads. With `use_caller` the caller's own
    /// worker loop only runs later, inside `stop`.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.stop_requested.load(Ordering::SeqCst) {
            log::error!("start() on a stopped scheduler {}", self.name);
            return Ok(());
        }
        let mut workers = self.workers.lock().expect("worker list poisoned");
        assert!(workers.is_empty(), "scheduler started twice");
        for i in 0..self.spawn_count {
            let sched = self.clone();
            let worker = Thread::spawn(move || sched.run(), &format!("{}_{}", self.name, i))?;
            workers.push(worker);
        }
        log::debug!("scheduler {} started {} workers", self.name, self.spawn_count);
        Ok(())
    }

    /// Requests shutdown and waits for every queued task to finish and
    /// every worker to join.
    ///
    /// With `use_caller` this must run on the scheduler's own thread:
    /// the remaining work is drained right here through the driver
    /// fiber. Without `use_caller` it must not run on one of the
    /// scheduler's workers.
    pub fn stop(self: &Arc<Self>) {
        if self.stopping() {
            return;
        }
        self.stop_requested.store(true, Ordering::SeqCst);

        if self.use_caller {
            assert!(
                Scheduler::current().map_or(false, |s| Arc::ptr_eq(&s, self)),
                "stop() must run on the thread that uses the scheduler"
            );
        } else {
            assert!(
                Scheduler::current().map_or(true, |s| !Arc::ptr_eq(&s, self)),
                "stop() must not run on one of the scheduler's workers"
            );
        }

        for _ in 0..self.spawn_count {
            self.tickle();
        }
        let driver = self.driver.get();
        if driver.is_some() {
            self.tickle();
        }
        if let Some(driver) = driver {
            // Drain the queue on the calling thread.
            driver.resume();
            log::debug!("driver fiber of {} finished", self.name);
        }

        let mut workers = {
            let mut guard = self.workers.lock().expect("worker list poisoned");
            std::mem::take(&mut *guard)
        };
        for worker in &mut workers {
            worker.join();
        }
        log::debug!("scheduler {} stopped", self.name);
    }

    /// True when shutdown was requested, the queue is drained and no
    /// worker holds a task.
    pub fn stopping(&self) -> bool {
        match self.hooks() {
            Some(hooks) => hooks.stopping(),
            None => self.base_stopping(),
        }
    }

    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_requested.load(Ordering::SeqCst)
            && self.queue.lock().expect("task queue poisoned").is_empty()
            && self.active.load(Ordering::SeqCst) == 0
    }

    pub(crate) fn set_hooks(&self, hooks: Weak<dyn SchedulerHooks>) {
        if self.hooks.set(hooks).is_err() {
            panic!("scheduler hooks installed twice");
        }
    }

    fn hooks(&self) -> Option<Arc<dyn SchedulerHooks>> {
        self.hooks.get().and_then(Weak::upgrade)
    }

    fn tickle(&self) {
        if let Some(hooks) = self.hooks() {
            hooks.tickle();
        }
    }

    /// The worker loop. Runs on every spawned worker thread and, for
    /// `use_caller`, inside the driver fiber on the constructing
    /// thread.
    fn run(self: &Arc<Self>) {
        let thread_id = Thread::current_id();
        log::debug!("worker loop starting in thread {}", thread_id);

        bind_current(self);
        if let Some(hooks) = self.hooks() {
            hooks.on_thread_start();
        }
        if thread_id != self.root_thread {
            // Capture the main fiber; it doubles as this thread's
            // driver context.
            Fiber::current();
        }

        let idle_fiber = {
            let sched = self.clone();
            Fiber::new(move || sched.idle_main())
        };

        loop {
            let mut task = None;
            let mut tickle_me = false;
            {
                let mut queue = self.queue.lock().expect("task queue poisoned");
                let mut i = 0;
                while i < queue.len() {
                    if let Some(pinned) = queue[i].thread {
                        if pinned != thread_id {
                            // Someone else has to run it.
                            tickle_me = true;
                            i += 1;
                            continue;
                        }
                    }
                    task = queue.remove(i);
                    self.active.fetch_add(1, Ordering::SeqCst);
                    break;
                }
                tickle_me = tickle_me || !queue.is_empty();
            }

            if tickle_me {
                self.tickle();
            }

            match task {
                Some(Task {
                    job: Job::Fiber(fiber),
                    ..
                }) => {
                    fiber.resume_protected();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                Some(Task {
                    job: Job::Call(cb), ..
                }) => {
                    // A transient fiber hosts the callback; if the
                    // callback parks itself the event slot keeps the
                    // fiber alive, otherwise it dies here.
                    let fiber = Fiber::new(cb);
                    fiber.resume_protected();
                    self.active.fetch_sub(1, Ordering::SeqCst);
                }
                None => {
                    if idle_fiber.state() == State::Term {
                        log::debug!("worker loop ending in thread {}", thread_id);
                        break;
                    }
                    self.idle.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }

    /// Body of the per-worker idle fiber: run idle rounds until the
    /// stop predicate holds, yielding back to the worker loop between
    /// rounds. Holding the hook handle only within a round keeps the
    /// I/O manager collectable.
    fn idle_main(&self) {
        loop {
            let done = match self.hooks() {
                Some(hooks) => hooks.idle_tick(),
                None => self.base_idle_tick(),
            };
            if done {
                break;
            }
            fiber::yield_now();
        }
    }

    /// Default idle round: nap briefly, then let the worker rescan the
    /// queue. Readiness-driven blocking lives in the I/O manager's
    /// override.
    fn base_idle_tick(&self) -> bool {
        if self.stopping() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
        false
    }
}

fn bind_current(sched: &Arc<Scheduler>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(Arc::downgrade(sched)));
}
