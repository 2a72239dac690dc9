//! Readiness-driven scheduling over epoll.
//!
//! [`IoManager`] extends the [`Scheduler`] with an event loop: instead
//! of napping, idle workers block in `epoll_wait` until a watched file
//! descriptor becomes ready, a timer expires, or a one-byte "tickle"
//! arrives over an internal pipe announcing new work. Pending handlers
//! (a callback to run or a fiber to resume) are parked per descriptor
//! and per direction, and are handed back to the scheduler as ordinary
//! tasks when the kernel reports readiness.
//!
//! Registrations are edge-triggered and one-shot: firing a handler
//! removes its subscription, and the handler must drain the descriptor
//! and re-register if it wants more. Descriptors must be made
//! non-blocking by the caller; the runtime never rewires ordinary I/O
//! calls.

use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::error::{Error, Result};
use crate::fiber::{Fiber, State};
use crate::scheduler::{Scheduler, SchedulerHooks, Task};
use crate::timer::{Timer, TimerCallback, TimerHooks, TimerManager};

bitflags::bitflags! {
    /// Readiness events a descriptor can be watched for. The values
    /// match the kernel's (`EPOLLIN`, `EPOLLOUT`).
    pub struct Event: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

/// Callback fired when a watched event becomes ready.
pub type EventCallback = Box<dyn FnOnce() + Send>;

/// How many descriptors the context table starts with.
const INITIAL_CONTEXTS: usize = 32;
/// Batch size for one `epoll_wait`.
const MAX_EVENTS: usize = 256;
/// Upper bound on how long an idle worker blocks, so the stop flag and
/// externally queued work are noticed even without a tickle.
const MAX_TIMEOUT_MS: u64 = 5000;

thread_local! {
    static CURRENT: RefCell<Option<Weak<IoManager>>> = RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// FdContext
////////////////////////////////////////////////////////////////////////////////

/// The parked subscriber for one direction: a fiber to resume or a
/// callback to invoke, never both.
enum Waiter {
    Fiber(Arc<Fiber>),
    Callback(EventCallback),
}

struct EventContext {
    /// Scheduler of the registering thread; the work is handed back to
    /// it when the event fires.
    scheduler: Weak<Scheduler>,
    waiter: Waiter,
}

struct FdState {
    /// Current subscription mask. A bit is set iff the matching slot
    /// below is occupied.
    events: Event,
    read: Option<EventContext>,
    write: Option<EventContext>,
}

/// Per-descriptor bookkeeping, one entry per raw fd number.
struct FdContext {
    fd: RawFd,
    state: Mutex<FdState>,
}

impl FdState {
    fn slot_mut(&mut self, ev: Event) -> &mut Option<EventContext> {
        if ev == Event::READ {
            &mut self.read
        } else if ev == Event::WRITE {
            &mut self.write
        } else {
            panic!("exactly one event bit expected, got {:?}", ev);
        }
    }

    /// Clears the bit and hands the pending handler to its scheduler.
    /// Firing consumes the subscription.
    fn trigger(&mut self, ev: Event) {
        assert!(self.events.contains(ev), "triggering an unset event");
        self.events.remove(ev);
        let ctx = self
            .slot_mut(ev)
            .take()
            .expect("event bit set without a pending handler");
        match ctx.scheduler.upgrade() {
            Some(scheduler) => match ctx.waiter {
                Waiter::Fiber(fiber) => scheduler.schedule(Task::from_fiber(fiber)),
                Waiter::Callback(cb) => scheduler.schedule(Task::from_fn(cb)),
            },
            None => log::warn!("dropping ready event, its scheduler is gone"),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// IoManager
////////////////////////////////////////////////////////////////////////////////

/// A scheduler whose idle loop multiplexes file-descriptor readiness
/// and timer deadlines.
pub struct IoManager {
    scheduler: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    epfd: RawFd,
    /// `[read end, write end]` of the tickle pipe.
    tickle_fds: [RawFd; 2],
    /// Subscriptions currently armed across all descriptors.
    pending: AtomicUsize,
    /// Indexed by raw fd number; grows, never shrinks.
    contexts: RwLock<Vec<Arc<FdContext>>>,
    self_ref: OnceCell<Weak<IoManager>>,
}

impl IoManager {
    /// Builds the event loop and starts its workers immediately.
    ///
    /// Creates the epoll instance and the tickle pipe (read end
    /// non-blocking, watched edge-triggered), then starts a
    /// [`Scheduler`] whose idle routine blocks on readiness instead of
    /// sleeping.
    pub fn new(threads: usize, use_caller: bool, name: &str) -> Result<Arc<IoManager>> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        let mut tickle_fds: [RawFd; 2] = [0; 2];
        if unsafe { libc::pipe(tickle_fds.as_mut_ptr()) } != 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(epfd) };
            return Err(err.into());
        }

        if let Err(err) = register_tickle(epfd, tickle_fds[0]) {
            unsafe {
                libc::close(epfd);
                libc::close(tickle_fds[0]);
                libc::close(tickle_fds[1]);
            }
            return Err(err.into());
        }

        let manager = Arc::new(IoManager {
            scheduler: Scheduler::new(threads, use_caller, name),
            timers: TimerManager::new(),
            epfd,
            tickle_fds,
            pending: AtomicUsize::new(0),
            contexts: RwLock::new(Vec::new()),
            self_ref: OnceCell::new(),
        });
        manager
            .self_ref
            .set(Arc::downgrade(&manager))
            .unwrap_or_else(|_| unreachable!("self reference set twice"));

        grow(
            &mut manager.contexts.write().expect("context table poisoned"),
            INITIAL_CONTEXTS,
        );

        let sched_dyn: Arc<dyn SchedulerHooks> = manager.clone();
        let sched_hooks: Weak<dyn SchedulerHooks> = Arc::downgrade(&sched_dyn);
        manager.scheduler.set_hooks(sched_hooks);
        let timer_dyn: Arc<dyn TimerHooks> = manager.clone();
        let timer_hooks: Weak<dyn TimerHooks> = Arc::downgrade(&timer_dyn);
        manager.timers.set_hooks(timer_hooks);

        if use_caller {
            CURRENT.with(|c| *c.borrow_mut() = Some(Arc::downgrade(&manager)));
        }
        manager.scheduler.start()?;
        log::debug!("io manager {} running", manager.scheduler.name());
        Ok(manager)
    }

    /// The I/O manager the calling thread works for, if any.
    pub fn current() -> Option<Arc<IoManager>> {
        CURRENT.with(|c| c.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// Watches `fd` for one readiness event.
    ///
    /// `ev` must be a single bit. With a callback the callback runs
    /// when the event fires; without one the *currently running fiber*
    /// is parked and resumed instead, so `None` is only meaningful from
    /// inside a worker fiber that yields right after registering.
    ///
    /// The subscription is one-shot: firing removes it. Registering a
    /// bit that is already set fails with
    /// [`Error::EventAlreadyRegistered`] and leaves the existing
    /// subscription untouched.
    pub fn add_event(&self, fd: RawFd, ev: Event, cb: Option<EventCallback>) -> Result<()> {
        assert!(
            ev == Event::READ || ev == Event::WRITE,
            "exactly one event bit expected, got {:?}",
            ev
        );
        let ctx = self.context(fd);
        let mut state = ctx.state.lock().expect("fd context poisoned");

        if state.events.contains(ev) {
            return Err(Error::EventAlreadyRegistered(fd, ev));
        }

        let op = if state.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mask = libc::EPOLLET as u32 | (state.events | ev).bits();
        let mut epevent = libc::epoll_event {
            events: mask,
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epevent) } != 0 {
            let err = io::Error::last_os_error();
            log::error!("epoll_ctl(add, fd {}) failed: {}", fd, err);
            return Err(err.into());
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        state.events.insert(ev);

        let waiter = match cb {
            Some(cb) => Waiter::Callback(cb),
            None => {
                let fiber = Fiber::current();
                assert_eq!(
                    fiber.state(),
                    State::Running,
                    "only a running fiber can park itself"
                );
                Waiter::Fiber(fiber)
            }
        };
        let scheduler = Scheduler::current().unwrap_or_else(|| self.scheduler.clone());
        *state.slot_mut(ev) = Some(EventContext {
            scheduler: Arc::downgrade(&scheduler),
            waiter,
        });
        Ok(())
    }

    /// Drops the subscription for `ev` without firing the pending
    /// handler. Returns false if the bit was not set.
    pub fn del_event(&self, fd: RawFd, ev: Event) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = ctx.state.lock().expect("fd context poisoned");
        if !state.events.contains(ev) {
            return false;
        }

        let remaining = state.events - ev;
        if !self.rearm(fd, remaining) {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        state.events = remaining;
        *state.slot_mut(ev) = None;
        true
    }

    /// Drops the subscription for `ev` and fires its pending handler
    /// right away instead of waiting for readiness.
    pub fn cancel_event(&self, fd: RawFd, ev: Event) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = ctx.state.lock().expect("fd context poisoned");
        if !state.events.contains(ev) {
            return false;
        }

        let remaining = state.events - ev;
        if !self.rearm(fd, remaining) {
            return false;
        }
        state.trigger(ev);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Unsubscribes the descriptor entirely, firing whatever was
    /// pending in both directions.
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let ctx = match self.lookup(fd) {
            Some(ctx) => ctx,
            None => return false,
        };
        let mut state = ctx.state.lock().expect("fd context poisoned");
        if state.events.is_empty() {
            return false;
        }

        if !self.rearm(fd, Event::empty()) {
            return false;
        }
        if state.events.contains(Event::READ) {
            state.trigger(Event::READ);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if state.events.contains(Event::WRITE) {
            state.trigger(Event::WRITE);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        assert!(state.events.is_empty());
        true
    }

    /// Number of armed subscriptions.
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn name(&self) -> &str {
        self.scheduler.name()
    }

    /// The underlying scheduler.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Queues a task on the underlying scheduler.
    pub fn schedule(&self, task: Task) {
        self.scheduler.schedule(task);
    }

    /// Queues a bare callback on the underlying scheduler.
    pub fn spawn<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.scheduler.spawn(cb);
    }

    /// Schedules a timer whose callback is queued on this manager's
    /// scheduler when it expires.
    pub fn add_timer<F>(&self, period: Duration, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.timers.add_timer(period, cb, recurring)
    }

    /// [`TimerManager::add_condition_timer`] on the embedded manager.
    pub fn add_condition_timer<F, T>(
        &self,
        period: Duration,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.timers.add_condition_timer(period, cb, cond, recurring)
    }

    /// Shuts the event loop down: every queued task runs to completion
    /// and every worker joins. With `use_caller` this must run on the
    /// constructing thread.
    pub fn stop(&self) {
        self.scheduler.stop();
    }

    /// Re-registers `fd` with the residual mask, or deletes the kernel
    /// subscription when nothing remains. Logs and returns false on
    /// kernel refusal.
    fn rearm(&self, fd: RawFd, remaining: Event) -> bool {
        let op = if remaining.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut epevent = libc::epoll_event {
            events: libc::EPOLLET as u32 | remaining.bits(),
            u64: fd as u64,
        };
        if unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut epevent) } != 0 {
            log::error!(
                "epoll_ctl(rearm, fd {}) failed: {}",
                fd,
                io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    /// Entry for `fd`, growing the table to at least 1.5x the fd when
    /// it is out of range.
    fn context(&self, fd: RawFd) -> Arc<FdContext> {
        assert!(fd >= 0, "negative fd");
        {
            let table = self.contexts.read().expect("context table poisoned");
            if let Some(ctx) = table.get(fd as usize) {
                return ctx.clone();
            }
        }
        let mut table = self.contexts.write().expect("context table poisoned");
        let target = ((fd as usize) * 3 / 2).max(fd as usize + 1);
        grow(&mut table, target);
        table[fd as usize].clone()
    }

    /// Entry for `fd` if the table already covers it.
    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        self.contexts
            .read()
            .expect("context table poisoned")
            .get(fd as usize)
            .cloned()
    }

    /// One round of the readiness loop: block until a descriptor
    /// fires, a timer is due, or a tickle arrives; then dispatch.
    fn readiness_round(&self) {
        let mut events: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };

        let n = loop {
            let timeout = self
                .timers
                .next_timer_ms()
                .unwrap_or(MAX_TIMEOUT_MS)
                .min(MAX_TIMEOUT_MS);
            let rc = unsafe {
                libc::epoll_wait(
                    self.epfd,
                    events.as_mut_ptr(),
                    MAX_EVENTS as i32,
                    timeout as i32,
                )
            };
            if rc >= 0 {
                break rc as usize;
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            panic!("epoll_wait failed: {}", err);
        };

        // Due timers first, in deadline order.
        for cb in self.timers.list_expired() {
            self.dispatch_timer(cb);
        }

        for ev in events[..n].iter() {
            let data = ev.u64;
            if data == self.tickle_fds[0] as u64 {
                self.drain_tickle();
                continue;
            }

            let ctx = match self.lookup(data as RawFd) {
                Some(ctx) => ctx,
                None => continue,
            };
            let mut state = ctx.state.lock().expect("fd context poisoned");

            // Errors and hangups wake whatever is subscribed.
            let mut revents = ev.events;
            if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & state.events.bits();
            }
            let ready = Event::from_bits_truncate(revents) & state.events;
            if ready.is_empty() {
                continue;
            }

            let remaining = state.events - ready;
            if !self.rearm(ctx.fd, remaining) {
                continue;
            }
            if ready.contains(Event::READ) {
                state.trigger(Event::READ);
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
            if ready.contains(Event::WRITE) {
                state.trigger(Event::WRITE);
                self.pending.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }

    fn dispatch_timer(&self, cb: TimerCallback) {
        self.scheduler.schedule(Task::from_fn(move || cb()));
    }

    fn drain_tickle(&self) {
        let mut buf = [0u8; 256];
        loop {
            let rc = unsafe {
                libc::read(
                    self.tickle_fds[0],
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                )
            };
            if rc <= 0 {
                break;
            }
        }
    }
}

impl SchedulerHooks for IoManager {
    /// Wakes the readiness wait by writing one byte to the pipe. A
    /// no-op while some worker is already idle.
    fn tickle(&self) {
        if self.scheduler.has_idle_workers() {
            return;
        }
        let rc = unsafe {
            libc::write(
                self.tickle_fds[1],
                b"T".as_ptr() as *const libc::c_void,
                1,
            )
        };
        assert_eq!(rc, 1, "tickle write failed: {}", io::Error::last_os_error());
    }

    fn idle_tick(&self) -> bool {
        if SchedulerHooks::stopping(self) {
            log::debug!("io manager {} idle loop exiting", self.scheduler.name());
            return true;
        }
        self.readiness_round();
        false
    }

    /// The loop may only wind down once nothing can ever fire again:
    /// no timer scheduled, no subscription armed, and the base
    /// scheduler drained.
    fn stopping(&self) -> bool {
        !self.timers.has_timer()
            && self.pending.load(Ordering::SeqCst) == 0
            && self.scheduler.base_stopping()
    }

    fn on_thread_start(&self) {
        CURRENT.with(|c| *c.borrow_mut() = self.self_ref.get().cloned());
    }
}

impl TimerHooks for IoManager {
    /// A new earliest deadline shortens the wait the loop is blocked
    /// in; poke it.
    fn on_timer_inserted_at_front(&self) {
        SchedulerHooks::tickle(self);
    }
}

impl Drop for IoManager {
    fn drop(&mut self) {
        // Workers hold no strong reference between idle rounds, so the
        // drop can run on the owner's thread while they are parked;
        // stop() then shakes them out before the descriptors go away.
        self.scheduler.stop();
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
        log::debug!("io manager {} destroyed", self.scheduler.name());
    }
}

fn register_tickle(epfd: RawFd, read_end: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(read_end, libc::F_GETFL, 0) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(read_end, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    let mut ev = libc::epoll_event {
        events: (libc::EPOLLIN | libc::EPOLLET) as u32,
        u64: read_end as u64,
    };
    if unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, read_end, &mut ev) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Extends the table with fresh entries up to `size`.
fn grow(table: &mut Vec<Arc<FdContext>>, size: usize) {
    while table.len() < size {
        table.push(Arc::new(FdContext {
            fd: table.len() as RawFd,
            state: Mutex::new(FdState {
                events: Event::empty(),
                read: None,
                write: None,
            }),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_bits_match_epoll() {
        assert_eq!(Event::READ.bits(), 0x1);
        assert_eq!(Event::WRITE.bits(), 0x4);
        assert!((Event::READ | Event::WRITE).contains(Event::WRITE));
        assert!(Event::empty().is_empty());
    }

    #[test]
    fn table_growth_is_at_least_half_again() {
        let mut table = Vec::new();
        grow(&mut table, INITIAL_CONTEXTS);
        assert_eq!(table.len(), INITIAL_CONTEXTS);
        assert_eq!(table[7].fd, 7);

        let fd = 100;
        grow(&mut table, (fd * 3 / 2).max(fd + 1));
        assert!(table.len() >= 150);
        assert_eq!(table[fd].fd, fd as RawFd);
    }
}
