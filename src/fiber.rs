//! Cooperative multitasking primitives.
//!
//! A [`Fiber`] is a stackful coroutine: it owns an independently
//! allocated stack and a saved machine context, and is driven
//! explicitly with [`Fiber::resume`] and [`yield_now`]. Within one
//! thread exactly one fiber runs at a time; a fiber gives up the thread
//! only by yielding or by returning from its callback.
//!
//! Every thread that touches fibers lazily captures its native
//! execution context as the *main fiber*, a fiber with no stack of its
//! own that only serves as a resume/yield target. A scheduler may
//! additionally designate a *driver fiber* for the thread; fibers
//! created with `run_in_scheduler` (the default) hand control back to
//! the driver instead of the main fiber, which is what lets a worker
//! loop interleave many fibers on one thread.
//!
//! The machine context is a Posix `ucontext_t` driven through
//! `getcontext`/`makecontext`/`swapcontext`, so the crate is
//! Linux/glibc territory.

use std::cell::{RefCell, UnsafeCell};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{Error, Result};

/// Default stack size for a new fiber, in bytes.
pub const DEFAULT_STACK_SIZE: usize = 128_000;

/// Smallest stack the [`Builder`] accepts.
pub const MIN_STACK_SIZE: usize = 4096;

/// Id reported by [`Fiber::current_id`] when the calling thread is not
/// executing any fiber.
pub const NO_FIBER_ID: u64 = u64::MAX;

static NEXT_ID: AtomicU64 = AtomicU64::new(0);
static FIBER_COUNT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    /// The fiber whose machine context is active on this thread.
    static CURRENT: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    /// This thread's native context, captured lazily.
    static THREAD_MAIN: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
    /// The driver fiber a scheduler attached to this thread, if any.
    static SCHEDULER: RefCell<Option<Arc<Fiber>>> = RefCell::new(None);
}

////////////////////////////////////////////////////////////////////////////////
// State
////////////////////////////////////////////////////////////////////////////////

/// Lifecycle of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Runnable, waiting for a `resume`.
    Ready,
    /// Executing on some thread right now.
    Running,
    /// The callback returned; only [`Fiber::reset`] leads out of here.
    Term,
}

impl State {
    fn as_u8(self) -> u8 {
        match self {
            State::Ready => 0,
            State::Running => 1,
            State::Term => 2,
        }
    }

    fn from_u8(v: u8) -> State {
        match v {
            0 => State::Ready,
            1 => State::Running,
            _ => State::Term,
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// Fiber
////////////////////////////////////////////////////////////////////////////////

struct Body {
    ctx: libc::ucontext_t,
    /// `None` marks the per-thread main fiber.
    stack: Option<Box<[u8]>>,
    cb: Option<Box<dyn FnOnce() + Send>>,
}

/// A stackful coroutine.
///
/// Fibers are handed around as `Arc<Fiber>`: the submitter, the task
/// queue and the event slots of the I/O manager may all hold the same
/// fiber. The stack is owned exclusively by the fiber and released
/// with it.
pub struct Fiber {
    id: u64,
    run_in_scheduler: bool,
    state: AtomicU8,
    /// Serializes resumption when two workers pop tasks naming the
    /// same fiber.
    resume_lock: Mutex<()>,
    self_ref: Weak<Fiber>,
    body: UnsafeCell<Body>,
}

// Safety: the machine context and callback in `body` are only touched
// at construction, under `resume_lock`, or by the thread the fiber is
// currently running on; the state word is atomic.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Creates a fiber with the default stack size that will resume
    /// from the thread's driver context.
    pub fn new<F>(cb: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        Builder::new().spawn(cb)
    }

    /// Attaches a new callback to a terminated fiber, reusing its
    /// stack. This is the only legal transition out of [`State::Term`].
    pub fn reset<F>(&self, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let _guard = self.resume_lock.lock().expect("fiber mutex poisoned");
        // Safety: the fiber is terminated, nothing else is executing it.
        let body = unsafe { &mut *self.body.get() };
        assert!(
            body.stack.is_some() && self.state() == State::Term,
            "reset() requires a terminated fiber with a stack"
        );
        body.cb = Some(Box::new(cb));
        init_context(body);
        self.set_state(State::Ready);
    }

    /// Switches the calling context into this fiber.
    ///
    /// Returns when the fiber yields or terminates. The caller must be
    /// executing the fiber's host context: the thread's driver fiber
    /// when the fiber was built with `run_in_scheduler`, the thread's
    /// main fiber otherwise.
    pub fn resume(&self) {
        // Make sure this thread's native context is captured before we
        // switch away from it.
        Fiber::current();

        assert_eq!(
            self.state(),
            State::Ready,
            "resume() requires a Ready fiber"
        );
        self.set_state(State::Running);

        let host = self.host();
        set_current(self.shared());
        // Safety: `host` is the context executing this call, `self` is
        // a fully initialized suspended context.
        unsafe { swap_context(host.ctx_ptr(), self.ctx_ptr()) };
    }

    /// The fiber currently running on this thread, capturing the
    /// thread's native context as its main fiber on first use.
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = CURRENT.with(|c| c.borrow().clone()) {
            return f;
        }
        let main = Fiber::native();
        CURRENT.with(|c| *c.borrow_mut() = Some(main.clone()));
        THREAD_MAIN.with(|c| *c.borrow_mut() = Some(main.clone()));
        // Until a scheduler attaches a driver, the main fiber doubles
        // as the resume target for scheduler-hosted fibers.
        SCHEDULER.with(|c| *c.borrow_mut() = Some(main.clone()));
        log::trace!("captured main fiber {}", main.id);
        main
    }

    /// Id of the running fiber, or [`NO_FIBER_ID`] when the thread is
    /// not executing any fiber.
    pub fn current_id() -> u64 {
        CURRENT.with(|c| c.borrow().as_ref().map_or(NO_FIBER_ID, |f| f.id))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> State {
        State::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Resumes the fiber under its resume lock, skipping it when it has
    /// already terminated. Workers go through here so that two of them
    /// popping tasks for the same fiber stay serialized.
    pub(crate) fn resume_protected(&self) {
        let _guard = self.resume_lock.lock().expect("fiber mutex poisoned");
        if self.state() != State::Term {
            self.resume();
        }
    }

    fn native() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new_cyclic(|weak| Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            run_in_scheduler: false,
            state: AtomicU8::new(State::Running.as_u8()),
            resume_lock: Mutex::new(()),
            self_ref: weak.clone(),
            body: UnsafeCell::new(Body {
                // Safety: plain data, captured in place below.
                ctx: unsafe { mem::zeroed() },
                stack: None,
                cb: None,
            }),
        });
        // Capture the native context in place (it keeps pointers into
        // its own struct); every later switch away from this thread
        // refreshes it.
        let rc = unsafe { libc::getcontext(fiber.ctx_ptr()) };
        assert_eq!(
            rc,
            0,
            "getcontext failed: {}",
            std::io::Error::last_os_error()
        );
        fiber
    }

    fn shared(&self) -> Arc<Fiber> {
        self.self_ref.upgrade().expect("fiber has no remaining owner")
    }

    fn set_state(&self, state: State) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn take_callback(&self) -> Option<Box<dyn FnOnce() + Send>> {
        // Safety: only called from the thread currently running the
        // fiber.
        unsafe { (*self.body.get()).cb.take() }
    }

    fn ctx_ptr(&self) -> *mut libc::ucontext_t {
        unsafe { ptr::addr_of_mut!((*self.body.get()).ctx) }
    }

    /// The context this fiber switches from on resume and back to on
    /// yield.
    fn host(&self) -> Arc<Fiber> {
        if self.run_in_scheduler {
            SCHEDULER
                .with(|c| c.borrow().clone())
                .expect("no driver context on this thread")
        } else {
            THREAD_MAIN
                .with(|c| c.borrow().clone())
                .expect("no main fiber captured on this thread")
        }
    }

    /// Switches from this (currently executing) fiber back to its host
    /// context.
    fn switch_to_host(&self) {
        let state = self.state();
        assert!(
            state == State::Running || state == State::Term,
            "yield from a fiber that is not executing"
        );
        if state == State::Running {
            self.set_state(State::Ready);
        }
        // Hand the strong handle to the thread-local slot before the
        // switch: on the Term path this frame never resumes, so a
        // local Arc would leak its count.
        let host = self.host();
        let host_ctx = host.ctx_ptr();
        set_current(host);
        // Safety: this fiber's context is the one executing the call;
        // the host context was saved by the matching resume and is kept
        // alive by the thread-local slots.
        unsafe { swap_context(self.ctx_ptr(), host_ctx) };
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        log::trace!("fiber {} released", self.id);
    }
}

/// Yields the calling fiber back to its host context.
///
/// A Running fiber becomes Ready and can be resumed again; a fiber
/// that already terminated stays Term (this is how the trampoline makes
/// its final switch).
pub fn yield_now() {
    Fiber::current().switch_to_host();
}

/// Number of live fibers across the process, main fibers included.
pub fn count() -> usize {
    FIBER_COUNT.load(Ordering::Relaxed)
}

/// Designates the driver fiber for the calling thread.
pub(crate) fn set_scheduler_fiber(fiber: &Arc<Fiber>) {
    SCHEDULER.with(|c| *c.borrow_mut() = Some(fiber.clone()));
}

fn set_current(fiber: Arc<Fiber>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(fiber));
}

////////////////////////////////////////////////////////////////////////////////
// Builder
////////////////////////////////////////////////////////////////////////////////

/// Fiber factory which can be used to configure the properties of the
/// new fiber.
///
/// The currently supported configurations are:
///
/// * `stack_size`: size of the fiber's own stack, in bytes
/// * `run_in_scheduler`: whether the fiber resumes from the thread's
///   driver context (the default) or from the thread's main context
pub struct Builder {
    stack_size: usize,
    run_in_scheduler: bool,
}

impl Builder {
    pub fn new() -> Self {
        Builder {
            stack_size: DEFAULT_STACK_SIZE,
            run_in_scheduler: true,
        }
    }

    /// Sets the size of the stack (in bytes) for the new fiber.
    ///
    /// Sizes below [`MIN_STACK_SIZE`] are rejected with
    /// [`Error::StackTooSmall`].
    pub fn stack_size(mut self, stack_size: usize) -> Result<Self> {
        if stack_size < MIN_STACK_SIZE {
            return Err(Error::StackTooSmall(stack_size));
        }
        self.stack_size = stack_size;
        Ok(self)
    }

    /// Chooses the host context the fiber yields back to.
    pub fn run_in_scheduler(mut self, run_in_scheduler: bool) -> Self {
        self.run_in_scheduler = run_in_scheduler;
        self
    }

    /// Allocates the stack, prepares the machine context and returns
    /// the fiber in the Ready state.
    pub fn spawn<F>(self, cb: F) -> Arc<Fiber>
    where
        F: FnOnce() + Send + 'static,
    {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new_cyclic(|weak| Fiber {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            run_in_scheduler: self.run_in_scheduler,
            state: AtomicU8::new(State::Ready.as_u8()),
            resume_lock: Mutex::new(()),
            self_ref: weak.clone(),
            body: UnsafeCell::new(Body {
                // Safety: plain data, prepared in place below.
                ctx: unsafe { mem::zeroed() },
                stack: Some(vec![0u8; self.stack_size].into_boxed_slice()),
                cb: Some(Box::new(cb)),
            }),
        });
        // Safety: we are the only owner. The context must be prepared
        // at its final address: the saved state keeps pointers into its
        // own struct.
        unsafe { init_context(&mut *fiber.body.get()) };
        log::trace!("fiber {} created", fiber.id);
        fiber
    }
}

impl Default for Builder {
    fn default() -> Self {
        Self::new()
    }
}

////////////////////////////////////////////////////////////////////////////////
// Context plumbing
////////////////////////////////////////////////////////////////////////////////

/// Entry point for every non-main fiber.
///
/// Runs the attached callback once, marks the fiber terminated, drops
/// its own strong handle so only external owners remain, and makes the
/// final switch back to the host. Never returns.
extern "C" fn trampoline() {
    let current = Fiber::current();
    let cb = current
        .take_callback()
        .expect("fiber entered without a callback");
    cb();
    current.set_state(State::Term);
    log::trace!("fiber {} terminated", current.id());

    let raw: *const Fiber = Arc::as_ptr(&current);
    drop(current);
    // Safety: the resuming side holds a strong handle until its
    // resume() call returns, so the fiber outlives this final switch.
    unsafe { (*raw).switch_to_host() };
    unreachable!("terminated fiber resumed without reset");
}

/// Points the saved context at the trampoline on the fiber's own
/// stack. The body must already sit at its final address: the saved
/// state keeps pointers into its own struct.
fn init_context(body: &mut Body) {
    let stack = body
        .stack
        .as_mut()
        .expect("init_context on a stackless fiber");
    // Safety: the context struct and the stack buffer are exclusively
    // ours; makecontext only records the entry point.
    unsafe {
        let ctx = ptr::addr_of_mut!(body.ctx);
        let rc = libc::getcontext(ctx);
        assert_eq!(
            rc,
            0,
            "getcontext failed: {}",
            std::io::Error::last_os_error()
        );
        (*ctx).uc_link = ptr::null_mut();
        (*ctx).uc_stack.ss_sp = stack.as_mut_ptr() as *mut libc::c_void;
        (*ctx).uc_stack.ss_size = stack.len();
        (*ctx).uc_stack.ss_flags = 0;
        libc::makecontext(ctx, trampoline, 0);
    }
}

/// Saves the executing context into `save` and activates `load`.
unsafe fn swap_context(save: *mut libc::ucontext_t, load: *mut libc::ucontext_t) {
    if libc::swapcontext(save, load) != 0 {
        panic!("swapcontext failed: {}", std::io::Error::last_os_error());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    fn manual(cb: impl FnOnce() + Send + 'static) -> Arc<Fiber> {
        // Host the fiber on the plain thread context so tests can drive
        // it without a scheduler.
        Builder::new().run_in_scheduler(false).spawn(cb)
    }

    #[test]
    fn resume_yield_terminate() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fiber = manual({
            let log = log.clone();
            move || {
                log.lock().unwrap().push(1);
                yield_now();
                log.lock().unwrap().push(2);
            }
        });

        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(*log.lock().unwrap(), vec![1]);
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn reset_reuses_the_stack() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let fiber = manual({
            let log = log.clone();
            move || log.lock().unwrap().push("first")
        });
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);

        fiber.reset({
            let log = log.clone();
            move || log.lock().unwrap().push("second")
        });
        assert_eq!(fiber.state(), State::Ready);
        fiber.resume();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn ids_are_unique_and_current_id_tracks() {
        // Run on a dedicated thread so the thread-local slots start
        // clean no matter how the harness schedules tests.
        std::thread::spawn(|| {
            assert_eq!(Fiber::current_id(), NO_FIBER_ID);

            let seen = Arc::new(Mutex::new(NO_FIBER_ID));
            let fiber = manual({
                let seen = seen.clone();
                move || *seen.lock().unwrap() = Fiber::current_id()
            });
            let id = fiber.id();
            fiber.resume();
            assert_eq!(*seen.lock().unwrap(), id);

            // Back on the main fiber now.
            assert_eq!(Fiber::current_id(), Fiber::current().id());
            assert_ne!(Fiber::current_id(), id);

            let other = manual(|| {});
            assert_ne!(other.id(), id);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn builder_rejects_tiny_stacks() {
        assert!(matches!(
            Builder::new().stack_size(128),
            Err(Error::StackTooSmall(128))
        ));
        assert!(Builder::new().stack_size(MIN_STACK_SIZE).is_ok());
    }

    #[test]
    fn live_count_tracks_fibers() {
        // Other tests create fibers concurrently, so only monotone
        // facts hold here.
        let fiber = manual(|| {});
        assert!(count() >= 1);
        fiber.resume();
        assert_eq!(fiber.state(), State::Term);
    }

    #[test]
    fn interleaved_fibers_on_one_thread() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = manual({
            let log = log.clone();
            move || {
                log.lock().unwrap().push("a1");
                yield_now();
                log.lock().unwrap().push("a2");
            }
        });
        let b = manual({
            let log = log.clone();
            move || {
                log.lock().unwrap().push("b1");
                yield_now();
                log.lock().unwrap().push("b2");
            }
        });

        a.resume();
        b.resume();
        a.resume();
        b.resume();
        assert_eq!(*log.lock().unwrap(), vec!["a1", "b1", "a2", "b2"]);
    }
}
