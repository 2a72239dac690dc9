//! Worker threads with kernel-level ids and a startup handshake.
//!
//! [`Thread`] is a thin wrapper over an OS thread that records the
//! kernel thread id (`gettid`) and a human-readable name before the
//! constructor returns, so the scheduler can address workers by id from
//! the moment they exist.

use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use crate::error::Result;

////////////////////////////////////////////////////////////////////////////////
// Semaphore
////////////////////////////////////////////////////////////////////////////////

/// Counting semaphore built from a mutex and a condition variable.
///
/// Used for the thread startup handshake: the spawning side `wait`s
/// until the new thread has registered itself and `signal`ed.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(count: usize) -> Self {
        Semaphore {
            count: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    /// Blocks while the counter is zero, then decrements it.
    pub fn wait(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        while *count == 0 {
            count = self.cond.wait(count).expect("semaphore mutex poisoned");
        }
        *count -= 1;
    }

    /// Increments the counter and wakes one waiter.
    pub fn signal(&self) {
        let mut count = self.count.lock().expect("semaphore mutex poisoned");
        *count += 1;
        self.cond.notify_one();
    }
}

////////////////////////////////////////////////////////////////////////////////
// Thread
////////////////////////////////////////////////////////////////////////////////

thread_local! {
    static THREAD_ID: Cell<libc::pid_t> = Cell::new(0);
    static THREAD_NAME: RefCell<Option<String>> = RefCell::new(None);
}

/// An OS thread owned by the runtime.
pub struct Thread {
    id: libc::pid_t,
    name: String,
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    /// Starts a named thread running `cb` and blocks until the thread
    /// has recorded its kernel id and name. The returned handle is
    /// therefore immediately addressable through [`Thread::id`].
    pub fn spawn<F>(cb: F, name: &str) -> Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let sem = Arc::new(Semaphore::new(0));
        let id_slot = Arc::new(AtomicI32::new(0));

        let handle = std::thread::Builder::new().name(name.to_string()).spawn({
            let sem = sem.clone();
            let id_slot = id_slot.clone();
            let name = name.to_string();
            move || {
                id_slot.store(Thread::current_id(), Ordering::Release);
                Thread::set_current_name(&name);
                sem.signal();
                cb();
            }
        })?;

        sem.wait();
        Ok(Thread {
            id: id_slot.load(Ordering::Acquire),
            name: name.to_string(),
            handle: Some(handle),
        })
    }

    /// Waits for the thread to terminate. A second call is a no-op.
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("worker thread {} panicked", self.name);
            }
        }
    }

    /// Kernel thread id of the wrapped thread.
    pub fn id(&self) -> libc::pid_t {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kernel thread id of the calling thread, cached per thread.
    pub fn current_id() -> libc::pid_t {
        THREAD_ID.with(|slot| {
            let mut id = slot.get();
            if id == 0 {
                id = unsafe { libc::syscall(libc::SYS_gettid) as libc::pid_t };
                slot.set(id);
            }
            id
        })
    }

    /// Name of the calling thread; `"main"` for threads that were never
    /// named through [`Thread::set_current_name`].
    pub fn current_name() -> String {
        THREAD_NAME.with(|slot| {
            slot.borrow()
                .clone()
                .unwrap_or_else(|| "main".to_string())
        })
    }

    pub fn set_current_name(name: &str) {
        THREAD_NAME.with(|slot| *slot.borrow_mut() = Some(name.to_string()));
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Detach rather than block in drop; the scheduler joins its
        // workers explicitly during stop.
        if self.handle.is_some() {
            log::debug!("thread {} dropped without join", self.name);
        }
    }
}
