//! Stackful fibers with a multi-threaded scheduler and an epoll-driven
//! event loop.
//!
//! The crate contains the following building blocks:
//!
//! - [Fibers](fiber): stackful coroutines with explicit resume/yield
//! - [Scheduler](scheduler): a FIFO task queue drained by a fixed pool
//!   of worker threads, each interleaving fibers cooperatively
//! - [Timers](timer): a deadline-ordered set with cancel, refresh,
//!   reset, recurring and conditional timers
//! - [I/O manager](io): readiness notifications over epoll merged into
//!   the scheduler as its idle routine
//! - [Clock](clock), [Error handling](error) and
//!   [worker threads](thread)
//!
//! Application code writes blocking-style logic inside fibers; the
//! scheduler dispatches those fibers across its workers, and the I/O
//! manager suspends them around file-descriptor readiness and timer
//! deadlines instead of blocking the thread.
//!
//! ```no_run
//! use std::time::Duration;
//! use weft::io::IoManager;
//!
//! let io = IoManager::new(2, false, "demo").unwrap();
//! io.spawn(|| println!("running on a worker fiber"));
//! io.add_timer(Duration::from_millis(500), || println!("tick"), false);
//! io.stop();
//! ```
//!
//! The runtime keeps no persistent state and is Linux/glibc specific:
//! machine contexts come from `ucontext`, readiness from `epoll`.
//! Descriptors handed to the I/O manager must be non-blocking; the
//! runtime never rewires ordinary I/O calls.

pub mod clock;
pub mod error;
pub mod fiber;
pub mod io;
pub mod scheduler;
pub mod thread;
pub mod timer;

pub use error::Result;
