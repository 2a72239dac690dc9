//! Error handling utils.
//!
//! Invariant violations (resuming a fiber that is not ready, resetting a
//! live fiber, double-registering an event) are programmer errors and are
//! treated as fatal assertions by the runtime. Everything the operating
//! system can legitimately refuse at runtime is surfaced through the
//! [`Error`] type below.

use std::io;
use std::os::unix::io::RawFd;

use crate::io::Event;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

////////////////////////////////////////////////////////////////////////////////
// Error
////////////////////////////////////////////////////////////////////////////////

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("io error: {0}")]
    IO(#[from] io::Error),

    /// Returned by `add_event` when the requested bit is already set for
    /// the descriptor. The existing subscription is left untouched.
    #[error("event {1:?} is already registered for fd {0}")]
    EventAlreadyRegistered(RawFd, Event),

    /// Returned by the fiber `Builder` when the requested stack cannot
    /// hold even the entry trampoline.
    #[error("stack size {0} is too small for a fiber")]
    StackTooSmall(usize),
}

const _: () = {
    /// Assert Error implements Send + Sync
    const fn if_this_compiles_the_type_implements_send_and_sync<T: Send + Sync>() {}
    if_this_compiles_the_type_implements_send_and_sync::<Error>();
};
