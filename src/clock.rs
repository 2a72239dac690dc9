//! Time values derived from the Posix / C
//! [CLOCK_GETTIME](http://pubs.opengroup.org/onlinepubs/9699919799/functions/clock_getres.html)
//! function.
//!
//! Functions returning seconds come as `f64`; functions with names
//! followed by "64" return a 64-bit number of nanoseconds.
//!
//! - [time()](fn.time.html) - Get the wall clock time in seconds
//! - [time64()](fn.time64.html) - Get the wall clock time in nanoseconds
//! - [monotonic()](fn.monotonic.html) - Get the monotonic time in seconds
//! - [monotonic64()](fn.monotonic64.html) - Get the monotonic time in nanoseconds
//!
//! Timer deadlines in this crate are wall-clock based, which is why the
//! timer subsystem carries a clock-rollover guard.

use std::mem::MaybeUninit;

#[inline]
fn clock_gettime(clock: libc::clockid_t) -> libc::timespec {
    let mut ts = MaybeUninit::<libc::timespec>::uninit();
    let rc = unsafe { libc::clock_gettime(clock, ts.as_mut_ptr()) };
    // Cannot fail for the clock ids used below.
    debug_assert_eq!(rc, 0);
    unsafe { ts.assume_init() }
}

/// The wall clock time in seconds.
///
/// Derived from `clock_gettime(CLOCK_REALTIME)`. This is the best
/// function for knowing what the official time is, as determined by the
/// system administrator.
///
/// Return: seconds since epoch (1970-01-01 00:00:00), adjusted.
#[inline(always)]
pub fn time() -> f64 {
    let ts = clock_gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

/// The wall clock time in nanoseconds since epoch.
///
/// See: [time()](fn.time.html)
#[inline(always)]
pub fn time64() -> u64 {
    let ts = clock_gettime(libc::CLOCK_REALTIME);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// The monotonic time.
///
/// Derived from `clock_gettime(CLOCK_MONOTONIC)`. Monotonic time is
/// similar to wall clock time but is not affected by changes done by a
/// user. This is the best function to use with benchmarks that need to
/// calculate elapsed time.
///
/// Return: seconds since the last time that the computer was booted.
#[inline(always)]
pub fn monotonic() -> f64 {
    let ts = clock_gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as f64 + ts.tv_nsec as f64 / 1e9
}

/// See: [monotonic()](fn.monotonic.html)
#[inline(always)]
pub fn monotonic64() -> u64 {
    let ts = clock_gettime(libc::CLOCK_MONOTONIC);
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Wall clock in milliseconds, the unit timer deadlines are kept in.
#[inline(always)]
pub(crate) fn time_ms() -> u64 {
    time64() / 1_000_000
}
