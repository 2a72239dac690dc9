//! Deadline-ordered timers with cancel, refresh and reset.
//!
//! A [`TimerManager`] keeps timers in a set ordered by their next
//! wall-clock deadline. It does not run anything by itself: a driving
//! loop asks [`TimerManager::next_timer_ms`] how long it may block and
//! harvests due callbacks with [`TimerManager::list_expired`]. The I/O
//! manager embeds one and wakes its readiness loop whenever a new
//! earliest deadline appears.

use std::collections::BTreeMap;
use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use once_cell::sync::OnceCell;

use crate::clock;

/// A backwards wall-clock jump larger than this window (one hour) is
/// treated as a clock rollover and expires every timer at once.
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Callback attached to a timer. Recurring timers invoke it once per
/// expiration, so it has to be `Fn`, and it travels to worker threads.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

static NEXT_TIMER_ID: AtomicU64 = AtomicU64::new(0);

/// Customization point: notification that a new earliest deadline was
/// inserted while the dedup flag was clear.
pub(crate) trait TimerHooks: Send + Sync {
    fn on_timer_inserted_at_front(&self);
}

////////////////////////////////////////////////////////////////////////////////
// Timer
////////////////////////////////////////////////////////////////////////////////

struct TimerState {
    period_ms: u64,
    /// Wall-clock deadline in ms; also part of the set key.
    next_ms: u64,
    /// Cleared when the timer fires its last time or is cancelled; a
    /// timer without a callback is extinct and refuses every mutation.
    cb: Option<TimerCallback>,
    recurring: bool,
}

/// Handle to a scheduled timer.
///
/// Holds a non-owning back-reference to its manager so the mutating
/// operations can reach the set. All of them return `false` once the
/// timer is extinct (fired its last time or was cancelled).
pub struct Timer {
    id: u64,
    manager: Weak<TimerManager>,
    state: Mutex<TimerState>,
}

impl Timer {
    /// Removes the timer from the set and clears its callback so it can
    /// never fire. Idempotent: the second call returns `false`.
    pub fn cancel(&self) -> bool {
        let manager = match self.manager.upgrade() {
            Some(manager) => manager,
            None => return false,
        };
        let mut set = manager.set.write().expect("timer set poisoned");
        let mut state = self.state.lock().expect("timer state poisoned");
        if state.cb.is_none() {
            return false;
        }
        state.cb = None;
        set.by_deadline.remove(&(state.next_ms, self.id));
        true
    }

    /// Re-arms the timer at `now + period`, keeping the period.
    pub fn refresh(&self) -> bool {
        let manager = match self.manager.upgrade() {
            Some(manager) => manager,
            None => return false,
        };
        let mut set = manager.set.write().expect("timer set poisoned");
        let mut state = self.state.lock().expect("timer state poisoned");
        if state.cb.is_none() {
            return false;
        }
        let timer = match set.by_deadline.remove(&(state.next_ms, self.id)) {
            Some(timer) => timer,
            None => return false,
        };
        state.next_ms = clock::time_ms() + state.period_ms;
        set.by_deadline.insert((state.next_ms, self.id), timer);
        true
    }

    /// Changes the period. With `from_now` the deadline rebases to
    /// `now + period`, otherwise it keeps the original start point.
    pub fn reset(&self, period: Duration, from_now: bool) -> bool {
        let period_ms = period.as_millis() as u64;
        let manager = match self.manager.upgrade() {
            Some(manager) => manager,
            None => return false,
        };

        let timer = {
            let mut set = manager.set.write().expect("timer set poisoned");
            let mut state = self.state.lock().expect("timer state poisoned");
            if state.cb.is_none() {
                return false;
            }
            if period_ms == state.period_ms && !from_now {
                return true;
            }
            let timer = match set.by_deadline.remove(&(state.next_ms, self.id)) {
                Some(timer) => timer,
                None => return false,
            };
            let start = if from_now {
                clock::time_ms()
            } else {
                state.next_ms - state.period_ms
            };
            state.period_ms = period_ms;
            state.next_ms = start + period_ms;
            timer
        };
        // Re-inserting through the manager runs the front-insertion
        // notification, like a fresh add.
        manager.insert(timer);
        true
    }
}

////////////////////////////////////////////////////////////////////////////////
// TimerManager
////////////////////////////////////////////////////////////////////////////////

struct TimerSet {
    /// Keyed by (deadline ms, timer id): deadline ascending, ties
    /// broken by identity.
    by_deadline: BTreeMap<(u64, u64), Arc<Timer>>,
    /// Last wall-clock observation, for the rollover guard.
    previous_ms: u64,
}

/// Time-ordered set of deadlines.
pub struct TimerManager {
    set: RwLock<TimerSet>,
    /// Suppresses duplicate front-insertion notifications until the
    /// driving loop consumes the pending one in `next_timer_ms`.
    tickled: AtomicBool,
    hooks: OnceCell<Weak<dyn TimerHooks>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new(TimerManager {
            set: RwLock::new(TimerSet {
                by_deadline: BTreeMap::new(),
                previous_ms: clock::time_ms(),
            }),
            tickled: AtomicBool::new(false),
            hooks: OnceCell::new(),
        })
    }

    /// Schedules `cb` to fire once (or repeatedly) after `period`.
    pub fn add_timer<F>(self: &Arc<Self>, period: Duration, cb: F, recurring: bool) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let period_ms = period.as_millis() as u64;
        let timer = Arc::new(Timer {
            id: NEXT_TIMER_ID.fetch_add(1, Ordering::Relaxed),
            manager: Arc::downgrade(self),
            state: Mutex::new(TimerState {
                period_ms,
                next_ms: clock::time_ms() + period_ms,
                cb: Some(Arc::new(cb)),
                recurring,
            }),
        });
        self.insert(timer.clone());
        timer
    }

    /// Like [`add_timer`](Self::add_timer), but the callback only fires
    /// while `cond` still has a live referent.
    pub fn add_condition_timer<F, T>(
        self: &Arc<Self>,
        period: Duration,
        cb: F,
        cond: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer>
    where
        F: Fn() + Send + Sync + 'static,
        T: Send + Sync + 'static,
    {
        self.add_timer(
            period,
            move || {
                if cond.upgrade().is_some() {
                    cb();
                }
            },
            recurring,
        )
    }

    /// Milliseconds until the earliest deadline: `None` when no timer
    /// is scheduled, 0 when it already passed. Consumes the pending
    /// front-insertion notification.
    pub fn next_timer_ms(&self) -> Option<u64> {
        let set = self.set.read().expect("timer set poisoned");
        self.tickled.store(false, Ordering::SeqCst);
        let (&(next_ms, _), _) = set.by_deadline.iter().next()?;
        Some(next_ms.saturating_sub(clock::time_ms()))
    }

    pub fn has_timer(&self) -> bool {
        !self
            .set
            .read()
            .expect("timer set poisoned")
            .by_deadline
            .is_empty()
    }

    /// Harvests every expired callback in ascending deadline order.
    ///
    /// Recurring timers are re-armed at `now + period`; even if that
    /// deadline is again in the past they fire no earlier than the
    /// next call. One-shot timers become extinct. A detected clock
    /// rollover expires the whole set.
    pub fn list_expired(&self) -> Vec<TimerCallback> {
        let now = clock::time_ms();
        let mut expired = Vec::new();
        let mut set = self.set.write().expect("timer set poisoned");

        let rollover = now < set.previous_ms.saturating_sub(ROLLOVER_WINDOW_MS);
        set.previous_ms = now;

        let due = if rollover {
            log::warn!("wall clock rolled back, expiring all timers");
            mem::take(&mut set.by_deadline)
        } else {
            let future = set.by_deadline.split_off(&(now + 1, 0));
            mem::replace(&mut set.by_deadline, future)
        };

        for ((_, _), timer) in due {
            let (cb, rearm) = {
                let mut state = timer.state.lock().expect("timer state poisoned");
                let cb = state.cb.clone();
                if state.recurring {
                    state.next_ms = now + state.period_ms;
                    (cb, Some((state.next_ms, timer.id)))
                } else {
                    state.cb = None;
                    (cb, None)
                }
            };
            if let Some(cb) = cb {
                expired.push(cb);
            }
            if let Some(key) = rearm {
                set.by_deadline.insert(key, timer);
            }
        }
        expired
    }

    pub(crate) fn set_hooks(&self, hooks: Weak<dyn TimerHooks>) {
        if self.hooks.set(hooks).is_err() {
            panic!("timer hooks installed twice");
        }
    }

    /// Inserts an armed timer and fires the front-insertion hook when
    /// it became the new earliest deadline and no notification is
    /// already pending.
    fn insert(&self, timer: Arc<Timer>) {
        let at_front = {
            let mut set = self.set.write().expect("timer set poisoned");
            let key = {
                let state = timer.state.lock().expect("timer state poisoned");
                if state.cb.is_none() {
                    // Cancelled while off the set; nothing to arm.
                    return;
                }
                (state.next_ms, timer.id)
            };
            set.by_deadline.insert(key, timer);
            set.by_deadline.keys().next() == Some(&key)
                && !self.tickled.swap(true, Ordering::SeqCst)
        };
        if at_front {
            if let Some(hooks) = self.hooks.get().and_then(Weak::upgrade) {
                hooks.on_timer_inserted_at_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicUsize;
    use std::thread::sleep;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn expires_in_deadline_order() {
        let manager = TimerManager::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        // Deliberately inserted out of order.
        for &(i, period) in &[(2usize, 1200u64), (0, 400), (4, 2000), (1, 800), (3, 1600)] {
            let log = log.clone();
            manager.add_timer(ms(period), move || log.lock().unwrap().push(i), false);
        }

        sleep(ms(1000));
        for cb in manager.list_expired() {
            cb();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1]);

        sleep(ms(1200));
        for cb in manager.list_expired() {
            cb();
        }
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
        assert!(!manager.has_timer());
    }

    #[test]
    fn recurring_fires_once_per_poll() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let timer = manager.add_timer(
            ms(100),
            {
                let fired = fired.clone();
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            },
            true,
        );

        for round in 1..=5 {
            sleep(ms(120));
            let due = manager.list_expired();
            // The deadline rebases at every harvest, so each poll sees
            // exactly one expiration however late it runs.
            assert_eq!(due.len(), 1, "round {}", round);
            for cb in due {
                cb();
            }
        }
        assert_eq!(fired.load(Ordering::SeqCst), 5);
        assert!(timer.cancel());
        sleep(ms(120));
        assert!(manager.list_expired().is_empty());
    }

    #[test]
    fn cancel_before_fire() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let timer = manager.add_timer(
            ms(200),
            {
                let fired = fired.clone();
                move || fired.store(true, Ordering::SeqCst)
            },
            false,
        );

        assert!(timer.cancel());
        assert!(!timer.cancel(), "cancel is idempotent");
        sleep(ms(250));
        assert!(manager.list_expired().is_empty());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[test]
    fn refresh_pushes_the_deadline() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicBool::new(false));
        let timer = manager.add_timer(
            ms(200),
            {
                let fired = fired.clone();
                move || fired.store(true, Ordering::SeqCst)
            },
            false,
        );

        sleep(ms(150));
        assert!(timer.refresh());
        sleep(ms(100));
        // Old deadline (200ms) already passed, refreshed one (150+200)
        // has not.
        assert!(manager.list_expired().is_empty());
        sleep(ms(150));
        let due = manager.list_expired();
        assert_eq!(due.len(), 1);
        for cb in due {
            cb();
        }
        assert!(fired.load(Ordering::SeqCst));
        // Extinct now.
        assert!(!timer.refresh());
        assert!(!timer.reset(ms(100), true));
        assert!(!timer.cancel());
    }

    #[test]
    fn reset_rebases_from_now() {
        let manager = TimerManager::new();
        let timer = manager.add_timer(ms(10_000), || {}, false);
        assert!(timer.reset(ms(100), true));
        sleep(ms(150));
        assert_eq!(manager.list_expired().len(), 1);
    }

    #[test]
    fn condition_timer_needs_live_referent() {
        let manager = TimerManager::new();
        let fired = Arc::new(AtomicUsize::new(0));

        let alive = Arc::new(());
        manager.add_condition_timer(
            ms(50),
            {
                let fired = fired.clone();
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            },
            Arc::downgrade(&alive),
            false,
        );

        let dead = Arc::new(());
        let dead_cond = Arc::downgrade(&dead);
        drop(dead);
        manager.add_condition_timer(
            ms(50),
            {
                let fired = fired.clone();
                move || {
                    fired.fetch_add(1, Ordering::SeqCst);
                }
            },
            dead_cond,
            false,
        );

        sleep(ms(100));
        for cb in manager.list_expired() {
            cb();
        }
        // Only the timer whose condition still upgrades got through.
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn next_timer_ms_reports_the_head() {
        let manager = TimerManager::new();
        assert_eq!(manager.next_timer_ms(), None);

        manager.add_timer(ms(500), || {}, false);
        let delta = manager.next_timer_ms().unwrap();
        assert!(delta <= 500 && delta > 300, "delta = {}", delta);

        manager.add_timer(ms(0), || {}, false);
        assert_eq!(manager.next_timer_ms(), Some(0));
    }
}
