use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use foldhash::fast::RandomState;
use parking_lot::Mutex;

use crate::{ExpireStatus, Timer, TimerNotify, TimerQueue};

/// A timer queue driven by a virtual clock that only moves when told to.
///
/// Expiries are delivered synchronously on the thread that advances the clock, in deadline
/// order, each one observing the clock at exactly its own deadline. This makes timing
/// behavior reproducible in tests without sleeping.
///
/// # Example
///
/// ```rust
/// use std::time::{Duration, Instant};
///
/// use ca_client::ManualTimerQueue;
///
/// let queue = ManualTimerQueue::new(Instant::now());
///
/// assert_eq!(queue.advance(Duration::from_secs(1)), 0);
/// assert_eq!(queue.next_expiry(), None);
/// ```
#[derive(Clone)]
pub struct ManualTimerQueue {
    state: Arc<Mutex<ManualState>>,
}

struct ManualState {
    now: Instant,
    timers: HashMap<u64, ManualEntry, RandomState>,
    next_timer_id: u64,
}

struct ManualEntry {
    expire_at: Option<Instant>,
    generation: u64,
    notify: Weak<dyn TimerNotify>,
}

impl ManualTimerQueue {
    /// Creates a queue whose clock starts at `start`.
    #[must_use]
    pub fn new(start: Instant) -> Self {
        Self {
            state: Arc::new(Mutex::new(ManualState {
                now: start,
                timers: HashMap::default(),
                next_timer_id: 0,
            })),
        }
    }

    /// The current time of the virtual clock.
    #[must_use]
    pub fn now(&self) -> Instant {
        self.state.lock().now
    }

    /// The earliest instant any timer of this queue is armed to expire at.
    #[must_use]
    pub fn next_expiry(&self) -> Option<Instant> {
        self.state
            .lock()
            .timers
            .values()
            .filter_map(|entry| entry.expire_at)
            .min()
    }

    /// Moves the clock forward by `delta`, firing every timer that becomes due.
    ///
    /// Returns the number of expiry callbacks that ran.
    ///
    /// # Panics
    ///
    /// Panics if the clock would move beyond the range of [`Instant`].
    pub fn advance(&self, delta: Duration) -> usize {
        let target = self
            .now()
            .checked_add(delta)
            .expect("virtual clock overflowed");

        self.advance_to(target)
    }

    /// Moves the clock forward to `target`, firing every timer that becomes due.
    ///
    /// Timers restarted by their own callback fire again within the same call if their new
    /// deadline is not later than `target`. Returns the number of expiry callbacks that ran.
    /// Moving the clock backwards is ignored.
    pub fn advance_to(&self, target: Instant) -> usize {
        let mut fired = 0_usize;

        loop {
            let due = {
                let mut state = self.state.lock();

                let next = state
                    .timers
                    .iter()
                    .filter_map(|(id, entry)| entry.expire_at.map(|at| (at, *id)))
                    .filter(|(at, _)| *at <= target)
                    .min();

                let Some((deadline, id)) = next else {
                    if target > state.now {
                        state.now = target;
                    }
                    break;
                };

                if deadline > state.now {
                    state.now = deadline;
                }

                let entry = state
                    .timers
                    .get_mut(&id)
                    .expect("timer was found in the same critical section");

                entry.expire_at = None;
                entry
                    .notify
                    .upgrade()
                    .map(|notify| (deadline, id, entry.generation, notify))
            };

            let Some((deadline, id, generation, notify)) = due else {
                continue;
            };

            let status = notify.expire(deadline);
            fired = fired.checked_add(1).expect("fired count overflowed");

            if let ExpireStatus::Restart(delay) = status {
                let mut state = self.state.lock();

                if let Some(entry) = state.timers.get_mut(&id) {
                    if entry.generation == generation {
                        // A deadline beyond the range of the clock is never reached.
                        entry.expire_at = deadline.checked_add(delay);
                    }
                }
            }
        }

        fired
    }
}

impl fmt::Debug for ManualTimerQueue {
    #[cfg_attr(test, mutants::skip)] // No API contract for debug text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();

        f.debug_struct(stringify!(ManualTimerQueue))
            .field("now", &state.now)
            .field("timers", &state.timers.len())
            .finish()
    }
}

impl TimerQueue for ManualTimerQueue {
    fn create_timer(&self, notify: Weak<dyn TimerNotify>) -> Box<dyn Timer> {
        let mut state = self.state.lock();

        let id = state.next_timer_id;
        state.next_timer_id = state.next_timer_id.wrapping_add(1);

        state.timers.insert(
            id,
            ManualEntry {
                expire_at: None,
                generation: 0,
                notify,
            },
        );

        Box::new(ManualTimer {
            state: Arc::clone(&self.state),
            id,
        })
    }
}

struct ManualTimer {
    state: Arc<Mutex<ManualState>>,
    id: u64,
}

impl ManualTimer {
    fn rearm(&self, expire_at: Option<Instant>) {
        let mut state = self.state.lock();

        if let Some(entry) = state.timers.get_mut(&self.id) {
            entry.generation = entry.generation.wrapping_add(1);
            entry.expire_at = expire_at;
        }
    }
}

impl fmt::Debug for ManualTimer {
    #[cfg_attr(test, mutants::skip)] // No API contract for debug text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(ManualTimer))
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

impl Timer for ManualTimer {
    fn start(&self, expire_at: Instant) {
        self.rearm(Some(expire_at));
    }

    fn cancel(&self) {
        self.rearm(None);
    }

    fn expires_at(&self) -> Option<Instant> {
        self.state
            .lock()
            .timers
            .get(&self.id)
            .and_then(|entry| entry.expire_at)
    }
}

impl Drop for ManualTimer {
    fn drop(&mut self) {
        self.state.lock().timers.remove(&self.id);
    }
}
