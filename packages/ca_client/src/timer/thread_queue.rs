use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::panic;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Instant;

use foldhash::fast::RandomState;
use parking_lot::{Condvar, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::{ExpireStatus, Timer, TimerNotify, TimerQueue};

/// A timer queue that delivers expiries on a dedicated background thread.
///
/// Expiry callbacks run one at a time, in deadline order, without any queue lock held.
/// Dropping the queue stops the thread; timers that outlive the queue never expire.
///
/// # Example
///
/// ```rust
/// use ca_client::ThreadTimerQueue;
///
/// let queue = ThreadTimerQueue::new();
/// # drop(queue);
/// ```
pub struct ThreadTimerQueue {
    inner: Arc<QueueInner>,
    thread: Option<JoinHandle<()>>,
}

struct QueueInner {
    state: Mutex<QueueState>,

    /// Wakes the queue thread when the earliest deadline changes or the queue shuts down.
    wake: Condvar,

    /// Wakes threads waiting for an in-flight expiry callback to return.
    idle: Condvar,
}

struct QueueState {
    /// Armed timers ordered by deadline, with the timer id as tie breaker.
    pending: BTreeSet<(Instant, u64)>,

    timers: HashMap<u64, TimerEntry, RandomState>,
    next_timer_id: u64,

    /// The timer whose expiry callback is running right now.
    in_flight: Option<u64>,

    queue_thread: Option<ThreadId>,
    shutting_down: bool,
}

struct TimerEntry {
    expire_at: Option<Instant>,

    /// Advanced by every start and cancel, so that a restart requested by an expiry callback
    /// does not override a start or cancel made while the callback was running.
    generation: u64,

    notify: Weak<dyn TimerNotify>,
}

impl ThreadTimerQueue {
    /// Creates the queue and starts its thread.
    ///
    /// # Panics
    ///
    /// Panics if the operating system refuses to create the thread.
    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(QueueInner {
            state: Mutex::new(QueueState {
                pending: BTreeSet::new(),
                timers: HashMap::default(),
                next_timer_id: 0,
                in_flight: None,
                queue_thread: None,
                shutting_down: false,
            }),
            wake: Condvar::new(),
            idle: Condvar::new(),
        });

        let thread = thread::Builder::new()
            .name("ca-timer-queue".to_string())
            .spawn({
                let inner = Arc::clone(&inner);
                move || {
                    debug!("timer queue thread started");
                    queue_loop(&inner);
                    debug!("timer queue thread exiting");
                }
            })
            .expect("failed to spawn timer queue thread: thread spawning failure is not supported");

        Self {
            inner,
            thread: Some(thread),
        }
    }
}

impl Default for ThreadTimerQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ThreadTimerQueue {
    #[cfg_attr(test, mutants::skip)] // No API contract for debug text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();

        f.debug_struct(stringify!(ThreadTimerQueue))
            .field("timers", &state.timers.len())
            .field("armed", &state.pending.len())
            .finish()
    }
}

impl TimerQueue for ThreadTimerQueue {
    fn create_timer(&self, notify: Weak<dyn TimerNotify>) -> Box<dyn Timer> {
        let mut state = self.inner.state.lock();

        let id = state.next_timer_id;
        state.next_timer_id = state.next_timer_id.wrapping_add(1);

        state.timers.insert(
            id,
            TimerEntry {
                expire_at: None,
                generation: 0,
                notify,
            },
        );

        Box::new(QueueTimer {
            inner: Arc::clone(&self.inner),
            id,
        })
    }
}

impl Drop for ThreadTimerQueue {
    fn drop(&mut self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.wake.notify_all();

        let Some(thread) = self.thread.take() else {
            return;
        };

        if let Err(payload) = thread.join() {
            // Expiry callbacks are not expected to panic. If one does, do not swallow it.
            panic::resume_unwind(payload);
        }
    }
}

fn queue_loop(inner: &QueueInner) {
    let mut state = inner.state.lock();
    state.queue_thread = Some(thread::current().id());

    loop {
        if state.shutting_down {
            break;
        }

        let Some(&(deadline, id)) = state.pending.first() else {
            inner.wake.wait(&mut state);
            continue;
        };

        if Instant::now() < deadline {
            _ = inner.wake.wait_until(&mut state, deadline);
            continue;
        }

        state.pending.remove(&(deadline, id));

        let Some(entry) = state.timers.get_mut(&id) else {
            continue;
        };

        entry.expire_at = None;
        let generation = entry.generation;

        let Some(notify) = entry.notify.upgrade() else {
            trace!(id, "expiry for a dropped timer target discarded");
            continue;
        };

        state.in_flight = Some(id);

        let status = MutexGuard::unlocked(&mut state, move || notify.expire(deadline));

        state.in_flight = None;
        inner.idle.notify_all();

        if let ExpireStatus::Restart(delay) = status {
            let state = &mut *state;

            let Some(entry) = state.timers.get_mut(&id) else {
                continue;
            };

            if entry.generation != generation {
                continue;
            }

            // A deadline beyond the range of the clock is never reached.
            let Some(expire_at) = Instant::now().checked_add(delay) else {
                trace!(id, ?delay, "restart delay beyond the clock range, timer left idle");
                continue;
            };

            entry.expire_at = Some(expire_at);
            state.pending.insert((expire_at, id));
        }
    }
}

/// A timer owned by a [`ThreadTimerQueue`].
#[derive(Debug)]
struct QueueTimer {
    inner: Arc<QueueInner>,
    id: u64,
}

impl QueueTimer {
    /// Disarms the timer and returns the guard for further use by the caller.
    fn disarm(&self) -> MutexGuard<'_, QueueState> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        if let Some(entry) = state.timers.get_mut(&self.id) {
            entry.generation = entry.generation.wrapping_add(1);

            if let Some(previous) = entry.expire_at.take() {
                state.pending.remove(&(previous, self.id));
            }
        }

        guard
    }

    fn wait_for_callback(&self, mut state: MutexGuard<'_, QueueState>) {
        if state.queue_thread == Some(thread::current().id()) {
            // Called from inside an expiry callback; waiting would deadlock.
            return;
        }

        while state.in_flight == Some(self.id) {
            self.inner.idle.wait(&mut state);
        }
    }
}

impl Timer for QueueTimer {
    fn start(&self, expire_at: Instant) {
        let mut guard = self.disarm();
        let state = &mut *guard;

        let Some(entry) = state.timers.get_mut(&self.id) else {
            return;
        };

        entry.expire_at = Some(expire_at);
        state.pending.insert((expire_at, self.id));

        self.inner.wake.notify_all();
    }

    fn cancel(&self) {
        let state = self.disarm();
        self.wait_for_callback(state);
    }

    fn expires_at(&self) -> Option<Instant> {
        self.inner
            .state
            .lock()
            .timers
            .get(&self.id)
            .and_then(|entry| entry.expire_at)
    }
}

impl Drop for QueueTimer {
    fn drop(&mut self) {
        let state = self.disarm();
        self.wait_for_callback(state);

        self.inner.state.lock().timers.remove(&self.id);
    }
}

impl fmt::Debug for QueueInner {
    #[cfg_attr(test, mutants::skip)] // No API contract for debug text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(QueueInner)).finish_non_exhaustive()
    }
}
