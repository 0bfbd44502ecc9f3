//! One-shot timers with restartable expiry, as used by the connection watchdog.

use std::fmt::Debug;
use std::sync::Weak;
use std::time::{Duration, Instant};

mod manual;
mod thread_queue;

pub use manual::*;
pub use thread_queue::*;

/// What a timer should do after its expiry callback has run.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExpireStatus {
    /// The timer stays idle until it is started again.
    NoRestart,

    /// The timer is rearmed to expire again after the given delay.
    Restart(Duration),
}

/// Receives the expiry of a timer.
pub trait TimerNotify: Send + Sync {
    /// Called on the timer queue's thread when the timer expires.
    ///
    /// `now` is the instant the timer was due, which may be slightly earlier than the current
    /// time. The timer lock is not held during the call, so the callback may start or cancel
    /// its own timer.
    fn expire(&self, now: Instant) -> ExpireStatus;
}

/// A one-shot timer created by a [`TimerQueue`].
#[cfg_attr(test, mockall::automock)]
pub trait Timer: Debug + Send + Sync {
    /// Arms the timer to expire at `expire_at`, replacing any earlier deadline.
    fn start(&self, expire_at: Instant);

    /// Disarms the timer.
    ///
    /// If the expiry callback is running on another thread, waits for it to return. When
    /// called from within the callback itself, returns immediately.
    fn cancel(&self);

    /// The instant the timer is armed to expire at, if it is armed.
    fn expires_at(&self) -> Option<Instant>;
}

/// Creates timers that share one source of expiry events.
pub trait TimerQueue: Debug + Send + Sync {
    /// Creates an idle timer that delivers its expiry to `notify`.
    ///
    /// The timer does not keep `notify` alive; expiries after `notify` has been dropped are
    /// discarded.
    fn create_timer(&self, notify: Weak<dyn TimerNotify>) -> Box<dyn Timer>;
}
