use std::fmt;
use std::time::Duration;

use rsevents::{Awaitable, AutoResetEvent, EventState};

/// Initial state of a [`CompletionEvent`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum InitialState {
    /// The event starts empty; the first wait blocks until the event is signaled.
    Empty,

    /// The event starts full; the first wait returns immediately.
    Full,
}

/// Result of waiting on a [`CompletionEvent`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum WaitStatus {
    /// The event was signaled. The signal has been consumed by this wait.
    Signaled,

    /// The timeout elapsed before the event was signaled.
    TimedOut,
}

/// A binary signal used to implement blocking waits without busy polling.
///
/// The event is either empty or full. Signaling a full event has no further effect, so any
/// number of signals that arrive before a waiter wakes collapse into a single wakeup. A
/// successful wait consumes the signal and returns the event to empty.
///
/// Waiters must be prepared for a wakeup that does not correspond to the state change they are
/// interested in - the signal only means "something may have changed, look again".
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use ca_client::{CompletionEvent, InitialState, WaitStatus};
///
/// let event = CompletionEvent::new(InitialState::Empty);
///
/// assert_eq!(event.wait_timeout(Duration::ZERO), WaitStatus::TimedOut);
///
/// event.signal();
/// event.signal();
///
/// assert_eq!(event.wait_timeout(Duration::ZERO), WaitStatus::Signaled);
/// assert_eq!(event.wait_timeout(Duration::ZERO), WaitStatus::TimedOut);
/// ```
pub struct CompletionEvent {
    event: AutoResetEvent,
}

impl CompletionEvent {
    /// Creates a new event in the given initial state.
    #[must_use]
    pub fn new(initial: InitialState) -> Self {
        let state = match initial {
            InitialState::Empty => EventState::Unset,
            InitialState::Full => EventState::Set,
        };

        Self {
            event: AutoResetEvent::new(state),
        }
    }

    /// Fills the event, releasing one current or future waiter.
    pub fn signal(&self) {
        self.event.set();
    }

    /// Blocks until the event is signaled.
    pub fn wait(&self) {
        self.event.wait();
    }

    /// Blocks until the event is signaled or the timeout elapses.
    ///
    /// A zero timeout polls the event without suspending the calling thread.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> WaitStatus {
        let signaled = if timeout.is_zero() {
            self.event.wait0()
        } else {
            self.event.wait_for(timeout)
        };

        if signaled {
            WaitStatus::Signaled
        } else {
            WaitStatus::TimedOut
        }
    }
}

impl fmt::Debug for CompletionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionEvent").finish_non_exhaustive()
    }
}
