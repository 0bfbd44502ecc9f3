//! Liveness supervision of one virtual circuit.
//!
//! A [`ConnectionWatchdog`] watches the receive side of a connection. Whenever the connection
//! stays silent for a full period it asks the connection to send an echo probe; if the probe
//! goes unanswered it reports a receive timeout to the connection, which decides whether to
//! tear the circuit down.
//!
//! The watchdog shares two locks with its connection, bundled in [`ConnectionLocks`]:
//!
//! 1. The callback lock, held by whoever may call back into user code.
//! 2. The connection state lock.
//!
//! They are always acquired in that order. The notify methods take the guard proving that the
//! caller already holds the lock the method needs.

use std::fmt::{self, Display, Write};
use std::ptr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use nm::Event;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::metrics::{WATCHDOG_PROBES_SENT, WATCHDOG_PROBE_TIMEOUTS};
use crate::{ConnectionTimeouts, ExpireStatus, Timer, TimerNotify, TimerQueue};

/// The lock pair shared between a connection and its watchdog.
///
/// Acquire the callback lock before the state lock, never the other way around.
#[derive(Debug, Default)]
pub struct ConnectionLocks {
    callback: Mutex<()>,
    state: Mutex<()>,
}

/// Proof that the callback lock of a [`ConnectionLocks`] is held.
#[derive(Debug)]
pub struct CallbackGuard<'a> {
    locks: &'a ConnectionLocks,
    _guard: MutexGuard<'a, ()>,
}

/// Proof that the state lock of a [`ConnectionLocks`] is held.
#[derive(Debug)]
pub struct StateGuard<'a> {
    locks: &'a ConnectionLocks,
    _guard: MutexGuard<'a, ()>,
}

impl ConnectionLocks {
    /// Creates an unlocked lock pair.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the callback lock.
    ///
    /// Must not be called while holding the state lock of the same pair.
    pub fn lock_callback(&self) -> CallbackGuard<'_> {
        CallbackGuard {
            locks: self,
            _guard: self.callback.lock(),
        }
    }

    /// Acquires the state lock.
    pub fn lock_state(&self) -> StateGuard<'_> {
        StateGuard {
            locks: self,
            _guard: self.state.lock(),
        }
    }
}

impl CallbackGuard<'_> {
    fn is_for(&self, locks: &ConnectionLocks) -> bool {
        ptr::eq(self.locks, locks)
    }
}

impl StateGuard<'_> {
    fn is_for(&self, locks: &ConnectionLocks) -> bool {
        ptr::eq(self.locks, locks)
    }
}

/// The connection a [`ConnectionWatchdog`] supervises.
///
/// All methods are called from the timer thread with the locks named by their guard
/// parameters held. They must not call back into the watchdog, other than
/// [`ConnectionWatchdog::shutdown()`] from within
/// [`receive_timeout_notify()`][Self::receive_timeout_notify].
pub trait ConnectionHealth: Send + Sync {
    /// Name of the connection, used in diagnostics.
    fn name(&self) -> &str;

    /// Queues an echo request to the peer. Returns whether a request was queued.
    fn request_probe(&self, state: &StateGuard<'_>) -> bool;

    /// Whether the receive side is still busy processing data that has already arrived.
    ///
    /// While busy, the connection is not considered silent.
    fn receive_thread_is_busy(&self, state: &StateGuard<'_>) -> bool;

    /// Reports that the peer did not answer a probe in time.
    fn receive_timeout_notify(&self, callback: &CallbackGuard<'_>, state: &StateGuard<'_>);
}

/// The phase a [`ConnectionWatchdog`] is in.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum WatchdogState {
    /// Traffic was seen within the last period.
    Healthy,

    /// The connection went silent and a probe was requested.
    ProbePending,

    /// A probe went unanswered and the timeout was reported to the connection.
    ProbeTimedOut,

    /// The watchdog has been shut down.
    ShuttingDown,
}

impl Display for WatchdogState {
    #[cfg_attr(test, mutants::skip)] // No API contract for display text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Healthy => "healthy",
            Self::ProbePending => "probe pending",
            Self::ProbeTimedOut => "probe timed out",
            Self::ShuttingDown => "shutting down",
        };

        f.write_str(text)
    }
}

/// Receive-side liveness watchdog of one connection.
///
/// Created idle; [`connect_notify()`][Self::connect_notify] arms it. Dropping the watchdog
/// shuts it down.
///
/// # Example
///
/// ```rust
/// use std::sync::Arc;
/// use std::time::{Duration, Instant};
///
/// use ca_client::{
///     CallbackGuard, ConnectionHealth, ConnectionLocks, ConnectionWatchdog, ManualTimerQueue,
///     StateGuard, WatchdogState,
/// };
///
/// struct Circuit;
///
/// impl ConnectionHealth for Circuit {
///     fn name(&self) -> &str {
///         "ioc.example:5064"
///     }
///
///     fn request_probe(&self, _state: &StateGuard<'_>) -> bool {
///         true
///     }
///
///     fn receive_thread_is_busy(&self, _state: &StateGuard<'_>) -> bool {
///         false
///     }
///
///     fn receive_timeout_notify(&self, _callback: &CallbackGuard<'_>, _state: &StateGuard<'_>) {}
/// }
///
/// let start = Instant::now();
/// let queue = ManualTimerQueue::new(start);
/// let locks = Arc::new(ConnectionLocks::new());
/// let circuit = Arc::new(Circuit);
///
/// let watchdog = ConnectionWatchdog::builder()
///     .period(Duration::from_secs(1))
///     .build(Arc::clone(&locks), &circuit, &queue);
///
/// watchdog.connect_notify(&locks.lock_state(), start);
///
/// queue.advance(Duration::from_secs(1));
/// assert_eq!(watchdog.state(), WatchdogState::ProbePending);
/// ```
pub struct ConnectionWatchdog {
    inner: Arc<WatchdogInner>,
    timer: Box<dyn Timer>,
}

struct WatchdogInner {
    name: String,
    period: Duration,
    probe_timeout: Duration,
    locks: Arc<ConnectionLocks>,
    connection: Weak<dyn ConnectionHealth>,
    flags: Mutex<WatchdogFlags>,
}

#[derive(Debug, Default)]
struct WatchdogFlags {
    probe_response_pending: bool,
    beacon_anomaly: bool,
    probe_timeout_detected: bool,
    shutting_down: bool,

    /// The instant the timer was last armed for. An expiry earlier than this was overtaken by
    /// a rearm and is ignored.
    deadline: Option<Instant>,
}

impl WatchdogFlags {
    fn state(&self) -> WatchdogState {
        if self.shutting_down {
            WatchdogState::ShuttingDown
        } else if self.probe_timeout_detected {
            WatchdogState::ProbeTimedOut
        } else if self.probe_response_pending {
            WatchdogState::ProbePending
        } else {
            WatchdogState::Healthy
        }
    }

    fn awaiting_probe(&self) -> bool {
        self.probe_response_pending || self.probe_timeout_detected
    }

    fn restart_after(&mut self, now: Instant, delay: Duration) -> ExpireStatus {
        self.deadline = now.checked_add(delay);
        ExpireStatus::Restart(delay)
    }
}

impl ConnectionWatchdog {
    /// Creates a builder for configuring the watchdog.
    pub fn builder() -> ConnectionWatchdogBuilder {
        ConnectionWatchdogBuilder::new()
    }

    /// Application traffic arrived: the connection is healthy.
    pub fn message_arrival_notify(&self, state: &StateGuard<'_>, now: Instant) {
        debug_assert!(state.is_for(&self.inner.locks));

        let mut flags = self.inner.flags.lock();
        if flags.shutting_down {
            return;
        }

        flags.probe_response_pending = false;
        flags.probe_timeout_detected = false;
        self.rearm(&mut flags, now, self.inner.period);
    }

    /// A beacon from the peer arrived.
    ///
    /// Beacons prove that the peer is alive, not that this circuit delivers data, so they do
    /// not settle an outstanding probe.
    pub fn beacon_arrival_notify(&self, state: &StateGuard<'_>, now: Instant) {
        debug_assert!(state.is_for(&self.inner.locks));

        let mut flags = self.inner.flags.lock();
        if flags.shutting_down {
            return;
        }

        flags.beacon_anomaly = false;

        if !flags.awaiting_probe() {
            self.rearm(&mut flags, now, self.inner.period);
        }
    }

    /// Beacons from the peer stopped arriving as expected.
    ///
    /// Recorded for diagnostics only.
    pub fn beacon_anomaly_notify(&self, state: &StateGuard<'_>) {
        debug_assert!(state.is_for(&self.inner.locks));

        let mut flags = self.inner.flags.lock();
        if flags.shutting_down {
            return;
        }

        flags.beacon_anomaly = true;
    }

    /// The peer answered a probe.
    pub fn probe_response_notify(&self, callback: &CallbackGuard<'_>, now: Instant) {
        debug_assert!(callback.is_for(&self.inner.locks));

        let mut flags = self.inner.flags.lock();
        if flags.shutting_down {
            return;
        }

        trace!(connection = %self.inner.name, "probe answered");

        flags.probe_response_pending = false;
        flags.probe_timeout_detected = false;
        self.rearm(&mut flags, now, self.inner.period);
    }

    /// The send side made progress on its backlog: the peer is slow, not silent.
    pub fn send_backlog_progress_notify(&self, state: &StateGuard<'_>, now: Instant) {
        debug_assert!(state.is_for(&self.inner.locks));

        let mut flags = self.inner.flags.lock();
        if flags.shutting_down {
            return;
        }

        if !flags.awaiting_probe() {
            self.rearm(&mut flags, now, self.inner.period);
        }
    }

    /// The circuit was (re)connected. Starts supervision from a healthy state.
    pub fn connect_notify(&self, state: &StateGuard<'_>, now: Instant) {
        debug_assert!(state.is_for(&self.inner.locks));

        let mut flags = self.inner.flags.lock();
        if flags.shutting_down {
            return;
        }

        flags.probe_response_pending = false;
        flags.probe_timeout_detected = false;
        self.rearm(&mut flags, now, self.inner.period);
    }

    /// The send side stalled. Probes the receive side right away instead of waiting for the
    /// period to run out, unless a probe is already outstanding or beacons have stopped.
    pub fn send_timeout_notify(
        &self,
        callback: &CallbackGuard<'_>,
        state: &StateGuard<'_>,
        now: Instant,
    ) {
        debug_assert!(callback.is_for(&self.inner.locks));
        debug_assert!(state.is_for(&self.inner.locks));

        let mut flags = self.inner.flags.lock();
        if flags.shutting_down || flags.beacon_anomaly || flags.awaiting_probe() {
            return;
        }

        trace!(connection = %self.inner.name, "send stalled, probing early");
        self.rearm(&mut flags, now, Duration::ZERO);
    }

    /// Disarms the timer until the next notify rearms it.
    ///
    /// Does nothing once the watchdog is shutting down. If the expiry callback is running on
    /// another thread, waits for it to return. That callback takes both connection locks, so
    /// this must not be called while holding either of them.
    pub fn cancel(&self) {
        if self.inner.flags.lock().shutting_down {
            return;
        }

        self.timer.cancel();
    }

    /// Stops the watchdog for good. Every later call into the watchdog is a no-op.
    ///
    /// When this returns, no expiry callback is running or will run. Must not be called while
    /// holding either of the connection locks, except from within
    /// [`ConnectionHealth::receive_timeout_notify()`].
    pub fn shutdown(&self) {
        {
            let mut flags = self.inner.flags.lock();

            if flags.shutting_down {
                return;
            }

            flags.shutting_down = true;
            flags.deadline = None;
        }

        self.timer.cancel();

        debug!(connection = %self.inner.name, "receive watchdog shut down");
    }

    /// The current phase of the watchdog.
    #[must_use]
    pub fn state(&self) -> WatchdogState {
        self.inner.flags.lock().state()
    }

    /// The silence period after which the connection is probed.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.inner.period
    }

    /// Whether beacons from the peer are currently considered anomalous.
    #[must_use]
    pub fn beacon_anomaly(&self) -> bool {
        self.inner.flags.lock().beacon_anomaly
    }

    /// Writes a human-readable status dump of the watchdog.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `out` fails.
    pub fn show(&self, out: &mut impl Write, level: u32) -> fmt::Result {
        let flags = self.inner.flags.lock();

        writeln!(
            out,
            "receive watchdog for '{}': {}, period {:?}",
            self.inner.name,
            flags.state(),
            self.inner.period
        )?;

        if level > 0 {
            writeln!(
                out,
                "  probe response pending {}, probe timeout detected {}, beacon anomaly {}",
                flags.probe_response_pending,
                flags.probe_timeout_detected,
                flags.beacon_anomaly
            )?;
            writeln!(
                out,
                "  probe timeout {:?}, armed until {:?}",
                self.inner.probe_timeout,
                self.timer.expires_at()
            )?;
        }

        Ok(())
    }

    fn rearm(&self, flags: &mut WatchdogFlags, now: Instant, delay: Duration) {
        let expire_at = now
            .checked_add(delay)
            .expect("delays are bounded by MAX_CONNECTION_PERIOD, far below the clock range");

        flags.deadline = Some(expire_at);
        self.timer.start(expire_at);
    }
}

impl Drop for ConnectionWatchdog {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for ConnectionWatchdog {
    #[cfg_attr(test, mutants::skip)] // No API contract for debug text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(stringify!(ConnectionWatchdog))
            .field("connection", &self.inner.name)
            .field("period", &self.inner.period)
            .field("flags", &*self.inner.flags.lock())
            .finish_non_exhaustive()
    }
}

impl TimerNotify for WatchdogInner {
    fn expire(&self, now: Instant) -> ExpireStatus {
        let Some(connection) = self.connection.upgrade() else {
            return ExpireStatus::NoRestart;
        };

        let callback = self.locks.lock_callback();
        let state = self.locks.lock_state();
        let mut flags = self.flags.lock();

        if flags.shutting_down {
            return ExpireStatus::NoRestart;
        }

        if let Some(deadline) = flags.deadline {
            if now < deadline {
                return ExpireStatus::Restart(deadline.saturating_duration_since(now));
            }
        }

        if flags.probe_response_pending {
            if connection.receive_thread_is_busy(&state) {
                return flags.restart_after(now, self.probe_timeout);
            }

            flags.probe_response_pending = false;
            flags.probe_timeout_detected = true;
            flags.deadline = None;
            drop(flags);

            WATCHDOG_PROBE_TIMEOUTS.with(Event::observe_once);
            debug!(connection = %self.name, "probe unanswered, reporting receive timeout");

            connection.receive_timeout_notify(&callback, &state);
            return ExpireStatus::NoRestart;
        }

        if connection.receive_thread_is_busy(&state) {
            return flags.restart_after(now, self.period);
        }

        drop(flags);
        let queued = connection.request_probe(&state);
        let mut flags = self.flags.lock();

        if flags.shutting_down {
            return ExpireStatus::NoRestart;
        }

        flags.probe_response_pending = queued;

        if queued {
            WATCHDOG_PROBES_SENT.with(Event::observe_once);
            debug!(connection = %self.name, "connection silent, probe sent");
        } else {
            trace!(connection = %self.name, "probe could not be queued, retrying later");
        }

        flags.restart_after(now, self.probe_timeout)
    }
}

/// Builder for configuring a [`ConnectionWatchdog`].
#[derive(Debug)]
#[must_use]
pub struct ConnectionWatchdogBuilder {
    timeouts: ConnectionTimeouts,
}

impl ConnectionWatchdogBuilder {
    fn new() -> Self {
        Self {
            timeouts: ConnectionTimeouts::default(),
        }
    }

    /// Replaces all timing parameters.
    pub fn timeouts(mut self, timeouts: ConnectionTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Sets how long the connection may stay silent before it is probed.
    ///
    /// Clamped into the range from [`MIN_CONNECTION_PERIOD`][crate::MIN_CONNECTION_PERIOD] to
    /// [`MAX_CONNECTION_PERIOD`][crate::MAX_CONNECTION_PERIOD] when the watchdog is built.
    pub fn period(mut self, period: Duration) -> Self {
        self.timeouts.period = period;
        self
    }

    /// Sets how long a probe may stay unanswered. The effective limit never exceeds the
    /// period, and is clamped like the period.
    pub fn echo_timeout(mut self, echo_timeout: Duration) -> Self {
        self.timeouts.echo_timeout = echo_timeout;
        self
    }

    /// Builds an idle watchdog for `connection`, using a timer from `queue`.
    ///
    /// The watchdog does not keep the connection alive. Expiries after the connection has been
    /// dropped do nothing.
    pub fn build<C>(
        self,
        locks: Arc<ConnectionLocks>,
        connection: &Arc<C>,
        queue: &dyn TimerQueue,
    ) -> ConnectionWatchdog
    where
        C: ConnectionHealth + 'static,
    {
        let ConnectionTimeouts {
            period,
            echo_timeout,
        } = self.timeouts.clamped();

        let connection_weak = Arc::downgrade(connection);
        let connection_weak: Weak<dyn ConnectionHealth> = connection_weak;

        let inner = Arc::new(WatchdogInner {
            name: connection.name().to_string(),
            period,
            probe_timeout: period.min(echo_timeout),
            locks,
            connection: connection_weak,
            flags: Mutex::new(WatchdogFlags::default()),
        });

        let notify = Arc::downgrade(&inner);
        let notify: Weak<dyn TimerNotify> = notify;
        let timer = queue.create_timer(notify);

        ConnectionWatchdog { inner, timer }
    }
}
