use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use ca_client::{CallbackGuard, ConnectionHealth, StateGuard};
use parking_lot::{Condvar, Mutex};

/// Something a [`ConnectionWatchdog`][ca_client::ConnectionWatchdog] asked of a
/// [`RecordingConnection`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HealthEvent {
    /// An echo probe was requested.
    ProbeRequested,

    /// A receive timeout was reported.
    ReceiveTimeout,
}

/// A [`ConnectionHealth`] implementation that records what the watchdog asks of it.
#[derive(Debug)]
pub struct RecordingConnection {
    name: String,
    busy: AtomicBool,
    refuse_probes: AtomicBool,
    events: Mutex<Vec<(HealthEvent, Instant)>>,
    changed: Condvar,
}

impl RecordingConnection {
    /// Creates a connection whose receive side is idle and which accepts every probe.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            busy: AtomicBool::new(false),
            refuse_probes: AtomicBool::new(false),
            events: Mutex::new(Vec::new()),
            changed: Condvar::new(),
        }
    }

    /// Changes whether the receive side reports itself busy.
    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Relaxed);
    }

    /// Changes whether probe requests fail to be queued.
    pub fn set_refuse_probes(&self, refuse: bool) {
        self.refuse_probes.store(refuse, Ordering::Relaxed);
    }

    /// Every recorded event with the wall clock time it was recorded at.
    #[must_use]
    pub fn events(&self) -> Vec<(HealthEvent, Instant)> {
        self.events.lock().clone()
    }

    /// How many times `event` was recorded.
    #[must_use]
    pub fn count(&self, event: HealthEvent) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|(recorded, _)| *recorded == event)
            .count()
    }

    /// Waits until `event` has been recorded at least `count` times.
    ///
    /// Returns `false` if that did not happen within `timeout`.
    #[must_use]
    pub fn wait_for(&self, event: HealthEvent, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut events = self.events.lock();

        loop {
            let recorded = events
                .iter()
                .filter(|(recorded, _)| *recorded == event)
                .count();

            if recorded >= count {
                return true;
            }

            if self.changed.wait_until(&mut events, deadline).timed_out() {
                return false;
            }
        }
    }

    fn record(&self, event: HealthEvent) {
        self.events.lock().push((event, Instant::now()));
        self.changed.notify_all();
    }
}

impl ConnectionHealth for RecordingConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn request_probe(&self, _state: &StateGuard<'_>) -> bool {
        if self.refuse_probes.load(Ordering::Relaxed) {
            return false;
        }

        self.record(HealthEvent::ProbeRequested);
        true
    }

    fn receive_thread_is_busy(&self, _state: &StateGuard<'_>) -> bool {
        self.busy.load(Ordering::Relaxed)
    }

    fn receive_timeout_notify(&self, _callback: &CallbackGuard<'_>, _state: &StateGuard<'_>) {
        self.record(HealthEvent::ReceiveTimeout);
    }
}
