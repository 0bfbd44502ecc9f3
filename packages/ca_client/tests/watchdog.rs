//! Integration tests for the connection watchdog.
//!
//! Most tests run on the manual timer queue so that timing is exact. One test runs on the
//! background timer thread to cover real scheduling; it is ignored under Miri.

use std::sync::Arc;
use std::time::{Duration, Instant};

use ca_client::{
    ConnectionLocks, ConnectionTimeouts, ConnectionWatchdog, ManualTimerQueue, ThreadTimerQueue,
    WatchdogState,
};
use testing::{HealthEvent, RecordingConnection, with_watchdog};

struct Circuit {
    start: Instant,
    queue: ManualTimerQueue,
    locks: Arc<ConnectionLocks>,
    connection: Arc<RecordingConnection>,
    watchdog: ConnectionWatchdog,
}

impl Circuit {
    fn connect(period: Duration) -> Self {
        let start = Instant::now();
        let queue = ManualTimerQueue::new(start);
        let locks = Arc::new(ConnectionLocks::new());
        let connection = Arc::new(RecordingConnection::new("ioc.test:5064"));

        let watchdog = ConnectionWatchdog::builder()
            .period(period)
            .build(Arc::clone(&locks), &connection, &queue);

        watchdog.connect_notify(&locks.lock_state(), start);

        Self {
            start,
            queue,
            locks,
            connection,
            watchdog,
        }
    }

    fn advance_to(&self, millis: u64) {
        self.queue
            .advance_to(self.start + Duration::from_millis(millis));
    }

    fn probes(&self) -> usize {
        self.connection.count(HealthEvent::ProbeRequested)
    }

    fn timeouts(&self) -> usize {
        self.connection.count(HealthEvent::ReceiveTimeout)
    }
}

#[test]
fn silent_connection_is_probed_then_escalated() {
    let circuit = Circuit::connect(Duration::from_secs(1));

    circuit.advance_to(999);
    assert_eq!(circuit.probes(), 0);

    circuit.advance_to(1000);
    assert_eq!(circuit.probes(), 1);
    assert_eq!(circuit.watchdog.state(), WatchdogState::ProbePending);

    circuit.advance_to(1999);
    assert_eq!(circuit.timeouts(), 0);

    circuit.advance_to(2000);
    assert_eq!(circuit.timeouts(), 1);
    assert_eq!(circuit.watchdog.state(), WatchdogState::ProbeTimedOut);

    circuit.advance_to(2500);
    assert_eq!(circuit.probes(), 1);
    assert_eq!(circuit.timeouts(), 1);
    assert!(!circuit.watchdog.beacon_anomaly());
}

#[test]
fn no_probes_after_escalation_until_traffic() {
    let circuit = Circuit::connect(Duration::from_secs(1));

    circuit.advance_to(2000);
    assert_eq!(circuit.timeouts(), 1);

    // Beacons and backlog progress are not enough to resume supervision.
    circuit
        .watchdog
        .beacon_arrival_notify(&circuit.locks.lock_state(), circuit.start + Duration::from_secs(3));
    circuit.watchdog.send_backlog_progress_notify(
        &circuit.locks.lock_state(),
        circuit.start + Duration::from_secs(3),
    );
    circuit.advance_to(20_000);
    assert_eq!(circuit.probes(), 1);
    assert_eq!(circuit.timeouts(), 1);

    circuit.watchdog.message_arrival_notify(
        &circuit.locks.lock_state(),
        circuit.start + Duration::from_secs(20),
    );
    assert_eq!(circuit.watchdog.state(), WatchdogState::Healthy);

    circuit.advance_to(21_000);
    assert_eq!(circuit.probes(), 2);
}

#[test]
fn answered_probe_prevents_escalation() {
    let circuit = Circuit::connect(Duration::from_secs(1));

    circuit.advance_to(1000);
    circuit.watchdog.probe_response_notify(
        &circuit.locks.lock_callback(),
        circuit.start + Duration::from_millis(1300),
    );
    assert_eq!(circuit.watchdog.state(), WatchdogState::Healthy);

    circuit.advance_to(2299);
    assert_eq!(circuit.timeouts(), 0);
    assert_eq!(circuit.probes(), 1);

    circuit.advance_to(2300);
    assert_eq!(circuit.probes(), 2);
    assert_eq!(circuit.timeouts(), 0);
}

#[test]
fn busy_receive_side_postpones_probe() {
    let circuit = Circuit::connect(Duration::from_secs(1));

    circuit.connection.set_busy(true);
    circuit.advance_to(1000);
    assert_eq!(circuit.probes(), 0);
    assert_eq!(circuit.watchdog.state(), WatchdogState::Healthy);

    circuit.connection.set_busy(false);
    circuit.advance_to(2000);
    assert_eq!(circuit.probes(), 1);
}

#[test]
fn refused_probe_is_retried() {
    let circuit = Circuit::connect(Duration::from_secs(1));

    circuit.connection.set_refuse_probes(true);
    circuit.advance_to(1000);
    assert_eq!(circuit.probes(), 0);
    assert_eq!(circuit.watchdog.state(), WatchdogState::Healthy);

    circuit.connection.set_refuse_probes(false);
    circuit.advance_to(2000);
    assert_eq!(circuit.probes(), 1);
    assert_eq!(circuit.timeouts(), 0);

    circuit.advance_to(3000);
    assert_eq!(circuit.timeouts(), 1);
}

#[test]
fn shutdown_is_idempotent_and_final() {
    let circuit = Circuit::connect(Duration::from_secs(1));

    circuit.watchdog.shutdown();
    circuit.watchdog.shutdown();
    circuit.watchdog.cancel();

    circuit.watchdog.connect_notify(
        &circuit.locks.lock_state(),
        circuit.start + Duration::from_millis(10),
    );
    circuit.advance_to(5000);

    assert!(circuit.connection.events().is_empty());
    assert_eq!(circuit.watchdog.state(), WatchdogState::ShuttingDown);
    assert_eq!(circuit.queue.next_expiry(), None);
}

#[test]
fn cancel_pauses_until_next_notify() {
    let circuit = Circuit::connect(Duration::from_secs(1));

    circuit.watchdog.cancel();
    circuit.advance_to(5000);
    assert_eq!(circuit.probes(), 0);

    circuit.watchdog.message_arrival_notify(
        &circuit.locks.lock_state(),
        circuit.start + Duration::from_secs(5),
    );
    circuit.advance_to(6000);
    assert_eq!(circuit.probes(), 1);
}

#[test]
fn environment_style_timeouts_apply() {
    let timeouts = ConnectionTimeouts {
        period: Duration::from_secs(10),
        echo_timeout: Duration::from_secs(3),
    };

    let start = Instant::now();
    let queue = ManualTimerQueue::new(start);
    let locks = Arc::new(ConnectionLocks::new());
    let connection = Arc::new(RecordingConnection::new("ioc.test:5064"));

    let watchdog = ConnectionWatchdog::builder()
        .timeouts(timeouts)
        .build(Arc::clone(&locks), &connection, &queue);

    assert_eq!(watchdog.delay(), Duration::from_secs(10));

    watchdog.connect_notify(&locks.lock_state(), start);

    queue.advance_to(start + Duration::from_secs(10));
    assert_eq!(connection.count(HealthEvent::ProbeRequested), 1);

    queue.advance_to(start + Duration::from_secs(13));
    assert_eq!(connection.count(HealthEvent::ReceiveTimeout), 1);
}

#[cfg_attr(miri, ignore)]
#[test]
fn thread_queue_drives_escalation() {
    with_watchdog(|| {
        let queue = ThreadTimerQueue::new();
        let locks = Arc::new(ConnectionLocks::new());
        let connection = Arc::new(RecordingConnection::new("ioc.test:5064"));

        let watchdog = ConnectionWatchdog::builder()
            .period(Duration::from_millis(100))
            .build(Arc::clone(&locks), &connection, &queue);

        let connected_at = Instant::now();
        watchdog.connect_notify(&locks.lock_state(), connected_at);

        assert!(connection.wait_for(HealthEvent::ReceiveTimeout, 1, Duration::from_secs(5)));

        let events = connection.events();
        assert_eq!(events.len(), 2);

        let (first, probed_at) = events[0];
        let (second, escalated_at) = events[1];

        assert_eq!(first, HealthEvent::ProbeRequested);
        assert_eq!(second, HealthEvent::ReceiveTimeout);
        assert!(probed_at >= connected_at + Duration::from_millis(100));
        assert!(escalated_at >= connected_at + Duration::from_millis(200));

        watchdog.shutdown();
        assert_eq!(watchdog.state(), WatchdogState::ShuttingDown);
    });
}
