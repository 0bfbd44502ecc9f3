//! Integration tests for sync groups driven by a recording transport.
//!
//! Outcomes are delivered from helper threads the way a receive thread would deliver them.
//! These tests use real threads and real waiting, so they are ignored under Miri.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use ca_client::{
    BlockOutcome, CaStatus, Channel, DbrType, ElementCount, Error, NotifyHandle, NotifyPool,
    OpKind, RequestId, SyncGroup,
};
use testing::{RecordingChannel, with_watchdog};

const DOUBLE: DbrType = DbrType(6);

fn channel(name: &str) -> (Arc<RecordingChannel>, Arc<dyn Channel>) {
    let recording = Arc::new(RecordingChannel::new(name));
    let channel = Arc::clone(&recording);
    let channel: Arc<dyn Channel> = channel;
    (recording, channel)
}

#[cfg_attr(miri, ignore)]
#[test]
fn concurrent_completions_drain_group() {
    with_watchdog(|| {
        const REQUESTS: usize = 64;

        let (recording, channel) = channel("TEST:CONCURRENT");
        let group = SyncGroup::new();

        for value in 0..REQUESTS {
            let value = u8::try_from(value).unwrap();
            group.issue_write(&channel, DOUBLE, 1, &[value]).unwrap();
        }

        assert_eq!(group.pending_count(), REQUESTS);

        let issued = recording.issued();
        let completers: Vec<_> = issued
            .chunks(REQUESTS / 4)
            .map(|chunk| {
                let ids: Vec<_> = chunk.iter().map(|request| request.id).collect();
                let recording = Arc::clone(&recording);

                thread::spawn(move || {
                    for id in ids {
                        recording.complete(id, &[]);
                    }
                })
            })
            .collect();

        assert!(group.block(Duration::from_secs(5)).is_complete());

        for completer in completers {
            completer.join().unwrap();
        }

        assert_eq!(group.pending_count(), 0);

        // Nothing is outstanding, so this must not suspend.
        let started = Instant::now();
        assert!(group.block(Duration::ZERO).is_complete());
        assert!(started.elapsed() < Duration::from_millis(100));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn block_returns_when_last_request_completes() {
    with_watchdog(|| {
        let (recording, channel) = channel("TEST:ABC");
        let group = SyncGroup::new();

        for _ in 0..3 {
            group.issue_write(&channel, DOUBLE, 1, &[0; 8]).unwrap();
        }

        let ids: Vec<_> = recording.issued().iter().map(|r| r.id).collect();
        let [a, b, c] = ids[..] else {
            panic!("expected three issued requests");
        };

        recording.complete(a, &[]);
        recording.complete(c, &[]);

        let completer = thread::spawn({
            let recording = Arc::clone(&recording);
            move || {
                thread::sleep(Duration::from_millis(200));
                recording.complete(b, &[]);
            }
        });

        let started = Instant::now();
        let outcome = group.block(Duration::from_secs(1));
        let elapsed = started.elapsed();

        completer.join().unwrap();

        assert!(outcome.is_complete());
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(900));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn block_times_out_without_cancelling() {
    with_watchdog(|| {
        let (recording, channel) = channel("TEST:SLOW");
        let group = SyncGroup::new();

        group.issue_write(&channel, DOUBLE, 1, &[]).unwrap();

        let started = Instant::now();
        assert!(matches!(
            group.block(Duration::from_millis(50)),
            BlockOutcome::TimedOut
        ));
        assert!(started.elapsed() >= Duration::from_millis(50));

        assert!(recording.cancelled().is_empty());
        assert_eq!(group.pending_count(), 1);

        // The request may still complete after the timeout; a later block observes it.
        recording.complete(recording.issued()[0].id, &[]);
        assert!(group.block(Duration::ZERO).is_complete());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn first_exception_wins_over_later_success() {
    with_watchdog(|| {
        let (recording, channel) = channel("TEST:LATCH");
        let group = SyncGroup::new();

        let value = group.issue_read(&channel, DOUBLE, 1).unwrap();
        group.issue_write(&channel, DOUBLE, 1, &[1]).unwrap();
        group.issue_write(&channel, DOUBLE, 1, &[2]).unwrap();

        let ids: Vec<_> = recording.issued().iter().map(|r| r.id).collect();

        let receiver = thread::spawn({
            let recording = Arc::clone(&recording);
            let ids = ids.clone();
            move || {
                recording.fail(ids[1], CaStatus::NoWriteAccess, "write access denied");
                recording.fail(ids[2], CaStatus::PutFail, "record processing failed");
                recording.complete(ids[0], &[0, 0, 0, 0, 0, 0, 0xF0, 0x3F]);
            }
        });

        let outcome = group.block(Duration::from_secs(5));
        receiver.join().unwrap();

        let exception = match outcome {
            BlockOutcome::Failed(exception) => exception,
            other => panic!("expected the group to fail, got {other:?}"),
        };

        assert_eq!(exception.status, CaStatus::NoWriteAccess);
        assert_eq!(exception.context, "write access denied");
        assert_eq!(exception.op, OpKind::Put);
        assert_eq!(exception.channel, "TEST:LATCH");

        // The read completed normally, the failure stays latched regardless.
        assert!(value.is_ready());
        assert!(matches!(
            group.block(Duration::ZERO),
            BlockOutcome::Failed(_)
        ));

        group.reset();
        assert!(group.exception().is_none());
        assert!(group.block(Duration::ZERO).is_complete());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn reset_cancels_each_outstanding_request_once() {
    with_watchdog(|| {
        const OUTSTANDING: usize = 5;

        let (recording, channel) = channel("TEST:RESET");
        let pool = Arc::new(NotifyPool::new());
        let group = SyncGroup::builder().pool(Arc::clone(&pool)).build();

        for _ in 0..OUTSTANDING {
            group.issue_write(&channel, DOUBLE, 1, &[]).unwrap();
        }

        group.reset();

        let mut cancelled = recording.cancelled();
        cancelled.sort_by_key(|id| id.0);
        let mut issued: Vec<_> = recording.issued().iter().map(|r| r.id).collect();
        issued.sort_by_key(|id| id.0);

        assert_eq!(cancelled, issued);
        assert_eq!(group.pending_count(), 0);
        assert!(pool.is_empty());

        // The transport delivers outcomes after all; they must not reach the group.
        group.issue_write(&channel, DOUBLE, 1, &[]).unwrap();

        for id in issued {
            recording.complete(id, &[]);
        }

        assert_eq!(group.pending_count(), 1);
        assert!(matches!(
            group.block(Duration::ZERO),
            BlockOutcome::TimedOut
        ));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn reset_from_other_thread_releases_blocker() {
    with_watchdog(|| {
        let (_recording, channel) = channel("TEST:INTERRUPT");
        let group = Arc::new(SyncGroup::new());

        group.issue_write(&channel, DOUBLE, 1, &[]).unwrap();

        let blocker = thread::spawn({
            let group = Arc::clone(&group);
            move || group.block(Duration::from_secs(30))
        });

        thread::sleep(Duration::from_millis(50));
        group.reset();

        let outcome = blocker.join().unwrap();
        assert!(matches!(
            outcome,
            BlockOutcome::Reset | BlockOutcome::Complete
        ));
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn every_blocker_observes_completion() {
    with_watchdog(|| {
        let (recording, channel) = channel("TEST:MANY");
        let group = Arc::new(SyncGroup::new());

        group.issue_write(&channel, DOUBLE, 1, &[]).unwrap();

        let blockers: Vec<_> = (0..4)
            .map(|_| {
                let group = Arc::clone(&group);
                thread::spawn(move || group.block(Duration::from_secs(5)))
            })
            .collect();

        thread::sleep(Duration::from_millis(50));
        recording.complete(recording.issued()[0].id, &[]);

        for blocker in blockers {
            assert!(blocker.join().unwrap().is_complete());
        }
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn inline_completion_is_accounted() {
    with_watchdog(|| {
        let (recording, channel) = channel("TEST:INLINE");
        recording.complete_inline(true);

        let group = SyncGroup::new();

        let value = group.issue_read(&channel, DOUBLE, 2).unwrap();
        group.issue_write(&channel, DOUBLE, 1, &[9]).unwrap();

        assert_eq!(group.pending_count(), 0);
        assert!(group.block(Duration::ZERO).is_complete());
        assert_eq!(value.value().unwrap().count, 2);

        // Completed requests hold nothing to cancel.
        group.reset();
        assert!(recording.cancelled().is_empty());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn issue_errors_leave_group_empty() {
    with_watchdog(|| {
        let (recording, channel) = channel("TEST:ERRORS");
        let group = SyncGroup::new();

        recording.set_connected(false);
        assert!(matches!(
            group.issue_write(&channel, DOUBLE, 1, &[]),
            Err(Error::ChannelNotConnected { .. })
        ));

        recording.set_connected(true);
        recording.reject_with(Some(CaStatus::BadCount));
        assert!(matches!(
            group.issue_read(&channel, DOUBLE, 100_000),
            Err(Error::Transport {
                status: CaStatus::BadCount,
                ..
            })
        ));

        assert_eq!(group.pending_count(), 0);
        assert!(recording.issued().is_empty());
        assert!(group.block(Duration::ZERO).is_complete());
    });
}

#[cfg_attr(miri, ignore)]
#[test]
fn dropping_group_cancels_outstanding() {
    with_watchdog(|| {
        let (recording, channel) = channel("TEST:DROP");
        let pool = Arc::new(NotifyPool::new());

        {
            let group = SyncGroup::builder().pool(Arc::clone(&pool)).build();
            group.issue_write(&channel, DOUBLE, 1, &[]).unwrap();
            group.issue_write(&channel, DOUBLE, 1, &[]).unwrap();
        }

        assert_eq!(recording.cancelled().len(), 2);
        assert!(pool.is_empty());

        // Late outcomes for a destroyed group are ignored.
        let id = recording.issued()[0].id;
        recording.complete(id, &[]);
        recording.fail(id, CaStatus::Disconnected, "circuit lost");
    });
}

/// Delivers the outcome of every accepted request from inside `is_connected()`, like a
/// transport that drains its receive queue under the same lock that guards its state.
#[derive(Debug)]
struct DrainingChannel {
    recording: RecordingChannel,
    drain_on_query: AtomicBool,
}

impl Channel for DrainingChannel {
    fn name(&self) -> &str {
        self.recording.name()
    }

    fn is_connected(&self) -> bool {
        if self.drain_on_query.swap(false, Ordering::Relaxed) {
            for request in self.recording.issued() {
                self.recording.complete(request.id, &[]);
            }
        }

        true
    }

    fn read(
        &self,
        dbr_type: DbrType,
        count: ElementCount,
        notify: NotifyHandle,
    ) -> Result<RequestId, CaStatus> {
        self.recording.read(dbr_type, count, notify)
    }

    fn write(
        &self,
        dbr_type: DbrType,
        count: ElementCount,
        payload: &[u8],
        notify: NotifyHandle,
    ) -> Result<RequestId, CaStatus> {
        self.recording.write(dbr_type, count, payload, notify)
    }

    fn io_cancel(&self, id: RequestId) {
        self.recording.io_cancel(id);
    }
}

#[cfg_attr(miri, ignore)]
#[test]
fn show_does_not_hold_group_lock_while_querying_transport() {
    with_watchdog(|| {
        let draining = Arc::new(DrainingChannel {
            recording: RecordingChannel::new("TEST:SHOW"),
            drain_on_query: AtomicBool::new(false),
        });
        let channel = Arc::clone(&draining);
        let channel: Arc<dyn Channel> = channel;

        let group = SyncGroup::new();
        group.issue_write(&channel, DOUBLE, 1, &[]).unwrap();
        group.issue_write(&channel, DOUBLE, 1, &[]).unwrap();

        draining.drain_on_query.store(true, Ordering::Relaxed);

        // The detailed dump asks the channel whether it is connected, which completes both
        // requests from within the call.
        let mut dump = String::new();
        group.show(&mut dump, 3).unwrap();

        assert!(dump.starts_with("sync group"));
        assert!(dump.contains("connected true"));
        assert_eq!(group.pending_count(), 0);
        assert!(group.block(Duration::ZERO).is_complete());
    });
}
