//! Metrics for sync groups and connection watchdogs.

use nm::{Event, Magnitude};

/// Histogram buckets for the time a `block()` call spends waiting, in milliseconds.
///
/// Most blocks on a healthy network finish within a few round trips. The long tail is made of
/// blocks that run into their timeout, which callers typically set in seconds.
const BLOCK_WAIT_MS_BUCKETS: &[Magnitude] = &[0, 1, 2, 5, 10, 20, 50, 100, 500, 1000, 5000, 30000];

thread_local! {
    /// Requests that completed successfully and were accounted to their group.
    pub(crate) static NOTIFY_COMPLETIONS: Event = Event::builder()
        .name("ca_sync_group_notify_completions")
        .build();

    /// Requests that failed with an exception reported by the transport.
    pub(crate) static NOTIFY_EXCEPTIONS: Event = Event::builder()
        .name("ca_sync_group_notify_exceptions")
        .build();

    /// Callbacks discarded because they referred to a notify object that no longer exists.
    pub(crate) static NOTIFY_BAD_MAGIC: Event = Event::builder()
        .name("ca_sync_group_notify_bad_magic")
        .build();

    /// Issue attempts that failed because the notify pool was full.
    pub(crate) static NOTIFY_POOL_EXHAUSTED: Event = Event::builder()
        .name("ca_sync_group_notify_pool_exhausted")
        .build();

    /// Time spent inside `block()`.
    ///
    /// The magnitude is the wait time in milliseconds.
    pub(crate) static BLOCK_WAIT_MS: Event = Event::builder()
        .name("ca_sync_group_block_wait_ms")
        .histogram(BLOCK_WAIT_MS_BUCKETS)
        .build();

    /// Blocks that ended because their timeout elapsed.
    pub(crate) static BLOCK_TIMEOUTS: Event = Event::builder()
        .name("ca_sync_group_block_timeouts")
        .build();

    /// Echo probes sent on silent connections.
    pub(crate) static WATCHDOG_PROBES_SENT: Event = Event::builder()
        .name("ca_watchdog_probes_sent")
        .build();

    /// Probes that went unanswered and were escalated to the connection.
    pub(crate) static WATCHDOG_PROBE_TIMEOUTS: Event = Event::builder()
        .name("ca_watchdog_probe_timeouts")
        .build();
}
