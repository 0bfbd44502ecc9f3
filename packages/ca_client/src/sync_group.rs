//! Synchronous coordination of a group of asynchronous get/put requests.

use std::collections::HashSet;
use std::fmt::{self, Display, Write};
use std::panic::Location;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use foldhash::fast::RandomState;
use nm::Event;
use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use crate::metrics::{
    BLOCK_TIMEOUTS, BLOCK_WAIT_MS, NOTIFY_BAD_MAGIC, NOTIFY_COMPLETIONS, NOTIFY_EXCEPTIONS,
    NOTIFY_POOL_EXHAUSTED,
};
use crate::notify::{self, NotifyKind, NotifySnapshot, Request};
use crate::{
    CaStatus, Channel, CompletionEvent, DbrType, ElementCount, Error, InitialState, IoResponse,
    NotifyHandle, NotifyKey, NotifyObject, NotifyPool, OpKind, ReadResult, RequestId, Result,
};

static NEXT_GROUP_ID: AtomicU64 = AtomicU64::new(1);

/// The first exception raised by any request of a sync group.
///
/// Once recorded, the group keeps reporting this exception until it is reset; exceptions raised
/// by other requests of the same group are not recorded.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ExceptionRecord {
    /// Status reported by the transport.
    pub status: CaStatus,

    /// Free-form context supplied by the transport.
    pub context: String,

    /// Source location of the transport code that reported the exception.
    pub location: &'static Location<'static>,

    /// Name of the channel the failed request was addressed to.
    pub channel: String,

    /// Data type reported with the exception.
    pub dbr_type: DbrType,

    /// Element count reported with the exception.
    pub count: ElementCount,

    /// Whether the failed request was a get or a put.
    pub op: OpKind,
}

impl Display for ExceptionRecord {
    #[cfg_attr(test, mutants::skip)] // No API contract for display text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on channel '{}' failed: {} ({}) [type {}, count {}, reported at {}]",
            self.op,
            self.channel,
            self.status,
            self.context,
            self.dbr_type.0,
            self.count,
            self.location
        )
    }
}

/// How a [`SyncGroup::block()`] call ended.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum BlockOutcome {
    /// Every request issued to the group has completed.
    Complete,

    /// The timeout elapsed with requests still outstanding. The requests stay installed and
    /// may still complete, to be observed by a later block.
    TimedOut,

    /// A request of the group failed. The first recorded exception is returned; it stays
    /// latched until the group is reset.
    Failed(ExceptionRecord),

    /// The group was reset by another thread while this block was waiting.
    Reset,
}

impl BlockOutcome {
    /// Whether every request of the group completed successfully.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// A group of asynchronous get/put requests that can be waited for as a whole.
///
/// Requests are issued with [`issue_read()`][Self::issue_read] and
/// [`issue_write()`][Self::issue_write]. Their outcomes arrive on whatever thread the
/// transport delivers them on; [`block()`][Self::block] suspends the calling thread until all of
/// them have completed, one of them has failed, or the timeout elapses.
///
/// All mutation of group state is serialized by one lock that is never held while calling into
/// the transport, so the transport may report outcomes from any thread, including the thread
/// that is issuing the request.
///
/// Dropping the group cancels every request that is still outstanding.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
///
/// use ca_client::{BlockOutcome, SyncGroup};
///
/// let group = SyncGroup::new();
///
/// // Nothing was issued, so there is nothing to wait for.
/// assert!(group.block(Duration::ZERO).is_complete());
/// assert_eq!(group.pending_count(), 0);
/// ```
#[derive(Debug)]
pub struct SyncGroup {
    shared: Arc<GroupShared>,
}

/// The part of a group that notify handles refer back to.
#[derive(Debug)]
pub(crate) struct GroupShared {
    name: String,
    pool: Arc<NotifyPool>,
    state: Mutex<GroupState>,

    /// Signaled whenever a blocked caller may be able to make progress: on the last
    /// completion, on any exception and on reset.
    event: CompletionEvent,
}

#[derive(Debug)]
struct GroupState {
    /// Every installed notify object, including failed ones. Its length is the pending count.
    notify_set: HashSet<NotifyKey, RandomState>,

    exception: Option<ExceptionRecord>,

    /// Advanced by every reset so that a concurrent block can tell it was interrupted.
    reset_epoch: u64,
}

impl SyncGroup {
    /// Creates a group with its own notify pool of default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a builder for configuring the group.
    pub fn builder() -> SyncGroupBuilder {
        SyncGroupBuilder::new()
    }

    /// The name used to identify the group in diagnostics.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Issues an asynchronous read and adds it to the group.
    ///
    /// Returns the slot that receives the value once the read completes.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not connected, if the notify pool is full or if the transport
    /// rejects the request. Nothing is added to the group in that case. An exception the
    /// transport reported for the request before rejecting it stays latched until reset.
    pub fn issue_read(
        &self,
        channel: &Arc<dyn Channel>,
        dbr_type: DbrType,
        count: ElementCount,
    ) -> Result<Arc<ReadResult>> {
        let result = Arc::new(ReadResult::default());

        self.issue(
            channel,
            NotifyKind::Read {
                result: Arc::clone(&result),
            },
            Request::Read { dbr_type, count },
        )?;

        Ok(result)
    }

    /// Issues an asynchronous write and adds it to the group.
    ///
    /// # Errors
    ///
    /// Fails if the channel is not connected, if the notify pool is full or if the transport
    /// rejects the request. Nothing is added to the group in that case. An exception the
    /// transport reported for the request before rejecting it stays latched until reset.
    pub fn issue_write(
        &self,
        channel: &Arc<dyn Channel>,
        dbr_type: DbrType,
        count: ElementCount,
        payload: &[u8],
    ) -> Result<()> {
        self.issue(
            channel,
            NotifyKind::Write,
            Request::Write {
                dbr_type,
                count,
                payload,
            },
        )
    }

    fn issue(
        &self,
        channel: &Arc<dyn Channel>,
        kind: NotifyKind,
        request: Request<'_>,
    ) -> Result<()> {
        if !channel.is_connected() {
            return Err(Error::ChannelNotConnected {
                channel: channel.name().to_string(),
            });
        }

        let shared = &self.shared;

        let key = {
            let mut state = shared.state.lock();

            let key = shared
                .pool
                .acquire(NotifyObject::new(kind, Arc::clone(channel)))
                .inspect_err(|_| NOTIFY_POOL_EXHAUSTED.with(Event::observe_once))?;

            state.notify_set.insert(key);
            key
        };

        // The group lock is released here: the transport may deliver the outcome before
        // `begin()` even returns.
        let handle = NotifyHandle::new(Arc::downgrade(shared), key);

        match notify::begin(channel.as_ref(), request, handle) {
            Ok(id) => {
                shared.record_request_id(key, id);
                trace!(group = %shared.name, channel = channel.name(), %id, "request issued");
                Ok(())
            }
            Err(status) => {
                shared.abandon(key);

                if status == CaStatus::Disconnected {
                    Err(Error::ChannelNotConnected {
                        channel: channel.name().to_string(),
                    })
                } else {
                    Err(Error::Transport {
                        channel: channel.name().to_string(),
                        status,
                    })
                }
            }
        }
    }

    /// Blocks the calling thread until every request of the group has completed, a request
    /// has failed, the group is reset or `timeout` elapses.
    ///
    /// A zero timeout inspects the group state without suspending. A timeout does not cancel
    /// anything: requests still outstanding stay installed and may complete later.
    #[must_use]
    pub fn block(&self, timeout: Duration) -> BlockOutcome {
        let shared = &self.shared;

        let started = Instant::now();
        let deadline = started.checked_add(timeout);
        let epoch = shared.state.lock().reset_epoch;

        let outcome = loop {
            let remaining = {
                let state = shared.state.lock();

                if state.reset_epoch != epoch {
                    break BlockOutcome::Reset;
                }

                if let Some(exception) = &state.exception {
                    break BlockOutcome::Failed(exception.clone());
                }

                if state.notify_set.is_empty() {
                    break BlockOutcome::Complete;
                }

                match deadline {
                    Some(deadline) => {
                        let now = Instant::now();

                        if now >= deadline {
                            break BlockOutcome::TimedOut;
                        }

                        Some(deadline.saturating_duration_since(now))
                    }
                    None => None,
                }
            };

            match remaining {
                Some(remaining) => {
                    // The outcome is evaluated from group state after every wakeup, so it does
                    // not matter whether this particular wait was signaled or timed out.
                    _ = shared.event.wait_timeout(remaining);
                }
                None => shared.event.wait(),
            }
        };

        BLOCK_WAIT_MS.with(|e| e.observe_millis(started.elapsed()));

        if matches!(outcome, BlockOutcome::TimedOut) {
            BLOCK_TIMEOUTS.with(Event::observe_once);
            debug!(group = %shared.name, ?timeout, "sync group block timed out");
        } else {
            // The condition we observed holds for every other blocked caller as well. Our
            // wakeup consumed the signal, so pass it on.
            shared.event.signal();
        }

        outcome
    }

    /// Cancels every outstanding request, clears the latched exception and empties the group.
    ///
    /// A concurrent [`block()`][Self::block] returns [`BlockOutcome::Reset`]. Outcomes that the
    /// transport delivers for the cancelled requests afterwards are discarded.
    pub fn reset(&self) {
        let objects = self.shared.drain();
        let cancelled = objects
            .into_iter()
            .map(NotifyObject::destroy)
            .filter(|cancelled| *cancelled)
            .count();

        self.shared.event.signal();

        debug!(group = %self.shared.name, cancelled, "sync group reset");
    }

    /// The number of requests installed in the group that have not completed successfully.
    ///
    /// Requests that failed stay installed, and are counted, until the group is reset.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.shared.state.lock().notify_set.len()
    }

    /// The latched exception, if any request of the group has failed since the last reset.
    #[must_use]
    pub fn exception(&self) -> Option<ExceptionRecord> {
        self.shared.state.lock().exception.clone()
    }

    /// Writes a human-readable status dump of the group.
    ///
    /// The first line summarizes the group. Higher levels add one entry per installed request,
    /// with increasing detail.
    ///
    /// # Errors
    ///
    /// Returns an error if writing to `out` fails.
    pub fn show(&self, out: &mut impl Write, level: u32) -> fmt::Result {
        let shared = &self.shared;

        let (pending, exception, snapshots) = {
            let state = shared.state.lock();

            let snapshots: Vec<NotifySnapshot> = if level > 0 {
                state
                    .notify_set
                    .iter()
                    .filter_map(|key| shared.pool.with(*key, NotifyObject::snapshot))
                    .collect()
            } else {
                Vec::new()
            };

            (state.notify_set.len(), state.exception.clone(), snapshots)
        };

        // Formatting the entries calls into the transport, so no lock may be held past here.
        writeln!(
            out,
            "sync group '{}': {pending} pending request(s)",
            shared.name
        )?;

        if let Some(exception) = &exception {
            writeln!(out, "  latched exception: {exception}")?;
        }

        for snapshot in &snapshots {
            out.write_str("  ")?;
            snapshot.show(out, level.saturating_sub(1))?;
        }

        Ok(())
    }
}

impl Default for SyncGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SyncGroup {
    fn drop(&mut self) {
        for object in self.shared.drain() {
            object.destroy();
        }
    }
}

impl GroupShared {
    fn record_request_id(&self, key: NotifyKey, id: RequestId) {
        let _state = self.state.lock();

        // If the object is gone, the request already completed (or the group was reset)
        // before the transport returned its id.
        _ = self
            .pool
            .with_mut(key, |object| object.record_request_id(id));
    }

    /// Uninstalls a notify object whose request the transport refused to accept.
    ///
    /// A latched exception is kept even if it came from this object.
    fn abandon(&self, key: NotifyKey) {
        let mut state = self.state.lock();

        if !state.notify_set.remove(&key) {
            return;
        }

        let object = self.pool.release(key);
        let drained = state.notify_set.is_empty();
        drop(state);

        drop(object);

        if drained {
            self.event.signal();
        }
    }

    /// Uninstalls every notify object and clears the latch. The caller destroys the returned
    /// objects after the group lock has been released.
    fn drain(&self) -> Vec<NotifyObject> {
        let mut state = self.state.lock();

        state.exception = None;
        state.reset_epoch = state.reset_epoch.wrapping_add(1);

        let keys: Vec<NotifyKey> = state.notify_set.drain().collect();

        keys.into_iter()
            .filter_map(|key| self.pool.release(key))
            .collect()
    }

    pub(crate) fn completion_notify(&self, key: NotifyKey, response: IoResponse<'_>) {
        let mut state = self.state.lock();

        match self.pool.with_mut(key, |object| object.complete(response)) {
            None => {
                drop(state);
                self.bad_magic(key, "completion");
                return;
            }
            Some(false) => {
                trace!(group = %self.name, ?key, "completion of failed request discarded");
                return;
            }
            Some(true) => {}
        }

        state.notify_set.remove(&key);
        let object = self.pool.release(key);
        let drained = state.notify_set.is_empty();
        drop(state);

        if let Some(object) = object {
            object.destroy();
        }

        NOTIFY_COMPLETIONS.with(Event::observe_once);

        if drained {
            trace!(group = %self.name, "last pending request completed");
            self.event.signal();
        }
    }

    pub(crate) fn exception_notify(
        &self,
        key: NotifyKey,
        status: CaStatus,
        context: &str,
        location: &'static Location<'static>,
        dbr_type: DbrType,
        count: ElementCount,
    ) {
        let mut state = self.state.lock();

        let failed = self.pool.with_mut(key, |object| {
            if object.is_failed() {
                None
            } else {
                // The object stays installed: the group result is now failed no matter how
                // the other requests end.
                object.fail();
                Some((object.channel_name().to_string(), object.op()))
            }
        });

        let Some(failed) = failed else {
            drop(state);
            self.bad_magic(key, "exception");
            return;
        };

        let Some((channel, op)) = failed else {
            trace!(group = %self.name, ?key, %status, "repeated exception discarded");
            return;
        };

        let first = state.exception.is_none();

        if first {
            state.exception = Some(ExceptionRecord {
                status,
                context: context.to_string(),
                location,
                channel: channel.clone(),
                dbr_type,
                count,
                op,
            });
        }

        drop(state);

        NOTIFY_EXCEPTIONS.with(Event::observe_once);
        debug!(
            group = %self.name,
            channel,
            %op,
            %status,
            context,
            first,
            "sync group request failed"
        );

        self.event.signal();
    }

    fn bad_magic(&self, key: NotifyKey, callback: &str) {
        NOTIFY_BAD_MAGIC.with(Event::observe_once);
        warn!(
            group = %self.name,
            ?key,
            callback,
            "sync group {callback} with bad notify magic number discarded"
        );
    }
}

/// Builder for configuring a [`SyncGroup`].
#[derive(Debug)]
#[must_use]
pub struct SyncGroupBuilder {
    pool: Option<Arc<NotifyPool>>,
    name: Option<String>,
}

impl SyncGroupBuilder {
    fn new() -> Self {
        Self {
            pool: None,
            name: None,
        }
    }

    /// Sets the notify pool the group allocates its notify objects from.
    ///
    /// By default every group gets a private pool of default capacity.
    pub fn pool(mut self, pool: Arc<NotifyPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Sets the name that identifies the group in diagnostics.
    ///
    /// By default groups are named by a process-unique sequence number.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Builds the group with the configured settings.
    #[must_use]
    pub fn build(self) -> SyncGroup {
        let name = self.name.unwrap_or_else(|| {
            format!("sg{}", NEXT_GROUP_ID.fetch_add(1, Ordering::Relaxed))
        });

        SyncGroup {
            shared: Arc::new(GroupShared {
                name,
                pool: self.pool.unwrap_or_default(),
                state: Mutex::new(GroupState {
                    notify_set: HashSet::default(),
                    exception: None,
                    reset_epoch: 0,
                }),
                event: CompletionEvent::new(InitialState::Empty),
            }),
        }
    }
}
