//! Per-request bookkeeping that bridges an asynchronous transport call to group accounting.

use std::fmt::{self, Write};
use std::panic::Location;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::trace;

use crate::{
    CaStatus, Channel, DbrType, ElementCount, GroupShared, IoResponse, NotifyKey, OpKind,
    RequestId,
};

/// A value delivered to a read request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ReadValue {
    /// Data type of the value.
    pub dbr_type: DbrType,

    /// Number of elements in the value.
    pub count: ElementCount,

    /// Encoded value bytes as delivered by the transport.
    pub payload: Vec<u8>,
}

/// Destination of a read issued through a sync group.
///
/// The slot stays empty until the read completes. Once the group reports
/// [`BlockOutcome::Complete`][crate::BlockOutcome::Complete], every slot issued before the
/// block holds its value.
#[derive(Debug, Default)]
pub struct ReadResult {
    value: Mutex<Option<ReadValue>>,
}

impl ReadResult {
    /// Returns a copy of the delivered value, if the read has completed.
    #[must_use]
    pub fn value(&self) -> Option<ReadValue> {
        self.value.lock().clone()
    }

    /// Takes the delivered value out of the slot, if the read has completed.
    #[must_use]
    pub fn take(&self) -> Option<ReadValue> {
        self.value.lock().take()
    }

    /// Whether a value has been delivered (and not yet taken).
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.value.lock().is_some()
    }

    fn store(&self, response: IoResponse<'_>) {
        *self.value.lock() = Some(ReadValue {
            dbr_type: response.dbr_type,
            count: response.count,
            payload: response.payload.to_vec(),
        });
    }
}

/// What a notify object is waiting for.
#[derive(Debug)]
pub(crate) enum NotifyKind {
    Read { result: Arc<ReadResult> },
    Write,
}

impl NotifyKind {
    pub(crate) fn op(&self) -> OpKind {
        match self {
            Self::Read { .. } => OpKind::Get,
            Self::Write => OpKind::Put,
        }
    }
}

/// The request a notify object issues on `begin()`.
#[derive(Clone, Copy, Debug)]
pub(crate) enum Request<'a> {
    Read {
        dbr_type: DbrType,
        count: ElementCount,
    },
    Write {
        dbr_type: DbrType,
        count: ElementCount,
        payload: &'a [u8],
    },
}

/// One outstanding asynchronous request bound to one channel.
///
/// Lives in a [`NotifyPool`][crate::NotifyPool] slot from issue until completion, reset or the
/// destruction of the owning group. All access goes through the owning group's lock.
#[derive(Debug)]
pub(crate) struct NotifyObject {
    kind: NotifyKind,
    channel: Arc<dyn Channel>,

    /// Set when the transport accepted the request; `Some` means a cancellable request is
    /// outstanding.
    request_id: Option<RequestId>,

    /// Set when the transport reported an exception. A failed object stays installed in its
    /// group until reset and ignores any further outcome.
    failed: bool,

    /// Stamped by the pool on insertion and checked against the handle on every callback.
    pub(crate) magic: u32,
}

impl NotifyObject {
    pub(crate) fn new(kind: NotifyKind, channel: Arc<dyn Channel>) -> Self {
        Self {
            kind,
            channel,
            request_id: None,
            failed: false,
            magic: 0,
        }
    }

    pub(crate) fn op(&self) -> OpKind {
        self.kind.op()
    }

    pub(crate) fn channel_name(&self) -> &str {
        self.channel.name()
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.failed
    }

    pub(crate) fn request_id(&self) -> Option<RequestId> {
        self.request_id
    }

    /// Records the id of the accepted request, unless an outcome already arrived in between.
    pub(crate) fn record_request_id(&mut self, id: RequestId) {
        if !self.failed {
            self.request_id = Some(id);
        }
    }

    /// Applies a successful outcome. Returns `false` if the object already failed, in which
    /// case the completion is discarded.
    pub(crate) fn complete(&mut self, response: IoResponse<'_>) -> bool {
        if self.failed {
            return false;
        }

        self.request_id = None;

        if let NotifyKind::Read { result } = &self.kind {
            result.store(response);
        }

        true
    }

    /// Marks the request as finished with an exception. The object remains installed.
    pub(crate) fn fail(&mut self) {
        self.failed = true;
        self.request_id = None;
    }

    /// Runs destruction logic: cancels the request via the channel if one is still
    /// outstanding. Returns whether a cancellation was issued.
    ///
    /// Must not be called while holding the group lock, as the transport may take its own
    /// locks to cancel.
    pub(crate) fn destroy(self) -> bool {
        match self.request_id {
            Some(id) => {
                trace!(channel = self.channel.name(), %id, "cancelling outstanding request");
                self.channel.io_cancel(id);
                true
            }
            None => false,
        }
    }

    /// Copies out what a status dump needs, so that it can be written without holding the
    /// group or pool lock.
    pub(crate) fn snapshot(&self) -> NotifySnapshot {
        NotifySnapshot {
            op: self.op(),
            channel: Arc::clone(&self.channel),
            request_id: self.request_id(),
            failed: self.failed,
            magic: self.magic,
        }
    }
}

/// Diagnostic copy of a [`NotifyObject`].
///
/// Formatting may call into the transport, so it happens only after every lock of the client
/// core has been released.
#[derive(Debug)]
pub(crate) struct NotifySnapshot {
    op: OpKind,
    channel: Arc<dyn Channel>,
    request_id: Option<RequestId>,
    failed: bool,
    magic: u32,
}

impl NotifySnapshot {
    pub(crate) fn show(&self, out: &mut impl Write, level: u32) -> fmt::Result {
        match self.op {
            OpKind::Get => writeln!(out, "pending read sg op")?,
            OpKind::Put => writeln!(out, "pending write sg op")?,
        }

        if level > 0 {
            self.show_base(out, level - 1)?;
        }

        Ok(())
    }

    fn show_base(&self, out: &mut impl Write, level: u32) -> fmt::Result {
        write!(out, "    channel '{}'", self.channel.name())?;

        match self.request_id {
            Some(id) => writeln!(out, ", request {id} outstanding")?,
            None if self.failed => writeln!(out, ", failed")?,
            None => writeln!(out, ", no cancellable request")?,
        }

        if level > 0 {
            writeln!(
                out,
                "    magic {:#010x}, connected {}",
                self.magic,
                self.channel.is_connected()
            )?;
        }

        Ok(())
    }
}

/// Issues the request on the channel. The caller records the returned id.
pub(crate) fn begin(
    channel: &dyn Channel,
    request: Request<'_>,
    notify: NotifyHandle,
) -> Result<RequestId, CaStatus> {
    match request {
        Request::Read { dbr_type, count } => channel.read(dbr_type, count, notify),
        Request::Write {
            dbr_type,
            count,
            payload,
        } => channel.write(dbr_type, count, payload, notify),
    }
}

/// The capability a transport uses to report the outcome of one request.
///
/// The handle does not keep the group alive. If the group has been dropped, or the request was
/// reset or already completed, the callbacks are discarded.
#[derive(Clone, Debug)]
pub struct NotifyHandle {
    group: Weak<GroupShared>,
    key: NotifyKey,
}

impl NotifyHandle {
    pub(crate) fn new(group: Weak<GroupShared>, key: NotifyKey) -> Self {
        Self { group, key }
    }

    /// Reports successful completion of the request.
    pub fn completion(&self, response: IoResponse<'_>) {
        match self.group.upgrade() {
            Some(group) => group.completion_notify(self.key, response),
            None => trace!(key = ?self.key, "completion for a destroyed sync group discarded"),
        }
    }

    /// Reports that the request failed.
    ///
    /// The caller's source location is recorded with the exception.
    #[track_caller]
    pub fn exception(
        &self,
        status: CaStatus,
        context: &str,
        dbr_type: DbrType,
        count: ElementCount,
    ) {
        let location = Location::caller();

        match self.group.upgrade() {
            Some(group) => {
                group.exception_notify(self.key, status, context, location, dbr_type, count);
            }
            None => trace!(key = ?self.key, %status, "exception for a destroyed sync group discarded"),
        }
    }
}
