use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use ca_client::{
    CaStatus, Channel, DbrType, ElementCount, IoResponse, NotifyHandle, OpKind, RequestId,
};
use parking_lot::Mutex;

/// A request that a [`RecordingChannel`] accepted.
#[derive(Clone, Debug)]
pub struct IssuedRequest {
    /// Id assigned to the request.
    pub id: RequestId,

    /// Whether the request is a read or a write.
    pub op: OpKind,

    /// Requested data type.
    pub dbr_type: DbrType,

    /// Requested element count.
    pub count: ElementCount,

    /// Payload of a write. Empty for reads.
    pub payload: Vec<u8>,

    handle: NotifyHandle,
}

/// An in-memory [`Channel`] that records every request and lets the test decide when and how
/// each request ends.
///
/// Outcomes are delivered on whatever thread calls [`complete()`][Self::complete] or
/// [`fail()`][Self::fail], which makes the channel usable from helper threads simulating a
/// receive thread.
#[derive(Debug)]
pub struct RecordingChannel {
    name: String,
    connected: AtomicBool,
    complete_inline: AtomicBool,
    keep_history: AtomicBool,
    next_id: AtomicU32,
    state: Mutex<RecordingState>,
}

#[derive(Debug, Default)]
struct RecordingState {
    issued: Vec<IssuedRequest>,
    cancelled: Vec<RequestId>,
    reject_with: Option<CaStatus>,
}

impl RecordingChannel {
    /// Creates a connected channel.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connected: AtomicBool::new(true),
            complete_inline: AtomicBool::new(false),
            keep_history: AtomicBool::new(true),
            next_id: AtomicU32::new(1),
            state: Mutex::new(RecordingState::default()),
        }
    }

    /// Changes whether the channel reports a connected circuit.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    /// Makes the channel refuse every new request with `status`, or accept them again.
    pub fn reject_with(&self, status: Option<CaStatus>) {
        self.state.lock().reject_with = status;
    }

    /// Makes the channel complete every accepted request before returning from the issue call.
    pub fn complete_inline(&self, enabled: bool) {
        self.complete_inline.store(enabled, Ordering::Relaxed);
    }

    /// Changes whether accepted and cancelled requests are remembered.
    ///
    /// Without history the channel uses constant memory, but requests can no longer be looked
    /// up, so their outcome must be delivered inline.
    pub fn keep_history(&self, enabled: bool) {
        self.keep_history.store(enabled, Ordering::Relaxed);
    }

    /// Every request accepted so far, in order.
    #[must_use]
    pub fn issued(&self) -> Vec<IssuedRequest> {
        self.state.lock().issued.clone()
    }

    /// Ids of every cancelled request, in order of cancellation.
    #[must_use]
    pub fn cancelled(&self) -> Vec<RequestId> {
        self.state.lock().cancelled.clone()
    }

    /// The notify handle of an accepted request.
    ///
    /// # Panics
    ///
    /// Panics if no request with this id was accepted.
    #[must_use]
    pub fn handle(&self, id: RequestId) -> NotifyHandle {
        self.request(id).handle
    }

    /// Completes a request successfully. Reads receive `payload` as their value.
    ///
    /// # Panics
    ///
    /// Panics if no request with this id was accepted.
    pub fn complete(&self, id: RequestId, payload: &[u8]) {
        let request = self.request(id);

        request
            .handle
            .completion(IoResponse::new(request.dbr_type, request.count, payload));
    }

    /// Fails a request with `status`.
    ///
    /// # Panics
    ///
    /// Panics if no request with this id was accepted.
    #[track_caller]
    pub fn fail(&self, id: RequestId, status: CaStatus, context: &str) {
        let request = self.request(id);

        request
            .handle
            .exception(status, context, request.dbr_type, request.count);
    }

    fn request(&self, id: RequestId) -> IssuedRequest {
        self.state
            .lock()
            .issued
            .iter()
            .find(|request| request.id == id)
            .cloned()
            .expect("request was never issued on this channel")
    }

    fn accept(
        &self,
        op: OpKind,
        dbr_type: DbrType,
        count: ElementCount,
        payload: &[u8],
        handle: NotifyHandle,
    ) -> Result<RequestId, CaStatus> {
        let mut state = self.state.lock();

        if let Some(status) = state.reject_with {
            return Err(status);
        }

        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));

        if self.keep_history.load(Ordering::Relaxed) {
            state.issued.push(IssuedRequest {
                id,
                op,
                dbr_type,
                count,
                payload: payload.to_vec(),
                handle: handle.clone(),
            });
        }

        drop(state);

        if self.complete_inline.load(Ordering::Relaxed) {
            handle.completion(IoResponse::new(dbr_type, count, payload));
        }

        Ok(id)
    }
}

impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn read(
        &self,
        dbr_type: DbrType,
        count: ElementCount,
        notify: NotifyHandle,
    ) -> Result<RequestId, CaStatus> {
        self.accept(OpKind::Get, dbr_type, count, &[], notify)
    }

    fn write(
        &self,
        dbr_type: DbrType,
        count: ElementCount,
        payload: &[u8],
        notify: NotifyHandle,
    ) -> Result<RequestId, CaStatus> {
        self.accept(OpKind::Put, dbr_type, count, payload, notify)
    }

    fn io_cancel(&self, id: RequestId) {
        if self.keep_history.load(Ordering::Relaxed) {
            self.state.lock().cancelled.push(id);
        }
    }
}
