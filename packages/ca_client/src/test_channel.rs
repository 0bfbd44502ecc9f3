#![cfg_attr(coverage_nightly, coverage(off))] // This is all test code, no need to test it.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::{CaStatus, Channel, DbrType, ElementCount, NotifyHandle, RequestId};

/// In-memory channel that records what the client core asks of the transport and lets the
/// test deliver outcomes at a time of its choosing.
#[derive(Debug)]
pub(crate) struct FakeChannel {
    name: String,
    connected: AtomicBool,
    next_id: AtomicU32,
    state: Mutex<FakeState>,
}

#[derive(Debug, Default)]
struct FakeState {
    issued: Vec<(RequestId, NotifyHandle)>,
    written: Vec<Vec<u8>>,
    cancelled: Vec<RequestId>,
    reject_with: Option<CaStatus>,
    fail_then_reject: Option<CaStatus>,
}

impl FakeChannel {
    pub(crate) fn connected(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connected: AtomicBool::new(true),
            next_id: AtomicU32::new(1),
            state: Mutex::new(FakeState::default()),
        }
    }

    pub(crate) fn disconnected(name: &str) -> Self {
        let channel = Self::connected(name);
        channel.connected.store(false, Ordering::Relaxed);
        channel
    }

    pub(crate) fn reject_with(&self, status: CaStatus) {
        self.state.lock().reject_with = Some(status);
    }

    /// Makes the channel report an exception for every new request and then refuse it.
    pub(crate) fn fail_then_reject(&self, status: CaStatus) {
        self.state.lock().fail_then_reject = Some(status);
    }

    pub(crate) fn issued(&self) -> Vec<RequestId> {
        self.state.lock().issued.iter().map(|(id, _)| *id).collect()
    }

    pub(crate) fn written(&self) -> Vec<Vec<u8>> {
        self.state.lock().written.clone()
    }

    pub(crate) fn handle(&self, id: RequestId) -> NotifyHandle {
        self.state
            .lock()
            .issued
            .iter()
            .find(|(issued_id, _)| *issued_id == id)
            .map(|(_, handle)| handle.clone())
            .expect("request was never issued on this channel")
    }

    pub(crate) fn cancelled(&self) -> Vec<RequestId> {
        self.state.lock().cancelled.clone()
    }

    fn accept(&self, notify: NotifyHandle) -> Result<RequestId, CaStatus> {
        let mut state = self.state.lock();

        if let Some(status) = state.reject_with {
            return Err(status);
        }

        if let Some(status) = state.fail_then_reject {
            drop(state);
            notify.exception(status, "refused after failing", DbrType(0), 0);
            return Err(status);
        }

        let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
        state.issued.push((id, notify));
        Ok(id)
    }
}

impl Channel for FakeChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    fn read(
        &self,
        _dbr_type: DbrType,
        _count: ElementCount,
        notify: NotifyHandle,
    ) -> Result<RequestId, CaStatus> {
        self.accept(notify)
    }

    fn write(
        &self,
        _dbr_type: DbrType,
        _count: ElementCount,
        payload: &[u8],
        notify: NotifyHandle,
    ) -> Result<RequestId, CaStatus> {
        let id = self.accept(notify)?;
        self.state.lock().written.push(payload.to_vec());
        Ok(id)
    }

    fn io_cancel(&self, id: RequestId) {
        self.state.lock().cancelled.push(id);
    }
}
