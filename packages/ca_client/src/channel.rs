use std::fmt::{self, Debug, Display};

use crate::{CaStatus, NotifyHandle};

/// Identifies an outstanding request on a channel, as assigned by the transport.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct RequestId(pub u32);

impl Display for RequestId {
    #[cfg_attr(test, mutants::skip)] // No API contract for display text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Request/response data type code.
///
/// The client core does not interpret the code, it only carries it between the caller and the
/// transport, which owns the encoding.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct DbrType(pub u16);

/// Number of array elements carried by a request or response.
pub type ElementCount = u32;

/// Payload delivered by the transport when a request completes.
///
/// For a write the payload is empty and the type/count echo the request.
#[derive(Clone, Copy, Debug)]
pub struct IoResponse<'a> {
    /// Data type of the payload.
    pub dbr_type: DbrType,

    /// Number of elements in the payload.
    pub count: ElementCount,

    /// Encoded value bytes, exactly as received.
    pub payload: &'a [u8],
}

impl<'a> IoResponse<'a> {
    /// Creates a response carrying a value.
    #[must_use]
    pub fn new(dbr_type: DbrType, count: ElementCount, payload: &'a [u8]) -> Self {
        Self {
            dbr_type,
            count,
            payload,
        }
    }

    /// Creates a response that carries no value, as used to acknowledge a write.
    #[must_use]
    pub fn ack(dbr_type: DbrType, count: ElementCount) -> Self {
        Self {
            dbr_type,
            count,
            payload: &[],
        }
    }
}

/// The transport side of a channel: a named remote value reachable over a virtual circuit.
///
/// Implementations own the wire encoding and the connection. The client core only issues
/// requests, cancels them and receives their outcome through the [`NotifyHandle`] given with
/// each request.
///
/// # Callback contract
///
/// For every request accepted by [`read()`][Self::read] or [`write()`][Self::write], the
/// transport invokes exactly one of [`NotifyHandle::completion()`] or
/// [`NotifyHandle::exception()`], at most once. It may do so from any thread, including
/// synchronously before `read()`/`write()` returns. After [`io_cancel()`][Self::io_cancel]
/// the transport should not deliver the outcome, though the client tolerates it if it does.
pub trait Channel: Debug + Send + Sync {
    /// The name of the channel, used in diagnostics and errors.
    fn name(&self) -> &str;

    /// Whether the channel currently has a connected virtual circuit.
    fn is_connected(&self) -> bool;

    /// Issues an asynchronous read of `count` elements of type `dbr_type`.
    ///
    /// # Errors
    ///
    /// Returns the status explaining why the transport could not accept the request.
    fn read(
        &self,
        dbr_type: DbrType,
        count: ElementCount,
        notify: NotifyHandle,
    ) -> Result<RequestId, CaStatus>;

    /// Issues an asynchronous write of `count` elements of type `dbr_type`.
    ///
    /// # Errors
    ///
    /// Returns the status explaining why the transport could not accept the request.
    fn write(
        &self,
        dbr_type: DbrType,
        count: ElementCount,
        payload: &[u8],
        notify: NotifyHandle,
    ) -> Result<RequestId, CaStatus>;

    /// Cancels an outstanding request.
    fn io_cancel(&self, id: RequestId);
}
