use std::fmt::{self, Display};

/// Status code carried by a request exception delivered from the transport.
///
/// These mirror the protocol status codes that the server or the client library may attach to
/// a failed get/put request. The message text of each code is stable but is not intended for
/// machine parsing.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum CaStatus {
    /// The request completed normally.
    Normal,

    /// The request did not complete within the allotted time.
    Timeout,

    /// The virtual circuit carrying the channel disconnected.
    Disconnected,

    /// The server rejected the requested data type.
    BadType,

    /// The server rejected the requested element count.
    BadCount,

    /// Read access to the channel is denied.
    NoReadAccess,

    /// Write access to the channel is denied.
    NoWriteAccess,

    /// The server failed to read the value.
    GetFail,

    /// The server failed to write the value.
    PutFail,

    /// The channel was destroyed while the request was outstanding.
    ChannelDestroyed,

    /// Unexpected internal failure in the client library.
    Internal,
}

impl CaStatus {
    /// Human-readable description of the status code.
    #[must_use]
    pub fn message(self) -> &'static str {
        match self {
            Self::Normal => "normal successful completion",
            Self::Timeout => "user specified timeout on IO operation expired",
            Self::Disconnected => "virtual circuit disconnect",
            Self::BadType => "the data type specified is invalid",
            Self::BadCount => "invalid element count requested",
            Self::NoReadAccess => "read access denied",
            Self::NoWriteAccess => "write access denied",
            Self::GetFail => "could not perform a database value get for that channel",
            Self::PutFail => "could not perform a database value put for that channel",
            Self::ChannelDestroyed => "user destroyed the channel while a request was pending",
            Self::Internal => "unexpected internal library failure",
        }
    }

    /// Whether the status represents a successful outcome.
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Normal)
    }
}

impl Display for CaStatus {
    #[cfg_attr(test, mutants::skip)] // No API contract for status message text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// The kind of operation a failed request performed.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum OpKind {
    /// A read of the channel value.
    Get,

    /// A write of the channel value.
    Put,
}

impl Display for OpKind {
    #[cfg_attr(test, mutants::skip)] // No API contract for display text.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Get => f.write_str("get"),
            Self::Put => f.write_str("put"),
        }
    }
}
