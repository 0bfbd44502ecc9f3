use thiserror::Error;

use crate::CaStatus;

/// Errors that can occur when issuing requests through a sync group.
///
/// Failures of a request that was successfully issued are not reported through this type.
/// They arrive later through the transport's exception callback and are latched by the
/// group, see [`BlockOutcome::Failed`][crate::BlockOutcome::Failed].
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The channel has no connected virtual circuit, so no request can be issued on it.
    #[error("channel '{channel}' is not connected")]
    ChannelNotConnected {
        /// Name of the channel the request was addressed to.
        channel: String,
    },

    /// Every slot of the notify pool is occupied by an outstanding request.
    #[error("notify pool exhausted: all {capacity} slots are in use")]
    PoolExhausted {
        /// Capacity of the exhausted pool.
        capacity: usize,
    },

    /// The transport refused to accept the request.
    #[error("transport rejected request on channel '{channel}': {status}")]
    Transport {
        /// Name of the channel the request was addressed to.
        channel: String,

        /// The status reported by the transport.
        status: CaStatus,
    },
}

/// A specialized `Result` type for request operations, returning the crate's
/// [`Error`] type as the error value.
pub(crate) type Result<T> = std::result::Result<T, Error>;
