#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! Client-side core of a Channel Access client: synchronous request groups and connection
//! liveness supervision.
//!
//! The crate sits between user code and a transport that speaks the wire protocol. The
//! transport is abstracted by the [`Channel`] trait; the crate never touches a socket.
//!
//! # Sync groups
//!
//! A [`SyncGroup`] lets a thread issue any number of asynchronous get/put requests and then
//! wait for all of them with one [`SyncGroup::block()`] call. The first failure of any member
//! request is latched and reported until the group is reset.
//!
//! ```rust
//! use std::time::Duration;
//!
//! use ca_client::{BlockOutcome, SyncGroup};
//!
//! let group = SyncGroup::builder().name("setpoints").build();
//!
//! // Issue reads and writes via `group.issue_read()` / `group.issue_write()`, then:
//! match group.block(Duration::from_secs(1)) {
//!     BlockOutcome::Complete => {}
//!     BlockOutcome::TimedOut => group.reset(),
//!     BlockOutcome::Failed(exception) => eprintln!("{exception}"),
//!     _ => {}
//! }
//! ```
//!
//! Notify objects, the per-request bookkeeping of a group, live in a [`NotifyPool`] that may
//! be shared by many groups.
//!
//! # Connection watchdog
//!
//! A [`ConnectionWatchdog`] watches the receive side of a virtual circuit and asks the
//! connection (a [`ConnectionHealth`] implementation) to probe the peer when the circuit goes
//! silent, escalating to the connection if the probe goes unanswered. It runs on a timer from
//! a [`TimerQueue`], either the background [`ThreadTimerQueue`] or the deterministic
//! [`ManualTimerQueue`].
//!
//! # Observability
//!
//! Lifecycle events are logged through `tracing`. Counters and the block wait time histogram
//! are published as `nm` events.

mod channel;
mod completion;
mod config;
mod error;
mod metrics;
mod notify;
mod notify_pool;
mod status;
mod sync_group;
mod timer;
mod watchdog;

#[cfg(test)]
mod test_channel;

pub use channel::*;
pub use completion::*;
pub use config::*;
pub use error::Error;
pub(crate) use error::Result;
pub(crate) use notify::NotifyObject;
pub use notify::{NotifyHandle, ReadResult, ReadValue};
pub(crate) use notify_pool::NotifyKey;
pub use notify_pool::{DEFAULT_NOTIFY_POOL_CAPACITY, NotifyPool, NotifyPoolBuilder};
pub use status::*;
pub(crate) use sync_group::GroupShared;
pub use sync_group::{BlockOutcome, ExceptionRecord, SyncGroup, SyncGroupBuilder};
pub use timer::*;
pub use watchdog::*;
