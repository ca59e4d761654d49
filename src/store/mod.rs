//! Stream log: append, blocking range reads, and read cancellation.
//!
//! The multiplexer only talks to a log through [`LogStore`]. The crate ships
//! one implementation, [`StreamLog`], which keeps streams in memory and can
//! optionally journal every append to disk.

mod cancel;
mod journal;
mod log;

pub use cancel::CancelToken;
pub use journal::{Journal, JournalRecord};
pub use log::{LogConfig, StreamLog};

use crate::error::Result;
use crate::types::{CursorSet, EntryId, Fields, IdRequest, ReadBatch, StreamName};
use std::time::Duration;

/// How a blocking read ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReadOutcome {
    /// At least one stream had entries past its cursor.
    Entries(ReadBatch),
    /// The timeout elapsed with nothing new.
    TimedOut,
    /// The read was cancelled through its [`CancelToken`].
    Interrupted,
}

/// An append-only, per-stream log with blocking range reads.
pub trait LogStore: Send + Sync {
    /// Append an entry and return its id.
    ///
    /// Fails with [`StoreError::Conflict`](crate::StoreError::Conflict) when
    /// the resulting id is not strictly greater than the stream's tail.
    fn append(&self, stream: &StreamName, id: IdRequest, fields: Fields) -> Result<EntryId>;

    /// Block until some stream in `cursors` holds entries whose coarse id is
    /// strictly greater than its cursor, the timeout elapses, or `cancel`
    /// fires.
    ///
    /// Returned entries are every such entry, in append order.
    fn blocking_read(
        &self,
        cursors: &CursorSet,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ReadOutcome>;

    /// Id of the newest entry in `stream`, if any.
    fn tail_id(&self, stream: &StreamName) -> Result<Option<EntryId>>;
}
