//! Long-poll multiplexer.
//!
//! Many clients wait on many streams, each from its own cursor. Instead of
//! one blocking read per client, the multiplexer keeps a single read in
//! flight covering the minimum cursor of every stream anyone waits on:
//! - Waiters are grouped by stream, then by cursor
//! - A registration below a stream's minimum restarts the read
//! - A returned batch completes every group it has news for, once
//!
//! # Example
//!
//! ```ignore
//! let store: Arc<dyn LogStore> = Arc::new(StreamLog::in_memory());
//! let mux = Multiplexer::start(Arc::clone(&store), MuxConfig::default())?;
//!
//! // Parks until something newer than version 4 lands on "doc-1".
//! let entries = mux.wait("doc-1", Cursor(4), Duration::from_secs(30)).await;
//! ```

mod dispatch;
mod manager;
mod reader;
mod registry;

pub use dispatch::{dispatch, DispatchSummary};
pub use manager::{MuxConfig, MuxStats, Multiplexer, PendingWait, DEFAULT_READ_TIMEOUT};
pub use reader::ReaderStatus;
pub use registry::{Registration, Waiter, WaiterId, WaiterRegistry};
