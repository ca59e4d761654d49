//! # streampoll
//!
//! HTTP long-polling over an append-only stream log, with every waiting
//! client served by a single blocking reader.
//!
//! ## Core Concepts
//!
//! - **Streams**: Append-only logs of field/value entries with ordered ids
//! - **Cursors**: A client's watermark; it waits for entries past it
//! - **Multiplexer**: One blocking read covering the minimum cursor of each
//!   stream, restarted when a lower cursor shows up
//! - **HTTP**: `POST /message` appends, `GET /messages` long-polls
//!
//! ## Example
//!
//! ```ignore
//! use streampoll::{Cursor, Fields, IdRequest, LogStore, Multiplexer, MuxConfig, StreamLog};
//!
//! let store: Arc<dyn LogStore> = Arc::new(StreamLog::in_memory());
//! let mux = Multiplexer::start(Arc::clone(&store), MuxConfig::default())?;
//!
//! let wait = mux.register("orders", Cursor(4));
//! store.append(&"orders".into(), "5-0".parse()?, Fields::new().with("a", "1"))?;
//!
//! let entries = wait.recv_timeout(Duration::from_secs(30)).await;
//! ```

pub mod app;
pub mod config;
pub mod error;
pub mod http;
pub mod mux;
pub mod observability;
pub mod store;
pub mod types;

// Re-exports
pub use error::{Result, StoreError};
pub use mux::{MuxConfig, MuxStats, Multiplexer, PendingWait, ReaderStatus};
pub use store::{CancelToken, LogConfig, LogStore, ReadOutcome, StreamLog};
pub use types::{Cursor, CursorSet, Entry, EntryId, Fields, IdRequest, ReadBatch, StreamName};
