//! In-process stream log with blocking reads.

use super::{CancelToken, Journal, LogStore, ReadOutcome};
use crate::error::{Result, StoreError};
use crate::types::{
    now_millis, CursorSet, Entry, EntryId, Fields, IdRequest, ReadBatch, StreamName,
};
use fs2::FileExt;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Magic bytes for the log manifest.
const LOG_MAGIC: &[u8; 4] = b"SPL\0";

/// Current on-disk layout version.
const LOG_VERSION: u8 = 1;

/// Configuration for a durable [`StreamLog`].
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Directory holding the manifest, lock, and journal.
    pub path: PathBuf,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Fsync the journal every N appends.
    pub sync_interval: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./streampoll-data"),
            create_if_missing: true,
            sync_interval: 100,
        }
    }
}

/// State shared with cancel interrupts.
struct Shared {
    streams: Mutex<HashMap<StreamName, Vec<Entry>>>,
    /// Signalled on every append and on every interrupt.
    appended: Condvar,
}

/// Append-only stream log.
///
/// Entries live in memory; a log opened with [`StreamLog::open`] also
/// journals every append and replays the journal on open.
pub struct StreamLog {
    shared: Arc<Shared>,
    journal: Option<Journal>,
    path: Option<PathBuf>,
    /// Held for the lifetime of a durable log.
    _lock_file: Option<File>,
}

impl StreamLog {
    /// A log without durability.
    pub fn in_memory() -> Self {
        Self {
            shared: Arc::new(Shared {
                streams: Mutex::new(HashMap::new()),
                appended: Condvar::new(),
            }),
            journal: None,
            path: None,
            _lock_file: None,
        }
    }

    /// Open a durable log, creating it if allowed.
    pub fn open(config: LogConfig) -> Result<Self> {
        let manifest = config.path.join("MANIFEST");
        if manifest.exists() {
            Self::verify_manifest(&config.path)?;
        } else if config.create_if_missing {
            fs::create_dir_all(&config.path)?;
            Self::write_manifest(&config.path)?;
        } else {
            return Err(StoreError::NotInitialized);
        }

        let lock_file = Self::acquire_lock(&config.path)?;
        let (journal, records) =
            Journal::open(config.path.join("entries.journal"), config.sync_interval)?;

        let mut streams: HashMap<StreamName, Vec<Entry>> = HashMap::new();
        let total = records.len();
        for record in records {
            let entries = streams.entry(record.stream).or_default();
            if let Some(tail) = entries.last() {
                if record.entry.id <= tail.id {
                    return Err(StoreError::Corruption(format!(
                        "journal entry {} does not follow {}",
                        record.entry.id, tail.id
                    )));
                }
            }
            entries.push(record.entry);
        }

        tracing::info!(
            path = %config.path.display(),
            streams = streams.len(),
            entries = total,
            "recovered stream log"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                streams: Mutex::new(streams),
                appended: Condvar::new(),
            }),
            journal: Some(journal),
            path: Some(config.path),
            _lock_file: Some(lock_file),
        })
    }

    /// Directory of a durable log.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Number of entries in `stream`.
    pub fn len(&self, stream: &StreamName) -> usize {
        self.shared.streams.lock().get(stream).map_or(0, Vec::len)
    }

    /// Number of streams holding at least one entry.
    pub fn stream_count(&self) -> usize {
        self.shared.streams.lock().len()
    }

    /// Force journaled appends to disk. A no-op for in-memory logs.
    pub fn sync(&self) -> Result<()> {
        match &self.journal {
            Some(journal) => journal.sync(),
            None => Ok(()),
        }
    }

    /// Resolve the id an append would receive, or a conflict.
    fn assign_id(stream: &StreamName, request: IdRequest, tail: Option<EntryId>) -> Result<EntryId> {
        let conflict = |id: EntryId| StoreError::Conflict {
            stream: stream.clone(),
            id,
            tail: tail.unwrap_or(EntryId::ZERO),
        };

        let id = match request {
            IdRequest::Auto => {
                let ms = now_millis();
                match tail {
                    Some(tail) if tail.ms >= ms => tail.next().ok_or_else(|| conflict(tail))?,
                    _ => EntryId::new(ms, 0),
                }
            }
            IdRequest::AutoSequence(ms) => match tail {
                Some(tail) if tail.ms == ms => tail.next().ok_or_else(|| conflict(tail))?,
                Some(tail) if tail.ms > ms => return Err(conflict(EntryId::new(ms, 0))),
                _ if ms == 0 => EntryId::new(0, 1),
                _ => EntryId::new(ms, 0),
            },
            IdRequest::Explicit(id) => id,
        };

        if id == EntryId::ZERO || tail.is_some_and(|tail| id <= tail) {
            return Err(conflict(id));
        }
        Ok(id)
    }

    fn collect_after(streams: &HashMap<StreamName, Vec<Entry>>, cursors: &CursorSet) -> ReadBatch {
        let mut batch = ReadBatch::new();
        for (stream, cursor) in cursors {
            let Some(entries) = streams.get(stream) else {
                continue;
            };
            let start = entries.partition_point(|entry| !entry.id.is_after(*cursor));
            if start < entries.len() {
                batch.insert(stream.clone(), entries[start..].to_vec());
            }
        }
        batch
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(LOG_MAGIC)?;
        file.write_all(&[LOG_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid log magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported log version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }
}

impl LogStore for StreamLog {
    fn append(&self, stream: &StreamName, id: IdRequest, fields: Fields) -> Result<EntryId> {
        let mut streams = self.shared.streams.lock();
        let tail = streams.get(stream).and_then(|e| e.last()).map(|e| e.id);
        let id = Self::assign_id(stream, id, tail)?;

        let entry = Entry { id, fields };
        if let Some(journal) = &self.journal {
            journal.append(stream, &entry)?;
        }
        streams.entry(stream.clone()).or_default().push(entry);
        self.shared.appended.notify_all();

        tracing::trace!(%stream, %id, "appended entry");
        Ok(id)
    }

    fn blocking_read(
        &self,
        cursors: &CursorSet,
        timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<ReadOutcome> {
        let shared = Arc::clone(&self.shared);
        cancel.on_cancel(move || {
            // Taking the lock orders the wakeup after the reader's flag check.
            let _streams = shared.streams.lock();
            shared.appended.notify_all();
        });

        let deadline = Instant::now() + timeout;
        let mut streams = self.shared.streams.lock();
        loop {
            if cancel.is_cancelled() {
                return Ok(ReadOutcome::Interrupted);
            }
            let batch = Self::collect_after(&streams, cursors);
            if !batch.is_empty() {
                return Ok(ReadOutcome::Entries(batch));
            }
            if Instant::now() >= deadline {
                return Ok(ReadOutcome::TimedOut);
            }
            self.shared.appended.wait_until(&mut streams, deadline);
        }
    }

    fn tail_id(&self, stream: &StreamName) -> Result<Option<EntryId>> {
        Ok(self
            .shared
            .streams
            .lock()
            .get(stream)
            .and_then(|entries| entries.last())
            .map(|entry| entry.id))
    }
}

impl Drop for StreamLog {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
