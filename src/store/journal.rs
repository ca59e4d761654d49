//! On-disk journal of appended entries.
//!
//! Layout: a 5-byte header (magic + version) followed by frames of
//! `len: u32 | MessagePack(JournalRecord) | crc32: u32`, little endian.
//! Replaying the frames in order rebuilds every stream.

use crate::error::{Result, StoreError};
use crate::types::{Entry, StreamName};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"SPJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

const HEADER_LEN: u64 = 5;

/// Length prefix plus trailing checksum.
const FRAME_OVERHEAD: u64 = 8;

/// Frames larger than this are treated as corruption.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// One appended entry as written to disk.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub stream: StreamName,
    pub entry: Entry,
}

/// Result of reading one frame during replay.
enum Frame {
    Record(JournalRecord, u64),
    End,
    /// The file ends partway through a frame.
    Torn,
    /// A complete frame whose checksum does not match.
    BadChecksum { expected: u32, got: u32, len: u64 },
}

/// Where frames are written.
trait JournalSink: Send {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()>;
    fn sync(&mut self) -> io::Result<()>;
    /// Drop everything past `len` bytes.
    fn truncate(&mut self, len: u64) -> io::Result<()>;
}

/// Opened in append mode, so writes after a truncate land at the new end.
impl JournalSink for File {
    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        self.write_all(frame)
    }

    fn sync(&mut self) -> io::Result<()> {
        self.sync_all()
    }

    fn truncate(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

struct Writer {
    sink: Box<dyn JournalSink>,
    /// File length through the last frame that was reported written.
    committed: u64,
    writes_since_sync: u64,
    /// A failed frame could not be rolled back; nothing more is written.
    poisoned: bool,
}

impl Writer {
    fn write(&mut self, frame: &[u8], sync_interval: u64) -> io::Result<()> {
        self.sink.write_frame(frame)?;
        self.writes_since_sync += 1;
        if self.writes_since_sync >= sync_interval {
            self.sink.sync()?;
            self.writes_since_sync = 0;
        }
        self.committed += frame.len() as u64;
        Ok(())
    }

    /// Cut the file back to the last committed frame.
    fn roll_back(&mut self, path: &Path) {
        match self.sink.truncate(self.committed) {
            Ok(()) => tracing::warn!(
                path = %path.display(),
                offset = self.committed,
                "rolled back failed journal write"
            ),
            Err(err) => {
                self.poisoned = true;
                tracing::error!(
                    path = %path.display(),
                    error = %err,
                    "could not roll back failed journal write; journal disabled"
                );
            }
        }
    }
}

/// Append-only journal file.
///
/// A frame is either fully written or rolled back: when a write or sync
/// fails, the file is truncated to the end of the previous frame before the
/// error is returned, so a rejected append never reappears on replay.
pub struct Journal {
    path: PathBuf,
    writer: Mutex<Writer>,
    /// Sync every N writes.
    sync_interval: u64,
}

impl Journal {
    /// Open or create a journal, returning the records it already holds.
    ///
    /// A frame torn by a crash at the end of the file is truncated away. A
    /// bad frame anywhere else is an error.
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<(Self, Vec<JournalRecord>)> {
        let path = path.as_ref().to_path_buf();

        let records = if path.exists() && std::fs::metadata(&path)?.len() > 0 {
            Self::replay(&path)?
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(JOURNAL_MAGIC)?;
            file.write_all(&[JOURNAL_VERSION])?;
            file.sync_all()?;
            Vec::new()
        };

        let file = OpenOptions::new().append(true).open(&path)?;
        let committed = file.metadata()?.len();

        Ok((
            Self::with_sink(path, Box::new(file), committed, sync_interval),
            records,
        ))
    }

    fn with_sink(
        path: PathBuf,
        sink: Box<dyn JournalSink>,
        committed: u64,
        sync_interval: u64,
    ) -> Self {
        Self {
            path,
            writer: Mutex::new(Writer {
                sink,
                committed,
                writes_since_sync: 0,
                poisoned: false,
            }),
            sync_interval: sync_interval.max(1),
        }
    }

    /// Write one record as a single frame.
    ///
    /// The frame is fsynced every `sync_interval` calls.
    pub fn append(&self, stream: &StreamName, entry: &Entry) -> Result<()> {
        let record = JournalRecord {
            stream: stream.clone(),
            entry: entry.clone(),
        };
        let frame = encode_frame(&record)?;

        let mut writer = self.writer.lock();
        if writer.poisoned {
            return Err(StoreError::Io(io::Error::other(
                "journal disabled after a failed rollback",
            )));
        }
        if let Err(err) = writer.write(&frame, self.sync_interval) {
            writer.roll_back(&self.path);
            return Err(err.into());
        }
        Ok(())
    }

    /// Force pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        writer.sink.sync()?;
        writer.writes_since_sync = 0;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn replay(path: &Path) -> Result<Vec<JournalRecord>> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid journal magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }

        let mut records = Vec::new();
        let mut offset = HEADER_LEN;
        loop {
            match Self::read_frame(&mut reader, file_len - offset)? {
                Frame::Record(record, len) => {
                    records.push(record);
                    offset += len;
                }
                Frame::End => break,
                Frame::Torn => {
                    Self::truncate_tail(path, offset, file_len)?;
                    break;
                }
                Frame::BadChecksum { expected, got, len } => {
                    if offset + len < file_len {
                        return Err(StoreError::ChecksumMismatch { expected, got });
                    }
                    Self::truncate_tail(path, offset, file_len)?;
                    break;
                }
            }
        }

        Ok(records)
    }

    fn truncate_tail(path: &Path, offset: u64, file_len: u64) -> Result<()> {
        tracing::warn!(
            path = %path.display(),
            offset,
            dropped_bytes = file_len - offset,
            "truncating torn journal tail"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(offset)?;
        file.sync_all()?;
        Ok(())
    }

    /// Read the frame starting `remaining` bytes before the end of the file.
    fn read_frame(reader: &mut impl Read, remaining: u64) -> Result<Frame> {
        let mut len_bytes = [0u8; 4];
        match fill(reader, &mut len_bytes)? {
            0 => return Ok(Frame::End),
            4 => {}
            _ => return Ok(Frame::Torn),
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        let frame_len = len as u64 + FRAME_OVERHEAD;
        // A length running past the end is a torn prefix, whatever its value.
        if frame_len > remaining {
            return Ok(Frame::Torn);
        }
        if len > MAX_FRAME_LEN {
            return Err(StoreError::Corruption(format!(
                "journal frame of {len} bytes"
            )));
        }

        let mut encoded = vec![0u8; len];
        if fill(reader, &mut encoded)? < len {
            return Ok(Frame::Torn);
        }

        let mut checksum_bytes = [0u8; 4];
        if fill(reader, &mut checksum_bytes)? < 4 {
            return Ok(Frame::Torn);
        }

        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&encoded);
        if stored_checksum != computed_checksum {
            return Ok(Frame::BadChecksum {
                expected: stored_checksum,
                got: computed_checksum,
                len: frame_len,
            });
        }

        Ok(Frame::Record(rmp_serde::from_slice(&encoded)?, frame_len))
    }
}

fn encode_frame(record: &JournalRecord) -> Result<Vec<u8>> {
    let encoded = rmp_serde::to_vec(record)?;
    let mut frame = Vec::with_capacity(encoded.len() + FRAME_OVERHEAD as usize);
    frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    frame.extend_from_slice(&encoded);
    frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
    Ok(frame)
}

/// Read until `buf` is full or the reader is exhausted; returns bytes read.
fn fill(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}
