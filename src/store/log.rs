//! Append-only commit log.
//!
//! Every mutating store call is committed as exactly one frame:
//!
//! ```text
//! magic "HRL\0" | version u8 | body_len u32 LE | body | crc32(body) u32 LE
//! ```
//!
//! The body is a MessagePack-encoded [`LogEntry`]. A frame is either fully
//! present with a matching checksum or it did not happen.

use crate::error::{FeedError, Result};
use crate::event::{Event, InboxState};
use crate::types::{ColorTag, EventId, InboxStatus, RecipientId, Timestamp};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes opening every frame.
const LOG_MAGIC: &[u8; 4] = b"HRL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

/// magic + version + body length
const FRAME_HEADER_SIZE: usize = 4 + 1 + 4;

/// Trailing checksum.
const FRAME_TRAILER_SIZE: usize = 4;

/// Sanity bound on a single frame body.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// One committed change to the feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    /// Attach recipients to an event, inserting the event if `insert` is set.
    Attach {
        event_id: EventId,
        insert: Option<Event>,
        recipients: Vec<RecipientId>,
        at: Timestamp,
    },
    Tag {
        event_id: EventId,
        tag: ColorTag,
        at: Timestamp,
    },
    Status {
        event_id: EventId,
        recipient: RecipientId,
        status: InboxStatus,
        at: Timestamp,
    },
    Read {
        event_id: EventId,
        recipient: RecipientId,
        at: Timestamp,
    },
    Remove {
        event_id: EventId,
        recipient: RecipientId,
    },
    /// Full state of one event, written by compaction.
    Restore {
        event: Event,
        inbox: Vec<(RecipientId, InboxState)>,
    },
}

/// Append-only log file.
pub struct EventLog {
    /// Path to the log file.
    path: PathBuf,

    /// Log file handle.
    file: Mutex<File>,

    /// Length of the valid prefix of the file.
    file_size: RwLock<u64>,

    /// Number of frames in the file.
    frame_count: RwLock<u64>,

    /// Number of writes since last sync.
    writes_since_sync: Mutex<u64>,

    /// Sync every N writes.
    sync_interval: u64,
}

impl EventLog {
    /// Open or create a log, returning every committed entry in order.
    ///
    /// A torn final frame (from a crash mid-write) is cut off.
    pub fn open(path: impl AsRef<Path>, sync_interval: u64) -> Result<(Self, Vec<LogEntry>)> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)?;

        let (entries, valid_len) = decode_frames(&bytes)?;
        if valid_len < bytes.len() {
            tracing::warn!(
                path = %path.display(),
                valid_len,
                discarded = bytes.len() - valid_len,
                "Truncating torn tail of event log"
            );
            file.set_len(valid_len as u64)?;
            file.sync_all()?;
        }

        let log = Self {
            path,
            file: Mutex::new(file),
            file_size: RwLock::new(valid_len as u64),
            frame_count: RwLock::new(entries.len() as u64),
            writes_since_sync: Mutex::new(0),
            sync_interval: if sync_interval == 0 { 1 } else { sync_interval },
        };

        Ok((log, entries))
    }

    /// Append one entry. Returns the offset of its frame.
    ///
    /// On error the log is left exactly as it was: the frame is cut off
    /// again, so a failed append never reappears on reopen.
    pub fn append(&self, entry: &LogEntry) -> Result<u64> {
        self.append_with(entry, File::sync_all)
    }

    fn append_with<S>(&self, entry: &LogEntry, sync: S) -> Result<u64>
    where
        S: FnOnce(&File) -> io::Result<()>,
    {
        let frame = encode_frame(entry)?;

        let mut file = self.file.lock();
        let offset = *self.file_size.read();
        file.seek(SeekFrom::Start(offset))?;

        if let Err(e) = file.write_all(&frame) {
            // Leave no partial frame behind for the next append to land after.
            let _ = file.set_len(offset);
            return Err(e.into());
        }

        let mut writes = self.writes_since_sync.lock();
        if *writes + 1 >= self.sync_interval {
            if let Err(e) = sync(&*file) {
                tracing::error!(
                    path = %self.path.display(),
                    offset,
                    error = %e,
                    "Log sync failed, rolling back frame"
                );
                let _ = file.set_len(offset);
                return Err(e.into());
            }
            *writes = 0;
        } else {
            *writes += 1;
        }

        *self.file_size.write() = offset + frame.len() as u64;
        *self.frame_count.write() += 1;

        Ok(offset)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_all()?;
        *self.writes_since_sync.lock() = 0;
        Ok(())
    }

    /// Replace the whole log with `entries`.
    ///
    /// The new log is written to a side file and renamed over the old one,
    /// so a crash leaves either the old or the new log in place.
    pub fn rewrite(&self, entries: &[LogEntry]) -> Result<()> {
        let tmp_path = self.path.with_extension("log.compact");

        // The handle is opened on the side file so it follows the rename.
        let mut tmp = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        let mut written = 0u64;
        let result = entries.iter().try_for_each(|entry| {
            let frame = encode_frame(entry)?;
            tmp.write_all(&frame)?;
            written += frame.len() as u64;
            Ok::<_, FeedError>(())
        });
        if let Err(e) = result.and_then(|_| tmp.sync_all().map_err(FeedError::from)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e);
        }

        let mut file = self.file.lock();
        if let Err(e) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        *file = tmp;

        *self.file_size.write() = written;
        *self.frame_count.write() = entries.len() as u64;
        *self.writes_since_sync.lock() = 0;

        Ok(())
    }

    /// Current size of the log in bytes.
    pub fn size(&self) -> u64 {
        *self.file_size.read()
    }

    /// Number of frames in the log.
    pub fn frame_count(&self) -> u64 {
        *self.frame_count.read()
    }

}

fn encode_frame(entry: &LogEntry) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec_named(entry)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(FeedError::Serialization(format!(
            "log entry of {} bytes exceeds frame limit",
            body.len()
        )));
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len() + FRAME_TRAILER_SIZE);
    frame.extend_from_slice(LOG_MAGIC);
    frame.push(LOG_VERSION);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(frame)
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

/// Decode frames from the start of `bytes`.
///
/// Returns the entries and the length of the valid prefix. Anything after
/// the valid prefix is a torn write.
fn decode_frames(bytes: &[u8]) -> Result<(Vec<LogEntry>, usize)> {
    let mut entries = Vec::new();
    let mut offset = 0usize;

    while offset < bytes.len() {
        let rest = &bytes[offset..];
        if rest.len() < FRAME_HEADER_SIZE {
            break;
        }

        if &rest[0..4] != LOG_MAGIC {
            return Err(FeedError::InvalidFormat(format!(
                "Invalid frame magic at offset {}",
                offset
            )));
        }

        if rest[4] != LOG_VERSION {
            return Err(FeedError::InvalidFormat(format!(
                "Unsupported log version: {}",
                rest[4]
            )));
        }

        let body_len = read_u32(&rest[5..9]) as usize;
        if body_len > MAX_FRAME_BYTES {
            return Err(FeedError::Corruption(format!(
                "Frame at offset {} claims {} bytes",
                offset, body_len
            )));
        }

        let frame_len = FRAME_HEADER_SIZE + body_len + FRAME_TRAILER_SIZE;
        if rest.len() < frame_len {
            break;
        }

        let body = &rest[FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + body_len];
        let stored = read_u32(&rest[FRAME_HEADER_SIZE + body_len..frame_len]);
        let computed = crc32fast::hash(body);

        if stored != computed {
            if offset + frame_len == bytes.len() {
                break;
            }
            return Err(FeedError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        entries.push(rmp_serde::from_slice(body)?);
        offset += frame_len;
    }

    Ok((entries, offset))
}
