//! File-backed event store.

use super::index::FeedIndex;
use super::log::{EventLog, LogEntry};
use super::{EventStore, Persisted, StoreConfig};
use crate::error::{FeedError, Result};
use crate::event::{Event, EventRef, FeedEntry};
use crate::types::{ColorTag, EventId, InboxStatus, RecipientId, StoreStats, Timestamp};
use fs2::FileExt;
use parking_lot::RwLock;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;

/// Magic bytes for the store manifest.
const STORE_MAGIC: &[u8; 4] = b"HRS\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

const LOG_FILE: &str = "events.log";

/// Result of [`FileEventStore::compact`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompactionSummary {
    pub frames_before: u64,
    pub frames_after: u64,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl CompactionSummary {
    pub fn bytes_reclaimed(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Durable [`EventStore`] backed by a directory:
///
/// - `MANIFEST`: format magic and version
/// - `LOCK`: held exclusively while the store is open
/// - `events.log`: the commit log, replayed into memory on open
///
/// A call returns only after its log frame is written (and synced, per
/// `sync_interval`). The in-memory index is updated under the same write
/// lock, so readers see either all of a commit or none of it.
pub struct FileEventStore {
    config: StoreConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    log: EventLog,

    index: RwLock<FeedIndex>,
}

impl FileEventStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: StoreConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(FeedError::NotInitialized)
        }
    }

    /// Create a new store.
    pub fn create(config: StoreConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;
        let (log, entries) = EventLog::open(config.path.join(LOG_FILE), config.sync_interval)?;
        let index = FeedIndex::replay(&entries)?;

        tracing::info!(path = %config.path.display(), "Created event store");

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            index: RwLock::new(index),
        })
    }

    /// Open an existing store, replaying its log.
    pub fn open(config: StoreConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;

        let lock_file = Self::acquire_lock(&config.path)?;
        let (log, entries) = EventLog::open(config.path.join(LOG_FILE), config.sync_interval)?;
        let index = FeedIndex::replay(&entries)?;

        tracing::info!(
            path = %config.path.display(),
            frames = entries.len(),
            events = index.event_count(),
            recipients = index.recipient_count(),
            "Opened event store"
        );

        Ok(Self {
            config,
            _lock_file: lock_file,
            log,
            index: RwLock::new(index),
        })
    }

    /// Get store statistics.
    pub fn stats(&self) -> StoreStats {
        let index = self.index.read();
        StoreStats {
            event_count: index.event_count() as u64,
            association_count: index.association_count() as u64,
            recipient_count: index.recipient_count() as u64,
            log_size_bytes: self.log.size(),
        }
    }

    /// Sync all data to disk.
    pub fn sync(&self) -> Result<()> {
        self.log.sync()
    }

    /// Get the store path.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Rewrite the log as one frame per live event.
    ///
    /// Status changes, reads, tag changes and removals collapse into the
    /// events they touched. Writers are blocked for the duration.
    pub fn compact(&self) -> Result<CompactionSummary> {
        let index = self.index.write();

        let frames_before = self.log.frame_count();
        let bytes_before = self.log.size();

        let snapshot = index.snapshot();
        self.log.rewrite(&snapshot)?;

        let summary = CompactionSummary {
            frames_before,
            frames_after: self.log.frame_count(),
            bytes_before,
            bytes_after: self.log.size(),
        };

        tracing::info!(
            path = %self.config.path.display(),
            frames_before = summary.frames_before,
            frames_after = summary.frames_after,
            bytes_reclaimed = summary.bytes_reclaimed(),
            "Compacted event log"
        );

        Ok(summary)
    }

    fn commit(&self, entry: &LogEntry) -> Result<()> {
        self.log.append(entry).map(|_| ())
    }

    // --- Private Helpers ---

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(FeedError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(FeedError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| FeedError::Locked)?;
        Ok(lock_file)
    }
}

impl EventStore for FileEventStore {
    fn persist(&self, event: EventRef, recipients: &[RecipientId]) -> Result<Persisted> {
        self.index
            .write()
            .persist_with(event, recipients, Timestamp::now(), |entry| self.commit(entry))
    }

    fn backlog_for(&self, recipient: RecipientId) -> Result<Vec<FeedEntry>> {
        Ok(self.index.read().backlog(recipient))
    }

    fn modified_since(&self, recipient: RecipientId, since: Timestamp) -> Result<Vec<FeedEntry>> {
        Ok(self.index.read().modified_since(recipient, since))
    }

    fn event(&self, id: EventId) -> Result<Option<Event>> {
        Ok(self.index.read().event(id))
    }

    fn recipients_of(&self, id: EventId) -> Result<Vec<RecipientId>> {
        Ok(self.index.read().recipients_of(id))
    }

    fn set_tag(&self, id: EventId, tag: ColorTag) -> Result<Event> {
        self.index
            .write()
            .set_tag_with(id, tag, Timestamp::now(), |entry| self.commit(entry))
    }

    fn set_status(&self, id: EventId, recipient: RecipientId, status: InboxStatus) -> Result<FeedEntry> {
        self.index
            .write()
            .set_status_with(id, recipient, status, Timestamp::now(), |entry| self.commit(entry))
    }

    fn mark_read(&self, id: EventId, recipient: RecipientId) -> Result<FeedEntry> {
        self.index
            .write()
            .mark_read_with(id, recipient, Timestamp::now(), |entry| self.commit(entry))
    }

    fn remove(&self, id: EventId, recipient: RecipientId) -> Result<()> {
        self.index
            .write()
            .remove_with(id, recipient, |entry| self.commit(entry))
    }
}

impl Drop for FileEventStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
