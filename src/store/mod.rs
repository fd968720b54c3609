//! Durable event store.
//!
//! An event is stored once and attached to any number of recipients. Each
//! attachment carries that recipient's [`InboxState`]. A recipient's backlog
//! is every event attached to them, oldest first.

mod file;
mod index;
mod log;
mod memory;

pub use self::file::{CompactionSummary, FileEventStore};
pub use self::log::LogEntry;
pub use self::memory::MemoryEventStore;

use crate::error::Result;
use crate::event::{Event, EventRef, FeedEntry, InboxState};
use crate::types::{ColorTag, EventId, InboxStatus, RecipientId, Timestamp};
use std::path::PathBuf;

/// Store configuration.
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Directory holding the store files.
    pub path: PathBuf,

    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,

    /// fsync the log after this many appends. 1 syncs every commit.
    pub sync_interval: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./feed"),
            create_if_missing: true,
            sync_interval: 1,
        }
    }
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }
}

/// Outcome of [`EventStore::persist`].
#[derive(Clone, Debug, PartialEq)]
pub struct Persisted {
    /// The stored event, with its assigned id.
    pub event: Event,

    /// Inbox state per requested recipient, in request order without
    /// repeats. Recipients already attached keep their existing state.
    pub inbox: Vec<(RecipientId, InboxState)>,
}

impl Persisted {
    pub fn recipients(&self) -> impl Iterator<Item = RecipientId> + '_ {
        self.inbox.iter().map(|(r, _)| *r)
    }

    /// Feed entry as seen by one of the requested recipients.
    pub fn entry_for(&self, recipient: RecipientId) -> Option<FeedEntry> {
        self.inbox
            .iter()
            .find(|(r, _)| *r == recipient)
            .map(|(_, state)| FeedEntry::new(self.event.clone(), *state))
    }
}

/// Storage seam used by the dispatcher.
///
/// Every mutating call is atomic: either all of its effects become visible
/// (and, for durable stores, survive a restart) or none do.
pub trait EventStore: Send + Sync {
    /// Store `event` if new and attach it to each recipient.
    ///
    /// Attaching an event that is already attached is a no-op, so repeated
    /// calls never create duplicate feed entries.
    fn persist(&self, event: EventRef, recipients: &[RecipientId]) -> Result<Persisted>;

    /// Every event attached to `recipient`, ordered by creation time with
    /// ties broken by id. Unknown recipients have an empty backlog.
    fn backlog_for(&self, recipient: RecipientId) -> Result<Vec<FeedEntry>>;

    /// Backlog entries modified strictly after `since`.
    fn modified_since(&self, recipient: RecipientId, since: Timestamp) -> Result<Vec<FeedEntry>>;

    fn event(&self, id: EventId) -> Result<Option<Event>>;

    fn recipients_of(&self, id: EventId) -> Result<Vec<RecipientId>>;

    /// Set the colour tag on an event. Visible to every attached recipient.
    fn set_tag(&self, id: EventId, tag: ColorTag) -> Result<Event>;

    /// Change one recipient's status for an event. Archived is final.
    fn set_status(&self, id: EventId, recipient: RecipientId, status: InboxStatus) -> Result<FeedEntry>;

    fn mark_read(&self, id: EventId, recipient: RecipientId) -> Result<FeedEntry>;

    /// Detach an event from one recipient's feed. The event itself is kept.
    fn remove(&self, id: EventId, recipient: RecipientId) -> Result<()>;
}
