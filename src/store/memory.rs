//! In-memory event store.

use super::index::FeedIndex;
use super::{EventStore, Persisted};
use crate::error::Result;
use crate::event::{Event, EventRef, FeedEntry};
use crate::types::{ColorTag, EventId, InboxStatus, RecipientId, StoreStats, Timestamp};
use parking_lot::RwLock;

/// Non-durable [`EventStore`] with the same semantics as
/// [`FileEventStore`](super::FileEventStore). Contents are lost on drop.
#[derive(Default)]
pub struct MemoryEventStore {
    index: RwLock<FeedIndex>,
}

fn in_memory(_: &super::LogEntry) -> Result<()> {
    Ok(())
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        let index = self.index.read();
        StoreStats {
            event_count: index.event_count() as u64,
            association_count: index.association_count() as u64,
            recipient_count: index.recipient_count() as u64,
            log_size_bytes: 0,
        }
    }
}

impl EventStore for MemoryEventStore {
    fn persist(&self, event: EventRef, recipients: &[RecipientId]) -> Result<Persisted> {
        self.index
            .write()
            .persist_with(event, recipients, Timestamp::now(), in_memory)
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
            .set_tag_with(id, tag, Timestamp::now(), in_memory)
    }

    fn set_status(&self, id: EventId, recipient: RecipientId, status: InboxStatus) -> Result<FeedEntry> {
        self.index
            .write()
            .set_status_with(id, recipient, status, Timestamp::now(), in_memory)
    }

    fn mark_read(&self, id: EventId, recipient: RecipientId) -> Result<FeedEntry> {
        self.index
            .write()
            .mark_read_with(id, recipient, Timestamp::now(), in_memory)
    }

    fn remove(&self, id: EventId, recipient: RecipientId) -> Result<()> {
        self.index.write().remove_with(id, recipient, in_memory)
    }
}
