//! In-memory feed index.
//!
//! Holds every event and every (event, recipient) association. Each
//! recipient's feed is a `BTreeMap` keyed by `(created, id)`, which is the
//! backlog order. All mutation goes through [`FeedIndex::apply`], both when
//! committing live and when replaying the log on open.

use crate::error::{FeedError, Result};
use crate::event::{Event, EventRef, FeedEntry, InboxState};
use crate::store::log::LogEntry;
use crate::store::Persisted;
use crate::types::{ColorTag, EventId, InboxStatus, RecipientId, Timestamp};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// Backlog ordering key.
type FeedKey = (Timestamp, EventId);

#[derive(Default)]
pub struct FeedIndex {
    /// All events by id.
    events: HashMap<EventId, Event>,

    /// Per-recipient feed in backlog order.
    feeds: HashMap<RecipientId, BTreeMap<FeedKey, InboxState>>,

    /// Reverse index: event -> recipients attached to it.
    recipients: HashMap<EventId, BTreeSet<RecipientId>>,

    /// Highest event id handed out so far.
    last_id: u64,
}

impl FeedIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild an index by replaying log entries in order.
    pub fn replay<'a>(entries: impl IntoIterator<Item = &'a LogEntry>) -> Result<Self> {
        let mut index = Self::new();
        for entry in entries {
            index.apply(entry)?;
        }
        Ok(index)
    }

    // --- Commit helpers ---
    //
    // Each helper validates the request, builds the single log entry that
    // describes it, hands that entry to `commit` (which makes it durable or
    // does nothing for the in-memory store), and only then applies it. If
    // `commit` fails nothing is applied.

    /// Attach `recipients` to an event, inserting it if new.
    pub fn persist_with<F>(
        &mut self,
        event: EventRef,
        recipients: &[RecipientId],
        at: Timestamp,
        commit: F,
    ) -> Result<Persisted>
    where
        F: FnOnce(&LogEntry) -> Result<()>,
    {
        let recipients = dedup(recipients);

        let (event_id, created, insert) = match event {
            EventRef::New(new_event) => {
                let id = EventId(self.last_id + 1);
                let event = new_event.into_event(id);
                (id, event.created, Some(event))
            }
            EventRef::Existing(id) => {
                let event = self.events.get(&id).ok_or(FeedError::EventNotFound(id))?;
                (id, event.created, None)
            }
        };

        let missing: Vec<RecipientId> = recipients
            .iter()
            .copied()
            .filter(|r| !self.is_attached(event_id, created, *r))
            .collect();

        if insert.is_some() || !missing.is_empty() {
            let entry = LogEntry::Attach {
                event_id,
                insert,
                recipients: missing,
                at,
            };
            commit(&entry)?;
            self.apply(&entry)?;
        }

        self.persisted(event_id, &recipients)
    }

    pub fn set_tag_with<F>(&mut self, id: EventId, tag: ColorTag, at: Timestamp, commit: F) -> Result<Event>
    where
        F: FnOnce(&LogEntry) -> Result<()>,
    {
        if !self.events.contains_key(&id) {
            return Err(FeedError::EventNotFound(id));
        }

        let entry = LogEntry::Tag { event_id: id, tag, at };
        commit(&entry)?;
        self.apply(&entry)?;

        self.events
            .get(&id)
            .cloned()
            .ok_or(FeedError::EventNotFound(id))
    }

    pub fn set_status_with<F>(
        &mut self,
        id: EventId,
        recipient: RecipientId,
        status: InboxStatus,
        at: Timestamp,
        commit: F,
    ) -> Result<FeedEntry>
    where
        F: FnOnce(&LogEntry) -> Result<()>,
    {
        let current = self.entry(id, recipient)?;
        if current.state.status == InboxStatus::Archived {
            return Err(FeedError::ArchivedImmutable(id));
        }

        let entry = LogEntry::Status {
            event_id: id,
            recipient,
            status,
            at,
        };
        commit(&entry)?;
        self.apply(&entry)?;

        self.entry(id, recipient)
    }

    pub fn mark_read_with<F>(
        &mut self,
        id: EventId,
        recipient: RecipientId,
        at: Timestamp,
        commit: F,
    ) -> Result<FeedEntry>
    where
        F: FnOnce(&LogEntry) -> Result<()>,
    {
        let current = self.entry(id, recipient)?;
        if current.state.read {
            return Ok(current);
        }

        let entry = LogEntry::Read {
            event_id: id,
            recipient,
            at,
        };
        commit(&entry)?;
        self.apply(&entry)?;

        self.entry(id, recipient)
    }

    pub fn remove_with<F>(&mut self, id: EventId, recipient: RecipientId, commit: F) -> Result<()>
    where
        F: FnOnce(&LogEntry) -> Result<()>,
    {
        self.entry(id, recipient)?;

        let entry = LogEntry::Remove {
            event_id: id,
            recipient,
        };
        commit(&entry)?;
        self.apply(&entry)
    }

    // --- Mutation ---

    /// Apply one committed entry.
    pub fn apply(&mut self, entry: &LogEntry) -> Result<()> {
        match entry {
            LogEntry::Attach {
                event_id,
                insert,
                recipients,
                at,
            } => {
                if let Some(event) = insert {
                    self.insert_event(event.clone());
                }
                let created = self
                    .events
                    .get(event_id)
                    .map(|e| e.created)
                    .ok_or_else(|| {
                        FeedError::Corruption(format!("attach to unknown event {}", event_id))
                    })?;

                for recipient in recipients {
                    self.feeds
                        .entry(*recipient)
                        .or_default()
                        .entry((created, *event_id))
                        .or_insert_with(|| InboxState::attached(*at));
                    self.recipients
                        .entry(*event_id)
                        .or_default()
                        .insert(*recipient);
                }
            }
            LogEntry::Tag { event_id, tag, at } => {
                let event = self.events.get_mut(event_id).ok_or_else(|| {
                    FeedError::Corruption(format!("tag on unknown event {}", event_id))
                })?;
                event.tag = *tag;
                let key = (event.created, *event_id);

                if let Some(attached) = self.recipients.get(event_id) {
                    for recipient in attached {
                        if let Some(state) = self
                            .feeds
                            .get_mut(recipient)
                            .and_then(|feed| feed.get_mut(&key))
                        {
                            state.last_modified = *at;
                        }
                    }
                }
            }
            LogEntry::Status {
                event_id,
                recipient,
                status,
                at,
            } => {
                let state = self.state_mut(*event_id, *recipient)?;
                state.status = *status;
                state.last_modified = *at;
            }
            LogEntry::Read {
                event_id,
                recipient,
                at,
            } => {
                let state = self.state_mut(*event_id, *recipient)?;
                state.read = true;
                state.last_modified = *at;
            }
            LogEntry::Remove {
                event_id,
                recipient,
            } => {
                if let Some(created) = self.events.get(event_id).map(|e| e.created) {
                    if let Some(feed) = self.feeds.get_mut(recipient) {
                        feed.remove(&(created, *event_id));
                        if feed.is_empty() {
                            self.feeds.remove(recipient);
                        }
                    }
                }
                if let Some(attached) = self.recipients.get_mut(event_id) {
                    attached.remove(recipient);
                    if attached.is_empty() {
                        self.recipients.remove(event_id);
                    }
                }
            }
            LogEntry::Restore { event, inbox } => {
                let key = (event.created, event.id);
                self.insert_event(event.clone());
                for (recipient, state) in inbox {
                    self.feeds.entry(*recipient).or_default().insert(key, *state);
                    self.recipients.entry(event.id).or_default().insert(*recipient);
                }
            }
        }
        Ok(())
    }

    fn insert_event(&mut self, event: Event) {
        self.last_id = self.last_id.max(event.id.0);
        self.events.insert(event.id, event);
    }

    fn state_mut(&mut self, id: EventId, recipient: RecipientId) -> Result<&mut InboxState> {
        let created = self
            .events
            .get(&id)
            .map(|e| e.created)
            .ok_or(FeedError::EventNotFound(id))?;

        self.feeds
            .get_mut(&recipient)
            .and_then(|feed| feed.get_mut(&(created, id)))
            .ok_or(FeedError::NotAttached {
                event: id,
                recipient,
            })
    }

    // --- Queries ---

    fn is_attached(&self, id: EventId, created: Timestamp, recipient: RecipientId) -> bool {
        self.feeds
            .get(&recipient)
            .map(|feed| feed.contains_key(&(created, id)))
            .unwrap_or(false)
    }

    /// Result of a persist call for the given recipients.
    pub fn persisted(&self, id: EventId, recipients: &[RecipientId]) -> Result<Persisted> {
        let event = self
            .events
            .get(&id)
            .cloned()
            .ok_or(FeedError::EventNotFound(id))?;
        let key = (event.created, id);

        let inbox = recipients
            .iter()
            .filter_map(|r| {
                self.feeds
                    .get(r)
                    .and_then(|feed| feed.get(&key))
                    .map(|state| (*r, *state))
            })
            .collect();

        Ok(Persisted { event, inbox })
    }

    /// One recipient's view of one event.
    pub fn entry(&self, id: EventId, recipient: RecipientId) -> Result<FeedEntry> {
        let event = self.events.get(&id).ok_or(FeedError::EventNotFound(id))?;
        let state = self
            .feeds
            .get(&recipient)
            .and_then(|feed| feed.get(&(event.created, id)))
            .ok_or(FeedError::NotAttached {
                event: id,
                recipient,
            })?;
        Ok(FeedEntry::new(event.clone(), *state))
    }

    /// The recipient's feed, oldest first (ties broken by id).
    pub fn backlog(&self, recipient: RecipientId) -> Vec<FeedEntry> {
        self.backlog_filtered(recipient, |_| true)
    }

    /// Entries whose `last_modified` is strictly after `since`, in backlog order.
    pub fn modified_since(&self, recipient: RecipientId, since: Timestamp) -> Vec<FeedEntry> {
        self.backlog_filtered(recipient, |state| state.last_modified > since)
    }

    fn backlog_filtered<P>(&self, recipient: RecipientId, keep: P) -> Vec<FeedEntry>
    where
        P: Fn(&InboxState) -> bool,
    {
        let Some(feed) = self.feeds.get(&recipient) else {
            return Vec::new();
        };

        feed.iter()
            .filter(|(_, state)| keep(state))
            .filter_map(|((_, id), state)| {
                self.events
                    .get(id)
                    .map(|event| FeedEntry::new(event.clone(), *state))
            })
            .collect()
    }

    pub fn event(&self, id: EventId) -> Option<Event> {
        self.events.get(&id).cloned()
    }

    pub fn recipients_of(&self, id: EventId) -> Vec<RecipientId> {
        self.recipients
            .get(&id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Current state as one `Restore` entry per event, in id order.
    pub fn snapshot(&self) -> Vec<LogEntry> {
        let mut ids: Vec<_> = self.events.keys().copied().collect();
        ids.sort();

        ids.into_iter()
            .filter_map(|id| {
                let event = self.events.get(&id)?.clone();
                let key = (event.created, id);
                let inbox = self
                    .recipients_of(id)
                    .into_iter()
                    .filter_map(|r| {
                        self.feeds
                            .get(&r)
                            .and_then(|feed| feed.get(&key))
                            .map(|state| (r, *state))
                    })
                    .collect();
                Some(LogEntry::Restore { event, inbox })
            })
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    pub fn association_count(&self) -> usize {
        self.feeds.values().map(|feed| feed.len()).sum()
    }

    pub fn recipient_count(&self) -> usize {
        self.feeds.len()
    }
}

/// Drop repeated recipients, keeping first-seen order.
fn dedup(recipients: &[RecipientId]) -> Vec<RecipientId> {
    let mut seen = HashSet::with_capacity(recipients.len());
    recipients
        .iter()
        .copied()
        .filter(|r| seen.insert(*r))
        .collect()
}
