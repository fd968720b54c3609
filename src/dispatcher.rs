//! Notification dispatcher.
//!
//! The entry point for both sides of delivery:
//!
//! - **publish**: [`Dispatcher::notify`] commits an event to the store, then
//!   pushes it to every open channel of every recipient.
//! - **subscribe**: [`Dispatcher::open_session`] opens a channel that first
//!   replays the recipient's backlog and then carries live pushes.

use crate::channel::{channel, ChannelSender, Delivery, EndReason, Session, SessionConfig};
use crate::directory::RecipientDirectory;
use crate::error::{FeedError, Result};
use crate::event::{Event, EventRef, FeedEntry, GlobalMessagePayload, NewEvent};
use crate::registry::ConnectionRegistry;
use crate::store::EventStore;
use crate::types::{ColorTag, EventId, InboxStatus, RecipientId, Timestamp};
use std::sync::Arc;

/// Dispatcher configuration.
#[derive(Clone, Debug, Default)]
pub struct DispatcherConfig {
    /// Defaults for sessions opened with [`Dispatcher::open_session`].
    pub session: SessionConfig,
}

pub struct Dispatcher {
    store: Arc<dyn EventStore>,
    directory: Arc<dyn RecipientDirectory>,
    registry: Arc<ConnectionRegistry>,
    config: DispatcherConfig,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn EventStore>,
        directory: Arc<dyn RecipientDirectory>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            directory,
            registry: Arc::new(ConnectionRegistry::new()),
            config,
        }
    }

    // --- Subscribe ---

    /// Open a live session for `recipient` with the default session config.
    pub fn open_session(&self, recipient: RecipientId) -> Result<Session> {
        self.open_session_with(recipient, &self.config.session)
    }

    /// Open a live session for `recipient`.
    ///
    /// The session yields the recipient's whole backlog, oldest first, and
    /// then every event pushed to it live.
    ///
    /// Delivery is at-least-once. The channel is registered before the
    /// backlog is read, so an event committed while the session is opening
    /// can show up twice: once in the replay and once live. Clients
    /// de-duplicate by event id. Nothing committed before this call is
    /// missed, and replay always comes before live pushes.
    pub fn open_session_with(&self, recipient: RecipientId, config: &SessionConfig) -> Result<Session> {
        if !self.directory.contains(recipient) {
            return Err(FeedError::UnknownRecipient(recipient));
        }

        let (sender, mut session) = channel(recipient, config);
        let channel_id = sender.id();

        let registry = Arc::downgrade(&self.registry);
        sender.on_end(move |_| {
            if let Some(registry) = registry.upgrade() {
                registry.deregister(recipient, channel_id);
            }
        });
        self.registry.register(recipient, sender)?;

        // On any error below, dropping the session ends and deregisters it.
        let backlog = self.store.backlog_for(recipient).map_err(|e| {
            tracing::error!(recipient = %recipient, error = %e, "Failed to read backlog");
            e
        })?;
        let replay = backlog
            .iter()
            .map(Delivery::from_entry)
            .collect::<Result<Vec<_>>>()?;
        let replayed = replay.len();
        session.enqueue_replay(replay);

        tracing::info!(
            recipient = %recipient,
            channel = %channel_id,
            replayed,
            "Session opened"
        );

        Ok(session)
    }

    // --- Publish ---

    /// Commit `event` for `recipients`, then push it to their open channels.
    ///
    /// Returns once the event is durable. A storage failure is returned and
    /// nothing is pushed. A failed push only ends that channel; it is never
    /// reported here.
    pub fn notify(&self, recipients: &[RecipientId], event: impl Into<EventRef>) -> Result<Event> {
        let persisted = self.store.persist(event.into(), recipients).map_err(|e| {
            tracing::error!(recipients = recipients.len(), error = %e, "Failed to persist event");
            e
        })?;

        tracing::info!(
            event = %persisted.event.id,
            kind = %persisted.event.kind(),
            recipients = persisted.inbox.len(),
            "Event committed"
        );

        for (recipient, state) in &persisted.inbox {
            let channels = self.registry.open_channels_for(*recipient);
            if channels.is_empty() {
                continue;
            }

            let entry = FeedEntry::new(persisted.event.clone(), *state);
            let delivery = match Delivery::from_entry(&entry) {
                Ok(delivery) => delivery,
                Err(e) => {
                    // Already committed; the recipient gets it on next replay.
                    tracing::warn!(
                        event = %entry.id(),
                        recipient = %recipient,
                        error = %e,
                        "Failed to serialize live delivery"
                    );
                    continue;
                }
            };

            self.fan_out(&delivery, &channels);
        }

        Ok(persisted.event)
    }

    pub fn notify_one(&self, recipient: RecipientId, event: impl Into<EventRef>) -> Result<Event> {
        self.notify(&[recipient], event)
    }

    /// Send a global message to every recipient in the directory.
    pub fn broadcast(&self, message: impl Into<String>) -> Result<Event> {
        let payload = GlobalMessagePayload::new(message)?;
        let recipients = self.directory.all();
        self.notify(&recipients, NewEvent::new(payload))
    }

    /// Push one delivery to each channel; returns how many accepted it.
    fn fan_out(&self, delivery: &Delivery, channels: &[ChannelSender]) -> usize {
        let mut delivered = 0;
        for channel in channels {
            if !channel.is_open() {
                continue;
            }
            match channel.push(delivery.clone()) {
                Ok(()) => delivered += 1,
                Err(reason) => {
                    tracing::warn!(
                        event = %delivery.event_id,
                        recipient = %channel.recipient(),
                        channel = %channel.id(),
                        reason = %reason,
                        "Live delivery failed, ending channel"
                    );
                    channel.end(reason);
                }
            }
        }
        delivered
    }

    // --- Inbox ---

    /// The recipient's feed. With `since`, only entries modified after it.
    pub fn feed(&self, recipient: RecipientId, since: Option<Timestamp>) -> Result<Vec<FeedEntry>> {
        if !self.directory.contains(recipient) {
            return Err(FeedError::UnknownRecipient(recipient));
        }
        match since {
            Some(since) => self.store.modified_since(recipient, since),
            None => self.store.backlog_for(recipient),
        }
    }

    pub fn set_tag(&self, id: EventId, tag: ColorTag) -> Result<Event> {
        self.store.set_tag(id, tag)
    }

    pub fn set_status(&self, id: EventId, recipient: RecipientId, status: InboxStatus) -> Result<FeedEntry> {
        self.store.set_status(id, recipient, status)
    }

    pub fn mark_read(&self, id: EventId, recipient: RecipientId) -> Result<FeedEntry> {
        self.store.mark_read(id, recipient)
    }

    pub fn remove_from_feed(&self, id: EventId, recipient: RecipientId) -> Result<()> {
        self.store.remove(id, recipient)
    }

    // --- Lifecycle ---

    /// End every open channel. Returns how many were closed.
    pub fn close_all(&self) -> usize {
        let channels = self.registry.drain();
        let closed = channels
            .iter()
            .filter(|channel| channel.end(EndReason::Shutdown))
            .count();

        tracing::info!(closed, "Closed all sessions");
        closed
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<dyn RecipientDirectory> {
        &self.directory
    }
}
