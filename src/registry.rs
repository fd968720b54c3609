//! Connection registry.
//!
//! Tracks the open channels of every connected recipient. A recipient may
//! hold several channels at once (one per device or tab).

use crate::channel::ChannelSender;
use crate::error::{FeedError, Result};
use crate::types::{ChannelId, RecipientId};
use dashmap::DashMap;
use std::collections::HashMap;

/// Open channels keyed by recipient.
///
/// Safe to share between threads. No method holds a map guard while calling
/// back into a channel, so a channel ending from inside a fan-out never
/// deadlocks against its own deregistration.
#[derive(Default)]
pub struct ConnectionRegistry {
    channels: DashMap<RecipientId, HashMap<ChannelId, ChannelSender>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel to the recipient's open set.
    ///
    /// Returns `Ok(false)` without registering if the channel has already
    /// ended. A channel that ends while being registered is removed again.
    pub fn register(&self, recipient: RecipientId, channel: ChannelSender) -> Result<bool> {
        if channel.recipient() != recipient {
            return Err(FeedError::ChannelMismatch {
                channel: channel.id(),
                expected: channel.recipient(),
                got: recipient,
            });
        }
        if channel.is_ended() {
            return Ok(false);
        }

        let id = channel.id();
        self.channels
            .entry(recipient)
            .or_default()
            .insert(id, channel.clone());

        // The channel may have ended (and tried to deregister) before the
        // insert landed.
        if channel.is_ended() {
            self.deregister(recipient, id);
            return Ok(false);
        }

        tracing::debug!(recipient = %recipient, channel = %id, "Registered channel");
        Ok(true)
    }

    /// Remove a channel. Returns whether anything was removed; removing an
    /// absent channel is a no-op.
    pub fn deregister(&self, recipient: RecipientId, channel: ChannelId) -> bool {
        let removed = match self.channels.get_mut(&recipient) {
            Some(mut open) => open.remove(&channel).is_some(),
            None => false,
        };
        self.channels.remove_if(&recipient, |_, open| open.is_empty());

        if removed {
            tracing::debug!(recipient = %recipient, channel = %channel, "Deregistered channel");
        }
        removed
    }

    /// Snapshot of the recipient's open channels.
    ///
    /// The snapshot is detached from the registry: channels may end or be
    /// added after it is taken. Channels past their session deadline are
    /// ended here, which deregisters them.
    pub fn open_channels_for(&self, recipient: RecipientId) -> Vec<ChannelSender> {
        let snapshot: Vec<ChannelSender> = match self.channels.get(&recipient) {
            Some(open) => open.values().cloned().collect(),
            None => return Vec::new(),
        };

        // Expiry runs the deregister callback, so the map guard must be gone.
        snapshot.into_iter().filter(|channel| channel.is_open()).collect()
    }

    pub fn channel_count(&self, recipient: RecipientId) -> usize {
        self.channels
            .get(&recipient)
            .map(|open| open.len())
            .unwrap_or(0)
    }

    pub fn total_channels(&self) -> usize {
        self.channels.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn connected_recipients(&self) -> Vec<RecipientId> {
        let mut recipients: Vec<_> = self.channels.iter().map(|entry| *entry.key()).collect();
        recipients.sort();
        recipients
    }

    pub fn is_connected(&self, recipient: RecipientId) -> bool {
        self.channel_count(recipient) > 0
    }

    /// Remove and return every registered channel.
    pub fn drain(&self) -> Vec<ChannelSender> {
        let recipients: Vec<_> = self.channels.iter().map(|entry| *entry.key()).collect();

        let mut drained = Vec::new();
        for recipient in recipients {
            if let Some((_, open)) = self.channels.remove(&recipient) {
                drained.extend(open.into_values());
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{channel, EndReason, SessionConfig};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_register_and_deregister() {
        let registry = ConnectionRegistry::new();
        let r = RecipientId(1);
        let (phone, _phone_session) = channel(r, &SessionConfig::default());
        let (laptop, _laptop_session) = channel(r, &SessionConfig::default());

        assert!(registry.register(r, phone.clone()).unwrap());
        assert!(registry.register(r, laptop.clone()).unwrap());
        assert_eq!(registry.channel_count(r), 2);
        assert_eq!(registry.open_channels_for(r).len(), 2);

        assert!(registry.deregister(r, phone.id()));
        assert!(!registry.deregister(r, phone.id()), "second removal is a no-op");
        assert_eq!(registry.channel_count(r), 1);

        assert!(registry.deregister(r, laptop.id()));
        assert!(!registry.is_connected(r));
        assert!(registry.connected_recipients().is_empty());
    }

    #[test]
    fn test_register_rejects_wrong_recipient() {
        let registry = ConnectionRegistry::new();
        let (sender, _session) = channel(RecipientId(1), &SessionConfig::default());

        let result = registry.register(RecipientId(2), sender);
        assert!(matches!(result, Err(FeedError::ChannelMismatch { .. })));
        assert_eq!(registry.total_channels(), 0);
    }

    #[test]
    fn test_ended_channel_not_registered() {
        let registry = ConnectionRegistry::new();
        let (sender, session) = channel(RecipientId(1), &SessionConfig::default());
        session.end(EndReason::Completed);

        assert!(!registry.register(RecipientId(1), sender).unwrap());
        assert_eq!(registry.total_channels(), 0);
    }

    #[test]
    fn test_snapshot_skips_ended() {
        let registry = ConnectionRegistry::new();
        let r = RecipientId(1);
        let (a, _a_session) = channel(r, &SessionConfig::default());
        let (b, _b_session) = channel(r, &SessionConfig::default());
        registry.register(r, a.clone()).unwrap();
        registry.register(r, b.clone()).unwrap();

        a.end(EndReason::Overflow);
        let open = registry.open_channels_for(r);
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id(), b.id());
    }

    #[test]
    fn test_snapshot_expires_overdue_channels() {
        let registry = Arc::new(ConnectionRegistry::new());
        let r = RecipientId(1);
        let short = SessionConfig {
            session_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let (sender, _session) = channel(r, &short);

        let weak = Arc::downgrade(&registry);
        let id = sender.id();
        sender.on_end(move |_| {
            if let Some(registry) = weak.upgrade() {
                registry.deregister(r, id);
            }
        });
        registry.register(r, sender.clone()).unwrap();
        assert_eq!(registry.open_channels_for(r).len(), 1);

        thread::sleep(Duration::from_millis(50));
        assert!(registry.open_channels_for(r).is_empty());
        assert!(sender.is_ended());
        assert!(!registry.is_connected(r));
    }

    #[test]
    fn test_drain() {
        let registry = ConnectionRegistry::new();
        let mut sessions = Vec::new();
        for r in 1..=3 {
            let (sender, session) = channel(RecipientId(r), &SessionConfig::default());
            registry.register(RecipientId(r), sender).unwrap();
            sessions.push(session);
        }

        assert_eq!(registry.connected_recipients(), vec![RecipientId(1), RecipientId(2), RecipientId(3)]);
        assert_eq!(registry.drain().len(), 3);
        assert_eq!(registry.total_channels(), 0);
    }
}
