//! Error types for the notification core.

use crate::types::{ChannelId, EventId, RecipientId};
use thiserror::Error;

/// Main error type for store and dispatcher operations.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    #[error("Event {event} is not in the feed of recipient {recipient}")]
    NotAttached {
        event: EventId,
        recipient: RecipientId,
    },

    #[error("Unknown recipient: {0}")]
    UnknownRecipient(RecipientId),

    #[error("The status of archived event {0} cannot be changed")]
    ArchivedImmutable(EventId),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Channel {channel} belongs to recipient {expected}, not {got}")]
    ChannelMismatch {
        channel: ChannelId,
        expected: RecipientId,
        got: RecipientId,
    },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid store format: {0}")]
    InvalidFormat(String),

    #[error("Store is locked by another process")]
    Locked,

    #[error("Store not initialized")]
    NotInitialized,
}

impl FeedError {
    /// True for failures of the durable store itself (as opposed to
    /// requests that were rejected). Callers may retry these.
    pub fn is_persistence_failure(&self) -> bool {
        matches!(
            self,
            FeedError::Io(_)
                | FeedError::Serialization(_)
                | FeedError::Deserialization(_)
                | FeedError::Corruption(_)
                | FeedError::ChecksumMismatch { .. }
                | FeedError::InvalidFormat(_)
                | FeedError::Locked
                | FeedError::NotInitialized
        )
    }
}

impl From<serde_json::Error> for FeedError {
    fn from(e: serde_json::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for FeedError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        FeedError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for FeedError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        FeedError::Deserialization(e.to_string())
    }
}

/// Result type for store and dispatcher operations.
pub type Result<T> = std::result::Result<T, FeedError>;
