//! Recipient directory.
//!
//! The dispatcher asks the directory whether a recipient exists before it
//! opens a session, and for the full audience of a broadcast.

use crate::types::RecipientId;
use parking_lot::RwLock;
use std::collections::BTreeSet;

/// Lookup of known recipients.
pub trait RecipientDirectory: Send + Sync {
    fn contains(&self, recipient: RecipientId) -> bool;

    /// Every known recipient.
    fn all(&self) -> Vec<RecipientId>;
}

/// Set-backed directory.
#[derive(Default)]
pub struct StaticDirectory {
    recipients: RwLock<BTreeSet<RecipientId>>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the recipient was already present.
    pub fn insert(&self, recipient: RecipientId) -> bool {
        self.recipients.write().insert(recipient)
    }

    pub fn remove(&self, recipient: RecipientId) -> bool {
        self.recipients.write().remove(&recipient)
    }

    pub fn len(&self) -> usize {
        self.recipients.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.recipients.read().is_empty()
    }
}

impl FromIterator<RecipientId> for StaticDirectory {
    fn from_iter<I: IntoIterator<Item = RecipientId>>(iter: I) -> Self {
        Self {
            recipients: RwLock::new(iter.into_iter().collect()),
        }
    }
}

impl RecipientDirectory for StaticDirectory {
    fn contains(&self, recipient: RecipientId) -> bool {
        self.recipients.read().contains(&recipient)
    }

    fn all(&self) -> Vec<RecipientId> {
        self.recipients.read().iter().copied().collect()
    }
}
