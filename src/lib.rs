//! # Herald
//!
//! Durable per-recipient event feeds with live delivery to open sessions.
//!
//! ## Core Concepts
//!
//! - **Events**: Immutable marketplace notifications (a sale, interest, a new
//!   keyword, a message, a global announcement) attached to many recipients
//! - **Backlog**: Every event attached to a recipient, oldest first, kept in
//!   a durable commit log
//! - **Sessions**: Live channels that replay the backlog and then receive new
//!   events as they are committed
//! - **Registry**: The open channels of every connected recipient
//!
//! ## Example
//!
//! ```ignore
//! use herald::{Dispatcher, DispatcherConfig, FileEventStore, StoreConfig, StaticDirectory};
//!
//! let store = FileEventStore::open_or_create(StoreConfig::new("./feed"))?;
//! let directory: StaticDirectory = [RecipientId(1), RecipientId(2)].into_iter().collect();
//! let dispatcher = Dispatcher::new(Arc::new(store), Arc::new(directory), DispatcherConfig::default());
//!
//! // Client side: replay, then live
//! let mut session = dispatcher.open_session(RecipientId(1))?;
//!
//! // Producer side
//! dispatcher.notify(&[RecipientId(1)], NewEvent::new(GlobalMessagePayload::new("Hello")?))?;
//!
//! let delivery = session.recv()?;
//! ```

pub mod channel;
pub mod directory;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod registry;
pub mod store;
pub mod types;

// Re-exports
pub use channel::{channel, ChannelSender, Delivery, EndReason, Session, SessionConfig, Transport};
pub use directory::{RecipientDirectory, StaticDirectory};
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{FeedError, Result};
pub use event::*;
pub use registry::ConnectionRegistry;
pub use store::{
    CompactionSummary, EventStore, FileEventStore, LogEntry, MemoryEventStore, Persisted,
    StoreConfig,
};
pub use types::*;
