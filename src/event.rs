//! Event model: the eight kinds of newsfeed event and their payloads.
//!
//! Payloads are point-in-time snapshots of the entities they mention. They
//! are fixed when the event is constructed and never follow later edits of
//! the card, sale item, keyword or message they were taken from.

use crate::error::{FeedError, Result};
use crate::types::{ColorTag, EventId, InboxStatus, RecipientId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Discriminates the payload shape of an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Delete,
    Expiry,
    GlobalMessage,
    Interest,
    InterestPurchased,
    KeywordCreated,
    Message,
    Purchased,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::Delete,
        EventKind::Expiry,
        EventKind::GlobalMessage,
        EventKind::Interest,
        EventKind::InterestPurchased,
        EventKind::KeywordCreated,
        EventKind::Message,
        EventKind::Purchased,
    ];

    /// Wire discriminator, as found in the `type` field of a feed entry.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Delete => "DeleteEvent",
            EventKind::Expiry => "ExpiryEvent",
            EventKind::GlobalMessage => "GlobalMessageEvent",
            EventKind::Interest => "InterestEvent",
            EventKind::InterestPurchased => "InterestPurchasedEvent",
            EventKind::KeywordCreated => "KeywordCreatedEvent",
            EventKind::Message => "MessageEvent",
            EventKind::Purchased => "PurchasedEvent",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Snapshots ---

/// Public summary of a user.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: RecipientId,
    pub first_name: String,
    pub last_name: String,
}

/// Marketplace section a card was posted in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardSection {
    ForSale,
    Wanted,
    Exchange,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CardSnapshot {
    pub id: u64,
    pub title: String,
    pub section: CardSection,
    pub creator: UserSummary,
    /// When the card closes (or closed).
    pub closes: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SaleItemSnapshot {
    pub id: u64,
    pub product_name: String,
    pub business_id: u64,
    pub quantity: u32,
    pub price: f64,
    pub closes: Timestamp,
}

/// A sale item as it was at the moment it was bought.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoughtSaleItemSnapshot {
    pub id: u64,
    pub product_name: String,
    pub business_id: u64,
    pub buyer: Option<RecipientId>,
    pub quantity: u32,
    pub price: f64,
    /// Number of users who had liked the listing.
    pub interest_count: u32,
    pub listed: Timestamp,
    pub sold: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSnapshot {
    pub id: u64,
    pub name: String,
    pub created: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSnapshot {
    pub id: u64,
    pub sender: UserSummary,
    pub content: String,
    pub created: Timestamp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub id: u64,
    pub card_id: u64,
    pub card_title: String,
    pub buyer: UserSummary,
    /// Creator of the card the conversation is about.
    pub seller: UserSummary,
}

/// Which side of a conversation the notified user is on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantRole {
    Buyer,
    Seller,
}

// --- Payloads ---

/// A marketplace card owned by the recipient was deleted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeletePayload {
    pub section: CardSection,
    pub title: String,
}

impl DeletePayload {
    pub fn from_card(card: &CardSnapshot) -> Self {
        Self {
            section: card.section,
            title: card.title.clone(),
        }
    }
}

/// A marketplace card owned by the recipient is about to expire.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpiryPayload {
    pub card: CardSnapshot,
}

/// Announcement from an administrator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GlobalMessagePayload {
    pub message: String,
}

impl GlobalMessagePayload {
    pub fn new(message: impl Into<String>) -> Result<Self> {
        let message = message.into();
        if message.trim().is_empty() {
            return Err(FeedError::InvalidEvent("global message cannot be empty".into()));
        }
        Ok(Self { message })
    }
}

/// The recipient liked (or unliked) a sale listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterestPayload {
    pub sale_item: SaleItemSnapshot,
    pub interested: bool,
}

impl InterestPayload {
    pub fn liked(sale_item: SaleItemSnapshot) -> Self {
        Self {
            sale_item,
            interested: true,
        }
    }

    pub fn unliked(sale_item: SaleItemSnapshot) -> Self {
        Self {
            sale_item,
            interested: false,
        }
    }
}

/// A listing the recipient liked was bought by someone.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InterestPurchasedPayload {
    pub bought_sale_item: BoughtSaleItemSnapshot,
}

/// A new keyword was created (sent to administrators).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeywordCreatedPayload {
    pub keyword: KeywordSnapshot,
    pub creator: UserSummary,
}

/// A new message arrived in a conversation the recipient takes part in.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message: MessageSnapshot,
    pub conversation: ConversationSnapshot,
    pub participant_type: ParticipantRole,
}

impl MessagePayload {
    /// Build the payload for `recipient`, deriving their role in the
    /// conversation. Only the buyer and the card creator can be notified.
    pub fn for_recipient(
        recipient: RecipientId,
        message: MessageSnapshot,
        conversation: ConversationSnapshot,
    ) -> Result<Self> {
        let participant_type = if conversation.buyer.id == recipient {
            ParticipantRole::Buyer
        } else if conversation.seller.id == recipient {
            ParticipantRole::Seller
        } else {
            return Err(FeedError::InvalidEvent(format!(
                "recipient {} is neither buyer nor seller in conversation {}",
                recipient, conversation.id
            )));
        };

        Ok(Self {
            message,
            conversation,
            participant_type,
        })
    }
}

/// The recipient bought a sale item.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PurchasedPayload {
    pub bought_sale_item: BoughtSaleItemSnapshot,
}

/// Kind-specific content of an event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventPayload {
    #[serde(rename = "DeleteEvent")]
    Delete(DeletePayload),
    #[serde(rename = "ExpiryEvent")]
    Expiry(ExpiryPayload),
    #[serde(rename = "GlobalMessageEvent")]
    GlobalMessage(GlobalMessagePayload),
    #[serde(rename = "InterestEvent")]
    Interest(InterestPayload),
    #[serde(rename = "InterestPurchasedEvent")]
    InterestPurchased(InterestPurchasedPayload),
    #[serde(rename = "KeywordCreatedEvent")]
    KeywordCreated(KeywordCreatedPayload),
    #[serde(rename = "MessageEvent")]
    Message(MessagePayload),
    #[serde(rename = "PurchasedEvent")]
    Purchased(PurchasedPayload),
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Delete(_) => EventKind::Delete,
            EventPayload::Expiry(_) => EventKind::Expiry,
            EventPayload::GlobalMessage(_) => EventKind::GlobalMessage,
            EventPayload::Interest(_) => EventKind::Interest,
            EventPayload::InterestPurchased(_) => EventKind::InterestPurchased,
            EventPayload::KeywordCreated(_) => EventKind::KeywordCreated,
            EventPayload::Message(_) => EventKind::Message,
            EventPayload::Purchased(_) => EventKind::Purchased,
        }
    }
}

macro_rules! payload_from {
    ($($payload:ident => $variant:ident),* $(,)?) => {
        $(
            impl From<$payload> for EventPayload {
                fn from(p: $payload) -> Self {
                    EventPayload::$variant(p)
                }
            }
        )*
    };
}

payload_from! {
    DeletePayload => Delete,
    ExpiryPayload => Expiry,
    GlobalMessagePayload => GlobalMessage,
    InterestPayload => Interest,
    InterestPurchasedPayload => InterestPurchased,
    KeywordCreatedPayload => KeywordCreated,
    MessagePayload => Message,
    PurchasedPayload => Purchased,
}

// --- Events ---

/// An event that has not been persisted yet (no id).
#[derive(Clone, Debug, PartialEq)]
pub struct NewEvent {
    created: Timestamp,
    tag: ColorTag,
    payload: EventPayload,
}

impl NewEvent {
    /// New event created now.
    pub fn new(payload: impl Into<EventPayload>) -> Self {
        Self::at(Timestamp::now(), payload)
    }

    /// New event with an explicit creation time (back-fill, tests).
    pub fn at(created: Timestamp, payload: impl Into<EventPayload>) -> Self {
        Self {
            created,
            tag: ColorTag::None,
            payload: payload.into(),
        }
    }

    pub fn with_tag(mut self, tag: ColorTag) -> Self {
        self.tag = tag;
        self
    }

    pub fn created(&self) -> Timestamp {
        self.created
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn payload(&self) -> &EventPayload {
        &self.payload
    }

    /// Attach the store-assigned id.
    pub(crate) fn into_event(self, id: EventId) -> Event {
        Event {
            id,
            created: self.created,
            tag: self.tag,
            payload: self.payload,
        }
    }
}

/// A persisted event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub created: Timestamp,
    pub tag: ColorTag,
    pub payload: EventPayload,
}

impl Event {
    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }
}

/// What to attach recipients to: a fresh event, or one already stored.
#[derive(Clone, Debug, PartialEq)]
pub enum EventRef {
    New(NewEvent),
    Existing(EventId),
}

impl From<NewEvent> for EventRef {
    fn from(event: NewEvent) -> Self {
        EventRef::New(event)
    }
}

impl From<EventPayload> for EventRef {
    fn from(payload: EventPayload) -> Self {
        EventRef::New(NewEvent::new(payload))
    }
}

impl From<EventId> for EventRef {
    fn from(id: EventId) -> Self {
        EventRef::Existing(id)
    }
}

impl From<&Event> for EventRef {
    fn from(event: &Event) -> Self {
        EventRef::Existing(event.id)
    }
}

/// State of one (event, recipient) association.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxState {
    pub status: InboxStatus,
    pub read: bool,
    /// Attach time, or the last tag/status/read change touching this entry.
    pub last_modified: Timestamp,
}

impl InboxState {
    pub fn attached(at: Timestamp) -> Self {
        Self {
            status: InboxStatus::Normal,
            read: false,
            last_modified: at,
        }
    }
}

/// An event as seen from one recipient's feed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub event: Event,
    pub state: InboxState,
}

/// Flat wire form of a feed entry.
#[derive(Serialize)]
struct WireEntry<'a> {
    id: EventId,
    created: Timestamp,
    tag: ColorTag,
    status: InboxStatus,
    read: bool,
    last_modified: Timestamp,
    #[serde(flatten)]
    payload: &'a EventPayload,
}

impl FeedEntry {
    pub fn new(event: Event, state: InboxState) -> Self {
        Self { event, state }
    }

    pub fn id(&self) -> EventId {
        self.event.id
    }

    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }

    /// Serialize to the JSON object sent to clients.
    pub fn to_json(&self) -> Result<String> {
        let wire = WireEntry {
            id: self.event.id,
            created: self.event.created,
            tag: self.event.tag,
            status: self.state.status,
            read: self.state.read,
            last_modified: self.state.last_modified,
            payload: &self.event.payload,
        };
        Ok(serde_json::to_string(&wire)?)
    }
}
