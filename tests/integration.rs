//! End-to-end delivery tests: publish, backlog, replay and live push.

use herald::{
    BoughtSaleItemSnapshot, CardSection, CardSnapshot, ColorTag, ConversationSnapshot,
    DeletePayload, Delivery, Dispatcher, DispatcherConfig, EndReason, EventKind, EventStore,
    ExpiryPayload, FeedError, FileEventStore, GlobalMessagePayload, InterestPayload,
    InterestPurchasedPayload, KeywordCreatedPayload, KeywordSnapshot, MessagePayload,
    MessageSnapshot, NewEvent, PurchasedPayload, RecipientId, SaleItemSnapshot, Session,
    SessionConfig, StaticDirectory, StoreConfig, Timestamp, Transport, UserSummary,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const BUYER: RecipientId = RecipientId(1);
const SELLER: RecipientId = RecipientId(2);
const OTHER: RecipientId = RecipientId(3);

fn test_config(dir: &TempDir) -> StoreConfig {
    StoreConfig {
        path: dir.path().join("feed"),
        create_if_missing: true,
        sync_interval: 1,
    }
}

fn open_dispatcher(dir: &TempDir) -> Dispatcher {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let store = FileEventStore::open_or_create(test_config(dir)).unwrap();
    let directory: StaticDirectory = [BUYER, SELLER, OTHER].into_iter().collect();
    Dispatcher::new(Arc::new(store), Arc::new(directory), DispatcherConfig::default())
}

fn sale_item(id: u64) -> SaleItemSnapshot {
    SaleItemSnapshot {
        id,
        product_name: "Beans".to_string(),
        business_id: 7,
        quantity: 3,
        price: 4.5,
        closes: Timestamp(2_000_000),
    }
}

fn purchase(created: i64, id: u64) -> NewEvent {
    NewEvent::at(
        Timestamp(created),
        PurchasedPayload {
            bought_sale_item: BoughtSaleItemSnapshot {
                id,
                product_name: "Beans".to_string(),
                business_id: 7,
                buyer: Some(BUYER),
                quantity: 3,
                price: 4.5,
                interest_count: 2,
                listed: Timestamp(1_000),
                sold: Timestamp(created),
            },
        },
    )
}

fn interest(created: i64, id: u64) -> NewEvent {
    NewEvent::at(Timestamp(created), InterestPayload::liked(sale_item(id)))
}

fn next(session: &mut Session) -> Delivery {
    session
        .recv_timeout(Duration::from_secs(2))
        .expect("session ended")
        .expect("no delivery")
}

// --- Scenarios ---

#[test]
fn test_backlog_then_live_on_same_channel() {
    let dir = TempDir::new().unwrap();
    let dispatcher = open_dispatcher(&dir);

    // Not connected: only the backlog sees it.
    let sold = dispatcher.notify(&[BUYER], purchase(100, 1)).unwrap();
    let backlog = dispatcher.store().backlog_for(BUYER).unwrap();
    assert_eq!(backlog.len(), 1);
    assert_eq!(backlog[0].kind(), EventKind::Purchased);

    let mut session = dispatcher.open_session(BUYER).unwrap();
    let replayed = next(&mut session);
    assert_eq!(replayed.event_id, sold.id);
    assert_eq!(replayed.kind, EventKind::Purchased);

    let liked = dispatcher.notify(&[BUYER], interest(200, 5)).unwrap();
    let live = next(&mut session);
    assert_eq!(live.event_id, liked.id);
    assert_eq!(live.kind, EventKind::Interest);

    let json: serde_json::Value = serde_json::from_str(&live.payload).unwrap();
    assert_eq!(json["type"], "InterestEvent");
    assert_eq!(json["interested"], true);
    assert_eq!(json["status"], "normal");

    assert_eq!(session.try_recv().unwrap(), None);
}

#[test]
fn test_replay_order_precedes_live() {
    let dir = TempDir::new().unwrap();
    let dispatcher = open_dispatcher(&dir);

    // Committed out of creation order.
    let c = dispatcher.notify(&[SELLER], interest(300, 3)).unwrap();
    let a = dispatcher.notify(&[SELLER], interest(100, 1)).unwrap();
    let b = dispatcher.notify(&[SELLER], interest(200, 2)).unwrap();

    let mut session = dispatcher.open_session(SELLER).unwrap();
    let live = dispatcher.notify(&[SELLER], interest(50, 4)).unwrap();

    let received: Vec<_> = (0..4).map(|_| next(&mut session).event_id).collect();
    assert_eq!(received, vec![a.id, b.id, c.id, live.id]);
}

#[test]
fn test_every_device_receives() {
    let dir = TempDir::new().unwrap();
    let dispatcher = open_dispatcher(&dir);

    let mut phone = dispatcher.open_session(BUYER).unwrap();
    let mut laptop = dispatcher.open_session(BUYER).unwrap();
    assert_eq!(dispatcher.registry().channel_count(BUYER), 2);

    let event = dispatcher.notify(&[BUYER], purchase(10, 1)).unwrap();
    assert_eq!(next(&mut phone).event_id, event.id);
    assert_eq!(next(&mut laptop).event_id, event.id);
}

#[test]
fn test_failed_channel_does_not_block_others() {
    let dir = TempDir::new().unwrap();
    let dispatcher = open_dispatcher(&dir);

    // A consumer that never reads: its queue fills after one live push.
    let tiny = SessionConfig {
        buffer_size: 1,
        ..Default::default()
    };
    let stalled = dispatcher.open_session_with(BUYER, &tiny).unwrap();
    let mut healthy = dispatcher.open_session(SELLER).unwrap();

    dispatcher.notify(&[BUYER, SELLER], purchase(10, 1)).unwrap();
    let second = dispatcher.notify(&[BUYER, SELLER], purchase(20, 2)).unwrap();

    assert_eq!(stalled.end_reason(), Some(EndReason::Overflow));
    assert!(!dispatcher.registry().is_connected(BUYER));

    next(&mut healthy);
    assert_eq!(next(&mut healthy).event_id, second.id);

    // Both events are still in the overflowed recipient's backlog.
    assert_eq!(dispatcher.store().backlog_for(BUYER).unwrap().len(), 2);
}

#[test]
fn test_ended_channel_gets_nothing_more() {
    let dir = TempDir::new().unwrap();
    let dispatcher = open_dispatcher(&dir);

    let mut session = dispatcher.open_session(BUYER).unwrap();
    session.complete();

    dispatcher.notify(&[BUYER], purchase(10, 1)).unwrap();
    assert_eq!(session.try_recv(), Err(EndReason::Completed));
    assert_eq!(dispatcher.registry().total_channels(), 0);
}

#[test]
fn test_idle_expired_session_is_dropped_on_notify() {
    let dir = TempDir::new().unwrap();
    let dispatcher = open_dispatcher(&dir);

    let short = SessionConfig {
        session_timeout: Some(Duration::from_millis(20)),
        ..Default::default()
    };
    // Held but never read from.
    let session = dispatcher.open_session_with(SELLER, &short).unwrap();
    std::thread::sleep(Duration::from_millis(100));

    dispatcher.notify_one(SELLER, purchase(10, 1)).unwrap();

    assert!(!dispatcher.registry().is_connected(SELLER));
    assert_eq!(session.end_reason(), Some(EndReason::TimedOut));
    assert_eq!(session.pending(), 0);
}

#[test]
fn test_renotify_attaches_once() {
    let dir = TempDir::new().unwrap();
    let dispatcher = open_dispatcher(&dir);

    let event = dispatcher.notify(&[BUYER], purchase(10, 1)).unwrap();
    dispatcher.notify(&[BUYER, SELLER], event.id).unwrap();
    dispatcher.notify(&[BUYER], &event).unwrap();

    assert_eq!(dispatcher.store().backlog_for(BUYER).unwrap().len(), 1);
    assert_eq!(dispatcher.store().recipients_of(event.id).unwrap(), vec![BUYER, SELLER]);
}

#[test]
fn test_backlog_survives_restart() {
    let dir = TempDir::new().unwrap();

    let ids: Vec<_> = {
        let dispatcher = open_dispatcher(&dir);
        (1..=3)
            .map(|i| dispatcher.notify(&[OTHER], purchase(i * 10, i as u64)).unwrap().id)
            .collect()
    };

    let dispatcher = open_dispatcher(&dir);
    let mut session = dispatcher.open_session(OTHER).unwrap();
    let replayed: Vec<_> = (0..3).map(|_| next(&mut session).event_id).collect();
    assert_eq!(replayed, ids);
}

#[test]
fn test_feed_since_and_inbox_updates() {
    let dir = TempDir::new().unwrap();
    let dispatcher = open_dispatcher(&dir);

    let first = dispatcher.notify(&[BUYER], purchase(10, 1)).unwrap();
    let second = dispatcher.notify(&[BUYER], purchase(20, 2)).unwrap();
    let checkpoint = dispatcher.feed(BUYER, None).unwrap()[1].state.last_modified;

    std::thread::sleep(Duration::from_millis(2));
    dispatcher.mark_read(first.id, BUYER).unwrap();

    let changed = dispatcher.feed(BUYER, Some(checkpoint)).unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].id(), first.id);
    assert!(changed[0].state.read);

    dispatcher.remove_from_feed(second.id, BUYER).unwrap();
    assert_eq!(dispatcher.feed(BUYER, None).unwrap().len(), 1);

    assert!(matches!(
        dispatcher.feed(RecipientId(99), None),
        Err(FeedError::UnknownRecipient(_))
    ));
}

#[test]
fn test_every_kind_survives_reopen_and_compaction() {
    let dir = TempDir::new().unwrap();

    let user = |id: u64, name: &str| UserSummary {
        id: RecipientId(id),
        first_name: name.to_string(),
        last_name: "Smith".to_string(),
    };
    let card = CardSnapshot {
        id: 11,
        title: "Lawn mower".to_string(),
        section: CardSection::Exchange,
        creator: user(3, "Sam"),
        closes: Timestamp(9_000),
    };
    let bought = |buyer: Option<RecipientId>| BoughtSaleItemSnapshot {
        id: 21,
        product_name: "Apples".to_string(),
        business_id: 4,
        buyer,
        quantity: 2,
        price: 1.25,
        interest_count: 0,
        listed: Timestamp(100),
        sold: Timestamp(200),
    };
    let conversation = ConversationSnapshot {
        id: 31,
        card_id: card.id,
        card_title: card.title.clone(),
        buyer: user(1, "Bo"),
        seller: user(3, "Sam"),
    };
    let message = MessageSnapshot {
        id: 41,
        sender: user(1, "Bo"),
        content: "Still available?".to_string(),
        created: Timestamp(300),
    };

    let events = vec![
        NewEvent::at(Timestamp(1), DeletePayload::from_card(&card)),
        NewEvent::at(Timestamp(2), ExpiryPayload { card: card.clone() }),
        NewEvent::at(Timestamp(3), GlobalMessagePayload::new("Welcome").unwrap()),
        NewEvent::at(Timestamp(4), InterestPayload::unliked(sale_item(5))).with_tag(ColorTag::Red),
        NewEvent::at(
            Timestamp(5),
            InterestPurchasedPayload {
                bought_sale_item: bought(None),
            },
        ),
        NewEvent::at(
            Timestamp(6),
            KeywordCreatedPayload {
                keyword: KeywordSnapshot {
                    id: 51,
                    name: "Organic".to_string(),
                    created: Timestamp(6),
                },
                creator: user(3, "Sam"),
            },
        ),
        NewEvent::at(
            Timestamp(7),
            MessagePayload::for_recipient(RecipientId(3), message, conversation).unwrap(),
        ),
        NewEvent::at(
            Timestamp(8),
            PurchasedPayload {
                bought_sale_item: bought(Some(OTHER)),
            },
        ),
    ];

    let before = {
        let store = FileEventStore::open_or_create(test_config(&dir)).unwrap();
        for event in events {
            store.persist(event.into(), &[OTHER]).unwrap();
        }
        store.backlog_for(OTHER).unwrap()
    };
    let kinds: Vec<_> = before.iter().map(|entry| entry.kind()).collect();
    assert_eq!(kinds, EventKind::ALL.to_vec());

    let store = FileEventStore::open(test_config(&dir)).unwrap();
    assert_eq!(store.backlog_for(OTHER).unwrap(), before);

    store.compact().unwrap();
    drop(store);

    let store = FileEventStore::open(test_config(&dir)).unwrap();
    assert_eq!(store.backlog_for(OTHER).unwrap(), before);
}

// --- Transport ---

struct SseBuffer {
    frames: Vec<String>,
    broken: bool,
}

impl Transport for SseBuffer {
    fn send(&mut self, event_id: herald::EventId, kind: EventKind, payload: &str) -> io::Result<()> {
        if self.broken {
            return Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"));
        }
        self.frames
            .push(format!("id:{}\nevent:{}\ndata:{}\n\n", event_id, kind, payload));
        Ok(())
    }
}

#[test]
fn test_pump_forwards_until_end() {
    let dir = TempDir::new().unwrap();
    let dispatcher = open_dispatcher(&dir);
    dispatcher.notify(&[BUYER], purchase(10, 1)).unwrap();

    let short = SessionConfig {
        session_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    };
    let mut session = dispatcher.open_session_with(BUYER, &short).unwrap();

    let mut transport = SseBuffer {
        frames: Vec::new(),
        broken: false,
    };
    let reason = session.pump(&mut transport);

    assert_eq!(reason, EndReason::TimedOut);
    assert_eq!(transport.frames.len(), 1);
    assert!(transport.frames[0].starts_with("id:1\nevent:PurchasedEvent\ndata:{"));
    assert!(!dispatcher.registry().is_connected(BUYER));
}

#[test]
fn test_pump_transport_failure_ends_channel() {
    let dir = TempDir::new().unwrap();
    let dispatcher = open_dispatcher(&dir);
    dispatcher.notify(&[BUYER], purchase(10, 1)).unwrap();

    let mut session = dispatcher.open_session(BUYER).unwrap();
    let mut transport = SseBuffer {
        frames: Vec::new(),
        broken: true,
    };

    let reason = session.pump(&mut transport);
    assert!(matches!(reason, EndReason::DeliveryFailed(_)));
    assert!(!dispatcher.registry().is_connected(BUYER));

    // Later events still commit.
    dispatcher.notify(&[BUYER], purchase(20, 2)).unwrap();
    assert_eq!(dispatcher.store().backlog_for(BUYER).unwrap().len(), 2);
}
