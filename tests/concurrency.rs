//! Concurrent publish, subscribe and registry churn.

use herald::{
    channel, ConnectionRegistry, Dispatcher, DispatcherConfig, EventId, EventStore,
    GlobalMessagePayload, MemoryEventStore, NewEvent, RecipientId, SessionConfig,
    StaticDirectory,
};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

fn announcement(n: usize) -> NewEvent {
    NewEvent::new(GlobalMessagePayload::new(format!("announcement {}", n)).unwrap())
}

fn dispatcher(recipients: u64) -> Arc<Dispatcher> {
    let directory: StaticDirectory = (1..=recipients).map(RecipientId).collect();
    Arc::new(Dispatcher::new(
        Arc::new(MemoryEventStore::new()),
        Arc::new(directory),
        DispatcherConfig::default(),
    ))
}

#[test]
fn test_concurrent_register_deregister_same_recipient() {
    let registry = Arc::new(ConnectionRegistry::new());
    let r = RecipientId(1);
    let threads = 8;
    let per_thread = 200;
    let barrier = Arc::new(Barrier::new(threads));

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let registry = Arc::clone(&registry);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut kept = Vec::new();
                for i in 0..per_thread {
                    let (sender, session) = channel(r, &SessionConfig::default());
                    assert!(registry.register(r, sender.clone()).unwrap());
                    // Keep every fourth channel; remove the rest, some twice.
                    if i % 4 == 0 {
                        kept.push((sender, session));
                    } else {
                        assert!(registry.deregister(r, sender.id()));
                        if t % 2 == 0 {
                            assert!(!registry.deregister(r, sender.id()));
                        }
                    }
                }
                kept
            })
        })
        .collect();

    let mut kept = Vec::new();
    for handle in handles {
        kept.extend(handle.join().unwrap());
    }

    assert_eq!(registry.channel_count(r), threads * per_thread / 4);

    let open: HashSet<_> = registry.open_channels_for(r).iter().map(|c| c.id()).collect();
    let expected: HashSet<_> = kept.iter().map(|(sender, _)| sender.id()).collect();
    assert_eq!(open, expected);
}

#[test]
fn test_concurrent_notify_keeps_backlog_consistent() {
    let dispatcher = dispatcher(4);
    let threads = 4;
    let per_thread = 50;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                (0..per_thread)
                    .map(|i| {
                        // Every event goes to recipient 1 plus the thread's own recipient.
                        let own = RecipientId(t as u64 + 1);
                        dispatcher
                            .notify(&[RecipientId(1), own], announcement(t * 1000 + i))
                            .unwrap()
                            .id
                    })
                    .collect::<Vec<EventId>>()
            })
        })
        .collect();

    let mut all_ids = Vec::new();
    for handle in handles {
        all_ids.extend(handle.join().unwrap());
    }

    let backlog = dispatcher.store().backlog_for(RecipientId(1)).unwrap();
    assert_eq!(backlog.len(), threads * per_thread);

    let ids: HashSet<_> = backlog.iter().map(|e| e.id()).collect();
    assert_eq!(ids.len(), backlog.len(), "no duplicates");
    assert_eq!(ids, all_ids.into_iter().collect::<HashSet<_>>(), "no gaps");

    for pair in backlog.windows(2) {
        let a = (pair[0].event.created, pair[0].id());
        let b = (pair[1].event.created, pair[1].id());
        assert!(a < b, "backlog out of order: {:?} then {:?}", a, b);
    }
}

#[test]
fn test_sessions_opening_during_publish_miss_nothing() {
    let dispatcher = dispatcher(1);
    let r = RecipientId(1);
    let total = 300;

    let publisher = {
        let dispatcher = Arc::clone(&dispatcher);
        thread::spawn(move || {
            for i in 0..total {
                dispatcher.notify(&[r], announcement(i)).unwrap();
            }
        })
    };

    // Open sessions while the publisher runs; each must see every event
    // committed after it opened, with replay first.
    let mut sessions = Vec::new();
    for _ in 0..5 {
        sessions.push(dispatcher.open_session(r).unwrap());
        thread::sleep(Duration::from_millis(1));
    }
    publisher.join().unwrap();

    for mut session in sessions {
        let mut seen = Vec::new();
        while let Ok(Some(delivery)) = session.try_recv() {
            seen.push(delivery.event_id);
        }

        // At-least-once: duplicates allowed, but after de-duplication the
        // stream is a suffix-complete run ending at the last event.
        let mut unique = seen.clone();
        unique.dedup();
        let last = unique.last().copied().unwrap();
        assert_eq!(last, EventId(total as u64));

        let first = unique[0].0;
        let expected: Vec<_> = (1..=total as u64).filter(|id| *id >= first).map(EventId).collect();
        let mut sorted = unique.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted, expected);
    }
}

#[test]
fn test_concurrent_sessions_for_many_recipients() {
    let recipients = 16u64;
    let dispatcher = dispatcher(recipients);

    let handles: Vec<_> = (1..=recipients)
        .map(|r| {
            let dispatcher = Arc::clone(&dispatcher);
            thread::spawn(move || {
                let mut session = dispatcher.open_session(RecipientId(r)).unwrap();
                session
                    .recv_timeout(Duration::from_secs(5))
                    .unwrap()
                    .map(|d| d.event_id)
            })
        })
        .collect();

    // Wait until everyone is connected, then broadcast.
    while dispatcher.registry().total_channels() < recipients as usize {
        thread::sleep(Duration::from_millis(1));
    }
    let event = dispatcher.broadcast("Hello everyone").unwrap();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), Some(event.id));
    }
}
