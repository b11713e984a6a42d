mod common;

use std::sync::Arc;

use bytes::Bytes;

use rjms::broker::{Broker, BrokerCore};
use rjms::context::ServerContext;
use rjms::persist::{MemoryPersistence, PersistenceStore};
use rjms::queue::Queue;
use rjms::store::{FixedMemory, Tier};
use rjms::types::{ConnectionId, DestinationConfig, Message, ReceiveMode, SubscriptionSpec};
use rjms::BrokerError;

use common::{connect, context, init_log};

#[tokio::test]
async fn evicted_bodies_reload_from_persistence() {
    init_log();
    let probe = Arc::new(FixedMemory::new(0));
    let broker = BrokerCore::new(context(probe.clone()).await);
    broker.start().await.unwrap();
    let (_t, _rx) = connect(&broker, "c1", None).await;
    let c1: ConnectionId = "c1".into();
    broker.create_destination("q".into(), DestinationConfig::queue()).await.unwrap();

    for i in 0..5 {
        broker.add_message(&c1, Message::new("q", format!("m{i}")), None).await.unwrap();
    }
    let store = broker.context().store.clone();
    assert_eq!(store.hard_len(), 5);

    probe.set(u64::MAX);
    assert_eq!(store.validate_tier_depth().await, 3);
    assert_eq!(store.hard_len(), 2);
    assert_eq!(store.reclaim(usize::MAX).await, 3);
    assert_eq!(store.soft_len(), 0);
    assert_eq!(store.hard_len(), 2);
    assert_eq!(broker.context().persistence.count().await, 3);

    broker.subscribe(&c1, SubscriptionSpec::new("s", "q").mode(ReceiveMode::Sync)).await.unwrap();
    for i in 0..5 {
        let d = broker.receive(&c1, &"s".into(), -1).await.unwrap().unwrap();
        assert_eq!(d.message.body, Bytes::from(format!("m{i}")));
    }
}

#[tokio::test]
async fn tier_validation_keeps_two_hard_entries() {
    init_log();
    let probe = Arc::new(FixedMemory::new(u64::MAX));
    let scx = context(probe).await;
    let store = scx.store.clone();

    let mut handles = Vec::new();
    for i in 0..2 {
        handles.push(store.add(Message::new("q", format!("{i}")), &"q".into(), false, None).await.unwrap());
    }
    assert_eq!(store.validate_tier_depth().await, 0);
    assert!(handles.iter().all(|h| h.tier() == Tier::Hard));

    handles.push(store.add(Message::new("q", "2"), &"q".into(), false, None).await.unwrap());
    assert_eq!(store.validate_tier_depth().await, 1);
    assert_eq!(handles[0].tier(), Tier::Soft);
    assert_eq!(store.hard_len(), 2);

    assert!(!store.soften(&handles[0]).await.unwrap());
    assert_eq!(store.soft_len(), 1);
}

#[tokio::test]
async fn removed_handle_faults_fatally() {
    init_log();
    let scx = context(Arc::new(FixedMemory::new(0))).await;
    let store = scx.store.clone();
    let handle = store.add(Message::new("q", "x"), &"q".into(), false, None).await.unwrap();

    assert!(store.remove(&handle).await.unwrap());
    assert!(!store.remove(&handle).await.unwrap());
    for err in [store.get(&handle).await.err(), store.soften(&handle).await.err()] {
        let err = err.expect("removed handle must fault");
        assert!(matches!(err, BrokerError::HandleRemoved(_)));
        assert!(err.is_fatal());
    }

    //re-adding to a queue faults the same way and admits nothing
    let queue = Queue::new(scx.clone(), "q".into(), 0, false);
    let err = queue.add_message(handle.clone(), None).await.unwrap_err();
    assert!(matches!(err, BrokerError::HandleRemoved(id) if id == handle.id()));
    assert!(err.is_fatal());
    assert_eq!(queue.depth(), 0);
    assert_eq!(queue.pending_len(), 0);
}

async fn with_persistence(persistence: Arc<MemoryPersistence>) -> ServerContext {
    ServerContext::new().persistence(persistence).memory_probe(Arc::new(FixedMemory::new(0))).build().await
}

#[tokio::test]
async fn persistent_queue_survives_restart() {
    init_log();
    let persistence = Arc::new(MemoryPersistence::new());

    let first = BrokerCore::new(with_persistence(persistence.clone()).await);
    first.start().await.unwrap();
    let (_t, _rx) = connect(&first, "c1", None).await;
    first.create_destination("orders".into(), DestinationConfig::queue().persistent(true)).await.unwrap();
    first.add_message(&"c1".into(), Message::new("orders", "o-1"), None).await.unwrap();
    first.shutdown();

    let second = BrokerCore::new(with_persistence(persistence).await);
    second.start().await.unwrap();
    assert!(second.destination(&"orders".into()).is_some());
    let (_t, _rx) = connect(&second, "c1", None).await;
    let c1: ConnectionId = "c1".into();
    second.subscribe(&c1, SubscriptionSpec::new("s", "orders").mode(ReceiveMode::Sync)).await.unwrap();
    let d = second.receive(&c1, &"s".into(), -1).await.unwrap().unwrap();
    assert_eq!(d.message.body, Bytes::from("o-1"));
}
