mod support;

use std::time::Duration;

use relaychat_core::event::{build_event, direct_message_draft, EventDraft};
use relaychat_core::filter::inbox_filters;
use relaychat_core::nostr_sdk::{Event, Keys};
use relaychat_core::{Error, Filter, RelayPool, RelayStatus, SubscriptionItem};
use support::{fast_config, unreachable_relay, MockRelay};
use tokio::time::timeout;

fn dm(from: &Keys, to: &Keys, at: u64) -> Event {
    build_event(from, direct_message_draft(&to.public_key(), "opaque").created_at(at)).unwrap()
}

/// Collect events until end-of-stored-events.
async fn stored(subscription: &mut relaychat_core::Subscription) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        match timeout(Duration::from_secs(5), subscription.recv()).await {
            Ok(Some(SubscriptionItem::Event(event))) => events.push(*event),
            Ok(Some(SubscriptionItem::EndOfStoredEvents)) => return events,
            Ok(None) => panic!("subscription ended before end-of-stored-events"),
            Err(_) => panic!("timed out waiting for end-of-stored-events"),
        }
    }
}

#[tokio::test]
async fn event_on_two_relays_is_delivered_once() {
    let me = Keys::generate();
    let them = Keys::generate();
    let event = dm(&them, &me, 100);

    let a = MockRelay::start().await;
    let b = MockRelay::start().await;
    a.store(event.clone());
    b.store(event.clone());

    let pool = RelayPool::new(fast_config());
    let mut subscription = pool.subscribe(&[a.url.clone(), b.url.clone()], inbox_filters(&me.public_key()));
    let events = stored(&mut subscription).await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].id, event.id);
    pool.shutdown();
}

#[tokio::test]
async fn separate_subscriptions_each_see_the_event() {
    let me = Keys::generate();
    let them = Keys::generate();
    let relay = MockRelay::start().await;
    relay.store(dm(&them, &me, 100));

    let pool = RelayPool::new(fast_config());
    let urls = [relay.url.clone()];
    let mut first = pool.subscribe(&urls, inbox_filters(&me.public_key()));
    let mut second = pool.subscribe(&urls, inbox_filters(&me.public_key()));

    assert_eq!(stored(&mut first).await.len(), 1);
    assert_eq!(stored(&mut second).await.len(), 1);
}

#[tokio::test]
async fn silent_relay_does_not_block_end_of_stored_events() {
    let me = Keys::generate();
    let them = Keys::generate();
    let live = MockRelay::start().await;
    let silent = MockRelay::silent().await;
    live.store(dm(&them, &me, 100));

    let pool = RelayPool::new(fast_config());
    let mut subscription = pool.subscribe(&[live.url.clone(), silent.url.clone()], inbox_filters(&me.public_key()));

    let started = tokio::time::Instant::now();
    let events = stored(&mut subscription).await;
    assert_eq!(events.len(), 1);
    assert!(started.elapsed() >= Duration::from_millis(400));
}

#[tokio::test]
async fn unreachable_relay_is_isolated() {
    let me = Keys::generate();
    let them = Keys::generate();
    let relay = MockRelay::start().await;
    relay.store(dm(&them, &me, 100));

    let pool = RelayPool::new(fast_config());
    let mut subscription = pool.subscribe(&[unreachable_relay(), relay.url.clone()], inbox_filters(&me.public_key()));
    assert_eq!(stored(&mut subscription).await.len(), 1);

    let published = pool
        .publish(&[unreachable_relay(), relay.url.clone()], &dm(&me, &them, 200))
        .await
        .unwrap();
    assert_eq!(published.accepted_by, relay.url);
}

#[tokio::test]
async fn live_events_follow_stored_ones() {
    let me = Keys::generate();
    let them = Keys::generate();
    let relay = MockRelay::start().await;
    let urls = [relay.url.clone()];

    let pool = RelayPool::new(fast_config());
    let mut subscription = pool.subscribe(&urls, inbox_filters(&me.public_key()));
    assert!(stored(&mut subscription).await.is_empty());

    let sender = RelayPool::new(fast_config());
    let event = dm(&them, &me, 100);
    sender.publish(&urls, &event).await.unwrap();

    match timeout(Duration::from_secs(5), subscription.recv()).await {
        Ok(Some(SubscriptionItem::Event(received))) => assert_eq!(received.id, event.id),
        other => panic!("expected live event, got {other:?}"),
    }
}

#[tokio::test]
async fn publish_resolves_on_first_ack() {
    let keys = Keys::generate();
    let acking = MockRelay::start().await;
    let silent = MockRelay::silent().await;

    let pool = RelayPool::new(fast_config());
    let event = build_event(&keys, EventDraft::new(1, "hello")).unwrap();
    let output = timeout(
        Duration::from_secs(1),
        pool.publish(&[silent.url.clone(), acking.url.clone()], &event),
    )
    .await
    .expect("publish waited for the silent relay")
    .unwrap();

    assert_eq!(output.event_id, event.id);
    assert_eq!(output.accepted_by, acking.url);
    assert_eq!(acking.stored().len(), 1);
}

#[tokio::test]
async fn publish_fails_when_no_relay_accepts() {
    let keys = Keys::generate();
    let rejecting = MockRelay::start_with(support::Behavior {
        accept_events: false,
        ..Default::default()
    })
    .await;
    let silent = MockRelay::silent().await;

    let pool = RelayPool::new(fast_config());
    let event = build_event(&keys, EventDraft::new(1, "hello")).unwrap();
    let err = pool
        .publish(&[rejecting.url.clone(), silent.url.clone()], &event)
        .await
        .unwrap_err();

    match err {
        Error::Publish { failures, .. } => {
            assert!(failures[&rejecting.url].contains("blocked"));
            assert!(failures[&silent.url].contains("timed out"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn publish_offline_fails() {
    let keys = Keys::generate();
    let pool = RelayPool::new(fast_config());
    let event = build_event(&keys, EventDraft::new(1, "hello")).unwrap();
    let err = pool.publish(&[unreachable_relay()], &event).await.unwrap_err();
    assert!(matches!(err, Error::Publish { .. }));
}

#[tokio::test]
async fn closed_subscription_receives_nothing_more() {
    let me = Keys::generate();
    let them = Keys::generate();
    let relay = MockRelay::start().await;
    let urls = [relay.url.clone()];

    let pool = RelayPool::new(fast_config());
    let mut subscription = pool.subscribe(&urls, inbox_filters(&me.public_key()));
    stored(&mut subscription).await;
    subscription.close();
    subscription.close();

    let sender = RelayPool::new(fast_config());
    sender.publish(&urls, &dm(&them, &me, 100)).await.unwrap();

    assert!(subscription.recv().await.is_none());
    assert!(subscription.is_closed());
}

#[tokio::test]
async fn resubscribes_after_reconnect() {
    let me = Keys::generate();
    let them = Keys::generate();
    let relay = MockRelay::start().await;
    let urls = [relay.url.clone()];

    let pool = RelayPool::new(fast_config());
    let mut subscription = pool.subscribe(&urls, inbox_filters(&me.public_key()));
    stored(&mut subscription).await;
    let requests_before = relay.requests().len();

    relay.disconnect_all();
    // Wait for the worker to come back and replay its REQ.
    let mut replayed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if relay.requests().len() > requests_before
            && pool.wait_for_status(&relay.url, RelayStatus::Connected, Duration::from_millis(10)).await
        {
            replayed = true;
            break;
        }
    }
    assert!(replayed, "subscription was not replayed after reconnect");
    assert!(relay.connections_accepted() >= 2);

    let sender = RelayPool::new(fast_config());
    let event = dm(&them, &me, 100);
    sender.publish(&urls, &event).await.unwrap();
    match timeout(Duration::from_secs(5), subscription.recv()).await {
        Ok(Some(SubscriptionItem::Event(received))) => assert_eq!(received.id, event.id),
        other => panic!("expected event after reconnect, got {other:?}"),
    }
}

#[tokio::test]
async fn filter_mismatches_are_not_delivered() {
    let me = Keys::generate();
    let them = Keys::generate();
    let relay = MockRelay::start().await;
    relay.store(build_event(&them, EventDraft::new(1, "public note")).unwrap());
    relay.store(dm(&them, &me, 100));

    let pool = RelayPool::new(fast_config());
    let mut subscription = pool.subscribe(&[relay.url.clone()], vec![Filter::new().kind(4)]);
    let events = stored(&mut subscription).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind.as_u16(), 4);
}

#[tokio::test]
async fn shutdown_ends_open_subscriptions() {
    let me = Keys::generate();
    let relay = MockRelay::start().await;
    let pool = RelayPool::new(fast_config());
    let mut subscription = pool.subscribe(&[relay.url.clone()], inbox_filters(&me.public_key()));
    stored(&mut subscription).await;

    pool.shutdown();
    let ended = timeout(Duration::from_secs(1), subscription.recv()).await;
    assert!(matches!(ended, Ok(None)));
}
