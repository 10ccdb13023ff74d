use super::*;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde_json::json;
use shared::protocol::{tables, ChangeKind, ChannelStatus, EventFilter, RowPredicate};

use crate::{
    backend::TransportSignal,
    error::SyncError,
    subscription::FeedEvent,
    test_support::{change_event, settle, wait_until, FakeBackend, SubscribeMode},
};

fn registry(backend: &Arc<FakeBackend>) -> (ConnectionRegistry, broadcast::Receiver<SyncEvent>) {
    let (events, rx) = broadcast::channel(64);
    let backend: Arc<dyn BackendClient> = backend.clone();
    let registry = ConnectionRegistry::new(
        backend,
        ReconnectPolicy::default(),
        NetworkMonitor::default(),
        events,
    );
    (registry, rx)
}

fn channel_filter(channel: &str) -> ChangeFilter {
    ChangeFilter::table(tables::MESSAGES)
        .on(EventFilter::Insert)
        .matching(RowPredicate::eq("conversation_id", channel))
}

fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        seen.push(event);
    }
    seen
}

#[tokio::test(start_paused = true)]
async fn concurrent_acquires_share_one_transport_subscription() {
    let backend = FakeBackend::new(SubscribeMode::Connect);
    let (registry, _events) = registry(&backend);

    let handles = join_all((0..8).map(|_| registry.acquire("messages:general", channel_filter("general")))).await;
    wait_until(Duration::from_secs(1), || {
        backend.subscribe_count("messages:general") == 1
    })
    .await;
    settle().await;

    assert_eq!(backend.subscribe_count("messages:general"), 1);
    assert_eq!(registry.listener_count("messages:general").await, 8);
    assert_eq!(registry.active_topics().await, vec!["messages:general".to_string()]);

    let mut handles = handles.into_iter();
    let last = handles.next().expect("eight handles");
    for handle in handles {
        registry.release(handle).await;
    }
    assert_eq!(registry.listener_count("messages:general").await, 1);
    assert_eq!(backend.controls("messages:general")[0].unsubscribe_count(), 0);

    registry.release(last).await;
    assert!(registry.active_topics().await.is_empty());
    assert_eq!(backend.controls("messages:general")[0].unsubscribe_count(), 1);
    assert_eq!(backend.subscribe_count("messages:general"), 1);
}

#[tokio::test(start_paused = true)]
async fn every_listener_receives_each_change_in_order() {
    let backend = FakeBackend::new(SubscribeMode::Connect);
    let (registry, _events) = registry(&backend);

    let mut first = registry.acquire("messages:general", channel_filter("general")).await;
    let mut second = registry.acquire("messages:general", channel_filter("general")).await;
    wait_until(Duration::from_secs(1), || first.state() == ConnectionState::Connected).await;

    let events: Vec<_> = (1..=3)
        .map(|seq| change_event(ChangeKind::Insert, tables::MESSAGES, json!({"seq": seq}), json!(null), Utc::now()))
        .collect();
    for event in &events {
        assert!(backend.push_change("messages:general", event.clone()));
    }

    for handle in [&mut first, &mut second] {
        for expected in &events {
            assert_eq!(
                handle.next_event().await,
                Some(Ok(FeedEvent::Change(expected.clone())))
            );
        }
    }

    registry.release(first).await;
    let late = change_event(ChangeKind::Insert, tables::MESSAGES, json!({"seq": 4}), json!(null), Utc::now());
    assert!(backend.push_change("messages:general", late.clone()));
    assert_eq!(second.next_event().await, Some(Ok(FeedEvent::Change(late))));
}

#[tokio::test(start_paused = true)]
async fn aggregate_state_is_connected_only_when_every_topic_is() {
    let backend = FakeBackend::new(SubscribeMode::Connect);
    let (registry, mut events) = registry(&backend);
    let state = registry.connection_state();
    assert_eq!(*state.borrow(), AggregateState::Idle);

    let general = registry.acquire("messages:general", channel_filter("general")).await;
    let random = registry.acquire("messages:random", channel_filter("random")).await;
    wait_until(Duration::from_secs(1), || {
        *state.borrow() == AggregateState::Connected
    })
    .await;

    assert!(backend.push(
        "messages:random",
        TransportSignal::Status(ChannelStatus::TimedOut)
    ));
    wait_until(Duration::from_millis(500), || {
        *state.borrow() == AggregateState::Connecting
    })
    .await;
    wait_until(Duration::from_secs(5), || {
        *state.borrow() == AggregateState::Connected
    })
    .await;

    registry.release(general).await;
    registry.release(random).await;
    assert_eq!(*state.borrow(), AggregateState::Idle);

    let aggregates: Vec<_> = drain_events(&mut events)
        .into_iter()
        .filter_map(|event| match event {
            SyncEvent::ConnectionStateChanged(state) => Some(state),
            _ => None,
        })
        .collect();
    assert_eq!(aggregates.first(), Some(&AggregateState::Connecting));
    assert_eq!(aggregates.last(), Some(&AggregateState::Idle));
    assert!(aggregates.windows(2).all(|pair| pair[0] != pair[1]));
}

#[tokio::test(start_paused = true)]
async fn exhausted_topic_reports_failure_and_restarts_on_reacquire() {
    let backend = FakeBackend::new(SubscribeMode::Fail);
    let (registry, mut events) = registry(&backend);
    let state = registry.connection_state();

    let mut handle = registry.acquire("mentions:me", channel_filter("me")).await;
    let item = tokio::time::timeout(Duration::from_secs(120), handle.next_event())
        .await
        .expect("gives up within the backoff window");
    assert_eq!(
        item,
        Some(Err(SyncError::ReconnectExhausted {
            topic: "mentions:me".to_string(),
            attempts: 5,
        }))
    );
    assert_eq!(handle.state(), ConnectionState::Failed);
    assert_eq!(*state.borrow(), AggregateState::Failed);
    assert!(drain_events(&mut events).contains(&SyncEvent::SubscriptionFailed {
        topic: "mentions:me".to_string(),
        attempts: 5,
    }));
    assert_eq!(backend.subscribe_count("mentions:me"), 6);

    backend.set_mode(SubscribeMode::Connect);
    let again = registry.acquire("mentions:me", channel_filter("me")).await;
    wait_until(Duration::from_secs(1), || {
        again.state() == ConnectionState::Connected
    })
    .await;
    assert_eq!(backend.subscribe_count("mentions:me"), 7);
    assert_eq!(*state.borrow(), AggregateState::Connected);
    assert_eq!(registry.listener_count("mentions:me").await, 2);

    registry.release(handle).await;
    registry.release(again).await;
    assert!(registry.active_topics().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn broadcasts_sent_while_reconnecting_are_delivered_after_rejoin() {
    let backend = FakeBackend::new(SubscribeMode::Connect);
    let (registry, _events) = registry(&backend);
    let handle = registry.acquire("typing:general", channel_filter("general")).await;
    wait_until(Duration::from_secs(1), || handle.state() == ConnectionState::Connected).await;

    backend.close_feeds("typing:general");
    wait_until(Duration::from_millis(500), || handle.state() != ConnectionState::Connected).await;
    handle
        .broadcast(BroadcastMessage::new("typing", json!({"user": "a"})))
        .await
        .expect("queued");

    wait_until(Duration::from_secs(5), || {
        backend.controls("typing:general").len() == 2
            && handle.state() == ConnectionState::Connected
    })
    .await;
    wait_until(Duration::from_secs(1), || {
        backend.controls("typing:general")[1].broadcasts().len() == 1
    })
    .await;
    assert!(backend.controls("typing:general")[0].broadcasts().is_empty());
}

#[tokio::test(start_paused = true)]
async fn teardown_closes_every_topic() {
    let backend = FakeBackend::new(SubscribeMode::Connect);
    let (registry, _events) = registry(&backend);
    let _a = registry.acquire("a", channel_filter("a")).await;
    let _b = registry.acquire("b", channel_filter("b")).await;
    wait_until(Duration::from_secs(1), || {
        *registry.connection_state().borrow() == AggregateState::Connected
    })
    .await;

    registry.teardown().await;

    assert!(registry.active_topics().await.is_empty());
    assert_eq!(backend.controls("a")[0].unsubscribe_count(), 1);
    assert_eq!(backend.controls("b")[0].unsubscribe_count(), 1);
    assert_eq!(*registry.connection_state().borrow(), AggregateState::Idle);
}

#[tokio::test(start_paused = true)]
async fn dropping_the_last_handle_closes_the_topic() {
    let backend = FakeBackend::new(SubscribeMode::Connect);
    let (registry, _events) = registry(&backend);
    let handle = registry.acquire("messages:general", channel_filter("general")).await;
    wait_until(Duration::from_secs(1), || handle.state() == ConnectionState::Connected).await;

    drop(handle);
    wait_until(Duration::from_secs(1), || {
        backend.controls("messages:general")[0].unsubscribe_count() == 1
    })
    .await;

    assert!(registry.active_topics().await.is_empty());
    assert_eq!(*registry.connection_state().borrow(), AggregateState::Idle);
}

#[tokio::test(start_paused = true)]
async fn dropped_handle_survives_a_dispatch_before_its_release_runs() {
    let backend = FakeBackend::new(SubscribeMode::Connect);
    let (registry, _events) = registry(&backend);
    let kept = registry.acquire("messages:general", channel_filter("general")).await;
    let dropped = registry.acquire("messages:general", channel_filter("general")).await;
    wait_until(Duration::from_secs(1), || kept.state() == ConnectionState::Connected).await;

    drop(dropped);
    assert!(backend.push_change(
        "messages:general",
        change_event(ChangeKind::Insert, tables::MESSAGES, json!({"seq": 1}), json!(null), Utc::now()),
    ));
    settle().await;
    assert_eq!(registry.listener_count("messages:general").await, 1);
    assert_eq!(backend.controls("messages:general")[0].unsubscribe_count(), 0);

    drop(kept);
    wait_until(Duration::from_secs(1), || {
        backend.controls("messages:general")[0].unsubscribe_count() == 1
    })
    .await;
    assert!(registry.active_topics().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn explicit_release_is_not_repeated_on_drop() {
    let backend = FakeBackend::new(SubscribeMode::Connect);
    let (registry, _events) = registry(&backend);
    let first = registry.acquire("messages:general", channel_filter("general")).await;
    wait_until(Duration::from_secs(1), || first.state() == ConnectionState::Connected).await;

    registry.release(first).await;
    let second = registry.acquire("messages:general", channel_filter("general")).await;
    wait_until(Duration::from_secs(1), || second.state() == ConnectionState::Connected).await;
    settle().await;

    assert_eq!(registry.listener_count("messages:general").await, 1);
    assert_eq!(backend.controls("messages:general").len(), 2);
    assert_eq!(backend.controls("messages:general")[1].unsubscribe_count(), 0);
    registry.release(second).await;
}

#[tokio::test(start_paused = true)]
async fn cancelled_rejoin_releases_the_failed_topic() {
    let backend = FakeBackend::new(SubscribeMode::Fail);
    let (registry, _events) = registry(&backend);
    let mut handle = registry.acquire("mentions:me", channel_filter("me")).await;
    let item = tokio::time::timeout(Duration::from_secs(120), handle.next_event())
        .await
        .expect("gives up within the backoff window");
    assert!(matches!(item, Some(Err(SyncError::ReconnectExhausted { .. }))));

    let (cancel, mut cancelled) = oneshot::channel();
    let _ = cancel.send(());
    assert!(registry.rejoin(handle, &mut cancelled).await.is_none());

    assert!(registry.active_topics().await.is_empty());
    assert_eq!(backend.subscribe_count("mentions:me"), 6);
}
