use super::*;

use serde_json::json;
use tokio::sync::broadcast;

use crate::{
    network::NetworkMonitor,
    reconnect::ReconnectPolicy,
    test_support::{change_event, settle, wait_until, FakeBackend, Mutation, SubscribeMode},
};

fn tracker(backend: &Arc<FakeBackend>, user_id: UserId) -> (Arc<PresenceTracker>, Arc<ConnectionRegistry>) {
    let (events, _) = broadcast::channel(32);
    let registry = Arc::new(ConnectionRegistry::new(
        backend.clone(),
        ReconnectPolicy::default(),
        NetworkMonitor::default(),
        events,
    ));
    let tracker = PresenceTracker::new(
        backend.clone(),
        Arc::clone(&registry),
        user_id,
        PresenceOptions::from_config(&SyncConfig::default()),
    );
    (tracker, registry)
}

fn announced(backend: &FakeBackend) -> Vec<PresenceStatus> {
    backend
        .mutations_on(tables::USER_PRESENCE)
        .into_iter()
        .map(|mutation| match mutation {
            Mutation::Upsert {
                payload,
                on_conflict,
                ..
            } => {
                assert_eq!(on_conflict, "user_id");
                serde_json::from_value::<PresenceRow>(payload)
                    .expect("presence row")
                    .status
            }
            other => panic!("presence is only ever upserted, got {other:?}"),
        })
        .collect()
}

fn row(user_id: UserId, status: PresenceStatus, last_seen: DateTime<Utc>) -> serde_json::Value {
    serde_json::to_value(PresenceRow {
        user_id,
        status,
        last_seen,
    })
    .expect("row json")
}

#[test]
fn stale_records_read_as_offline_regardless_of_status() {
    let now = Utc::now();
    let stale_after = chrono::Duration::minutes(5);
    let record = |status, age: chrono::Duration| PresenceRecord {
        user_id: UserId::random(),
        status,
        last_seen: now - age,
    };

    assert_eq!(
        record(PresenceStatus::Online, chrono::Duration::minutes(10)).effective_status_at(now, stale_after),
        PresenceStatus::Offline
    );
    assert_eq!(
        record(PresenceStatus::Dnd, chrono::Duration::minutes(1)).effective_status_at(now, stale_after),
        PresenceStatus::Dnd
    );
    assert_eq!(
        record(PresenceStatus::Away, stale_after).effective_status_at(now, stale_after),
        PresenceStatus::Away
    );
}

#[tokio::test(start_paused = true)]
async fn start_announces_online_and_loads_everyone_else() {
    let backend = FakeBackend::new(SubscribeMode::Connect);
    let me = UserId::random();
    let fresh = UserId::random();
    let stale = UserId::random();
    backend.set_rows(
        tables::USER_PRESENCE,
        vec![
            row(fresh, PresenceStatus::Away, Utc::now() - chrono::Duration::minutes(1)),
            row(stale, PresenceStatus::Online, Utc::now() - chrono::Duration::minutes(10)),
            json!({"user_id": "not-a-uuid"}),
        ],
    );
    let (tracker, _registry) = tracker(&backend, me);

    tracker.start().await;

    assert_eq!(announced(&backend), vec![PresenceStatus::Online]);
    assert_eq!(tracker.presence_of(fresh), PresenceStatus::Away);
    assert_eq!(tracker.presence_of(stale), PresenceStatus::Offline);
    assert_eq!(tracker.presence_of(UserId::random()), PresenceStatus::Offline);
    wait_until(Duration::from_secs(1), || backend.subscribe_count(PRESENCE_TOPIC) == 1).await;
    assert_eq!(
        backend.subscribe_calls()[0].filter,
        ChangeFilter::table(tables::USER_PRESENCE)
    );

    tracker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn feed_changes_patch_the_cache() {
    let backend = FakeBackend::new(SubscribeMode::Connect);
    let (tracker, _registry) = tracker(&backend, UserId::random());
    tracker.start().await;
    wait_until(Duration::from_secs(1), || backend.subscribe_count(PRESENCE_TOPIC) == 1).await;
    settle().await;

    let peer = UserId::random();
    assert!(backend.push_change(
        PRESENCE_TOPIC,
        change_event(
            ChangeKind::Update,
            tables::USER_PRESENCE,
            row(peer, PresenceStatus::Dnd, Utc::now()),
            serde_json::Value::Null,
            Utc::now(),
        ),
    ));
    let view = Arc::clone(&tracker);
    wait_until(Duration::from_secs(1), move || view.presence_of(peer) == PresenceStatus::Dnd).await;

    assert!(backend.push_change(
        PRESENCE_TOPIC,
        change_event(
            ChangeKind::Delete,
            tables::USER_PRESENCE,
            serde_json::Value::Null,
            json!({"user_id": peer}),
            Utc::now(),
        ),
    ));
    let view = Arc::clone(&tracker);
    wait_until(Duration::from_secs(1), move || view.record_of(peer).is_none()).await;
    assert_eq!(tracker.presence_of(peer), PresenceStatus::Offline);

    tracker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_reasserts_only_while_visible() {
    let backend = FakeBackend::new(SubscribeMode::Connect);
    let (tracker, _registry) = tracker(&backend, UserId::random());
    tracker.start().await;
    assert_eq!(announced(&backend).len(), 1);

    tokio::time::sleep(Duration::from_secs(121)).await;
    settle().await;
    assert_eq!(
        announced(&backend),
        vec![PresenceStatus::Online, PresenceStatus::Online]
    );

    tracker
        .set_visibility(Visibility::Hidden)
        .await
        .expect("hidden");
    tokio::time::sleep(Duration::from_secs(240)).await;
    settle().await;
    assert_eq!(
        announced(&backend),
        vec![
            PresenceStatus::Online,
            PresenceStatus::Online,
            PresenceStatus::Away
        ]
    );

    tracker
        .set_visibility(Visibility::Visible)
        .await
        .expect("visible");
    assert_eq!(announced(&backend).last(), Some(&PresenceStatus::Online));

    tracker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn do_not_disturb_survives_visibility_changes() {
    let backend = FakeBackend::new(SubscribeMode::Connect);
    let me = UserId::random();
    let (tracker, _registry) = tracker(&backend, me);
    tracker.start().await;

    tracker.set_status(PresenceStatus::Dnd).await.expect("dnd");
    tracker
        .set_visibility(Visibility::Hidden)
        .await
        .expect("hidden");
    tracker
        .set_visibility(Visibility::Visible)
        .await
        .expect("visible");

    assert_eq!(
        announced(&backend),
        vec![PresenceStatus::Online, PresenceStatus::Dnd]
    );
    assert_eq!(tracker.presence_of(me), PresenceStatus::Dnd);

    tracker.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_announces_offline_and_releases_the_feed() {
    let backend = FakeBackend::new(SubscribeMode::Connect);
    let (tracker, registry) = tracker(&backend, UserId::random());
    tracker.start().await;
    wait_until(Duration::from_secs(1), || backend.subscribe_count(PRESENCE_TOPIC) == 1).await;

    tracker.shutdown().await;

    assert_eq!(announced(&backend).last(), Some(&PresenceStatus::Offline));
    assert!(registry.active_topics().await.is_empty());
    assert_eq!(backend.controls(PRESENCE_TOPIC)[0].unsubscribe_count(), 1);

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(announced(&backend).len(), 2, "no heartbeats after shutdown");
}

#[tokio::test(start_paused = true)]
async fn lost_offline_announcement_does_not_block_shutdown() {
    let backend = FakeBackend::new(SubscribeMode::Connect);
    let (tracker, registry) = tracker(&backend, UserId::random());
    tracker.start().await;

    backend.fail_mutations_with(Some(shared::error::ErrorCode::Internal));
    tracker.shutdown().await;

    assert!(registry.active_topics().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn exhausted_feed_rejoins_on_the_retry_timer_and_refreshes() {
    let backend = FakeBackend::new(SubscribeMode::Fail);
    let (tracker, registry) = tracker(&backend, UserId::random());
    tracker.start().await;
    tokio::time::sleep(Duration::from_secs(40)).await;
    settle().await;
    assert_eq!(backend.subscribe_count(PRESENCE_TOPIC), 6);

    let peer = UserId::random();
    backend.set_rows(
        tables::USER_PRESENCE,
        vec![row(peer, PresenceStatus::Away, Utc::now())],
    );
    backend.set_mode(SubscribeMode::Connect);
    tokio::time::sleep(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(backend.subscribe_count(PRESENCE_TOPIC), 6, "still waiting out the rejoin interval");
    assert_eq!(tracker.presence_of(peer), PresenceStatus::Offline);

    wait_until(Duration::from_secs(60), || backend.subscribe_count(PRESENCE_TOPIC) == 7).await;
    let view = Arc::clone(&tracker);
    wait_until(Duration::from_secs(1), move || view.presence_of(peer) == PresenceStatus::Away).await;
    settle().await;

    assert!(backend.push_change(
        PRESENCE_TOPIC,
        change_event(
            ChangeKind::Update,
            tables::USER_PRESENCE,
            row(peer, PresenceStatus::Dnd, Utc::now()),
            serde_json::Value::Null,
            Utc::now(),
        ),
    ));
    let view = Arc::clone(&tracker);
    wait_until(Duration::from_secs(1), move || view.presence_of(peer) == PresenceStatus::Dnd).await;
    assert_eq!(registry.active_topics().await, vec![PRESENCE_TOPIC.to_string()]);

    tracker.shutdown().await;
    assert!(registry.active_topics().await.is_empty());
}
