//! Hand-written collaborators shared by the unit tests of this crate.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use shared::{
    domain::AuthUser,
    error::{ApiException, ErrorCode},
    protocol::{BroadcastMessage, ChangeEvent, ChangeFilter, ChangeKind, ChannelStatus, RowPredicate},
};
use tokio::{sync::mpsc, time::Instant};

use crate::backend::{BackendClient, FeedConnection, FeedControl, TransportSignal};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubscribeMode {
    /// `subscribe` returns an error.
    Fail,
    /// `subscribe` succeeds and reports `Subscribed` straight away.
    Connect,
    /// `subscribe` succeeds but the transport never reports a status.
    Silent,
}

#[derive(Debug, Clone)]
pub(crate) struct SubscribeCall {
    pub topic: String,
    pub filter: ChangeFilter,
    pub at: Instant,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Mutation {
    Insert {
        table: String,
        payload: Value,
    },
    Upsert {
        table: String,
        payload: Value,
        on_conflict: String,
    },
    Update {
        table: String,
        predicates: Vec<RowPredicate>,
        payload: Value,
    },
    Delete {
        table: String,
        predicates: Vec<RowPredicate>,
    },
}

impl Mutation {
    pub fn table(&self) -> &str {
        match self {
            Self::Insert { table, .. }
            | Self::Upsert { table, .. }
            | Self::Update { table, .. }
            | Self::Delete { table, .. } => table,
        }
    }
}

#[derive(Default)]
pub(crate) struct FakeControl {
    broadcasts: Mutex<Vec<BroadcastMessage>>,
    unsubscribes: AtomicUsize,
    fail_broadcasts: AtomicBool,
}

impl FakeControl {
    pub fn broadcasts(&self) -> Vec<BroadcastMessage> {
        lock(&self.broadcasts).clone()
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn set_fail_broadcasts(&self, fail: bool) {
        self.fail_broadcasts.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl FeedControl for FakeControl {
    async fn send_broadcast(&self, message: BroadcastMessage) -> Result<()> {
        if self.fail_broadcasts.load(Ordering::SeqCst) {
            return Err(anyhow!("broadcast rejected"));
        }
        lock(&self.broadcasts).push(message);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct OpenFeed {
    topic: String,
    signals: mpsc::UnboundedSender<TransportSignal>,
    control: Arc<FakeControl>,
}

pub(crate) struct FakeBackend {
    mode: Mutex<SubscribeMode>,
    subscribe_calls: Mutex<Vec<SubscribeCall>>,
    feeds: Mutex<Vec<OpenFeed>>,
    controls: Mutex<Vec<(String, Arc<FakeControl>)>>,
    rows: Mutex<HashMap<String, Vec<Value>>>,
    mutations: Mutex<Vec<Mutation>>,
    fail_mutations: Mutex<Option<ErrorCode>>,
    user: Mutex<Option<AuthUser>>,
}

impl FakeBackend {
    pub fn new(mode: SubscribeMode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            subscribe_calls: Mutex::new(Vec::new()),
            feeds: Mutex::new(Vec::new()),
            controls: Mutex::new(Vec::new()),
            rows: Mutex::new(HashMap::new()),
            mutations: Mutex::new(Vec::new()),
            fail_mutations: Mutex::new(None),
            user: Mutex::new(None),
        })
    }

    pub fn set_mode(&self, mode: SubscribeMode) {
        *lock(&self.mode) = mode;
    }

    pub fn set_user(&self, user: Option<AuthUser>) {
        *lock(&self.user) = user;
    }

    pub fn set_rows(&self, table: &str, rows: Vec<Value>) {
        lock(&self.rows).insert(table.to_string(), rows);
    }

    /// Makes every row mutation fail with the given backend error code.
    pub fn fail_mutations_with(&self, code: Option<ErrorCode>) {
        *lock(&self.fail_mutations) = code;
    }

    pub fn subscribe_calls(&self) -> Vec<SubscribeCall> {
        lock(&self.subscribe_calls).clone()
    }

    pub fn subscribe_count(&self, topic: &str) -> usize {
        lock(&self.subscribe_calls)
            .iter()
            .filter(|call| call.topic == topic)
            .count()
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        lock(&self.mutations).clone()
    }

    pub fn mutations_on(&self, table: &str) -> Vec<Mutation> {
        self.mutations()
            .into_iter()
            .filter(|mutation| mutation.table() == table)
            .collect()
    }

    /// Controls handed out for `topic`, oldest first.
    pub fn controls(&self, topic: &str) -> Vec<Arc<FakeControl>> {
        lock(&self.controls)
            .iter()
            .filter(|(name, _)| name == topic)
            .map(|(_, control)| Arc::clone(control))
            .collect()
    }

    /// Pushes a signal into the most recent open feed for `topic`.
    pub fn push(&self, topic: &str, signal: TransportSignal) -> bool {
        let feeds = lock(&self.feeds);
        feeds
            .iter()
            .rev()
            .find(|feed| feed.topic == topic && !feed.signals.is_closed())
            .is_some_and(|feed| feed.signals.send(signal).is_ok())
    }

    pub fn push_change(&self, topic: &str, event: ChangeEvent) -> bool {
        self.push(topic, TransportSignal::Change(event))
    }

    /// Drops the sending side of every feed for `topic`, as a lost socket would.
    pub fn close_feeds(&self, topic: &str) {
        lock(&self.feeds).retain(|feed| feed.topic != topic);
    }

    fn record(&self, mutation: Mutation) -> Result<()> {
        if let Some(code) = *lock(&self.fail_mutations) {
            return Err(ApiException::new(code, "injected failure").into());
        }
        lock(&self.mutations).push(mutation);
        Ok(())
    }
}

fn row_matches(row: &Value, predicates: &[RowPredicate]) -> bool {
    predicates.iter().all(|predicate| {
        match row.get(&predicate.column) {
            Some(Value::String(value)) => value == &predicate.value,
            Some(other) => other.to_string() == predicate.value,
            None => false,
        }
    })
}

#[async_trait]
impl BackendClient for FakeBackend {
    async fn subscribe(&self, topic: &str, filter: &ChangeFilter) -> Result<FeedConnection> {
        lock(&self.subscribe_calls).push(SubscribeCall {
            topic: topic.to_string(),
            filter: filter.clone(),
            at: Instant::now(),
        });

        let mode = *lock(&self.mode);
        if mode == SubscribeMode::Fail {
            return Err(anyhow!("connection refused"));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if mode == SubscribeMode::Connect {
            let _ = tx.send(TransportSignal::Status(ChannelStatus::Subscribed));
        }
        let control = Arc::new(FakeControl::default());
        lock(&self.feeds).push(OpenFeed {
            topic: topic.to_string(),
            signals: tx,
            control: Arc::clone(&control),
        });
        lock(&self.controls).push((topic.to_string(), Arc::clone(&control)));

        Ok(FeedConnection {
            signals: rx,
            control,
        })
    }

    async fn select(&self, table: &str, predicates: &[RowPredicate]) -> Result<Vec<Value>> {
        Ok(lock(&self.rows)
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row_matches(row, predicates))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, table: &str, payload: Value) -> Result<Value> {
        self.record(Mutation::Insert {
            table: table.to_string(),
            payload: payload.clone(),
        })?;
        Ok(payload)
    }

    async fn upsert(&self, table: &str, payload: Value, on_conflict: &str) -> Result<Value> {
        self.record(Mutation::Upsert {
            table: table.to_string(),
            payload: payload.clone(),
            on_conflict: on_conflict.to_string(),
        })?;
        Ok(payload)
    }

    async fn update(
        &self,
        table: &str,
        predicates: &[RowPredicate],
        payload: Value,
    ) -> Result<Value> {
        self.record(Mutation::Update {
            table: table.to_string(),
            predicates: predicates.to_vec(),
            payload: payload.clone(),
        })?;
        Ok(payload)
    }

    async fn delete(&self, table: &str, predicates: &[RowPredicate]) -> Result<()> {
        self.record(Mutation::Delete {
            table: table.to_string(),
            predicates: predicates.to_vec(),
        })
    }

    async fn call_rpc(&self, name: &str, _args: Value) -> Result<Value> {
        Err(anyhow!("rpc {name} not scripted"))
    }

    async fn current_user(&self) -> Result<Option<AuthUser>> {
        Ok(lock(&self.user).clone())
    }
}

pub(crate) fn change_event(
    kind: ChangeKind,
    table: &str,
    record: Value,
    old_record: Value,
    at: DateTime<Utc>,
) -> ChangeEvent {
    ChangeEvent {
        kind,
        schema: "public".to_string(),
        table: table.to_string(),
        record,
        old_record,
        commit_timestamp: at,
    }
}

/// Polls `check` every 10ms, failing the test after `limit`.
pub(crate) async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + limit;
    while !check() {
        assert!(Instant::now() < deadline, "condition not met within {limit:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Lets spawned tasks run without advancing the clock.
pub(crate) async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}
