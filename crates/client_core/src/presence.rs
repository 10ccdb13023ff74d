//! Local liveness announcements and the derived view of everyone else's presence.
//!
//! Stored statuses are hints. A record whose `last_seen` is older than the
//! staleness threshold reads as offline no matter what it says.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, RwLock},
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use shared::{
    domain::{PresenceStatus, UserId},
    protocol::{tables, ChangeEvent, ChangeFilter, ChangeKind, PresenceRow},
};
use tokio::{sync::oneshot, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{
    backend::BackendClient,
    config::SyncConfig,
    error::SyncError,
    registry::{ConnectionRegistry, TopicHandle},
    subscription::FeedEvent,
};

pub const PRESENCE_TOPIC: &str = "presence";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceRecord {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

impl PresenceRecord {
    pub fn effective_status_at(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> PresenceStatus {
        if now - self.last_seen > stale_after {
            PresenceStatus::Offline
        } else {
            self.status
        }
    }
}

impl From<PresenceRow> for PresenceRecord {
    fn from(row: PresenceRow) -> Self {
        Self {
            user_id: row.user_id,
            status: row.status,
            last_seen: row.last_seen,
        }
    }
}

#[derive(Deserialize)]
struct PresenceKey {
    user_id: UserId,
}

#[derive(Debug, Clone, Copy)]
pub struct PresenceOptions {
    pub heartbeat: Duration,
    pub stale_after: chrono::Duration,
}

impl PresenceOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            heartbeat: config.presence_heartbeat(),
            stale_after: config.presence_stale_after(),
        }
    }
}

struct LocalState {
    status: PresenceStatus,
    visibility: Visibility,
}

struct FeedTask {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct PresenceTracker {
    backend: Arc<dyn BackendClient>,
    registry: Arc<ConnectionRegistry>,
    user_id: UserId,
    options: PresenceOptions,
    records: RwLock<HashMap<UserId, PresenceRecord>>,
    local: Mutex<LocalState>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    feed: Mutex<Option<FeedTask>>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl PresenceTracker {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        registry: Arc<ConnectionRegistry>,
        user_id: UserId,
        options: PresenceOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            registry,
            user_id,
            options,
            records: RwLock::new(HashMap::new()),
            local: Mutex::new(LocalState {
                status: PresenceStatus::Online,
                visibility: Visibility::Visible,
            }),
            heartbeat: Mutex::new(None),
            feed: Mutex::new(None),
        })
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Announces `online`, loads current presence, follows the presence feed and
    /// starts the heartbeat.
    pub async fn start(self: &Arc<Self>) {
        if let Err(err) = self.set_status(PresenceStatus::Online).await {
            warn!(user_id = %self.user_id, "presence: initial announcement failed: {err:#}");
        }
        if let Err(err) = self.refresh().await {
            warn!("presence: initial load failed: {err:#}");
        }

        let handle = self
            .registry
            .acquire(PRESENCE_TOPIC, ChangeFilter::table(tables::USER_PRESENCE))
            .await;
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(follow_feed(Arc::clone(self), handle, shutdown_rx));
        if let Some(previous) = locked(&self.feed).replace(FeedTask { shutdown, task }) {
            let _ = previous.shutdown.send(());
        }

        let tracker = Arc::clone(self);
        let heartbeat = tokio::spawn(async move {
            let period = tracker.options.heartbeat;
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                tracker.beat().await;
            }
        });
        if let Some(previous) = locked(&self.heartbeat).replace(heartbeat) {
            previous.abort();
        }
        info!(user_id = %self.user_id, "presence: tracking started");
    }

    async fn beat(&self) {
        let status = {
            let local = locked(&self.local);
            if local.visibility == Visibility::Hidden {
                return;
            }
            local.status
        };
        debug!(user_id = %self.user_id, %status, "presence: heartbeat");
        if let Err(err) = self.set_status(status).await {
            warn!(user_id = %self.user_id, "presence: heartbeat failed: {err:#}");
        }
    }

    /// Upserts the local user's status stamped with the current time.
    pub async fn set_status(&self, status: PresenceStatus) -> Result<()> {
        let row = PresenceRow {
            user_id: self.user_id,
            status,
            last_seen: Utc::now(),
        };
        locked(&self.local).status = status;
        self.backend
            .upsert(tables::USER_PRESENCE, serde_json::to_value(&row)?, "user_id")
            .await
            .context("failed to publish presence")?;
        self.store(PresenceRecord::from(row));
        Ok(())
    }

    /// `Hidden` reads as away and `Visible` as online. A manual do-not-disturb
    /// is left alone.
    pub async fn set_visibility(&self, visibility: Visibility) -> Result<()> {
        let status = {
            let mut local = locked(&self.local);
            local.visibility = visibility;
            if local.status == PresenceStatus::Dnd {
                return Ok(());
            }
            match visibility {
                Visibility::Hidden => PresenceStatus::Away,
                Visibility::Visible => PresenceStatus::Online,
            }
        };
        self.set_status(status).await
    }

    pub fn presence_of(&self, user_id: UserId) -> PresenceStatus {
        self.presence_at(user_id, Utc::now())
    }

    pub fn presence_at(&self, user_id: UserId, now: DateTime<Utc>) -> PresenceStatus {
        let records = match self.records.read() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        records
            .get(&user_id)
            .map(|record| record.effective_status_at(now, self.options.stale_after))
            .unwrap_or(PresenceStatus::Offline)
    }

    pub fn record_of(&self, user_id: UserId) -> Option<PresenceRecord> {
        let records = match self.records.read() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        records.get(&user_id).cloned()
    }

    /// Replaces the cache with the full presence table.
    pub async fn refresh(&self) -> Result<()> {
        let rows = self
            .backend
            .select(tables::USER_PRESENCE, &[])
            .await
            .context("failed to load presence")?;
        let mut fresh = HashMap::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<PresenceRow>(row) {
                Ok(row) => {
                    fresh.insert(row.user_id, PresenceRecord::from(row));
                }
                Err(err) => warn!("presence: skipping malformed row: {err}"),
            }
        }
        let mut records = match self.records.write() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        *records = fresh;
        Ok(())
    }

    fn store(&self, record: PresenceRecord) {
        let mut records = match self.records.write() {
            Ok(records) => records,
            Err(poisoned) => poisoned.into_inner(),
        };
        records.insert(record.user_id, record);
    }

    pub(crate) fn apply_change(&self, event: &ChangeEvent) {
        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => match event.record_as::<PresenceRow>() {
                Ok(row) => self.store(PresenceRecord::from(row)),
                Err(err) => warn!("presence: ignoring malformed change: {err}"),
            },
            ChangeKind::Delete => match event.old_record_as::<PresenceKey>() {
                Ok(key) => {
                    let mut records = match self.records.write() {
                        Ok(records) => records,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                    records.remove(&key.user_id);
                }
                Err(err) => warn!("presence: ignoring malformed delete: {err}"),
            },
        }
    }

    /// Announces `offline` best-effort and stops the heartbeat and feed.
    pub async fn shutdown(&self) {
        if let Some(heartbeat) = locked(&self.heartbeat).take() {
            heartbeat.abort();
        }
        if let Err(err) = self.set_status(PresenceStatus::Offline).await {
            debug!(user_id = %self.user_id, "presence: offline announcement lost: {err:#}");
        }
        let feed = locked(&self.feed).take();
        if let Some(feed) = feed {
            let _ = feed.shutdown.send(());
            if let Err(err) = feed.task.await {
                warn!("presence: feed task ended abnormally: {err}");
            }
        }
        info!(user_id = %self.user_id, "presence: tracking stopped");
    }
}

async fn follow_feed(
    tracker: Arc<PresenceTracker>,
    mut handle: TopicHandle,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let item = tokio::select! {
            _ = &mut shutdown => break,
            item = handle.next_event() => item,
        };
        match item {
            Some(Ok(FeedEvent::Change(event))) => tracker.apply_change(&event),
            Some(Ok(FeedEvent::Broadcast(_))) => {}
            Some(Err(err @ SyncError::ReconnectExhausted { .. })) => {
                warn!("presence: feed unavailable: {err}");
                let Some(rejoined) = tracker.registry.rejoin(handle, &mut shutdown).await else {
                    return;
                };
                handle = rejoined;
                if let Err(err) = tracker.refresh().await {
                    warn!("presence: refresh after rejoin failed: {err:#}");
                }
            }
            Some(Err(err)) => warn!("presence: feed unavailable: {err}"),
            None => break,
        }
    }
    tracker.registry.release(handle).await;
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
