//! Ephemeral "is typing" state, expired on both ends.
//!
//! The sender deletes its own record after a quiet period; receivers drop an
//! entry after the same period even if the delete never reaches them.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Deserialize;
use shared::{
    domain::{ConversationId, UserId},
    protocol::{tables, ChangeEvent, ChangeFilter, ChangeKind, RowPredicate, TypingRow},
};
use tokio::{sync::oneshot, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{
    backend::BackendClient,
    error::SyncError,
    registry::{ConnectionRegistry, TopicHandle},
    subscription::FeedEvent,
};

pub fn typing_topic(conversation_id: ConversationId) -> String {
    format!("typing:{conversation_id}")
}

struct Timer {
    generation: u64,
    task: JoinHandle<()>,
}

struct Watch {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

#[derive(Deserialize)]
struct TypingKey {
    user_id: UserId,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct TypingIndicatorCoordinator {
    backend: Arc<dyn BackendClient>,
    registry: Arc<ConnectionRegistry>,
    user_id: UserId,
    ttl: Duration,
    generation: AtomicU64,
    outgoing: Mutex<HashMap<ConversationId, Timer>>,
    observed: Mutex<HashMap<ConversationId, HashMap<UserId, Timer>>>,
    watches: Mutex<HashMap<ConversationId, Watch>>,
}

impl TypingIndicatorCoordinator {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        registry: Arc<ConnectionRegistry>,
        user_id: UserId,
        ttl: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            registry,
            user_id,
            ttl,
            generation: AtomicU64::new(1),
            outgoing: Mutex::new(HashMap::new()),
            observed: Mutex::new(HashMap::new()),
            watches: Mutex::new(HashMap::new()),
        })
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed)
    }

    pub fn is_typing_in(&self, conversation_id: ConversationId) -> bool {
        locked(&self.outgoing).contains_key(&conversation_id)
    }

    /// Marks the local user as typing and pushes the auto-clear `ttl` into
    /// the future.
    pub async fn start_typing(self: &Arc<Self>, conversation_id: ConversationId) -> Result<()> {
        let generation = self.next_generation();
        let coordinator = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(coordinator.ttl).await;
            coordinator.expire_outgoing(conversation_id, generation).await;
        });
        if let Some(previous) = locked(&self.outgoing).insert(conversation_id, Timer { generation, task }) {
            previous.task.abort();
        }

        let row = TypingRow {
            conversation_id,
            user_id: self.user_id,
            updated_at: Utc::now(),
        };
        self.backend
            .upsert(
                tables::TYPING_INDICATORS,
                serde_json::to_value(&row)?,
                "conversation_id,user_id",
            )
            .await
            .context("failed to publish typing indicator")?;
        Ok(())
    }

    async fn expire_outgoing(&self, conversation_id: ConversationId, generation: u64) {
        {
            let mut outgoing = locked(&self.outgoing);
            match outgoing.get(&conversation_id) {
                Some(timer) if timer.generation == generation => {
                    outgoing.remove(&conversation_id);
                }
                _ => return,
            }
        }
        debug!(conversation_id = %conversation_id, "typing: quiet period elapsed");
        if let Err(err) = self.delete_own_record(conversation_id).await {
            warn!(conversation_id = %conversation_id, "typing: auto-clear failed: {err:#}");
        }
    }

    /// Clears the local user's indicator now and cancels the pending auto-clear.
    pub async fn stop_typing(&self, conversation_id: ConversationId) -> Result<()> {
        if let Some(timer) = locked(&self.outgoing).remove(&conversation_id) {
            timer.task.abort();
        }
        self.delete_own_record(conversation_id).await
    }

    async fn delete_own_record(&self, conversation_id: ConversationId) -> Result<()> {
        self.backend
            .delete(
                tables::TYPING_INDICATORS,
                &[
                    RowPredicate::eq("conversation_id", conversation_id),
                    RowPredicate::eq("user_id", self.user_id),
                ],
            )
            .await
            .context("failed to clear typing indicator")
    }

    /// Starts following other users' typing in `conversation_id`.
    pub async fn watch_conversation(self: &Arc<Self>, conversation_id: ConversationId) {
        if locked(&self.watches).contains_key(&conversation_id) {
            return;
        }
        let filter = ChangeFilter::table(tables::TYPING_INDICATORS)
            .matching(RowPredicate::eq("conversation_id", conversation_id));
        let handle = self
            .registry
            .acquire(&typing_topic(conversation_id), filter)
            .await;
        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(follow_feed(
            Arc::clone(self),
            conversation_id,
            handle,
            shutdown_rx,
        ));

        let duplicate = locked(&self.watches).insert(conversation_id, Watch { shutdown, task });
        if let Some(duplicate) = duplicate {
            let _ = duplicate.shutdown.send(());
        }
        info!(conversation_id = %conversation_id, "typing: watching conversation");
    }

    pub async fn unwatch_conversation(&self, conversation_id: ConversationId) {
        let watch = locked(&self.watches).remove(&conversation_id);
        if let Some(watch) = watch {
            let _ = watch.shutdown.send(());
            if let Err(err) = watch.task.await {
                warn!("typing: feed task ended abnormally: {err}");
            }
        }
        if let Some(entries) = locked(&self.observed).remove(&conversation_id) {
            for timer in entries.into_values() {
                timer.task.abort();
            }
        }
    }

    pub(crate) fn handle_change(self: &Arc<Self>, conversation_id: ConversationId, event: &ChangeEvent) {
        match event.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let row = match event.record_as::<TypingRow>() {
                    Ok(row) => row,
                    Err(err) => {
                        warn!("typing: ignoring malformed change: {err}");
                        return;
                    }
                };
                if row.user_id == self.user_id || row.conversation_id != conversation_id {
                    return;
                }
                self.observe(conversation_id, row.user_id);
            }
            ChangeKind::Delete => match event.old_record_as::<TypingKey>() {
                Ok(key) => self.forget(conversation_id, key.user_id),
                Err(err) => warn!("typing: ignoring malformed delete: {err}"),
            },
        }
    }

    fn observe(self: &Arc<Self>, conversation_id: ConversationId, user_id: UserId) {
        let generation = self.next_generation();
        let coordinator = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(coordinator.ttl).await;
            coordinator.expire_observed(conversation_id, user_id, generation);
        });
        let previous = locked(&self.observed)
            .entry(conversation_id)
            .or_default()
            .insert(user_id, Timer { generation, task });
        if let Some(previous) = previous {
            previous.task.abort();
        }
    }

    fn expire_observed(&self, conversation_id: ConversationId, user_id: UserId, generation: u64) {
        let mut observed = locked(&self.observed);
        let Some(entries) = observed.get_mut(&conversation_id) else {
            return;
        };
        if entries
            .get(&user_id)
            .is_some_and(|timer| timer.generation == generation)
        {
            entries.remove(&user_id);
            debug!(conversation_id = %conversation_id, user_id = %user_id, "typing: indicator expired locally");
        }
        if entries.is_empty() {
            observed.remove(&conversation_id);
        }
    }

    fn forget(&self, conversation_id: ConversationId, user_id: UserId) {
        let mut observed = locked(&self.observed);
        if let Some(entries) = observed.get_mut(&conversation_id) {
            if let Some(timer) = entries.remove(&user_id) {
                timer.task.abort();
            }
            if entries.is_empty() {
                observed.remove(&conversation_id);
            }
        }
    }

    pub fn typing_users_in(&self, conversation_id: ConversationId) -> Vec<UserId> {
        let mut users: Vec<UserId> = locked(&self.observed)
            .get(&conversation_id)
            .map(|entries| entries.keys().copied().collect())
            .unwrap_or_default();
        users.sort();
        users
    }

    /// Cancels every timer and feed. Indicators the local user still owns are
    /// cleared best-effort.
    pub async fn shutdown(&self) {
        let outgoing: Vec<(ConversationId, Timer)> = locked(&self.outgoing).drain().collect();
        for (conversation_id, timer) in outgoing {
            timer.task.abort();
            if let Err(err) = self.delete_own_record(conversation_id).await {
                debug!(conversation_id = %conversation_id, "typing: clear on shutdown lost: {err:#}");
            }
        }

        let watched: Vec<ConversationId> = locked(&self.watches).keys().copied().collect();
        for conversation_id in watched {
            self.unwatch_conversation(conversation_id).await;
        }

        for entries in locked(&self.observed).drain().map(|(_, entries)| entries) {
            for timer in entries.into_values() {
                timer.task.abort();
            }
        }
    }
}

async fn follow_feed(
    coordinator: Arc<TypingIndicatorCoordinator>,
    conversation_id: ConversationId,
    mut handle: TopicHandle,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let item = tokio::select! {
            _ = &mut shutdown => break,
            item = handle.next_event() => item,
        };
        match item {
            Some(Ok(FeedEvent::Change(event))) => coordinator.handle_change(conversation_id, &event),
            Some(Ok(FeedEvent::Broadcast(_))) => {}
            Some(Err(err @ SyncError::ReconnectExhausted { .. })) => {
                warn!(conversation_id = %conversation_id, "typing: feed unavailable: {err}");
                let Some(rejoined) = coordinator.registry.rejoin(handle, &mut shutdown).await else {
                    return;
                };
                handle = rejoined;
            }
            Some(Err(err)) => warn!(conversation_id = %conversation_id, "typing: feed unavailable: {err}"),
            None => break,
        }
    }
    coordinator.registry.release(handle).await;
}

#[cfg(test)]
#[path = "tests/typing_tests.rs"]
mod tests;
