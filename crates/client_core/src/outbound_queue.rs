//! Durable FIFO of outbound chat messages awaiting backend confirmation.
//!
//! Every trigger (enqueue, coming back online, the periodic sweep) funnels into
//! [`OutboundMessageQueue::drain`], which runs at most one pass at a time.

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationId, MessageId},
    protocol::{tables, OutboundMessageRow},
};
use storage::Storage;
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
    time::MissedTickBehavior,
};
use tracing::{debug, error, info, warn};

use crate::{
    backend::BackendClient,
    config::SyncConfig,
    error::{is_permission_error, SyncError},
    events::SyncEvent,
    network::NetworkMonitor,
};

pub const QUEUE_STORAGE_KEY: &str = "outbound_queue";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub retry_count: u32,
}

#[async_trait]
pub trait MessageSender: Send + Sync {
    async fn send(&self, message: &QueuedMessage) -> Result<()>;
}

/// Writes queued messages to the `messages` table, keyed by the locally
/// generated id so a resend of an already stored row is a no-op.
pub struct BackendMessageSender {
    backend: Arc<dyn BackendClient>,
}

impl BackendMessageSender {
    pub fn new(backend: Arc<dyn BackendClient>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl MessageSender for BackendMessageSender {
    async fn send(&self, message: &QueuedMessage) -> Result<()> {
        let user = self
            .backend
            .current_user()
            .await?
            .ok_or(SyncError::NotAuthenticated)?;
        let row = OutboundMessageRow {
            id: message.id,
            conversation_id: message.conversation_id,
            sender_id: user.id,
            content: message.content.clone(),
            created_at: message.created_at,
        };
        self.backend
            .upsert(tables::MESSAGES, serde_json::to_value(&row)?, "id")
            .await
            .with_context(|| format!("failed to store message {}", message.id))?;
        Ok(())
    }
}

#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load(&self) -> Result<Vec<QueuedMessage>>;
    async fn save(&self, messages: &[QueuedMessage]) -> Result<()>;
}

pub struct StorageQueueStore {
    storage: Storage,
    namespace: String,
}

impl StorageQueueStore {
    pub fn new(storage: Storage, namespace: impl Into<String>) -> Self {
        Self {
            storage,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl QueueStore for StorageQueueStore {
    async fn load(&self) -> Result<Vec<QueuedMessage>> {
        let Some(raw) = self.storage.get(&self.namespace, QUEUE_STORAGE_KEY).await? else {
            return Ok(Vec::new());
        };
        match serde_json::from_str(&raw) {
            Ok(messages) => Ok(messages),
            Err(err) => {
                warn!(namespace = %self.namespace, "queue: discarding unreadable persisted queue: {err}");
                Ok(Vec::new())
            }
        }
    }

    async fn save(&self, messages: &[QueuedMessage]) -> Result<()> {
        self.storage
            .set_json(&self.namespace, QUEUE_STORAGE_KEY, messages)
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuePolicy {
    pub max_retries: u32,
    pub inter_message_delay: Duration,
    pub retry_interval: Duration,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl QueuePolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.queue_max_retries.max(1),
            inter_message_delay: config.queue_inter_message_delay(),
            retry_interval: config.queue_retry_interval(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DrainSummary {
    pub delivered: usize,
    pub retried: usize,
    pub dropped: usize,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct OutboundMessageQueue {
    sender: Arc<dyn MessageSender>,
    store: Arc<dyn QueueStore>,
    network: NetworkMonitor,
    policy: QueuePolicy,
    messages: Mutex<Vec<QueuedMessage>>,
    draining: AtomicBool,
    count: watch::Sender<usize>,
    events: broadcast::Sender<SyncEvent>,
}

impl OutboundMessageQueue {
    /// Restores whatever a previous process left behind in `store`.
    pub async fn load(
        sender: Arc<dyn MessageSender>,
        store: Arc<dyn QueueStore>,
        network: NetworkMonitor,
        policy: QueuePolicy,
        events: broadcast::Sender<SyncEvent>,
    ) -> Result<Arc<Self>> {
        let messages = store
            .load()
            .await
            .context("failed to restore outbound queue")?;
        if !messages.is_empty() {
            info!(count = messages.len(), "queue: restored pending messages");
        }
        let (count, _) = watch::channel(messages.len());
        Ok(Arc::new(Self {
            sender,
            store,
            network,
            policy,
            messages: Mutex::new(messages),
            draining: AtomicBool::new(false),
            count,
            events,
        }))
    }

    pub fn queued_count(&self) -> watch::Receiver<usize> {
        self.count.subscribe()
    }

    pub async fn len(&self) -> usize {
        self.messages.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn snapshot(&self) -> Vec<QueuedMessage> {
        self.messages.lock().await.clone()
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Appends a message, persists the queue and schedules a drain. Never fails;
    /// a persistence error is logged and the message stays queued in memory.
    pub async fn enqueue(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        content: impl Into<String>,
    ) -> MessageId {
        let message = QueuedMessage {
            id: MessageId::random(),
            conversation_id,
            content: content.into(),
            created_at: Utc::now(),
            retry_count: 0,
        };
        let id = message.id;
        self.mutate(|queue| queue.push(message)).await;
        debug!(message_id = %id, conversation_id = %conversation_id, "queue: message enqueued");

        let queue = Arc::clone(self);
        tokio::spawn(async move {
            queue.drain().await;
        });
        id
    }

    async fn mutate(&self, apply: impl FnOnce(&mut Vec<QueuedMessage>)) {
        let mut messages = self.messages.lock().await;
        apply(&mut messages);
        // Persist under the lock so saves land in mutation order.
        if let Err(err) = self.store.save(&messages).await {
            error!("queue: failed to persist outbound queue: {err:#}");
        }
        let len = messages.len();
        drop(messages);
        self.count.send_if_modified(|current| {
            if *current == len {
                return false;
            }
            *current = len;
            true
        });
    }

    /// Runs one pass over the queue. Returns `None` when the pass was skipped
    /// because another is running, the network is offline, or nothing is queued.
    pub async fn drain(&self) -> Option<DrainSummary> {
        if self
            .draining
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("queue: drain already in progress");
            return None;
        }
        let _guard = DrainGuard(&self.draining);

        if !self.network.is_online() {
            debug!("queue: offline; drain skipped");
            return None;
        }
        let mut attempted = HashSet::new();
        let mut summary = DrainSummary::default();
        // Messages enqueued while a pass is running join the same pass.
        'pass: loop {
            let pending: Vec<QueuedMessage> = self
                .messages
                .lock()
                .await
                .iter()
                .filter(|queued| !attempted.contains(&queued.id))
                .cloned()
                .collect();
            if pending.is_empty() {
                break;
            }
            if attempted.is_empty() {
                info!(count = pending.len(), "queue: draining outbound messages");
            } else {
                debug!(count = pending.len(), "queue: picking up messages enqueued mid-drain");
            }

            for message in &pending {
                if !attempted.is_empty() {
                    tokio::time::sleep(self.policy.inter_message_delay).await;
                }
                if !self.network.is_online() {
                    info!("queue: went offline; stopping drain early");
                    break 'pass;
                }
                attempted.insert(message.id);

                match self.sender.send(message).await {
                    Ok(()) => {
                        self.mutate(|queue| queue.retain(|queued| queued.id != message.id))
                            .await;
                        summary.delivered += 1;
                        info!(message_id = %message.id, "queue: message delivered");
                        let _ = self.events.send(SyncEvent::MessageDelivered {
                            message_id: message.id,
                            conversation_id: message.conversation_id,
                        });
                    }
                    Err(err) => {
                        let attempts = message.retry_count + 1;
                        let permanent =
                            attempts >= self.policy.max_retries || is_permission_error(&err);
                        if permanent {
                            self.mutate(|queue| queue.retain(|queued| queued.id != message.id))
                                .await;
                            summary.dropped += 1;
                            let reason = format!("{err:#}");
                            let failure = SyncError::DeliveryFailed {
                                message_id: message.id,
                                conversation_id: message.conversation_id,
                                attempts,
                                reason: reason.clone(),
                            };
                            warn!(message_id = %message.id, attempts, "queue: {failure}");
                            let _ = self.events.send(SyncEvent::MessageFailed {
                                message_id: message.id,
                                conversation_id: message.conversation_id,
                                attempts,
                                reason,
                            });
                        } else {
                            self.mutate(|queue| {
                                if let Some(queued) = queue.iter_mut().find(|queued| queued.id == message.id) {
                                    queued.retry_count = attempts;
                                }
                            })
                            .await;
                            summary.retried += 1;
                            warn!(
                                message_id = %message.id,
                                attempts,
                                max_retries = self.policy.max_retries,
                                "queue: delivery failed; will retry: {err:#}"
                            );
                        }
                    }
                }
            }
        }
        if attempted.is_empty() {
            return None;
        }
        Some(summary)
    }

    /// Drains on every offline-to-online transition and on a fixed interval.
    pub fn spawn_triggers(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            let mut online = queue.network.subscribe();
            let period = queue.policy.retry_interval;
            let mut sweep = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = online.changed() => {
                        if changed.is_err() {
                            return;
                        }
                        let is_online = *online.borrow_and_update();
                        if is_online {
                            queue.drain().await;
                        }
                    }
                    _ = sweep.tick() => {
                        queue.drain().await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
#[path = "tests/outbound_queue_tests.rs"]
mod tests;
