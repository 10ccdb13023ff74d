//! Process-wide map from topic name to live change-feed subscription.
//!
//! `acquire` is idempotent per topic: later callers join the existing
//! transport subscription as additional listeners, and the transport is torn
//! down only when the last listener releases.

use std::{
    collections::HashMap,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex as StdMutex, Weak,
    },
    task::{Context, Poll},
};

use anyhow::Result;
use futures::{Stream, StreamExt};
use shared::protocol::{BroadcastMessage, ChangeFilter};
use tokio::sync::{broadcast, oneshot, watch, Mutex};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::{
    backend::BackendClient,
    events::SyncEvent,
    network::NetworkMonitor,
    reconnect::{ConnectionObserver, ReconnectPolicy, ReconnectSupervisor},
    subscription::{ChangeFeedSubscription, ConnectionState, ListenerId, ListenerItem},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateState {
    /// Nothing tracked.
    Idle,
    /// At least one subscription is connecting, reconnecting or disconnected.
    Connecting,
    Connected,
    Failed,
}

impl AggregateState {
    fn from_states<'a>(states: impl Iterator<Item = &'a ConnectionState>) -> Self {
        let mut seen_any = false;
        let mut all_connected = true;
        for state in states {
            seen_any = true;
            match state {
                ConnectionState::Failed => return Self::Failed,
                ConnectionState::Connected => {}
                _ => all_connected = false,
            }
        }
        match (seen_any, all_connected) {
            (false, _) => Self::Idle,
            (true, true) => Self::Connected,
            (true, false) => Self::Connecting,
        }
    }
}

struct StateBoard {
    states: StdMutex<HashMap<String, (u64, ConnectionState)>>,
    aggregate: watch::Sender<AggregateState>,
    events: broadcast::Sender<SyncEvent>,
}

impl StateBoard {
    fn with_states<R>(&self, f: impl FnOnce(&mut HashMap<String, (u64, ConnectionState)>) -> R) -> R {
        let mut guard = match self.states.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let result = f(&mut guard);
        let next = AggregateState::from_states(guard.values().map(|(_, state)| state));
        drop(guard);
        let changed = self.aggregate.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if changed {
            info!(state = ?next, "realtime: aggregate connection state changed");
            let _ = self.events.send(SyncEvent::ConnectionStateChanged(next));
        }
        result
    }

    fn track(&self, topic: &str, generation: u64) {
        self.with_states(|states| {
            states.insert(topic.to_string(), (generation, ConnectionState::Connecting));
        });
    }

    fn forget(&self, topic: &str, generation: u64) {
        self.with_states(|states| {
            if states.get(topic).is_some_and(|(current, _)| *current == generation) {
                states.remove(topic);
            }
        });
    }

    fn clear(&self) {
        self.with_states(HashMap::clear);
    }
}

impl ConnectionObserver for StateBoard {
    fn on_state(&self, topic: &str, generation: u64, state: ConnectionState) {
        let tracked = self.with_states(|states| match states.get_mut(topic) {
            Some((current, slot)) if *current == generation => {
                *slot = state;
                true
            }
            _ => false,
        });
        if tracked {
            let _ = self.events.send(SyncEvent::TopicStateChanged {
                topic: topic.to_string(),
                state,
            });
        }
    }

    fn on_failed(&self, topic: &str, generation: u64, attempts: u32) {
        let tracked = self.with_states(|states| {
            states
                .get(topic)
                .is_some_and(|(current, _)| *current == generation)
        });
        if tracked {
            let _ = self.events.send(SyncEvent::SubscriptionFailed {
                topic: topic.to_string(),
                attempts,
            });
        }
    }
}

struct TopicEntry {
    subscription: Arc<ChangeFeedSubscription>,
    supervisor: ReconnectSupervisor,
    generation: u64,
}

/// State shared between the registry and the handles it gives out, so a
/// dropped handle can still release its listener.
struct Topics {
    entries: Mutex<HashMap<String, TopicEntry>>,
    board: Arc<StateBoard>,
}

impl Topics {
    async fn release_listener(
        &self,
        topic: &str,
        listener_id: ListenerId,
        subscription: &Arc<ChangeFeedSubscription>,
    ) {
        let entry = {
            let mut entries = self.entries.lock().await;
            let Some(entry) = entries.get(topic) else {
                return;
            };
            if !Arc::ptr_eq(&entry.subscription, subscription) {
                return;
            }
            // The listener may already be gone if dispatch saw its receiver closed.
            if entry.subscription.remove_listener(listener_id) > 0 {
                return;
            }
            match entries.remove(topic) {
                Some(entry) => entry,
                None => return,
            }
        };

        self.board.forget(topic, entry.generation);
        entry.supervisor.stop().await;
        info!(topic, "realtime: topic closed");
    }
}

/// A consumer's view of one topic: an event stream plus connection state.
///
/// Dropping a handle without [`ConnectionRegistry::release`] releases it in
/// the background.
pub struct TopicHandle {
    topic: String,
    listener_id: ListenerId,
    events: UnboundedReceiverStream<ListenerItem>,
    subscription: Arc<ChangeFeedSubscription>,
    topics: Weak<Topics>,
    released: bool,
}

impl TopicHandle {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> ConnectionState {
        self.subscription.state()
    }

    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.subscription.watch_state()
    }

    pub async fn broadcast(&self, message: BroadcastMessage) -> Result<()> {
        self.subscription.broadcast(message).await
    }

    pub async fn next_event(&mut self) -> Option<ListenerItem> {
        self.events.next().await
    }
}

impl Stream for TopicHandle {
    type Item = ListenerItem;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl Drop for TopicHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(topics) = self.topics.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(topic = %self.topic, "realtime: handle dropped outside a runtime; topic left open");
            return;
        };
        let topic = self.topic.clone();
        let listener_id = self.listener_id;
        let subscription = Arc::clone(&self.subscription);
        debug!(topic = %topic, listener_id, "realtime: releasing dropped handle");
        runtime.spawn(async move {
            topics
                .release_listener(&topic, listener_id, &subscription)
                .await;
        });
    }
}

pub struct ConnectionRegistry {
    backend: Arc<dyn BackendClient>,
    policy: ReconnectPolicy,
    topics: Arc<Topics>,
    network: NetworkMonitor,
    next_listener: AtomicU64,
    next_generation: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        policy: ReconnectPolicy,
        network: NetworkMonitor,
        events: broadcast::Sender<SyncEvent>,
    ) -> Self {
        let (aggregate, _) = watch::channel(AggregateState::Idle);
        Self {
            backend,
            policy,
            topics: Arc::new(Topics {
                entries: Mutex::new(HashMap::new()),
                board: Arc::new(StateBoard {
                    states: StdMutex::new(HashMap::new()),
                    aggregate,
                    events,
                }),
            }),
            network,
            next_listener: AtomicU64::new(1),
            next_generation: AtomicU64::new(1),
        }
    }

    pub fn network(&self) -> NetworkMonitor {
        self.network.clone()
    }

    pub fn connection_state(&self) -> watch::Receiver<AggregateState> {
        self.topics.board.aggregate.subscribe()
    }

    fn spawn_supervisor(
        &self,
        subscription: &Arc<ChangeFeedSubscription>,
        generation: u64,
    ) -> ReconnectSupervisor {
        let observer: Arc<dyn ConnectionObserver> = self.topics.board.clone();
        ReconnectSupervisor::spawn(
            Arc::clone(&self.backend),
            Arc::clone(subscription),
            self.policy,
            observer,
            generation,
        )
    }

    fn handle_for(
        &self,
        topic: &str,
        listener_id: ListenerId,
        subscription: &Arc<ChangeFeedSubscription>,
    ) -> TopicHandle {
        let rx = subscription.add_listener(listener_id);
        TopicHandle {
            topic: topic.to_string(),
            listener_id,
            events: UnboundedReceiverStream::new(rx),
            subscription: Arc::clone(subscription),
            topics: Arc::downgrade(&self.topics),
            released: false,
        }
    }

    pub async fn acquire(&self, topic: &str, filter: ChangeFilter) -> TopicHandle {
        let listener_id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        let board = &self.topics.board;
        let mut entries = self.topics.entries.lock().await;

        if let Some(entry) = entries.get_mut(topic) {
            if entry.subscription.filter() != &filter {
                warn!(topic, "realtime: topic already open with a different filter; reusing it");
            }
            if entry.subscription.state() == ConnectionState::Failed || entry.supervisor.is_finished() {
                let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
                info!(topic, "realtime: restarting failed subscription");
                board.track(topic, generation);
                entry.subscription.set_state(ConnectionState::Connecting);
                entry.generation = generation;
                entry.supervisor = self.spawn_supervisor(&entry.subscription, generation);
            }
            return self.handle_for(topic, listener_id, &entry.subscription);
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let subscription = Arc::new(ChangeFeedSubscription::new(topic, filter));
        let handle = self.handle_for(topic, listener_id, &subscription);
        board.track(topic, generation);
        let supervisor = self.spawn_supervisor(&subscription, generation);
        entries.insert(
            topic.to_string(),
            TopicEntry {
                subscription,
                supervisor,
                generation,
            },
        );
        info!(topic, "realtime: topic opened");
        handle
    }

    pub async fn release(&self, mut handle: TopicHandle) {
        handle.released = true;
        self.topics
            .release_listener(&handle.topic, handle.listener_id, &handle.subscription)
            .await;
    }

    /// Recovers a topic whose reconnect attempts ran out. Waits for the next
    /// offline-to-online transition or the policy's rejoin interval, then
    /// releases `handle` and acquires the topic again with the same filter.
    /// Returns `None`, with the handle released, if `cancel` resolves first.
    pub async fn rejoin(
        &self,
        handle: TopicHandle,
        cancel: &mut oneshot::Receiver<()>,
    ) -> Option<TopicHandle> {
        let mut online = self.network.subscribe();
        let mut watching = true;
        let retry_at = tokio::time::sleep(self.policy.rejoin_interval);
        tokio::pin!(retry_at);
        loop {
            tokio::select! {
                _ = &mut *cancel => {
                    self.release(handle).await;
                    return None;
                }
                _ = &mut retry_at => break,
                changed = online.changed(), if watching => match changed {
                    Ok(()) => {
                        if *online.borrow_and_update() {
                            break;
                        }
                    }
                    Err(_) => watching = false,
                },
            }
        }

        let topic = handle.topic.clone();
        let filter = handle.subscription.filter().clone();
        self.release(handle).await;
        info!(topic = %topic, "realtime: rejoining topic after terminal failure");
        Some(self.acquire(&topic, filter).await)
    }

    pub async fn teardown(&self) {
        let entries: Vec<(String, TopicEntry)> =
            self.topics.entries.lock().await.drain().collect();
        self.topics.board.clear();
        for (topic, entry) in entries {
            entry.supervisor.stop().await;
            info!(topic = %topic, "realtime: topic closed during teardown");
        }
    }

    pub async fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.entries.lock().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub async fn listener_count(&self, topic: &str) -> usize {
        self.topics
            .entries
            .lock()
            .await
            .get(topic)
            .map(|entry| entry.subscription.listener_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
#[path = "tests/registry_tests.rs"]
mod tests;
