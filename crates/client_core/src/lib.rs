use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use anyhow::{Context, Result};
use shared::{
    domain::{ConversationId, MessageId, PresenceStatus, UserId},
    protocol::ChangeFilter,
};
use tokio::{
    sync::{broadcast, watch},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod network;
pub mod notifications;
pub mod outbound_queue;
pub mod presence;
pub mod reconnect;
pub mod registry;
pub mod subscription;
pub mod typing;

pub use backend::{BackendClient, MissingBackend, RestBackend, RestBackendOptions};
pub use config::SyncConfig;
pub use error::SyncError;
pub use events::SyncEvent;
pub use network::NetworkMonitor;
pub use notifications::{
    DesktopNotification, MissingNotificationSink, NotificationDispatcher, NotificationPermission,
    NotificationSink,
};
pub use outbound_queue::{
    BackendMessageSender, MessageSender, OutboundMessageQueue, QueueStore, QueuedMessage,
    StorageQueueStore,
};
pub use presence::{PresenceTracker, Visibility};
pub use registry::{AggregateState, ConnectionRegistry, TopicHandle};
pub use subscription::{ConnectionState, FeedEvent};
pub use typing::TypingIndicatorCoordinator;

use notifications::NotificationOptions;
use outbound_queue::QueuePolicy;
use presence::PresenceOptions;
use reconnect::ReconnectPolicy;

const EVENT_BUS_CAPACITY: usize = 1024;

/// Components that only make sense for a signed-in user.
struct Session {
    user_id: UserId,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingIndicatorCoordinator>,
    notifications: Arc<NotificationDispatcher>,
}

/// Host-provided collaborators beyond the backend itself.
pub struct SyncDependencies {
    pub store: Arc<dyn QueueStore>,
    pub sender: Option<Arc<dyn MessageSender>>,
    pub notifications: Arc<dyn NotificationSink>,
    pub network: NetworkMonitor,
}

impl SyncDependencies {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self {
            store,
            sender: None,
            notifications: Arc::new(MissingNotificationSink),
            network: NetworkMonitor::default(),
        }
    }
}

/// One process-wide instance of the realtime layer with an explicit
/// `init`/`teardown` lifecycle.
pub struct RealtimeSync {
    registry: Arc<ConnectionRegistry>,
    queue: Arc<OutboundMessageQueue>,
    session: Option<Session>,
    network: NetworkMonitor,
    events: broadcast::Sender<SyncEvent>,
    queue_triggers: Mutex<Option<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl RealtimeSync {
    pub async fn init(
        backend: Arc<dyn BackendClient>,
        store: Arc<dyn QueueStore>,
        config: &SyncConfig,
    ) -> Result<Arc<Self>> {
        Self::init_with_dependencies(backend, SyncDependencies::new(store), config).await
    }

    pub async fn init_with_dependencies(
        backend: Arc<dyn BackendClient>,
        dependencies: SyncDependencies,
        config: &SyncConfig,
    ) -> Result<Arc<Self>> {
        let SyncDependencies {
            store,
            sender,
            notifications: sink,
            network,
        } = dependencies;
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);

        let registry = Arc::new(ConnectionRegistry::new(
            Arc::clone(&backend),
            ReconnectPolicy::from_config(config),
            network.clone(),
            events.clone(),
        ));

        let sender =
            sender.unwrap_or_else(|| Arc::new(BackendMessageSender::new(Arc::clone(&backend))));
        let queue = OutboundMessageQueue::load(
            sender,
            store,
            network.clone(),
            QueuePolicy::from_config(config),
            events.clone(),
        )
        .await?;
        let queue_triggers = queue.spawn_triggers();
        if !queue.is_empty().await {
            let restored = Arc::clone(&queue);
            tokio::spawn(async move {
                restored.drain().await;
            });
        }

        let user = backend
            .current_user()
            .await
            .context("failed to read the current session")?;
        let session = match user {
            Some(user) => {
                let presence = PresenceTracker::new(
                    Arc::clone(&backend),
                    Arc::clone(&registry),
                    user.id,
                    PresenceOptions::from_config(config),
                );
                presence.start().await;
                let typing = TypingIndicatorCoordinator::new(
                    Arc::clone(&backend),
                    Arc::clone(&registry),
                    user.id,
                    config.typing_ttl(),
                );
                let notifications = NotificationDispatcher::new(
                    Arc::clone(&backend),
                    Arc::clone(&registry),
                    sink,
                    events.clone(),
                    NotificationOptions::from_config(config),
                );
                notifications.start(user.id).await;
                Some(Session {
                    user_id: user.id,
                    presence,
                    typing,
                    notifications,
                })
            }
            None => {
                warn!("sync: no signed-in user; presence, typing and notifications are disabled");
                None
            }
        };

        info!(
            user_id = ?session.as_ref().map(|session| session.user_id),
            "sync: realtime layer initialized"
        );
        Ok(Arc::new(Self {
            registry,
            queue,
            session,
            network,
            events,
            queue_triggers: Mutex::new(Some(queue_triggers)),
            torn_down: AtomicBool::new(false),
        }))
    }

    fn session(&self) -> Result<&Session, SyncError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(SyncError::Shutdown);
        }
        self.session.as_ref().ok_or(SyncError::NotAuthenticated)
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.session.as_ref().map(|session| session.user_id)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn connection_state(&self) -> watch::Receiver<AggregateState> {
        self.registry.connection_state()
    }

    pub fn network(&self) -> NetworkMonitor {
        self.network.clone()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Opens (or joins) the feed for `topic`. Pair with [`Self::release_topic`].
    pub async fn use_realtime_topic(
        &self,
        topic: &str,
        filter: ChangeFilter,
    ) -> Result<TopicHandle, SyncError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(SyncError::Shutdown);
        }
        Ok(self.registry.acquire(topic, filter).await)
    }

    pub async fn release_topic(&self, handle: TopicHandle) {
        self.registry.release(handle).await;
    }

    /// Queues a message for delivery. Sending also ends the local typing
    /// indicator for that conversation.
    pub async fn enqueue_outbound_message(
        &self,
        conversation_id: ConversationId,
        content: impl Into<String>,
    ) -> Result<MessageId, SyncError> {
        if self.torn_down.load(Ordering::Acquire) {
            return Err(SyncError::Shutdown);
        }
        if let Some(session) = &self.session {
            if session.typing.is_typing_in(conversation_id) {
                if let Err(err) = session.typing.stop_typing(conversation_id).await {
                    warn!(conversation_id = %conversation_id, "sync: failed to clear typing on send: {err:#}");
                }
            }
        }
        Ok(self.queue.enqueue(conversation_id, content).await)
    }

    pub fn queued_count(&self) -> watch::Receiver<usize> {
        self.queue.queued_count()
    }

    pub fn outbound_queue(&self) -> &Arc<OutboundMessageQueue> {
        &self.queue
    }

    pub fn presence_of(&self, user_id: UserId) -> PresenceStatus {
        match &self.session {
            Some(session) => session.presence.presence_of(user_id),
            None => PresenceStatus::Offline,
        }
    }

    pub async fn set_status(&self, status: PresenceStatus) -> Result<()> {
        self.session()?.presence.set_status(status).await
    }

    pub async fn set_visibility(&self, visibility: Visibility) -> Result<()> {
        self.session()?.presence.set_visibility(visibility).await
    }

    pub fn typing_users_in(&self, conversation_id: ConversationId) -> Vec<UserId> {
        match &self.session {
            Some(session) => session.typing.typing_users_in(conversation_id),
            None => Vec::new(),
        }
    }

    pub async fn watch_typing(&self, conversation_id: ConversationId) -> Result<(), SyncError> {
        self.session()?
            .typing
            .watch_conversation(conversation_id)
            .await;
        Ok(())
    }

    pub async fn unwatch_typing(&self, conversation_id: ConversationId) {
        if let Some(session) = &self.session {
            session.typing.unwatch_conversation(conversation_id).await;
        }
    }

    pub async fn notify_typing(&self, conversation_id: ConversationId) -> Result<()> {
        self.session()?.typing.start_typing(conversation_id).await
    }

    pub async fn stop_typing(&self, conversation_id: ConversationId) -> Result<()> {
        self.session()?.typing.stop_typing(conversation_id).await
    }

    pub async fn notification_clicked(&self, tag: &str) -> bool {
        match &self.session {
            Some(session) => session.notifications.clicked(tag).await,
            None => false,
        }
    }

    /// Stops every component. Pending queue entries stay persisted for the
    /// next `init`.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let triggers = match self.queue_triggers.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(triggers) = triggers {
            triggers.abort();
        }
        if let Some(session) = &self.session {
            session.notifications.shutdown().await;
            session.typing.shutdown().await;
            session.presence.shutdown().await;
        }
        self.registry.teardown().await;
        info!("sync: realtime layer torn down");
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
