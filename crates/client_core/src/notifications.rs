//! Desktop notifications for mentions and direct messages addressed to the
//! signed-in user, independent of which conversation is on screen.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use shared::{
    domain::{ConversationId, UserId},
    protocol::{
        tables, ChangeEvent, ChangeFilter, DirectMessageRow, EventFilter, MentionRow, ProfileRow,
        RowPredicate,
    },
};
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    backend::BackendClient,
    config::SyncConfig,
    error::SyncError,
    events::SyncEvent,
    registry::{ConnectionRegistry, TopicHandle},
    subscription::FeedEvent,
};

const RECENT_TAG_CAPACITY: usize = 512;
const UNKNOWN_SENDER: &str = "Someone";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPermission {
    Granted,
    Denied,
    /// Not asked yet.
    Default,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesktopNotification {
    pub tag: String,
    pub title: String,
    pub body: String,
    pub conversation_id: ConversationId,
}

/// Host notification primitive.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    fn permission(&self) -> NotificationPermission;
    async fn request_permission(&self) -> NotificationPermission;
    async fn show(&self, notification: &DesktopNotification) -> Result<()>;
    async fn dismiss(&self, tag: &str) -> Result<()>;
}

pub struct MissingNotificationSink;

#[async_trait]
impl NotificationSink for MissingNotificationSink {
    fn permission(&self) -> NotificationPermission {
        NotificationPermission::Denied
    }

    async fn request_permission(&self) -> NotificationPermission {
        NotificationPermission::Denied
    }

    async fn show(&self, _notification: &DesktopNotification) -> Result<()> {
        Ok(())
    }

    async fn dismiss(&self, _tag: &str) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Source {
    Mention,
    DirectMessage,
}

impl Source {
    fn topic(self, user_id: UserId) -> String {
        match self {
            Self::Mention => format!("mentions:{user_id}"),
            Self::DirectMessage => format!("direct_messages:{user_id}"),
        }
    }

    fn filter(self, user_id: UserId) -> ChangeFilter {
        match self {
            Self::Mention => ChangeFilter::table(tables::MENTIONS)
                .on(EventFilter::Insert)
                .matching(RowPredicate::eq("mentioned_user_id", user_id)),
            Self::DirectMessage => ChangeFilter::table(tables::DIRECT_MESSAGES)
                .on(EventFilter::Insert)
                .matching(RowPredicate::eq("recipient_id", user_id)),
        }
    }
}

struct Incoming {
    tag: String,
    sender_id: UserId,
    conversation_id: ConversationId,
    content: Option<String>,
    source: Source,
}

impl Incoming {
    fn parse(source: Source, event: &ChangeEvent) -> serde_json::Result<Self> {
        Ok(match source {
            Source::Mention => {
                let row: MentionRow = event.record_as()?;
                Self {
                    tag: format!("mention-{}", row.id),
                    sender_id: row.sender_id,
                    conversation_id: row.conversation_id,
                    content: row.content,
                    source,
                }
            }
            Source::DirectMessage => {
                let row: DirectMessageRow = event.record_as()?;
                Self {
                    tag: format!("dm-{}", row.id),
                    sender_id: row.sender_id,
                    conversation_id: row.conversation_id,
                    content: Some(row.content),
                    source,
                }
            }
        })
    }
}

/// Bounded memory of tags already shown.
#[derive(Default)]
struct RecentTags {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl RecentTags {
    /// Returns false if `tag` was already recorded.
    fn insert(&mut self, tag: &str) -> bool {
        if !self.seen.insert(tag.to_string()) {
            return false;
        }
        self.order.push_back(tag.to_string());
        while self.order.len() > RECENT_TAG_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }
}

pub fn truncate_body(body: &str, max_chars: usize) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= max_chars {
        return trimmed.to_string();
    }
    let mut truncated: String = trimmed.chars().take(max_chars).collect();
    truncated.push('…');
    truncated
}

#[derive(Debug, Clone, Copy)]
pub struct NotificationOptions {
    pub auto_dismiss: Duration,
    pub body_max_chars: usize,
}

impl NotificationOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            auto_dismiss: config.notification_auto_dismiss(),
            body_max_chars: config.notification_body_max_chars,
        }
    }
}

struct Feed {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

struct Shown {
    conversation_id: ConversationId,
    dismiss: JoinHandle<()>,
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct NotificationDispatcher {
    backend: Arc<dyn BackendClient>,
    registry: Arc<ConnectionRegistry>,
    sink: Arc<dyn NotificationSink>,
    events: broadcast::Sender<SyncEvent>,
    options: NotificationOptions,
    user_id: Mutex<Option<UserId>>,
    recent: Mutex<RecentTags>,
    shown: Mutex<HashMap<String, Shown>>,
    feeds: Mutex<Vec<Feed>>,
}

impl NotificationDispatcher {
    pub fn new(
        backend: Arc<dyn BackendClient>,
        registry: Arc<ConnectionRegistry>,
        sink: Arc<dyn NotificationSink>,
        events: broadcast::Sender<SyncEvent>,
        options: NotificationOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            registry,
            sink,
            events,
            options,
            user_id: Mutex::new(None),
            recent: Mutex::new(RecentTags::default()),
            shown: Mutex::new(HashMap::new()),
            feeds: Mutex::new(Vec::new()),
        })
    }

    /// Follows mentions of and direct messages to `user_id`. Does nothing
    /// unless the host grants notification permission.
    pub async fn start(self: &Arc<Self>, user_id: UserId) -> bool {
        let mut permission = self.sink.permission();
        if permission == NotificationPermission::Default {
            permission = self.sink.request_permission().await;
        }
        if permission != NotificationPermission::Granted {
            info!(?permission, "notify: permission not granted; notifications disabled");
            return false;
        }

        *locked(&self.user_id) = Some(user_id);
        for source in [Source::Mention, Source::DirectMessage] {
            let handle = self
                .registry
                .acquire(&source.topic(user_id), source.filter(user_id))
                .await;
            let (shutdown, shutdown_rx) = oneshot::channel();
            let task = tokio::spawn(follow_feed(Arc::clone(self), source, handle, shutdown_rx));
            locked(&self.feeds).push(Feed { shutdown, task });
        }
        info!(user_id = %user_id, "notify: listening for mentions and direct messages");
        true
    }

    async fn handle_change(self: &Arc<Self>, source: Source, event: &ChangeEvent) {
        let incoming = match Incoming::parse(source, event) {
            Ok(incoming) => incoming,
            Err(err) => {
                warn!(?source, "notify: ignoring malformed row: {err}");
                return;
            }
        };
        if Some(incoming.sender_id) == *locked(&self.user_id) {
            return;
        }
        if self.sink.permission() != NotificationPermission::Granted {
            return;
        }
        if !locked(&self.recent).insert(&incoming.tag) {
            debug!(tag = %incoming.tag, "notify: duplicate event suppressed");
            return;
        }

        let sender = self.sender_name(incoming.sender_id).await;
        let (title, body) = match incoming.source {
            Source::Mention => (
                format!("{sender} mentioned you"),
                incoming
                    .content
                    .as_deref()
                    .map(|content| truncate_body(content, self.options.body_max_chars))
                    .unwrap_or_default(),
            ),
            Source::DirectMessage => (
                format!("New message from {sender}"),
                truncate_body(
                    incoming.content.as_deref().unwrap_or_default(),
                    self.options.body_max_chars,
                ),
            ),
        };
        let notification = DesktopNotification {
            tag: incoming.tag,
            title,
            body,
            conversation_id: incoming.conversation_id,
        };

        if let Err(err) = self.sink.show(&notification).await {
            warn!(tag = %notification.tag, "notify: failed to show notification: {err:#}");
            return;
        }
        self.schedule_dismiss(notification.tag, notification.conversation_id);
    }

    async fn sender_name(&self, sender_id: UserId) -> String {
        let rows = match self
            .backend
            .select(tables::PROFILES, &[RowPredicate::eq("id", sender_id)])
            .await
        {
            Ok(rows) => rows,
            Err(err) => {
                debug!(sender_id = %sender_id, "notify: profile lookup failed: {err:#}");
                return UNKNOWN_SENDER.to_string();
            }
        };
        rows.into_iter()
            .find_map(|row| serde_json::from_value::<ProfileRow>(row).ok())
            .and_then(|profile| profile.label().map(str::to_string))
            .unwrap_or_else(|| UNKNOWN_SENDER.to_string())
    }

    fn schedule_dismiss(self: &Arc<Self>, tag: String, conversation_id: ConversationId) {
        let dispatcher = Arc::clone(self);
        let dismiss_tag = tag.clone();
        let dismiss = tokio::spawn(async move {
            tokio::time::sleep(dispatcher.options.auto_dismiss).await;
            if locked(&dispatcher.shown).remove(&dismiss_tag).is_none() {
                return;
            }
            if let Err(err) = dispatcher.sink.dismiss(&dismiss_tag).await {
                debug!(tag = %dismiss_tag, "notify: auto-dismiss failed: {err:#}");
            }
        });
        let previous = locked(&self.shown).insert(
            tag,
            Shown {
                conversation_id,
                dismiss,
            },
        );
        if let Some(previous) = previous {
            previous.dismiss.abort();
        }
    }

    /// The user activated the notification tagged `tag`: close it and ask
    /// the app to open its conversation.
    pub async fn clicked(&self, tag: &str) -> bool {
        let Some(shown) = locked(&self.shown).remove(tag) else {
            return false;
        };
        shown.dismiss.abort();
        if let Err(err) = self.sink.dismiss(tag).await {
            debug!(tag, "notify: dismiss after click failed: {err:#}");
        }
        let _ = self.events.send(SyncEvent::NavigateTo {
            conversation_id: shown.conversation_id,
        });
        true
    }

    pub async fn shutdown(&self) {
        let feeds: Vec<Feed> = locked(&self.feeds).drain(..).collect();
        for feed in feeds {
            let _ = feed.shutdown.send(());
            if let Err(err) = feed.task.await {
                warn!("notify: feed task ended abnormally: {err}");
            }
        }
        for (_, shown) in locked(&self.shown).drain() {
            shown.dismiss.abort();
        }
    }
}

async fn follow_feed(
    dispatcher: Arc<NotificationDispatcher>,
    source: Source,
    mut handle: TopicHandle,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        let item = tokio::select! {
            _ = &mut shutdown => break,
            item = handle.next_event() => item,
        };
        match item {
            Some(Ok(FeedEvent::Change(event))) => dispatcher.handle_change(source, &event).await,
            Some(Ok(FeedEvent::Broadcast(_))) => {}
            Some(Err(err @ SyncError::ReconnectExhausted { .. })) => {
                warn!(?source, "notify: feed unavailable: {err}");
                let Some(rejoined) = dispatcher.registry.rejoin(handle, &mut shutdown).await else {
                    return;
                };
                handle = rejoined;
            }
            Some(Err(err)) => warn!(?source, "notify: feed unavailable: {err}"),
            None => break,
        }
    }
    dispatcher.registry.release(handle).await;
}

#[cfg(test)]
#[path = "tests/notifications_tests.rs"]
mod tests;
