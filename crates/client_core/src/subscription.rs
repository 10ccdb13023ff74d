use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use anyhow::Result;
use shared::protocol::{BroadcastMessage, ChangeEvent, ChangeFilter};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::{backend::FeedControl, error::SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Error,
    /// Reconnect ceiling exceeded; only a new acquire restarts the cycle.
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    Change(ChangeEvent),
    Broadcast(BroadcastMessage),
}

pub type ListenerId = u64;
pub type ListenerItem = std::result::Result<FeedEvent, SyncError>;

struct SubscriptionInner {
    listeners: HashMap<ListenerId, mpsc::UnboundedSender<ListenerItem>>,
    pending_broadcasts: VecDeque<BroadcastMessage>,
    flushing: bool,
    control: Option<Arc<dyn FeedControl>>,
}

/// One logical topic on the change feed and everyone listening to it.
pub struct ChangeFeedSubscription {
    topic: String,
    filter: ChangeFilter,
    state: watch::Sender<ConnectionState>,
    inner: Mutex<SubscriptionInner>,
}

impl ChangeFeedSubscription {
    pub fn new(topic: impl Into<String>, filter: ChangeFilter) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        Self {
            topic: topic.into(),
            filter,
            state,
            inner: Mutex::new(SubscriptionInner {
                listeners: HashMap::new(),
                pending_broadcasts: VecDeque::new(),
                flushing: false,
                control: None,
            }),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn filter(&self) -> &ChangeFilter {
        &self.filter
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub(crate) fn set_state(&self, next: ConnectionState) -> bool {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        })
    }

    fn lock(&self) -> MutexGuard<'_, SubscriptionInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn add_listener(&self, id: ListenerId) -> mpsc::UnboundedReceiver<ListenerItem> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().listeners.insert(id, tx);
        rx
    }

    /// Returns the remaining listener count. Removing an unknown id is a no-op.
    pub(crate) fn remove_listener(&self, id: ListenerId) -> usize {
        let mut inner = self.lock();
        inner.listeners.remove(&id);
        inner.listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub(crate) fn dispatch(&self, event: FeedEvent) {
        let mut inner = self.lock();
        inner
            .listeners
            .retain(|_, listener| listener.send(Ok(event.clone())).is_ok());
    }

    pub(crate) fn fail_listeners(&self, error: SyncError) {
        let inner = self.lock();
        for listener in inner.listeners.values() {
            let _ = listener.send(Err(error.clone()));
        }
    }

    pub(crate) fn attach(&self, control: Arc<dyn FeedControl>) {
        self.lock().control = Some(control);
    }

    pub(crate) fn detach(&self) -> Option<Arc<dyn FeedControl>> {
        let mut inner = self.lock();
        inner.flushing = false;
        inner.control.take()
    }

    pub fn pending_broadcasts(&self) -> usize {
        self.lock().pending_broadcasts.len()
    }

    /// Sends now when connected with nothing queued ahead, otherwise queues
    /// for the next flush.
    pub async fn broadcast(&self, message: BroadcastMessage) -> Result<()> {
        let control = {
            let mut inner = self.lock();
            let ready = self.state() == ConnectionState::Connected
                && !inner.flushing
                && inner.pending_broadcasts.is_empty();
            match inner.control.clone() {
                Some(control) if ready => control,
                _ => {
                    inner.pending_broadcasts.push_back(message);
                    debug!(topic = %self.topic, "realtime: broadcast queued while disconnected");
                    return Ok(());
                }
            }
        };

        if let Err(err) = control.send_broadcast(message.clone()).await {
            warn!(topic = %self.topic, "realtime: broadcast failed, queued for retry: {err}");
            self.lock().pending_broadcasts.push_front(message);
        }
        Ok(())
    }

    /// Delivers queued broadcasts in order; stops at the first failure.
    pub(crate) async fn flush_pending(&self) {
        loop {
            let (control, message) = {
                let mut inner = self.lock();
                let Some(control) = inner.control.clone() else {
                    inner.flushing = false;
                    return;
                };
                let Some(message) = inner.pending_broadcasts.pop_front() else {
                    inner.flushing = false;
                    return;
                };
                inner.flushing = true;
                (control, message)
            };

            if let Err(err) = control.send_broadcast(message.clone()).await {
                warn!(topic = %self.topic, "realtime: flushing queued broadcast failed: {err}");
                let mut inner = self.lock();
                inner.pending_broadcasts.push_front(message);
                inner.flushing = false;
                return;
            }
        }
    }
}
