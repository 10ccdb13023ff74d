use std::{sync::Arc, time::Duration};

use shared::protocol::ChannelStatus;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{error, info, warn};

use crate::{
    backend::{BackendClient, TransportSignal},
    config::SyncConfig,
    error::SyncError,
    subscription::{ChangeFeedSubscription, ConnectionState, FeedEvent},
};

const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
    /// How long an internal consumer waits before re-acquiring a failed topic
    /// when the network never drops.
    pub rejoin_interval: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_attempts: 5,
            rejoin_interval: Duration::from_secs(60),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            base_delay: config.reconnect_base_delay(),
            max_attempts: config.reconnect_max_attempts,
            rejoin_interval: config.feed_rejoin_interval(),
        }
    }

    /// `base * 2^(attempt-1)`; attempt 0 means no wait.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    GiveUp { attempts: u32 },
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectState {
    attempt: u32,
}

impl ReconnectState {
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn record_failure(&mut self, policy: &ReconnectPolicy) -> ReconnectDecision {
        if self.attempt >= policy.max_attempts {
            return ReconnectDecision::GiveUp {
                attempts: self.attempt,
            };
        }
        self.attempt += 1;
        ReconnectDecision::Retry {
            attempt: self.attempt,
            delay: policy.delay_for_attempt(self.attempt),
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Receives state transitions from supervisors.
pub trait ConnectionObserver: Send + Sync {
    fn on_state(&self, topic: &str, generation: u64, state: ConnectionState);
    fn on_failed(&self, topic: &str, generation: u64, attempts: u32);
}

enum PumpOutcome {
    Shutdown,
    Lost(ConnectionState),
}

/// Drives one subscription through connect, backoff and give-up.
pub struct ReconnectSupervisor {
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl ReconnectSupervisor {
    pub fn spawn(
        backend: Arc<dyn BackendClient>,
        subscription: Arc<ChangeFeedSubscription>,
        policy: ReconnectPolicy,
        observer: Arc<dyn ConnectionObserver>,
        generation: u64,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(supervise(
            backend,
            subscription,
            policy,
            observer,
            generation,
            shutdown_rx,
        ));
        Self {
            shutdown: Some(shutdown_tx),
            task,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Signals the task to unsubscribe and waits briefly for it; a transport
    /// that hangs on unsubscribe is aborted.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if tokio::time::timeout(STOP_GRACE, &mut self.task).await.is_err() {
            warn!("realtime: supervisor did not stop in time; aborting");
            self.task.abort();
        }
    }
}

fn transition(
    subscription: &ChangeFeedSubscription,
    observer: &dyn ConnectionObserver,
    generation: u64,
    state: ConnectionState,
) {
    if subscription.set_state(state) {
        observer.on_state(subscription.topic(), generation, state);
    }
}

async fn supervise(
    backend: Arc<dyn BackendClient>,
    subscription: Arc<ChangeFeedSubscription>,
    policy: ReconnectPolicy,
    observer: Arc<dyn ConnectionObserver>,
    generation: u64,
    mut shutdown: oneshot::Receiver<()>,
) {
    let topic = subscription.topic().to_string();
    let mut reconnect = ReconnectState::default();

    loop {
        transition(&subscription, observer.as_ref(), generation, ConnectionState::Connecting);

        let connected = tokio::select! {
            _ = &mut shutdown => {
                transition(&subscription, observer.as_ref(), generation, ConnectionState::Disconnected);
                return;
            }
            result = backend.subscribe(&topic, subscription.filter()) => result,
        };

        let outcome = match connected {
            Ok(connection) => {
                subscription.attach(Arc::clone(&connection.control));
                let outcome = pump(
                    &subscription,
                    observer.as_ref(),
                    generation,
                    connection.signals,
                    &mut reconnect,
                    &mut shutdown,
                )
                .await;
                if let Some(control) = subscription.detach() {
                    if let Err(err) = control.unsubscribe().await {
                        warn!(topic = %topic, "realtime: unsubscribe failed: {err}");
                    }
                }
                outcome
            }
            Err(err) => {
                warn!(topic = %topic, attempt = reconnect.attempt(), "realtime: subscribe failed: {err:#}");
                PumpOutcome::Lost(ConnectionState::Error)
            }
        };

        let lost_state = match outcome {
            PumpOutcome::Shutdown => {
                transition(&subscription, observer.as_ref(), generation, ConnectionState::Disconnected);
                return;
            }
            PumpOutcome::Lost(state) => state,
        };
        transition(&subscription, observer.as_ref(), generation, lost_state);

        match reconnect.record_failure(&policy) {
            ReconnectDecision::Retry { attempt, delay } => {
                info!(
                    topic = %topic,
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "realtime: scheduling reconnect"
                );
                tokio::select! {
                    _ = &mut shutdown => {
                        transition(&subscription, observer.as_ref(), generation, ConnectionState::Disconnected);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            ReconnectDecision::GiveUp { attempts } => {
                error!(topic = %topic, attempts, "realtime: reconnect attempts exhausted");
                transition(&subscription, observer.as_ref(), generation, ConnectionState::Failed);
                subscription.fail_listeners(SyncError::ReconnectExhausted {
                    topic: topic.clone(),
                    attempts,
                });
                observer.on_failed(&topic, generation, attempts);
                return;
            }
        }
    }
}

async fn pump(
    subscription: &ChangeFeedSubscription,
    observer: &dyn ConnectionObserver,
    generation: u64,
    mut signals: mpsc::UnboundedReceiver<TransportSignal>,
    reconnect: &mut ReconnectState,
    shutdown: &mut oneshot::Receiver<()>,
) -> PumpOutcome {
    loop {
        let signal = tokio::select! {
            _ = &mut *shutdown => return PumpOutcome::Shutdown,
            signal = signals.recv() => signal,
        };
        match signal {
            Some(TransportSignal::Status(ChannelStatus::Subscribed)) => {
                reconnect.reset();
                transition(subscription, observer, generation, ConnectionState::Connected);
                info!(topic = %subscription.topic(), "realtime: subscribed");
                subscription.flush_pending().await;
            }
            Some(TransportSignal::Status(ChannelStatus::ChannelError)) => {
                warn!(topic = %subscription.topic(), "realtime: channel error");
                return PumpOutcome::Lost(ConnectionState::Error);
            }
            Some(TransportSignal::Status(ChannelStatus::TimedOut)) => {
                warn!(topic = %subscription.topic(), "realtime: subscription timed out");
                return PumpOutcome::Lost(ConnectionState::Error);
            }
            Some(TransportSignal::Status(ChannelStatus::Closed)) | None => {
                warn!(topic = %subscription.topic(), "realtime: transport closed");
                return PumpOutcome::Lost(ConnectionState::Disconnected);
            }
            Some(TransportSignal::Change(change)) => {
                subscription.dispatch(FeedEvent::Change(change));
            }
            Some(TransportSignal::Broadcast(message)) => {
                subscription.dispatch(FeedEvent::Broadcast(message));
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/reconnect_tests.rs"]
mod tests;
