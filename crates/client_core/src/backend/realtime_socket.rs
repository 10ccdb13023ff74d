use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex as StdMutex,
    },
    time::Duration,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared::protocol::{BroadcastMessage, ChangeEvent, ChangeFilter, ChannelStatus};
use tokio::{
    net::TcpStream,
    sync::{mpsc, Mutex},
    task::JoinHandle,
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, warn};
use url::Url;

use super::{FeedConnection, FeedControl, TransportSignal};

const PROTOCOL_VERSION: &str = "1.0.0";
const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

type SocketWriter = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

#[derive(Debug, Clone)]
pub struct RealtimeSocketOptions {
    pub url: String,
    pub api_key: String,
    pub join_timeout: Duration,
    pub heartbeat_interval: Duration,
}

impl RealtimeSocketOptions {
    pub fn new(url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            api_key: api_key.into(),
            join_timeout: DEFAULT_JOIN_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PhoenixMessage {
    topic: String,
    event: String,
    #[serde(default)]
    payload: Value,
    #[serde(rename = "ref", default)]
    reference: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    join_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostgresChangesPayload {
    data: ChangeEvent,
}

/// Change-feed transport speaking Phoenix channel framing, one socket per topic.
pub struct RealtimeSocket {
    options: RealtimeSocketOptions,
    refs: Arc<AtomicU64>,
}

impl RealtimeSocket {
    pub fn new(options: RealtimeSocketOptions) -> Self {
        Self {
            options,
            refs: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn websocket_url(&self) -> Result<Url> {
        let base = self.options.url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}/websocket"))
            .with_context(|| format!("invalid realtime url: {}", self.options.url))?;
        url.query_pairs_mut()
            .append_pair("apikey", &self.options.api_key)
            .append_pair("vsn", PROTOCOL_VERSION);
        Ok(url)
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        filter: &ChangeFilter,
        access_token: Option<&str>,
    ) -> Result<FeedConnection> {
        let ws_url = self.websocket_url()?;
        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .with_context(|| format!("failed to connect realtime websocket: {ws_url}"))?;
        let (writer, mut reader) = ws_stream.split();
        let writer = Arc::new(Mutex::new(writer));

        let channel_topic = format!("realtime:{topic}");
        let join_ref = next_ref(&self.refs);
        let join = PhoenixMessage {
            topic: channel_topic.clone(),
            event: "phx_join".to_string(),
            payload: join_payload(filter, access_token),
            reference: Some(join_ref.clone()),
            join_ref: Some(join_ref.clone()),
        };
        send_frame(&writer, &join).await?;
        info!(topic = %channel_topic, table = %filter.table, "realtime: join sent");

        let (tx, rx) = mpsc::unbounded_channel();
        let reader_topic = channel_topic.clone();
        let reader_join_ref = join_ref.clone();
        let join_timeout = self.options.join_timeout;
        let reader_task = tokio::spawn(async move {
            let deadline = tokio::time::sleep(join_timeout);
            tokio::pin!(deadline);
            let mut joined = false;
            loop {
                tokio::select! {
                    _ = &mut deadline, if !joined => {
                        let _ = tx.send(TransportSignal::Status(ChannelStatus::TimedOut));
                        break;
                    }
                    frame = reader.next() => match frame {
                        Some(Ok(Message::Text(text))) => {
                            let message = match serde_json::from_str::<PhoenixMessage>(&text) {
                                Ok(message) => message,
                                Err(err) => {
                                    warn!(topic = %reader_topic, "realtime: invalid frame: {err}");
                                    continue;
                                }
                            };
                            if message.topic != reader_topic {
                                continue;
                            }
                            match route_frame(message, &reader_join_ref) {
                                FrameOutcome::Signal(signal) => {
                                    if signal == TransportSignal::Status(ChannelStatus::Subscribed) {
                                        joined = true;
                                    }
                                    if tx.send(signal).is_err() {
                                        break;
                                    }
                                }
                                FrameOutcome::Terminal(status) => {
                                    let _ = tx.send(TransportSignal::Status(status));
                                    break;
                                }
                                FrameOutcome::Ignore => {}
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            let _ = tx.send(TransportSignal::Status(ChannelStatus::Closed));
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            warn!(topic = %reader_topic, "realtime: websocket receive failed: {err}");
                            let _ = tx.send(TransportSignal::Status(ChannelStatus::ChannelError));
                            break;
                        }
                    }
                }
            }
        });

        let heartbeat_writer = Arc::clone(&writer);
        let heartbeat_refs = Arc::clone(&self.refs);
        let heartbeat_interval = self.options.heartbeat_interval;
        let heartbeat_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat_interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let heartbeat = PhoenixMessage {
                    topic: "phoenix".to_string(),
                    event: "heartbeat".to_string(),
                    payload: json!({}),
                    reference: Some(next_ref(&heartbeat_refs)),
                    join_ref: None,
                };
                if let Err(err) = send_frame(&heartbeat_writer, &heartbeat).await {
                    debug!("realtime: heartbeat stopped: {err}");
                    break;
                }
            }
        });

        Ok(FeedConnection {
            signals: rx,
            control: Arc::new(SocketControl {
                writer,
                topic: channel_topic,
                join_ref,
                refs: Arc::clone(&self.refs),
                closed: AtomicBool::new(false),
                tasks: StdMutex::new(vec![reader_task, heartbeat_task]),
            }),
        })
    }
}

enum FrameOutcome {
    Signal(TransportSignal),
    Terminal(ChannelStatus),
    Ignore,
}

fn route_frame(message: PhoenixMessage, join_ref: &str) -> FrameOutcome {
    match message.event.as_str() {
        "phx_reply" if message.reference.as_deref() == Some(join_ref) => {
            match message.payload.get("status").and_then(Value::as_str) {
                Some("ok") => FrameOutcome::Signal(TransportSignal::Status(ChannelStatus::Subscribed)),
                _ => FrameOutcome::Terminal(ChannelStatus::ChannelError),
            }
        }
        "postgres_changes" => match serde_json::from_value::<PostgresChangesPayload>(message.payload)
        {
            Ok(payload) => FrameOutcome::Signal(TransportSignal::Change(payload.data)),
            Err(err) => {
                warn!(topic = %message.topic, "realtime: dropping malformed change payload: {err}");
                FrameOutcome::Ignore
            }
        },
        "broadcast" => match serde_json::from_value::<BroadcastMessage>(message.payload) {
            Ok(broadcast) => FrameOutcome::Signal(TransportSignal::Broadcast(broadcast)),
            Err(err) => {
                warn!(topic = %message.topic, "realtime: dropping malformed broadcast: {err}");
                FrameOutcome::Ignore
            }
        },
        "system" if message.payload.get("status").and_then(Value::as_str) == Some("error") => {
            FrameOutcome::Terminal(ChannelStatus::ChannelError)
        }
        "phx_error" => FrameOutcome::Terminal(ChannelStatus::ChannelError),
        "phx_close" => FrameOutcome::Terminal(ChannelStatus::Closed),
        _ => FrameOutcome::Ignore,
    }
}

fn join_payload(filter: &ChangeFilter, access_token: Option<&str>) -> Value {
    let mut change = json!({
        "event": filter.event,
        "schema": filter.schema,
        "table": filter.table,
    });
    if let Some(predicate) = &filter.row_predicate {
        change["filter"] = Value::String(predicate.to_string());
    }
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false, "ack": false },
            "presence": { "key": "" },
            "postgres_changes": [change],
        }
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    payload
}

fn next_ref(refs: &AtomicU64) -> String {
    refs.fetch_add(1, Ordering::Relaxed).to_string()
}

async fn send_frame(writer: &Mutex<SocketWriter>, message: &PhoenixMessage) -> Result<()> {
    let text = serde_json::to_string(message)?;
    writer
        .lock()
        .await
        .send(Message::Text(text))
        .await
        .context("failed to write realtime frame")
}

struct SocketControl {
    writer: Arc<Mutex<SocketWriter>>,
    topic: String,
    join_ref: String,
    refs: Arc<AtomicU64>,
    closed: AtomicBool,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl SocketControl {
    fn abort_tasks(&self) {
        let tasks = match self.tasks.lock() {
            Ok(mut guard) => std::mem::take(&mut *guard),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        };
        for task in tasks {
            task.abort();
        }
    }
}

#[async_trait]
impl FeedControl for SocketControl {
    async fn send_broadcast(&self, message: BroadcastMessage) -> Result<()> {
        let frame = PhoenixMessage {
            topic: self.topic.clone(),
            event: "broadcast".to_string(),
            payload: json!({
                "type": "broadcast",
                "event": message.event,
                "payload": message.payload,
            }),
            reference: Some(next_ref(&self.refs)),
            join_ref: Some(self.join_ref.clone()),
        };
        send_frame(&self.writer, &frame).await
    }

    async fn unsubscribe(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let leave = PhoenixMessage {
            topic: self.topic.clone(),
            event: "phx_leave".to_string(),
            payload: json!({}),
            reference: Some(next_ref(&self.refs)),
            join_ref: Some(self.join_ref.clone()),
        };
        if let Err(err) = send_frame(&self.writer, &leave).await {
            debug!(topic = %self.topic, "realtime: leave not delivered: {err}");
        }
        let _ = self.writer.lock().await.close().await;
        self.abort_tasks();
        info!(topic = %self.topic, "realtime: unsubscribed");
        Ok(())
    }
}

impl Drop for SocketControl {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[cfg(test)]
#[path = "../tests/realtime_socket_tests.rs"]
mod tests;
