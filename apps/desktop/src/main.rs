use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand, ValueEnum};
use client_core::{
    DesktopNotification, NotificationPermission, NotificationSink, RealtimeSync, RestBackend,
    RestBackendOptions, StorageQueueStore, SyncDependencies, SyncEvent,
};
use shared::domain::{ConversationId, PresenceStatus, UserId};
use storage::Storage;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, prepare_database_url, Overrides, DEFAULT_CONFIG_PATH};

const SEND_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    #[arg(long)]
    backend_url: Option<String>,
    #[arg(long)]
    api_key: Option<String>,
    #[arg(long)]
    access_token: Option<String>,
    #[arg(long)]
    database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print realtime events until interrupted.
    Watch {
        /// Conversations whose typing indicators are shown.
        #[arg(long = "conversation")]
        conversations: Vec<ConversationId>,
    },
    /// Queue a message and wait for it to be delivered.
    Send {
        #[arg(long)]
        conversation: ConversationId,
        content: String,
    },
    /// Set the local status and print what others look like.
    Presence {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
        #[arg(long = "user")]
        users: Vec<UserId>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum StatusArg {
    Online,
    Away,
    Dnd,
    Offline,
}

impl From<StatusArg> for PresenceStatus {
    fn from(value: StatusArg) -> Self {
        match value {
            StatusArg::Online => Self::Online,
            StatusArg::Away => Self::Away,
            StatusArg::Dnd => Self::Dnd,
            StatusArg::Offline => Self::Offline,
        }
    }
}

/// Renders notifications to the log in place of a desktop notification center.
struct LogNotificationSink;

#[async_trait]
impl NotificationSink for LogNotificationSink {
    fn permission(&self) -> NotificationPermission {
        NotificationPermission::Granted
    }

    async fn request_permission(&self) -> NotificationPermission {
        NotificationPermission::Granted
    }

    async fn show(&self, notification: &DesktopNotification) -> Result<()> {
        info!(
            tag = %notification.tag,
            conversation_id = %notification.conversation_id,
            "notify: {} | {}",
            notification.title,
            notification.body
        );
        Ok(())
    }

    async fn dismiss(&self, tag: &str) -> Result<()> {
        debug!(tag, "notify: dismissed");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let settings = load_settings(
        &args.config,
        &Overrides {
            backend_url: args.backend_url,
            api_key: args.api_key,
            access_token: args.access_token,
            database_url: args.database_url,
        },
    )?;
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await?;
    storage.health_check().await?;

    let backend = Arc::new(RestBackend::new(RestBackendOptions {
        base_url: settings.backend_url.clone(),
        api_key: settings.api_key.clone(),
        access_token: settings.access_token.clone(),
        realtime_url: settings.realtime_url.clone(),
    })?);
    let mut dependencies = SyncDependencies::new(Arc::new(StorageQueueStore::new(
        storage.clone(),
        settings.sync.storage_namespace.clone(),
    )));
    dependencies.notifications = Arc::new(LogNotificationSink);
    let sync = RealtimeSync::init_with_dependencies(backend, dependencies, &settings.sync).await?;

    let outcome = match args.command {
        Command::Watch { conversations } => watch(&sync, conversations).await,
        Command::Send {
            conversation,
            content,
        } => send(&sync, conversation, content).await,
        Command::Presence { status, users } => presence(&sync, status, users).await,
    };

    sync.teardown().await;
    storage.close().await;
    outcome
}

async fn watch(sync: &RealtimeSync, conversations: Vec<ConversationId>) -> Result<()> {
    for conversation in &conversations {
        sync.watch_typing(*conversation).await?;
    }
    let mut events = sync.subscribe_events();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut shown_typing: Vec<(ConversationId, Vec<UserId>)> = Vec::new();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => println!("{event:?}"),
                Err(RecvError::Lagged(skipped)) => println!("(skipped {skipped} events)"),
                Err(RecvError::Closed) => break,
            },
            _ = ticker.tick() => {
                let typing: Vec<_> = conversations
                    .iter()
                    .map(|conversation| (*conversation, sync.typing_users_in(*conversation)))
                    .collect();
                if typing != shown_typing {
                    for (conversation, users) in &typing {
                        if !users.is_empty() {
                            println!("typing in {conversation}: {users:?}");
                        }
                    }
                    shown_typing = typing;
                }
            }
        }
    }
    Ok(())
}

async fn send(sync: &RealtimeSync, conversation: ConversationId, content: String) -> Result<()> {
    let mut events = sync.subscribe_events();
    let message_id = sync.enqueue_outbound_message(conversation, content).await?;
    println!("queued message_id={message_id}");

    let outcome = tokio::time::timeout(SEND_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(SyncEvent::MessageDelivered { message_id: id, .. }) if id == message_id => {
                    return Ok(());
                }
                Ok(SyncEvent::MessageFailed {
                    message_id: id,
                    attempts,
                    reason,
                    ..
                }) if id == message_id => {
                    bail!("message dropped after {attempts} attempts: {reason}");
                }
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => bail!("realtime layer stopped before delivery"),
            }
        }
    })
    .await;

    match outcome {
        Ok(result) => {
            result?;
            println!("delivered message_id={message_id}");
        }
        Err(_) => println!(
            "still queued after {}s; it will be retried on the next run",
            SEND_TIMEOUT.as_secs()
        ),
    }
    Ok(())
}

async fn presence(sync: &RealtimeSync, status: Option<StatusArg>, users: Vec<UserId>) -> Result<()> {
    if let Some(status) = status {
        sync.set_status(status.into()).await?;
        println!("status set to {}", PresenceStatus::from(status));
    }
    for user in users {
        println!("{user}: {}", sync.presence_of(user));
    }
    Ok(())
}
