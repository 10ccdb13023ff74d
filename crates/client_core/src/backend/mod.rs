//! Seam to the hosted backend: change feeds, row mutations, RPC and the auth session.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::AuthUser,
    protocol::{BroadcastMessage, ChangeEvent, ChangeFilter, ChannelStatus, RowPredicate},
};
use tokio::sync::mpsc;

mod realtime_socket;
mod rest;

pub use realtime_socket::{RealtimeSocket, RealtimeSocketOptions};
pub use rest::{RestBackend, RestBackendOptions};

/// One ordered item from a transport subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSignal {
    Status(ChannelStatus),
    Change(ChangeEvent),
    Broadcast(BroadcastMessage),
}

#[async_trait]
pub trait FeedControl: Send + Sync {
    async fn send_broadcast(&self, message: BroadcastMessage) -> Result<()>;
    async fn unsubscribe(&self) -> Result<()>;
}

/// A live transport subscription. Signals arrive in delivery order and the
/// receiver closes when the transport goes away.
pub struct FeedConnection {
    pub signals: mpsc::UnboundedReceiver<TransportSignal>,
    pub control: Arc<dyn FeedControl>,
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    async fn subscribe(&self, topic: &str, filter: &ChangeFilter) -> Result<FeedConnection>;
    async fn select(&self, table: &str, predicates: &[RowPredicate]) -> Result<Vec<Value>>;
    async fn insert(&self, table: &str, payload: Value) -> Result<Value>;
    async fn upsert(&self, table: &str, payload: Value, on_conflict: &str) -> Result<Value>;
    async fn update(&self, table: &str, predicates: &[RowPredicate], payload: Value)
        -> Result<Value>;
    async fn delete(&self, table: &str, predicates: &[RowPredicate]) -> Result<()>;
    async fn call_rpc(&self, name: &str, args: Value) -> Result<Value>;
    async fn current_user(&self) -> Result<Option<AuthUser>>;
}

pub struct MissingBackend;

#[async_trait]
impl BackendClient for MissingBackend {
    async fn subscribe(&self, topic: &str, _filter: &ChangeFilter) -> Result<FeedConnection> {
        Err(anyhow!("backend unavailable; cannot subscribe to {topic}"))
    }

    async fn select(&self, table: &str, _predicates: &[RowPredicate]) -> Result<Vec<Value>> {
        Err(anyhow!("backend unavailable; cannot read {table}"))
    }

    async fn insert(&self, table: &str, _payload: Value) -> Result<Value> {
        Err(anyhow!("backend unavailable; cannot insert into {table}"))
    }

    async fn upsert(&self, table: &str, _payload: Value, _on_conflict: &str) -> Result<Value> {
        Err(anyhow!("backend unavailable; cannot upsert into {table}"))
    }

    async fn update(
        &self,
        table: &str,
        _predicates: &[RowPredicate],
        _payload: Value,
    ) -> Result<Value> {
        Err(anyhow!("backend unavailable; cannot update {table}"))
    }

    async fn delete(&self, table: &str, _predicates: &[RowPredicate]) -> Result<()> {
        Err(anyhow!("backend unavailable; cannot delete from {table}"))
    }

    async fn call_rpc(&self, name: &str, _args: Value) -> Result<Value> {
        Err(anyhow!("backend unavailable; cannot call rpc {name}"))
    }

    async fn current_user(&self) -> Result<Option<AuthUser>> {
        Ok(None)
    }
}
