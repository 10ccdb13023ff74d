use std::fmt;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::domain::{ConversationId, MessageId, PresenceStatus, UserId};

pub const DEFAULT_SCHEMA: &str = "public";

pub mod tables {
    pub const MESSAGES: &str = "messages";
    pub const DIRECT_MESSAGES: &str = "direct_messages";
    pub const MENTIONS: &str = "mentions";
    pub const USER_PRESENCE: &str = "user_presence";
    pub const TYPING_INDICATORS: &str = "typing_indicators";
    pub const PROFILES: &str = "profiles";
}

/// Row-level change kinds as reported by the change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventFilter {
    #[serde(rename = "INSERT")]
    Insert,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
    #[serde(rename = "*")]
    All,
}

impl EventFilter {
    pub fn matches(self, kind: ChangeKind) -> bool {
        match self {
            Self::All => true,
            Self::Insert => kind == ChangeKind::Insert,
            Self::Update => kind == ChangeKind::Update,
            Self::Delete => kind == ChangeKind::Delete,
        }
    }
}

/// Equality predicate on a single column, rendered as `column=eq.value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowPredicate {
    pub column: String,
    pub value: String,
}

impl RowPredicate {
    pub fn eq(column: impl Into<String>, value: impl ToString) -> Self {
        Self {
            column: column.into(),
            value: value.to_string(),
        }
    }

    pub fn query_pair(&self) -> (String, String) {
        (self.column.clone(), format!("eq.{}", self.value))
    }
}

impl fmt::Display for RowPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}=eq.{}", self.column, self.value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeFilter {
    pub schema: String,
    pub table: String,
    pub event: EventFilter,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_predicate: Option<RowPredicate>,
}

impl ChangeFilter {
    pub fn table(table: impl Into<String>) -> Self {
        Self {
            schema: DEFAULT_SCHEMA.to_string(),
            table: table.into(),
            event: EventFilter::All,
            row_predicate: None,
        }
    }

    pub fn on(mut self, event: EventFilter) -> Self {
        self.event = event;
        self
    }

    pub fn matching(mut self, predicate: RowPredicate) -> Self {
        self.row_predicate = Some(predicate);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub record: Value,
    #[serde(default)]
    pub old_record: Value,
    pub commit_timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn record_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.record)
    }

    pub fn old_record_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.old_record)
    }
}

/// Transport-level status callbacks of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: String,
    #[serde(default)]
    pub payload: Value,
}

impl BroadcastMessage {
    pub fn new(event: impl Into<String>, payload: Value) -> Self {
        Self {
            event: event.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessageRow {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceRow {
    pub user_id: UserId,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypingRow {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MentionRow {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub mentioned_user_id: UserId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectMessageRow {
    pub id: Uuid,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileRow {
    pub id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl ProfileRow {
    pub fn label(&self) -> Option<&str> {
        [self.display_name.as_deref(), self.username.as_deref()]
            .into_iter()
            .flatten()
            .find(|name| !name.trim().is_empty())
    }
}
