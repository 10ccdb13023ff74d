use shared::domain::{ConversationId, MessageId};

use crate::{registry::AggregateState, subscription::ConnectionState};

/// User-visible signals published on the realtime layer's event bus.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    ConnectionStateChanged(AggregateState),
    TopicStateChanged {
        topic: String,
        state: ConnectionState,
    },
    SubscriptionFailed {
        topic: String,
        attempts: u32,
    },
    MessageDelivered {
        message_id: MessageId,
        conversation_id: ConversationId,
    },
    MessageFailed {
        message_id: MessageId,
        conversation_id: ConversationId,
        attempts: u32,
        reason: String,
    },
    NavigateTo {
        conversation_id: ConversationId,
    },
}
