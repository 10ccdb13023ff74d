use shared::{
    domain::{ConversationId, MessageId},
    error::{ApiException, ErrorCode},
};
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("realtime topic {topic} failed after {attempts} reconnect attempts")]
    ReconnectExhausted { topic: String, attempts: u32 },
    #[error("message {message_id} to {conversation_id} failed to send after {attempts} attempts: {reason}")]
    DeliveryFailed {
        message_id: MessageId,
        conversation_id: ConversationId,
        attempts: u32,
        reason: String,
    },
    #[error("no authenticated user session")]
    NotAuthenticated,
    #[error("realtime layer has been shut down")]
    Shutdown,
}

/// Returns the backend error code carried by `err`, if any.
pub fn api_error_code(err: &anyhow::Error) -> Option<ErrorCode> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ApiException>())
        .map(|api| api.code)
}

pub fn is_permission_error(err: &anyhow::Error) -> bool {
    api_error_code(err).is_some_and(ErrorCode::is_permission_denied)
}
