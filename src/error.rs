//! Failure taxonomy of the consumer pipeline.

use thiserror::Error;

use crate::models::status::OutcomeStatus;

/// Every way a delivery can fail to reach a `processed` outcome.
///
/// The `Display` text is what ends up in the `death-reason` header of a
/// dead-lettered message and in the consumer logs.
#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("Malformed message: {0}")]
    MalformedMessage(#[from] serde_json::Error),

    #[error("No handler registered for notification type '{0}'")]
    UnroutableType(String),

    #[error("Handling failed on attempt {attempt}: {reason}")]
    TransientHandling { attempt: u32, reason: String },

    #[error("Retries exhausted after {retry_count} attempts: {reason}")]
    ExhaustedRetries { retry_count: u32, reason: String },

    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    #[error("Outcome for notification {notification_id} is already {status}")]
    OutcomeAlreadyFinal {
        notification_id: String,
        status: OutcomeStatus,
    },
}

impl ConsumerError {
    pub fn broker(error: impl std::fmt::Display) -> Self {
        Self::BrokerUnavailable(error.to_string())
    }

    /// Redelivering these can never change the result, so they are settled by
    /// acknowledging without any republish.
    pub fn is_poison(&self) -> bool {
        matches!(
            self,
            Self::MalformedMessage(_) | Self::UnroutableType(_) | Self::OutcomeAlreadyFinal { .. }
        )
    }
}
