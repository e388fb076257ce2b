//! Decides what happens to a delivery whose handler failed, and carries the
//! decision out on the broker.

use std::sync::Arc;

use anyhow::Error;
use chrono::Utc;
use tracing::{error, warn};

use crate::{
    clients::rbmq::MessageBus,
    error::ConsumerError,
    models::{
        headers,
        message::{Envelope, InboundMessage},
    },
    recorder::OutcomeRecorder,
    topology::{QueueBinding, Topology},
};

pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDecision {
    Retry { retry_count: u32 },
    DeadLetter,
}

/// Fixed budget: retry while below `max_retries`, then dead-letter.
pub fn decide(current_retry_count: u32, max_retries: u32) -> FailureDecision {
    if current_retry_count < max_retries {
        FailureDecision::Retry {
            retry_count: current_retry_count + 1,
        }
    } else {
        FailureDecision::DeadLetter
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    Retried { retry_count: u32 },
    DeadLettered { reason: String },
}

/// Failure handling for the deliveries of one work queue.
pub struct FailureController {
    bus: Arc<dyn MessageBus>,
    retry_exchange: String,
    dead_letter_exchange: String,
    binding: QueueBinding,
    recorder: OutcomeRecorder,
    max_retries: u32,
}

impl FailureController {
    pub fn new(
        bus: Arc<dyn MessageBus>,
        topology: &Topology,
        binding: QueueBinding,
        recorder: OutcomeRecorder,
        max_retries: u32,
    ) -> Self {
        Self {
            bus,
            retry_exchange: topology.retry_exchange.clone(),
            dead_letter_exchange: topology.dead_letter_exchange.clone(),
            binding,
            recorder,
            max_retries,
        }
    }

    pub fn decide(&self, current_retry_count: u32) -> FailureDecision {
        decide(current_retry_count, self.max_retries)
    }

    /// Republishes the message either to the retry queue or to the DLQ.
    ///
    /// Returns `BrokerUnavailable` when the republish was not confirmed; the
    /// caller must then reject the original without requeue.
    pub async fn handle(
        &self,
        message: &InboundMessage,
        envelope: &Envelope,
        retry_count: u32,
        failure: &Error,
    ) -> Result<FailureAction, ConsumerError> {
        match self.decide(retry_count) {
            FailureDecision::Retry {
                retry_count: next_count,
            } => {
                self.schedule_retry(message, envelope, next_count, failure)
                    .await?;
                Ok(FailureAction::Retried {
                    retry_count: next_count,
                })
            }
            FailureDecision::DeadLetter => {
                let reason = ConsumerError::ExhaustedRetries {
                    retry_count,
                    reason: failure.to_string(),
                }
                .to_string();
                self.dead_letter(message, envelope, retry_count, &reason)
                    .await?;
                Ok(FailureAction::DeadLettered { reason })
            }
        }
    }

    async fn schedule_retry(
        &self,
        message: &InboundMessage,
        envelope: &Envelope,
        next_count: u32,
        failure: &Error,
    ) -> Result<(), ConsumerError> {
        let properties = headers::with_retry_count(&message.properties, next_count);

        self.bus
            .publish(
                &self.retry_exchange,
                self.binding.retry_routing_key(),
                &message.data,
                properties,
            )
            .await
            .map_err(ConsumerError::broker)?;

        let transient = ConsumerError::TransientHandling {
            attempt: next_count,
            reason: failure.to_string(),
        };
        warn!(
            notification_id = %envelope.id,
            queue = %self.binding.queue,
            retry_queue = %self.binding.retry_queue,
            retry_count = next_count,
            max_retries = self.max_retries,
            error = %transient,
            "Notification scheduled for retry"
        );

        Ok(())
    }

    async fn dead_letter(
        &self,
        message: &InboundMessage,
        envelope: &Envelope,
        retry_count: u32,
        reason: &str,
    ) -> Result<(), ConsumerError> {
        let died_at = Utc::now();
        let original_routing_key = if message.routing_key.is_empty() {
            self.binding.routing_key.as_str()
        } else {
            message.routing_key.as_str()
        };
        let properties =
            headers::with_death(&message.properties, reason, died_at, original_routing_key);

        self.bus
            .publish(
                &self.dead_letter_exchange,
                self.binding.dead_letter_routing_key(),
                &message.data,
                properties,
            )
            .await
            .map_err(ConsumerError::broker)?;

        error!(
            notification_id = %envelope.id,
            queue = %self.binding.queue,
            dead_letter_queue = %self.binding.dead_letter_queue,
            retry_count,
            reason,
            "Notification dead-lettered"
        );

        if let Err(e) = self.recorder.failed(envelope, retry_count, died_at).await {
            error!(
                notification_id = %envelope.id,
                error = %e,
                "Failed to record failed outcome for dead-lettered notification"
            );
        }

        Ok(())
    }
}
