//! Consumption loop of one work queue.
//!
//! Postconditions for every delivery, whatever the outcome:
//! - the original delivery is settled exactly once (ack, or a non-requeueing
//!   reject when a retry/dead-letter republish could not be confirmed);
//! - a retry or dead-letter republish is confirmed before the original is
//!   acknowledged;
//! - deliveries of one queue are handled one at a time, in broker order.

use std::sync::Arc;

use anyhow::{Error, Result};
use futures_util::{Stream, StreamExt};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::{
    clients::rbmq::MessageBus,
    error::ConsumerError,
    failure::{FailureAction, FailureController},
    handlers::HandlerRegistry,
    models::{
        headers,
        message::{Envelope, InboundMessage},
    },
    recorder::OutcomeRecorder,
    topology::QueueBinding,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Malformed,
    Unroutable,
    /// The outcome record had already reached a different terminal status.
    AlreadyFinal,
}

impl DropReason {
    /// `None` for errors that go through retry or dead-lettering.
    pub fn classify(error: &ConsumerError) -> Option<Self> {
        if !error.is_poison() {
            return None;
        }
        Some(match error {
            ConsumerError::MalformedMessage(_) => DropReason::Malformed,
            ConsumerError::UnroutableType(_) => DropReason::Unroutable,
            _ => DropReason::AlreadyFinal,
        })
    }
}

/// How a delivery was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Processed,
    Retried { retry_count: u32 },
    DeadLettered,
    Dropped(DropReason),
    Rejected,
}

pub struct Dispatcher {
    binding: QueueBinding,
    bus: Arc<dyn MessageBus>,
    registry: Arc<HandlerRegistry>,
    failures: FailureController,
    recorder: OutcomeRecorder,
}

impl Dispatcher {
    pub fn new(
        binding: QueueBinding,
        bus: Arc<dyn MessageBus>,
        registry: Arc<HandlerRegistry>,
        failures: FailureController,
        recorder: OutcomeRecorder,
    ) -> Self {
        Self {
            binding,
            bus,
            registry,
            failures,
            recorder,
        }
    }

    pub fn queue(&self) -> &str {
        &self.binding.queue
    }

    /// Consumes until the stream ends or shutdown is signalled. A delivery in
    /// progress is always settled before the loop exits. Returns the number of
    /// settled deliveries.
    pub async fn run<S>(&self, deliveries: S, mut shutdown: watch::Receiver<bool>) -> Result<u64>
    where
        S: Stream<Item = Result<InboundMessage, Error>> + Send,
    {
        let mut deliveries = std::pin::pin!(deliveries);
        let mut settled = 0u64;

        info!(queue = %self.binding.queue, "Started consuming from queue");

        loop {
            let stopping = *shutdown.borrow();
            if stopping {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(message)) => {
                    let delivery_tag = message.delivery_tag;
                    match self.handle_delivery(message).await {
                        Ok(settlement) => {
                            settled += 1;
                            debug!(
                                queue = %self.binding.queue,
                                delivery_tag,
                                settlement = ?settlement,
                                "Delivery settled"
                            );
                        }
                        Err(e) => {
                            error!(
                                queue = %self.binding.queue,
                                delivery_tag,
                                error = %e,
                                "Failed to settle delivery"
                            );
                        }
                    }
                }
                Some(Err(e)) => {
                    error!(queue = %self.binding.queue, error = %e, "Consumer stream failed");
                    return Err(e);
                }
                None => {
                    warn!(queue = %self.binding.queue, "Consumer stream ended");
                    break;
                }
            }
        }

        info!(queue = %self.binding.queue, settled, "Stopped consuming from queue");

        Ok(settled)
    }

    pub async fn handle_delivery(&self, message: InboundMessage) -> Result<Settlement, Error> {
        let delivery_tag = message.delivery_tag;

        let envelope = match Envelope::parse(&message.data) {
            Ok(envelope) => envelope,
            Err(e) => return self.drop_delivery(delivery_tag, None, &e).await,
        };

        let handler = match self.registry.resolve(&envelope.notification_type) {
            Ok(handler) => handler,
            Err(e) => return self.drop_delivery(delivery_tag, Some(&envelope), &e).await,
        };

        let retry_count = headers::retry_count(&message.properties);

        debug!(
            queue = %self.binding.queue,
            notification_id = %envelope.id,
            notification_type = %envelope.notification_type,
            routing_key = %message.routing_key,
            retry_count,
            "Received notification"
        );

        match handler.process(&envelope, retry_count).await {
            Ok(outcome) => {
                self.bus.acknowledge(delivery_tag).await?;

                if let Err(e) = self
                    .recorder
                    .processed(&envelope, retry_count, outcome.processed_at)
                    .await
                {
                    error!(
                        notification_id = %envelope.id,
                        error = %e,
                        "Failed to record processed outcome"
                    );
                }

                Ok(Settlement::Processed)
            }
            Err(failure) => {
                if let Some(poison) = failure.downcast_ref::<ConsumerError>() {
                    if poison.is_poison() {
                        return self
                            .drop_delivery(delivery_tag, Some(&envelope), poison)
                            .await;
                    }
                }

                match self
                    .failures
                    .handle(&message, &envelope, retry_count, &failure)
                    .await
                {
                    Ok(action) => {
                        self.bus.acknowledge(delivery_tag).await?;
                        Ok(match action {
                            FailureAction::Retried { retry_count } => {
                                Settlement::Retried { retry_count }
                            }
                            FailureAction::DeadLettered { .. } => Settlement::DeadLettered,
                        })
                    }
                    Err(e) => {
                        error!(
                            queue = %self.binding.queue,
                            notification_id = %envelope.id,
                            retry_count,
                            error = %e,
                            "Could not republish failed notification, rejecting without requeue"
                        );
                        self.bus.reject(delivery_tag, false).await?;
                        Ok(Settlement::Rejected)
                    }
                }
            }
        }
    }

    /// Acknowledges without republishing.
    async fn drop_delivery(
        &self,
        delivery_tag: u64,
        envelope: Option<&Envelope>,
        error: &ConsumerError,
    ) -> Result<Settlement, Error> {
        let reason = DropReason::classify(error).unwrap_or(DropReason::Malformed);
        let notification_id = envelope.map(|envelope| envelope.id.to_string());

        warn!(
            queue = %self.binding.queue,
            delivery_tag,
            notification_id = notification_id.as_deref().unwrap_or("-"),
            reason = ?reason,
            error = %error,
            "Dropping message"
        );

        self.bus.acknowledge(delivery_tag).await?;
        Ok(Settlement::Dropped(reason))
    }
}
