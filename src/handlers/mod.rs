//! Type-specific processing strategies and the closed registry that selects
//! one per notification type.
//!
//! Strategies never touch the broker. They perform the delivery and record
//! the `processed` outcome; any error they return is settled by the
//! dispatcher. The terminal `failed` outcome is written by the failure
//! controller once the dead-letter publish is confirmed, so an unconfirmed
//! dead-letter never leaves a `failed` record behind.

pub mod email;
pub mod sms;

use std::sync::Arc;

use anyhow::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::{
    clients::gateway::{DeliveryRequest, DeliveryTransport},
    error::ConsumerError,
    models::message::{Envelope, NotificationType},
    recorder::OutcomeRecorder,
};

pub use email::EmailHandler;
pub use sms::SmsHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub processed_at: DateTime<Utc>,
}

#[async_trait]
pub trait NotificationHandler: Send + Sync {
    async fn process(&self, envelope: &Envelope, retry_count: u32) -> Result<Outcome, Error>;
}

/// One strategy per [`NotificationType`] variant.
pub struct HandlerRegistry {
    email: EmailHandler,
    sms: SmsHandler,
}

impl HandlerRegistry {
    pub fn new(email: EmailHandler, sms: SmsHandler) -> Self {
        Self { email, sms }
    }

    pub fn resolve(
        &self,
        notification_type: &str,
    ) -> Result<&dyn NotificationHandler, ConsumerError> {
        let kind = notification_type.parse::<NotificationType>()?;
        let handler: &dyn NotificationHandler = match kind {
            NotificationType::Email => &self.email,
            NotificationType::Sms => &self.sms,
        };
        Ok(handler)
    }
}

/// Shared by the strategies: deliver, then record the processed outcome.
pub(crate) struct Courier {
    transport: Arc<dyn DeliveryTransport>,
    recorder: OutcomeRecorder,
    max_retries: u32,
}

impl Courier {
    pub(crate) fn new(
        transport: Arc<dyn DeliveryTransport>,
        recorder: OutcomeRecorder,
        max_retries: u32,
    ) -> Self {
        Self {
            transport,
            recorder,
            max_retries,
        }
    }

    pub(crate) async fn run(
        &self,
        envelope: &Envelope,
        retry_count: u32,
        request: Result<DeliveryRequest, Error>,
    ) -> Result<Outcome, Error> {
        let delivered = match request {
            Ok(request) => self.transport.deliver(&request).await,
            Err(e) => Err(e),
        };

        match delivered {
            Ok(()) => {
                let processed_at = Utc::now();
                self.recorder
                    .processed(envelope, retry_count, processed_at)
                    .await?;
                Ok(Outcome { processed_at })
            }
            Err(e) => {
                if retry_count >= self.max_retries {
                    warn!(
                        notification_id = %envelope.id,
                        retry_count,
                        error = %e,
                        "Final delivery attempt failed"
                    );
                }
                Err(e)
            }
        }
    }
}

pub(crate) fn payload_str<'a>(envelope: &'a Envelope, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| envelope.payload.get(key).and_then(|value| value.as_str()))
}
