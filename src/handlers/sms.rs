use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use tracing::info;

use crate::{
    clients::gateway::{DeliveryRequest, DeliveryTransport},
    handlers::{Courier, NotificationHandler, Outcome, payload_str},
    models::message::{Envelope, NotificationType},
    recorder::OutcomeRecorder,
};

pub struct SmsHandler {
    courier: Courier,
}

impl SmsHandler {
    pub fn new(
        transport: Arc<dyn DeliveryTransport>,
        recorder: OutcomeRecorder,
        max_retries: u32,
    ) -> Self {
        Self {
            courier: Courier::new(transport, recorder, max_retries),
        }
    }

    pub fn build_request(envelope: &Envelope, retry_count: u32) -> Result<DeliveryRequest, Error> {
        let text = payload_str(envelope, &["message", "text"])
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                anyhow!(
                    "SMS payload for notification {} has no message text",
                    envelope.id
                )
            })?;

        Ok(DeliveryRequest {
            notification_id: envelope.id.to_string(),
            user_id: envelope.user_id,
            channel: NotificationType::Sms.to_string(),
            subject: None,
            body: text.to_string(),
            attempt: retry_count,
        })
    }
}

#[async_trait]
impl NotificationHandler for SmsHandler {
    async fn process(&self, envelope: &Envelope, retry_count: u32) -> Result<Outcome, Error> {
        info!(
            notification_id = %envelope.id,
            user_id = envelope.user_id,
            retry_count,
            "Processing SMS notification"
        );

        let request = Self::build_request(envelope, retry_count);
        self.courier.run(envelope, retry_count, request).await
    }
}
