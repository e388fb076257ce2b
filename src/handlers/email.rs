use std::sync::Arc;

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use tracing::{debug, info};

use crate::{
    clients::gateway::{DeliveryRequest, DeliveryTransport},
    handlers::{Courier, NotificationHandler, Outcome, payload_str},
    models::message::{Envelope, NotificationType},
    recorder::OutcomeRecorder,
};

pub struct EmailHandler {
    courier: Courier,
}

impl EmailHandler {
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
        if !envelope.payload.is_object() {
            return Err(anyhow!(
                "Email payload for notification {} must be an object",
                envelope.id
            ));
        }

        Ok(DeliveryRequest {
            notification_id: envelope.id.to_string(),
            user_id: envelope.user_id,
            channel: NotificationType::Email.to_string(),
            subject: payload_str(envelope, &["subject"]).map(str::to_string),
            body: payload_str(envelope, &["body", "html", "text"])
                .unwrap_or_default()
                .to_string(),
            attempt: retry_count,
        })
    }
}

#[async_trait]
impl NotificationHandler for EmailHandler {
    async fn process(&self, envelope: &Envelope, retry_count: u32) -> Result<Outcome, Error> {
        info!(
            notification_id = %envelope.id,
            user_id = envelope.user_id,
            retry_count,
            "Processing email notification"
        );

        let request = Self::build_request(envelope, retry_count);
        let outcome = self.courier.run(envelope, retry_count, request).await?;

        debug!(notification_id = %envelope.id, "Email notification processed successfully");

        Ok(outcome)
    }
}
