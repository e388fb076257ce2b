use std::{sync::Arc, time::Duration};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// What a strategy hands to its transport after shaping the envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRequest {
    pub notification_id: String,
    pub user_id: i64,
    pub channel: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub body: String,
    pub attempt: u32,
}

/// The side that actually sends an email or SMS.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<(), Error>;
}

/// Posts delivery requests as JSON to an HTTP gateway.
pub struct HttpGateway {
    http_client: Client,
    url: String,
}

impl HttpGateway {
    pub fn new(url: String, timeout_seconds: u64) -> Result<Self, Error> {
        let http_client = Client::builder()
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .map_err(|e| anyhow!("Failed to create HTTP client: {}", e))?;

        info!(url = %url, "Delivery gateway client initialized");

        Ok(Self { http_client, url })
    }
}

#[async_trait]
impl DeliveryTransport for HttpGateway {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<(), Error> {
        debug!(
            notification_id = %request.notification_id,
            channel = %request.channel,
            url = %self.url,
            "Posting delivery request to gateway"
        );

        let response = self
            .http_client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| anyhow!("Gateway request failed: {}", e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let error_text = response.text().await.unwrap_or_default();
        Err(anyhow!(
            "Gateway returned status {}: {}",
            status,
            error_text
        ))
    }
}

/// Used when no gateway is configured: the delivery is only logged.
pub struct LogTransport;

#[async_trait]
impl DeliveryTransport for LogTransport {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<(), Error> {
        info!(
            notification_id = %request.notification_id,
            user_id = request.user_id,
            channel = %request.channel,
            subject = request.subject.as_deref().unwrap_or(""),
            body = %request.body,
            "Delivered notification (log transport)"
        );

        Ok(())
    }
}

/// Picks the HTTP gateway when a non-empty URL is configured.
pub fn transport_for(
    url: Option<&str>,
    timeout_seconds: u64,
) -> Result<Arc<dyn DeliveryTransport>, Error> {
    match url.map(str::trim).filter(|url| !url.is_empty()) {
        Some(url) => Ok(Arc::new(HttpGateway::new(url.to_string(), timeout_seconds)?)),
        None => Ok(Arc::new(LogTransport)),
    }
}
