use std::sync::Arc;

use anyhow::{Error, Result};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::{
    clients::database::OutcomeStore,
    error::ConsumerError,
    models::{
        message::Envelope,
        outcome::{OutcomeRecord, OutcomeUpdate},
        retry::RetryConfig,
        status::OutcomeStatus,
    },
    utils::retry_with_backoff,
};

/// Writes terminal outcomes, retrying transient store errors locally.
///
/// Safe to retry because every write is an idempotent upsert.
#[derive(Clone)]
pub struct OutcomeRecorder {
    store: Arc<dyn OutcomeStore>,
    retry_config: RetryConfig,
}

impl OutcomeRecorder {
    pub fn new(store: Arc<dyn OutcomeStore>, retry_config: RetryConfig) -> Self {
        Self {
            store,
            retry_config,
        }
    }

    /// Fails with [`ConsumerError::OutcomeAlreadyFinal`] when the record had
    /// already reached another terminal status and the write was ignored.
    pub async fn processed(
        &self,
        envelope: &Envelope,
        retry_count: u32,
        processed_at: DateTime<Utc>,
    ) -> Result<OutcomeRecord, Error> {
        let update = OutcomeUpdate::processed(envelope.id.to_string(), retry_count, processed_at)
            .with_envelope(envelope);
        let record = self.write(update).await?;

        if record.status != OutcomeStatus::Processed {
            return Err(ConsumerError::OutcomeAlreadyFinal {
                notification_id: record.notification_id,
                status: record.status,
            }
            .into());
        }

        Ok(record)
    }

    pub async fn failed(
        &self,
        envelope: &Envelope,
        retry_count: u32,
        failed_at: DateTime<Utc>,
    ) -> Result<OutcomeRecord, Error> {
        let update = OutcomeUpdate::failed(envelope.id.to_string(), retry_count, failed_at)
            .with_envelope(envelope);
        self.write(update).await
    }

    async fn write(&self, update: OutcomeUpdate) -> Result<OutcomeRecord, Error> {
        let record = retry_with_backoff(&self.retry_config, || {
            let store = Arc::clone(&self.store);
            let update = update.clone();
            async move { store.upsert_outcome(&update).await }
        })
        .await?;

        info!(
            notification_id = %record.notification_id,
            status = %record.status,
            retry_count = record.retry_count,
            "Notification outcome recorded"
        );

        Ok(record)
    }
}
