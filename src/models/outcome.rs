use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::models::{message::Envelope, status::OutcomeStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeRecord {
    pub notification_id: String,
    pub user_id: Option<i64>,
    pub notification_type: Option<String>,
    pub payload: Option<JsonValue>,
    pub status: OutcomeStatus,
    pub retry_count: u32,
    pub processed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// One idempotent write keyed by notification id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutcomeUpdate {
    pub notification_id: String,
    pub status: OutcomeStatus,
    pub retry_count: u32,
    pub processed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub user_id: Option<i64>,
    pub notification_type: Option<String>,
    pub payload: Option<JsonValue>,
}

impl OutcomeUpdate {
    pub fn new(notification_id: String, status: OutcomeStatus, retry_count: u32) -> Self {
        Self {
            notification_id,
            status,
            retry_count,
            processed_at: None,
            failed_at: None,
            user_id: None,
            notification_type: None,
            payload: None,
        }
    }

    /// Successful terminal processing: `failed_at` is cleared.
    pub fn processed(notification_id: String, retry_count: u32, at: DateTime<Utc>) -> Self {
        Self::new(notification_id, OutcomeStatus::Processed, retry_count).with_processed_at(at)
    }

    pub fn failed(notification_id: String, retry_count: u32, at: DateTime<Utc>) -> Self {
        Self::new(notification_id, OutcomeStatus::Failed, retry_count).with_failed_at(at)
    }

    pub fn with_processed_at(mut self, at: DateTime<Utc>) -> Self {
        self.processed_at = Some(at);
        self
    }

    pub fn with_failed_at(mut self, at: DateTime<Utc>) -> Self {
        self.failed_at = Some(at);
        self
    }

    pub fn with_envelope(mut self, envelope: &Envelope) -> Self {
        self.user_id = Some(envelope.user_id);
        self.notification_type = Some(envelope.notification_type.clone());
        self.payload = Some(envelope.payload.clone());
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutcomeSummary {
    pub pending: u64,
    pub processing: u64,
    pub processed: u64,
    pub failed: u64,
    pub total: u64,
}

impl OutcomeSummary {
    pub fn add(&mut self, status: OutcomeStatus, count: u64) {
        match status {
            OutcomeStatus::Pending => self.pending += count,
            OutcomeStatus::Processing => self.processing += count,
            OutcomeStatus::Processed => self.processed += count,
            OutcomeStatus::Failed => self.failed += count,
        }
        self.total += count;
    }
}
