use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, error, info};

use crate::models::{
    outcome::{OutcomeRecord, OutcomeSummary, OutcomeUpdate},
    status::OutcomeStatus,
};

/// Persistence of notification outcomes keyed by notification id.
///
/// `upsert_outcome` must be a single atomic insert-or-update so concurrent
/// redeliveries of the same id cannot race each other.
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    async fn upsert_outcome(&self, update: &OutcomeUpdate) -> Result<OutcomeRecord, Error>;

    async fn find_outcome(&self, notification_id: &str) -> Result<Option<OutcomeRecord>, Error>;

    async fn summary(&self) -> Result<OutcomeSummary, Error>;

    /// Newest first; `page` starts at 1. Returns the page and the total count.
    async fn list_outcomes(
        &self,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<OutcomeRecord>, u64), Error>;

    async fn health_check(&self) -> Result<(), Error>;
}

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS notification_outcomes (
        notification_id TEXT PRIMARY KEY,
        user_id BIGINT,
        notification_type TEXT,
        payload JSONB,
        status TEXT NOT NULL DEFAULT 'pending'
            CHECK (status IN ('pending', 'processing', 'processed', 'failed')),
        retry_count INTEGER NOT NULL DEFAULT 0,
        processed_at TIMESTAMPTZ,
        failed_at TIMESTAMPTZ,
        created_at TIMESTAMPTZ NOT NULL DEFAULT now()
    );
    CREATE INDEX IF NOT EXISTS notification_outcomes_status_idx
        ON notification_outcomes (status);
"#;

const COLUMNS: &str = "notification_id, user_id, notification_type, payload, status, \
                       retry_count, processed_at, failed_at, created_at";

pub struct DatabaseClient {
    client: Client,
}

impl DatabaseClient {
    pub async fn connect(database_url: &str) -> Result<Self, Error> {
        info!("Connecting to PostgreSQL database");

        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .map_err(|e| anyhow!("Failed to connect to database: {}", e))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "PostgreSQL connection terminated");
            }
        });

        info!("PostgreSQL connection established");

        Ok(Self { client })
    }

    pub async fn migrate(&self) -> Result<(), Error> {
        self.client
            .batch_execute(SCHEMA)
            .await
            .map_err(|e| anyhow!("Failed to create notification_outcomes table: {}", e))?;

        debug!("notification_outcomes table ready");

        Ok(())
    }
}

#[async_trait]
impl OutcomeStore for DatabaseClient {
    async fn upsert_outcome(&self, update: &OutcomeUpdate) -> Result<OutcomeRecord, Error> {
        let retry_count = i32::try_from(update.retry_count)?;
        let status = update.status.as_str();

        // A terminal row is only rewritten by the same terminal status, and
        // retry_count never moves backwards.
        let query = format!(
            r#"
            INSERT INTO notification_outcomes (
                notification_id,
                user_id,
                notification_type,
                payload,
                status,
                retry_count,
                processed_at,
                failed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (notification_id) DO UPDATE SET
                user_id = COALESCE(EXCLUDED.user_id, notification_outcomes.user_id),
                notification_type = COALESCE(EXCLUDED.notification_type, notification_outcomes.notification_type),
                payload = COALESCE(EXCLUDED.payload, notification_outcomes.payload),
                status = EXCLUDED.status,
                retry_count = GREATEST(notification_outcomes.retry_count, EXCLUDED.retry_count),
                processed_at = EXCLUDED.processed_at,
                failed_at = EXCLUDED.failed_at
            WHERE notification_outcomes.status NOT IN ('processed', 'failed')
               OR notification_outcomes.status = EXCLUDED.status
            RETURNING {}
            "#,
            COLUMNS
        );

        let row = self
            .client
            .query_opt(
                &query,
                &[
                    &update.notification_id,
                    &update.user_id,
                    &update.notification_type,
                    &update.payload,
                    &status,
                    &retry_count,
                    &update.processed_at,
                    &update.failed_at,
                ],
            )
            .await
            .map_err(|e| {
                error!(
                    error = %e,
                    notification_id = %update.notification_id,
                    "Failed to upsert notification outcome"
                );
                anyhow!("Database write failed: {}", e)
            })?;

        let record = match row {
            Some(row) => record_from_row(&row)?,
            None => {
                let existing = self
                    .find_outcome(&update.notification_id)
                    .await?
                    .ok_or_else(|| {
                        anyhow!("Outcome {} vanished during upsert", update.notification_id)
                    })?;
                debug!(
                    notification_id = %update.notification_id,
                    current = %existing.status,
                    requested = %update.status,
                    "Outcome already terminal, write ignored"
                );
                existing
            }
        };

        debug!(
            notification_id = %record.notification_id,
            status = %record.status,
            retry_count = record.retry_count,
            "Outcome written to database"
        );

        Ok(record)
    }

    async fn find_outcome(&self, notification_id: &str) -> Result<Option<OutcomeRecord>, Error> {
        let query = format!(
            "SELECT {} FROM notification_outcomes WHERE notification_id = $1",
            COLUMNS
        );

        let row = self
            .client
            .query_opt(&query, &[&notification_id])
            .await
            .map_err(|e| anyhow!("Failed to read outcome {}: {}", notification_id, e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    async fn summary(&self) -> Result<OutcomeSummary, Error> {
        let rows = self
            .client
            .query(
                "SELECT status, COUNT(*) AS total FROM notification_outcomes GROUP BY status",
                &[],
            )
            .await
            .map_err(|e| anyhow!("Failed to summarise outcomes: {}", e))?;

        let mut summary = OutcomeSummary::default();
        for row in rows {
            let status: OutcomeStatus = row.try_get::<_, String>("status")?.parse()?;
            let total: i64 = row.try_get("total")?;
            summary.add(status, u64::try_from(total).unwrap_or(0));
        }

        Ok(summary)
    }

    async fn list_outcomes(
        &self,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<OutcomeRecord>, u64), Error> {
        let limit = i64::try_from(limit)?;
        let offset = i64::try_from(page.saturating_sub(1))?.saturating_mul(limit);

        let query = format!(
            "SELECT {} FROM notification_outcomes ORDER BY created_at DESC, notification_id \
             LIMIT $1 OFFSET $2",
            COLUMNS
        );
        let rows = self
            .client
            .query(&query, &[&limit, &offset])
            .await
            .map_err(|e| anyhow!("Failed to list outcomes: {}", e))?;

        let total: i64 = self
            .client
            .query_one("SELECT COUNT(*) FROM notification_outcomes", &[])
            .await
            .map_err(|e| anyhow!("Failed to count outcomes: {}", e))?
            .try_get(0)?;

        let records = rows
            .iter()
            .map(record_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok((records, u64::try_from(total).unwrap_or(0)))
    }

    async fn health_check(&self) -> Result<(), Error> {
        self.client
            .query_one("SELECT 1", &[])
            .await
            .map_err(|e| anyhow!("Database health check failed: {}", e))?;

        Ok(())
    }
}

fn record_from_row(row: &Row) -> Result<OutcomeRecord, Error> {
    let retry_count: i32 = row.try_get("retry_count")?;

    Ok(OutcomeRecord {
        notification_id: row.try_get("notification_id")?,
        user_id: row.try_get("user_id")?,
        notification_type: row.try_get("notification_type")?,
        payload: row.try_get("payload")?,
        status: row.try_get::<_, String>("status")?.parse()?,
        retry_count: u32::try_from(retry_count).unwrap_or(0),
        processed_at: row.try_get("processed_at")?,
        failed_at: row.try_get("failed_at")?,
        created_at: row.try_get("created_at")?,
    })
}
