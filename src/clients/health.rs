use std::{collections::HashMap, sync::Arc, time::Instant};

use tracing::{debug, warn};

use crate::{
    clients::{database::OutcomeStore, rbmq::BrokerStatus},
    models::health::{HealthCheckResponse, ServiceHealth},
};

pub struct HealthChecker {
    database: Arc<dyn OutcomeStore>,
    rabbitmq: Arc<dyn BrokerStatus>,
}

impl HealthChecker {
    pub fn new(database: Arc<dyn OutcomeStore>, rabbitmq: Arc<dyn BrokerStatus>) -> Self {
        Self { database, rabbitmq }
    }

    pub async fn check_all(&self) -> HealthCheckResponse {
        let mut checks = HashMap::new();

        checks.insert("database".to_string(), self.check_database().await);
        checks.insert("message_broker".to_string(), self.check_rabbitmq());

        HealthCheckResponse::from_checks(checks)
    }

    async fn check_database(&self) -> ServiceHealth {
        let start = Instant::now();

        match self.database.health_check().await {
            Ok(_) => {
                let elapsed = start.elapsed().as_millis() as u64;
                debug!(response_time_ms = elapsed, "Database health check passed");
                ServiceHealth::healthy(elapsed)
            }
            Err(e) => {
                warn!(error = %e, "Database health check failed");
                ServiceHealth::unhealthy(format!("Health check query failed: {}", e))
            }
        }
    }

    fn check_rabbitmq(&self) -> ServiceHealth {
        if self.rabbitmq.is_connected() {
            ServiceHealth::healthy(0)
        } else {
            warn!("RabbitMQ connection is not open");
            ServiceHealth::unhealthy("Connection closed".to_string())
        }
    }
}
