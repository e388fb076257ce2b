//! Broker object graph: work, retry and dead-letter exchanges with one queue
//! of each kind per notification type.
//!
//! A retry is a republish into `<queue>_retry`, whose TTL expiry dead-letters
//! the message back to the work exchange at the original routing key. No
//! scheduler process is involved.

use anyhow::{Error, Result};
use lapin::{
    ExchangeKind,
    types::{AMQPValue, FieldTable},
};
use tracing::info;

use crate::{
    clients::rbmq::MessageBus,
    config::Config,
    models::message::NotificationType,
};

pub const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
pub const DEAD_LETTER_ROUTING_KEY_ARG: &str = "x-dead-letter-routing-key";
pub const MESSAGE_TTL_ARG: &str = "x-message-ttl";

/// Queue names and routing keys for one notification type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub notification_type: NotificationType,
    pub queue: String,
    pub routing_key: String,
    pub retry_queue: String,
    pub dead_letter_queue: String,
}

impl QueueBinding {
    pub fn for_type(notification_type: NotificationType) -> Self {
        let queue = notification_type.queue_name();

        Self {
            notification_type,
            routing_key: notification_type.routing_key(),
            retry_queue: format!("{}_retry", queue),
            dead_letter_queue: format!("{}_dlq", queue),
            queue,
        }
    }

    /// Key on the retry exchange; identical to the retry queue name.
    pub fn retry_routing_key(&self) -> &str {
        &self.retry_queue
    }

    /// Key on the dead-letter exchange; identical to the DLQ name.
    pub fn dead_letter_routing_key(&self) -> &str {
        &self.dead_letter_queue
    }
}

#[derive(Debug, Clone)]
pub struct Topology {
    pub work_exchange: String,
    pub retry_exchange: String,
    pub dead_letter_exchange: String,
    pub retry_delay_ms: u32,
    bindings: Vec<QueueBinding>,
}

impl Topology {
    pub fn new(
        work_exchange: String,
        retry_exchange: String,
        dead_letter_exchange: String,
        retry_delay_ms: u32,
    ) -> Self {
        Self {
            work_exchange,
            retry_exchange,
            dead_letter_exchange,
            retry_delay_ms,
            bindings: NotificationType::ALL
                .into_iter()
                .map(QueueBinding::for_type)
                .collect(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.work_exchange.clone(),
            config.retry_exchange.clone(),
            config.dead_letter_exchange.clone(),
            config.retry_delay_ms,
        )
    }

    pub fn bindings(&self) -> &[QueueBinding] {
        &self.bindings
    }

    pub fn binding(&self, notification_type: NotificationType) -> Option<&QueueBinding> {
        self.bindings
            .iter()
            .find(|binding| binding.notification_type == notification_type)
    }

    pub fn work_queue_arguments(&self, binding: &QueueBinding) -> FieldTable {
        let mut arguments = FieldTable::default();
        arguments.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(self.retry_exchange.as_str().into()),
        );
        arguments.insert(
            DEAD_LETTER_ROUTING_KEY_ARG.into(),
            AMQPValue::LongString(binding.retry_routing_key().into()),
        );
        arguments
    }

    pub fn retry_queue_arguments(&self, binding: &QueueBinding) -> FieldTable {
        let mut arguments = FieldTable::default();
        arguments.insert(
            MESSAGE_TTL_ARG.into(),
            AMQPValue::LongLongInt(i64::from(self.retry_delay_ms)),
        );
        arguments.insert(
            DEAD_LETTER_EXCHANGE_ARG.into(),
            AMQPValue::LongString(self.work_exchange.as_str().into()),
        );
        arguments.insert(
            DEAD_LETTER_ROUTING_KEY_ARG.into(),
            AMQPValue::LongString(binding.routing_key.as_str().into()),
        );
        arguments
    }

    /// Declares every exchange, queue and binding. Redeclaring with the same
    /// arguments is a no-op on the broker, so this runs on every startup.
    pub async fn setup(&self, bus: &dyn MessageBus) -> Result<(), Error> {
        bus.declare_exchange(&self.work_exchange, ExchangeKind::Topic)
            .await?;
        bus.declare_exchange(&self.retry_exchange, ExchangeKind::Direct)
            .await?;
        bus.declare_exchange(&self.dead_letter_exchange, ExchangeKind::Direct)
            .await?;

        for binding in &self.bindings {
            bus.declare_queue(&binding.queue, self.work_queue_arguments(binding))
                .await?;
            bus.bind_queue(&binding.queue, &self.work_exchange, &binding.routing_key)
                .await?;

            bus.declare_queue(&binding.retry_queue, self.retry_queue_arguments(binding))
                .await?;
            bus.bind_queue(
                &binding.retry_queue,
                &self.retry_exchange,
                binding.retry_routing_key(),
            )
            .await?;

            bus.declare_queue(&binding.dead_letter_queue, FieldTable::default())
                .await?;
            bus.bind_queue(
                &binding.dead_letter_queue,
                &self.dead_letter_exchange,
                binding.dead_letter_routing_key(),
            )
            .await?;

            info!(
                queue = %binding.queue,
                routing_key = %binding.routing_key,
                retry_queue = %binding.retry_queue,
                dead_letter_queue = %binding.dead_letter_queue,
                retry_delay_ms = self.retry_delay_ms,
                "Queue topology declared"
            );
        }

        Ok(())
    }
}
