use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use futures_util::{StreamExt, stream::BoxStream};
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions,
        QueueDeclareOptions,
    },
    types::FieldTable,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{config::Config, models::message::InboundMessage};

pub type DeliveryStream = BoxStream<'static, Result<InboundMessage, Error>>;

/// Broker operations the consumer pipeline relies on.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), Error>;

    async fn declare_queue(&self, name: &str, arguments: FieldTable) -> Result<(), Error>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
    -> Result<(), Error>;

    /// Returns once the broker has confirmed the message.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), Error>;

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error>;
}

/// The process-wide broker connection. Channels are opened per work queue.
pub struct RabbitMqClient {
    connection: Connection,
    prefetch_count: u16,
}

impl RabbitMqClient {
    pub async fn connect(config: &Config) -> Result<Self, Error> {
        info!("Connecting to RabbitMQ");

        let connection = Connection::connect(&config.rabbitmq_url, ConnectionProperties::default())
            .await
            .map_err(|e| anyhow!("Failed to connect to RabbitMQ: {}", e))?;

        info!("RabbitMQ connection established");

        Ok(Self {
            connection,
            prefetch_count: config.prefetch_count,
        })
    }

    pub async fn open_channel(&self) -> Result<RabbitMqChannel, Error> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| anyhow!("RabbitMQ channel creation failed: {}", e))?;

        channel
            .basic_qos(self.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to set up QoS: {}", e))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to enable publisher confirms: {}", e))?;

        debug!(
            channel_id = channel.id(),
            prefetch_count = self.prefetch_count,
            "RabbitMQ channel opened"
        );

        Ok(RabbitMqChannel { channel })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn close(&self) {
        if !self.is_connected() {
            return;
        }

        match self.connection.close(200, "Consumer shutting down".into()).await {
            Ok(_) => info!("RabbitMQ connection closed"),
            Err(e) => warn!(error = %e, "Failed to close RabbitMQ connection cleanly"),
        }
    }
}

/// Connection liveness as reported to the health endpoint.
pub trait BrokerStatus: Send + Sync {
    fn is_connected(&self) -> bool;
}

impl BrokerStatus for RabbitMqClient {
    fn is_connected(&self) -> bool {
        RabbitMqClient::is_connected(self)
    }
}

pub struct RabbitMqChannel {
    channel: Channel,
}

impl RabbitMqChannel {
    pub async fn consume(&self, queue: &str) -> Result<DeliveryStream, Error> {
        let consumer_tag = format!("{}-{}", queue, Uuid::new_v4());

        let consumer = self
            .channel
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to create consumer for {}: {}", queue, e))?;

        info!(queue, consumer_tag = %consumer_tag, "Consumer created for queue");

        Ok(consumer
            .map(|delivery| delivery.map(InboundMessage::from).map_err(Error::from))
            .boxed())
    }
}

#[async_trait]
impl MessageBus for RabbitMqChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), Error> {
        self.channel
            .exchange_declare(
                name,
                kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to declare exchange {}: {}", name, e))?;

        Ok(())
    }

    async fn declare_queue(&self, name: &str, arguments: FieldTable) -> Result<(), Error> {
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| anyhow!("Failed to declare queue {}: {}", name, e))?;

        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| anyhow!("Failed to bind queue {} to {}: {}", queue, exchange, e))?;

        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), Error> {
        let confirmation = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| anyhow!("Failed to publish message to {}: {}", exchange, e))?
            .await
            .map_err(|e| anyhow!("Publish to {} was not confirmed: {}", exchange, e))?;

        if confirmation.is_nack() {
            return Err(anyhow!("Broker rejected message published to {}", exchange));
        }

        Ok(())
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| anyhow!("Failed to acknowledge message: {}", e))?;

        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue })
            .await
            .map_err(|e| anyhow!("Failed to reject message: {}", e))?;

        Ok(())
    }
}
