use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use chrono::{DateTime, Utc};
use lapin::{BasicProperties, message::Delivery};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConsumerError;

/// Notification identity; producers send either a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotificationId {
    Number(i64),
    Text(String),
}

impl Display for NotificationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            NotificationId::Number(n) => write!(f, "{}", n),
            NotificationId::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Broker payload of one notification event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub id: NotificationId,
    pub user_id: i64,
    #[serde(rename = "type")]
    pub notification_type: String,
    #[serde(default)]
    pub payload: Value,
    pub status: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn parse(data: &[u8]) -> Result<Self, ConsumerError> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Email,
    Sms,
}

impl NotificationType {
    pub const ALL: [NotificationType; 2] = [NotificationType::Email, NotificationType::Sms];

    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Email => "email",
            NotificationType::Sms => "sms",
        }
    }

    pub fn queue_name(&self) -> String {
        format!("{}_notifications", self.as_str())
    }

    pub fn routing_key(&self) -> String {
        format!("notification.{}", self.as_str())
    }
}

impl Display for NotificationType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NotificationType {
    type Err = ConsumerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "email" => Ok(NotificationType::Email),
            "sms" => Ok(NotificationType::Sms),
            other => Err(ConsumerError::UnroutableType(other.to_string())),
        }
    }
}

/// A message as delivered from a work queue.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub delivery_tag: u64,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

impl From<Delivery> for InboundMessage {
    fn from(delivery: Delivery) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            routing_key: delivery.routing_key.as_str().to_string(),
            data: delivery.data,
            properties: delivery.properties,
        }
    }
}
