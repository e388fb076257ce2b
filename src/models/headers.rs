//! Out-of-band control data carried in AMQP message headers.

use chrono::{DateTime, SecondsFormat, Utc};
use lapin::{
    BasicProperties,
    types::{AMQPValue, FieldTable, ShortString},
};

pub const RETRY_COUNT: &str = "retry-count";
pub const DEATH_REASON: &str = "death-reason";
pub const DEATH_TIME: &str = "death-time";
pub const ORIGINAL_ROUTING_KEY: &str = "original-routing-key";

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const PERSISTENT: u8 = 2;

pub fn header<'a>(properties: &'a BasicProperties, name: &str) -> Option<&'a AMQPValue> {
    properties
        .headers()
        .as_ref()
        .and_then(|headers| headers.inner().get(&ShortString::from(name)))
}

/// Reads `retry-count`; absent or unreadable means the first attempt.
pub fn retry_count(properties: &BasicProperties) -> u32 {
    let Some(value) = header(properties, RETRY_COUNT) else {
        return 0;
    };

    let count: i64 = match value {
        AMQPValue::ShortShortInt(v) => i64::from(*v),
        AMQPValue::ShortShortUInt(v) => i64::from(*v),
        AMQPValue::ShortInt(v) => i64::from(*v),
        AMQPValue::ShortUInt(v) => i64::from(*v),
        AMQPValue::LongInt(v) => i64::from(*v),
        AMQPValue::LongUInt(v) => i64::from(*v),
        AMQPValue::LongLongInt(v) => *v,
        _ => 0,
    };

    u32::try_from(count.max(0)).unwrap_or(u32::MAX)
}

/// Properties for republishing a message: the original properties with
/// persistent delivery and a JSON content type when none was set.
fn republished(properties: &BasicProperties, headers: FieldTable) -> BasicProperties {
    let mut republished = properties
        .clone()
        .with_headers(headers)
        .with_delivery_mode(PERSISTENT);

    if properties.content_type().is_none() {
        republished = republished.with_content_type(JSON_CONTENT_TYPE.into());
    }

    republished
}

fn existing_headers(properties: &BasicProperties) -> FieldTable {
    properties.headers().clone().unwrap_or_default()
}

pub fn with_retry_count(properties: &BasicProperties, retry_count: u32) -> BasicProperties {
    let mut headers = existing_headers(properties);
    headers.insert(
        RETRY_COUNT.into(),
        AMQPValue::LongLongInt(i64::from(retry_count)),
    );

    republished(properties, headers)
}

pub fn with_death(
    properties: &BasicProperties,
    reason: &str,
    died_at: DateTime<Utc>,
    original_routing_key: &str,
) -> BasicProperties {
    let reason = if reason.trim().is_empty() {
        "unknown failure"
    } else {
        reason
    };

    let mut headers = existing_headers(properties);
    headers.insert(DEATH_REASON.into(), AMQPValue::LongString(reason.into()));
    headers.insert(
        DEATH_TIME.into(),
        AMQPValue::LongString(
            died_at
                .to_rfc3339_opts(SecondsFormat::Millis, true)
                .as_str()
                .into(),
        ),
    );
    headers.insert(
        ORIGINAL_ROUTING_KEY.into(),
        AMQPValue::LongString(original_routing_key.into()),
    );

    republished(properties, headers)
}
