use anyhow::Result;
use lapin::{
    BasicProperties,
    types::{AMQPValue, FieldTable},
};
use notification_consumer::{
    error::ConsumerError,
    models::{
        headers::{self, RETRY_COUNT},
        message::{Envelope, NotificationId, NotificationType},
        status::OutcomeStatus,
    },
};
use serde_json::json;
use tokio_test::{assert_err, assert_ok};

use crate::support::email_envelope_json;

fn with_header(value: AMQPValue) -> BasicProperties {
    let mut table = FieldTable::default();
    table.insert(RETRY_COUNT.into(), value);
    BasicProperties::default().with_headers(table)
}

/// Test: A well-formed envelope parses with all fields
#[test]
fn test_envelope_parses_numeric_id() -> Result<()> {
    let data = serde_json::to_vec(&email_envelope_json())?;
    let envelope = assert_ok!(Envelope::parse(&data));

    assert_eq!(envelope.id, NotificationId::Number(42));
    assert_eq!(envelope.id.to_string(), "42");
    assert_eq!(envelope.user_id, 7);
    assert_eq!(envelope.notification_type, "email");
    assert_eq!(envelope.payload, json!({ "subject": "hi" }));
    assert_eq!(envelope.status, "pending");
    assert_eq!(envelope.created_at.to_rfc3339(), "2024-01-01T00:00:00+00:00");
    assert!(envelope.processed_at.is_none());

    Ok(())
}

/// Test: String ids are accepted as-is
#[test]
fn test_envelope_parses_string_id() -> Result<()> {
    let mut body = email_envelope_json();
    body["id"] = json!("a3c1f0d2");
    body["processed_at"] = json!("2024-01-01T00:00:05Z");

    let envelope = assert_ok!(Envelope::parse(&serde_json::to_vec(&body)?));

    assert_eq!(envelope.id, NotificationId::Text("a3c1f0d2".to_string()));
    assert_eq!(envelope.id.to_string(), "a3c1f0d2");
    assert!(envelope.processed_at.is_some());

    Ok(())
}

/// Test: Unknown type strings still parse; routing decides later
#[test]
fn test_envelope_keeps_unknown_type() -> Result<()> {
    let mut body = email_envelope_json();
    body["type"] = json!("push");

    let envelope = assert_ok!(Envelope::parse(&serde_json::to_vec(&body)?));
    assert_eq!(envelope.notification_type, "push");

    Ok(())
}

/// Test: Non-JSON bodies and missing fields are malformed
#[test]
fn test_malformed_envelopes_are_rejected() -> Result<()> {
    let error = assert_err!(Envelope::parse(b"{not json"));
    assert!(matches!(error, ConsumerError::MalformedMessage(_)));
    assert!(error.is_poison());

    let mut missing_type = email_envelope_json();
    if let Some(object) = missing_type.as_object_mut() {
        object.remove("type");
    }
    let error = assert_err!(Envelope::parse(&serde_json::to_vec(&missing_type)?));
    assert!(error.to_string().starts_with("Malformed message"));

    let mut bad_date = email_envelope_json();
    bad_date["created_at"] = json!("yesterday");
    assert_err!(Envelope::parse(&serde_json::to_vec(&bad_date)?));

    Ok(())
}

/// Test: Notification types map to their queues and routing keys
#[test]
fn test_notification_type_names() {
    assert_eq!(NotificationType::Email.queue_name(), "email_notifications");
    assert_eq!(NotificationType::Sms.queue_name(), "sms_notifications");
    assert_eq!(NotificationType::Email.routing_key(), "notification.email");
    assert_eq!(NotificationType::Sms.routing_key(), "notification.sms");
    assert_eq!(NotificationType::ALL.len(), 2);
}

/// Test: Parsing a type is exact and unknown types are unroutable
#[test]
fn test_notification_type_parsing() {
    assert_eq!(
        assert_ok!("email".parse::<NotificationType>()),
        NotificationType::Email
    );
    assert_eq!(
        assert_ok!("sms".parse::<NotificationType>()),
        NotificationType::Sms
    );

    let error = assert_err!("push".parse::<NotificationType>());
    assert!(matches!(&error, ConsumerError::UnroutableType(t) if t == "push"));
    assert!(error.is_poison());

    assert_err!("Email".parse::<NotificationType>());
}

/// Test: A missing retry-count header means the first attempt
#[test]
fn test_retry_count_defaults_to_zero() {
    assert_eq!(headers::retry_count(&BasicProperties::default()), 0);
    assert_eq!(
        headers::retry_count(&BasicProperties::default().with_headers(FieldTable::default())),
        0
    );
}

/// Test: Every integer encoding of retry-count is understood
#[test]
fn test_retry_count_reads_integer_variants() {
    assert_eq!(headers::retry_count(&with_header(AMQPValue::LongLongInt(3))), 3);
    assert_eq!(headers::retry_count(&with_header(AMQPValue::LongInt(2))), 2);
    assert_eq!(headers::retry_count(&with_header(AMQPValue::ShortShortUInt(1))), 1);
    assert_eq!(headers::retry_count(&with_header(AMQPValue::LongUInt(7))), 7);
}

/// Test: Negative or non-integer retry-count values read as zero
#[test]
fn test_retry_count_ignores_garbage() {
    assert_eq!(headers::retry_count(&with_header(AMQPValue::LongLongInt(-4))), 0);
    assert_eq!(
        headers::retry_count(&with_header(AMQPValue::LongString("2".into()))),
        0
    );
    assert_eq!(headers::retry_count(&with_header(AMQPValue::Boolean(true))), 0);
}

/// Test: with_retry_count overwrites the previous value
#[test]
fn test_with_retry_count_round_trips() {
    let first = headers::with_retry_count(&BasicProperties::default(), 1);
    let second = headers::with_retry_count(&first, 2);

    assert_eq!(headers::retry_count(&first), 1);
    assert_eq!(headers::retry_count(&second), 2);
    assert_eq!(
        headers::header(&second, RETRY_COUNT),
        Some(&AMQPValue::LongLongInt(2))
    );
}

/// Test: Terminal outcome statuses only accept themselves
#[test]
fn test_outcome_status_transitions() {
    assert!(OutcomeStatus::Pending.accepts(OutcomeStatus::Processing));
    assert!(OutcomeStatus::Processing.accepts(OutcomeStatus::Failed));
    assert!(OutcomeStatus::Processed.accepts(OutcomeStatus::Processed));
    assert!(!OutcomeStatus::Processed.accepts(OutcomeStatus::Failed));
    assert!(!OutcomeStatus::Failed.accepts(OutcomeStatus::Processed));
    assert!(!OutcomeStatus::Failed.accepts(OutcomeStatus::Pending));

    assert_eq!(
        assert_ok!("processed".parse::<OutcomeStatus>()),
        OutcomeStatus::Processed
    );
    assert_err!("done".parse::<OutcomeStatus>());
}
