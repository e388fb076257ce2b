use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    },
};

use anyhow::{Error, Result, anyhow};
use async_trait::async_trait;
use chrono::Utc;
use lapin::{BasicProperties, ExchangeKind, types::FieldTable};
use notification_consumer::{
    clients::{
        database::OutcomeStore,
        gateway::{DeliveryRequest, DeliveryTransport},
        rbmq::{BrokerStatus, MessageBus},
    },
    dispatcher::{Dispatcher, Settlement},
    failure::FailureController,
    handlers::{EmailHandler, HandlerRegistry, SmsHandler},
    models::{
        headers::{JSON_CONTENT_TYPE, PERSISTENT},
        message::{InboundMessage, NotificationType},
        outcome::{OutcomeRecord, OutcomeSummary, OutcomeUpdate},
        retry::RetryConfig,
    },
    recorder::OutcomeRecorder,
    topology::{QueueBinding, Topology},
};
use serde_json::json;

pub const MAX_RETRIES: u32 = 3;

#[derive(Debug, Clone)]
pub struct Published {
    pub exchange: String,
    pub routing_key: String,
    pub data: Vec<u8>,
    pub properties: BasicProperties,
}

#[derive(Default)]
pub struct BusState {
    pub exchanges: Vec<(String, ExchangeKind)>,
    pub queues: Vec<(String, FieldTable)>,
    pub bindings: Vec<(String, String, String)>,
    pub published: Vec<Published>,
    pub acked: Vec<u64>,
    pub rejected: Vec<(u64, bool)>,
}

/// Records every broker call instead of talking to RabbitMQ.
#[derive(Default)]
pub struct MemoryBus {
    state: Mutex<BusState>,
    fail_publish: AtomicBool,
}

impl MemoryBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn with_state<T>(&self, f: impl FnOnce(&BusState) -> T) -> T {
        let state = self.state.lock().unwrap();
        f(&state)
    }

    pub fn published_to(&self, exchange: &str) -> Vec<Published> {
        self.with_state(|state| {
            state
                .published
                .iter()
                .filter(|message| message.exchange == exchange)
                .cloned()
                .collect()
        })
    }

    pub fn acked(&self) -> Vec<u64> {
        self.with_state(|state| state.acked.clone())
    }

    pub fn rejected(&self) -> Vec<(u64, bool)> {
        self.with_state(|state| state.rejected.clone())
    }
}

#[async_trait]
impl MessageBus for MemoryBus {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.exchanges.iter().any(|(existing, _)| existing == name) {
            state.exchanges.push((name.to_string(), kind));
        }
        Ok(())
    }

    async fn declare_queue(&self, name: &str, arguments: FieldTable) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if !state.queues.iter().any(|(existing, _)| existing == name) {
            state.queues.push((name.to_string(), arguments));
        }
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), Error> {
        let binding = (
            queue.to_string(),
            exchange.to_string(),
            routing_key.to_string(),
        );
        let mut state = self.state.lock().unwrap();
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), Error> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(anyhow!("Connection reset by peer"));
        }

        self.state.lock().unwrap().published.push(Published {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            data: payload.to_vec(),
            properties,
        });
        Ok(())
    }

    async fn acknowledge(&self, delivery_tag: u64) -> Result<(), Error> {
        self.state.lock().unwrap().acked.push(delivery_tag);
        Ok(())
    }

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), Error> {
        self.state
            .lock()
            .unwrap()
            .rejected
            .push((delivery_tag, requeue));
        Ok(())
    }
}

/// Outcome store with the same conflict rules as the Postgres upsert.
#[derive(Default)]
pub struct MemoryOutcomeStore {
    records: Mutex<HashMap<String, OutcomeRecord>>,
    writes: AtomicU32,
    failures_remaining: AtomicU32,
}

impl MemoryOutcomeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next_writes(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn record(&self, notification_id: &str) -> Option<OutcomeRecord> {
        self.records.lock().unwrap().get(notification_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

#[async_trait]
impl OutcomeStore for MemoryOutcomeStore {
    async fn upsert_outcome(&self, update: &OutcomeUpdate) -> Result<OutcomeRecord, Error> {
        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(anyhow!("connection to server was lost"));
        }

        self.writes.fetch_add(1, Ordering::SeqCst);

        let mut records = self.records.lock().unwrap();
        let record = records
            .entry(update.notification_id.clone())
            .and_modify(|existing| {
                if existing.status.accepts(update.status) {
                    existing.user_id = update.user_id.or(existing.user_id);
                    existing.notification_type = update
                        .notification_type
                        .clone()
                        .or(existing.notification_type.take());
                    existing.payload = update.payload.clone().or(existing.payload.take());
                    existing.status = update.status;
                    existing.retry_count = existing.retry_count.max(update.retry_count);
                    existing.processed_at = update.processed_at;
                    existing.failed_at = update.failed_at;
                }
            })
            .or_insert_with(|| OutcomeRecord {
                notification_id: update.notification_id.clone(),
                user_id: update.user_id,
                notification_type: update.notification_type.clone(),
                payload: update.payload.clone(),
                status: update.status,
                retry_count: update.retry_count,
                processed_at: update.processed_at,
                failed_at: update.failed_at,
                created_at: Utc::now(),
            });

        Ok(record.clone())
    }

    async fn find_outcome(&self, notification_id: &str) -> Result<Option<OutcomeRecord>, Error> {
        Ok(self.record(notification_id))
    }

    async fn summary(&self) -> Result<OutcomeSummary, Error> {
        let mut summary = OutcomeSummary::default();
        for record in self.records.lock().unwrap().values() {
            summary.add(record.status, 1);
        }
        Ok(summary)
    }

    async fn list_outcomes(
        &self,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<OutcomeRecord>, u64), Error> {
        let mut records: Vec<OutcomeRecord> =
            self.records.lock().unwrap().values().cloned().collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.notification_id.cmp(&b.notification_id))
        });

        let total = records.len() as u64;
        let skip = (page.saturating_sub(1) * limit) as usize;
        let page = records.into_iter().skip(skip).take(limit as usize).collect();

        Ok((page, total))
    }

    async fn health_check(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Broker liveness fixed at construction.
pub struct FixedBrokerStatus(pub bool);

impl BrokerStatus for FixedBrokerStatus {
    fn is_connected(&self) -> bool {
        self.0
    }
}

/// Fails the first `failures` deliveries, then succeeds.
pub struct ScriptedTransport {
    failures_remaining: AtomicU32,
    requests: Mutex<Vec<DeliveryRequest>>,
}

impl ScriptedTransport {
    pub fn failing(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures_remaining: AtomicU32::new(failures),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn always_failing() -> Arc<Self> {
        Self::failing(u32::MAX)
    }

    pub fn requests(&self) -> Vec<DeliveryRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn attempts(&self) -> Vec<u32> {
        self.requests()
            .iter()
            .map(|request| request.attempt)
            .collect()
    }
}

#[async_trait]
impl DeliveryTransport for ScriptedTransport {
    async fn deliver(&self, request: &DeliveryRequest) -> Result<(), Error> {
        self.requests.lock().unwrap().push(request.clone());

        let failing = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            Err(anyhow!("SMTP relay timed out"))
        } else {
            Ok(())
        }
    }
}

pub fn fast_write_retries() -> RetryConfig {
    RetryConfig {
        max_attempts: 3,
        initial_delay_ms: 1,
        max_delay_ms: 5,
        backoff_multiplier: 2,
    }
}

pub fn test_topology() -> Topology {
    Topology::new(
        "notifications_topic".to_string(),
        "notifications_retry".to_string(),
        "notifications_dlx".to_string(),
        5_000,
    )
}

pub fn email_envelope_json() -> serde_json::Value {
    json!({
        "id": 42,
        "user_id": 7,
        "type": "email",
        "payload": { "subject": "hi" },
        "status": "pending",
        "created_at": "2024-01-01T00:00:00Z"
    })
}

pub fn json_properties() -> BasicProperties {
    BasicProperties::default()
        .with_content_type(JSON_CONTENT_TYPE.into())
        .with_delivery_mode(PERSISTENT)
}

pub fn inbound(delivery_tag: u64, routing_key: &str, body: &serde_json::Value) -> InboundMessage {
    InboundMessage {
        delivery_tag,
        routing_key: routing_key.to_string(),
        data: serde_json::to_vec(body).unwrap(),
        properties: json_properties(),
    }
}

pub fn raw_inbound(delivery_tag: u64, routing_key: &str, data: &[u8]) -> InboundMessage {
    InboundMessage {
        delivery_tag,
        routing_key: routing_key.to_string(),
        data: data.to_vec(),
        properties: json_properties(),
    }
}

/// The consumer pipeline wired to in-memory collaborators.
pub struct Harness {
    pub bus: Arc<MemoryBus>,
    pub store: Arc<MemoryOutcomeStore>,
    pub email: Arc<ScriptedTransport>,
    pub sms: Arc<ScriptedTransport>,
    pub topology: Topology,
    pub registry: Arc<HandlerRegistry>,
    pub recorder: OutcomeRecorder,
    next_tag: AtomicU64,
}

impl Harness {
    pub fn new(email: Arc<ScriptedTransport>, sms: Arc<ScriptedTransport>) -> Self {
        let bus = MemoryBus::new();
        let store = MemoryOutcomeStore::new();
        let store_handle: Arc<dyn OutcomeStore> = store.clone();
        let recorder = OutcomeRecorder::new(store_handle, fast_write_retries());

        let email_transport: Arc<dyn DeliveryTransport> = email.clone();
        let sms_transport: Arc<dyn DeliveryTransport> = sms.clone();
        let registry = Arc::new(HandlerRegistry::new(
            EmailHandler::new(email_transport, recorder.clone(), MAX_RETRIES),
            SmsHandler::new(sms_transport, recorder.clone(), MAX_RETRIES),
        ));

        Self {
            bus,
            store,
            email,
            sms,
            topology: test_topology(),
            registry,
            recorder,
            next_tag: AtomicU64::new(1000),
        }
    }

    pub fn with_email_failures(failures: u32) -> Self {
        Self::new(ScriptedTransport::failing(failures), ScriptedTransport::failing(0))
    }

    pub fn binding(&self, notification_type: NotificationType) -> QueueBinding {
        QueueBinding::for_type(notification_type)
    }

    pub fn dispatcher(&self, notification_type: NotificationType) -> Dispatcher {
        let binding = self.binding(notification_type);
        let bus: Arc<dyn MessageBus> = self.bus.clone();
        let failures = FailureController::new(
            Arc::clone(&bus),
            &self.topology,
            binding.clone(),
            self.recorder.clone(),
            MAX_RETRIES,
        );

        Dispatcher::new(
            binding,
            bus,
            Arc::clone(&self.registry),
            failures,
            self.recorder.clone(),
        )
    }

    /// Feeds `message` to the dispatcher and replays every retry publish back
    /// into the work queue, the way the retry queue's TTL expiry does.
    pub async fn deliver_until_settled(
        &self,
        notification_type: NotificationType,
        message: InboundMessage,
    ) -> Vec<Settlement> {
        let dispatcher = self.dispatcher(notification_type);
        let binding = self.binding(notification_type);
        let mut settlements = Vec::new();
        let mut next = Some(message);

        while let Some(message) = next.take() {
            let settlement = dispatcher.handle_delivery(message).await.unwrap();

            if let Settlement::Retried { .. } = settlement {
                let retried = self
                    .bus
                    .published_to(&self.topology.retry_exchange)
                    .pop()
                    .expect("retry publish");
                next = Some(InboundMessage {
                    delivery_tag: self.next_tag.fetch_add(1, Ordering::SeqCst),
                    routing_key: binding.routing_key.clone(),
                    data: retried.data,
                    properties: retried.properties,
                });
            }

            settlements.push(settlement);
        }

        settlements
    }
}
