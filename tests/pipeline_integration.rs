//! Pipeline Integration Tests
//!
//! Drives `SubscribePipeline::process_batch` against mocked broker and
//! service ports: event production, atomic republishing, commit behavior on
//! failure, and the bounded worker pool.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uniquery::access::{AccessError, DataModelQuery, EventModelAccess, ModelCache};
use uniquery::broker::{
    BrokerError, EventProducer, IncomingRecord, OutgoingMessage, RecordConsumer, TopicAdmin,
};
use uniquery::engine::{EventEngine, LevelStore};
use uniquery::model::{
    DetectRule, EventKind, EventModel, EventQuery, FilterExpress, FormulaItem, Level, Locale,
    LogicFilter, SourceRecords,
};
use uniquery::pipeline::SubscribePipeline;

// =============================================================================
// Test Helpers
// =============================================================================

struct QueueConsumer {
    batches: Mutex<VecDeque<Vec<IncomingRecord>>>,
    commits: AtomicUsize,
}

impl QueueConsumer {
    fn new(batches: Vec<Vec<IncomingRecord>>) -> Self {
        Self { batches: Mutex::new(batches.into()), commits: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl RecordConsumer for QueueConsumer {
    fn subscribe(&self, _topics: &[String]) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn poll_batch(&self) -> Result<Vec<IncomingRecord>, BrokerError> {
        Ok(self.batches.lock().unwrap().pop_front().unwrap_or_default())
    }

    fn commit(&self) -> Result<(), BrokerError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct RecordingProducer {
    transactions: Mutex<Vec<Vec<OutgoingMessage>>>,
    fail: bool,
}

impl RecordingProducer {
    fn new() -> Self {
        Self { transactions: Mutex::new(Vec::new()), fail: false }
    }

    fn failing() -> Self {
        Self { transactions: Mutex::new(Vec::new()), fail: true }
    }
}

#[async_trait]
impl EventProducer for RecordingProducer {
    async fn produce_transactional(&self, messages: &[OutgoingMessage]) -> Result<(), BrokerError> {
        if self.fail && !messages.is_empty() {
            return Err(BrokerError::DeliveryCanceled);
        }
        self.transactions.lock().unwrap().push(messages.to_vec());
        Ok(())
    }
}

struct NoopAdmin;

#[async_trait]
impl TopicAdmin for NoopAdmin {
    fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        Ok(Vec::new())
    }

    async fn create_topics_if_absent(&self, _topics: &[String]) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Model access returning one atomic model per source, tracking how many
/// lookups run concurrently.
struct TrackingModelAccess {
    model_type: String,
    detect_rule_type: String,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl TrackingModelAccess {
    fn atomic() -> Self {
        Self {
            model_type: "atomic".into(),
            detect_rule_type: "range_detect".into(),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    fn agi() -> Self {
        Self {
            model_type: "atomic".into(),
            detect_rule_type: "agi_detect".into(),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl EventModelAccess for TrackingModelAccess {
    async fn get_event_model_by_id(&self, _id: &str) -> Result<Option<EventModel>, AccessError> {
        Ok(None)
    }

    async fn get_event_models_by_source_id(
        &self,
        source_id: &str,
    ) -> Result<Vec<EventModel>, AccessError> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        Ok(vec![EventModel {
            id: format!("model-{source_id}"),
            name: "cpu-high".into(),
            model_type: self.model_type.clone(),
            data_source_type: "data_view".into(),
            data_source: vec![source_id.to_owned()],
            detect_rule: DetectRule {
                rule_type: self.detect_rule_type.clone(),
                formula: vec![FormulaItem {
                    level: Level::Critical,
                    filter: LogicFilter {
                        filter_express: FilterExpress {
                            name: "value".into(),
                            operation: ">".into(),
                            value: json!(1),
                        },
                        ..Default::default()
                    },
                }],
                ..Default::default()
            },
            ..Default::default()
        }])
    }
}

struct EmptyDataQuery;

#[async_trait]
impl DataModelQuery for EmptyDataQuery {
    async fn fetch_source_records(
        &self,
        _model: &EventModel,
        _query: &EventQuery,
    ) -> Result<SourceRecords, AccessError> {
        Ok(SourceRecords::default())
    }
}

fn incoming(source_id: &str, payload: serde_json::Value) -> IncomingRecord {
    IncomingRecord {
        topic: "acme.mdl.view".into(),
        payload: payload.to_string().into_bytes(),
        source_id: source_id.into(),
        source_type: "data_view".into(),
    }
}

fn pipeline(
    consumer: Arc<QueueConsumer>,
    producer: Arc<RecordingProducer>,
    access: Arc<TrackingModelAccess>,
    worker_pool_size: usize,
) -> SubscribePipeline {
    let engine = Arc::new(EventEngine::new(Arc::new(EmptyDataQuery), Arc::new(LevelStore::new())));
    SubscribePipeline::new(
        consumer,
        producer,
        Arc::new(NoopAdmin),
        Arc::new(ModelCache::new(access)),
        engine,
        "acme".into(),
        Locale::ZhCn,
        worker_pool_size,
        Duration::from_secs(120),
    )
}

// =============================================================================
// Batch processing
// =============================================================================

#[tokio::test]
async fn test_batch_produces_and_republishes_atomic_events() {
    let consumer = Arc::new(QueueConsumer::new(vec![vec![incoming(
        "view-1",
        json!({"@timestamp": 1712108595085i64, "value": 2.5, "labels": {"host_ip": "localhost"}}),
    )]]));
    let producer = Arc::new(RecordingProducer::new());
    let access = Arc::new(TrackingModelAccess::atomic());

    pipeline(consumer.clone(), producer.clone(), access, 2)
        .process_batch()
        .await
        .unwrap();

    let transactions = producer.transactions.lock().unwrap();
    // First transaction targets persistence, the second republishes the
    // atomic event on the tenant's atomic-event topic.
    assert_eq!(transactions.len(), 2);
    assert_eq!(transactions[0].len(), 1);
    assert_eq!(transactions[0][0].topic, "acme.sdp.mdl-model-persistence.input");
    assert_eq!(transactions[0][0].kind, EventKind::Atomic);
    assert_eq!(transactions[1][0].topic, "acme.mdl.atomic_event");
    assert_eq!(transactions[1][0].payload, transactions[0][0].payload);

    let doc: serde_json::Value = serde_json::from_slice(&transactions[0][0].payload).unwrap();
    assert_eq!(doc["level"], 1);
    assert_eq!(doc["event_model_id"], "model-view-1");
    // Nested labels were flattened before detection.
    let labels: serde_json::Value =
        serde_json::from_str(doc["labels_str"].as_str().unwrap()).unwrap();
    assert_eq!(labels["labels.host_ip"], "localhost");

    assert_eq!(consumer.commits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failed_produce_skips_commit() {
    let consumer = Arc::new(QueueConsumer::new(vec![vec![incoming(
        "view-1",
        json!({"value": 3.0}),
    )]]));
    let producer = Arc::new(RecordingProducer::failing());
    let access = Arc::new(TrackingModelAccess::atomic());

    let result = pipeline(consumer.clone(), producer, access, 2).process_batch().await;
    assert!(result.is_err());
    assert_eq!(consumer.commits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_agi_models_are_skipped() {
    let consumer = Arc::new(QueueConsumer::new(vec![vec![incoming(
        "view-1",
        json!({"value": 3.0}),
    )]]));
    let producer = Arc::new(RecordingProducer::new());
    let access = Arc::new(TrackingModelAccess::agi());

    pipeline(consumer.clone(), producer.clone(), access, 2)
        .process_batch()
        .await
        .unwrap();

    // One empty persistence transaction and no atomic republish.
    let transactions = producer.transactions.lock().unwrap();
    assert_eq!(transactions.len(), 1);
    assert!(transactions[0].is_empty());
    assert_eq!(consumer.commits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unparseable_payloads_do_not_stall_batch() {
    let consumer = Arc::new(QueueConsumer::new(vec![vec![
        IncomingRecord {
            topic: "acme.mdl.view".into(),
            payload: b"not json".to_vec(),
            source_id: "view-1".into(),
            source_type: "data_view".into(),
        },
        incoming("view-1", json!({"value": 4.0})),
    ]]));
    let producer = Arc::new(RecordingProducer::new());
    let access = Arc::new(TrackingModelAccess::atomic());

    pipeline(consumer.clone(), producer.clone(), access, 2)
        .process_batch()
        .await
        .unwrap();

    let transactions = producer.transactions.lock().unwrap();
    assert_eq!(transactions[0].len(), 1);
    assert_eq!(consumer.commits.load(Ordering::SeqCst), 1);
}

// =============================================================================
// Worker pool
// =============================================================================

#[tokio::test]
async fn test_worker_pool_bounds_concurrency() {
    let batch: Vec<IncomingRecord> = (0..10)
        .map(|i| incoming(&format!("view-{i}"), json!({"value": 2.0})))
        .collect();
    let consumer = Arc::new(QueueConsumer::new(vec![batch]));
    let producer = Arc::new(RecordingProducer::new());
    let access = Arc::new(TrackingModelAccess::atomic());

    pipeline(consumer, producer.clone(), access.clone(), 3)
        .process_batch()
        .await
        .unwrap();

    assert!(access.max_active.load(Ordering::SeqCst) <= 3);
    // Every source group still produced its event.
    let transactions = producer.transactions.lock().unwrap();
    assert_eq!(transactions[0].len(), 10);
}
