//! Streaming pipeline: subscribes to the tenant's record topics, fans each
//! batch out to per-source detection workers, and publishes the derived
//! events transactionally before committing consumer offsets.

pub mod topics;
pub mod wire;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::access::{AccessError, ModelCache};
use crate::broker::{
    BrokerError, EventProducer, IncomingRecord, OutgoingMessage, RecordConsumer, TopicAdmin,
};
use crate::engine::{flatten_record, EngineError, EventEngine};
use crate::model::{DataSource, EventKind, Locale, Record};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// The streaming detection pipeline. One instance owns the consumer; topic
/// changes arrive on a channel from the discovery watcher and trigger a
/// resubscribe between batches.
pub struct SubscribePipeline {
    consumer: Arc<dyn RecordConsumer>,
    producer: Arc<dyn EventProducer>,
    admin: Arc<dyn TopicAdmin>,
    cache: Arc<ModelCache>,
    engine: Arc<EventEngine>,
    tenant: String,
    locale: Locale,
    worker_pool_size: usize,
    topic_refresh_interval: Duration,
    subscribed: Arc<RwLock<Vec<String>>>,
}

impl SubscribePipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        consumer: Arc<dyn RecordConsumer>,
        producer: Arc<dyn EventProducer>,
        admin: Arc<dyn TopicAdmin>,
        cache: Arc<ModelCache>,
        engine: Arc<EventEngine>,
        tenant: String,
        locale: Locale,
        worker_pool_size: usize,
        topic_refresh_interval: Duration,
    ) -> Self {
        Self {
            consumer,
            producer,
            admin,
            cache,
            engine,
            tenant,
            locale,
            worker_pool_size,
            topic_refresh_interval,
            subscribed: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Run the consume loop until the task is aborted. Startup creates the
    /// fixed topics when absent, subscribes to the discovered set, and
    /// spawns the discovery watcher.
    pub async fn run(&self) -> Result<(), PipelineError> {
        self.admin
            .create_topics_if_absent(&topics::required_topics(&self.tenant))
            .await?;

        let initial = topics::discover_topics(self.admin.as_ref(), &self.tenant)?;
        self.consumer.subscribe(&initial)?;
        info!(count = initial.len(), tenant = %self.tenant, "pipeline subscribed");
        *self.subscribed.write().await = initial;

        let (sender, mut receiver) = mpsc::channel::<Vec<String>>(4);
        let watcher = topics::spawn_topic_watcher(
            self.admin.clone(),
            self.tenant.clone(),
            self.topic_refresh_interval,
            self.subscribed.clone(),
            sender,
        );

        let mut watcher_down = false;
        loop {
            while let Ok(updated) = receiver.try_recv() {
                self.apply_topic_update(updated).await;
            }
            if let Err(err) = self.process_batch().await {
                // Offsets were not committed, the batch will be redelivered.
                error!(error = %err, "batch processing failed");
            }
            if !watcher_down && watcher.is_finished() {
                warn!("topic watcher exited");
                watcher_down = true;
            }
        }
    }

    /// Resubscribe to a discovered topic set. The subscribed snapshot is
    /// written only on success, so a failed set still differs from the
    /// snapshot and the watcher delivers it again on its next tick.
    async fn apply_topic_update(&self, updated: Vec<String>) {
        match self.consumer.subscribe(&updated) {
            Ok(()) => {
                info!(count = updated.len(), "resubscribed topic set");
                *self.subscribed.write().await = updated;
            }
            Err(err) => {
                error!(error = %err, "resubscribe failed, will retry on next discovery");
            }
        }
    }

    /// Process one poll batch end to end: divide by data source, run the
    /// worker pool, publish to persistence, republish atomic events, then
    /// commit offsets.
    pub async fn process_batch(&self) -> Result<(), PipelineError> {
        let batch = self.consumer.poll_batch().await?;
        if batch.is_empty() {
            return Ok(());
        }
        debug!(count = batch.len(), "polled batch");

        let groups = divide_by_source(batch);
        let messages = self.detect_groups(groups).await;

        self.producer.produce_transactional(&messages).await?;
        self.flush_atomic(&messages).await?;

        if let Err(err) = self.consumer.commit() {
            warn!(error = %err, "offset commit failed, batch will be redelivered");
        }
        Ok(())
    }

    /// Fan detection out over the per-source groups with a bounded worker
    /// pool. Worker failures are logged and that group's output dropped;
    /// the rest of the batch proceeds.
    async fn detect_groups(
        &self,
        groups: HashMap<DataSource, Vec<IncomingRecord>>,
    ) -> Vec<OutgoingMessage> {
        let semaphore = Arc::new(Semaphore::new(self.worker_pool_size));
        let persistence_topic = topics::persistence_topic(&self.tenant);
        let mut workers = JoinSet::new();

        for (source, records) in groups {
            let semaphore = semaphore.clone();
            let cache = self.cache.clone();
            let engine = self.engine.clone();
            let locale = self.locale;
            let topic = persistence_topic.clone();
            workers.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let result = invoke(&cache, &engine, &source, &records, locale, &topic).await;
                (source, result)
            });
        }

        let mut messages = Vec::new();
        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok((_, Ok(mut produced))) => messages.append(&mut produced),
                Ok((source, Err(err))) => {
                    error!(source_id = %source.source_id, error = %err, "detection worker failed");
                }
                Err(err) => error!(error = %err, "detection worker panicked"),
            }
        }
        messages
    }

    /// Republish atomic events to the tenant's atomic-event topic in a
    /// second transaction. Aggregate models consume that topic.
    async fn flush_atomic(&self, messages: &[OutgoingMessage]) -> Result<(), PipelineError> {
        let topic = topics::atomic_event_topic(&self.tenant);
        let atomic: Vec<OutgoingMessage> = messages
            .iter()
            .filter(|message| message.kind == EventKind::Atomic)
            .map(|message| message.retopic(&topic))
            .collect();
        if atomic.is_empty() {
            return Ok(());
        }
        debug!(count = atomic.len(), "republishing atomic events");
        self.producer.produce_transactional(&atomic).await?;
        Ok(())
    }
}

/// Group a batch by the data source announced in the message headers.
/// Messages without a source id cannot be routed and are dropped.
pub fn divide_by_source(batch: Vec<IncomingRecord>) -> HashMap<DataSource, Vec<IncomingRecord>> {
    let mut groups: HashMap<DataSource, Vec<IncomingRecord>> = HashMap::new();
    for record in batch {
        if record.source_id.is_empty() {
            error!(topic = %record.topic, "record without source id header, dropping");
            continue;
        }
        let source = DataSource {
            source_id: record.source_id.clone(),
            source_type: record.source_type.clone(),
        };
        groups.entry(source).or_default().push(record);
    }
    groups
}

/// Run detection for one source group: parse and flatten the payloads,
/// resolve the interested models, judge, and wire the events for the
/// persistence topic.
async fn invoke(
    cache: &ModelCache,
    engine: &EventEngine,
    source: &DataSource,
    records: &[IncomingRecord],
    locale: Locale,
    persistence_topic: &str,
) -> Result<Vec<OutgoingMessage>, PipelineError> {
    let mut parsed: Vec<Record> = Vec::with_capacity(records.len());
    for record in records {
        let value: serde_json::Value = match serde_json::from_slice(&record.payload) {
            Ok(value) => value,
            Err(err) => {
                error!(source_id = %source.source_id, error = %err, "unparseable record payload");
                continue;
            }
        };
        match flatten_record(&value) {
            Ok(flat) => parsed.push(flat),
            Err(err) => {
                error!(source_id = %source.source_id, error = %err, "record flatten failed");
            }
        }
    }
    if parsed.is_empty() {
        return Ok(Vec::new());
    }

    let models = cache.resolve(source).await?;
    let mut messages = Vec::new();
    for model in &models {
        if model.uses_agi_rules() {
            debug!(model_id = %model.id, "skipping model with agi rules");
            continue;
        }
        let events = engine.judge(&parsed, model, locale).await?;
        for event in &events {
            messages.push(wire::event_to_message(event, &model.task, persistence_topic)?);
        }
    }
    Ok(messages)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn incoming(source_id: &str, source_type: &str, payload: &str) -> IncomingRecord {
        IncomingRecord {
            topic: "acme.mdl.view".into(),
            payload: payload.as_bytes().to_vec(),
            source_id: source_id.into(),
            source_type: source_type.into(),
        }
    }

    #[test]
    fn test_divide_groups_by_source() {
        let groups = divide_by_source(vec![
            incoming("v1", "data_view", "{}"),
            incoming("v1", "data_view", "{}"),
            incoming("v2", "data_view", "{}"),
        ]);
        assert_eq!(groups.len(), 2);
        let key = DataSource { source_id: "v1".into(), source_type: "data_view".into() };
        assert_eq!(groups[&key].len(), 2);
    }

    #[test]
    fn test_divide_drops_records_without_source_id() {
        let groups = divide_by_source(vec![
            incoming("", "data_view", "{}"),
            incoming("v1", "data_view", "{}"),
        ]);
        assert_eq!(groups.len(), 1);
    }

    mod resubscribe {
        use super::super::*;
        use std::sync::atomic::{AtomicUsize, Ordering};

        use async_trait::async_trait;

        use crate::access::{AccessError, EventModelAccess};
        use crate::model::{EventModel, EventQuery, SourceRecords};

        /// Fails the first `failures` subscribe calls, then succeeds.
        struct FlakyConsumer {
            failures: usize,
            attempts: AtomicUsize,
        }

        #[async_trait]
        impl RecordConsumer for FlakyConsumer {
            fn subscribe(&self, _topics: &[String]) -> Result<(), BrokerError> {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < self.failures {
                    return Err(BrokerError::CommitTimeout);
                }
                Ok(())
            }

            async fn poll_batch(&self) -> Result<Vec<IncomingRecord>, BrokerError> {
                Ok(Vec::new())
            }

            fn commit(&self) -> Result<(), BrokerError> {
                Ok(())
            }
        }

        struct NoopProducer;

        #[async_trait]
        impl crate::broker::EventProducer for NoopProducer {
            async fn produce_transactional(
                &self,
                _messages: &[OutgoingMessage],
            ) -> Result<(), BrokerError> {
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

        struct NoopAccess;

        #[async_trait]
        impl EventModelAccess for NoopAccess {
            async fn get_event_model_by_id(
                &self,
                _id: &str,
            ) -> Result<Option<EventModel>, AccessError> {
                Ok(None)
            }

            async fn get_event_models_by_source_id(
                &self,
                _source_id: &str,
            ) -> Result<Vec<EventModel>, AccessError> {
                Ok(Vec::new())
            }
        }

        struct NoopDataQuery;

        #[async_trait]
        impl crate::access::DataModelQuery for NoopDataQuery {
            async fn fetch_source_records(
                &self,
                _model: &EventModel,
                _query: &EventQuery,
            ) -> Result<SourceRecords, AccessError> {
                Ok(SourceRecords::default())
            }
        }

        fn pipeline_with(consumer: Arc<FlakyConsumer>) -> SubscribePipeline {
            let engine = Arc::new(EventEngine::new(
                Arc::new(NoopDataQuery),
                Arc::new(crate::engine::LevelStore::new()),
            ));
            SubscribePipeline::new(
                consumer,
                Arc::new(NoopProducer),
                Arc::new(NoopAdmin),
                Arc::new(ModelCache::new(Arc::new(NoopAccess))),
                engine,
                "acme".into(),
                Locale::ZhCn,
                1,
                Duration::from_secs(120),
            )
        }

        #[tokio::test]
        async fn test_failed_resubscribe_keeps_snapshot_stale() {
            let consumer = Arc::new(FlakyConsumer { failures: 1, attempts: AtomicUsize::new(0) });
            let pipeline = pipeline_with(consumer);
            let updated = vec!["acme.mdl.view.cpu".to_string()];

            // First attempt fails; the snapshot must not record the set,
            // otherwise the watcher would never deliver it again.
            pipeline.apply_topic_update(updated.clone()).await;
            assert!(pipeline.subscribed.read().await.is_empty());

            // The retried delivery succeeds and is recorded.
            pipeline.apply_topic_update(updated.clone()).await;
            assert_eq!(*pipeline.subscribed.read().await, updated);
        }
    }
}
