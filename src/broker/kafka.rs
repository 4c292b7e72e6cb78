//! rdkafka-backed implementations of the broker ports.
//!
//! The consumer runs with manual commits and read-committed isolation; the
//! producer is transactional with idempotence enabled. Transaction failures
//! abort only when the broker says the transaction requires it, and an
//! abort reporting "no transaction in progress" is ignored.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode as ErrorCode;
use rdkafka::util::Timeout;
use tracing::{debug, error, info, warn};

use crate::config::BrokerConfig;

use super::{
    BrokerError, EventProducer, IncomingRecord, OutgoingMessage, RecordConsumer, TopicAdmin,
};

fn base_config(config: &BrokerConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client.set("bootstrap.servers", &config.brokers);
    if let Some(auth) = &config.auth {
        client
            .set("security.protocol", "sasl_plaintext")
            .set("sasl.mechanism", &auth.mechanism)
            .set("sasl.username", &auth.username)
            .set("sasl.password", &auth.password);
    }
    client
}

// =============================================================================
// Consumer
// =============================================================================

pub struct KafkaRecordConsumer {
    consumer: StreamConsumer,
    max_batch: usize,
    poll_window: Duration,
    commit_timeout: Duration,
}

impl KafkaRecordConsumer {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = base_config(config)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("isolation.level", "read_committed")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout.as_millis().to_string())
            .set("socket.keepalive.enable", "true")
            .set("allow.auto.create.topics", "false")
            .create()?;
        Ok(Self {
            consumer,
            max_batch: config.max_batch_size,
            poll_window: config.poll_timeout,
            commit_timeout: config.transaction_timeout,
        })
    }

    fn convert(message: &rdkafka::message::BorrowedMessage<'_>) -> IncomingRecord {
        let mut source_id = String::new();
        let mut source_type = String::new();
        if let Some(headers) = message.headers() {
            // Source id and type ride in the first two headers, by position.
            if headers.count() > 0 {
                if let Some(value) = headers.get(0).value {
                    source_id = String::from_utf8_lossy(value).into_owned();
                }
            }
            if headers.count() > 1 {
                if let Some(value) = headers.get(1).value {
                    source_type = String::from_utf8_lossy(value).into_owned();
                }
            }
        }
        IncomingRecord {
            topic: message.topic().to_owned(),
            payload: message.payload().unwrap_or_default().to_vec(),
            source_id,
            source_type,
        }
    }
}

#[async_trait]
impl RecordConsumer for KafkaRecordConsumer {
    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError> {
        let refs: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&refs)?;
        info!(count = topics.len(), "subscribed topic set");
        Ok(())
    }

    async fn poll_batch(&self) -> Result<Vec<IncomingRecord>, BrokerError> {
        let deadline = Instant::now() + self.poll_window;
        let mut batch = Vec::new();
        while batch.len() < self.max_batch {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => batch.push(Self::convert(&message)),
                Ok(Err(err)) => return Err(err.into()),
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    fn commit(&self) -> Result<(), BrokerError> {
        self.consumer
            .commit_consumer_state(CommitMode::Sync)
            .map_err(|err| match err {
                KafkaError::ConsumerCommit(RDKafkaErrorCode::OperationTimedOut) => {
                    BrokerError::CommitTimeout
                }
                other => other.into(),
            })
    }
}

// =============================================================================
// Transactional producer
// =============================================================================

pub struct KafkaEventProducer {
    producer: FutureProducer,
    txn_timeout: Duration,
}

impl KafkaEventProducer {
    /// Build and init-transactions a producer with the given transactional
    /// id. The id must be unique per process instance.
    pub fn new(config: &BrokerConfig, transactional_id: &str) -> Result<Self, BrokerError> {
        let producer: FutureProducer = base_config(config)
            .set("client.id", transactional_id)
            .set("transactional.id", transactional_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("max.in.flight.requests.per.connection", "5")
            .set(
                "transaction.timeout.ms",
                config.transaction_timeout.as_millis().to_string(),
            )
            .set("socket.keepalive.enable", "true")
            .set("allow.auto.create.topics", "false")
            .create()?;
        producer.init_transactions(Timeout::After(config.transaction_timeout))?;
        Ok(Self { producer, txn_timeout: config.transaction_timeout })
    }

    fn handle_txn_error(&self, err: KafkaError) -> BrokerError {
        let requires_abort =
            matches!(&err, KafkaError::Transaction(e) if e.txn_requires_abort());
        if requires_abort {
            info!("aborting transaction after produce failure");
            if let Err(abort_err) = self.producer.abort_transaction(Timeout::After(self.txn_timeout))
            {
                if matches!(&abort_err, KafkaError::Transaction(e) if e.code() == ErrorCode::InvalidTransactionalState)
                {
                    info!("no transaction in progress, ignoring abort error");
                } else {
                    error!(error = %abort_err, "abort transaction failed");
                }
            }
        }
        BrokerError::Kafka(err)
    }
}

#[async_trait]
impl EventProducer for KafkaEventProducer {
    async fn produce_transactional(&self, messages: &[OutgoingMessage]) -> Result<(), BrokerError> {
        if messages.is_empty() {
            return Ok(());
        }

        self.producer.begin_transaction().map_err(|err| self.handle_txn_error(err))?;
        debug!(count = messages.len(), topic = %messages[0].topic, "begin transaction");

        let mut deliveries = Vec::with_capacity(messages.len());
        for message in messages {
            let mut headers = OwnedHeaders::new_with_capacity(message.headers.len());
            for (key, value) in &message.headers {
                headers = headers.insert(Header { key, value: Some(value.as_slice()) });
            }
            let record = FutureRecord::<(), [u8]>::to(&message.topic)
                .payload(message.payload.as_slice())
                .headers(headers);
            match self.producer.send_result(record) {
                Ok(delivery) => deliveries.push(delivery),
                Err((err, _)) => return Err(self.handle_txn_error(err)),
            }
        }

        for delivery in deliveries {
            match delivery.await {
                Ok(Ok(_)) => {}
                Ok(Err((err, _))) => return Err(self.handle_txn_error(err)),
                Err(_) => return Err(BrokerError::DeliveryCanceled),
            }
        }

        self.producer.flush(Timeout::After(self.txn_timeout))?;
        self.producer
            .commit_transaction(Timeout::After(self.txn_timeout))
            .map_err(|err| self.handle_txn_error(err))?;
        debug!("transaction committed");
        Ok(())
    }
}

// =============================================================================
// Admin
// =============================================================================

pub struct KafkaTopicAdmin {
    admin: AdminClient<DefaultClientContext>,
    metadata_timeout: Duration,
    partitions: i32,
    replication: i32,
}

impl KafkaTopicAdmin {
    pub fn new(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let admin: AdminClient<DefaultClientContext> = base_config(config).create()?;
        Ok(Self {
            admin,
            metadata_timeout: config.poll_timeout.max(Duration::from_secs(5)),
            partitions: config.topic_partitions,
            replication: config.topic_replication,
        })
    }
}

#[async_trait]
impl TopicAdmin for KafkaTopicAdmin {
    fn list_topics(&self) -> Result<Vec<String>, BrokerError> {
        let metadata = self
            .admin
            .inner()
            .fetch_metadata(None, Timeout::After(self.metadata_timeout))?;
        Ok(metadata.topics().iter().map(|topic| topic.name().to_owned()).collect())
    }

    async fn create_topics_if_absent(&self, topics: &[String]) -> Result<(), BrokerError> {
        let existing = self.list_topics()?;
        let missing: Vec<&String> =
            topics.iter().filter(|topic| !existing.contains(topic)).collect();
        if missing.is_empty() {
            return Ok(());
        }

        let new_topics: Vec<NewTopic<'_>> = missing
            .iter()
            .map(|topic| {
                NewTopic::new(
                    topic.as_str(),
                    self.partitions,
                    TopicReplication::Fixed(self.replication),
                )
            })
            .collect();
        let results = self
            .admin
            .create_topics(new_topics.iter(), &AdminOptions::new())
            .await?;
        for result in results {
            match result {
                Ok(topic) => info!(topic = %topic, "created topic"),
                Err((topic, ErrorCode::TopicAlreadyExists)) => {
                    warn!(topic = %topic, "topic already exists");
                }
                Err((topic, code)) => {
                    return Err(BrokerError::TopicCreation { topic, reason: code.to_string() });
                }
            }
        }
        Ok(())
    }
}
