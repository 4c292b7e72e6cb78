//! Broker ports: consuming source records, producing derived events inside
//! transactions, and topic administration.

pub mod kafka;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::EventKind;

/// Header carrying the data-source id on consumed messages.
pub const HEADER_SOURCE_ID: &str = "__id";
/// Header carrying the data-source type on consumed messages.
pub const HEADER_SOURCE_TYPE: &str = "__type";

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("message delivery was canceled")]
    DeliveryCanceled,

    #[error("topic creation failed for {topic}: {reason}")]
    TopicCreation { topic: String, reason: String },

    #[error("offset commit timed out")]
    CommitTimeout,
}

/// One consumed message, with the source headers already read. Messages
/// without a source id are still surfaced so the pipeline can log and drop
/// them.
#[derive(Debug, Clone)]
pub struct IncomingRecord {
    pub topic: String,
    pub payload: Vec<u8>,
    pub source_id: String,
    pub source_type: String,
}

/// One derived-event message bound for the broker. The event kind rides
/// along so the atomic-event republish can filter without re-parsing the
/// payload.
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
    pub kind: EventKind,
}

impl OutgoingMessage {
    /// The same message redirected to another topic.
    pub fn retopic(&self, topic: &str) -> Self {
        Self { topic: topic.to_owned(), ..self.clone() }
    }
}

#[async_trait]
pub trait RecordConsumer: Send + Sync {
    /// Replace the current subscription with the given topic set.
    fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    /// Poll one batch of messages, bounded by the configured batch size and
    /// poll window. An empty batch means the window elapsed quietly.
    async fn poll_batch(&self) -> Result<Vec<IncomingRecord>, BrokerError>;

    /// Commit the consumer position for everything returned so far.
    fn commit(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait EventProducer: Send + Sync {
    /// Produce all messages inside a single broker transaction. On error
    /// nothing from the batch becomes visible to read-committed consumers.
    async fn produce_transactional(&self, messages: &[OutgoingMessage]) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait TopicAdmin: Send + Sync {
    fn list_topics(&self) -> Result<Vec<String>, BrokerError>;

    async fn create_topics_if_absent(&self, topics: &[String]) -> Result<(), BrokerError>;
}
