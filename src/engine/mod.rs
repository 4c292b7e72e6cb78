//! The detection and aggregation engine.

pub mod aggregate;
pub mod compare;
pub mod flatten;
pub mod formula;
pub mod message;
pub mod orchestrator;
pub mod state;

use thiserror::Error;

use crate::access::AccessError;
use crate::model::EventDataError;

pub use flatten::flatten_record;
pub use orchestrator::{assemble, combine_filter, EventEngine};
pub use state::{dedup_key, extract_labels, LevelStore};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("not a valid input: expected a map or an array")]
    InvalidDocument,

    #[error("invalid persisted event row: {0}")]
    InvalidRow(#[source] serde_json::Error),

    #[error(transparent)]
    EventData(#[from] EventDataError),

    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("event {event_id} not found")]
    EventNotFound { event_id: String },
}
