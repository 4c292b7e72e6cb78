//! Domain types: severity levels, event models, derived events, records
//! and query requests.

pub mod event;
pub mod event_model;
pub mod level;
pub mod query;
pub mod record;

pub use event::{
    BaseEvent, Event, EventContext, EventDataError, EventDetail, EventKind, PersistedEvent,
    PreOrderEvent,
};
pub use event_model::{
    AggregateRule, DetectRule, EventModel, EventTask, FilterExpress, FormulaItem, GenerateType,
    LogicFilter, StorageConfig, TaskSchedule, TimeWindow, AGI_AGGREGATION, AGI_DETECT,
};
pub use level::{Level, Locale, SEVERITY_PRIORITY};
pub use query::{
    EventDetailsQuery, EventQuery, EventQueryReq, Filter, SortDirection, DEFAULT_QUERY_LIMIT,
    QUERY_TYPE_INSTANT, QUERY_TYPE_RANGE,
};
pub use record::{record_timestamp_millis, DataSource, Record, SourceRecords};
