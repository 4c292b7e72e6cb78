//! Uniquery - Event Detection and Aggregation Library
//!
//! This crate derives events from streaming source records by evaluating
//! rule-driven event models, and answers on-demand event queries. It can be
//! used as a library or run as the `uniquery` service binary.
//!
//! # Architecture
//!
//! - **Model**: Event models, rules, derived events and query shapes
//! - **Engine**: Formula evaluation, atomic detection, aggregation and the
//!   query orchestrator
//! - **Pipeline**: The streaming subscribe/detect/publish loop
//! - **Broker**: Kafka ports (consumer, transactional producer, admin)
//! - **Access**: HTTP ports to the model, data-query and permission services
//! - **Service**: The batch event query facade

pub mod access;
pub mod broker;
pub mod config;
pub mod engine;
pub mod model;
pub mod pipeline;
pub mod service;

pub use config::AppConfig;
pub use engine::EventEngine;
pub use pipeline::SubscribePipeline;
pub use service::EventQueryService;
