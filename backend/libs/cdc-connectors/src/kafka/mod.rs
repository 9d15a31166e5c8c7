//! Debezium change envelopes consumed from Kafka
//!
//! - **Config**: rdkafka client settings, topics, envelope format
//! - **Consumer**: the [`LogConsumer`] seam and its rdkafka implementation
//! - **Resume**: offset-based replay suppression after a restart
//! - **Connector**: [`KafkaCdcConnector`], the streaming state machine
pub mod config;
pub mod connector;
pub mod consumer;
pub mod resume;

pub use config::{KafkaConnectorConfig, KafkaSecurityConfig, OffsetReset};
pub use connector::KafkaCdcConnector;
pub use consumer::{BrokerState, BrokerStateCell, KafkaLogConsumer, LogConsumer, LogRecord};
pub use resume::ResumeGate;
