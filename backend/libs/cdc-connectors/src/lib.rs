//! # CDC Connectors
//!
//! Row-level change streams from heterogeneous sources, normalized into one
//! [`ChangeEvent`] model with resumable, source-specific positions.
//!
//! ## Sources
//!
//! - **Kafka**: Debezium envelopes (flat or `{schema, payload}`), resumed by
//!   (topic, partition, offset)
//! - **MongoDB**: native change streams, resumed by opaque resume token
//!
//! ## Delivery
//!
//! At-least-once. Connectors read the last saved position once per
//! `stream_changes` call and never write it; the consuming pipeline calls
//! [`PositionStore::save_position`] after it has applied an event.
//!
//! ## Example
//!
//! ```ignore
//! use cdc_connectors::{CdcConnector, InMemoryPositionStore, PositionStore, Shutdown};
//! use cdc_connectors::kafka::{KafkaCdcConnector, KafkaConnectorConfig};
//! use futures::StreamExt;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryPositionStore::new());
//! let mut connector = KafkaCdcConnector::new(
//!     "orders-cdc",
//!     KafkaConnectorConfig::from_env()?,
//!     store.clone(),
//! )?;
//!
//! let (_stop, shutdown) = Shutdown::channel();
//! let mut changes = connector.stream_changes(shutdown);
//! while let Some(item) = changes.next().await {
//!     match item {
//!         Ok(event) => {
//!             // apply the event, then checkpoint
//!             store.save_position("orders-cdc", event.position()).await?;
//!         }
//!         Err(e) if e.is_terminal_for(cdc_connectors::ConnectorKind::Kafka) => break,
//!         Err(e) => tracing::warn!(error = %e, "Skipping change"),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod connector;
pub mod envelope;
pub mod error;
pub mod event;
pub mod health;
pub mod kafka;
pub mod mongo;
pub mod position;
pub mod store;

pub use connector::{
    CdcConnector, ChangeResult, ChangeStream, ConnectorKind, PositionProbe, Shutdown, StateCell,
};
pub use envelope::{DebeziumOperation, DebeziumPayload, EnvelopeFormat, EnvelopeMapper};
pub use error::{CdcError, ErrorKind, Result};
pub use event::{ChangeEvent, ChangeMetadata, ChangeOperation};
pub use health::{ConnectorHealthCheck, HealthReport, HealthStatus};
pub use position::{BrokerPosition, CdcPosition, CursorPosition};
pub use store::{InMemoryPositionStore, PositionStore};
