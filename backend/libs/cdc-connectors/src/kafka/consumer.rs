use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::ClientContext;
use tracing::{debug, error, info, warn};

use super::config::KafkaConnectorConfig;
use crate::connector::StateCell;
use crate::error::{CdcError, Result};

/// One record read from the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// `None` for tombstones
    pub payload: Option<Vec<u8>>,
}

/// Lifecycle of the Kafka connector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BrokerState {
    #[default]
    Disconnected,
    Subscribed,
    Streaming,
    Rebalancing,
    Closed,
}

/// Connector state shared with rdkafka's callback thread
pub type BrokerStateCell = StateCell<BrokerState>;

/// Log consumer seam used by [`super::KafkaCdcConnector`]
///
/// All methods take `&self`: the probe handle and the stream share one
/// consumer.
#[async_trait]
pub trait LogConsumer: Send + Sync {
    /// Check that the cluster is reachable within `timeout`
    async fn probe(&self, timeout: Duration) -> Result<()>;

    /// Connect and subscribe; failures are `ConnectionFailed`
    async fn subscribe(&self, topics: &[String], timeout: Duration) -> Result<()>;

    /// Wait up to `timeout` for the next record
    ///
    /// `None` means nothing arrived in time. Transport errors are
    /// `StreamInterrupted`.
    async fn poll(&self, timeout: Duration) -> Option<Result<LogRecord>>;

    /// Leave the group; must be safe to call more than once
    fn close(&self);
}

/// rdkafka consumer context: rebalance callbacks
///
/// Assignments and revocations are logged and reflected in the connector
/// state. They never change resume behavior.
pub struct CdcConsumerContext {
    connector_id: String,
    state: BrokerStateCell,
}

impl CdcConsumerContext {
    pub fn new(connector_id: impl Into<String>, state: BrokerStateCell) -> Self {
        Self {
            connector_id: connector_id.into(),
            state,
        }
    }
}

impl ClientContext for CdcConsumerContext {}

impl ConsumerContext for CdcConsumerContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(tpl) => {
                info!(
                    connector_id = %self.connector_id,
                    partitions_revoked = tpl.count(),
                    "Kafka rebalance: partitions being revoked"
                );
            }
            Rebalance::Assign(tpl) => {
                info!(
                    connector_id = %self.connector_id,
                    partitions_assigned = tpl.count(),
                    "Kafka rebalance: partitions assigned"
                );
            }
            Rebalance::Error(e) => {
                warn!(connector_id = %self.connector_id, error = %e, "Kafka rebalance error");
            }
        }
        self.state.transition(
            &[BrokerState::Subscribed, BrokerState::Streaming],
            BrokerState::Rebalancing,
        );
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(tpl) = rebalance {
            for element in tpl.elements() {
                debug!(
                    connector_id = %self.connector_id,
                    topic = element.topic(),
                    partition = element.partition(),
                    "Partition assigned"
                );
            }
        }
        self.state
            .transition(&[BrokerState::Rebalancing], BrokerState::Streaming);
    }
}

/// [`LogConsumer`] backed by an rdkafka `StreamConsumer`
pub struct KafkaLogConsumer {
    consumer: Arc<StreamConsumer<CdcConsumerContext>>,
}

impl KafkaLogConsumer {
    pub fn new(
        connector_id: &str,
        config: &KafkaConnectorConfig,
        state: BrokerStateCell,
    ) -> Result<Self> {
        let context = CdcConsumerContext::new(connector_id, state);
        let consumer: StreamConsumer<CdcConsumerContext> = config
            .client_config()
            .create_with_context(context)
            .map_err(|e| {
                error!("Failed to create Kafka consumer: {}", e);
                CdcError::Configuration(format!("Failed to create Kafka consumer: {}", e))
            })?;

        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }

    async fn fetch_metadata(&self, timeout: Duration) -> Result<()> {
        let consumer = Arc::clone(&self.consumer);

        // fetch_metadata blocks, keep it off the async workers
        let brokers = tokio::task::spawn_blocking(move || {
            consumer
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.brokers().len())
        })
        .await
        .map_err(|e| CdcError::connection_failed(format!("Failed to join metadata task: {}", e)))?
        .map_err(|e| {
            CdcError::connection_failed(format!("Failed to fetch Kafka metadata: {}", e))
        })?;

        if brokers == 0 {
            return Err(CdcError::connection_failed("No Kafka brokers available"));
        }
        Ok(())
    }
}

#[async_trait]
impl LogConsumer for KafkaLogConsumer {
    async fn probe(&self, timeout: Duration) -> Result<()> {
        self.fetch_metadata(timeout).await
    }

    async fn subscribe(&self, topics: &[String], timeout: Duration) -> Result<()> {
        self.fetch_metadata(timeout).await?;

        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics).map_err(|e| {
            error!("Failed to subscribe to topics: {}", e);
            CdcError::connection_failed(format!("Failed to subscribe to {:?}: {}", topics, e))
        })
    }

    async fn poll(&self, timeout: Duration) -> Option<Result<LogRecord>> {
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => None,
            Ok(Ok(message)) => Some(Ok(LogRecord {
                topic: message.topic().to_string(),
                partition: message.partition(),
                offset: message.offset(),
                payload: message.payload().map(<[u8]>::to_vec),
            })),
            Ok(Err(e)) => {
                error!("Kafka consumer error: {}", e);
                Some(Err(CdcError::stream_interrupted(format!(
                    "Kafka consumer error: {}",
                    e
                ))))
            }
        }
    }

    fn close(&self) {
        self.consumer.unsubscribe();
    }
}
