use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{debug, error, info, trace, warn};

use super::config::KafkaConnectorConfig;
use super::consumer::{BrokerState, BrokerStateCell, KafkaLogConsumer, LogConsumer, LogRecord};
use super::resume::ResumeGate;
use crate::connector::{
    CdcConnector, ChangeResult, ChangeStream, ConnectorKind, PositionProbe, Shutdown,
};
use crate::envelope::EnvelopeMapper;
use crate::error::{CdcError, Result};
use crate::position::{BrokerPosition, CdcPosition};
use crate::store::PositionStore;

/// Debezium-over-Kafka change connector
///
/// Resumption is owned by the externally stored [`BrokerPosition`]: the
/// consumer never commits group offsets, and records replayed up to the saved
/// offset are filtered by a [`ResumeGate`]. Mid-stream transport errors are
/// yielded as `StreamInterrupted` items and polling continues.
pub struct KafkaCdcConnector<C: LogConsumer = KafkaLogConsumer> {
    probe: Arc<KafkaProbe<C>>,
    topics: Vec<String>,
    poll_timeout: Duration,
    connect_timeout: Duration,
    mapper: EnvelopeMapper,
    state: BrokerStateCell,
}

impl KafkaCdcConnector<KafkaLogConsumer> {
    /// Create a connector backed by an rdkafka consumer
    ///
    /// Fails fast on invalid configuration, including an empty topic list.
    /// Must be called from within a Tokio runtime: the rdkafka consumer
    /// spawns its wakeup task on creation and panics without one.
    pub fn new(
        connector_id: impl Into<String>,
        config: KafkaConnectorConfig,
        store: Arc<dyn PositionStore>,
    ) -> Result<Self> {
        let connector_id = connector_id.into();
        config.validate()?;

        info!(
            connector_id = %connector_id,
            brokers = %config.brokers,
            group_id = %config.group_id,
            topics = ?config.topics,
            envelope_format = %config.envelope_format,
            "Initializing Kafka CDC connector"
        );

        let state = BrokerStateCell::default();
        let consumer = KafkaLogConsumer::new(&connector_id, &config, state.clone())?;
        Ok(Self::assemble(connector_id, &config, consumer, store, state))
    }
}

impl<C: LogConsumer + 'static> KafkaCdcConnector<C> {
    /// Create a connector around an existing consumer
    pub fn with_consumer(
        connector_id: impl Into<String>,
        config: &KafkaConnectorConfig,
        consumer: C,
        store: Arc<dyn PositionStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::assemble(
            connector_id.into(),
            config,
            consumer,
            store,
            BrokerStateCell::default(),
        ))
    }

    fn assemble(
        connector_id: String,
        config: &KafkaConnectorConfig,
        consumer: C,
        store: Arc<dyn PositionStore>,
        state: BrokerStateCell,
    ) -> Self {
        Self {
            probe: Arc::new(KafkaProbe {
                connector_id,
                consumer,
                store,
                timeout: config.connect_timeout(),
            }),
            topics: config
                .topics
                .iter()
                .map(|t| t.trim().to_string())
                .filter(|t| !t.is_empty())
                .collect(),
            poll_timeout: config.poll_timeout(),
            connect_timeout: config.connect_timeout(),
            mapper: EnvelopeMapper::new(config.envelope_format),
            state,
        }
    }

    pub fn state(&self) -> BrokerState {
        self.state.get()
    }

    /// Last saved broker position, or `None` when the stream should start
    /// from the first observed event
    ///
    /// Store failures degrade to "no resume point": re-processing is
    /// preferred over refusing to start.
    async fn load_resume_point(&self) -> Option<BrokerPosition> {
        let connector_id = self.probe.connector_id.as_str();
        match self.probe.store.get_position(connector_id).await {
            Ok(Some(CdcPosition::Broker(position))) if !position.is_awaiting_first_event() => {
                info!(
                    connector_id,
                    topic = %position.topic,
                    partition = position.partition,
                    offset = position.offset,
                    "Resuming after saved position"
                );
                Some(position)
            }
            Ok(Some(CdcPosition::Broker(_))) | Ok(None) => {
                info!(connector_id, "No saved position, emitting from first observed event");
                None
            }
            Ok(Some(other)) => {
                warn!(
                    connector_id,
                    position = ?other,
                    "Saved position is not a broker position, ignoring it"
                );
                None
            }
            Err(e) => {
                warn!(
                    connector_id,
                    error = %e,
                    "Failed to load saved position, starting without resume point"
                );
                None
            }
        }
    }
}

#[async_trait]
impl<C: LogConsumer + 'static> PositionProbe for KafkaCdcConnector<C> {
    fn connector_id(&self) -> &str {
        self.probe.connector_id()
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Kafka
    }

    async fn get_current_position(&self) -> Result<CdcPosition> {
        self.probe.get_current_position().await
    }
}

impl<C: LogConsumer + 'static> CdcConnector for KafkaCdcConnector<C> {
    fn stream_changes(&mut self, shutdown: Shutdown) -> ChangeStream<'_> {
        let run = BrokerRun::new(self, shutdown);
        futures::stream::unfold(run, |mut run| async move {
            let item = run.next_item().await?;
            Some((item, run))
        })
        .boxed()
    }

    fn probe(&self) -> Arc<dyn PositionProbe> {
        self.probe.clone()
    }
}

struct KafkaProbe<C> {
    connector_id: String,
    consumer: C,
    store: Arc<dyn PositionStore>,
    timeout: Duration,
}

#[async_trait]
impl<C: LogConsumer + 'static> PositionProbe for KafkaProbe<C> {
    fn connector_id(&self) -> &str {
        &self.connector_id
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Kafka
    }

    async fn get_current_position(&self) -> Result<CdcPosition> {
        self.consumer.probe(self.timeout).await?;

        match self.store.get_position(&self.connector_id).await? {
            Some(CdcPosition::Broker(position)) => Ok(position.into()),
            Some(other) => {
                warn!(
                    connector_id = %self.connector_id,
                    position = ?other,
                    "Saved position is not a broker position, reporting awaiting first event"
                );
                Ok(BrokerPosition::awaiting_first_event().into())
            }
            None => Ok(BrokerPosition::awaiting_first_event().into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Streaming,
    Finished,
}

/// State of one `stream_changes` call
///
/// The resume gate lives here and nowhere else. Dropping the run (including
/// dropping the stream mid-iteration) closes the consumer.
struct BrokerRun<'a, C: LogConsumer + 'static> {
    connector: &'a KafkaCdcConnector<C>,
    shutdown: Shutdown,
    gate: ResumeGate,
    phase: Phase,
    closed: bool,
}

impl<'a, C: LogConsumer + 'static> BrokerRun<'a, C> {
    fn new(connector: &'a KafkaCdcConnector<C>, shutdown: Shutdown) -> Self {
        Self {
            connector,
            shutdown,
            gate: ResumeGate::new(None),
            phase: Phase::Connecting,
            closed: false,
        }
    }

    fn connector_id(&self) -> &str {
        &self.connector.probe.connector_id
    }

    async fn next_item(&mut self) -> Option<ChangeResult> {
        let connector = self.connector;

        loop {
            if self.phase == Phase::Finished {
                return None;
            }
            if self.shutdown.is_triggered() {
                info!(
                    connector_id = self.connector_id(),
                    "Shutdown requested, stopping Kafka change stream"
                );
                self.finish();
                return None;
            }

            match self.phase {
                Phase::Connecting => {
                    let subscribed = tokio::select! {
                        _ = self.shutdown.triggered() => continue,
                        result = connector
                            .probe
                            .consumer
                            .subscribe(&connector.topics, connector.connect_timeout) => result,
                    };

                    if let Err(e) = subscribed {
                        error!(
                            connector_id = self.connector_id(),
                            error = %e,
                            "Failed to connect Kafka consumer"
                        );
                        self.finish();
                        return Some(Err(e));
                    }

                    connector.state.set(BrokerState::Subscribed);
                    info!(
                        connector_id = self.connector_id(),
                        topics = ?connector.topics,
                        "Kafka CDC connector subscribed"
                    );

                    let saved = tokio::select! {
                        _ = self.shutdown.triggered() => continue,
                        saved = connector.load_resume_point() => saved,
                    };
                    self.gate = ResumeGate::new(saved);
                    self.phase = Phase::Streaming;
                }
                Phase::Streaming => {
                    connector
                        .state
                        .transition(&[BrokerState::Subscribed], BrokerState::Streaming);

                    let polled = tokio::select! {
                        _ = self.shutdown.triggered() => continue,
                        polled = connector.probe.consumer.poll(connector.poll_timeout) => polled,
                    };

                    match polled {
                        None => continue,
                        Some(Err(e)) => {
                            warn!(
                                connector_id = self.connector_id(),
                                error = %e,
                                "Kafka transport error, continuing to poll"
                            );
                            return Some(Err(e));
                        }
                        Some(Ok(record)) => {
                            if let Some(item) = self.handle_record(record) {
                                return Some(item);
                            }
                        }
                    }
                }
                Phase::Finished => return None,
            }
        }
    }

    /// Map one record; `None` means nothing to emit for it
    fn handle_record(&mut self, record: LogRecord) -> Option<ChangeResult> {
        let LogRecord {
            topic,
            partition,
            offset,
            payload,
        } = record;

        let Some(payload) = payload.filter(|p| !p.is_empty()) else {
            debug!(topic = %topic, partition, offset, "Skipping tombstone record");
            return None;
        };

        let coordinates = BrokerPosition::new(topic.clone(), partition, offset, "");
        if !self.gate.admit(&coordinates) {
            trace!(position = %coordinates, "Suppressing record at or before saved position");
            return None;
        }

        match self.connector.mapper.map(&payload) {
            Ok(event) => {
                let base = event
                    .position()
                    .as_broker()
                    .cloned()
                    .unwrap_or_else(BrokerPosition::awaiting_first_event);
                let position = base.at(topic, partition, offset);
                Some(Ok(event.with_position(position.into())))
            }
            Err(CdcError::DeserializationFailed { message, raw, .. }) => {
                warn!(
                    topic = %topic,
                    partition,
                    offset,
                    error = %message,
                    "Failed to deserialize CDC record"
                );
                Some(Err(CdcError::DeserializationFailed {
                    message,
                    raw,
                    position: Some(coordinates.into()),
                }))
            }
            Err(e) => Some(Err(e)),
        }
    }

    fn finish(&mut self) {
        self.phase = Phase::Finished;
        if self.closed {
            return;
        }
        self.closed = true;
        self.connector.probe.consumer.close();
        self.connector.state.set(BrokerState::Closed);
        info!(connector_id = self.connector_id(), "Kafka change stream closed");
    }
}

impl<C: LogConsumer + 'static> Drop for BrokerRun<'_, C> {
    fn drop(&mut self) {
        self.finish();
    }
}
