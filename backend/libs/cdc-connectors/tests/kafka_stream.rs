use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdc_connectors::kafka::{
    BrokerState, KafkaCdcConnector, KafkaConnectorConfig, LogConsumer, LogRecord,
};
use cdc_connectors::{
    BrokerPosition, CdcConnector, CdcError, CdcPosition, ChangeOperation, ChangeResult,
    ConnectorKind, CursorPosition, ErrorKind, InMemoryPositionStore, PositionProbe,
    PositionStore, Result, Shutdown,
};
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;

enum Step {
    Record(LogRecord),
    TransportError,
}

#[derive(Clone, Default)]
struct ScriptedConsumer {
    script: Arc<Mutex<VecDeque<Step>>>,
    fail_subscribe: bool,
    closed: Arc<AtomicBool>,
    subscribes: Arc<AtomicUsize>,
}

impl ScriptedConsumer {
    fn with_steps(steps: Vec<Step>) -> Self {
        Self {
            script: Arc::new(Mutex::new(steps.into())),
            ..Default::default()
        }
    }
}

#[async_trait]
impl LogConsumer for ScriptedConsumer {
    async fn probe(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn subscribe(&self, _topics: &[String], _timeout: Duration) -> Result<()> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        if self.fail_subscribe {
            return Err(CdcError::connection_failed("broker refused connection"));
        }
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Option<Result<LogRecord>> {
        let next = self.script.lock().pop_front();
        match next {
            Some(Step::Record(record)) => Some(Ok(record)),
            Some(Step::TransportError) => {
                Some(Err(CdcError::stream_interrupted("broker transport failure")))
            }
            None => {
                tokio::time::sleep(timeout).await;
                None
            }
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

struct FailingStore;

#[async_trait]
impl PositionStore for FailingStore {
    async fn get_position(&self, _connector_id: &str) -> Result<Option<CdcPosition>> {
        Err(CdcError::PositionStore("store offline".to_string()))
    }

    async fn save_position(&self, _connector_id: &str, _position: &CdcPosition) -> Result<()> {
        Err(CdcError::PositionStore("store offline".to_string()))
    }
}

fn envelope(id: i64) -> Vec<u8> {
    json!({
        "before": null,
        "after": {"id": id, "status": "created"},
        "source": {
            "connector": "postgresql",
            "name": "nova-db",
            "ts_ms": 1_700_000_000_000i64,
            "db": "nova",
            "schema": "public",
            "table": "orders",
            "lsn": 24_000_000 + id
        },
        "op": "c",
        "ts_ms": 1_700_000_000_100i64
    })
    .to_string()
    .into_bytes()
}

fn record(partition: i32, offset: i64) -> Step {
    Step::Record(LogRecord {
        topic: "orders".to_string(),
        partition,
        offset,
        payload: Some(envelope(offset)),
    })
}

fn config() -> KafkaConnectorConfig {
    KafkaConnectorConfig {
        topics: vec!["orders".to_string()],
        poll_timeout_ms: 10,
        ..Default::default()
    }
}

async fn store_with(position: Option<BrokerPosition>) -> Arc<InMemoryPositionStore> {
    let store = Arc::new(InMemoryPositionStore::new());
    if let Some(position) = position {
        store
            .save_position("orders-cdc", &position.into())
            .await
            .unwrap();
    }
    store
}

fn connector(
    consumer: ScriptedConsumer,
    store: Arc<dyn PositionStore>,
) -> KafkaCdcConnector<ScriptedConsumer> {
    KafkaCdcConnector::with_consumer("orders-cdc", &config(), consumer, store).unwrap()
}

async fn collect(
    connector: &mut KafkaCdcConnector<ScriptedConsumer>,
    n: usize,
) -> Vec<ChangeResult> {
    let stream = connector.stream_changes(Shutdown::never());
    tokio::time::timeout(Duration::from_secs(5), stream.take(n).collect::<Vec<_>>())
        .await
        .expect("stream should yield the expected items")
}

fn offsets(items: &[ChangeResult]) -> Vec<(i32, i64)> {
    items
        .iter()
        .map(|item| {
            let position = item.as_ref().unwrap().position().as_broker().unwrap();
            (position.partition, position.offset)
        })
        .collect()
}

#[tokio::test]
async fn test_replay_resumes_after_saved_offset() {
    let consumer = ScriptedConsumer::with_steps(vec![
        record(0, 98),
        record(0, 99),
        record(0, 100),
        record(0, 101),
        record(0, 102),
    ]);
    let store = store_with(Some(BrokerPosition::new("orders", 0, 100, ""))).await;
    let mut connector = connector(consumer, store);

    let items = collect(&mut connector, 2).await;
    assert_eq!(offsets(&items), vec![(0, 101), (0, 102)]);

    let event = items[0].as_ref().unwrap();
    assert_eq!(event.operation, ChangeOperation::Insert);
    assert_eq!(event.source_entity, "orders");
    let position = event.position().as_broker().unwrap();
    assert_eq!(position.topic, "orders");
    assert!(position.base_offset_payload.contains("24000101"));
}

#[tokio::test]
async fn test_other_partition_is_emitted_immediately() {
    let consumer = ScriptedConsumer::with_steps(vec![record(1, 5), record(0, 99), record(0, 100)]);
    let store = store_with(Some(BrokerPosition::new("orders", 0, 100, ""))).await;
    let mut connector = connector(consumer, store);

    let items = collect(&mut connector, 3).await;
    assert_eq!(offsets(&items), vec![(1, 5), (0, 99), (0, 100)]);
}

#[tokio::test]
async fn test_no_saved_position_emits_first_event() {
    let consumer = ScriptedConsumer::with_steps(vec![record(0, 0), record(0, 1)]);
    let mut connector = connector(consumer, store_with(None).await);

    let items = collect(&mut connector, 2).await;
    assert_eq!(offsets(&items), vec![(0, 0), (0, 1)]);
}

#[tokio::test]
async fn test_store_failure_starts_without_resume_point() {
    let consumer = ScriptedConsumer::with_steps(vec![record(0, 42)]);
    let mut connector = connector(consumer, Arc::new(FailingStore));

    let items = collect(&mut connector, 1).await;
    assert_eq!(offsets(&items), vec![(0, 42)]);
}

#[tokio::test]
async fn test_malformed_record_yields_one_error_and_stream_continues() {
    let consumer = ScriptedConsumer::with_steps(vec![
        record(0, 10),
        Step::Record(LogRecord {
            topic: "orders".to_string(),
            partition: 0,
            offset: 11,
            payload: Some(b"{not json".to_vec()),
        }),
        record(0, 12),
    ]);
    let mut connector = connector(consumer, store_with(None).await);

    let items = collect(&mut connector, 3).await;
    assert!(items[0].is_ok());
    assert!(items[2].is_ok());

    let err = items[1].as_ref().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::DeserializationFailed);
    assert!(!err.is_terminal_for(ConnectorKind::Kafka));
    assert_eq!(err.raw_record(), Some(&b"{not json"[..]));
    match err {
        CdcError::DeserializationFailed {
            position: Some(CdcPosition::Broker(position)),
            ..
        } => assert_eq!((position.partition, position.offset), (0, 11)),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn test_malformed_record_in_replayed_range_is_suppressed() {
    let consumer = ScriptedConsumer::with_steps(vec![
        Step::Record(LogRecord {
            topic: "orders".to_string(),
            partition: 0,
            offset: 99,
            payload: Some(b"{bad".to_vec()),
        }),
        record(0, 100),
        record(0, 101),
    ]);
    let store = store_with(Some(BrokerPosition::new("orders", 0, 100, ""))).await;
    let mut connector = connector(consumer, store);

    let items = collect(&mut connector, 1).await;
    assert_eq!(offsets(&items), vec![(0, 101)]);
}

#[tokio::test]
async fn test_tombstones_are_skipped() {
    let consumer = ScriptedConsumer::with_steps(vec![
        Step::Record(LogRecord {
            topic: "orders".to_string(),
            partition: 0,
            offset: 3,
            payload: None,
        }),
        record(0, 4),
    ]);
    let mut connector = connector(consumer, store_with(None).await);

    let items = collect(&mut connector, 1).await;
    assert_eq!(offsets(&items), vec![(0, 4)]);
}

#[tokio::test]
async fn test_transport_error_does_not_end_stream() {
    let consumer =
        ScriptedConsumer::with_steps(vec![record(0, 1), Step::TransportError, record(0, 2)]);
    let mut connector = connector(consumer, store_with(None).await);

    let items = collect(&mut connector, 3).await;
    assert!(items[0].is_ok());
    assert_eq!(
        items[1].as_ref().unwrap_err().kind(),
        ErrorKind::StreamInterrupted
    );
    assert!(items[2].is_ok());
}

#[tokio::test]
async fn test_subscribe_failure_ends_stream_with_connection_error() {
    let consumer = ScriptedConsumer {
        fail_subscribe: true,
        ..ScriptedConsumer::with_steps(vec![record(0, 1)])
    };
    let closed = consumer.closed.clone();
    let mut connector = connector(consumer, store_with(None).await);

    let items = connector
        .stream_changes(Shutdown::never())
        .collect::<Vec<_>>()
        .await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap_err().kind(), ErrorKind::ConnectionFailed);
    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(connector.state(), BrokerState::Closed);
}

#[tokio::test]
async fn test_shutdown_ends_stream_without_error() {
    let consumer = ScriptedConsumer::with_steps(vec![record(0, 1)]);
    let closed = consumer.closed.clone();
    let mut connector = connector(consumer, store_with(None).await);

    let (stop, shutdown) = Shutdown::channel();
    {
        let mut stream = connector.stream_changes(shutdown);
        assert!(stream.next().await.unwrap().is_ok());

        // the script is exhausted, so the next poll idles until shutdown
        stop.send(true).unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream should end after shutdown");
        assert!(next.is_none());
    }

    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(connector.state(), BrokerState::Closed);
}

#[tokio::test]
async fn test_dropping_stream_closes_consumer() {
    let consumer = ScriptedConsumer::with_steps(vec![record(0, 1), record(0, 2)]);
    let closed = consumer.closed.clone();
    let mut connector = connector(consumer, store_with(None).await);

    {
        let mut stream = connector.stream_changes(Shutdown::never());
        assert!(stream.next().await.unwrap().is_ok());
    }

    assert!(closed.load(Ordering::SeqCst));
    assert_eq!(connector.state(), BrokerState::Closed);
}

#[tokio::test]
async fn test_probe_reports_saved_position() {
    let store = store_with(Some(BrokerPosition::new("orders", 2, 7, ""))).await;
    let connector = connector(ScriptedConsumer::default(), store);

    let position = connector.probe().get_current_position().await.unwrap();
    assert_eq!(
        position
            .compare(&BrokerPosition::new("orders", 2, 7, "").into())
            .unwrap(),
        std::cmp::Ordering::Equal
    );
}

#[tokio::test]
async fn test_probe_ignores_saved_cursor_position() {
    let store = Arc::new(InMemoryPositionStore::new());
    store
        .save_position("orders-cdc", &CursorPosition::new(vec![1, 2, 3]).into())
        .await
        .unwrap();
    let connector = connector(ScriptedConsumer::default(), store);

    let position = connector.probe().get_current_position().await.unwrap();
    assert!(position.as_broker().unwrap().is_awaiting_first_event());
}
