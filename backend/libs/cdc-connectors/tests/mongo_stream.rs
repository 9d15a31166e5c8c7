use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cdc_connectors::mongo::mapping::encode_resume_token;
use cdc_connectors::mongo::{
    ChangeFeed, ChangeFeedClient, MongoCdcConnector, MongoConnectorConfig, NativeState,
    WatchRequest, WatchScope,
};
use cdc_connectors::{
    CdcConnector, CdcError, CdcPosition, ChangeOperation, ConnectorKind, CursorPosition,
    ErrorKind, InMemoryPositionStore, PositionProbe, PositionStore, Result, Shutdown,
};
use futures::stream::BoxStream;
use futures::StreamExt;
use mongodb::bson::{self, doc, Document};
use mongodb::change_stream::event::ChangeStreamEvent;
use parking_lot::Mutex;

type FeedItem = Result<ChangeStreamEvent<Document>>;

/// Sets its flag when the feed holding it is dropped
struct CursorGuard(Arc<AtomicBool>);

impl Drop for CursorGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeFeedClient {
    items: Mutex<Vec<FeedItem>>,
    /// Keep the feed open after the scripted items instead of ending it
    hold_open: bool,
    fail_open: bool,
    released: Arc<AtomicBool>,
    requests: Arc<Mutex<Vec<WatchRequest>>>,
}

impl FakeFeedClient {
    fn with_items(items: Vec<FeedItem>) -> Self {
        Self {
            items: Mutex::new(items),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ChangeFeedClient for FakeFeedClient {
    async fn ping(&self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn open(&self, request: WatchRequest) -> Result<ChangeFeed> {
        self.requests.lock().push(request);
        if self.fail_open {
            return Err(CdcError::connection_failed("no replica set primary"));
        }

        let items = std::mem::take(&mut *self.items.lock());
        let guard = CursorGuard(self.released.clone());
        let tail: BoxStream<'static, FeedItem> = if self.hold_open {
            futures::stream::pending().boxed()
        } else {
            futures::stream::empty().boxed()
        };

        Ok(futures::stream::iter(items)
            .chain(tail)
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed())
    }
}

fn event(op: &str, token: &str, full_document: Option<Document>) -> ChangeStreamEvent<Document> {
    let mut raw = doc! {
        "_id": { "_data": token },
        "operationType": op,
        "ns": { "db": "shop", "coll": "orders" },
        "documentKey": { "_id": 7 },
    };
    if let Some(full) = full_document {
        raw.insert("fullDocument", full);
    }
    let bytes = bson::to_vec(&raw).unwrap();
    bson::from_slice(&bytes).unwrap()
}

fn config() -> MongoConnectorConfig {
    MongoConnectorConfig {
        database: "shop".to_string(),
        collections: vec!["orders".to_string()],
        ..Default::default()
    }
}

fn connector(
    client: FakeFeedClient,
    store: Arc<dyn PositionStore>,
) -> MongoCdcConnector<FakeFeedClient> {
    MongoCdcConnector::with_client("orders-mongo", config(), client, store).unwrap()
}

#[tokio::test]
async fn test_row_operations_map_to_change_events() {
    let client = FakeFeedClient::with_items(vec![
        Ok(event("insert", "01", Some(doc! { "_id": 7, "total": 10 }))),
        Ok(event("replace", "02", Some(doc! { "_id": 7, "total": 12 }))),
        Ok(event("delete", "03", None)),
    ]);
    let released = client.released.clone();
    let mut connector = connector(client, Arc::new(InMemoryPositionStore::new()));

    let items = connector
        .stream_changes(Shutdown::never())
        .collect::<Vec<_>>()
        .await;

    let events: Vec<_> = items.into_iter().map(|item| item.unwrap()).collect();
    let operations: Vec<_> = events.iter().map(|e| e.operation).collect();
    assert_eq!(
        operations,
        vec![ChangeOperation::Insert, ChangeOperation::Update, ChangeOperation::Delete]
    );
    assert!(events[2].after.is_none());
    assert!(events
        .iter()
        .all(|e| matches!(e.position(), CdcPosition::Cursor(c) if !c.is_start())));

    assert!(released.load(Ordering::SeqCst));
    assert_eq!(connector.state(), NativeState::Closed);
}

#[tokio::test]
async fn test_non_row_operations_are_skipped() {
    let client = FakeFeedClient::with_items(vec![
        Ok(event("drop", "01", None)),
        Ok(event("insert", "02", Some(doc! { "_id": 8 }))),
    ]);
    let mut connector = connector(client, Arc::new(InMemoryPositionStore::new()));

    let items = connector
        .stream_changes(Shutdown::never())
        .collect::<Vec<_>>()
        .await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap().operation, ChangeOperation::Insert);
}

#[tokio::test]
async fn test_mid_stream_error_ends_stream() {
    let client = FakeFeedClient::with_items(vec![
        Ok(event("insert", "01", Some(doc! { "_id": 1 }))),
        Err(CdcError::stream_interrupted("cursor killed")),
        Ok(event("insert", "02", Some(doc! { "_id": 2 }))),
    ]);
    let released = client.released.clone();
    let mut connector = connector(client, Arc::new(InMemoryPositionStore::new()));

    let items = connector
        .stream_changes(Shutdown::never())
        .collect::<Vec<_>>()
        .await;
    assert_eq!(items.len(), 2);
    assert!(items[0].is_ok());

    let err = items[1].as_ref().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StreamInterrupted);
    assert!(err.is_terminal_for(ConnectorKind::MongoDb));
    assert!(released.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_unmappable_event_ends_stream_and_releases_cursor() {
    let opaque = doc! {
        "_id": "opaque-string-token",
        "operationType": "insert",
        "ns": { "db": "shop", "coll": "orders" },
        "documentKey": { "_id": 9 },
        "fullDocument": { "_id": 9 },
    };
    let opaque: ChangeStreamEvent<Document> =
        bson::from_slice(&bson::to_vec(&opaque).unwrap()).unwrap();
    let client = FakeFeedClient {
        hold_open: true,
        ..FakeFeedClient::with_items(vec![
            Ok(opaque),
            Ok(event("insert", "02", Some(doc! { "_id": 2 }))),
        ])
    };
    let released = client.released.clone();
    let mut connector = connector(client, Arc::new(InMemoryPositionStore::new()));

    let items = tokio::time::timeout(
        Duration::from_secs(5),
        connector
            .stream_changes(Shutdown::never())
            .collect::<Vec<_>>(),
    )
    .await
    .expect("stream should end after the unmappable event");
    assert_eq!(items.len(), 1);

    let err = items[0].as_ref().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StreamInterrupted);
    assert!(err.is_terminal_for(ConnectorKind::MongoDb));
    assert!(released.load(Ordering::SeqCst));
    assert_eq!(connector.state(), NativeState::Closed);
}

#[tokio::test]
async fn test_open_failure_is_connection_error() {
    let client = FakeFeedClient {
        fail_open: true,
        ..Default::default()
    };
    let mut connector = connector(client, Arc::new(InMemoryPositionStore::new()));

    let items = connector
        .stream_changes(Shutdown::never())
        .collect::<Vec<_>>()
        .await;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].as_ref().unwrap_err().kind(), ErrorKind::ConnectionFailed);
    assert_eq!(connector.state(), NativeState::Closed);
}

#[tokio::test]
async fn test_saved_token_is_used_to_resume() {
    let saved = event("insert", "8263A1", None);
    let token = encode_resume_token(&saved.id).unwrap();
    let store = Arc::new(InMemoryPositionStore::new());
    store
        .save_position("orders-mongo", &CursorPosition::new(token.clone()).into())
        .await
        .unwrap();

    let client = FakeFeedClient::default();
    let requests = client.requests.clone();
    let mut connector = connector(client, store);
    let _ = connector
        .stream_changes(Shutdown::never())
        .collect::<Vec<_>>()
        .await;

    let requests = requests.lock();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    assert_eq!(request.database, "shop");
    assert!(request.collection.is_none());
    assert_eq!(
        request.pipeline,
        vec![doc! { "$match": { "ns.coll": { "$in": ["orders"] } } }]
    );
    let resume_after = request.options.resume_after.as_ref().unwrap();
    assert_eq!(encode_resume_token(resume_after).unwrap(), token);
}

#[tokio::test]
async fn test_collection_scope_watches_single_collection() {
    let client = FakeFeedClient::default();
    let requests = client.requests.clone();
    let config = MongoConnectorConfig {
        watch_scope: WatchScope::Collection,
        ..config()
    };
    let mut connector = MongoCdcConnector::with_client(
        "orders-mongo",
        config,
        client,
        Arc::new(InMemoryPositionStore::new()),
    )
    .unwrap();
    let _ = connector
        .stream_changes(Shutdown::never())
        .collect::<Vec<_>>()
        .await;

    let requests = requests.lock();
    assert_eq!(requests[0].collection.as_deref(), Some("orders"));
    assert!(requests[0].pipeline.is_empty());
    assert!(requests[0].options.resume_after.is_none());
}

#[tokio::test]
async fn test_shutdown_releases_cursor_without_error() {
    let client = FakeFeedClient {
        hold_open: true,
        ..FakeFeedClient::with_items(vec![Ok(event("insert", "01", Some(doc! { "_id": 1 })))])
    };
    let released = client.released.clone();
    let mut connector = connector(client, Arc::new(InMemoryPositionStore::new()));

    let (stop, shutdown) = Shutdown::channel();
    {
        let mut stream = connector.stream_changes(shutdown);
        assert!(stream.next().await.unwrap().is_ok());

        stop.send(true).unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .expect("stream should end after shutdown");
        assert!(next.is_none());
        assert!(released.load(Ordering::SeqCst));
    }

    assert_eq!(connector.state(), NativeState::Closed);
}

#[tokio::test]
async fn test_dropping_stream_releases_cursor() {
    let client = FakeFeedClient {
        hold_open: true,
        ..FakeFeedClient::with_items(vec![Ok(event("insert", "01", Some(doc! { "_id": 1 })))])
    };
    let released = client.released.clone();
    let mut connector = connector(client, Arc::new(InMemoryPositionStore::new()));

    {
        let mut stream = connector.stream_changes(Shutdown::never());
        assert!(stream.next().await.unwrap().is_ok());
        assert!(!released.load(Ordering::SeqCst));
    }

    assert!(released.load(Ordering::SeqCst));
    assert_eq!(connector.state(), NativeState::Closed);
}

#[tokio::test]
async fn test_probe_reports_start_when_nothing_saved() {
    let connector = connector(
        FakeFeedClient::default(),
        Arc::new(InMemoryPositionStore::new()),
    );

    let probe = connector.probe();
    assert_eq!(probe.kind(), ConnectorKind::MongoDb);
    let position = probe.get_current_position().await.unwrap();
    assert!(position.as_cursor().unwrap().is_start());
}
