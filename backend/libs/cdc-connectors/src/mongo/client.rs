use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use mongodb::bson::{doc, Document};
use mongodb::change_stream::event::ChangeStreamEvent;
use mongodb::options::{ChangeStreamOptions, ClientOptions};
use mongodb::Client;
use tracing::{debug, error};

use super::config::MongoConnectorConfig;
use crate::error::{CdcError, Result};

/// Open change stream: driver events, transport faults as `StreamInterrupted`
pub type ChangeFeed = BoxStream<'static, Result<ChangeStreamEvent<Document>>>;

/// Everything needed to open one change stream
#[derive(Debug, Clone)]
pub struct WatchRequest {
    pub database: String,
    /// `Some` watches a single collection, `None` the whole database
    pub collection: Option<String>,
    pub pipeline: Vec<Document>,
    pub options: ChangeStreamOptions,
}

/// Driver seam used by [`super::MongoCdcConnector`]
#[async_trait]
pub trait ChangeFeedClient: Send + Sync {
    /// Round-trip to the deployment within `timeout`
    async fn ping(&self, timeout: Duration) -> Result<()>;

    /// Open a change stream; failures are `ConnectionFailed`
    async fn open(&self, request: WatchRequest) -> Result<ChangeFeed>;
}

/// [`ChangeFeedClient`] backed by the official driver
#[derive(Debug, Clone)]
pub struct MongoChangeFeedClient {
    client: Client,
}

impl MongoChangeFeedClient {
    /// Build a client from the connection string
    ///
    /// The driver connects lazily, so this only fails on a malformed URI.
    pub async fn connect(config: &MongoConnectorConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.uri).await.map_err(|e| {
            CdcError::Configuration(format!("Invalid MongoDB connection string: {}", e))
        })?;

        options.server_selection_timeout = Some(config.connect_timeout());
        options.connect_timeout = Some(config.connect_timeout());
        if options.app_name.is_none() {
            options.app_name = Some("cdc-connectors".to_string());
        }

        let client = Client::with_options(options).map_err(|e| {
            error!("Failed to create MongoDB client: {}", e);
            CdcError::connection_failed(format!("Failed to create MongoDB client: {}", e))
        })?;

        Ok(Self { client })
    }

    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChangeFeedClient for MongoChangeFeedClient {
    async fn ping(&self, timeout: Duration) -> Result<()> {
        let admin = self.client.database("admin");
        let ping = admin.run_command(doc! { "ping": 1 }, None);

        match tokio::time::timeout(timeout, ping).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(CdcError::connection_failed(format!(
                "MongoDB ping failed: {}",
                e
            ))),
            Err(_) => Err(CdcError::connection_failed(format!(
                "MongoDB ping timed out after {:?}",
                timeout
            ))),
        }
    }

    async fn open(&self, request: WatchRequest) -> Result<ChangeFeed> {
        let WatchRequest {
            database,
            collection,
            pipeline,
            options,
        } = request;

        let db = self.client.database(&database);
        let opened = match &collection {
            Some(name) => {
                db.collection::<Document>(name)
                    .watch(pipeline, options)
                    .await
            }
            None => db.watch(pipeline, options).await,
        };

        let stream = opened.map_err(|e| {
            CdcError::connection_failed(format!(
                "Failed to open change stream on {}{}: {}",
                database,
                collection.as_deref().map(|c| format!(".{}", c)).unwrap_or_default(),
                e
            ))
        })?;

        debug!(database = %database, collection = ?collection, "Change stream opened");

        Ok(stream
            .map(|event| {
                event.map_err(|e| {
                    CdcError::stream_interrupted(format!("Change stream error: {}", e))
                })
            })
            .boxed())
    }
}
