use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tracing::{error, info, warn};

use super::client::{ChangeFeed, ChangeFeedClient, MongoChangeFeedClient, WatchRequest};
use super::config::{MongoConnectorConfig, WatchScope};
use super::mapping::{build_options, build_pipeline, map_change};
use crate::connector::{
    CdcConnector, ChangeResult, ChangeStream, ConnectorKind, PositionProbe, Shutdown, StateCell,
};
use crate::error::{CdcError, ErrorKind, Result};
use crate::position::{CdcPosition, CursorPosition};
use crate::store::PositionStore;

/// Lifecycle of the change stream connector
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NativeState {
    #[default]
    Disconnected,
    Watching,
    Streaming,
    Closed,
}

/// MongoDB change stream connector
///
/// Resumes from the stored resume token. Any fault after the cursor is open
/// ends the stream with `StreamInterrupted`; call `stream_changes` again to
/// reopen from the last position the pipeline saved.
pub struct MongoCdcConnector<F: ChangeFeedClient = MongoChangeFeedClient> {
    probe: Arc<MongoProbe<F>>,
    config: MongoConnectorConfig,
    state: StateCell<NativeState>,
}

impl MongoCdcConnector<MongoChangeFeedClient> {
    /// Create a connector backed by the MongoDB driver
    pub async fn connect(
        connector_id: impl Into<String>,
        config: MongoConnectorConfig,
        store: Arc<dyn PositionStore>,
    ) -> Result<Self> {
        let connector_id = connector_id.into();
        config.validate()?;

        info!(
            connector_id = %connector_id,
            database = %config.database,
            collections = ?config.collections,
            watch_scope = ?config.watch_scope,
            "Initializing MongoDB CDC connector"
        );

        let client = MongoChangeFeedClient::connect(&config).await?;
        Self::with_client(connector_id, config, client, store)
    }
}

impl<F: ChangeFeedClient + 'static> MongoCdcConnector<F> {
    /// Create a connector around an existing change feed client
    pub fn with_client(
        connector_id: impl Into<String>,
        config: MongoConnectorConfig,
        client: F,
        store: Arc<dyn PositionStore>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            probe: Arc::new(MongoProbe {
                connector_id: connector_id.into(),
                client,
                store,
                timeout: config.connect_timeout(),
            }),
            config,
            state: StateCell::default(),
        })
    }

    pub fn state(&self) -> NativeState {
        self.state.get()
    }

    /// Saved resume point, `None` when the stream starts at the current time
    ///
    /// Store failures degrade to "no resume point".
    async fn load_resume_point(&self) -> Option<CursorPosition> {
        let connector_id = self.probe.connector_id.as_str();
        match self.probe.store.get_position(connector_id).await {
            Ok(Some(CdcPosition::Cursor(position))) if !position.is_start() => {
                info!(
                    connector_id,
                    token_bytes = position.resume_token.len(),
                    "Resuming change stream after saved token"
                );
                Some(position)
            }
            Ok(Some(CdcPosition::Cursor(_))) | Ok(None) => {
                info!(connector_id, "No saved resume token, watching from now");
                None
            }
            Ok(Some(other)) => {
                warn!(
                    connector_id,
                    position = ?other,
                    "Saved position is not a cursor position, ignoring it"
                );
                None
            }
            Err(e) => {
                warn!(
                    connector_id,
                    error = %e,
                    "Failed to load saved position, starting without resume token"
                );
                None
            }
        }
    }

    async fn watch_request(&self) -> WatchRequest {
        let resume = self.load_resume_point().await;
        let options = match build_options(&self.config, resume.as_ref()) {
            Ok(options) => options,
            Err(e) => {
                warn!(
                    connector_id = %self.probe.connector_id,
                    error = %e,
                    "Saved resume token is unusable, watching from now"
                );
                build_options(&self.config, None).unwrap_or_default()
            }
        };

        let collection = match self.config.watch_scope {
            WatchScope::Collection => self
                .config
                .collections()
                .first()
                .map(|c| c.to_string()),
            WatchScope::Database => None,
        };

        WatchRequest {
            database: self.config.database.clone(),
            collection,
            pipeline: build_pipeline(&self.config),
            options,
        }
    }
}

#[async_trait]
impl<F: ChangeFeedClient + 'static> PositionProbe for MongoCdcConnector<F> {
    fn connector_id(&self) -> &str {
        self.probe.connector_id()
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::MongoDb
    }

    async fn get_current_position(&self) -> Result<CdcPosition> {
        self.probe.get_current_position().await
    }
}

impl<F: ChangeFeedClient + 'static> CdcConnector for MongoCdcConnector<F> {
    fn stream_changes(&mut self, shutdown: Shutdown) -> ChangeStream<'_> {
        let run = NativeRun::new(self, shutdown);
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

struct MongoProbe<F> {
    connector_id: String,
    client: F,
    store: Arc<dyn PositionStore>,
    timeout: Duration,
}

#[async_trait]
impl<F: ChangeFeedClient + 'static> PositionProbe for MongoProbe<F> {
    fn connector_id(&self) -> &str {
        &self.connector_id
    }

    fn kind(&self) -> ConnectorKind {
        ConnectorKind::MongoDb
    }

    async fn get_current_position(&self) -> Result<CdcPosition> {
        self.client.ping(self.timeout).await?;

        Ok(self
            .store
            .get_position(&self.connector_id)
            .await?
            .unwrap_or_else(|| CursorPosition::start().into()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Opening,
    Streaming,
    Finished,
}

/// State of one `stream_changes` call
///
/// Owns the open cursor. The cursor is dropped on every exit path, including
/// the stream itself being dropped.
struct NativeRun<'a, F: ChangeFeedClient + 'static> {
    connector: &'a MongoCdcConnector<F>,
    shutdown: Shutdown,
    feed: Option<ChangeFeed>,
    phase: Phase,
    closed: bool,
}

impl<'a, F: ChangeFeedClient + 'static> NativeRun<'a, F> {
    fn new(connector: &'a MongoCdcConnector<F>, shutdown: Shutdown) -> Self {
        Self {
            connector,
            shutdown,
            feed: None,
            phase: Phase::Opening,
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
                    "Shutdown requested, stopping change stream"
                );
                self.finish();
                return None;
            }

            match self.phase {
                Phase::Opening => {
                    let request = tokio::select! {
                        _ = self.shutdown.triggered() => continue,
                        request = connector.watch_request() => request,
                    };
                    let opened = tokio::select! {
                        _ = self.shutdown.triggered() => continue,
                        opened = connector.probe.client.open(request) => opened,
                    };

                    match opened {
                        Ok(feed) => {
                            self.feed = Some(feed);
                            connector.state.set(NativeState::Watching);
                            self.phase = Phase::Streaming;
                            info!(
                                connector_id = self.connector_id(),
                                database = %connector.config.database,
                                "MongoDB change stream opened"
                            );
                        }
                        Err(e) => {
                            error!(
                                connector_id = self.connector_id(),
                                error = %e,
                                "Failed to open change stream"
                            );
                            self.finish();
                            return Some(Err(as_connection_failure(e)));
                        }
                    }
                }
                Phase::Streaming => {
                    let Some(feed) = self.feed.as_mut() else {
                        self.finish();
                        return None;
                    };

                    let next = tokio::select! {
                        _ = self.shutdown.triggered() => continue,
                        next = feed.next() => next,
                    };

                    match next {
                        None => {
                            info!(
                                connector_id = self.connector_id(),
                                "MongoDB change stream ended"
                            );
                            self.finish();
                            return None;
                        }
                        Some(Err(e)) => {
                            error!(
                                connector_id = self.connector_id(),
                                error = %e,
                                "Change stream interrupted"
                            );
                            self.finish();
                            return Some(Err(as_interruption(e)));
                        }
                        Some(Ok(change)) => {
                            connector
                                .state
                                .transition(&[NativeState::Watching], NativeState::Streaming);
                            match map_change(change) {
                                Ok(Some(event)) => return Some(Ok(event)),
                                Ok(None) => continue,
                                Err(e) => {
                                    error!(
                                        connector_id = self.connector_id(),
                                        error = %e,
                                        "Unmappable change stream event, closing cursor"
                                    );
                                    self.finish();
                                    return Some(Err(as_interruption(e)));
                                }
                            }
                        }
                    }
                }
                Phase::Finished => return None,
            }
        }
    }

    fn finish(&mut self) {
        self.phase = Phase::Finished;
        // dropping the feed kills the server-side cursor
        self.feed = None;
        if self.closed {
            return;
        }
        self.closed = true;
        self.connector.state.set(NativeState::Closed);
        info!(connector_id = self.connector_id(), "MongoDB change stream closed");
    }
}

impl<F: ChangeFeedClient + 'static> Drop for NativeRun<'_, F> {
    fn drop(&mut self) {
        self.finish();
    }
}

fn as_connection_failure(e: CdcError) -> CdcError {
    match e.kind() {
        ErrorKind::ConnectionFailed => e,
        _ => CdcError::connection_failed(e.to_string()),
    }
}

fn as_interruption(e: CdcError) -> CdcError {
    match e.kind() {
        ErrorKind::StreamInterrupted => e,
        _ => CdcError::stream_interrupted(e.to_string()),
    }
}
