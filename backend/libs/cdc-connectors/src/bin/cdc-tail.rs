//! Tail one CDC connector and print normalized events as JSON lines
//!
//! `CDC_SOURCE` selects the connector (`kafka` or `mongodb`); the rest comes
//! from the connector's own `CDC_KAFKA_*` / `CDC_MONGO_*` variables.

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cdc_connectors::kafka::{KafkaCdcConnector, KafkaConnectorConfig};
use cdc_connectors::mongo::{MongoCdcConnector, MongoConnectorConfig};
use cdc_connectors::{
    CdcConnector, ConnectorHealthCheck, InMemoryPositionStore, PositionStore, Shutdown,
};
use futures::StreamExt;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,cdc_connectors=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let source = std::env::var("CDC_SOURCE").unwrap_or_else(|_| "kafka".to_string());
    let connector_id =
        std::env::var("CDC_CONNECTOR_ID").unwrap_or_else(|_| format!("cdc-tail-{}", source));
    let store = Arc::new(InMemoryPositionStore::new());

    let (stop_tx, shutdown) = Shutdown::channel();
    tokio::spawn(wait_for_ctrl_c(stop_tx));

    tracing::info!(source = %source, connector_id = %connector_id, "Starting cdc-tail");

    match source.to_ascii_lowercase().as_str() {
        "kafka" => {
            let config =
                KafkaConnectorConfig::from_env().context("Failed to load Kafka configuration")?;
            let mut connector = KafkaCdcConnector::new(&connector_id, config, store.clone())
                .context("Failed to create Kafka connector")?;
            tail(&mut connector, store, shutdown).await
        }
        "mongodb" | "mongo" => {
            let config =
                MongoConnectorConfig::from_env().context("Failed to load MongoDB configuration")?;
            let mut connector = MongoCdcConnector::connect(&connector_id, config, store.clone())
                .await
                .context("Failed to create MongoDB connector")?;
            tail(&mut connector, store, shutdown).await
        }
        other => bail!("unknown CDC_SOURCE '{}', expected 'kafka' or 'mongodb'", other),
    }
}

async fn wait_for_ctrl_c(stop: watch::Sender<bool>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        tracing::info!("Ctrl-C received, shutting down");
        let _ = stop.send(true);
    }
}

/// Print every event, checkpointing after each one
///
/// Terminal errors re-open the stream with exponential backoff, resuming from
/// the last checkpoint.
async fn tail<C: CdcConnector>(
    connector: &mut C,
    store: Arc<InMemoryPositionStore>,
    mut shutdown: Shutdown,
) -> Result<()> {
    let connector_id = connector.connector_id().to_string();
    let kind = connector.kind();

    let report = ConnectorHealthCheck::new(connector.probe()).check().await;
    tracing::info!(
        connector_id = %connector_id,
        status = report.status.as_str(),
        detail = ?report.detail,
        "Initial health check"
    );

    let mut backoff = Duration::from_secs(1);
    let stdout = std::io::stdout();

    loop {
        {
            let mut changes = connector.stream_changes(shutdown.clone());
            while let Some(item) = changes.next().await {
                match item {
                    Ok(event) => {
                        let line = serde_json::to_string(&event)
                            .context("Failed to serialize change event")?;
                        writeln!(stdout.lock(), "{}", line).context("Failed to write to stdout")?;

                        store
                            .save_position(&connector_id, event.position())
                            .await
                            .context("Failed to save position")?;
                        backoff = Duration::from_secs(1);
                    }
                    Err(e) if e.is_terminal_for(kind) => {
                        tracing::error!(
                            connector_id = %connector_id,
                            error = %e,
                            "Change stream ended with error"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            connector_id = %connector_id,
                            error = %e,
                            raw_bytes = e.raw_record().map(<[u8]>::len),
                            "Skipping change"
                        );
                    }
                }
            }
        }

        if shutdown.is_triggered() {
            break;
        }

        tracing::info!(
            connector_id = %connector_id,
            backoff = ?backoff,
            "Re-opening change stream"
        );
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    tracing::info!(connector_id = %connector_id, "cdc-tail stopped");
    Ok(())
}
