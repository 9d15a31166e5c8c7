use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{CdcError, Result};
use crate::position::CdcPosition;

/// Durable checkpoint storage, keyed by connector id
///
/// Connectors only call [`PositionStore::get_position`], once per
/// `stream_changes` call. `save_position` belongs to the downstream pipeline
/// and must only run after an event's effects are applied, which is what makes
/// delivery at-least-once.
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Read the last saved position for a connector
    ///
    /// Returns `None` if nothing has been saved yet.
    async fn get_position(&self, connector_id: &str) -> Result<Option<CdcPosition>>;

    /// Save a position for a connector (upsert)
    async fn save_position(&self, connector_id: &str, position: &CdcPosition) -> Result<()>;
}

/// Position store that lives only as long as the process
///
/// Positions are kept in their byte encoding, the same form a durable store
/// would persist.
#[derive(Debug, Default)]
pub struct InMemoryPositionStore {
    positions: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryPositionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delete the position for a connector so the next stream starts fresh
    pub async fn delete_position(&self, connector_id: &str) -> bool {
        self.positions.write().await.remove(connector_id).is_some()
    }
}

#[async_trait]
impl PositionStore for InMemoryPositionStore {
    async fn get_position(&self, connector_id: &str) -> Result<Option<CdcPosition>> {
        let positions = self.positions.read().await;
        match positions.get(connector_id) {
            Some(bytes) => {
                let position = CdcPosition::from_bytes(bytes)
                    .map_err(|e| CdcError::PositionStore(e.to_string()))?;
                debug!(connector_id, ?position, "Found saved position");
                Ok(Some(position))
            }
            None => {
                debug!(connector_id, "No saved position found");
                Ok(None)
            }
        }
    }

    async fn save_position(&self, connector_id: &str, position: &CdcPosition) -> Result<()> {
        let bytes = position
            .to_bytes()
            .map_err(|e| CdcError::PositionStore(e.to_string()))?;
        self.positions
            .write()
            .await
            .insert(connector_id.to_string(), bytes);
        debug!(connector_id, ?position, "Saved position");
        Ok(())
    }
}
