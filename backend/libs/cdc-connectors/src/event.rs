use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::position::CdcPosition;

/// Normalized row-level operation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
}

impl ChangeOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeOperation::Insert => "insert",
            ChangeOperation::Update => "update",
            ChangeOperation::Delete => "delete",
        }
    }
}

/// Where and when a change was captured
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeMetadata {
    pub position: CdcPosition,
    pub captured_at: DateTime<Utc>,
    pub transaction_id: Option<String>,
    pub source_database: Option<String>,
    pub source_schema: Option<String>,
}

impl ChangeMetadata {
    pub fn new(position: CdcPosition, captured_at: DateTime<Utc>) -> Self {
        Self {
            position,
            captured_at,
            transaction_id: None,
            source_database: None,
            source_schema: None,
        }
    }
}

/// One row-level change in source-independent shape
///
/// Payload images are opaque JSON. [`ChangeEvent::new`] drops the image an
/// operation cannot carry: deletes have no `after`, inserts have no `before`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Table or collection name
    pub source_entity: String,
    pub operation: ChangeOperation,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub metadata: ChangeMetadata,
}

impl ChangeEvent {
    pub fn new(
        source_entity: impl Into<String>,
        operation: ChangeOperation,
        before: Option<Value>,
        after: Option<Value>,
        metadata: ChangeMetadata,
    ) -> Self {
        let (before, after) = match operation {
            ChangeOperation::Insert => (None, after),
            ChangeOperation::Delete => (before, None),
            ChangeOperation::Update => (before, after),
        };

        Self {
            source_entity: source_entity.into(),
            operation,
            before,
            after,
            metadata,
        }
    }

    pub fn position(&self) -> &CdcPosition {
        &self.metadata.position
    }

    /// Replace the position attached to this event
    pub fn with_position(mut self, position: CdcPosition) -> Self {
        self.metadata.position = position;
        self
    }
}
