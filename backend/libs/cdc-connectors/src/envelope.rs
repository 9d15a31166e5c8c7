//! Debezium change envelope mapping
//!
//! Debezium writes the same envelope in two shapes depending on
//! `value.converter.schemas.enable`:
//!
//! - `flat`: the payload is the whole message
//! - `nested`: `{"schema": {...}, "payload": {...}}`
//!
//! The shape is configured, not sniffed: [`EnvelopeMapper::new`] picks the
//! decoder once and every record goes through it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{CdcError, Result};
use crate::event::{ChangeEvent, ChangeMetadata, ChangeOperation};
use crate::position::{BrokerPosition, CdcPosition};

/// Wire shape of the envelopes on the configured topics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvelopeFormat {
    /// Schemas disabled, payload only
    #[default]
    Flat,
    /// Schemas enabled, payload wrapped next to its schema
    Nested,
}

impl fmt::Display for EnvelopeFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeFormat::Flat => f.write_str("flat"),
            EnvelopeFormat::Nested => f.write_str("nested"),
        }
    }
}

impl FromStr for EnvelopeFormat {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "flat" => Ok(EnvelopeFormat::Flat),
            "nested" => Ok(EnvelopeFormat::Nested),
            other => Err(CdcError::Configuration(format!(
                "unknown envelope format '{}', expected 'flat' or 'nested'",
                other
            ))),
        }
    }
}

/// Debezium operation codes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DebeziumOperation {
    /// Insert operation (c = create)
    #[serde(rename = "c")]
    Create,
    /// Update operation (u = update)
    #[serde(rename = "u")]
    Update,
    /// Delete operation (d = delete)
    #[serde(rename = "d")]
    Delete,
    /// Read operation (r = read, initial snapshot)
    #[serde(rename = "r")]
    Read,
}

impl From<DebeziumOperation> for ChangeOperation {
    fn from(op: DebeziumOperation) -> Self {
        match op {
            DebeziumOperation::Create | DebeziumOperation::Read => ChangeOperation::Insert,
            DebeziumOperation::Update => ChangeOperation::Update,
            DebeziumOperation::Delete => ChangeOperation::Delete,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebeziumPayload {
    /// State before the change (null for Insert, populated for Update/Delete)
    pub before: Option<Value>,

    /// State after the change (populated for Insert/Update, null for Delete)
    pub after: Option<Value>,

    pub source: DebeziumSource,

    pub op: DebeziumOperation,

    /// Time the connector processed the event, milliseconds since epoch
    pub ts_ms: Option<i64>,

    /// Present when transaction metadata is enabled on the connector
    pub transaction: Option<DebeziumTransaction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebeziumSource {
    pub version: Option<String>,

    /// Connector type (e.g., "postgresql", "mysql", "mongodb")
    pub connector: Option<String>,

    /// Logical name of the database server
    pub name: Option<String>,

    pub ts_ms: Option<i64>,

    pub snapshot: Option<Value>,

    pub db: Option<String>,

    pub sequence: Option<Value>,

    /// Schema name (PostgreSQL, SQL Server)
    pub schema: Option<String>,

    pub table: Option<String>,

    /// Collection name (MongoDB connector)
    pub collection: Option<String>,

    /// Connector-specific offset fields: `lsn`, `txId`, `file`, `pos`, `gtid`, `ord`, ...
    #[serde(flatten)]
    pub offset: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebeziumTransaction {
    pub id: String,
    pub total_order: Option<i64>,
    pub data_collection_order: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct NestedEnvelope {
    payload: DebeziumPayload,
}

impl DebeziumPayload {
    /// Validate the image required by the operation
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self.op {
            DebeziumOperation::Create | DebeziumOperation::Read if self.after.is_none() => Err(
                format!("CDC {:?} operation requires 'after' field", self.op),
            ),
            DebeziumOperation::Delete if self.before.is_none() => {
                Err("CDC Delete operation requires 'before' field".to_string())
            }
            _ => Ok(()),
        }
    }

    pub fn entity(&self) -> Option<&str> {
        self.source
            .table
            .as_deref()
            .or(self.source.collection.as_deref())
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.ts_ms
            .or(self.source.ts_ms)
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now)
    }

    pub fn transaction_id(&self) -> Option<String> {
        if let Some(tx) = &self.transaction {
            return Some(tx.id.clone());
        }
        ["txId", "gtid"]
            .iter()
            .filter_map(|key| self.source.offset.get(*key))
            .find_map(|value| match value {
                Value::Null => None,
                Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            })
    }

    /// Compact JSON of the source's own offset fields
    fn base_offset_payload(&self) -> Result<String> {
        serde_json::to_string(&self.source.offset).map_err(CdcError::from)
    }

    fn into_change_event(self) -> Result<ChangeEvent> {
        let entity = self
            .entity()
            .ok_or_else(|| {
                CdcError::deserialization_failed(
                    "CDC source block has neither 'table' nor 'collection'",
                    None,
                    None,
                )
            })?
            .to_string();

        let position = CdcPosition::from(BrokerPosition::from_source_offset(
            self.base_offset_payload()?,
        ));
        let metadata = ChangeMetadata {
            position,
            captured_at: self.captured_at(),
            transaction_id: self.transaction_id(),
            source_database: self.source.db.clone(),
            source_schema: self.source.schema.clone(),
        };

        Ok(ChangeEvent::new(
            entity,
            self.op.into(),
            self.before,
            self.after,
            metadata,
        ))
    }
}

type DecodeFn = fn(&[u8]) -> serde_json::Result<DebeziumPayload>;

fn decode_flat(raw: &[u8]) -> serde_json::Result<DebeziumPayload> {
    serde_json::from_slice(raw)
}

fn decode_nested(raw: &[u8]) -> serde_json::Result<DebeziumPayload> {
    serde_json::from_slice::<NestedEnvelope>(raw).map(|envelope| envelope.payload)
}

/// Maps raw Debezium records to [`ChangeEvent`]s
///
/// The returned event carries a broker position holding only the
/// source-native offset; the connector fills in topic, partition and offset.
#[derive(Clone)]
pub struct EnvelopeMapper {
    format: EnvelopeFormat,
    decode: DecodeFn,
}

impl EnvelopeMapper {
    pub fn new(format: EnvelopeFormat) -> Self {
        let decode: DecodeFn = match format {
            EnvelopeFormat::Flat => decode_flat,
            EnvelopeFormat::Nested => decode_nested,
        };
        Self { format, decode }
    }

    pub fn format(&self) -> EnvelopeFormat {
        self.format
    }

    pub fn map(&self, raw: &[u8]) -> Result<ChangeEvent> {
        let fail = |message: String| {
            CdcError::deserialization_failed(message, Some(raw.to_vec()), None)
        };

        let payload = (self.decode)(raw)
            .map_err(|e| fail(format!("Invalid {} CDC envelope: {}", self.format, e)))?;
        payload.validate().map_err(fail)?;

        payload.into_change_event().map_err(|e| match e {
            CdcError::DeserializationFailed { message, .. } => fail(message),
            other => other,
        })
    }
}

impl fmt::Debug for EnvelopeMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnvelopeMapper")
            .field("format", &self.format)
            .finish()
    }
}
