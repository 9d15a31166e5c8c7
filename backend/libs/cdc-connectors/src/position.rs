//! Ordered, byte-serializable stream positions
//!
//! A position is built once per emitted event inside a connector and saved by
//! the caller after the event's effects are committed. The variant set is
//! closed: broker coordinates for log-based sources and opaque resume tokens
//! for native change feeds. Comparing across variants is an error; use
//! [`CdcPosition::compare`], there is no `PartialOrd` on the enum.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CdcError, Result};

/// Last durable checkpoint of a connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CdcPosition {
    Broker(BrokerPosition),
    Cursor(CursorPosition),
}

impl CdcPosition {
    /// Compare two positions of the same variant
    pub fn compare(&self, other: &CdcPosition) -> Result<Ordering> {
        match (self, other) {
            (CdcPosition::Broker(a), CdcPosition::Broker(b)) => Ok(a.cmp(b)),
            (CdcPosition::Cursor(a), CdcPosition::Cursor(b)) => Ok(a.cmp(b)),
            _ => Err(CdcError::IncomparablePositions(format!(
                "cannot compare {} position with {} position",
                self.variant_name(),
                other.variant_name()
            ))),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| CdcError::InvalidPosition(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| CdcError::InvalidPosition(e.to_string()))
    }

    pub fn as_broker(&self) -> Option<&BrokerPosition> {
        match self {
            CdcPosition::Broker(p) => Some(p),
            CdcPosition::Cursor(_) => None,
        }
    }

    pub fn as_cursor(&self) -> Option<&CursorPosition> {
        match self {
            CdcPosition::Cursor(p) => Some(p),
            CdcPosition::Broker(_) => None,
        }
    }

    fn variant_name(&self) -> &'static str {
        match self {
            CdcPosition::Broker(_) => "broker",
            CdcPosition::Cursor(_) => "cursor",
        }
    }
}

impl From<BrokerPosition> for CdcPosition {
    fn from(position: BrokerPosition) -> Self {
        CdcPosition::Broker(position)
    }
}

impl From<CursorPosition> for CdcPosition {
    fn from(position: CursorPosition) -> Self {
        CdcPosition::Cursor(position)
    }
}

/// Coordinates of a record in a partitioned log
///
/// Ordering and equality only consider `(topic, partition, offset)`. Across
/// partitions the order is a storage order, not a causal one.
/// `base_offset_payload` keeps the source's own offset descriptor (for
/// Debezium, the LSN / binlog coordinates of the `source` block).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub base_offset_payload: String,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl BrokerPosition {
    pub fn new(
        topic: impl Into<String>,
        partition: i32,
        offset: i64,
        base_offset_payload: impl Into<String>,
    ) -> Self {
        Self {
            base_offset_payload: base_offset_payload.into(),
            topic: topic.into(),
            partition,
            offset,
        }
    }

    /// Position carrying only the source-native offset descriptor
    ///
    /// Built by the envelope mapper; the connector places it with [`Self::at`].
    pub fn from_source_offset(base_offset_payload: impl Into<String>) -> Self {
        Self::new("", -1, -1, base_offset_payload)
    }

    /// Sentinel returned by probes before any event has been saved
    pub fn awaiting_first_event() -> Self {
        Self::from_source_offset("")
    }

    pub fn is_awaiting_first_event(&self) -> bool {
        self.topic.is_empty() && self.partition < 0 && self.offset < 0
    }

    /// Overwrite the broker coordinates, keeping the source offset descriptor
    pub fn at(self, topic: impl Into<String>, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.into(),
            partition,
            offset,
            ..self
        }
    }

    pub fn same_partition(&self, other: &BrokerPosition) -> bool {
        self.topic == other.topic && self.partition == other.partition
    }
}

impl PartialEq for BrokerPosition {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for BrokerPosition {}

impl PartialOrd for BrokerPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for BrokerPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        if self.same_partition(other) {
            return self.offset.cmp(&other.offset);
        }
        self.topic
            .cmp(&other.topic)
            .then(self.partition.cmp(&other.partition))
    }
}

impl fmt::Display for BrokerPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.topic, self.partition, self.offset)
    }
}

/// Opaque resume token of a native change feed
///
/// Tokens only order meaningfully within a single feed. An empty token is the
/// "start" sentinel: open the feed without resuming.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CursorPosition {
    #[serde(with = "token_base64")]
    pub resume_token: Vec<u8>,
}

impl CursorPosition {
    pub fn new(resume_token: Vec<u8>) -> Self {
        Self { resume_token }
    }

    pub fn start() -> Self {
        Self {
            resume_token: Vec::new(),
        }
    }

    pub fn is_start(&self) -> bool {
        self.resume_token.is_empty()
    }
}

mod token_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(token: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(token))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
