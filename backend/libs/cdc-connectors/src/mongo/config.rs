use std::str::FromStr;
use std::time::Duration;

use mongodb::options::{FullDocumentBeforeChangeType, FullDocumentType};
use serde::{Deserialize, Serialize};

use crate::error::{CdcError, Result};
use crate::kafka::config::{env_u64, split_list};

/// Post-image handling for update events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FullDocumentMode {
    /// Server default: updates carry no post-image
    #[default]
    Default,
    UpdateLookup,
    WhenAvailable,
    Required,
}

impl FullDocumentMode {
    pub fn to_driver(self) -> Option<FullDocumentType> {
        match self {
            FullDocumentMode::Default => None,
            FullDocumentMode::UpdateLookup => Some(FullDocumentType::UpdateLookup),
            FullDocumentMode::WhenAvailable => Some(FullDocumentType::WhenAvailable),
            FullDocumentMode::Required => Some(FullDocumentType::Required),
        }
    }
}

impl FromStr for FullDocumentMode {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "default" => Ok(FullDocumentMode::Default),
            "updatelookup" => Ok(FullDocumentMode::UpdateLookup),
            "whenavailable" => Ok(FullDocumentMode::WhenAvailable),
            "required" => Ok(FullDocumentMode::Required),
            _ => Err(CdcError::Configuration(format!(
                "unknown full document mode '{}', expected default, updateLookup, \
                 whenAvailable or required",
                s
            ))),
        }
    }
}

/// Pre-image handling (`fullDocumentBeforeChange`)
///
/// Pre-images require `changeStreamPreAndPostImages` on the collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PreImageMode {
    #[default]
    Off,
    WhenAvailable,
    Required,
}

impl PreImageMode {
    pub fn to_driver(self) -> Option<FullDocumentBeforeChangeType> {
        match self {
            PreImageMode::Off => None,
            PreImageMode::WhenAvailable => Some(FullDocumentBeforeChangeType::WhenAvailable),
            PreImageMode::Required => Some(FullDocumentBeforeChangeType::Required),
        }
    }
}

impl FromStr for PreImageMode {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "off" => Ok(PreImageMode::Off),
            "whenavailable" => Ok(PreImageMode::WhenAvailable),
            "required" => Ok(PreImageMode::Required),
            _ => Err(CdcError::Configuration(format!(
                "unknown pre-image mode '{}', expected off, whenAvailable or required",
                s
            ))),
        }
    }
}

/// What the change stream is opened on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchScope {
    /// Whole database, optionally narrowed by the collection allow-list
    #[default]
    Database,
    /// A single collection, the only allow-list entry
    Collection,
}

impl FromStr for WatchScope {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match normalize(s).as_str() {
            "database" | "db" => Ok(WatchScope::Database),
            "collection" => Ok(WatchScope::Collection),
            _ => Err(CdcError::Configuration(format!(
                "unknown watch scope '{}', expected 'database' or 'collection'",
                s
            ))),
        }
    }
}

fn normalize(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .collect::<String>()
        .to_ascii_lowercase()
}

/// MongoDB change stream connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoConnectorConfig {
    /// Connection string (e.g., "mongodb://localhost:27017/?replicaSet=rs0")
    #[serde(skip_serializing)]
    pub uri: String,
    pub database: String,
    /// Collection allow-list; empty means every collection in `database`
    #[serde(default)]
    pub collections: Vec<String>,
    #[serde(default)]
    pub full_document: FullDocumentMode,
    #[serde(default)]
    pub full_document_before_change: PreImageMode,
    #[serde(default)]
    pub watch_scope: WatchScope,
    /// Bound for server selection and health pings
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl Default for MongoConnectorConfig {
    fn default() -> Self {
        Self {
            uri: "mongodb://localhost:27017".to_string(),
            database: String::new(),
            collections: Vec::new(),
            full_document: FullDocumentMode::Default,
            full_document_before_change: PreImageMode::Off,
            watch_scope: WatchScope::Database,
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl MongoConnectorConfig {
    /// Load configuration from `CDC_MONGO_*` environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            uri: std::env::var("CDC_MONGO_URI").unwrap_or(defaults.uri),
            database: std::env::var("CDC_MONGO_DATABASE").unwrap_or(defaults.database),
            collections: std::env::var("CDC_MONGO_COLLECTIONS")
                .map(|s| split_list(&s))
                .unwrap_or_default(),
            full_document: match std::env::var("CDC_MONGO_FULL_DOCUMENT") {
                Ok(s) => s.parse()?,
                Err(_) => defaults.full_document,
            },
            full_document_before_change: match std::env::var(
                "CDC_MONGO_FULL_DOCUMENT_BEFORE_CHANGE",
            ) {
                Ok(s) => s.parse()?,
                Err(_) => defaults.full_document_before_change,
            },
            watch_scope: match std::env::var("CDC_MONGO_WATCH_SCOPE") {
                Ok(s) => s.parse()?,
                Err(_) => defaults.watch_scope,
            },
            connect_timeout_ms: env_u64("CDC_MONGO_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout_ms),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.uri.trim().is_empty() {
            return Err(CdcError::Configuration(
                "MongoDB connection string must not be empty".to_string(),
            ));
        }
        if self.database.trim().is_empty() {
            return Err(CdcError::Configuration(
                "MongoDB database name is required".to_string(),
            ));
        }
        if self.watch_scope == WatchScope::Collection && self.collections().len() != 1 {
            return Err(CdcError::Configuration(format!(
                "collection watch scope needs exactly one collection, got {}",
                self.collections().len()
            )));
        }
        Ok(())
    }

    /// Allow-list with blank entries removed
    pub fn collections(&self) -> Vec<&str> {
        self.collections
            .iter()
            .map(|c| c.trim())
            .filter(|c| !c.is_empty())
            .collect()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}
