use std::str::FromStr;
use std::time::Duration;

use rdkafka::config::ClientConfig;
use serde::{Deserialize, Serialize};

use crate::envelope::EnvelopeFormat;
use crate::error::{CdcError, Result};

/// Where to start on partitions without a committed group offset
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl FromStr for OffsetReset {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            other => Err(CdcError::Configuration(format!(
                "unknown offset reset policy '{}', expected 'earliest' or 'latest'",
                other
            ))),
        }
    }
}

/// Transport security and authentication
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KafkaSecurityConfig {
    /// `plaintext`, `ssl`, `sasl_plaintext` or `sasl_ssl`
    pub protocol: Option<String>,
    /// `PLAIN`, `SCRAM-SHA-256`, `SCRAM-SHA-512`
    pub sasl_mechanism: Option<String>,
    pub sasl_username: Option<String>,
    #[serde(skip_serializing)]
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
}

impl KafkaSecurityConfig {
    fn uses_sasl(&self) -> bool {
        self.protocol
            .as_deref()
            .map(|p| p.to_ascii_lowercase().starts_with("sasl"))
            .unwrap_or(false)
    }
}

/// Kafka connector configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConnectorConfig {
    /// Kafka brokers (comma-separated)
    pub brokers: String,
    pub group_id: String,
    pub client_id: Option<String>,
    /// Topics carrying Debezium envelopes (e.g., ["cdc.public.orders"])
    pub topics: Vec<String>,
    pub offset_reset: OffsetReset,
    pub envelope_format: EnvelopeFormat,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,
    /// Upper bound for a single poll; shutdown is checked between polls
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Bound for metadata fetches (stream start and health probes)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub security: KafkaSecurityConfig,
}

fn default_session_timeout_ms() -> u64 {
    30_000
}

fn default_poll_timeout_ms() -> u64 {
    1_000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

impl Default for KafkaConnectorConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            group_id: "nova-cdc-connector-v1".to_string(),
            client_id: None,
            topics: Vec::new(),
            offset_reset: OffsetReset::Earliest,
            envelope_format: EnvelopeFormat::Flat,
            session_timeout_ms: default_session_timeout_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            security: KafkaSecurityConfig::default(),
        }
    }
}

impl KafkaConnectorConfig {
    /// Load configuration from `CDC_KAFKA_*` environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            brokers: std::env::var("CDC_KAFKA_BROKERS").unwrap_or(defaults.brokers),
            group_id: std::env::var("CDC_KAFKA_GROUP_ID").unwrap_or(defaults.group_id),
            client_id: std::env::var("CDC_KAFKA_CLIENT_ID").ok(),
            topics: std::env::var("CDC_KAFKA_TOPICS")
                .map(|s| split_list(&s))
                .unwrap_or_default(),
            offset_reset: match std::env::var("CDC_KAFKA_OFFSET_RESET") {
                Ok(s) => s.parse()?,
                Err(_) => defaults.offset_reset,
            },
            envelope_format: match std::env::var("CDC_ENVELOPE_FORMAT") {
                Ok(s) => s.parse()?,
                Err(_) => defaults.envelope_format,
            },
            session_timeout_ms: env_u64("CDC_KAFKA_SESSION_TIMEOUT_MS")
                .unwrap_or(defaults.session_timeout_ms),
            poll_timeout_ms: env_u64("CDC_KAFKA_POLL_TIMEOUT_MS")
                .unwrap_or(defaults.poll_timeout_ms),
            connect_timeout_ms: env_u64("CDC_KAFKA_CONNECT_TIMEOUT_MS")
                .unwrap_or(defaults.connect_timeout_ms),
            security: KafkaSecurityConfig {
                protocol: std::env::var("CDC_KAFKA_SECURITY_PROTOCOL").ok(),
                sasl_mechanism: std::env::var("CDC_KAFKA_SASL_MECHANISM").ok(),
                sasl_username: std::env::var("CDC_KAFKA_SASL_USERNAME").ok(),
                sasl_password: std::env::var("CDC_KAFKA_SASL_PASSWORD").ok(),
                ssl_ca_location: std::env::var("CDC_KAFKA_SSL_CA_LOCATION").ok(),
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.topics.iter().all(|t| t.trim().is_empty()) {
            return Err(CdcError::Configuration(
                "at least one Kafka topic is required".to_string(),
            ));
        }
        if self.brokers.trim().is_empty() {
            return Err(CdcError::Configuration(
                "Kafka bootstrap servers must not be empty".to_string(),
            ));
        }
        if self.security.uses_sasl()
            && (self.security.sasl_username.is_none() || self.security.sasl_password.is_none())
        {
            return Err(CdcError::Configuration(
                "SASL security protocol requires a username and password".to_string(),
            ));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// rdkafka client settings
    ///
    /// Offsets are never committed to the group: resumption is driven by the
    /// externally stored position only.
    pub fn client_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", self.offset_reset.as_str())
            .set("session.timeout.ms", self.session_timeout_ms.to_string())
            .set("enable.partition.eof", "false");

        if let Some(client_id) = &self.client_id {
            config.set("client.id", client_id);
        }
        if let Some(protocol) = &self.security.protocol {
            config.set("security.protocol", protocol);
        }
        if let Some(mechanism) = &self.security.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }
        if let Some(username) = &self.security.sasl_username {
            config.set("sasl.username", username);
        }
        if let Some(password) = &self.security.sasl_password {
            config.set("sasl.password", password);
        }
        if let Some(ca) = &self.security.ssl_ca_location {
            config.set("ssl.ca.location", ca);
        }

        config
    }
}

pub(crate) fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

pub(crate) fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}
