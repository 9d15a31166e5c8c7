//! MongoDB change streams
//!
//! - **Config**: scope, collection allow-list, pre/post-image modes
//! - **Client**: the [`ChangeFeedClient`] seam and its driver implementation
//! - **Mapping**: pipeline/options construction and event mapping
//! - **Connector**: [`MongoCdcConnector`], the streaming state machine
pub mod client;
pub mod config;
pub mod connector;
pub mod mapping;

pub use client::{ChangeFeed, ChangeFeedClient, MongoChangeFeedClient, WatchRequest};
pub use config::{FullDocumentMode, MongoConnectorConfig, PreImageMode, WatchScope};
pub use connector::{MongoCdcConnector, NativeState};
