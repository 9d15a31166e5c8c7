//! Change stream event to [`ChangeEvent`] mapping

use chrono::{DateTime, Utc};
use mongodb::bson::{self, doc, Bson, Document};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType, ResumeToken};
use mongodb::options::ChangeStreamOptions;
use serde_json::Value;
use tracing::debug;

use super::config::{MongoConnectorConfig, WatchScope};
use crate::error::{CdcError, Result};
use crate::event::{ChangeEvent, ChangeMetadata, ChangeOperation};
use crate::position::{CdcPosition, CursorPosition};

/// Aggregation pipeline for the configured scope
///
/// Database scope with a non-empty allow-list filters on `ns.coll`.
pub fn build_pipeline(config: &MongoConnectorConfig) -> Vec<Document> {
    let collections = config.collections();
    match config.watch_scope {
        WatchScope::Database if !collections.is_empty() => {
            vec![doc! { "$match": { "ns.coll": { "$in": collections } } }]
        }
        _ => Vec::new(),
    }
}

/// Driver options, resuming after `resume` when it carries a token
pub fn build_options(
    config: &MongoConnectorConfig,
    resume: Option<&CursorPosition>,
) -> Result<ChangeStreamOptions> {
    let mut options = ChangeStreamOptions::default();
    options.full_document = config.full_document.to_driver();
    options.full_document_before_change = config.full_document_before_change.to_driver();

    if let Some(position) = resume.filter(|p| !p.is_start()) {
        options.resume_after = Some(decode_resume_token(&position.resume_token)?);
    }
    Ok(options)
}

pub fn encode_resume_token(token: &ResumeToken) -> Result<Vec<u8>> {
    bson::to_vec(token)
        .map_err(|e| CdcError::InvalidPosition(format!("Failed to encode resume token: {}", e)))
}

pub fn decode_resume_token(bytes: &[u8]) -> Result<ResumeToken> {
    bson::from_slice(bytes)
        .map_err(|e| CdcError::InvalidPosition(format!("Failed to decode resume token: {}", e)))
}

/// Map one driver event
///
/// Returns `Ok(None)` for operations without a row image (drop, rename,
/// invalidate and the like).
pub fn map_change(event: ChangeStreamEvent<Document>) -> Result<Option<ChangeEvent>> {
    let operation = match &event.operation_type {
        OperationType::Insert => ChangeOperation::Insert,
        OperationType::Update | OperationType::Replace => ChangeOperation::Update,
        OperationType::Delete => ChangeOperation::Delete,
        other => {
            debug!(operation = ?other, "Skipping change stream event without row image");
            return Ok(None);
        }
    };

    let position = CursorPosition::new(encode_resume_token(&event.id)?);

    let (database, entity) = match &event.ns {
        Some(ns) => (Some(ns.db.clone()), ns.coll.clone().unwrap_or_default()),
        None => (None, String::new()),
    };

    let captured_at = captured_at(&event);
    let after = event.full_document.map(to_json);
    let before = match operation {
        ChangeOperation::Delete => event
            .full_document_before_change
            .or(event.document_key)
            .map(to_json),
        _ => event.full_document_before_change.map(to_json),
    };

    // the driver's typed event does not surface txnNumber or lsid
    let mut metadata = ChangeMetadata::new(CdcPosition::Cursor(position), captured_at);
    metadata.source_database = database;

    Ok(Some(ChangeEvent::new(
        entity, operation, before, after, metadata,
    )))
}

fn captured_at(event: &ChangeStreamEvent<Document>) -> DateTime<Utc> {
    event
        .wall_time
        .and_then(|t| DateTime::from_timestamp_millis(t.timestamp_millis()))
        .or_else(|| {
            event
                .cluster_time
                .and_then(|ts| DateTime::from_timestamp(i64::from(ts.time), 0))
        })
        .unwrap_or_else(Utc::now)
}

fn to_json(document: Document) -> Value {
    Bson::Document(document).into_relaxed_extjson()
}
