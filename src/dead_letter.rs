//! Dead-letter records for events that failed before becoming durable
//!
//! A record keeps the original raw event intact (`raw_payload`) alongside the
//! failure details, so the event can be inspected and replayed offline.

use crate::error::sanitize_error_message;
use crate::event::RawEvent;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Location recorded for failures raised by the ingestion pipeline
pub const DEFAULT_ERROR_LOCATION: &str = "plugin_server_ingest_event";

/// Timestamp layout understood by the events table
const DEAD_LETTER_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Errors raised while building or publishing a dead-letter record
#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("Failed to encode dead-letter record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Failed to write dead-letter record: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to publish dead-letter record: {message}")]
    Publish { message: String },
}

impl DeadLetterError {
    pub fn publish<S: Into<String>>(message: S) -> Self {
        Self::Publish {
            message: message.into(),
        }
    }
}

/// Serializable dead-letter row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub id: Uuid,
    pub event_uuid: Option<Uuid>,
    pub event: String,
    pub properties: String,
    pub set: String,
    pub set_once: String,
    pub distinct_id: String,
    pub team_id: i64,
    pub elements_chain: String,
    pub created_at: String,
    pub ip: String,
    pub site_url: String,
    pub now: String,
    pub raw_payload: String,
    pub error_timestamp: String,
    pub error_location: String,
    pub error: String,
    pub tags: Vec<String>,
    #[serde(rename = "_timestamp")]
    pub timestamp: String,
    #[serde(rename = "_offset")]
    pub offset: i64,
}

impl DeadLetterRecord {
    /// Build a record from the original event and the error that stopped it
    pub fn from_failed_event(
        event: &RawEvent,
        err: &(dyn std::error::Error + 'static),
        error_location: &str,
        failed_at: DateTime<Utc>,
    ) -> Result<Self, DeadLetterError> {
        let current_timestamp = failed_at.format(DEAD_LETTER_TIMESTAMP_FORMAT).to_string();
        let empty = serde_json::Map::new();

        Ok(Self {
            id: event.uuid.unwrap_or_else(Uuid::new_v4),
            event_uuid: event.uuid,
            event: event.event.clone(),
            properties: serde_json::to_string(&event.properties)?,
            set: serde_json::to_string(event.set.as_ref().unwrap_or(&empty))?,
            set_once: serde_json::to_string(event.set_once.as_ref().unwrap_or(&empty))?,
            distinct_id: event.distinct_id.clone(),
            team_id: event.team_id,
            elements_chain: String::new(),
            created_at: current_timestamp.clone(),
            ip: event.ip.clone().unwrap_or_default(),
            site_url: event.site_url.clone(),
            now: event.now.clone(),
            raw_payload: serde_json::to_string(event)?,
            error_timestamp: current_timestamp.clone(),
            error_location: error_location.to_string(),
            error: sanitize_error_message(&format!("Event ingestion failed. Error: {err}")),
            tags: vec!["plugin_server".to_string(), "ingest_event".to_string()],
            timestamp: current_timestamp,
            offset: 0,
        })
    }

    /// Recover the original event from the record's raw payload
    pub fn original_event(&self) -> Result<RawEvent, DeadLetterError> {
        Ok(serde_json::from_str(&self.raw_payload)?)
    }
}

/// Destination for dead-letter records
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    async fn publish(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError>;
}

/// Publisher appending one JSON document per line to a local file
#[derive(Debug)]
pub struct JsonLinesDeadLetterPublisher {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesDeadLetterPublisher {
    /// Open (or create) the dead-letter file in append mode
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DeadLetterError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeadLetterPublisher for JsonLinesDeadLetterPublisher {
    async fn publish(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use chrono::TimeZone;
    use serde_json::json;

    fn failed_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 2, 23, 2, 15, 0).unwrap()
    }

    fn raw_event() -> RawEvent {
        serde_json::from_value(json!({
            "distinct_id": "my_id",
            "ip": "127.0.0.1",
            "site_url": "http://localhost",
            "team_id": 2,
            "now": "2020-02-23T02:15:00Z",
            "event": "default event",
            "properties": {"plan": "free"},
            "$set_once": {"first_seen": "today"}
        }))
        .unwrap()
    }

    #[test]
    fn test_record_preserves_event_fields() {
        let event = raw_event();
        let error = PipelineError::plugin_failed("boom");

        let record =
            DeadLetterRecord::from_failed_event(&event, &error, DEFAULT_ERROR_LOCATION, failed_at())
                .unwrap();

        assert_eq!(record.event, "default event");
        assert_eq!(record.distinct_id, "my_id");
        assert_eq!(record.team_id, 2);
        assert_eq!(record.ip, "127.0.0.1");
        assert_eq!(record.site_url, "http://localhost");
        assert_eq!(record.now, "2020-02-23T02:15:00Z");
        assert_eq!(record.properties, r#"{"plan":"free"}"#);
        assert_eq!(record.set, "{}");
        assert_eq!(record.set_once, r#"{"first_seen":"today"}"#);
        assert_eq!(record.elements_chain, "");
        assert_eq!(record.offset, 0);
        assert_eq!(record.tags, vec!["plugin_server", "ingest_event"]);
        assert_eq!(record.original_event().unwrap(), event);
    }

    #[test]
    fn test_record_describes_error() {
        let error = PipelineError::plugin_failed("boom");

        let record =
            DeadLetterRecord::from_failed_event(&raw_event(), &error, "custom_location", failed_at())
                .unwrap();

        assert_eq!(
            record.error,
            "Event ingestion failed. Error: Plugin execution failed: boom"
        );
        assert_eq!(record.error_location, "custom_location");
        assert_eq!(record.error_timestamp, "2020-02-23 02:15:00.000000");
        assert_eq!(record.created_at, record.error_timestamp);
        assert_eq!(record.timestamp, record.error_timestamp);
    }

    #[test]
    fn test_record_sanitizes_error_text() {
        let error = PipelineError::storage("connect failed: password=hunter2");

        let record =
            DeadLetterRecord::from_failed_event(&raw_event(), &error, DEFAULT_ERROR_LOCATION, failed_at())
                .unwrap();

        assert!(!record.error.contains("hunter2"));
        assert!(record.error.contains("password=***"));
    }

    #[test]
    fn test_record_id_follows_event_uuid() {
        let mut event = raw_event();
        let uuid = Uuid::new_v4();
        event.uuid = Some(uuid);
        let error = PipelineError::internal("x");

        let record =
            DeadLetterRecord::from_failed_event(&event, &error, DEFAULT_ERROR_LOCATION, failed_at())
                .unwrap();

        assert_eq!(record.id, uuid);
        assert_eq!(record.event_uuid, Some(uuid));
    }

    #[test]
    fn test_record_serializes_underscore_fields() {
        let error = PipelineError::internal("x");
        let record =
            DeadLetterRecord::from_failed_event(&raw_event(), &error, DEFAULT_ERROR_LOCATION, failed_at())
                .unwrap();

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["_offset"], 0);
        assert_eq!(value["_timestamp"], "2020-02-23 02:15:00.000000");
        assert!(value.get("offset").is_none());
    }

    #[tokio::test]
    async fn test_json_lines_publisher_appends_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dead_letter.jsonl");
        let publisher = JsonLinesDeadLetterPublisher::open(&path).await.unwrap();
        let error = PipelineError::internal("x");
        let record =
            DeadLetterRecord::from_failed_event(&raw_event(), &error, DEFAULT_ERROR_LOCATION, failed_at())
                .unwrap();

        publisher.publish(&record).await.unwrap();
        publisher.publish(&record).await.unwrap();

        let content = tokio::fs::read_to_string(publisher.path()).await.unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: DeadLetterRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed, record);
    }
}
