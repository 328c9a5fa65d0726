//! Event and identity types flowing through the ingestion pipeline
//!
//! [`RawEvent`] is the event exactly as received from the queue. Early steps
//! derive a [`NormalizedEvent`] from it; later steps attach the resolved
//! [`Person`]. None of these are mutated in place by the runner.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Open-ended property bag carried by events
pub type Properties = Map<String, Value>;

/// Event as delivered by the queue consumer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub distinct_id: String,
    pub team_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<Uuid>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub site_url: String,
    /// Server receive time, as sent by capture
    pub now: String,
    /// Client-supplied timestamp, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<String>,
    pub event: String,
    #[serde(default)]
    pub properties: Properties,
    #[serde(rename = "$set", default, skip_serializing_if = "Option::is_none")]
    pub set: Option<Properties>,
    #[serde(rename = "$set_once", default, skip_serializing_if = "Option::is_none")]
    pub set_once: Option<Properties>,
}

impl RawEvent {
    /// Minimal event with empty properties, mostly useful for tests and tooling
    pub fn new<D, E>(distinct_id: D, team_id: i64, event: E, now: DateTime<Utc>) -> Self
    where
        D: Into<String>,
        E: Into<String>,
    {
        Self {
            distinct_id: distinct_id.into(),
            team_id,
            uuid: None,
            ip: None,
            site_url: String::new(),
            now: now.to_rfc3339(),
            timestamp: None,
            sent_at: None,
            event: event.into(),
            properties: Properties::new(),
            set: None,
            set_once: None,
        }
    }
}

/// Event after preparation: uuid, team and timestamp are resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub event_uuid: Uuid,
    pub distinct_id: String,
    pub team_id: i64,
    pub ip: Option<String>,
    pub site_url: String,
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub properties: Properties,
    /// Parsed element chain, only populated for `$autocapture` style events
    #[serde(default)]
    pub elements_list: Vec<Element>,
}

/// One DOM element in an autocapture element chain
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Element {
    #[serde(default)]
    pub tag_name: Option<String>,
    #[serde(default, rename = "$el_text")]
    pub text: Option<String>,
    #[serde(default, rename = "attr__href")]
    pub href: Option<String>,
    #[serde(default, rename = "attr__id")]
    pub attr_id: Option<String>,
    #[serde(default)]
    pub attr_class: Vec<String>,
    #[serde(default)]
    pub nth_child: Option<u32>,
    #[serde(default)]
    pub nth_of_type: Option<u32>,
    #[serde(default)]
    pub order: Option<u32>,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
}

/// Person record owned by the identity store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Person {
    pub id: i64,
    pub uuid: Uuid,
    pub team_id: i64,
    #[serde(default)]
    pub properties: Properties,
    pub is_identified: bool,
    pub created_at: DateTime<Utc>,
}
