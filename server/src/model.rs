//! Records persisted in the graph store and exchanged over the HTTP surface.
//!
//! Unknown properties are kept in `extra` so that archives produced by other
//! tools survive an import/export cycle unchanged.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

/// Name prefix that scopes an episode to its owner: `{user_id}_{timestamp}`.
pub fn user_prefix(user_id: &str) -> String { format!("{}_", user_id) }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpisodeNode {
    pub uuid: String,
    pub name: String,
    pub group_id: String,
    pub content: String,
    #[serde(default = "default_source")]
    pub source: String,
    #[serde(default)]
    pub source_description: String,
    pub created_at: DateTime<Utc>,
    pub valid_at: DateTime<Utc>,
    #[serde(default)]
    pub invalid_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Entities this episode mentions.
    #[serde(default)]
    pub entity_uuids: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

fn default_source() -> String { "text".to_string() }

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntityNode {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(default)]
    pub summary: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// A fact: directed relationship between two entities.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EdgeRecord {
    pub uuid: String,
    #[serde(default)]
    pub group_id: String,
    #[serde(rename = "type", default = "default_relation")]
    pub relation: String,
    pub source_uuid: String,
    pub target_uuid: String,
    #[serde(default)]
    pub fact: String,
    #[serde(default)]
    pub episodes: Vec<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub expired_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub valid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invalid_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

fn default_relation() -> String { "RELATES_TO".to_string() }

/// Placeholder written on ingest, removed once the episode is processed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PendingEpisode {
    pub uuid: String,
    pub user_id: String,
    pub content: String,
    pub source: String,
    pub role: String,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EpisodeStatus { Pending, Processed }

/// Episode as listed to clients, pending or processed.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EpisodeSummary {
    pub uuid: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub source: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub status: EpisodeStatus,
}

impl From<&EpisodeNode> for EpisodeSummary {
    fn from(ep: &EpisodeNode) -> Self {
        Self { uuid: ep.uuid.clone(), content: ep.content.clone(), created_at: ep.created_at, source: ep.source_description.clone(), file_name: ep.file_name.clone(), status: EpisodeStatus::Processed }
    }
}

impl From<&PendingEpisode> for EpisodeSummary {
    fn from(p: &PendingEpisode) -> Self {
        Self { uuid: p.uuid.clone(), content: p.content.clone(), created_at: p.created_at, source: p.source.clone(), file_name: p.file_name.clone(), status: EpisodeStatus::Pending }
    }
}

/// One search result returned from `/memory/query`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryHit {
    pub fact: String,
    pub score: f64,
    pub uuid: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct UserStats {
    pub user_id: String,
    pub episodes_count: u64,
    pub last_updated: Option<DateTime<Utc>>,
}
