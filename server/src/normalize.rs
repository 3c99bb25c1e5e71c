//! Repairs model-server responses so the content they carry is the strict JSON
//! the graph builder parses.
//!
//! Self-hosted models wrap JSON in Markdown fences, prepend prose, stop
//! mid-object, or answer with a bare list or a differently named key. The
//! functions here are pure: bytes in, bytes out, and any failure leaves the
//! response untouched.

use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;

/// Suffixes tried, in order, to close a truncated object or array.
pub const REPAIR_SUFFIXES: &[&str] = &[
    "}", "]}", "}]}", "\"}", "\"]}", "\"}]}", "]", "}]", "\"]", "\"}]", "]}]}", "}]}]}",
];

/// Renaming table for one revision of the extraction schema.
#[derive(Debug)]
pub struct NormalizationRules {
    pub entities_key: &'static str,
    pub edges_key: &'static str,
    pub summary_key: &'static str,
    /// Top-level `(from, to)` key renames, applied in order.
    pub top_level_renames: &'static [(&'static str, &'static str)],
    pub entity_name_key: &'static str,
    pub entity_name_aliases: &'static [&'static str],
    /// Field whose presence on the first entity marks entity-resolution output.
    pub resolution_marker: &'static str,
    pub resolutions_key: &'static str,
    /// Fields that mark a list element as a relationship record.
    pub edge_markers: &'static [&'static str],
}

static V1_RULES: NormalizationRules = NormalizationRules {
    entities_key: "extracted_entities",
    edges_key: "edges",
    summary_key: "summary",
    top_level_renames: &[("entities", "extracted_entities"), ("facts", "edges"), ("extracted_edges", "edges")],
    entity_name_key: "name",
    entity_name_aliases: &["entity_name", "entity"],
    resolution_marker: "duplicates",
    resolutions_key: "entity_resolutions",
    edge_markers: &[
        "relation_type",
        "source_entity_id",
        "target_entity_id",
        "source_id",
        "target_id",
        "source_node_uuid",
        "target_node_uuid",
    ],
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SchemaVersion {
    #[default]
    V1,
}

impl SchemaVersion {
    pub fn rules(self) -> &'static NormalizationRules {
        match self {
            SchemaVersion::V1 => &V1_RULES,
        }
    }
}

impl FromStr for SchemaVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "v1" | "1" => Ok(SchemaVersion::V1),
            other => Err(format!("unknown normalizer schema '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Normalizer {
    rules: &'static NormalizationRules,
}

impl Default for Normalizer {
    fn default() -> Self { Self::new(SchemaVersion::default()) }
}

impl Normalizer {
    pub fn new(schema: SchemaVersion) -> Self { Self { rules: schema.rules() } }

    /// Returns a rewritten body when the embedded content had to change,
    /// `None` when the response should be passed through as-is.
    pub fn normalize_body(&self, body: &[u8]) -> Option<Vec<u8>> {
        let mut doc: JsonValue = serde_json::from_slice(body).ok()?;
        let pointer = content_pointer(&doc)?;
        let raw = doc.pointer(&pointer)?.as_str()?.to_owned();
        if raw.trim().is_empty() {
            return None;
        }
        let cleaned = self.normalize_content(&raw);
        if cleaned == raw {
            return None;
        }
        debug!(raw = %raw, cleaned = %cleaned, "rewrote model response content");
        *doc.pointer_mut(&pointer)? = JsonValue::String(cleaned);
        serde_json::to_vec(&doc).ok()
    }

    /// Cleans one content string. Returns the input unchanged when nothing applies.
    pub fn normalize_content(&self, raw: &str) -> String {
        let content = clip_json(&strip_fences(raw)).to_string();
        match serde_json::from_str::<JsonValue>(&content) {
            Ok(value) => self.reshape_or_keep(value, content),
            Err(_) if looks_like_json(&content) => match repair(&content) {
                Some((repaired, value)) => self.reshape_or_keep(value, repaired),
                None => content,
            },
            Err(_) => self.summary_object(JsonValue::String(content)).to_string(),
        }
    }

    fn reshape_or_keep(&self, value: JsonValue, text: String) -> String {
        let (value, changed) = self.reshape(value);
        if !changed {
            return text;
        }
        serde_json::to_string(&value).unwrap_or(text)
    }

    /// Coerces a parsed document into the extraction schema. The flag reports
    /// whether anything moved.
    pub fn reshape(&self, value: JsonValue) -> (JsonValue, bool) {
        let r = self.rules;
        match value {
            JsonValue::String(_) => (self.summary_object(value), true),
            JsonValue::Array(items) => {
                let is_edges = items
                    .first()
                    .and_then(|first| first.as_object())
                    .map(|obj| r.edge_markers.iter().any(|k| obj.contains_key(*k)))
                    .unwrap_or(false);
                let mut out = Map::new();
                if is_edges {
                    out.insert(r.edges_key.to_string(), JsonValue::Array(items));
                    out.insert(r.entities_key.to_string(), JsonValue::Array(Vec::new()));
                } else {
                    out.insert(r.entities_key.to_string(), JsonValue::Array(items));
                    out.insert(r.edges_key.to_string(), JsonValue::Array(Vec::new()));
                }
                (JsonValue::Object(out), true)
            }
            JsonValue::Object(mut map) => {
                let changed = self.rename_fields(&mut map);
                (JsonValue::Object(map), changed)
            }
            other => (other, false),
        }
    }

    // Later rules see keys renamed by earlier ones.
    fn rename_fields(&self, map: &mut Map<String, JsonValue>) -> bool {
        let r = self.rules;
        let mut changed = false;
        for (from, to) in r.top_level_renames {
            changed |= rename_key(map, from, to);
        }
        if let Some(JsonValue::Array(entities)) = map.get_mut(r.entities_key) {
            for entity in entities.iter_mut() {
                if let JsonValue::Object(obj) = entity {
                    for alias in r.entity_name_aliases {
                        if rename_key(obj, alias, r.entity_name_key) {
                            changed = true;
                            break;
                        }
                    }
                }
            }
        }
        let is_resolution = map
            .get(r.entities_key)
            .and_then(|v| v.as_array())
            .and_then(|arr| arr.first())
            .and_then(|first| first.as_object())
            .map(|obj| obj.contains_key(r.resolution_marker))
            .unwrap_or(false);
        if is_resolution {
            changed |= rename_key(map, r.entities_key, r.resolutions_key);
        }
        changed
    }

    fn summary_object(&self, text: JsonValue) -> JsonValue {
        let r = self.rules;
        let mut out = Map::new();
        out.insert(r.summary_key.to_string(), text);
        out.insert(r.entities_key.to_string(), JsonValue::Array(Vec::new()));
        out.insert(r.edges_key.to_string(), JsonValue::Array(Vec::new()));
        JsonValue::Object(out)
    }
}

fn rename_key(map: &mut Map<String, JsonValue>, from: &str, to: &str) -> bool {
    if from == to || map.contains_key(to) {
        return false;
    }
    match map.remove(from) {
        Some(v) => {
            map.insert(to.to_string(), v);
            true
        }
        None => false,
    }
}

/// JSON pointer to the textual content of a chat-completion or `output[]` response.
pub fn content_pointer(doc: &JsonValue) -> Option<String> {
    const CHAT: &str = "/choices/0/message/content";
    if doc.pointer(CHAT).map(|v| v.is_string()).unwrap_or(false) {
        return Some(CHAT.to_string());
    }
    let output = doc.get("output")?.as_array()?;
    if output.is_empty() {
        return None;
    }
    let idx = output
        .iter()
        .position(|entry| entry.get("type").and_then(|t| t.as_str()) != Some("reasoning"))
        .unwrap_or(0);
    let entry = &output[idx];
    match entry.get("content") {
        Some(JsonValue::String(_)) => return Some(format!("/output/{}/content", idx)),
        Some(JsonValue::Array(parts)) => {
            if let Some(j) = parts.iter().position(|p| p.get("text").map(|t| t.is_string()).unwrap_or(false)) {
                return Some(format!("/output/{}/content/{}/text", idx, j));
            }
        }
        _ => {}
    }
    if entry.get("text").map(|t| t.is_string()).unwrap_or(false) {
        return Some(format!("/output/{}/text", idx));
    }
    None
}

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?:\w+)?\s*(.*?)```").expect("valid fence regex"))
}

/// Keeps only the text inside a Markdown code fence.
pub fn strip_fences(content: &str) -> String {
    if !content.contains("```") {
        return content.to_string();
    }
    match fence_regex().captures(content).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str().trim().to_string(),
        None => content.replace("```json", "").replace("```", "").trim().to_string(),
    }
}

/// Cuts surrounding prose off a JSON object or array. Objects win ties.
pub fn clip_json(content: &str) -> &str {
    let brace = content.find('{');
    let bracket = content.find('[');
    let (start, close) = match (brace, bracket) {
        (Some(b), Some(k)) if b <= k => (b, '}'),
        (Some(b), None) => (b, '}'),
        (_, Some(k)) => (k, ']'),
        (None, None) => return content,
    };
    match content.rfind(close) {
        Some(end) if end > start => &content[start..=end],
        // unterminated: drop the leading prose so repair can close it
        _ => &content[start..],
    }
}

fn looks_like_json(content: &str) -> bool {
    let t = content.trim_start();
    t.starts_with('{') || t.starts_with('[')
}

/// Appends closing suffixes until the text parses; the first success wins.
pub fn repair(content: &str) -> Option<(String, JsonValue)> {
    let base = content.trim_end().trim_end_matches(',').trim_end();
    REPAIR_SUFFIXES.iter().find_map(|suffix| {
        let candidate = format!("{}{}", base, suffix);
        serde_json::from_str::<JsonValue>(&candidate).ok().map(|v| (candidate, v))
    })
}
