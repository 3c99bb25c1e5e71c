//! Graph construction: turns episode text into entities and facts, and
//! answers fact searches scoped to one user.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::llm::{ChatMessage, LlmClient};
use crate::model::{EdgeRecord, EntityNode, EpisodeNode, MemoryHit};
use crate::store::GraphStore;

/// Arguments of an episode write.
#[derive(Debug, Clone)]
pub struct EpisodeInput {
    pub name: String,
    pub body: String,
    pub source: String,
    pub source_description: String,
    pub reference_time: DateTime<Utc>,
    pub group_id: String,
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub query: String,
    pub limit: usize,
    pub center_node_uuid: Option<String>,
    pub group_id: String,
}

/// A scored fact as produced by a [`GraphBuilder`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FactHit {
    pub uuid: String,
    pub fact: String,
    pub score: f64,
    pub created_at: DateTime<Utc>,
    pub source_node_uuid: String,
    pub target_node_uuid: String,
    pub valid_at: Option<DateTime<Utc>>,
    pub invalid_at: Option<DateTime<Utc>>,
}

pub fn fact_to_hit(hit: FactHit) -> MemoryHit {
    MemoryHit {
        metadata: json!({
            "source_node_uuid": hit.source_node_uuid,
            "target_node_uuid": hit.target_node_uuid,
            "valid_at": hit.valid_at.map(|t| t.to_rfc3339()),
            "invalid_at": hit.invalid_at.map(|t| t.to_rfc3339()),
        }),
        fact: hit.fact,
        score: hit.score,
        uuid: hit.uuid,
        created_at: hit.created_at,
    }
}

#[async_trait]
pub trait GraphBuilder: Send + Sync {
    async fn add_episode(&self, input: EpisodeInput) -> Result<EpisodeNode>;
    async fn search(&self, query: SearchQuery) -> Result<Vec<FactHit>>;
}

/// Models and limits handed to the extractor at construction time.
#[derive(Debug, Clone)]
pub struct ExtractionConfig {
    /// Entity extraction.
    pub model: String,
    /// Edge extraction; usually the fast-tier model.
    pub small_model: String,
    pub reranker_model: Option<String>,
    pub max_entities: usize,
}

const ENTITY_PROMPT: &str = "Extract the people, places, organisations, objects and concepts mentioned in the user's text. \
Reply with a JSON object {\"extracted_entities\": [{\"name\": string, \"summary\": string}]}. Use the most complete name for each entity.";

const EDGE_PROMPT: &str = "Given a text and the entities found in it, list the facts that relate two of those entities. \
Reply with a JSON object {\"edges\": [{\"source_entity_name\": string, \"target_entity_name\": string, \"relation_type\": SCREAMING_SNAKE_CASE string, \"fact\": string}]}.";

pub struct KnowledgeGraph {
    llm: LlmClient,
    store: GraphStore,
    config: ExtractionConfig,
}

impl KnowledgeGraph {
    pub fn new(llm: LlmClient, store: GraphStore, config: ExtractionConfig) -> Self { Self { llm, store, config } }

    async fn extract_entities(&self, text: &str) -> Result<Vec<(String, Option<String>)>> {
        let reply = self.llm
            .chat_json(&self.config.model, &[ChatMessage::system(ENTITY_PROMPT), ChatMessage::user(text)])
            .await
            .context("entity extraction")?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for item in reply.get("extracted_entities").and_then(|v| v.as_array()).into_iter().flatten() {
            let (name, summary) = match item {
                JsonValue::String(s) => (s.as_str(), None),
                JsonValue::Object(o) => match o.get("name").and_then(|n| n.as_str()) {
                    Some(n) => (n, o.get("summary").and_then(|s| s.as_str()).map(|s| s.to_string())),
                    None => continue,
                },
                _ => continue,
            };
            let name = name.trim();
            if name.is_empty() || !seen.insert(name.to_lowercase()) { continue; }
            out.push((name.to_string(), summary));
            if out.len() >= self.config.max_entities { break; }
        }
        Ok(out)
    }

    async fn extract_edges(&self, text: &str, names: &[String]) -> Result<Vec<ExtractedEdge>> {
        let prompt = format!("Entities: {}\n\nText:\n{}", serde_json::to_string(names)?, text);
        let reply = self.llm
            .chat_json(&self.config.small_model, &[ChatMessage::system(EDGE_PROMPT), ChatMessage::user(prompt)])
            .await
            .context("edge extraction")?;
        Ok(reply.get("edges").and_then(|v| v.as_array()).into_iter().flatten().filter_map(ExtractedEdge::from_json).collect())
    }

    /// Existing entity with the same name in scope, or a new unsaved one (flag `true`).
    fn resolve_entity(&self, group_id: &str, name: &str, summary: Option<String>, now: DateTime<Utc>) -> Result<(EntityNode, bool)> {
        if let Some(existing) = self.store.find_entity_by_name(group_id, name)? {
            return Ok((existing, false));
        }
        let entity = EntityNode {
            uuid: Uuid::new_v4().to_string(),
            name: name.to_string(),
            group_id: group_id.to_string(),
            summary,
            created_at: now,
            labels: vec!["Entity".to_string()],
            extra: Map::new(),
        };
        Ok((entity, true))
    }

    async fn rerank(&self, model: &str, query: &str, hits: Vec<FactHit>) -> Vec<FactHit> {
        let docs: Vec<String> = hits.iter().map(|h| h.fact.clone()).collect();
        match self.llm.rerank(model, query, &docs, docs.len()).await {
            Ok(scores) => {
                let mut slots: Vec<Option<FactHit>> = hits.into_iter().map(Some).collect();
                let mut out = Vec::with_capacity(slots.len());
                for s in scores {
                    if let Some(mut hit) = slots.get_mut(s.index).and_then(|h| h.take()) {
                        hit.score = s.relevance_score;
                        out.push(hit);
                    }
                }
                // anything the reranker dropped keeps its lexical place at the end
                out.extend(slots.into_iter().flatten());
                out
            }
            Err(err) => {
                warn!(%err, "rerank failed; keeping lexical order");
                hits
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ExtractedEdge {
    source: String,
    target: String,
    relation: String,
    fact: String,
}

impl ExtractedEdge {
    fn from_json(v: &JsonValue) -> Option<Self> {
        let field = |keys: &[&str]| keys.iter().find_map(|k| v.get(*k).and_then(|x| x.as_str())).map(|s| s.trim().to_string());
        let source = field(&["source_entity_name", "source", "subject"])?;
        let target = field(&["target_entity_name", "target", "object"])?;
        let relation = field(&["relation_type", "relation", "name"]).unwrap_or_else(|| "RELATES_TO".to_string());
        let fact = field(&["fact", "description"]).unwrap_or_else(|| format!("{} {} {}", source, relation.to_lowercase().replace('_', " "), target));
        Some(Self { source, target, relation, fact })
    }
}

#[async_trait]
impl GraphBuilder for KnowledgeGraph {
    async fn add_episode(&self, input: EpisodeInput) -> Result<EpisodeNode> {
        let now = Utc::now();
        // both model calls and all resolution happen before the first write
        let extracted = self.extract_entities(&input.body).await?;
        let names: Vec<String> = extracted.iter().map(|(name, _)| name.clone()).collect();
        let found_edges = if names.len() >= 2 { self.extract_edges(&input.body, &names).await? } else { Vec::new() };

        let mut by_name: HashMap<String, String> = HashMap::new();
        let mut entity_uuids = Vec::new();
        let mut new_entities = Vec::new();
        for (name, summary) in extracted {
            let (entity, is_new) = self.resolve_entity(&input.group_id, &name, summary, now)?;
            by_name.insert(name.to_lowercase(), entity.uuid.clone());
            if entity_uuids.contains(&entity.uuid) { continue; }
            entity_uuids.push(entity.uuid.clone());
            if is_new { new_entities.push(entity); }
        }

        let episode = EpisodeNode {
            uuid: Uuid::new_v4().to_string(),
            name: input.name.clone(),
            group_id: input.group_id.clone(),
            content: input.body.clone(),
            source: input.source.clone(),
            source_description: input.source_description.clone(),
            created_at: now,
            valid_at: input.reference_time,
            invalid_at: None,
            file_name: None,
            entity_uuids,
            extra: Map::new(),
        };

        let mut edges = Vec::new();
        for e in found_edges {
            let (Some(src), Some(dst)) = (by_name.get(&e.source.to_lowercase()), by_name.get(&e.target.to_lowercase())) else {
                debug!(source = %e.source, target = %e.target, "edge endpoint not among extracted entities");
                continue;
            };
            if src == dst { continue; }
            edges.push(EdgeRecord {
                uuid: Uuid::new_v4().to_string(),
                group_id: input.group_id.clone(),
                relation: e.relation,
                source_uuid: src.clone(),
                target_uuid: dst.clone(),
                fact: e.fact,
                episodes: vec![episode.uuid.clone()],
                created_at: now,
                expired_at: None,
                valid_at: Some(input.reference_time),
                invalid_at: None,
                extra: Map::new(),
            });
        }

        for entity in &new_entities {
            self.store.create_entity_if_absent(entity)?;
        }
        self.store.create_episode_if_absent(&episode)?;
        for edge in &edges {
            self.store.create_edge_if_absent(edge)?;
        }
        info!(episode = %episode.name, entities = episode.entity_uuids.len(), new_entities = new_entities.len(), edges = edges.len(), "episode added to graph");
        Ok(episode)
    }

    async fn search(&self, q: SearchQuery) -> Result<Vec<FactHit>> {
        let episodes = self.store.episodes_for_user(&q.group_id)?;
        let entities: HashSet<String> = episodes.iter().flat_map(|e| e.entity_uuids.iter().cloned()).collect();
        let terms = tokenize(&q.query);
        let mut hits: Vec<FactHit> = Vec::new();
        for edge in self.store.edges_among(&entities)? {
            let mut score = lexical_score(&terms, &edge.fact);
            if let Some(center) = q.center_node_uuid.as_deref() {
                if edge.source_uuid == center || edge.target_uuid == center { score += CENTER_BOOST; }
            }
            if score <= 0.0 { continue; }
            hits.push(FactHit {
                uuid: edge.uuid,
                fact: edge.fact,
                score,
                created_at: edge.created_at,
                source_node_uuid: edge.source_uuid,
                target_node_uuid: edge.target_uuid,
                valid_at: edge.valid_at,
                invalid_at: edge.invalid_at,
            });
        }
        hits.sort_by(|a, b| b.score.total_cmp(&a.score).then(b.created_at.cmp(&a.created_at)));
        hits.truncate(q.limit.saturating_mul(3).max(q.limit));
        if let Some(model) = self.config.reranker_model.as_deref() {
            if hits.len() > 1 { hits = self.rerank(model, &q.query, hits).await; }
        }
        hits.truncate(q.limit);
        debug!(user_id = %q.group_id, query = %q.query, hits = hits.len(), "fact search");
        Ok(hits)
    }
}

const CENTER_BOOST: f64 = 0.5;

fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}

/// Share of query terms present in the fact.
fn lexical_score(terms: &HashSet<String>, fact: &str) -> f64 {
    if terms.is_empty() { return 0.0; }
    let fact_terms = tokenize(fact);
    terms.intersection(&fact_terms).count() as f64 / terms.len() as f64
}

/// Entities and facts of one user in Cytoscape element form.
pub fn user_graph(store: &GraphStore, user_id: &str) -> Result<JsonValue> {
    let episodes = store.episodes_for_user(user_id)?;
    let entities = store.entities_for_episodes(&episodes)?;
    let ids: HashSet<String> = entities.iter().map(|e| e.uuid.clone()).collect();
    let nodes: Vec<JsonValue> = entities.iter().map(|e| json!({ "data": {
        "id": e.uuid,
        "label": e.name,
        "summary": e.summary.as_deref().map(|s| s.chars().take(200).collect::<String>()).unwrap_or_default(),
        "created_at": e.created_at.to_rfc3339(),
    }})).collect();
    let edges: Vec<JsonValue> = store.edges_among(&ids)?.iter().map(|e| json!({ "data": {
        "id": e.uuid,
        "source": e.source_uuid,
        "target": e.target_uuid,
        "label": e.fact.chars().take(100).collect::<String>(),
    }})).collect();
    Ok(json!({ "nodes": nodes, "edges": edges }))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;

    /// Records episodes verbatim without calling any model; search returns canned facts.
    pub struct FakeBuilder {
        pub store: GraphStore,
        pub fail: AtomicBool,
        /// `add_episode` calls, failed ones included.
        pub attempts: AtomicUsize,
        pub facts: Vec<String>,
    }

    impl FakeBuilder {
        pub fn new(store: GraphStore, facts: &[&str]) -> Self {
            Self { store, fail: AtomicBool::new(false), attempts: AtomicUsize::new(0), facts: facts.iter().map(|s| s.to_string()).collect() }
        }
    }

    #[async_trait]
    impl GraphBuilder for FakeBuilder {
        async fn add_episode(&self, input: EpisodeInput) -> Result<EpisodeNode> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) { anyhow::bail!("model server unavailable"); }
            let ep = EpisodeNode {
                uuid: Uuid::new_v4().to_string(),
                name: input.name,
                group_id: input.group_id,
                content: input.body,
                source: input.source,
                source_description: input.source_description,
                created_at: Utc::now(),
                valid_at: input.reference_time,
                invalid_at: None,
                file_name: None,
                entity_uuids: vec![],
                extra: Map::new(),
            };
            self.store.create_episode_if_absent(&ep)?;
            Ok(ep)
        }

        async fn search(&self, q: SearchQuery) -> Result<Vec<FactHit>> {
            Ok(self.facts.iter().take(q.limit).enumerate().map(|(i, f)| FactHit {
                uuid: format!("f{}", i), fact: f.clone(), score: 1.0 - i as f64 * 0.1, created_at: Utc::now(),
                source_node_uuid: "a".into(), target_node_uuid: "b".into(), valid_at: None, invalid_at: None,
            }).collect())
        }
    }
}
