//! Episode lifecycle: pending placeholder on ingest, deferred graph
//! extraction, periodic retry of placeholders that never got processed.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::graph::{fact_to_hit, EpisodeInput, GraphBuilder, SearchQuery};
use crate::model::{user_prefix, EpisodeNode, EpisodeSummary, MemoryHit, PendingEpisode};
use crate::store::GraphStore;
use crate::worker::{JobHandle, JobQueue};

#[derive(Debug, Clone, Deserialize)]
pub struct IngestRequest {
    pub user_id: String,
    pub text: String,
    #[serde(default = "default_role")]
    pub role: String,
    #[serde(default)]
    pub metadata: Map<String, JsonValue>,
}

fn default_role() -> String { "user".to_string() }

#[derive(Debug, Clone, Serialize)]
pub struct IngestAck {
    pub ok: bool,
    pub id: String,
    pub created_ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct SweepSettings {
    pub interval: Duration,
    pub initial_delay: Duration,
    /// Placeholders older than this are considered stuck.
    pub stale_after: Duration,
}

impl Default for SweepSettings {
    fn default() -> Self {
        Self { interval: Duration::from_secs(30 * 60), initial_delay: Duration::from_secs(60), stale_after: Duration::from_secs(30 * 60) }
    }
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ReprocessReport {
    pub user_id: String,
    pub total_episodes: usize,
    pub processed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReprocessAllReport {
    pub total_users: usize,
    pub total_episodes: usize,
    pub processed: usize,
    pub errors: usize,
    pub users: Vec<ReprocessReport>,
}

#[derive(Clone)]
pub struct EpisodeManager {
    store: GraphStore,
    builder: Arc<dyn GraphBuilder>,
    queue: JobQueue,
    sweep: SweepSettings,
}

impl EpisodeManager {
    pub fn new(store: GraphStore, builder: Arc<dyn GraphBuilder>, queue: JobQueue, sweep: SweepSettings) -> Self {
        Self { store, builder, queue, sweep }
    }

    pub fn store(&self) -> &GraphStore { &self.store }

    /// Writes the placeholder, then schedules extraction. The returned
    /// handle resolves once extraction finishes; callers may drop it.
    pub fn ingest(&self, req: IngestRequest) -> Result<(IngestAck, JobHandle)> {
        let created_at = Utc::now();
        let pending = PendingEpisode {
            uuid: Uuid::new_v4().to_string(),
            user_id: req.user_id,
            content: req.text,
            source: req.metadata.get("source").and_then(|v| v.as_str()).unwrap_or("api").to_string(),
            role: req.role,
            file_name: req.metadata.get("file_name").and_then(|v| v.as_str()).map(|s| s.to_string()),
            metadata: req.metadata,
            created_at,
        };
        self.store.put_pending(&pending).context("writing pending episode")?;
        let ack = IngestAck { ok: true, id: pending.uuid.clone(), created_ts: created_at };
        let handle = self.schedule(pending)?;
        Ok((ack, handle))
    }

    fn schedule(&self, pending: PendingEpisode) -> Result<JobHandle> {
        let label = format!("episode:{}", pending.uuid);
        let (store, builder) = (self.store.clone(), self.builder.clone());
        Ok(self.queue.submit(label, async move { process(store, builder, pending).await })?)
    }

    /// Re-submits placeholders older than the stale threshold.
    pub fn retry_sweep(&self) -> Result<Vec<JobHandle>> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.sweep.stale_after).unwrap_or_else(|_| chrono::Duration::minutes(30));
        let stale = self.store.stale_pending(cutoff)?;
        let mut handles = Vec::with_capacity(stale.len());
        for mut pending in stale {
            pending.metadata.insert("retry".to_string(), JsonValue::Bool(true));
            self.store.put_pending(&pending)?;
            info!(user_id = %pending.user_id, id = %pending.uuid, age_min = (Utc::now() - pending.created_at).num_minutes(), "retrying stuck episode");
            handles.push(self.schedule(pending)?);
        }
        Ok(handles)
    }

    /// Runs for the life of the process.
    pub async fn sweep_loop(self) {
        sleep(self.sweep.initial_delay).await;
        loop {
            match self.retry_sweep() {
                Ok(h) if !h.is_empty() => info!(resubmitted = h.len(), "pending sweep"),
                Ok(_) => debug!("pending sweep found nothing stale"),
                Err(err) => error!(error = %format!("{:#}", err), "pending sweep failed"),
            }
            sleep(self.sweep.interval).await;
        }
    }

    /// Pending and processed episodes, most recent first.
    pub fn user_episodes(&self, user_id: &str, limit: Option<usize>) -> Result<Vec<EpisodeSummary>> {
        let mut out: Vec<EpisodeSummary> = self.store.pending_for_user(user_id)?.iter().map(EpisodeSummary::from).collect();
        out.extend(self.store.episodes_for_user(user_id)?.iter().map(EpisodeSummary::from));
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = limit { out.truncate(limit); }
        Ok(out)
    }

    pub async fn search(&self, user_id: &str, query: &str, limit: usize) -> Result<Vec<MemoryHit>> {
        let facts = self.builder
            .search(SearchQuery { query: query.to_string(), limit, center_node_uuid: None, group_id: user_id.to_string() })
            .await?;
        Ok(facts.into_iter().map(fact_to_hit).collect())
    }

    pub async fn summary(&self, user_id: &str) -> Result<String> {
        let hits = self.search(user_id, &format!("facts about {}", user_id), 10).await?;
        if hits.is_empty() {
            return Ok(format!("No information found for user {}", user_id));
        }
        let mut lines = vec![format!("Knowledge summary for {}:", user_id)];
        lines.extend(hits.iter().take(5).enumerate().map(|(i, h)| format!("{}. {}", i + 1, h.fact)));
        Ok(lines.join("\n"))
    }

    /// Deletes the user's episodes and rebuilds them one by one, oldest first.
    pub async fn reprocess_user(&self, user_id: &str) -> Result<ReprocessReport> {
        let episodes = self.store.episodes_for_user(user_id)?;
        let uuids: Vec<String> = episodes.iter().map(|e| e.uuid.clone()).collect();
        self.store.delete_episodes(&uuids)?;
        info!(user_id, total = episodes.len(), "reprocessing episodes");
        let mut report = ReprocessReport { user_id: user_id.to_string(), total_episodes: episodes.len(), ..Default::default() };
        for (i, ep) in episodes.into_iter().enumerate() {
            let old = ep.uuid.clone();
            match self.rebuild(user_id, ep).await {
                Ok(()) => report.processed += 1,
                Err(err) => {
                    error!(user_id, episode = %old, n = i + 1, error = %format!("{:#}", err), "reprocessing episode failed");
                    report.errors += 1;
                }
            }
        }
        info!(user_id, processed = report.processed, errors = report.errors, "reprocessing done");
        Ok(report)
    }

    async fn rebuild(&self, user_id: &str, old: EpisodeNode) -> Result<()> {
        let input = EpisodeInput {
            name: format!("{}{}", user_prefix(user_id), Utc::now().to_rfc3339()),
            body: old.content,
            source: old.source,
            source_description: old.source_description,
            reference_time: Utc::now(),
            group_id: user_id.to_string(),
        };
        let fresh = self.builder.add_episode(input).await?;
        if let Some(file) = old.file_name.as_deref() {
            self.store.tag_episode_file(&fresh.uuid, file)?;
        }
        Ok(())
    }

    pub async fn reprocess_all(&self) -> Result<ReprocessAllReport> {
        let users = self.store.list_users()?;
        let mut all = ReprocessAllReport { total_users: users.len(), ..Default::default() };
        for user in users {
            let r = self.reprocess_user(&user.user_id).await?;
            all.total_episodes += r.total_episodes;
            all.processed += r.processed;
            all.errors += r.errors;
            all.users.push(r);
        }
        Ok(all)
    }
}

/// Extraction of one placeholder. The placeholder is removed only after the
/// episode write succeeded; on error it stays for the sweep.
async fn process(store: GraphStore, builder: Arc<dyn GraphBuilder>, pending: PendingEpisode) -> Result<()> {
    let now = Utc::now();
    let input = EpisodeInput {
        name: format!("{}{}", user_prefix(&pending.user_id), now.to_rfc3339()),
        body: pending.content.clone(),
        source: "text".to_string(),
        source_description: format!("{} ({})", pending.source, pending.role),
        reference_time: now,
        group_id: pending.user_id.clone(),
    };
    let episode = builder.add_episode(input).await.with_context(|| format!("adding episode for user {}", pending.user_id))?;
    // tagging is best effort once the episode exists
    if let Some(file) = pending.file_name.as_deref() {
        if let Err(err) = store.tag_episode_file(&episode.uuid, file) {
            warn!(episode = %episode.uuid, file, %err, "file tag not applied");
        }
    }
    match store.take_pending_by_content(&pending.user_id, &pending.content)? {
        Some(p) => debug!(pending = %p.uuid, episode = %episode.uuid, "pending episode processed"),
        None => warn!(user_id = %pending.user_id, episode = %episode.uuid, "no pending placeholder matched processed text"),
    }
    Ok(())
}
