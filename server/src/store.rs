//! Embedded graph store: one sled tree per record kind, JSON values.
//!
//! Writes that may race (ingest, retry sweep, restore) go through
//! create-if-absent on the record id, backed by sled's compare-and-swap.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::error::StoreError;
use crate::model::{user_prefix, EdgeRecord, EntityNode, EpisodeNode, PendingEpisode, UserStats};

pub type Result<T> = std::result::Result<T, StoreError>;

const EPISODES: &str = "episodes";
const ENTITIES: &str = "entities";
const ENTITY_NAMES: &str = "entity_names";
const EDGES: &str = "edges";
const PENDING: &str = "pending";
const PENDING_CONTENT: &str = "pending_content";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert { Created, Existing }

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct PruneReport { pub entities_removed: u64, pub edges_removed: u64 }

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StoreCounts { pub episodes: u64, pub entities: u64, pub edges: u64, pub pending: u64 }

#[derive(Clone)]
pub struct GraphStore {
	db: sled::Db,
}

impl GraphStore {
	pub fn open(path: &Path) -> Result<Self> {
		Ok(Self { db: sled::open(path)? })
	}

	/// In-memory store, removed on drop.
	pub fn temporary() -> Result<Self> {
		Ok(Self { db: sled::Config::new().temporary(true).open()? })
	}

	pub fn flush(&self) -> Result<()> {
		self.db.flush()?;
		Ok(())
	}

	fn tree(&self, name: &str) -> Result<sled::Tree> { Ok(self.db.open_tree(name)?) }

	fn get<T: DeserializeOwned>(&self, tree: &str, key: &str) -> Result<Option<T>> {
		match self.tree(tree)?.get(key.as_bytes())? {
			Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
			None => Ok(None),
		}
	}

	fn put<T: Serialize>(&self, tree: &str, key: &str, value: &T) -> Result<()> {
		self.tree(tree)?.insert(key.as_bytes(), serde_json::to_vec(value)?)?;
		Ok(())
	}

	fn create_if_absent<T: Serialize>(&self, tree: &str, key: &str, value: &T) -> Result<Upsert> {
		let bytes = serde_json::to_vec(value)?;
		match self.tree(tree)?.compare_and_swap(key.as_bytes(), None::<&[u8]>, Some(bytes))? {
			Ok(()) => Ok(Upsert::Created),
			Err(_) => Ok(Upsert::Existing),
		}
	}

	// Undecodable records are skipped, not fatal.
	fn scan<T: DeserializeOwned>(&self, tree: &str) -> Result<Vec<T>> {
		let mut out = Vec::new();
		for kv in self.tree(tree)?.iter() {
			let (k, v) = kv?;
			match serde_json::from_slice::<T>(&v) {
				Ok(rec) => out.push(rec),
				Err(err) => warn!(tree, key = %String::from_utf8_lossy(&k), %err, "skipping undecodable record"),
			}
		}
		Ok(out)
	}

	// Episodes

	pub fn create_episode_if_absent(&self, episode: &EpisodeNode) -> Result<Upsert> {
		self.create_if_absent(EPISODES, &episode.uuid, episode)
	}

	pub fn get_episode(&self, uuid: &str) -> Result<Option<EpisodeNode>> { self.get(EPISODES, uuid) }

	pub fn all_episodes(&self) -> Result<Vec<EpisodeNode>> { self.scan(EPISODES) }

	/// Episodes scoped to `user_id`, oldest first.
	pub fn episodes_for_user(&self, user_id: &str) -> Result<Vec<EpisodeNode>> {
		let mut eps: Vec<EpisodeNode> = self.all_episodes()?.into_iter().filter(|e| owned_by(e, user_id)).collect();
		eps.sort_by_key(|e| e.created_at);
		Ok(eps)
	}

	pub fn tag_episode_file(&self, uuid: &str, file_name: &str) -> Result<bool> {
		let Some(mut ep) = self.get_episode(uuid)? else { return Ok(false) };
		ep.file_name = Some(file_name.to_string());
		self.put(EPISODES, uuid, &ep)?;
		Ok(true)
	}

	fn remove_episodes(&self, uuids: &[String]) -> Result<u64> {
		let tree = self.tree(EPISODES)?;
		let mut removed = 0u64;
		for uuid in uuids {
			if tree.remove(uuid.as_bytes())?.is_some() { removed += 1; }
		}
		Ok(removed)
	}

	pub fn delete_episode(&self, uuid: &str) -> Result<bool> {
		Ok(self.delete_episodes(&[uuid.to_string()])? > 0)
	}

	pub fn delete_episodes(&self, uuids: &[String]) -> Result<u64> {
		let removed = self.remove_episodes(uuids)?;
		if removed > 0 { self.prune_orphans()?; }
		Ok(removed)
	}

	/// Deletes a user's processed and pending episodes for one uploaded file.
	pub fn delete_file_episodes(&self, user_id: &str, file_name: &str) -> Result<u64> {
		let uuids: Vec<String> = self.episodes_for_user(user_id)?.into_iter()
			.filter(|e| e.file_name.as_deref() == Some(file_name))
			.map(|e| e.uuid)
			.collect();
		let removed = self.remove_episodes(&uuids)?;
		let pending = self.delete_pending_for_file(user_id, file_name)?;
		self.prune_orphans()?;
		info!(user_id, file_name, removed, pending, "deleted file episodes");
		Ok(removed + pending)
	}

	pub fn delete_user(&self, user_id: &str) -> Result<u64> {
		let uuids: Vec<String> = self.episodes_for_user(user_id)?.into_iter().map(|e| e.uuid).collect();
		let removed = self.remove_episodes(&uuids)?;
		let pending = self.delete_pending_where(|p| p.user_id == user_id)?;
		let pruned = self.prune_orphans()?;
		info!(user_id, removed, pending, entities = pruned.entities_removed, edges = pruned.edges_removed, "deleted user data");
		Ok(removed + pending)
	}

	/// Drops entities no episode mentions, then edges left without an endpoint.
	pub fn prune_orphans(&self) -> Result<PruneReport> {
		let referenced: HashSet<String> = self.all_episodes()?.into_iter().flat_map(|e| e.entity_uuids).collect();
		let mut report = PruneReport::default();
		let entities = self.tree(ENTITIES)?;
		let names = self.tree(ENTITY_NAMES)?;
		for ent in self.scan::<EntityNode>(ENTITIES)? {
			if referenced.contains(&ent.uuid) { continue; }
			if entities.remove(ent.uuid.as_bytes())?.is_some() {
				report.entities_removed += 1;
				let key = name_key(&ent.group_id, &ent.name);
				if names.get(key.as_bytes())?.as_deref() == Some(ent.uuid.as_bytes()) {
					names.remove(key.as_bytes())?;
				}
			}
		}
		let edges = self.tree(EDGES)?;
		for edge in self.scan::<EdgeRecord>(EDGES)? {
			let dangling = !entities.contains_key(edge.source_uuid.as_bytes())? || !entities.contains_key(edge.target_uuid.as_bytes())?;
			if dangling && edges.remove(edge.uuid.as_bytes())?.is_some() {
				report.edges_removed += 1;
			}
		}
		Ok(report)
	}

	// Entities

	/// Also claims the `(group, name)` slot used for entity resolution if free.
	pub fn create_entity_if_absent(&self, entity: &EntityNode) -> Result<Upsert> {
		let outcome = self.create_if_absent(ENTITIES, &entity.uuid, entity)?;
		if outcome == Upsert::Created {
			let key = name_key(&entity.group_id, &entity.name);
			let _ = self.tree(ENTITY_NAMES)?.compare_and_swap(key.as_bytes(), None::<&[u8]>, Some(entity.uuid.as_bytes()))?;
		}
		Ok(outcome)
	}

	pub fn get_entity(&self, uuid: &str) -> Result<Option<EntityNode>> { self.get(ENTITIES, uuid) }

	pub fn find_entity_by_name(&self, group_id: &str, name: &str) -> Result<Option<EntityNode>> {
		let key = name_key(group_id, name);
		match self.tree(ENTITY_NAMES)?.get(key.as_bytes())? {
			Some(uuid) => self.get_entity(&String::from_utf8_lossy(&uuid)),
			None => Ok(None),
		}
	}

	/// Distinct entities mentioned by the given episodes.
	pub fn entities_for_episodes(&self, episodes: &[EpisodeNode]) -> Result<Vec<EntityNode>> {
		let mut seen = HashSet::new();
		let mut out = Vec::new();
		for uuid in episodes.iter().flat_map(|e| e.entity_uuids.iter()) {
			if !seen.insert(uuid.clone()) { continue; }
			if let Some(ent) = self.get_entity(uuid)? { out.push(ent); }
		}
		Ok(out)
	}

	// Edges

	pub fn create_edge_if_absent(&self, edge: &EdgeRecord) -> Result<Upsert> {
		self.create_if_absent(EDGES, &edge.uuid, edge)
	}

	pub fn get_edge(&self, uuid: &str) -> Result<Option<EdgeRecord>> { self.get(EDGES, uuid) }

	/// Edges whose endpoints both belong to `entity_uuids`.
	pub fn edges_among(&self, entity_uuids: &HashSet<String>) -> Result<Vec<EdgeRecord>> {
		Ok(self.scan::<EdgeRecord>(EDGES)?.into_iter()
			.filter(|e| entity_uuids.contains(&e.source_uuid) && entity_uuids.contains(&e.target_uuid))
			.collect())
	}

	// Pending placeholders

	pub fn put_pending(&self, pending: &PendingEpisode) -> Result<()> {
		self.put(PENDING, &pending.uuid, pending)?;
		self.tree(PENDING_CONTENT)?.insert(pending_index_key(pending).as_bytes(), pending.uuid.as_bytes())?;
		Ok(())
	}

	pub fn get_pending(&self, uuid: &str) -> Result<Option<PendingEpisode>> { self.get(PENDING, uuid) }

	/// Removes the oldest placeholder of `user_id` whose text is exactly `content`.
	pub fn take_pending_by_content(&self, user_id: &str, content: &str) -> Result<Option<PendingEpisode>> {
		let index = self.tree(PENDING_CONTENT)?;
		let pending = self.tree(PENDING)?;
		let prefix = format!("{}:", content_hash(user_id, content));
		for kv in index.scan_prefix(prefix.as_bytes()) {
			let (k, uuid) = kv?;
			index.remove(&k)?;
			// a concurrent take may have won this one
			if let Some(v) = pending.remove(&uuid)? {
				let rec: PendingEpisode = serde_json::from_slice(&v)?;
				if rec.user_id == user_id && rec.content == content {
					return Ok(Some(rec));
				}
				pending.insert(&uuid, v)?;
			}
		}
		Ok(None)
	}

	pub fn pending_for_user(&self, user_id: &str) -> Result<Vec<PendingEpisode>> {
		Ok(self.scan::<PendingEpisode>(PENDING)?.into_iter().filter(|p| p.user_id == user_id).collect())
	}

	/// Placeholders created before `cutoff`.
	pub fn stale_pending(&self, cutoff: DateTime<Utc>) -> Result<Vec<PendingEpisode>> {
		let mut out: Vec<PendingEpisode> = self.scan::<PendingEpisode>(PENDING)?.into_iter().filter(|p| p.created_at < cutoff).collect();
		out.sort_by_key(|p| p.created_at);
		Ok(out)
	}

	pub fn delete_pending_for_file(&self, user_id: &str, file_name: &str) -> Result<u64> {
		self.delete_pending_where(|p| p.user_id == user_id && p.file_name.as_deref() == Some(file_name))
	}

	fn delete_pending_where(&self, pred: impl Fn(&PendingEpisode) -> bool) -> Result<u64> {
		let pending = self.tree(PENDING)?;
		let index = self.tree(PENDING_CONTENT)?;
		let mut removed = 0u64;
		for p in self.scan::<PendingEpisode>(PENDING)? {
			if !pred(&p) { continue; }
			index.remove(pending_index_key(&p).as_bytes())?;
			if pending.remove(p.uuid.as_bytes())?.is_some() { removed += 1; }
		}
		Ok(removed)
	}

	// Summaries

	/// Users derived from episode names, busiest first.
	pub fn list_users(&self) -> Result<Vec<UserStats>> {
		let mut by_user: BTreeMap<String, (u64, Option<DateTime<Utc>>)> = BTreeMap::new();
		for ep in self.all_episodes()? {
			let user = if ep.group_id.is_empty() { ep.name.split('_').next().unwrap_or_default().to_string() } else { ep.group_id.clone() };
			if user.is_empty() { continue; }
			let slot = by_user.entry(user).or_insert((0, None));
			slot.0 += 1;
			slot.1 = slot.1.max(Some(ep.created_at));
		}
		let mut users: Vec<UserStats> = by_user.into_iter()
			.map(|(user_id, (episodes_count, last_updated))| UserStats { user_id, episodes_count, last_updated })
			.collect();
		users.sort_by(|a, b| b.episodes_count.cmp(&a.episodes_count));
		Ok(users)
	}

	pub fn counts(&self) -> Result<StoreCounts> {
		Ok(StoreCounts {
			episodes: self.tree(EPISODES)?.len() as u64,
			entities: self.tree(ENTITIES)?.len() as u64,
			edges: self.tree(EDGES)?.len() as u64,
			pending: self.tree(PENDING)?.len() as u64,
		})
	}
}

/// Exact scope match; the `{user_id}_` name prefix only decides for records without a scope.
fn owned_by(ep: &EpisodeNode, user_id: &str) -> bool {
	if ep.group_id.is_empty() {
		ep.name.starts_with(&user_prefix(user_id))
	} else {
		ep.group_id == user_id
	}
}

fn name_key(group_id: &str, name: &str) -> String {
	format!("{}::{}", group_id, name.trim().to_lowercase())
}

fn content_hash(user_id: &str, content: &str) -> String {
	let mut hasher = Sha256::new();
	hasher.update(user_id.as_bytes());
	hasher.update([0u8]);
	hasher.update(content.as_bytes());
	format!("{:x}", hasher.finalize())
}

// `{hash}:{created millis, zero padded}:{uuid}` keeps scans oldest first
fn pending_index_key(p: &PendingEpisode) -> String {
	format!("{}:{:020}:{}", content_hash(&p.user_id, &p.content), p.created_at.timestamp_millis().max(0), p.uuid)
}
