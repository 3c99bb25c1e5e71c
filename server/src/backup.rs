//! Per-user backup archives: a gzip'd tar holding `metadata.json`,
//! `episodes.json`, `entities.json` and `edges.json`.
//!
//! Restore only ever adds records. Existing ids are left untouched and counted
//! as conflicts.

use std::collections::{HashMap, HashSet};
use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::BackupError;
use crate::model::{user_prefix, EdgeRecord, EntityNode, EpisodeNode};
use crate::store::{GraphStore, Upsert};

pub const FORMAT_VERSION: &str = "1.0";

const METADATA: &str = "metadata.json";
const EPISODES: &str = "episodes.json";
const ENTITIES: &str = "entities.json";
const EDGES: &str = "edges.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupMetadata {
    #[serde(default = "default_version")]
    pub version: String,
    pub export_timestamp: DateTime<Utc>,
    pub user_id: String,
    #[serde(default)]
    pub total_episodes: usize,
    #[serde(default)]
    pub total_entities: usize,
    #[serde(default)]
    pub total_edges: usize,
}

fn default_version() -> String { FORMAT_VERSION.to_string() }

/// Everything that belongs to one user.
#[derive(Debug, Default)]
pub struct UserSnapshot {
    pub episodes: Vec<EpisodeNode>,
    pub entities: Vec<EntityNode>,
    pub edges: Vec<EdgeRecord>,
}

/// Episodes named after the user, the entities they mention, and the edges
/// between those entities.
pub fn collect(store: &GraphStore, user_id: &str) -> Result<UserSnapshot, BackupError> {
    let episodes = store.episodes_for_user(user_id)?;
    let entities = store.entities_for_episodes(&episodes)?;
    let ids: HashSet<String> = entities.iter().map(|e| e.uuid.clone()).collect();
    let edges = store.edges_among(&ids)?;
    Ok(UserSnapshot { episodes, entities, edges })
}

pub fn export_user(store: &GraphStore, user_id: &str) -> Result<Vec<u8>, BackupError> {
    let snap = collect(store, user_id)?;
    let metadata = BackupMetadata {
        version: FORMAT_VERSION.to_string(),
        export_timestamp: Utc::now(),
        user_id: user_id.to_string(),
        total_episodes: snap.episodes.len(),
        total_entities: snap.entities.len(),
        total_edges: snap.edges.len(),
    };
    let entries = [
        (METADATA, pretty(METADATA, &metadata)?),
        (EPISODES, pretty(EPISODES, &snap.episodes)?),
        (ENTITIES, pretty(ENTITIES, &snap.entities)?),
        (EDGES, pretty(EDGES, &snap.edges)?),
    ];
    let archive = write_archive(&entries)?;
    info!(user_id, episodes = metadata.total_episodes, entities = metadata.total_entities, edges = metadata.total_edges, bytes = archive.len(), "backup created");
    Ok(archive)
}

fn pretty<T: Serialize + ?Sized>(entry: &'static str, value: &T) -> Result<Vec<u8>, BackupError> {
    serde_json::to_vec_pretty(value).map_err(|source| BackupError::Encode { entry, source })
}

fn write_archive(entries: &[(&str, Vec<u8>)]) -> Result<Vec<u8>, BackupError> {
    let enc = GzEncoder::new(Vec::new(), Compression::default());
    let mut tar = tar::Builder::new(enc);
    let mtime = Utc::now().timestamp().max(0) as u64;
    for (name, data) in entries {
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(mtime);
        tar.append_data(&mut header, name, data.as_slice())?;
    }
    let mut enc = tar.into_inner()?;
    enc.flush()?;
    Ok(enc.finish()?)
}

fn read_entries(archive: &[u8]) -> Result<HashMap<String, Vec<u8>>, BackupError> {
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let mut out = HashMap::new();
    for entry in tar.entries()? {
        let mut entry = entry?;
        let name = entry.path()?.to_string_lossy().trim_start_matches("./").to_string();
        let mut data = Vec::new();
        entry.read_to_end(&mut data)?;
        out.insert(name, data);
    }
    Ok(out)
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub new_user_id: Option<String>,
    /// Accepted and ignored: restore never deletes.
    pub replace: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RestoreResponse {
    pub status: String,
    pub user_id: String,
    pub episodes_created: usize,
    pub entities_created: usize,
    pub edges_created: usize,
    pub conflicts_skipped: usize,
    pub message: String,
}

impl RestoreResponse {
    fn failed(err: &BackupError) -> Self {
        Self {
            status: "error".to_string(),
            user_id: "unknown".to_string(),
            episodes_created: 0,
            entities_created: 0,
            edges_created: 0,
            conflicts_skipped: 0,
            message: format!("Failed to restore backup: {}", err),
        }
    }
}

/// Merges an archive into the store. Failures come back as an `error` status.
pub fn restore(store: &GraphStore, archive: &[u8], opts: &RestoreOptions) -> RestoreResponse {
    match try_restore(store, archive, opts) {
        Ok(resp) => resp,
        Err(err) => {
            error!(%err, "restore failed");
            RestoreResponse::failed(&err)
        }
    }
}

fn try_restore(store: &GraphStore, archive: &[u8], opts: &RestoreOptions) -> Result<RestoreResponse, BackupError> {
    let entries = read_entries(archive)?;
    let raw_meta = entries.get(METADATA).ok_or(BackupError::MissingMetadata)?;
    let meta: BackupMetadata = serde_json::from_slice(raw_meta).map_err(BackupError::BadMetadata)?;
    if opts.replace {
        warn!(user_id = %meta.user_id, "replace flag ignored; restore always merges");
    }
    let original = meta.user_id.clone();
    let target = opts.new_user_id.clone().filter(|s| !s.is_empty()).unwrap_or_else(|| original.clone());
    info!(original = %original, target = %target, version = %meta.version, "restoring backup");

    let mut snap = UserSnapshot {
        episodes: parse_stream(EPISODES, entries.get(EPISODES)),
        entities: parse_stream(ENTITIES, entries.get(ENTITIES)),
        edges: parse_stream(EDGES, entries.get(EDGES)),
    };
    if target != original {
        rename_user(&mut snap, &original, &target);
    }

    let mut resp = RestoreResponse {
        status: "success".to_string(),
        user_id: target.clone(),
        episodes_created: 0,
        entities_created: 0,
        edges_created: 0,
        conflicts_skipped: 0,
        message: String::new(),
    };
    for entity in &snap.entities {
        match store.create_entity_if_absent(entity)? {
            Upsert::Created => resp.entities_created += 1,
            Upsert::Existing => resp.conflicts_skipped += 1,
        }
    }
    for episode in &snap.episodes {
        match store.create_episode_if_absent(episode)? {
            Upsert::Created => resp.episodes_created += 1,
            Upsert::Existing => resp.conflicts_skipped += 1,
        }
    }
    let mut orphaned = 0usize;
    for edge in &snap.edges {
        if store.get_entity(&edge.source_uuid)?.is_none() || store.get_entity(&edge.target_uuid)?.is_none() {
            orphaned += 1;
            continue;
        }
        match store.create_edge_if_absent(edge)? {
            Upsert::Created => resp.edges_created += 1,
            Upsert::Existing => resp.conflicts_skipped += 1,
        }
    }
    store.flush()?;

    resp.message = format!("Successfully restored backup for user {} (merge mode, existing data preserved)", target);
    if orphaned > 0 {
        warn!(orphaned, "edges skipped: endpoint entity missing");
        resp.message.push_str(&format!("; {} edges skipped for missing endpoints", orphaned));
    }
    info!(user_id = %target, episodes = resp.episodes_created, entities = resp.entities_created, edges = resp.edges_created, conflicts = resp.conflicts_skipped, "restore complete");
    Ok(resp)
}

/// Missing, blank or undecodable streams become empty.
fn parse_stream<T: DeserializeOwned>(entry: &str, data: Option<&Vec<u8>>) -> Vec<T> {
    let Some(data) = data else {
        warn!(entry, "backup entry missing");
        return Vec::new();
    };
    let text = String::from_utf8_lossy(data);
    let text = text.trim();
    if text.is_empty() { return Vec::new(); }
    match serde_json::from_str(text) {
        Ok(v) => v,
        Err(err) => {
            warn!(entry, %err, preview = %text.chars().take(200).collect::<String>(), "unparsable backup entry, treating as empty");
            Vec::new()
        }
    }
}

fn rename_user(snap: &mut UserSnapshot, from: &str, to: &str) {
    let (old_prefix, new_prefix) = (user_prefix(from), user_prefix(to));
    for ep in &mut snap.episodes {
        if let Some(rest) = ep.name.strip_prefix(&old_prefix) {
            ep.name = format!("{}{}", new_prefix, rest);
        }
        if ep.group_id == from { ep.group_id = to.to_string(); }
    }
    for ent in &mut snap.entities {
        if ent.group_id == from { ent.group_id = to.to_string(); }
    }
    for edge in &mut snap.edges {
        if edge.group_id == from { edge.group_id = to.to_string(); }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;

    use super::*;

    fn seed(store: &GraphStore, user: &str) {
        let t = Utc::now();
        let ent = |id: &str| EntityNode { uuid: format!("{}-{}", user, id), name: id.to_uppercase(), group_id: user.into(), summary: None, created_at: t, labels: vec!["Entity".into()], extra: Map::new() };
        for id in ["a", "b", "c"] { store.create_entity_if_absent(&ent(id)).unwrap(); }
        for (i, ents) in [vec!["a", "b"], vec!["b", "c"]].into_iter().enumerate() {
            store.create_episode_if_absent(&EpisodeNode {
                uuid: format!("{}-ep{}", user, i),
                name: format!("{}_2024-05-0{}T10:00:00+00:00", user, i + 1),
                group_id: user.into(),
                content: format!("episode {}", i),
                source: "text".into(),
                source_description: "api (user)".into(),
                created_at: t,
                valid_at: t,
                invalid_at: None,
                file_name: if i == 0 { Some("notes.md".into()) } else { None },
                entity_uuids: ents.iter().map(|e| format!("{}-{}", user, e)).collect(),
                extra: Map::new(),
            }).unwrap();
        }
        for (s, d) in [("a", "b"), ("b", "c")] {
            store.create_edge_if_absent(&EdgeRecord {
                uuid: format!("{}-{}{}", user, s, d), group_id: user.into(), relation: "KNOWS".into(),
                source_uuid: format!("{}-{}", user, s), target_uuid: format!("{}-{}", user, d), fact: format!("{} knows {}", s, d),
                episodes: vec![], created_at: t, expired_at: None, valid_at: Some(t), invalid_at: None, extra: Map::new(),
            }).unwrap();
        }
    }

    #[test]
    fn export_then_import_is_a_merge() {
        let src = GraphStore::temporary().unwrap();
        seed(&src, "u1");
        seed(&src, "other");
        let archive = export_user(&src, "u1").unwrap();

        let dst = GraphStore::temporary().unwrap();
        let first = restore(&dst, &archive, &RestoreOptions::default());
        assert_eq!(first.status, "success");
        assert_eq!((first.episodes_created, first.entities_created, first.edges_created, first.conflicts_skipped), (2, 3, 2, 0));

        let second = restore(&dst, &archive, &RestoreOptions { new_user_id: None, replace: true });
        assert_eq!((second.episodes_created, second.entities_created, second.edges_created, second.conflicts_skipped), (0, 0, 0, 7));

        let again = collect(&dst, "u1").unwrap();
        assert_eq!(again.episodes, collect(&src, "u1").unwrap().episodes);
        assert_eq!(again.edges.len(), 2);
    }

    #[test]
    fn rename_rewrites_prefix_only() {
        let src = GraphStore::temporary().unwrap();
        seed(&src, "alice");
        let archive = export_user(&src, "alice").unwrap();
        let dst = GraphStore::temporary().unwrap();
        let resp = restore(&dst, &archive, &RestoreOptions { new_user_id: Some("bob".into()), replace: false });
        assert_eq!(resp.user_id, "bob");

        let before = src.episodes_for_user("alice").unwrap();
        let after = dst.episodes_for_user("bob").unwrap();
        assert_eq!(after.len(), 2);
        assert!(dst.episodes_for_user("alice").unwrap().is_empty());
        for (a, b) in before.iter().zip(after.iter()) {
            assert_eq!(b.name, a.name.replacen("alice_", "bob_", 1));
            assert_eq!(b.group_id, "bob");
            assert_eq!((b.content.as_str(), b.created_at, b.valid_at), (a.content.as_str(), a.created_at, a.valid_at));
        }
        assert_eq!(after[0].file_name.as_deref(), Some("notes.md"));
    }

    #[test]
    fn missing_metadata_is_an_error_result() {
        let archive = write_archive(&[(EPISODES, b"[]".to_vec())]).unwrap();
        let resp = restore(&GraphStore::temporary().unwrap(), &archive, &RestoreOptions::default());
        assert_eq!(resp.status, "error");
        assert_eq!(resp.user_id, "unknown");
        assert!(resp.message.contains("metadata.json"));

        let garbage = restore(&GraphStore::temporary().unwrap(), b"not a tarball", &RestoreOptions::default());
        assert_eq!(garbage.status, "error");
    }

    #[test]
    fn broken_streams_degrade_to_empty() {
        let src = GraphStore::temporary().unwrap();
        seed(&src, "u1");
        let snap = collect(&src, "u1").unwrap();
        let meta = serde_json::json!({ "version": "1.0", "export_timestamp": Utc::now(), "user_id": "u1" });
        let archive = write_archive(&[
            (METADATA, serde_json::to_vec(&meta).unwrap()),
            (EPISODES, serde_json::to_vec(&snap.episodes).unwrap()),
            (ENTITIES, b"   ".to_vec()),
            (EDGES, b"[{\"uuid\": ".to_vec()),
        ]).unwrap();
        let dst = GraphStore::temporary().unwrap();
        let resp = restore(&dst, &archive, &RestoreOptions::default());
        assert_eq!(resp.status, "success");
        assert_eq!((resp.episodes_created, resp.entities_created, resp.edges_created), (2, 0, 0));
    }

    #[test]
    fn edges_without_endpoints_are_skipped() {
        let src = GraphStore::temporary().unwrap();
        seed(&src, "u1");
        let snap = collect(&src, "u1").unwrap();
        let meta = serde_json::json!({ "export_timestamp": Utc::now(), "user_id": "u1" });
        let archive = write_archive(&[
            (METADATA, serde_json::to_vec(&meta).unwrap()),
            (ENTITIES, serde_json::to_vec(&snap.entities[..1]).unwrap()),
            (EDGES, serde_json::to_vec(&snap.edges).unwrap()),
        ]).unwrap();
        let resp = restore(&GraphStore::temporary().unwrap(), &archive, &RestoreOptions::default());
        assert_eq!(resp.edges_created, 0);
        assert!(resp.message.contains("2 edges skipped"));
    }
}
