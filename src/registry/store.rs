// src/registry/store.rs
// Durable registry state: per-entity snapshot files plus an append-only
// JSONL event log whose entries are hash-chained per entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::errors::{DomeError, DomeResult};
use crate::model::{EntityRef, StateChangeSource};

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EventLogEntry {
    pub version: u64,
    pub entity_ref: EntityRef,
    /// SHA-256 of the previous log line for the same entity; genesis is all
    /// zeroes.
    pub prev_hash: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub source: StateChangeSource,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PersistedEntity {
    pub version: u64,
    pub source: StateChangeSource,
    pub value: serde_json::Value,
}

pub struct Store {
    root: PathBuf,
    /// Last log-line hash per entity, for chaining the next entry.
    chain_tips: HashMap<EntityRef, String>,
}

fn line_hash(line: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(line.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn snapshot_file_name(entity: &EntityRef) -> String {
    let sanitized: String = entity
        .id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect();
    // A short digest keeps distinct ids that sanitize identically apart.
    let digest = &line_hash(&entity.id)[..8];
    format!("{sanitized}-{digest}.json")
}

impl Store {
    pub async fn open(root: &Path) -> DomeResult<Self> {
        tokio::fs::create_dir_all(root.join("snapshots")).await?;
        let mut store = Store { root: root.to_path_buf(), chain_tips: HashMap::new() };
        store.rebuild_chain_tips().await?;
        Ok(store)
    }

    fn events_path(&self) -> PathBuf {
        self.root.join("events.jsonl")
    }

    fn snapshot_path(&self, entity: &EntityRef) -> PathBuf {
        self.root
            .join("snapshots")
            .join(entity.kind.as_str())
            .join(snapshot_file_name(entity))
    }

    async fn rebuild_chain_tips(&mut self) -> DomeResult<()> {
        let path = self.events_path();
        if !path.exists() {
            return Ok(());
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<EventLogEntry>(line) {
                Ok(entry) => {
                    self.chain_tips.insert(entry.entity_ref.clone(), line_hash(line));
                }
                Err(err) => warn!(%err, "skipping unparseable event log line"),
            }
        }
        Ok(())
    }

    /// Append one event, chaining it to the entity's previous entry.
    pub async fn append_event(
        &mut self,
        entity: &EntityRef,
        version: u64,
        payload: serde_json::Value,
        source: StateChangeSource,
    ) -> DomeResult<()> {
        let prev_hash = self
            .chain_tips
            .get(entity)
            .cloned()
            .unwrap_or_else(|| GENESIS_HASH.to_string());
        let entry = EventLogEntry {
            version,
            entity_ref: entity.clone(),
            prev_hash,
            payload,
            timestamp: Utc::now(),
            source,
        };
        let line = serde_json::to_string(&entry)?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.events_path())
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.flush().await?;
        self.chain_tips.insert(entity.clone(), line_hash(&line));
        Ok(())
    }

    pub async fn write_snapshot(&self, entity: &EntityRef, persisted: &PersistedEntity) -> DomeResult<()> {
        let path = self.snapshot_path(entity);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let body = serde_json::to_vec_pretty(persisted)?;
        tokio::fs::write(&path, body).await?;
        Ok(())
    }

    /// Rehydrate the latest snapshot per entity.
    pub async fn load_snapshots(&self) -> DomeResult<Vec<(EntityRef, PersistedEntity)>> {
        let mut loaded = Vec::new();
        let snapshots_root = self.root.join("snapshots");
        let mut kind_dirs = match tokio::fs::read_dir(&snapshots_root).await {
            Ok(dirs) => dirs,
            Err(_) => return Ok(loaded),
        };
        while let Some(kind_dir) = kind_dirs.next_entry().await? {
            let mut files = tokio::fs::read_dir(kind_dir.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let raw = tokio::fs::read_to_string(file.path()).await?;
                let persisted: PersistedEntity = match serde_json::from_str(&raw) {
                    Ok(persisted) => persisted,
                    Err(err) => {
                        warn!(path = ?file.path(), %err, "skipping corrupt snapshot");
                        continue;
                    }
                };
                // The entity ref is authoritative inside the payload; fall
                // back to the log if it is not self-describing.
                if let Some(entity) = entity_ref_of(&persisted.value) {
                    loaded.push((entity, persisted));
                } else {
                    debug!(path = ?file.path(), "snapshot payload does not name its entity; skipped");
                }
            }
        }
        Ok(loaded)
    }

    /// Replay persisted events, oldest first.
    pub async fn read_events(&self) -> DomeResult<Vec<EventLogEntry>> {
        let path = self.events_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        let mut entries = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            if let Ok(entry) = serde_json::from_str::<EventLogEntry>(line) {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Verify each entity's hash chain; returns the refs whose chains break.
    pub async fn verify_chains(&self) -> DomeResult<Vec<EntityRef>> {
        let path = self.events_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = tokio::fs::read_to_string(&path).await?;
        let mut expected: HashMap<EntityRef, String> = HashMap::new();
        let mut broken = Vec::new();
        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            let Ok(entry) = serde_json::from_str::<EventLogEntry>(line) else {
                continue;
            };
            let want = expected
                .get(&entry.entity_ref)
                .cloned()
                .unwrap_or_else(|| GENESIS_HASH.to_string());
            if entry.prev_hash != want && !broken.contains(&entry.entity_ref) {
                broken.push(entry.entity_ref.clone());
            }
            expected.insert(entry.entity_ref.clone(), line_hash(line));
        }
        Ok(broken)
    }
}

/// Records carry their own identity; pull the entity ref back out of the
/// serialized payload for rehydration.
pub fn entity_ref_of(value: &serde_json::Value) -> Option<EntityRef> {
    if let Some(raw) = value.get("entity_ref").and_then(|v| v.as_str()) {
        return EntityRef::parse(raw).ok();
    }
    None
}

impl Store {
    /// Snapshot payloads are wrapped with their ref so rehydration does not
    /// need to guess record shapes.
    pub fn wrap_payload(entity: &EntityRef, value: serde_json::Value) -> serde_json::Value {
        serde_json::json!({
            "entity_ref": entity.to_string(),
            "record": value,
        })
    }

    pub fn unwrap_payload(value: &serde_json::Value) -> Option<&serde_json::Value> {
        value.get("record")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(n: u64) -> serde_json::Value {
        serde_json::json!({ "n": n })
    }

    #[tokio::test]
    async fn events_chain_per_entity() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = Store::open(dir.path()).await.unwrap();
        let a = EntityRef::lab("a");
        let b = EntityRef::lab("b");
        store.append_event(&a, 1, payload(1), StateChangeSource::Orchestrator).await.unwrap();
        store.append_event(&b, 1, payload(1), StateChangeSource::Poll).await.unwrap();
        store.append_event(&a, 2, payload(2), StateChangeSource::Orchestrator).await.unwrap();

        let events = store.read_events().await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].prev_hash, GENESIS_HASH);
        assert_eq!(events[1].prev_hash, GENESIS_HASH);
        assert_ne!(events[2].prev_hash, GENESIS_HASH);
        assert!(store.verify_chains().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn chain_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let a = EntityRef::lab("a");
        {
            let mut store = Store::open(dir.path()).await.unwrap();
            store.append_event(&a, 1, payload(1), StateChangeSource::Orchestrator).await.unwrap();
        }
        let mut store = Store::open(dir.path()).await.unwrap();
        store.append_event(&a, 2, payload(2), StateChangeSource::Orchestrator).await.unwrap();
        assert!(store.verify_chains().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tampering_breaks_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let a = EntityRef::lab("a");
        {
            let mut store = Store::open(dir.path()).await.unwrap();
            store.append_event(&a, 1, payload(1), StateChangeSource::Orchestrator).await.unwrap();
            store.append_event(&a, 2, payload(2), StateChangeSource::Orchestrator).await.unwrap();
        }
        let events_path = dir.path().join("events.jsonl");
        let tampered = tokio::fs::read_to_string(&events_path)
            .await
            .unwrap()
            .replace("\"n\":1", "\"n\":9");
        tokio::fs::write(&events_path, tampered).await.unwrap();

        let store = Store::open(dir.path()).await.unwrap();
        let broken = store.verify_chains().await.unwrap();
        assert_eq!(broken, vec![a]);
    }

    #[tokio::test]
    async fn snapshots_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).await.unwrap();
        let entity = EntityRef::vm(&crate::model::PlatformId::from("proxmox:pve01"), "104");
        let persisted = PersistedEntity {
            version: 3,
            source: StateChangeSource::Poll,
            value: Store::wrap_payload(&entity, payload(3)),
        };
        store.write_snapshot(&entity, &persisted).await.unwrap();
        let loaded = store.load_snapshots().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, entity);
        assert_eq!(loaded[0].1.version, 3);
    }
}
