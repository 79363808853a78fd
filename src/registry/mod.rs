// src/registry/mod.rs
// The process-external source of truth for labs, VMs, networks, and hosts.
// Writes come from the orchestrator and the polling agents; every content
// change appends to the event log and fans out on the bus.

pub mod bus;
pub mod poller;
pub mod store;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::errors::{DomeError, DomeResult};
use crate::model::{
    DriftRecord, DriftResolution, EntityKind, EntityRef, LabRecord, NetworkRecord, PlatformId,
    StateChange, StateChangeSource, VmRecord,
};
use bus::{EventBus, TopicFilter};
use store::{PersistedEntity, Store};

/// Fields compared between orchestrator-declared and poll-observed state.
const DRIFT_FIELDS: &[(&str, &[&str])] = &[
    ("status", &["status"]),
    ("primary_ip", &["primary_ip"]),
    ("cores", &["spec", "cores"]),
    ("memory_mib", &["spec", "memory_mib"]),
    ("networks", &["spec", "networks"]),
];

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LabSnapshot {
    pub lab: LabRecord,
    pub vms: Vec<VmRecord>,
    pub networks: Vec<NetworkRecord>,
}

struct Entry {
    version: u64,
    source: StateChangeSource,
    value: serde_json::Value,
}

pub struct Registry {
    entries: RwLock<HashMap<EntityRef, Entry>>,
    history: RwLock<Vec<Arc<StateChange>>>,
    bus: EventBus,
    store: Option<Mutex<Store>>,
    drifts: RwLock<Vec<DriftRecord>>,
    last_poll: RwLock<HashMap<PlatformId, DateTime<Utc>>>,
}

impl Registry {
    pub fn in_memory(bus_capacity: usize) -> Self {
        Registry {
            entries: RwLock::new(HashMap::new()),
            history: RwLock::new(Vec::new()),
            bus: EventBus::new(bus_capacity),
            store: None,
            drifts: RwLock::new(Vec::new()),
            last_poll: RwLock::new(HashMap::new()),
        }
    }

    /// Open the durable registry, rehydrating the latest snapshot per entity
    /// and the event history for cursor replay.
    pub async fn open(persistence_dir: &Path, bus_capacity: usize) -> DomeResult<Self> {
        let store = Store::open(persistence_dir).await?;
        for entity in store.verify_chains().await? {
            warn!(entity = %entity, "event log hash chain is broken for this entity");
        }
        let mut entries = HashMap::new();
        for (entity, persisted) in store.load_snapshots().await? {
            let value = Store::unwrap_payload(&persisted.value)
                .cloned()
                .unwrap_or(persisted.value.clone());
            entries.insert(
                entity,
                Entry { version: persisted.version, source: persisted.source, value },
            );
        }
        let mut history = Vec::new();
        for event in store.read_events().await? {
            history.push(Arc::new(StateChange {
                entity_ref: event.entity_ref,
                version: event.version,
                prev: None,
                next: event.payload,
                detected_at: event.timestamp,
                source: event.source,
            }));
        }
        info!(
            entities = entries.len(),
            events = history.len(),
            dir = %persistence_dir.display(),
            "registry rehydrated"
        );
        Ok(Registry {
            entries: RwLock::new(entries),
            history: RwLock::new(history),
            bus: EventBus::new(bus_capacity),
            store: Some(Mutex::new(store)),
            drifts: RwLock::new(Vec::new()),
            last_poll: RwLock::new(HashMap::new()),
        })
    }

    /// Idempotent write. Identical payloads emit nothing; changed payloads
    /// bump the per-entity version and produce exactly one StateChange.
    pub async fn upsert<T: Serialize>(
        &self,
        entity: &EntityRef,
        record: &T,
        source: StateChangeSource,
    ) -> DomeResult<u64> {
        let value = serde_json::to_value(record)?;
        self.upsert_value(entity, value, source).await
    }

    async fn upsert_value(
        &self,
        entity: &EntityRef,
        value: serde_json::Value,
        source: StateChangeSource,
    ) -> DomeResult<u64> {
        let mut entries = self.entries.write().await;
        let prior = entries.get(entity);

        if let Some(prior) = prior {
            if prior.value == value {
                return Ok(prior.version);
            }
        }

        let version = prior.map(|e| e.version + 1).unwrap_or(1);
        let prev_value = prior.map(|e| e.value.clone());
        let prior_source = prior.map(|e| e.source);

        // Poll observations that contradict what the orchestrator declared
        // become drift records, published for the Overseer to judge.
        if source == StateChangeSource::Poll && prior_source == Some(StateChangeSource::Orchestrator) {
            if let Some(prev) = &prev_value {
                let mut drifts = self.drifts.write().await;
                for (field, path) in DRIFT_FIELDS {
                    let expected = json_path(prev, path);
                    let observed = json_path(&value, path);
                    if expected != observed {
                        debug!(entity = %entity, field = *field, "drift detected");
                        drifts.push(DriftRecord {
                            entity_ref: entity.clone(),
                            field: (*field).to_string(),
                            expected: expected.cloned().unwrap_or(serde_json::Value::Null),
                            observed: observed.cloned().unwrap_or(serde_json::Value::Null),
                            detected_at: Utc::now(),
                            resolution: DriftResolution::Pending,
                        });
                    }
                }
            }
        }

        let event = Arc::new(StateChange {
            entity_ref: entity.clone(),
            version,
            prev: prev_value,
            next: value.clone(),
            detected_at: Utc::now(),
            source,
        });

        entries.insert(entity.clone(), Entry { version, source, value: value.clone() });
        self.history.write().await.push(Arc::clone(&event));

        // The store mutex is taken while the entries lock is still held so
        // log order always matches version order per entity.
        let store_guard = match &self.store {
            Some(store) => Some(store.lock().await),
            None => None,
        };
        drop(entries);

        if let Some(mut store) = store_guard {
            store
                .append_event(entity, version, value.clone(), source)
                .await?;
            store
                .write_snapshot(
                    entity,
                    &PersistedEntity {
                        version,
                        source,
                        value: Store::wrap_payload(entity, value),
                    },
                )
                .await?;
        }

        self.bus.publish(event);
        Ok(version)
    }

    pub async fn get_raw(&self, entity: &EntityRef) -> Option<(u64, serde_json::Value)> {
        let entries = self.entries.read().await;
        entries.get(entity).map(|e| (e.version, e.value.clone()))
    }

    pub async fn get<T: DeserializeOwned>(&self, entity: &EntityRef) -> DomeResult<Option<T>> {
        match self.get_raw(entity).await {
            Some((_, value)) => Ok(Some(serde_json::from_value(value).map_err(|e| {
                DomeError::permanent(format!("registry entry {entity} does not deserialize: {e}"))
            })?)),
            None => Ok(None),
        }
    }

    pub async fn list<T: DeserializeOwned>(&self, kind: EntityKind) -> Vec<T> {
        let entries = self.entries.read().await;
        let mut keyed: Vec<(&EntityRef, &Entry)> =
            entries.iter().filter(|(r, _)| r.kind == kind).collect();
        keyed.sort_by(|a, b| a.0.cmp(b.0));
        keyed
            .into_iter()
            .filter_map(|(entity, entry)| match serde_json::from_value(entry.value.clone()) {
                Ok(record) => Some(record),
                Err(err) => {
                    warn!(entity = %entity, %err, "registry entry does not deserialize; skipped");
                    None
                }
            })
            .collect()
    }

    pub async fn version_of(&self, entity: &EntityRef) -> Option<u64> {
        self.entries.read().await.get(entity).map(|e| e.version)
    }

    /// Restartable subscription: replays history with `version > cursor` for
    /// matching entities, then follows live events. Delivery is
    /// at-least-once; the subscription dedupes by (entity_ref, version).
    pub async fn subscribe(&self, filter: TopicFilter, cursor: u64) -> Subscription {
        let rx = self.bus.receiver();
        let history = self.history.read().await;
        let backlog: VecDeque<Arc<StateChange>> = history
            .iter()
            .filter(|event| filter.matches(event) && event.version > cursor)
            .cloned()
            .collect();
        Subscription {
            backlog,
            rx,
            filter,
            delivered: HashMap::new(),
            cursor,
        }
    }

    /// Persisted-and-in-memory history matching a filter, without following
    /// the live feed. Used by one-shot event listings.
    pub async fn history_events(&self, filter: &TopicFilter, cursor: u64) -> Vec<Arc<StateChange>> {
        self.history
            .read()
            .await
            .iter()
            .filter(|event| filter.matches(event) && event.version > cursor)
            .cloned()
            .collect()
    }

    /// One consistent read of a lab and everything it owns.
    pub async fn snapshot(&self, lab_id: &str) -> DomeResult<LabSnapshot> {
        let entries = self.entries.read().await;
        let lab_entry = entries
            .get(&EntityRef::lab(lab_id))
            .ok_or_else(|| DomeError::missing(format!("lab {lab_id} is not in the registry")))?;
        let lab: LabRecord = serde_json::from_value(lab_entry.value.clone())
            .map_err(|e| DomeError::permanent(format!("lab {lab_id} record is corrupt: {e}")))?;

        let mut vms = Vec::new();
        let mut networks = Vec::new();
        for entry in entries.values() {
            if let Ok(vm) = serde_json::from_value::<VmRecord>(entry.value.clone()) {
                if vm.owner_lab.as_deref() == Some(lab_id) {
                    vms.push(vm);
                    continue;
                }
            }
            if let Ok(network) = serde_json::from_value::<NetworkRecord>(entry.value.clone()) {
                if network.owner_lab.as_deref() == Some(lab_id) {
                    networks.push(network);
                }
            }
        }
        vms.sort_by(|a, b| a.vm_id.cmp(&b.vm_id));
        networks.sort_by(|a, b| a.network_id.cmp(&b.network_id));
        Ok(LabSnapshot { lab, vms, networks })
    }

    pub async fn pending_drifts(&self) -> Vec<DriftRecord> {
        self.drifts
            .read()
            .await
            .iter()
            .filter(|d| d.resolution == DriftResolution::Pending)
            .cloned()
            .collect()
    }

    pub async fn resolve_drifts(&self, entity: &EntityRef, resolution: DriftResolution) {
        let mut drifts = self.drifts.write().await;
        for drift in drifts.iter_mut() {
            if &drift.entity_ref == entity && drift.resolution == DriftResolution::Pending {
                drift.resolution = resolution;
            }
        }
    }

    pub async fn record_poll(&self, platform: &PlatformId) {
        self.last_poll.write().await.insert(platform.clone(), Utc::now());
    }

    pub async fn last_poll(&self, platform: &PlatformId) -> Option<DateTime<Utc>> {
        self.last_poll.read().await.get(platform).copied()
    }

    pub async fn platform_fresh(&self, platform: &PlatformId, horizon_s: u64) -> bool {
        match self.last_poll(platform).await {
            Some(at) => (Utc::now() - at).num_seconds() <= horizon_s as i64,
            None => false,
        }
    }
}

pub struct Subscription {
    backlog: VecDeque<Arc<StateChange>>,
    rx: broadcast::Receiver<Arc<StateChange>>,
    filter: TopicFilter,
    delivered: HashMap<EntityRef, u64>,
    cursor: u64,
}

impl Subscription {
    /// Next event, or None when the registry (and its bus) is gone.
    pub async fn next(&mut self) -> Option<Arc<StateChange>> {
        while let Some(event) = self.backlog.pop_front() {
            if self.deliverable(&event) {
                self.mark(&event);
                return Some(event);
            }
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.filter.matches(&event) && event.version > self.cursor && self.deliverable(&event) {
                        self.mark(&event);
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "subscription lagged; events were dropped from the live feed");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn deliverable(&self, event: &StateChange) -> bool {
        match self.delivered.get(&event.entity_ref) {
            Some(last) => event.version > *last,
            None => true,
        }
    }

    fn mark(&mut self, event: &StateChange) {
        self.delivered.insert(event.entity_ref.clone(), event.version);
    }
}

fn json_path<'a>(value: &'a serde_json::Value, path: &[&str]) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path {
        current = current.get(segment)?;
    }
    Some(current)
}
