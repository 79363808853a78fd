// src/registry/poller.rs
// Per-platform polling agents. Each platform gets three reconciliation
// cadences: watched labs (tier 1), VMs of active labs (tier 2), and full
// host enumeration (tier 3). Observations flow into the Registry as
// poll-sourced upserts; the Registry turns disagreements into drift.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::PollIntervalsConfig;
use crate::errors::DomeResult;
use crate::model::{GuestToolsState, HostRecord, StateChangeSource, VmRecord, VmStatus};
use crate::platform::{AdapterMap, PlatformCapability, VmFilter};
use crate::registry::Registry;

/// Lab ids the Overseer is actively monitoring; tier-1 cadence applies.
pub type WatchSet = Arc<RwLock<HashSet<String>>>;

pub struct PollerHandles {
    tasks: Vec<JoinHandle<()>>,
    cancel_tx: watch::Sender<bool>,
}

impl PollerHandles {
    pub fn shutdown(self) {
        let _ = self.cancel_tx.send(true);
        for task in self.tasks {
            task.abort();
        }
    }
}

pub fn spawn(
    adapters: Arc<AdapterMap>,
    registry: Arc<Registry>,
    watch_set: WatchSet,
    intervals: PollIntervalsConfig,
) -> PollerHandles {
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    for adapter in adapters.values() {
        tasks.push(spawn_tier(
            Arc::clone(adapter),
            Arc::clone(&registry),
            Some(Arc::clone(&watch_set)),
            Duration::from_secs(intervals.lab_s.max(1)),
            cancel_rx.clone(),
            "tier1-labs",
        ));
        tasks.push(spawn_tier(
            Arc::clone(adapter),
            Arc::clone(&registry),
            None,
            Duration::from_secs(intervals.vm_s.max(1)),
            cancel_rx.clone(),
            "tier2-vms",
        ));
        tasks.push(spawn_host_tier(
            Arc::clone(adapter),
            Arc::clone(&registry),
            Duration::from_secs(intervals.host_s.max(1)),
            cancel_rx.clone(),
        ));
    }

    PollerHandles { tasks, cancel_tx }
}

fn spawn_tier(
    adapter: Arc<dyn PlatformCapability>,
    registry: Arc<Registry>,
    watch_set: Option<WatchSet>,
    interval: Duration,
    mut cancel_rx: watch::Receiver<bool>,
    tier: &'static str,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel_rx.changed() => break,
            }
            let only_labs = match &watch_set {
                Some(set) => {
                    let labs = set.read().await.clone();
                    if labs.is_empty() {
                        continue;
                    }
                    Some(labs)
                }
                None => None,
            };
            if let Err(err) = poll_platform_vms(adapter.as_ref(), &registry, only_labs.as_ref()).await {
                warn!(platform = %adapter.platform_id(), tier, %err, "poll pass failed");
            }
        }
    })
}

fn spawn_host_tier(
    adapter: Arc<dyn PlatformCapability>,
    registry: Arc<Registry>,
    interval: Duration,
    mut cancel_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel_rx.changed() => break,
            }
            if let Err(err) = poll_platform_host(adapter.as_ref(), &registry).await {
                warn!(platform = %adapter.platform_id(), %err, "host enumeration failed");
            }
        }
    })
}

/// Full host pass: reachability plus fleet size.
pub async fn poll_platform_host(
    adapter: &dyn PlatformCapability,
    registry: &Registry,
) -> DomeResult<()> {
    let reachable = adapter.ping().await.is_ok();
    let (vm_count, network_count) = if reachable {
        let vms = adapter.list_vms(&VmFilter::default()).await.map(|v| v.len()).unwrap_or(0);
        let networks = adapter.list_networks().await.map(|n| n.len()).unwrap_or(0);
        (vms, networks)
    } else {
        (0, 0)
    };
    let record = HostRecord {
        platform_id: adapter.platform_id().clone(),
        kind: adapter.kind().as_str().to_string(),
        reachable,
        last_successful_poll: if reachable { Some(Utc::now()) } else {
            registry.last_poll(adapter.platform_id()).await
        },
        vm_count,
        network_count,
    };
    registry
        .upsert(&record.entity_ref(), &record, StateChangeSource::Poll)
        .await?;
    if reachable {
        registry.record_poll(adapter.platform_id()).await;
    }
    Ok(())
}

/// Merge one platform's observations into the Registry's VM records.
/// `only_labs` narrows the pass to VMs owned by those labs (tier 1).
pub async fn poll_platform_vms(
    adapter: &dyn PlatformCapability,
    registry: &Registry,
    only_labs: Option<&HashSet<String>>,
) -> DomeResult<usize> {
    let observations = adapter.list_vms(&VmFilter::default()).await?;
    registry.record_poll(adapter.platform_id()).await;

    let records: Vec<VmRecord> = registry.list(crate::model::EntityKind::Vm).await;
    let mut merged_count = 0;

    for record in records {
        if &record.platform_id != adapter.platform_id() {
            continue;
        }
        if record.status == VmStatus::Deleted {
            continue;
        }
        if let Some(labs) = only_labs {
            match &record.owner_lab {
                Some(lab) if labs.contains(lab) => {}
                _ => continue,
            }
        }

        let observation = observations.iter().find(|o| o.vm_id == record.vm_id);
        let mut merged = record.clone();
        match observation {
            Some(obs) => {
                merged.status = obs.status;
                if obs.primary_ip.is_some() {
                    merged.primary_ip = obs.primary_ip;
                }
                if obs.guest_tools != GuestToolsState::Unknown {
                    merged.guest_tools = obs.guest_tools;
                }
            }
            None => {
                // Known to us, gone on the platform: observed as deleted.
                merged.status = VmStatus::Deleted;
            }
        }

        // Only bump updated_at when an observed field actually moved, so
        // steady-state polling emits no events.
        if serde_json::to_value(&merged)? == serde_json::to_value(&record)? {
            continue;
        }
        merged.updated_at = Utc::now();
        debug!(vm = %merged.vm_id, status = %merged.status, "poll observed change");
        registry
            .upsert(&merged.entity_ref(), &merged, StateChangeSource::Poll)
            .await?;
        merged_count += 1;
    }
    Ok(merged_count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CredentialsBundle, OsFamily, Parameterization, PlatformId, VmSpec};
    use crate::platform::mock::MockPlatform;

    fn vm_spec(name: &str) -> VmSpec {
        VmSpec {
            name: name.into(),
            os_family: OsFamily::Ubuntu,
            os_version: "22.04".into(),
            cores: 2,
            memory_mib: 2048,
            disk_gib: 20,
            networks: vec![],
            ip_policy: None,
            credentials: CredentialsBundle { username: "ubuntu".into(), ..Default::default() },
            post_config: vec![],
            tags: Default::default(),
            priority: 0,
        }
    }

    #[tokio::test]
    async fn poll_merges_status_and_ip_into_records() {
        let platform = MockPlatform::new(PlatformId::from("mock:a"));
        let registry = Registry::in_memory(64);

        let mut record = platform
            .clone_from_template("9000", &vm_spec("web"), &Parameterization::PlatformAssigned)
            .await
            .unwrap();
        record.owner_lab = Some("lab-1".into());
        registry
            .upsert(&record.entity_ref(), &record, StateChangeSource::Orchestrator)
            .await
            .unwrap();

        // Two status polls walk the mock from creating to running.
        platform.get_vm_status(&record.vm_id).await.unwrap();
        platform.get_vm_status(&record.vm_id).await.unwrap();

        let merged = poll_platform_vms(&platform, &registry, None).await.unwrap();
        assert_eq!(merged, 1);
        let stored: VmRecord = registry.get(&record.entity_ref()).await.unwrap().unwrap();
        assert_eq!(stored.status, VmStatus::Running);
        assert!(stored.primary_ip.is_some());
    }

    #[tokio::test]
    async fn steady_state_poll_emits_nothing() {
        let platform = MockPlatform::new(PlatformId::from("mock:a"));
        let registry = Registry::in_memory(64);
        let mut record = platform
            .clone_from_template("9000", &vm_spec("web"), &Parameterization::PlatformAssigned)
            .await
            .unwrap();
        record.owner_lab = Some("lab-1".into());
        registry
            .upsert(&record.entity_ref(), &record, StateChangeSource::Orchestrator)
            .await
            .unwrap();
        platform.get_vm_status(&record.vm_id).await.unwrap();
        platform.get_vm_status(&record.vm_id).await.unwrap();

        poll_platform_vms(&platform, &registry, None).await.unwrap();
        let settled_version = registry.version_of(&record.entity_ref()).await.unwrap();
        poll_platform_vms(&platform, &registry, None).await.unwrap();
        assert_eq!(registry.version_of(&record.entity_ref()).await.unwrap(), settled_version);
    }

    #[tokio::test]
    async fn vanished_vm_is_observed_deleted() {
        let platform = MockPlatform::new(PlatformId::from("mock:a"));
        let registry = Registry::in_memory(64);
        let mut record = platform
            .clone_from_template("9000", &vm_spec("web"), &Parameterization::PlatformAssigned)
            .await
            .unwrap();
        record.owner_lab = Some("lab-1".into());
        registry
            .upsert(&record.entity_ref(), &record, StateChangeSource::Orchestrator)
            .await
            .unwrap();

        platform.delete_vm(&record.vm_id).await.unwrap();
        poll_platform_vms(&platform, &registry, None).await.unwrap();
        let stored: VmRecord = registry.get(&record.entity_ref()).await.unwrap().unwrap();
        assert_eq!(stored.status, VmStatus::Deleted);
    }

    #[tokio::test]
    async fn watch_filter_limits_the_pass() {
        let platform = MockPlatform::new(PlatformId::from("mock:a"));
        let registry = Registry::in_memory(64);
        let mut record = platform
            .clone_from_template("9000", &vm_spec("web"), &Parameterization::PlatformAssigned)
            .await
            .unwrap();
        record.owner_lab = Some("lab-other".into());
        registry
            .upsert(&record.entity_ref(), &record, StateChangeSource::Orchestrator)
            .await
            .unwrap();
        platform.get_vm_status(&record.vm_id).await.unwrap();
        platform.get_vm_status(&record.vm_id).await.unwrap();

        let watched: HashSet<String> = ["lab-1".to_string()].into_iter().collect();
        let merged = poll_platform_vms(&platform, &registry, Some(&watched)).await.unwrap();
        assert_eq!(merged, 0);
    }

    #[tokio::test]
    async fn host_pass_records_reachability() {
        let platform = MockPlatform::new(PlatformId::from("mock:a"));
        let registry = Registry::in_memory(64);
        poll_platform_host(&platform, &registry).await.unwrap();
        let host: HostRecord = registry
            .get(&crate::model::EntityRef::host(&PlatformId::from("mock:a")))
            .await
            .unwrap()
            .unwrap();
        assert!(host.reachable);
        assert!(registry.platform_fresh(&PlatformId::from("mock:a"), 60).await);
    }
}
