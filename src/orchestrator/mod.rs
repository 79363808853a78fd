// src/orchestrator/mod.rs
// Lab orchestration: plan a LabSpec into a task DAG, drive it to READY with
// bounded concurrency and failure isolation, stream every transition into
// the Registry, and tear labs back down in reverse order.

pub mod executor;
pub mod plan;
pub mod postconfig;

use chrono::Utc;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn};

use crate::config::Config;
use crate::errors::{DomeError, DomeResult};
use crate::ippool::IpPool;
use crate::model::{
    GuestToolsState, LabRecord, LabSpec, LabStatus, NetworkMode, NetworkRecord, NetworkSpec,
    PlatformId, StateChangeSource, VmRecord, VmStatus,
};
use crate::platform::{adapter_for, AdapterMap};
use crate::provisioner::{OsProvisioner, GUEST_AGENT_PLAYBOOK};
use crate::registry::Registry;
use crate::ssh::SshPool;
use executor::{run_dag, ExecLimits, TaskOutcome};
use plan::{Plan, ReadinessCriteria, TaskKind, TaskNode};
use postconfig::PostConfigRunner;

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize)]
pub struct LabResult {
    pub lab: LabRecord,
    pub outcomes: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TeardownResult {
    pub lab_id: String,
    pub deleted_vms: usize,
    pub deleted_networks: usize,
    pub errors: Vec<String>,
}

struct DeployCtx {
    lab_id: String,
    platform: PlatformId,
    lab: Mutex<LabRecord>,
    vms: Mutex<HashMap<String, VmRecord>>,
    networks: Mutex<HashMap<String, NetworkRecord>>,
}

pub struct LabOrchestrator {
    adapters: Arc<AdapterMap>,
    provisioner: Arc<OsProvisioner>,
    ip_pool: Arc<IpPool>,
    registry: Arc<Registry>,
    postconfig: PostConfigRunner,
    config: Arc<Config>,
}

impl LabOrchestrator {
    pub fn new(
        adapters: Arc<AdapterMap>,
        provisioner: Arc<OsProvisioner>,
        ip_pool: Arc<IpPool>,
        registry: Arc<Registry>,
        config: Arc<Config>,
    ) -> Self {
        LabOrchestrator {
            adapters,
            provisioner,
            ip_pool,
            registry,
            postconfig: PostConfigRunner::new(&config.postconfig),
            config,
        }
    }

    pub fn plan(&self, spec: &LabSpec) -> DomeResult<Plan> {
        plan::build_plan(spec, &self.config)
    }

    pub async fn deploy_lab(&self, spec: &LabSpec) -> DomeResult<LabResult> {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        self.deploy_lab_with_cancel(spec, cancel_rx).await
    }

    pub async fn deploy_lab_with_cancel(
        &self,
        spec: &LabSpec,
        cancel: watch::Receiver<bool>,
    ) -> DomeResult<LabResult> {
        let deploy_plan = self.plan(spec)?;
        let lab_id = format!("lab-{}", &uuid::Uuid::new_v4().simple().to_string()[..12]);
        info!(%lab_id, lab = %spec.name, tasks = deploy_plan.tasks.len(), "lab planned");

        let mut lab = LabRecord {
            lab_id: lab_id.clone(),
            spec: spec.clone(),
            status: LabStatus::Planning,
            vm_ids: vec![],
            network_ids: vec![],
            start_time: Utc::now(),
            end_time: None,
            deployment_log: vec![],
        };
        self.registry
            .upsert(&lab.entity_ref(), &lab, StateChangeSource::Orchestrator)
            .await?;

        lab.status = LabStatus::Deploying;
        lab.log("plan", format!("{} tasks planned", deploy_plan.tasks.len()));
        self.registry
            .upsert(&lab.entity_ref(), &lab, StateChangeSource::Orchestrator)
            .await?;

        let ctx = DeployCtx {
            lab_id: lab_id.clone(),
            platform: spec.platform.clone(),
            lab: Mutex::new(lab),
            vms: Mutex::new(HashMap::new()),
            networks: Mutex::new(HashMap::new()),
        };
        let limits = ExecLimits {
            vm: self.config.orchestrator.max_concurrency.vm,
            postconfig: self.config.orchestrator.max_concurrency.postconfig,
            retry: self.config.orchestrator.retry_policy(),
        };

        let ctx_ref = &ctx;
        let outcomes = run_dag(&deploy_plan, &limits, cancel.clone(), move |task| {
            self.run_task(ctx_ref, task)
        })
        .await;

        let mut lab = ctx.lab.into_inner();
        let vms = ctx.vms.into_inner();
        let networks = ctx.networks.into_inner();

        let cancelled = outcomes.values().any(|o| *o == TaskOutcome::Cancelled);
        if cancelled {
            lab.log("cancel", "deployment abandoned; best-effort teardown of created resources");
            self.teardown_created(&mut lab, vms.values(), networks.values()).await;
            lab.status = LabStatus::Failed;
            lab.end_time = Some(Utc::now());
        } else {
            let ready_total = outcomes.keys().filter(|id| id.starts_with("ready:")).count();
            let ready_ok = outcomes
                .iter()
                .filter(|(id, o)| id.starts_with("ready:") && o.is_completed())
                .count();
            let pc_total = outcomes.keys().filter(|id| id.starts_with("pc:")).count();
            let pc_ok = outcomes
                .iter()
                .filter(|(id, o)| id.starts_with("pc:") && o.is_completed())
                .count();
            lab.status = if ready_ok == ready_total && pc_ok == pc_total {
                LabStatus::Ready
            } else if ready_ok > 0 {
                LabStatus::Degraded
            } else {
                LabStatus::Failed
            };
            lab.log(
                "settle",
                format!("{ready_ok}/{ready_total} vms ready, {pc_ok}/{pc_total} post-config steps applied"),
            );
        }

        info!(%lab_id, status = %lab.status, "lab settled");
        self.registry
            .upsert(&lab.entity_ref(), &lab, StateChangeSource::Orchestrator)
            .await?;

        Ok(LabResult {
            lab,
            outcomes: outcomes
                .into_iter()
                .map(|(id, outcome)| (id, format!("{outcome:?}")))
                .collect(),
        })
    }

    async fn run_task(&self, ctx: &DeployCtx, task: TaskNode) -> DomeResult<()> {
        match &task.kind {
            TaskKind::EnsureNetwork(network_spec) => self.ensure_network(ctx, &task.id, network_spec).await,
            TaskKind::CreateVm(vm_spec) => self.create_vm(ctx, &task.id, vm_spec).await,
            TaskKind::WaitForReady { vm_name, criteria } => {
                self.wait_for_ready(ctx, &task.id, vm_name, criteria).await
            }
            TaskKind::PostConfig { vm_name, step, index } => {
                self.post_config(ctx, &task.id, vm_name, step, *index).await
            }
            TaskKind::ValidateLab => self.validate_lab(ctx).await,
        }
    }

    async fn ensure_network(&self, ctx: &DeployCtx, task_id: &str, spec: &NetworkSpec) -> DomeResult<()> {
        let adapter = adapter_for(&self.adapters, &ctx.platform)?;
        let mut record = adapter.create_network(spec).await?;
        record.owner_lab = Some(ctx.lab_id.clone());
        self.registry
            .upsert(&record.entity_ref(), &record, StateChangeSource::Orchestrator)
            .await?;
        ctx.networks.lock().await.insert(spec.name.clone(), record.clone());

        let mut lab = ctx.lab.lock().await;
        lab.network_ids.push(record.network_id.clone());
        lab.log(task_id, format!("network {} ({}) up", record.network_id, spec.cidr));
        self.registry
            .upsert(&lab.entity_ref(), &*lab, StateChangeSource::Orchestrator)
            .await?;
        Ok(())
    }

    async fn create_vm(&self, ctx: &DeployCtx, task_id: &str, vm_spec: &crate::model::VmSpec) -> DomeResult<()> {
        let target_network = {
            let lab = ctx.lab.lock().await;
            vm_spec
                .networks
                .first()
                .and_then(|name| lab.spec.networks.iter().find(|n| &n.name == name).cloned())
                .unwrap_or_else(platform_default_network)
        };

        // VLAN tags reach the adapter through the spec's tag map.
        let mut vm_spec = vm_spec.clone();
        if let Some(vlan) = target_network.vlan {
            vm_spec.tags.entry("vlan".to_string()).or_insert_with(|| vlan.to_string());
        }

        let outcome = self
            .provisioner
            .provision(&vm_spec, &ctx.platform, &target_network)
            .await?;
        let mut record = outcome.record;
        record.owner_lab = Some(ctx.lab_id.clone());
        self.registry
            .upsert(&record.entity_ref(), &record, StateChangeSource::Orchestrator)
            .await?;
        ctx.vms.lock().await.insert(vm_spec.name.clone(), record.clone());

        let mut lab = ctx.lab.lock().await;
        lab.vm_ids.push(record.vm_id.clone());
        match &outcome.allocation {
            Some(alloc) if alloc.fallback => {
                lab.log(task_id, format!("vm {} creating at fallback address {}", vm_spec.name, alloc.ip));
            }
            Some(alloc) => {
                lab.log(task_id, format!("vm {} creating at {}", vm_spec.name, alloc.ip));
            }
            None => lab.log(task_id, format!("vm {} creating", vm_spec.name)),
        }
        self.registry
            .upsert(&lab.entity_ref(), &*lab, StateChangeSource::Orchestrator)
            .await?;
        Ok(())
    }

    async fn wait_for_ready(
        &self,
        ctx: &DeployCtx,
        task_id: &str,
        vm_name: &str,
        criteria: &ReadinessCriteria,
    ) -> DomeResult<()> {
        let mut record = {
            let vms = ctx.vms.lock().await;
            vms.get(vm_name)
                .cloned()
                .ok_or_else(|| DomeError::missing(format!("vm '{vm_name}' was never created")))?
        };
        let adapter = adapter_for(&self.adapters, &ctx.platform)?;

        loop {
            match adapter.get_vm_status(&record.vm_id).await? {
                VmStatus::Running => break,
                VmStatus::Error => {
                    return Err(DomeError::permanent(format!("vm '{vm_name}' entered error state during boot")))
                }
                VmStatus::Deleted => {
                    return Err(DomeError::missing(format!("vm '{vm_name}' vanished during boot")))
                }
                _ => tokio::time::sleep(STATUS_POLL_INTERVAL).await,
            }
        }

        match adapter.get_vm_ip(&record.vm_id, criteria.ip_timeout).await {
            Ok(ip) => {
                if let Some(port) = criteria.tcp_probe_port {
                    if !SshPool::probe_tcp(&ip.to_string(), port, Duration::from_secs(10)).await {
                        return Err(DomeError::transient(format!(
                            "vm '{vm_name}' has address {ip} but port {port} is not answering yet"
                        )));
                    }
                }
                record.status = VmStatus::Running;
                record.primary_ip = Some(ip);
                record.guest_tools = GuestToolsState::Running;
                record.updated_at = Utc::now();
                self.registry
                    .upsert(&record.entity_ref(), &record, StateChangeSource::Orchestrator)
                    .await?;
                ctx.vms.lock().await.insert(vm_name.to_string(), record.clone());

                let mut lab = ctx.lab.lock().await;
                lab.log(task_id, format!("vm {vm_name} ready at {ip}"));
                self.registry
                    .upsert(&lab.entity_ref(), &*lab, StateChangeSource::Orchestrator)
                    .await?;
                Ok(())
            }
            Err(err) if err.is_timeout() && criteria.require_guest_agent => {
                // Running but silent: record what is known so the monitor
                // loop can pick the machine up for remediation. Retrying the
                // wait would not make an absent agent appear.
                record.status = VmStatus::Running;
                record.guest_tools = GuestToolsState::Stalled;
                record.updated_at = Utc::now();
                self.registry
                    .upsert(&record.entity_ref(), &record, StateChangeSource::Orchestrator)
                    .await?;
                ctx.vms.lock().await.insert(vm_name.to_string(), record.clone());
                Err(DomeError::permanent(format!(
                    "guest agent on vm '{vm_name}' did not report an address within {:?}",
                    criteria.ip_timeout
                )))
            }
            Err(err) => Err(err),
        }
    }

    async fn post_config(
        &self,
        ctx: &DeployCtx,
        task_id: &str,
        vm_name: &str,
        step: &crate::model::PostConfigStep,
        index: usize,
    ) -> DomeResult<()> {
        let adapter = adapter_for(&self.adapters, &ctx.platform)?;
        let inventory = {
            let vms = ctx.vms.lock().await;
            if !vms.contains_key(vm_name) {
                return Err(DomeError::missing(format!("vm '{vm_name}' was never created")));
            }
            let mut hosts = Vec::new();
            for record in vms.values() {
                if record.primary_ip.is_none() {
                    continue;
                }
                match adapter.connection_hint(record) {
                    Ok(target) => hosts.push((record.clone(), target)),
                    Err(err) => warn!(vm = %record.spec.name, %err, "vm skipped from inventory"),
                }
            }
            PostConfigRunner::build_inventory(&hosts)
        };

        self.postconfig
            .run(&inventory, &step.playbook, &step.vars, Some(vm_name))
            .await?;

        let mut lab = ctx.lab.lock().await;
        lab.log(task_id, format!("playbook {} applied to {vm_name} (step {index})", step.playbook));
        self.registry
            .upsert(&lab.entity_ref(), &*lab, StateChangeSource::Orchestrator)
            .await?;
        Ok(())
    }

    async fn validate_lab(&self, ctx: &DeployCtx) -> DomeResult<()> {
        let vms = ctx.vms.lock().await;
        for record in vms.values() {
            if record.status != VmStatus::Running || record.primary_ip.is_none() {
                return Err(DomeError::permanent(format!(
                    "vm '{}' is {} with ip {:?}; lab cannot be validated",
                    record.spec.name, record.status, record.primary_ip
                )));
            }
        }
        let mut lab = ctx.lab.lock().await;
        lab.log("validate", format!("{} vms running with addresses", vms.len()));
        self.registry
            .upsert(&lab.entity_ref(), &*lab, StateChangeSource::Orchestrator)
            .await?;
        Ok(())
    }

    /// Best-effort cleanup after an abandoned deployment. Failures here are
    /// logged and left for drift detection to reconcile.
    async fn teardown_created<'a>(
        &self,
        lab: &mut LabRecord,
        vms: impl Iterator<Item = &'a VmRecord>,
        networks: impl Iterator<Item = &'a NetworkRecord>,
    ) {
        let adapter = match adapter_for(&self.adapters, &lab.spec.platform) {
            Ok(adapter) => adapter,
            Err(err) => {
                warn!(%err, "no adapter for teardown");
                return;
            }
        };
        for record in vms {
            match adapter.delete_vm(&record.vm_id).await {
                Ok(()) => {
                    self.ip_pool
                        .release_vm(&format!("{}/{}", record.platform_id, record.spec.name))
                        .await;
                    let mut deleted = record.clone();
                    deleted.status = VmStatus::Deleted;
                    deleted.updated_at = Utc::now();
                    let _ = self
                        .registry
                        .upsert(&deleted.entity_ref(), &deleted, StateChangeSource::Orchestrator)
                        .await;
                    lab.log("teardown", format!("vm {} deleted", record.spec.name));
                }
                Err(err) => {
                    warn!(vm = %record.vm_id, %err, "teardown could not delete vm; leaked for reconciliation");
                    lab.log("teardown", format!("vm {} leaked: {err}", record.spec.name));
                }
            }
        }
        for record in networks {
            if let Err(err) = adapter.delete_network(&record.network_id).await {
                warn!(network = %record.network_id, %err, "teardown could not delete network");
                lab.log("teardown", format!("network {} leaked: {err}", record.network_id));
            }
        }
    }

    /// Reverse-order destruction: post-config has nothing to undo, VMs go
    /// first, networks after, addresses return to the pool.
    pub async fn destroy_lab(&self, lab_id: &str) -> DomeResult<TeardownResult> {
        let snapshot = self.registry.snapshot(lab_id).await?;
        let mut lab = snapshot.lab.clone();
        if lab.status == LabStatus::Destroyed {
            return Ok(TeardownResult {
                lab_id: lab_id.to_string(),
                deleted_vms: 0,
                deleted_networks: 0,
                errors: vec![],
            });
        }

        lab.status = LabStatus::Destroying;
        lab.log("destroy", "teardown started");
        self.registry
            .upsert(&lab.entity_ref(), &lab, StateChangeSource::Orchestrator)
            .await?;

        let adapter = adapter_for(&self.adapters, &lab.spec.platform)?;
        let mut errors = Vec::new();
        let mut deleted_vms = 0;
        for record in snapshot.vms.iter().rev() {
            if record.status == VmStatus::Deleted {
                continue;
            }
            match adapter.delete_vm(&record.vm_id).await {
                Ok(()) => {
                    deleted_vms += 1;
                    self.ip_pool
                        .release_vm(&format!("{}/{}", record.platform_id, record.spec.name))
                        .await;
                    let mut deleted = record.clone();
                    deleted.status = VmStatus::Deleted;
                    deleted.updated_at = Utc::now();
                    self.registry
                        .upsert(&deleted.entity_ref(), &deleted, StateChangeSource::Orchestrator)
                        .await?;
                }
                Err(err) => errors.push(format!("vm {}: {err}", record.vm_id)),
            }
        }

        let mut deleted_networks = 0;
        for record in snapshot.networks.iter().rev() {
            match adapter.delete_network(&record.network_id).await {
                Ok(()) => deleted_networks += 1,
                Err(err) => errors.push(format!("network {}: {err}", record.network_id)),
            }
        }

        lab.status = LabStatus::Destroyed;
        lab.end_time = Some(Utc::now());
        lab.log(
            "destroy",
            format!("{deleted_vms} vms and {deleted_networks} networks deleted, {} errors", errors.len()),
        );
        self.registry
            .upsert(&lab.entity_ref(), &lab, StateChangeSource::Orchestrator)
            .await?;

        Ok(TeardownResult {
            lab_id: lab_id.to_string(),
            deleted_vms,
            deleted_networks,
            errors,
        })
    }

    /// Remediation dispatched by the Overseer: a running VM without an agent
    /// gets the install playbook over its intended static address, then IP
    /// discovery is retried and the lab re-settled.
    pub async fn remediate_guest_agent(&self, record: &VmRecord) -> DomeResult<()> {
        let adapter = adapter_for(&self.adapters, &record.platform_id)?;
        let address = record.primary_ip.or(record.expected_ip).ok_or_else(|| {
            DomeError::transient(format!(
                "vm {} has no known address to remediate over",
                record.spec.name
            ))
        })?;

        let mut reachable = record.clone();
        reachable.primary_ip = Some(address);
        let target = adapter.connection_hint(&reachable)?;
        let inventory = PostConfigRunner::build_inventory(&[(reachable.clone(), target)]);
        self.postconfig
            .run(&inventory, GUEST_AGENT_PLAYBOOK, &BTreeMap::new(), Some(&record.spec.name))
            .await?;

        let ip = adapter.get_vm_ip(&record.vm_id, Duration::from_secs(60)).await?;
        let mut updated = record.clone();
        updated.status = VmStatus::Running;
        updated.primary_ip = Some(ip);
        updated.guest_tools = GuestToolsState::Running;
        updated.updated_at = Utc::now();
        self.registry
            .upsert(&updated.entity_ref(), &updated, StateChangeSource::Orchestrator)
            .await?;

        if let Some(lab_id) = &record.owner_lab {
            self.resettle_lab(lab_id).await?;
        }
        Ok(())
    }

    /// Re-evaluate a lab's status from its members (used after remediation).
    pub async fn resettle_lab(&self, lab_id: &str) -> DomeResult<LabStatus> {
        let snapshot = self.registry.snapshot(lab_id).await?;
        let mut lab = snapshot.lab.clone();
        if matches!(lab.status, LabStatus::Destroying | LabStatus::Destroyed) {
            return Ok(lab.status);
        }
        let all_ready = !snapshot.vms.is_empty()
            && snapshot
                .vms
                .iter()
                .all(|vm| vm.status == VmStatus::Running && vm.primary_ip.is_some());
        if all_ready && lab.status != LabStatus::Ready {
            lab.status = LabStatus::Ready;
            lab.log("resettle", "all vms reachable; lab ready");
            self.registry
                .upsert(&lab.entity_ref(), &lab, StateChangeSource::Orchestrator)
                .await?;
        }
        Ok(lab.status)
    }
}

fn platform_default_network() -> NetworkSpec {
    NetworkSpec {
        name: "default".to_string(),
        cidr: "0.0.0.0/0".to_string(),
        mode: NetworkMode::Bridged,
        vlan: None,
        gateway: None,
    }
}
