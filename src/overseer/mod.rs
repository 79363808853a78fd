// src/overseer/mod.rs
// The resident supervisor. Gates every incoming request, executes approved
// ones with per-resource serialization, reconciles drift, watches lab
// health, and persists its session across restarts. Four loops (monitor,
// execute, sync, health) run under a restarting supervisor.

pub mod gate;
pub mod knowledge;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::errors::{DomeError, DomeResult};
use crate::ippool::IpPool;
use crate::model::{
    ApprovalState, DriftResolution, EntityKind, EntityRef, GuestToolsState, LabRecord, LabStatus,
    Request, RequestKind, StateChangeSource, VmActionKind, VmRecord, VmStatus,
};
use crate::orchestrator::LabOrchestrator;
use crate::platform::{adapter_for, AdapterMap};
use crate::registry::poller::{self, WatchSet};
use crate::registry::Registry;
use gate::Gate;
use knowledge::KnowledgeIndex;

const REQUEST_HISTORY_CAP: usize = 100;
const SUPERVISOR_BACKOFF_BASE: Duration = Duration::from_secs(1);
const SUPERVISOR_BACKOFF_CAP: Duration = Duration::from_secs(60);

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SessionStats {
    pub submitted: u64,
    pub approved: u64,
    pub denied: u64,
    pub completed: u64,
    pub failed: u64,
    pub remediations: u64,
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct SessionState {
    stats: SessionStats,
    /// Most recent first, capped.
    history: VecDeque<Request>,
    /// Approved but not yet executed; re-enqueued on startup.
    pending: Vec<Request>,
    watched_labs: HashSet<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OverseerHealth {
    pub at: DateTime<Utc>,
    pub queue_depth: usize,
    pub loop_ticks: BTreeMap<String, DateTime<Utc>>,
    pub platforms_reachable: BTreeMap<String, bool>,
    pub stats: SessionStats,
}

#[derive(Serialize, Debug, Clone)]
pub struct OverseerStatus {
    pub stats: SessionStats,
    pub watched_labs: Vec<String>,
    pub pending_requests: usize,
    pub loop_ticks: BTreeMap<String, DateTime<Utc>>,
}

pub struct Overseer {
    registry: Arc<Registry>,
    adapters: Arc<AdapterMap>,
    orchestrator: Arc<LabOrchestrator>,
    ip_pool: Arc<IpPool>,
    knowledge: Arc<KnowledgeIndex>,
    config: Arc<Config>,
    watch_set: WatchSet,
    queue_tx: mpsc::Sender<Request>,
    queue_rx: Mutex<Option<mpsc::Receiver<Request>>>,
    state_path: PathBuf,
    session: Mutex<SessionState>,
    resource_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    loop_ticks: Mutex<BTreeMap<String, DateTime<Utc>>>,
    alerted: Mutex<HashSet<String>>,
}

pub struct OverseerHandle {
    cancel_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl OverseerHandle {
    pub fn shutdown(self) {
        let _ = self.cancel_tx.send(true);
        for task in self.tasks {
            task.abort();
        }
    }
}

impl Overseer {
    pub async fn new(
        registry: Arc<Registry>,
        adapters: Arc<AdapterMap>,
        orchestrator: Arc<LabOrchestrator>,
        ip_pool: Arc<IpPool>,
        knowledge: Arc<KnowledgeIndex>,
        config: Arc<Config>,
    ) -> DomeResult<Arc<Self>> {
        let persistence_dir = config.registry.persistence_dir();
        let state_path = persistence_dir
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| persistence_dir.clone())
            .join("overseer_state.json");

        let (queue_tx, queue_rx) = mpsc::channel(config.overseer.request_queue_depth.max(1));

        let session = match tokio::fs::read_to_string(&state_path).await {
            Ok(raw) => match serde_json::from_str::<SessionState>(&raw) {
                Ok(session) => {
                    info!(path = %state_path.display(), requests = session.pending.len(), "overseer state rehydrated");
                    session
                }
                Err(err) => {
                    warn!(%err, "overseer state unreadable; starting fresh");
                    SessionState::default()
                }
            },
            Err(_) => SessionState::default(),
        };

        let watch_set: WatchSet = Arc::new(tokio::sync::RwLock::new(session.watched_labs.clone()));
        for request in &session.pending {
            // Rehydrated approved work goes straight back on the queue.
            let _ = queue_tx.try_send(request.clone());
        }

        Ok(Arc::new(Overseer {
            registry,
            adapters,
            orchestrator,
            ip_pool,
            knowledge,
            config,
            watch_set,
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            state_path,
            session: Mutex::new(session),
            resource_locks: Mutex::new(HashMap::new()),
            loop_ticks: Mutex::new(BTreeMap::new()),
            alerted: Mutex::new(HashSet::new()),
        }))
    }

    pub fn watch_set(&self) -> WatchSet {
        Arc::clone(&self.watch_set)
    }

    /// Plan-time validation of a lab spec, without submitting anything.
    pub fn validate_spec(&self, spec: &crate::model::LabSpec) -> DomeResult<()> {
        self.orchestrator.plan(spec).map(|_| ())
    }

    /// Gate a request. Approved requests are enqueued for the Execute loop;
    /// denials come back terminal with a structured reason.
    pub async fn submit(&self, mut request: Request) -> DomeResult<Request> {
        {
            let mut session = self.session.lock().await;
            session.stats.submitted += 1;
        }
        let gate = Gate {
            registry: self.registry.as_ref(),
            knowledge: self.knowledge.as_ref(),
            config: &self.config.overseer,
        };
        match gate.evaluate(&request).await {
            Ok(()) => {
                request.transition(ApprovalState::Approved)?;
                {
                    let mut session = self.session.lock().await;
                    session.stats.approved += 1;
                    session.pending.push(request.clone());
                }
                self.record_request(&request).await?;
                if let Err(err) = self.queue_tx.send(request.clone()).await {
                    return Err(DomeError::transient(format!("request queue unavailable: {err}")));
                }
            }
            Err(denial) => {
                request.denial_reason = Some(denial);
                request.transition(ApprovalState::Denied)?;
                {
                    let mut session = self.session.lock().await;
                    session.stats.denied += 1;
                }
                self.record_request(&request).await?;
            }
        }
        Ok(request)
    }

    /// Gate and execute synchronously (the CLI path). The request does not
    /// travel through the queue.
    pub async fn submit_and_wait(&self, request: Request) -> DomeResult<Request> {
        {
            let mut session = self.session.lock().await;
            session.stats.submitted += 1;
        }
        let gate = Gate {
            registry: self.registry.as_ref(),
            knowledge: self.knowledge.as_ref(),
            config: &self.config.overseer,
        };
        let mut request = request;
        match gate.evaluate(&request).await {
            Ok(()) => {
                request.transition(ApprovalState::Approved)?;
                {
                    let mut session = self.session.lock().await;
                    session.stats.approved += 1;
                }
                self.record_request(&request).await?;
                let executed = self.dispatch(request).await;
                Ok(executed)
            }
            Err(denial) => {
                request.denial_reason = Some(denial);
                request.transition(ApprovalState::Denied)?;
                {
                    let mut session = self.session.lock().await;
                    session.stats.denied += 1;
                }
                self.record_request(&request).await?;
                Ok(request)
            }
        }
    }

    /// Execute one approved request under its per-resource lock.
    async fn dispatch(&self, mut request: Request) -> Request {
        let lock = {
            let mut locks = self.resource_locks.lock().await;
            Arc::clone(
                locks
                    .entry(request.kind.target_key())
                    .or_insert_with(|| Arc::new(Mutex::new(()))),
            )
        };
        let _guard = lock.lock().await;

        if request.transition(ApprovalState::Executing).is_err() {
            return request;
        }
        let _ = self.record_request(&request).await;

        let result = self.execute_kind(&request.kind).await;
        match result {
            Ok(()) => {
                let _ = request.transition(ApprovalState::Completed);
                let mut session = self.session.lock().await;
                session.stats.completed += 1;
            }
            Err(err) => {
                request.failure = Some(err.to_string());
                let _ = request.transition(ApprovalState::Failed);
                let mut session = self.session.lock().await;
                session.stats.failed += 1;
            }
        }
        {
            let mut session = self.session.lock().await;
            session.pending.retain(|r| r.request_id != request.request_id);
        }
        let _ = self.record_request(&request).await;
        request
    }

    async fn execute_kind(&self, kind: &RequestKind) -> DomeResult<()> {
        match kind {
            RequestKind::DeployLab { spec } => {
                let result = self.orchestrator.deploy_lab(spec).await?;
                self.watch_set.write().await.insert(result.lab.lab_id.clone());
                {
                    let mut session = self.session.lock().await;
                    session.watched_labs.insert(result.lab.lab_id.clone());
                }
                match result.lab.status {
                    LabStatus::Ready | LabStatus::Degraded => Ok(()),
                    status => Err(DomeError::permanent(format!(
                        "lab {} settled {status}",
                        result.lab.lab_id
                    ))),
                }
            }
            RequestKind::DestroyLab { lab_id, .. } => {
                let result = self.orchestrator.destroy_lab(lab_id).await?;
                self.watch_set.write().await.remove(lab_id);
                {
                    let mut session = self.session.lock().await;
                    session.watched_labs.remove(lab_id);
                }
                if result.errors.is_empty() {
                    Ok(())
                } else {
                    Err(DomeError::transient(format!(
                        "teardown left {} resources behind: {}",
                        result.errors.len(),
                        result.errors.join("; ")
                    )))
                }
            }
            RequestKind::VmAction { platform_id, vm_id, action, .. } => {
                let adapter = adapter_for(&self.adapters, platform_id)?;
                match action {
                    VmActionKind::Start => adapter.start_vm(vm_id).await,
                    VmActionKind::Stop => adapter.stop_vm(vm_id).await,
                    VmActionKind::Reboot => adapter.reboot_vm(vm_id).await,
                    VmActionKind::Delete => {
                        adapter.delete_vm(vm_id).await?;
                        let entity = EntityRef::vm(platform_id, vm_id);
                        if let Some(mut record) = self.registry.get::<VmRecord>(&entity).await? {
                            self.ip_pool
                                .release_vm(&format!("{platform_id}/{}", record.spec.name))
                                .await;
                            record.status = VmStatus::Deleted;
                            record.updated_at = Utc::now();
                            self.registry
                                .upsert(&entity, &record, StateChangeSource::Orchestrator)
                                .await?;
                        }
                        Ok(())
                    }
                }
            }
            RequestKind::ReconcileDrift { entity_ref } => self.reconcile(entity_ref).await,
            RequestKind::Alert { subject, message, .. } => {
                // The request record itself is the alert artifact; it is
                // already persisted and published through the Registry.
                warn!(subject = %subject, %message, "alert raised");
                Ok(())
            }
        }
    }

    /// Drift policy: a VM the orchestrator expects RUNNING that polling sees
    /// STOPPED is re-asserted; everything else adopts the observed state.
    async fn reconcile(&self, entity: &EntityRef) -> DomeResult<()> {
        let drifts = self.registry.pending_drifts().await;
        for drift in drifts.iter().filter(|d| &d.entity_ref == entity) {
            if drift.field == "status"
                && drift.expected == serde_json::json!("running")
                && drift.observed == serde_json::json!("stopped")
            {
                if entity.kind == EntityKind::Vm {
                    if let Some((platform_raw, vm_id)) = entity.id.rsplit_once('/') {
                        let platform = crate::model::PlatformId(platform_raw.to_string());
                        if let Ok(adapter) = adapter_for(&self.adapters, &platform) {
                            info!(entity = %entity, "re-asserting expected running state");
                            adapter.start_vm(vm_id).await?;
                        }
                    }
                }
            }
            // Observed values already live in the Registry via the poll
            // upsert; adopting them needs no further write.
        }
        self.registry.resolve_drifts(entity, DriftResolution::Reconciled).await;
        Ok(())
    }

    async fn record_request(&self, request: &Request) -> DomeResult<()> {
        {
            let mut session = self.session.lock().await;
            session.history.retain(|r| r.request_id != request.request_id);
            session.history.push_front(request.clone());
            session.history.truncate(REQUEST_HISTORY_CAP);
        }
        self.registry
            .upsert(&request.entity_ref(), request, StateChangeSource::Orchestrator)
            .await?;
        self.persist().await
    }

    /// Overseer state is written on every transition and rehydrated on
    /// startup.
    async fn persist(&self) -> DomeResult<()> {
        let body = {
            let session = self.session.lock().await;
            serde_json::to_vec_pretty(&*session)?
        };
        if let Some(parent) = self.state_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.state_path, body).await?;
        Ok(())
    }

    pub async fn status(&self) -> OverseerStatus {
        let session = self.session.lock().await;
        OverseerStatus {
            stats: session.stats.clone(),
            watched_labs: {
                let mut labs: Vec<String> = session.watched_labs.iter().cloned().collect();
                labs.sort();
                labs
            },
            pending_requests: session.pending.len(),
            loop_ticks: self.loop_ticks.lock().await.clone(),
        }
    }

    pub async fn request_history(&self) -> Vec<Request> {
        self.session.lock().await.history.iter().cloned().collect()
    }

    // ------------------------------------------------------------------
    // Loops

    /// Start the four loops. A supervisor restarts any loop that exits or
    /// panics, with exponential backoff.
    pub fn spawn_loops(self: &Arc<Self>) -> OverseerHandle {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(supervise("monitor", cancel_rx.clone(), {
            let overseer = Arc::clone(self);
            let cancel = cancel_rx.clone();
            move || {
                let overseer = Arc::clone(&overseer);
                let cancel = cancel.clone();
                async move { overseer.monitor_loop(cancel).await }
            }
        }));
        tasks.push(supervise("execute", cancel_rx.clone(), {
            let overseer = Arc::clone(self);
            let cancel = cancel_rx.clone();
            move || {
                let overseer = Arc::clone(&overseer);
                let cancel = cancel.clone();
                async move { overseer.execute_loop(cancel).await }
            }
        }));
        tasks.push(supervise("sync", cancel_rx.clone(), {
            let overseer = Arc::clone(self);
            let cancel = cancel_rx.clone();
            move || {
                let overseer = Arc::clone(&overseer);
                let cancel = cancel.clone();
                async move { overseer.sync_loop(cancel).await }
            }
        }));
        tasks.push(supervise("health", cancel_rx, {
            let overseer = Arc::clone(self);
            let health_cancel = cancel_tx.subscribe();
            move || {
                let overseer = Arc::clone(&overseer);
                let cancel = health_cancel.clone();
                async move { overseer.health_loop(cancel).await }
            }
        }));

        OverseerHandle { cancel_tx, tasks }
    }

    async fn monitor_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.overseer.loop_intervals.monitor_s.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.changed() => return,
            }
            self.monitor_tick().await;
        }
    }

    /// One monitor pass: find unhealthy labs/VMs, consult the knowledge
    /// index, auto-remediate where policy permits, alert otherwise.
    pub async fn monitor_tick(&self) {
        self.loop_ticks.lock().await.insert("monitor".to_string(), Utc::now());

        let labs: Vec<LabRecord> = self.registry.list(EntityKind::Lab).await;
        let vms: Vec<VmRecord> = self.registry.list(EntityKind::Vm).await;

        for lab in labs.iter().filter(|lab| {
            matches!(
                lab.status,
                LabStatus::Deploying | LabStatus::Ready | LabStatus::Degraded | LabStatus::Failed
            )
        }) {
            for vm in vms.iter().filter(|vm| vm.owner_lab.as_deref() == Some(lab.lab_id.as_str())) {
                let silent = vm.status == VmStatus::Running
                    && vm.primary_ip.is_none()
                    && vm.guest_tools != GuestToolsState::Running;
                if silent {
                    let context = self.knowledge.query(
                        &format!("vm running without address guest agent {}", vm.spec.os_family),
                        3,
                    );
                    if self.config.overseer.auto_remediate {
                        info!(vm = %vm.spec.name, lab = %lab.lab_id, "auto-remediating silent vm");
                        match self.orchestrator.remediate_guest_agent(vm).await {
                            Ok(()) => {
                                let mut session = self.session.lock().await;
                                session.stats.remediations += 1;
                            }
                            Err(err) => {
                                warn!(vm = %vm.spec.name, %err, "auto-remediation failed");
                                self.raise_alert(vm, &context, &err.to_string()).await;
                            }
                        }
                    } else {
                        self.raise_alert(vm, &context, "vm running without a reachable address").await;
                    }
                }
            }

            if !self
                .registry
                .platform_fresh(&lab.spec.platform, self.config.overseer.freshness_horizon_s)
                .await
            {
                let key = format!("stale:{}", lab.spec.platform);
                let mut alerted = self.alerted.lock().await;
                if alerted.insert(key) {
                    drop(alerted);
                    let request = Request::new(
                        RequestKind::Alert {
                            subject: EntityRef::host(&lab.spec.platform),
                            message: format!(
                                "platform {} has not polled within the freshness horizon",
                                lab.spec.platform
                            ),
                            context: vec![],
                        },
                        "overseer",
                        crate::model::Role::Admin,
                    );
                    let _ = self.submit(request).await;
                }
            }
        }

        // Drift records become reconcile requests, one per entity.
        for drift in self.registry.pending_drifts().await {
            let key = format!("drift:{}", drift.entity_ref);
            let mut alerted = self.alerted.lock().await;
            if alerted.insert(key) {
                drop(alerted);
                let request = Request::new(
                    RequestKind::ReconcileDrift { entity_ref: drift.entity_ref.clone() },
                    "overseer",
                    crate::model::Role::Admin,
                );
                let _ = self.submit(request).await;
            }
        }
    }

    async fn raise_alert(&self, vm: &VmRecord, context: &[knowledge::ScoredPassage], message: &str) {
        let key = format!("alert:{}:{message}", vm.entity_ref());
        let mut alerted = self.alerted.lock().await;
        if !alerted.insert(key) {
            return;
        }
        drop(alerted);
        let request = Request::new(
            RequestKind::Alert {
                subject: vm.entity_ref(),
                message: message.to_string(),
                context: context.iter().map(|p| format!("{}: {}", p.doc, p.text)).collect(),
            },
            "overseer",
            crate::model::Role::Admin,
        );
        let _ = self.submit(request).await;
    }

    async fn execute_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut queue_rx = match self.queue_rx.lock().await.take() {
            Some(rx) => rx,
            None => {
                error!("execute loop started twice; refusing to run");
                return;
            }
        };
        loop {
            let request = tokio::select! {
                request = queue_rx.recv() => request,
                _ = cancel.changed() => {
                    // Hand the receiver back so a supervised restart can resume.
                    *self.queue_rx.lock().await = Some(queue_rx);
                    return;
                }
            };
            self.loop_ticks.lock().await.insert("execute".to_string(), Utc::now());
            match request {
                Some(request) => {
                    let finished = self.dispatch(request).await;
                    info!(request = %finished.request_id, state = %finished.approval_state, "request settled");
                }
                None => return,
            }
        }
    }

    async fn sync_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.overseer.loop_intervals.sync_s.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.changed() => return,
            }
            self.sync_tick().await;
        }
    }

    /// Top up the Registry for watched labs that fell behind tier-1 cadence.
    pub async fn sync_tick(&self) {
        self.loop_ticks.lock().await.insert("sync".to_string(), Utc::now());
        let watched = self.watch_set.read().await.clone();
        if watched.is_empty() {
            return;
        }
        for adapter in self.adapters.values() {
            if let Err(err) =
                poller::poll_platform_vms(adapter.as_ref(), &self.registry, Some(&watched)).await
            {
                warn!(platform = %adapter.platform_id(), %err, "sync pass failed");
            }
        }
    }

    async fn health_loop(self: Arc<Self>, mut cancel: watch::Receiver<bool>) {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.overseer.loop_intervals.health_s.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.changed() => return,
            }
            if let Err(err) = self.health_tick().await {
                warn!(%err, "health publication failed");
            }
        }
    }

    /// Self-check: queue depth, loop tick ages, platform reachability.
    pub async fn health_tick(&self) -> DomeResult<()> {
        self.loop_ticks.lock().await.insert("health".to_string(), Utc::now());
        let mut platforms_reachable = BTreeMap::new();
        for adapter in self.adapters.values() {
            platforms_reachable.insert(
                adapter.platform_id().to_string(),
                adapter.ping().await.is_ok(),
            );
        }
        let health = OverseerHealth {
            at: Utc::now(),
            queue_depth: self.queue_tx.max_capacity() - self.queue_tx.capacity(),
            loop_ticks: self.loop_ticks.lock().await.clone(),
            platforms_reachable,
            stats: self.session.lock().await.stats.clone(),
        };
        self.registry
            .upsert(&EntityRef::overseer(), &health, StateChangeSource::Orchestrator)
            .await?;
        self.persist().await
    }
}

/// Restart a loop whenever it exits or panics, backing off exponentially.
fn supervise<F, Fut>(name: &'static str, mut cancel: watch::Receiver<bool>, factory: F) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut backoff = SUPERVISOR_BACKOFF_BASE;
        loop {
            if *cancel.borrow() {
                return;
            }
            let started = tokio::time::Instant::now();
            let handle = tokio::spawn(factory());
            match handle.await {
                Ok(()) => {
                    if *cancel.borrow() {
                        return;
                    }
                    warn!(loop_name = name, "loop exited unexpectedly; restarting");
                }
                Err(err) if err.is_panic() => {
                    error!(loop_name = name, "loop panicked; restarting");
                }
                Err(_) => return,
            }
            if started.elapsed() > Duration::from_secs(300) {
                backoff = SUPERVISOR_BACKOFF_BASE;
            }
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = cancel.changed() => return,
            }
            backoff = (backoff * 2).min(SUPERVISOR_BACKOFF_CAP);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpPoolConfig;
    use crate::model::{CredentialsBundle, LabSpec, NetworkMode, NetworkSpec, OsFamily, Role, VmSpec};
    use crate::platform::mock::MockPlatform;
    use crate::platform::PlatformCapability;
    use crate::provisioner::OsProvisioner;
    use std::collections::BTreeMap;

    struct Rig {
        platform: Arc<MockPlatform>,
        registry: Arc<Registry>,
        overseer: Arc<Overseer>,
        _state_dir: tempfile::TempDir,
    }

    async fn rig() -> Rig {
        let state_dir = tempfile::tempdir().unwrap();
        let platform_id = crate::model::PlatformId::from("mock:a");
        let platform = Arc::new(MockPlatform::new(platform_id.clone()));
        let mut adapters: crate::platform::AdapterMap = HashMap::new();
        adapters.insert(
            platform_id.clone(),
            platform.clone() as Arc<dyn crate::platform::PlatformCapability>,
        );
        let adapters = Arc::new(adapters);
        let registry = Arc::new(Registry::in_memory(256));
        registry.record_poll(&platform_id).await;

        let mut config = Config::default();
        config.postconfig.executor = "true".into();
        config.registry.persistence_path = state_dir.path().join("registry").to_string_lossy().into_owned();
        let config = Arc::new(config);

        let ip_pool = Arc::new(
            IpPool::from_config(&[IpPoolConfig {
                cidr: "10.101.0.0/24".into(),
                range_start: "10.101.0.30".parse().unwrap(),
                range_end: "10.101.0.40".parse().unwrap(),
                gateway: "10.101.0.1".parse().unwrap(),
                dns: vec![],
            }])
            .unwrap(),
        );
        let provisioner = Arc::new(OsProvisioner::new(Arc::clone(&adapters), Arc::clone(&ip_pool), &config));
        let orchestrator = Arc::new(LabOrchestrator::new(
            Arc::clone(&adapters),
            provisioner,
            Arc::clone(&ip_pool),
            Arc::clone(&registry),
            Arc::clone(&config),
        ));
        let overseer = Overseer::new(
            Arc::clone(&registry),
            adapters,
            orchestrator,
            ip_pool,
            Arc::new(KnowledgeIndex::empty()),
            config,
        )
        .await
        .unwrap();
        Rig { platform, registry, overseer, _state_dir: state_dir }
    }

    fn vm(name: &str) -> VmSpec {
        VmSpec {
            name: name.into(),
            os_family: OsFamily::Ubuntu,
            os_version: "22.04".into(),
            cores: 2,
            memory_mib: 2048,
            disk_gib: 20,
            networks: vec!["lan".into()],
            ip_policy: None,
            credentials: CredentialsBundle {
                username: "ubuntu".into(),
                ssh_public_key: Some("ssh-ed25519 AAAA lab".into()),
                ssh_private_key_path: Some("~/.ssh/id_lab".into()),
                ..Default::default()
            },
            post_config: vec![],
            tags: BTreeMap::new(),
            priority: 0,
        }
    }

    fn lab_spec(name: &str, vms: Vec<VmSpec>, production: bool) -> LabSpec {
        let mut tags = BTreeMap::new();
        if production {
            tags.insert("production".to_string(), "true".to_string());
        }
        LabSpec {
            name: name.into(),
            platform: crate::model::PlatformId::from("mock:a"),
            networks: vec![NetworkSpec {
                name: "lan".into(),
                cidr: "10.101.0.0/24".into(),
                mode: NetworkMode::Isolated,
                vlan: Some(101),
                gateway: None,
            }],
            vms,
            tags,
        }
    }

    #[tokio::test]
    async fn deploy_request_executes_to_completion() {
        let rig = rig().await;
        let request = Request::new(
            RequestKind::DeployLab { spec: lab_spec("demo", vec![vm("web")], false) },
            "alice",
            Role::Operator,
        );
        let finished = rig.overseer.submit_and_wait(request).await.unwrap();
        assert_eq!(finished.approval_state, ApprovalState::Completed);

        let status = rig.overseer.status().await;
        assert_eq!(status.stats.completed, 1);
        assert_eq!(status.watched_labs.len(), 1);

        // The lab really is READY in the registry.
        let labs: Vec<LabRecord> = rig.registry.list(EntityKind::Lab).await;
        assert_eq!(labs.len(), 1);
        assert_eq!(labs[0].status, LabStatus::Ready);
    }

    #[tokio::test]
    async fn production_destroy_denied_then_forced_through() {
        let rig = rig().await;
        let deploy = Request::new(
            RequestKind::DeployLab { spec: lab_spec("prod", vec![vm("web")], true) },
            "alice",
            Role::Operator,
        );
        let deployed = rig.overseer.submit_and_wait(deploy).await.unwrap();
        assert_eq!(deployed.approval_state, ApprovalState::Completed);
        let lab_id = rig.overseer.status().await.watched_labs[0].clone();

        let before = rig.platform.vm_count().await;
        let destroy = Request::new(
            RequestKind::DestroyLab { lab_id: lab_id.clone(), force_production: false },
            "alice",
            Role::Admin,
        );
        let denied = rig.overseer.submit_and_wait(destroy).await.unwrap();
        assert_eq!(denied.approval_state, ApprovalState::Denied);
        assert_eq!(denied.denial_reason.as_ref().unwrap().rule, "production_protected");
        // No platform operation happened.
        assert_eq!(rig.platform.vm_count().await, before);

        let forced = Request::new(
            RequestKind::DestroyLab { lab_id, force_production: true },
            "alice",
            Role::Admin,
        );
        let done = rig.overseer.submit_and_wait(forced).await.unwrap();
        assert_eq!(done.approval_state, ApprovalState::Completed);
        assert_eq!(rig.platform.vm_count().await, 0);
    }

    #[tokio::test]
    async fn monitor_remediates_silent_vm_and_lab_recovers() {
        let rig = rig().await;
        let mut web = vm("web");
        web.os_version = "22.04-noagent".into();
        let request = Request::new(
            RequestKind::DeployLab { spec: lab_spec("quiet", vec![web], false) },
            "alice",
            Role::Operator,
        );
        let finished = rig.overseer.submit_and_wait(request).await.unwrap();
        // The lab settles without its VM reachable.
        assert_eq!(finished.approval_state, ApprovalState::Failed);

        let vms: Vec<VmRecord> = rig.registry.list(EntityKind::Vm).await;
        assert_eq!(vms.len(), 1);
        assert!(vms[0].primary_ip.is_none());

        // The remediation playbook's effect on the guest, simulated.
        rig.platform.install_guest_agent(&vms[0].vm_id).await.unwrap();
        rig.overseer.monitor_tick().await;

        let vms: Vec<VmRecord> = rig.registry.list(EntityKind::Vm).await;
        assert!(vms[0].primary_ip.is_some());
        let labs: Vec<LabRecord> = rig.registry.list(EntityKind::Lab).await;
        assert_eq!(labs[0].status, LabStatus::Ready);
        assert_eq!(rig.overseer.status().await.stats.remediations, 1);
    }

    #[tokio::test]
    async fn drift_becomes_a_reconcile_request_and_reasserts_state() {
        let rig = rig().await;
        let request = Request::new(
            RequestKind::DeployLab { spec: lab_spec("drifty", vec![vm("web")], false) },
            "alice",
            Role::Operator,
        );
        rig.overseer.submit_and_wait(request).await.unwrap();

        let vms: Vec<VmRecord> = rig.registry.list(EntityKind::Vm).await;
        let record = &vms[0];
        // Someone stops the VM out of band; the poller observes it.
        rig.platform.stop_vm(&record.vm_id).await.unwrap();
        poller::poll_platform_vms(rig.platform.as_ref(), &rig.registry, None)
            .await
            .unwrap();
        assert!(!rig.registry.pending_drifts().await.is_empty());

        // Monitor turns the drift into a queued reconcile request; run it.
        rig.overseer.monitor_tick().await;
        let mut queue_rx = rig.overseer.queue_rx.lock().await.take().unwrap();
        let queued = queue_rx.recv().await.unwrap();
        assert!(matches!(queued.kind, RequestKind::ReconcileDrift { .. }));
        let settled = rig.overseer.dispatch(queued).await;
        assert_eq!(settled.approval_state, ApprovalState::Completed);

        // Expected-running was re-asserted and the drift closed.
        assert_eq!(
            rig.platform.get_vm_status(&record.vm_id).await.unwrap(),
            VmStatus::Running
        );
        assert!(rig.registry.pending_drifts().await.is_empty());
    }

    #[tokio::test]
    async fn session_state_survives_restart() {
        let state_dir = tempfile::tempdir().unwrap();
        let platform_id = crate::model::PlatformId::from("mock:a");
        let build = |state_dir: &std::path::Path| {
            let platform = Arc::new(MockPlatform::new(platform_id.clone()));
            let mut adapters: crate::platform::AdapterMap = HashMap::new();
            adapters.insert(
                platform_id.clone(),
                platform as Arc<dyn crate::platform::PlatformCapability>,
            );
            let adapters = Arc::new(adapters);
            let registry = Arc::new(Registry::in_memory(64));
            let mut config = Config::default();
            config.postconfig.executor = "true".into();
            config.registry.persistence_path =
                state_dir.join("registry").to_string_lossy().into_owned();
            let config = Arc::new(config);
            let ip_pool = Arc::new(IpPool::from_config(&[]).unwrap());
            let provisioner =
                Arc::new(OsProvisioner::new(Arc::clone(&adapters), Arc::clone(&ip_pool), &config));
            let orchestrator = Arc::new(LabOrchestrator::new(
                Arc::clone(&adapters),
                provisioner,
                Arc::clone(&ip_pool),
                Arc::clone(&registry),
                Arc::clone(&config),
            ));
            (registry, adapters, orchestrator, ip_pool, config)
        };

        {
            let (registry, adapters, orchestrator, ip_pool, config) = build(state_dir.path());
            let overseer = Overseer::new(
                registry,
                adapters,
                orchestrator,
                ip_pool,
                Arc::new(KnowledgeIndex::empty()),
                config,
            )
            .await
            .unwrap();
            // A denied request lands in history and on disk.
            let request = Request::new(
                RequestKind::DestroyLab { lab_id: "lab-ghost".into(), force_production: false },
                "alice",
                Role::Viewer,
            );
            let denied = overseer.submit_and_wait(request).await.unwrap();
            assert_eq!(denied.approval_state, ApprovalState::Denied);
        }

        let (registry, adapters, orchestrator, ip_pool, config) = build(state_dir.path());
        let overseer = Overseer::new(
            registry,
            adapters,
            orchestrator,
            ip_pool,
            Arc::new(KnowledgeIndex::empty()),
            config,
        )
        .await
        .unwrap();
        let history = overseer.request_history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].approval_state, ApprovalState::Denied);
        assert_eq!(overseer.status().await.stats.denied, 1);
    }
}
