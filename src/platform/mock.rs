// src/platform/mock.rs
// Deterministic in-memory platform. Backs the `mock` config kind for dry
// runs and gives the orchestrator/overseer tests a platform that honors the
// whole capability contract, including failure injection.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tokio::sync::Mutex;

use async_trait::async_trait;

use crate::config::PlatformKind;
use crate::errors::{DomeError, DomeResult};
use crate::model::{
    GuestToolsState, NetworkRecord, NetworkSpec, Parameterization, PlatformId, SshTarget, VmRecord,
    VmSpec, VmStatus,
};
use crate::platform::{
    ssh_target_for_record, NetworkObservation, PlatformCapability, TemplateInfo, VmFilter,
    VmObservation,
};

struct MockVm {
    name: String,
    spec: VmSpec,
    status: VmStatus,
    ip: Option<IpAddr>,
    has_guest_agent: bool,
    status_polls: u32,
}

struct State {
    next_id: u64,
    vms: HashMap<String, MockVm>,
    networks: HashMap<String, NetworkRecord>,
    templates: Vec<TemplateInfo>,
    tombstones: HashSet<String>,
    fail_next: HashMap<String, VecDeque<DomeError>>,
}

pub struct MockPlatform {
    platform_id: PlatformId,
    state: Mutex<State>,
}

fn template(id: &str, name: &str, tags: &[&str]) -> TemplateInfo {
    let mut map = BTreeMap::new();
    for tag in tags {
        map.insert((*tag).to_string(), "true".to_string());
    }
    TemplateInfo { id: id.to_string(), name: name.to_string(), tags: map }
}

impl MockPlatform {
    pub fn new(platform_id: PlatformId) -> Self {
        MockPlatform {
            platform_id,
            state: Mutex::new(State {
                next_id: 100,
                vms: HashMap::new(),
                networks: HashMap::new(),
                templates: vec![
                    template("9000", "ubuntu-2204-cloudinit", &["guest-agent", "cloud-init"]),
                    template("9050", "kali-2024-cloudinit", &["guest-agent", "cloud-init"]),
                    template("9100", "windows-2022-cloudbase", &["guest-agent", "cloudbase-init"]),
                    template("9900", "ubuntu-2204-noagent", &["cloud-init"]),
                ],
                tombstones: HashSet::new(),
                fail_next: HashMap::new(),
            }),
        }
    }

    /// Queue a failure for the next call of `op` ("clone", "delete_vm", ...).
    pub async fn fail_next(&self, op: &str, err: DomeError) {
        let mut state = self.state.lock().await;
        state.fail_next.entry(op.to_string()).or_default().push_back(err);
    }

    /// Flip the guest agent on, as the remediation playbook would.
    pub async fn install_guest_agent(&self, vm_id: &str) -> DomeResult<()> {
        let mut state = self.state.lock().await;
        let vm = state
            .vms
            .get_mut(vm_id)
            .ok_or_else(|| DomeError::missing(format!("mock vm {vm_id} not found")))?;
        vm.has_guest_agent = true;
        Ok(())
    }

    pub async fn vm_count(&self) -> usize {
        self.state.lock().await.vms.len()
    }

    async fn take_failure(&self, op: &str) -> Option<DomeError> {
        let mut state = self.state.lock().await;
        state.fail_next.get_mut(op).and_then(VecDeque::pop_front)
    }

    fn assigned_ip(id: u64) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(198, 51, 100, (id % 250) as u8 + 1))
    }

    fn make_vm(state: &mut State, spec: &VmSpec, parameterization: &Parameterization, has_guest_agent: bool) -> DomeResult<String> {
        let id = state.next_id;
        state.next_id += 1;
        let vm_id = id.to_string();
        if state.tombstones.contains(&vm_id) {
            return Err(DomeError::permanent(format!("mock vm id {vm_id} was tombstoned this session")));
        }
        let ip = match parameterization.static_ip() {
            Some(config) => {
                let addr = config.address.split('/').next().unwrap_or_default();
                Some(addr.parse::<IpAddr>().map_err(|e| {
                    DomeError::validation(format!("static ip '{}' unparseable: {e}", config.address))
                })?)
            }
            None => Some(Self::assigned_ip(id)),
        };
        state.vms.insert(
            vm_id.clone(),
            MockVm {
                name: spec.name.clone(),
                spec: spec.clone(),
                status: VmStatus::Creating,
                ip,
                has_guest_agent,
                status_polls: 0,
            },
        );
        Ok(vm_id)
    }

    fn record_for(&self, vm_id: String, spec: &VmSpec) -> VmRecord {
        VmRecord {
            vm_id,
            platform_id: self.platform_id.clone(),
            spec: spec.clone(),
            status: VmStatus::Creating,
            primary_ip: None,
            expected_ip: None,
            guest_tools: GuestToolsState::Unknown,
            owner_lab: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            tags: spec.tags.clone(),
            ip_fallback: false,
        }
    }
}

#[async_trait]
impl PlatformCapability for MockPlatform {
    fn platform_id(&self) -> &PlatformId {
        &self.platform_id
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Mock
    }

    async fn ping(&self) -> DomeResult<()> {
        if let Some(err) = self.take_failure("ping").await {
            return Err(err);
        }
        Ok(())
    }

    async fn create_vm(&self, spec: &VmSpec, parameterization: &Parameterization) -> DomeResult<VmRecord> {
        if let Some(err) = self.take_failure("create_vm").await {
            return Err(err);
        }
        let mut state = self.state.lock().await;
        let vm_id = Self::make_vm(&mut state, spec, parameterization, true)?;
        drop(state);
        Ok(self.record_for(vm_id, spec))
    }

    async fn clone_from_template(
        &self,
        template_id: &str,
        spec: &VmSpec,
        parameterization: &Parameterization,
    ) -> DomeResult<VmRecord> {
        if let Some(err) = self.take_failure("clone").await {
            return Err(err);
        }
        let mut state = self.state.lock().await;
        let template = state
            .templates
            .iter()
            .find(|t| t.id == template_id)
            .ok_or_else(|| DomeError::missing(format!("mock template {template_id} not found")))?;
        let has_guest_agent = template.has_tag("guest-agent");
        let vm_id = Self::make_vm(&mut state, spec, parameterization, has_guest_agent)?;
        drop(state);
        Ok(self.record_for(vm_id, spec))
    }

    async fn inject_config(&self, vm_id: &str, _parameterization: &Parameterization) -> DomeResult<()> {
        let state = self.state.lock().await;
        if state.vms.contains_key(vm_id) {
            Ok(())
        } else {
            Err(DomeError::missing(format!("mock vm {vm_id} not found")))
        }
    }

    async fn start_vm(&self, vm_id: &str) -> DomeResult<()> {
        let mut state = self.state.lock().await;
        if let Some(vm) = state.vms.get_mut(vm_id) {
            if vm.status != VmStatus::Running {
                vm.status = VmStatus::Running;
            }
            Ok(())
        } else if state.tombstones.contains(vm_id) {
            Err(DomeError::missing(format!("mock vm {vm_id} is deleted")))
        } else {
            Err(DomeError::missing(format!("mock vm {vm_id} not found")))
        }
    }

    async fn stop_vm(&self, vm_id: &str) -> DomeResult<()> {
        let mut state = self.state.lock().await;
        if let Some(vm) = state.vms.get_mut(vm_id) {
            vm.status = VmStatus::Stopped;
        }
        Ok(())
    }

    async fn reboot_vm(&self, vm_id: &str) -> DomeResult<()> {
        let state = self.state.lock().await;
        if state.vms.contains_key(vm_id) {
            Ok(())
        } else {
            Err(DomeError::missing(format!("mock vm {vm_id} not found")))
        }
    }

    async fn delete_vm(&self, vm_id: &str) -> DomeResult<()> {
        if let Some(err) = self.take_failure("delete_vm").await {
            return Err(err);
        }
        let mut state = self.state.lock().await;
        state.vms.remove(vm_id);
        state.tombstones.insert(vm_id.to_string());
        Ok(())
    }

    async fn get_vm_status(&self, vm_id: &str) -> DomeResult<VmStatus> {
        let mut state = self.state.lock().await;
        if state.tombstones.contains(vm_id) && !state.vms.contains_key(vm_id) {
            return Ok(VmStatus::Deleted);
        }
        let vm = state
            .vms
            .get_mut(vm_id)
            .ok_or_else(|| DomeError::missing(format!("mock vm {vm_id} not found")))?;
        // Creation settles after one observation round, like a real
        // platform's async provisioning.
        vm.status_polls += 1;
        if vm.status == VmStatus::Creating && vm.status_polls > 1 {
            vm.status = VmStatus::Running;
        }
        Ok(vm.status)
    }

    async fn get_vm_ip(&self, vm_id: &str, timeout: Duration) -> DomeResult<IpAddr> {
        if let Some(err) = self.take_failure("get_vm_ip").await {
            return Err(err);
        }
        let (has_agent, ip) = {
            let state = self.state.lock().await;
            let vm = state
                .vms
                .get(vm_id)
                .ok_or_else(|| DomeError::missing(format!("mock vm {vm_id} not found")))?;
            (vm.has_guest_agent, vm.ip)
        };
        if !has_agent {
            // No agent in the guest: discovery can only time out.
            tokio::time::sleep(Duration::from_millis(20).min(timeout)).await;
            return Err(DomeError::timeout(format!("guest-agent ip discovery for vm {vm_id}"), timeout));
        }
        ip.ok_or_else(|| DomeError::timeout(format!("ip discovery for vm {vm_id}"), timeout))
    }

    async fn list_vms(&self, filter: &VmFilter) -> DomeResult<Vec<VmObservation>> {
        let state = self.state.lock().await;
        let mut observations: Vec<VmObservation> = state
            .vms
            .iter()
            .filter(|(_, vm)| match &filter.name_prefix {
                Some(prefix) => vm.name.starts_with(prefix.as_str()),
                None => true,
            })
            .map(|(vm_id, vm)| VmObservation {
                vm_id: vm_id.clone(),
                name: vm.name.clone(),
                status: vm.status,
                primary_ip: if vm.has_guest_agent && vm.status == VmStatus::Running { vm.ip } else { None },
                guest_tools: if vm.has_guest_agent { GuestToolsState::Running } else { GuestToolsState::NotInstalled },
                cores: Some(vm.spec.cores),
                memory_mib: Some(vm.spec.memory_mib),
            })
            .collect();
        observations.sort_by(|a, b| a.vm_id.cmp(&b.vm_id));
        Ok(observations)
    }

    async fn list_templates(&self) -> DomeResult<Vec<TemplateInfo>> {
        Ok(self.state.lock().await.templates.clone())
    }

    async fn list_networks(&self) -> DomeResult<Vec<NetworkObservation>> {
        let state = self.state.lock().await;
        Ok(state
            .networks
            .values()
            .map(|network| NetworkObservation {
                network_id: network.network_id.clone(),
                name: network.name.clone(),
                vlan_tag: network.vlan_tag,
            })
            .collect())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> DomeResult<NetworkRecord> {
        if let Some(err) = self.take_failure("create_network").await {
            return Err(err);
        }
        let mut state = self.state.lock().await;
        let id = state.next_id;
        state.next_id += 1;
        let record = NetworkRecord {
            network_id: format!("net-{id}"),
            platform_id: self.platform_id.clone(),
            name: spec.name.clone(),
            cidr: spec.cidr.clone(),
            gateway: spec.gateway,
            vlan_tag: spec.vlan,
            mode: spec.mode,
            owner_lab: None,
            created_at: Utc::now(),
        };
        state.networks.insert(record.network_id.clone(), record.clone());
        Ok(record)
    }

    async fn delete_network(&self, network_id: &str) -> DomeResult<()> {
        let mut state = self.state.lock().await;
        state.networks.remove(network_id);
        Ok(())
    }

    fn connection_hint(&self, record: &VmRecord) -> DomeResult<SshTarget> {
        ssh_target_for_record(record)
    }

    fn supports_live_install(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CredentialsBundle, OsFamily};

    fn spec(name: &str) -> VmSpec {
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
    async fn clone_then_delete_restores_vm_count() {
        let platform = MockPlatform::new(PlatformId::from("mock:a"));
        let before = platform.vm_count().await;
        let record = platform
            .clone_from_template("9000", &spec("web"), &Parameterization::PlatformAssigned)
            .await
            .unwrap();
        assert_eq!(platform.vm_count().await, before + 1);
        platform.delete_vm(&record.vm_id).await.unwrap();
        assert_eq!(platform.vm_count().await, before);
        // Idempotent: a second delete is a no-op success.
        platform.delete_vm(&record.vm_id).await.unwrap();
    }

    #[tokio::test]
    async fn creating_settles_to_running_under_observation() {
        let platform = MockPlatform::new(PlatformId::from("mock:a"));
        let record = platform
            .clone_from_template("9000", &spec("web"), &Parameterization::PlatformAssigned)
            .await
            .unwrap();
        assert_eq!(platform.get_vm_status(&record.vm_id).await.unwrap(), VmStatus::Creating);
        assert_eq!(platform.get_vm_status(&record.vm_id).await.unwrap(), VmStatus::Running);
    }

    #[tokio::test]
    async fn agentless_template_times_out_on_ip_discovery() {
        let platform = MockPlatform::new(PlatformId::from("mock:a"));
        let record = platform
            .clone_from_template("9900", &spec("web"), &Parameterization::PlatformAssigned)
            .await
            .unwrap();
        let err = platform
            .get_vm_ip(&record.vm_id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        // Remediation installs the agent and discovery succeeds.
        platform.install_guest_agent(&record.vm_id).await.unwrap();
        platform.get_vm_ip(&record.vm_id, Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn injected_failures_surface_once() {
        let platform = MockPlatform::new(PlatformId::from("mock:a"));
        platform.fail_next("clone", DomeError::transient("api blip")).await;
        let err = platform
            .clone_from_template("9000", &spec("web"), &Parameterization::PlatformAssigned)
            .await
            .unwrap_err();
        assert!(err.is_transient());
        platform
            .clone_from_template("9000", &spec("web"), &Parameterization::PlatformAssigned)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn unknown_template_is_resource_missing() {
        let platform = MockPlatform::new(PlatformId::from("mock:a"));
        let err = platform
            .clone_from_template("4242", &spec("web"), &Parameterization::PlatformAssigned)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "resource_missing");
    }
}
