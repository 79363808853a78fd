// src/platform/mod.rs
// The uniform capability contract every VM-lifecycle platform implements.
// Lab orchestration, OS provisioning, and post-configuration are written
// against this trait and nothing else.

pub mod cloud;
pub mod esxi;
pub mod mock;
pub mod proxmox;
pub mod ratelimit;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, PlatformKind};
use crate::errors::{DomeError, DomeResult};
use crate::model::{
    GuestToolsState, NetworkRecord, NetworkSpec, Parameterization, PlatformId, SshTarget, VmRecord,
    VmSpec, VmStatus,
};
use crate::secrets::SecretsContext;
use crate::ssh::SshPool;

/// A template the platform can clone from.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TemplateInfo {
    pub id: String,
    pub name: String,
    /// Capability tags, e.g. "guest-agent", "cloudbase-init", "virtio-baked".
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl TemplateInfo {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.get(tag).map(String::as_str) == Some("true")
    }
}

/// What a polling pass sees for one VM. Thinner than a VmRecord: the
/// Registry merges observations into its authoritative records.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VmObservation {
    pub vm_id: String,
    pub name: String,
    pub status: VmStatus,
    #[serde(default)]
    pub primary_ip: Option<IpAddr>,
    #[serde(default)]
    pub guest_tools: GuestToolsState,
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default)]
    pub memory_mib: Option<u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NetworkObservation {
    pub network_id: String,
    pub name: String,
    #[serde(default)]
    pub vlan_tag: Option<u16>,
}

#[derive(Debug, Clone, Default)]
pub struct VmFilter {
    /// Match VM names by prefix (lab-scoped names share one).
    pub name_prefix: Option<String>,
}

/// Capability contract for one platform family (§ one hypervisor node or one
/// cloud region). All operations are idempotent with respect to
/// already-terminal states; transient platform errors surface as Transient.
#[async_trait]
pub trait PlatformCapability: Send + Sync {
    fn platform_id(&self) -> &PlatformId;
    fn kind(&self) -> PlatformKind;

    /// Cheap reachability check used by gating and pollers.
    async fn ping(&self) -> DomeResult<()>;

    /// Slow path: create a VM from scratch (live-image install). Adapters
    /// that cannot do this return Permanent and advertise it via
    /// `supports_live_install`.
    async fn create_vm(&self, spec: &VmSpec, parameterization: &Parameterization) -> DomeResult<VmRecord>;

    /// Fast path: clone a template and parameterize the guest bootstrap.
    async fn clone_from_template(
        &self,
        template_id: &str,
        spec: &VmSpec,
        parameterization: &Parameterization,
    ) -> DomeResult<VmRecord>;

    /// Post-creation injection of userdata before boot, where supported.
    async fn inject_config(&self, vm_id: &str, parameterization: &Parameterization) -> DomeResult<()>;

    async fn start_vm(&self, vm_id: &str) -> DomeResult<()>;
    async fn stop_vm(&self, vm_id: &str) -> DomeResult<()>;
    async fn reboot_vm(&self, vm_id: &str) -> DomeResult<()>;
    async fn delete_vm(&self, vm_id: &str) -> DomeResult<()>;

    async fn get_vm_status(&self, vm_id: &str) -> DomeResult<VmStatus>;

    /// Discover the primary IP through the platform's guest-integration
    /// channel. Never assumes DHCP on an isolated on-prem network; if the
    /// guest agent stays silent the result is a Transient timeout.
    async fn get_vm_ip(&self, vm_id: &str, timeout: Duration) -> DomeResult<IpAddr>;

    async fn list_vms(&self, filter: &VmFilter) -> DomeResult<Vec<VmObservation>>;
    async fn list_templates(&self) -> DomeResult<Vec<TemplateInfo>>;
    async fn list_networks(&self) -> DomeResult<Vec<NetworkObservation>>;

    async fn create_network(&self, spec: &NetworkSpec) -> DomeResult<NetworkRecord>;
    async fn delete_network(&self, network_id: &str) -> DomeResult<()>;

    /// Connection metadata for post-config inventory entries.
    fn connection_hint(&self, record: &VmRecord) -> DomeResult<SshTarget>;

    fn supports_live_install(&self) -> bool {
        false
    }
}

pub type AdapterMap = HashMap<PlatformId, Arc<dyn PlatformCapability>>;

/// Build one adapter per configured platform. Wiring happens here, at the
/// composition root; nothing else constructs adapters.
pub fn build_adapters(
    config: &Config,
    secrets: &SecretsContext,
    ssh_pool: Arc<SshPool>,
) -> DomeResult<AdapterMap> {
    let mut adapters: AdapterMap = HashMap::new();
    for platform in &config.platforms {
        let id = PlatformId(platform.id.clone());
        let adapter: Arc<dyn PlatformCapability> = match platform.kind {
            PlatformKind::Proxmox => {
                Arc::new(proxmox::ProxmoxAdapter::new(platform, secrets.get(&platform.credentials_ref)?)?)
            }
            PlatformKind::Esxi => Arc::new(esxi::EsxiAdapter::new(
                platform,
                secrets.get(&platform.credentials_ref)?,
                Arc::clone(&ssh_pool),
            )?),
            PlatformKind::Aws | PlatformKind::Azure | PlatformKind::Gcp => Arc::new(
                cloud::CloudAdapter::new(platform, secrets.get(&platform.credentials_ref)?)?,
            ),
            PlatformKind::Mock => Arc::new(mock::MockPlatform::new(id.clone())),
        };
        adapters.insert(id, adapter);
    }
    Ok(adapters)
}

pub fn adapter_for<'a>(adapters: &'a AdapterMap, platform: &PlatformId) -> DomeResult<&'a Arc<dyn PlatformCapability>> {
    adapters
        .get(platform)
        .ok_or_else(|| DomeError::missing(format!("no adapter registered for platform '{platform}'")))
}

/// Connection credentials a spec implies, shared by the on-prem adapters.
pub(crate) fn ssh_target_for_record(record: &VmRecord) -> DomeResult<SshTarget> {
    let ip = record
        .primary_ip
        .ok_or_else(|| DomeError::transient(format!("vm {} has no primary ip yet", record.vm_id)))?;
    let creds = &record.spec.credentials;
    let auth = if let Some(path) = &creds.ssh_private_key_path {
        crate::model::SshAuth::KeyFile { path: path.clone() }
    } else if let Some(password) = &creds.password {
        crate::model::SshAuth::Password { password: password.clone() }
    } else {
        return Err(DomeError::validation(format!(
            "vm {} has neither an ssh key path nor a password for post-config",
            record.spec.name
        )));
    };
    Ok(SshTarget {
        host: ip.to_string(),
        port: 22,
        username: creds.username.clone(),
        auth,
    })
}
