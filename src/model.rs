// src/model.rs
// Core data model: specs, records, requests, events, drift. The Registry
// exclusively owns the record types; components pass specs and hold
// transient handles only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::IpAddr;

use crate::errors::{DomeError, DomeResult};

/// Opaque platform identifier, e.g. "proxmox:pve01" or "aws:us-east-1".
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(transparent)]
pub struct PlatformId(pub String);

impl PlatformId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PlatformId {
    fn from(s: &str) -> Self {
        PlatformId(s.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Lab,
    Vm,
    Network,
    Host,
    Request,
    Overseer,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Lab => "lab",
            EntityKind::Vm => "vm",
            EntityKind::Network => "network",
            EntityKind::Host => "host",
            EntityKind::Request => "request",
            EntityKind::Overseer => "overseer",
        }
    }
}

/// Stable address of an entity in the Registry, rendered as `kind:id`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityRef {
    pub kind: EntityKind,
    pub id: String,
}

impl EntityRef {
    pub fn new(kind: EntityKind, id: impl Into<String>) -> Self {
        EntityRef { kind, id: id.into() }
    }

    pub fn lab(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Lab, id)
    }

    pub fn vm(platform: &PlatformId, vm_id: &str) -> Self {
        Self::new(EntityKind::Vm, format!("{}/{}", platform, vm_id))
    }

    pub fn network(platform: &PlatformId, network_id: &str) -> Self {
        Self::new(EntityKind::Network, format!("{}/{}", platform, network_id))
    }

    pub fn host(platform: &PlatformId) -> Self {
        Self::new(EntityKind::Host, platform.as_str().to_string())
    }

    pub fn request(id: impl Into<String>) -> Self {
        Self::new(EntityKind::Request, id)
    }

    pub fn overseer() -> Self {
        Self::new(EntityKind::Overseer, "overseer".to_string())
    }

    /// Parse `kind:id`; the id may itself contain colons (platform ids do).
    pub fn parse(s: &str) -> DomeResult<Self> {
        let (kind, id) = s
            .split_once(':')
            .ok_or_else(|| DomeError::validation(format!("entity ref '{s}' is not of the form kind:id")))?;
        let kind = match kind {
            "lab" => EntityKind::Lab,
            "vm" => EntityKind::Vm,
            "network" => EntityKind::Network,
            "host" => EntityKind::Host,
            "request" => EntityKind::Request,
            "overseer" => EntityKind::Overseer,
            other => {
                return Err(DomeError::validation(format!("unknown entity kind '{other}' in ref '{s}'")))
            }
        };
        if id.is_empty() {
            return Err(DomeError::validation(format!("entity ref '{s}' has an empty id")));
        }
        Ok(EntityRef { kind, id: id.to_string() })
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

// ---------------------------------------------------------------------------
// VM specs and records

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Ubuntu,
    Debian,
    Kali,
    Windows,
    Pfsense,
}

impl OsFamily {
    pub fn is_windows(&self) -> bool {
        matches!(self, OsFamily::Windows)
    }
}

impl fmt::Display for OsFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OsFamily::Ubuntu => "ubuntu",
            OsFamily::Debian => "debian",
            OsFamily::Kali => "kali",
            OsFamily::Windows => "windows",
            OsFamily::Pfsense => "pfsense",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IpPolicy {
    /// Static address from a configured pool; mandatory on isolated on-prem networks.
    StaticPool,
    Dhcp,
    PlatformAssigned,
}

/// Credentials handed to the guest bootstrapper. SSH public key is mandatory
/// for Linux cloud-init templates (password auth is disabled in base images).
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CredentialsBundle {
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssh_public_key: Option<String>,
    #[serde(default)]
    pub ssh_private_key_path: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct PostConfigStep {
    pub playbook: String,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    /// Other VM names in the lab that must be ready before this step runs.
    #[serde(default)]
    pub requires: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VmSpec {
    pub name: String,
    pub os_family: OsFamily,
    pub os_version: String,
    pub cores: u32,
    pub memory_mib: u64,
    pub disk_gib: u64,
    /// Names of networks (from the owning LabSpec) this VM attaches to.
    pub networks: Vec<String>,
    #[serde(default)]
    pub ip_policy: Option<IpPolicy>,
    pub credentials: CredentialsBundle,
    #[serde(default)]
    pub post_config: Vec<PostConfigStep>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    /// Tie-break priority among simultaneously ready tasks; lower runs first.
    #[serde(default)]
    pub priority: i32,
}

impl VmSpec {
    /// Inventory grouping for post-config ("web_servers" etc.).
    pub fn purpose(&self) -> Option<&str> {
        self.tags.get("purpose").map(String::as_str)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Pending,
    Creating,
    Running,
    Stopped,
    Error,
    Deleted,
}

impl VmStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, VmStatus::Deleted)
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VmStatus::Pending => "pending",
            VmStatus::Creating => "creating",
            VmStatus::Running => "running",
            VmStatus::Stopped => "stopped",
            VmStatus::Error => "error",
            VmStatus::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum GuestToolsState {
    #[default]
    Unknown,
    NotInstalled,
    Running,
    Stalled,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VmRecord {
    /// Platform-unique id (integer-as-string on hypervisor nodes, opaque in clouds).
    pub vm_id: String,
    pub platform_id: PlatformId,
    pub spec: VmSpec,
    pub status: VmStatus,
    #[serde(default)]
    pub primary_ip: Option<IpAddr>,
    /// Address the lab intends the VM to hold (static allocations); kept
    /// separate from the observed primary_ip.
    #[serde(default)]
    pub expected_ip: Option<IpAddr>,
    #[serde(default)]
    pub guest_tools: GuestToolsState,
    #[serde(default)]
    pub owner_lab: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub ip_fallback: bool,
}

impl VmRecord {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::vm(&self.platform_id, &self.vm_id)
    }

    pub fn is_production(&self) -> bool {
        self.tags.get("production").map(String::as_str) == Some("true")
    }
}

// ---------------------------------------------------------------------------
// Networks

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    Isolated,
    Routed,
    Bridged,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NetworkSpec {
    pub name: String,
    pub cidr: String,
    pub mode: NetworkMode,
    #[serde(default)]
    pub vlan: Option<u16>,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NetworkRecord {
    pub network_id: String,
    pub platform_id: PlatformId,
    pub name: String,
    pub cidr: String,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub vlan_tag: Option<u16>,
    pub mode: NetworkMode,
    #[serde(default)]
    pub owner_lab: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NetworkRecord {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::network(&self.platform_id, &self.network_id)
    }
}

// ---------------------------------------------------------------------------
// Labs

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LabSpec {
    pub name: String,
    pub platform: PlatformId,
    #[serde(default)]
    pub networks: Vec<NetworkSpec>,
    pub vms: Vec<VmSpec>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LabStatus {
    Planning,
    Deploying,
    Degraded,
    Ready,
    Destroying,
    Destroyed,
    Failed,
}

impl fmt::Display for LabStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LabStatus::Planning => "planning",
            LabStatus::Deploying => "deploying",
            LabStatus::Degraded => "degraded",
            LabStatus::Ready => "ready",
            LabStatus::Destroying => "destroying",
            LabStatus::Destroyed => "destroyed",
            LabStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DeploymentLogEntry {
    pub at: DateTime<Utc>,
    pub task: String,
    pub message: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LabRecord {
    pub lab_id: String,
    pub spec: LabSpec,
    pub status: LabStatus,
    #[serde(default)]
    pub vm_ids: Vec<String>,
    #[serde(default)]
    pub network_ids: Vec<String>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub deployment_log: Vec<DeploymentLogEntry>,
}

impl LabRecord {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::lab(self.lab_id.clone())
    }

    pub fn is_production(&self) -> bool {
        self.spec.tags.get("production").map(String::as_str) == Some("true")
    }

    pub fn log(&mut self, task: impl Into<String>, message: impl Into<String>) {
        self.deployment_log.push(DeploymentLogEntry {
            at: Utc::now(),
            task: task.into(),
            message: message.into(),
        });
    }
}

// ---------------------------------------------------------------------------
// Hosts (platforms as seen by pollers)

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HostRecord {
    pub platform_id: PlatformId,
    pub kind: String,
    pub reachable: bool,
    #[serde(default)]
    pub last_successful_poll: Option<DateTime<Utc>>,
    #[serde(default)]
    pub vm_count: usize,
    #[serde(default)]
    pub network_count: usize,
}

impl HostRecord {
    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::host(&self.platform_id)
    }
}

// ---------------------------------------------------------------------------
// Requests

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Viewer,
    Operator,
    Admin,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VmActionKind {
    Start,
    Stop,
    Reboot,
    Delete,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestKind {
    DeployLab {
        spec: LabSpec,
    },
    DestroyLab {
        lab_id: String,
        #[serde(default)]
        force_production: bool,
    },
    VmAction {
        platform_id: PlatformId,
        vm_id: String,
        action: VmActionKind,
        #[serde(default)]
        force_production: bool,
    },
    ReconcileDrift {
        entity_ref: EntityRef,
    },
    Alert {
        subject: EntityRef,
        message: String,
        #[serde(default)]
        context: Vec<String>,
    },
}

impl RequestKind {
    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::DeployLab { .. } => "deploy_lab",
            RequestKind::DestroyLab { .. } => "destroy_lab",
            RequestKind::VmAction { .. } => "vm_action",
            RequestKind::ReconcileDrift { .. } => "reconcile_drift",
            RequestKind::Alert { .. } => "alert",
        }
    }

    pub fn is_destructive(&self) -> bool {
        matches!(
            self,
            RequestKind::DestroyLab { .. }
                | RequestKind::VmAction { action: VmActionKind::Delete | VmActionKind::Stop | VmActionKind::Reboot, .. }
        )
    }

    pub fn is_creation(&self) -> bool {
        matches!(self, RequestKind::DeployLab { .. })
    }

    pub fn force_production(&self) -> bool {
        match self {
            RequestKind::DestroyLab { force_production, .. } => *force_production,
            RequestKind::VmAction { force_production, .. } => *force_production,
            _ => false,
        }
    }

    pub fn min_role(&self) -> Role {
        match self {
            RequestKind::Alert { .. } => Role::Viewer,
            RequestKind::DeployLab { .. } | RequestKind::ReconcileDrift { .. } => Role::Operator,
            RequestKind::DestroyLab { .. } | RequestKind::VmAction { .. } => Role::Admin,
        }
    }

    /// Serialization key for the Execute loop: one request at a time per resource.
    pub fn target_key(&self) -> String {
        match self {
            RequestKind::DeployLab { spec } => format!("lab:{}", spec.name),
            RequestKind::DestroyLab { lab_id, .. } => format!("lab:{lab_id}"),
            RequestKind::VmAction { platform_id, vm_id, .. } => format!("vm:{platform_id}/{vm_id}"),
            RequestKind::ReconcileDrift { entity_ref } => entity_ref.to_string(),
            RequestKind::Alert { subject, .. } => subject.to_string(),
        }
    }

    /// Platform this request ultimately talks to, when statically known.
    pub fn platform(&self) -> Option<&PlatformId> {
        match self {
            RequestKind::DeployLab { spec } => Some(&spec.platform),
            RequestKind::VmAction { platform_id, .. } => Some(platform_id),
            _ => None,
        }
    }

    /// Stable fingerprint used for knowledge-index incident lookup.
    pub fn fingerprint(&self) -> String {
        format!("{} {}", self.name(), self.target_key())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalState {
    Pending,
    Approved,
    Denied,
    Executing,
    Completed,
    Failed,
}

impl ApprovalState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ApprovalState::Denied | ApprovalState::Completed | ApprovalState::Failed)
    }
}

impl fmt::Display for ApprovalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ApprovalState::Pending => "pending",
            ApprovalState::Approved => "approved",
            ApprovalState::Denied => "denied",
            ApprovalState::Executing => "executing",
            ApprovalState::Completed => "completed",
            ApprovalState::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DenialReason {
    pub rule: String,
    pub message: String,
    #[serde(default)]
    pub remediation: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Request {
    pub request_id: String,
    pub kind: RequestKind,
    pub requester: String,
    pub requester_role: Role,
    pub created_at: DateTime<Utc>,
    pub approval_state: ApprovalState,
    #[serde(default)]
    pub denial_reason: Option<DenialReason>,
    #[serde(default)]
    pub failure: Option<String>,
}

impl Request {
    pub fn new(kind: RequestKind, requester: impl Into<String>, role: Role) -> Self {
        Request {
            request_id: uuid::Uuid::new_v4().to_string(),
            kind,
            requester: requester.into(),
            requester_role: role,
            created_at: Utc::now(),
            approval_state: ApprovalState::Pending,
            denial_reason: None,
            failure: None,
        }
    }

    pub fn entity_ref(&self) -> EntityRef {
        EntityRef::request(self.request_id.clone())
    }

    /// Requests never leave a terminal state.
    pub fn transition(&mut self, next: ApprovalState) -> DomeResult<()> {
        if self.approval_state.is_terminal() {
            return Err(DomeError::validation(format!(
                "request {} is already {} and cannot become {}",
                self.request_id, self.approval_state, next
            )));
        }
        self.approval_state = next;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Events, drift, allocations

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StateChangeSource {
    Orchestrator,
    Poll,
    Manual,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StateChange {
    pub entity_ref: EntityRef,
    /// Strictly increasing per entity_ref.
    pub version: u64,
    #[serde(default)]
    pub prev: Option<serde_json::Value>,
    pub next: serde_json::Value,
    pub detected_at: DateTime<Utc>,
    pub source: StateChangeSource,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DriftResolution {
    Pending,
    Reconciled,
    Ignored,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DriftRecord {
    pub entity_ref: EntityRef,
    pub field: String,
    pub expected: serde_json::Value,
    pub observed: serde_json::Value,
    pub detected_at: DateTime<Utc>,
    pub resolution: DriftResolution,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct IpAllocation {
    pub cidr: String,
    pub ip: IpAddr,
    pub vm_ref: String,
    pub allocated_at: DateTime<Utc>,
    /// True when the address came from the broadcast−1 fallback rule.
    #[serde(default)]
    pub fallback: bool,
}

// ---------------------------------------------------------------------------
// Remote execution targets

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum SshAuth {
    Password { password: String },
    Key { private_key: String },
    KeyFile { path: String },
}

/// Connection metadata an adapter produces for post-config inventory.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
}

fn default_ssh_port() -> u16 {
    22
}

// ---------------------------------------------------------------------------
// Guest bootstrap parameterization

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct StaticIpConfig {
    /// Address in CIDR form, e.g. "10.101.0.30/24".
    pub address: String,
    pub gateway: String,
    #[serde(default)]
    pub nameservers: Vec<String>,
}

/// The opaque guest-bootstrap payload the provisioner hands to an adapter.
/// Platform-specific fields stay inside the variant the adapter consumes.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Parameterization {
    LinuxCloudInit {
        username: String,
        user_data: String,
        ssh_public_key: String,
        #[serde(default)]
        static_ip: Option<StaticIpConfig>,
        #[serde(default)]
        nameservers: Vec<String>,
    },
    WindowsCloudbaseInit {
        admin_username: String,
        admin_password: String,
        meta_data: String,
        user_data: String,
        conf: String,
        #[serde(default)]
        static_ip: Option<StaticIpConfig>,
    },
    WindowsAutounattend {
        xml: String,
    },
    PlatformAssigned,
}

impl Parameterization {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Parameterization::LinuxCloudInit { .. } => "linux_cloud_init",
            Parameterization::WindowsCloudbaseInit { .. } => "windows_cloudbase_init",
            Parameterization::WindowsAutounattend { .. } => "windows_autounattend",
            Parameterization::PlatformAssigned => "platform_assigned",
        }
    }

    pub fn static_ip(&self) -> Option<&StaticIpConfig> {
        match self {
            Parameterization::LinuxCloudInit { static_ip, .. } => static_ip.as_ref(),
            Parameterization::WindowsCloudbaseInit { static_ip, .. } => static_ip.as_ref(),
            _ => None,
        }
    }
}
