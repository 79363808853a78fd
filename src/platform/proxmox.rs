// src/platform/proxmox.rs
// Proxmox-style hypervisor adapter. VMs are cloned from template VMs by
// integer id; guest bootstrap rides the cloud-init drive; IP discovery goes
// through the QEMU guest agent.

use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use async_trait::async_trait;

use crate::config::{PlatformConfig, PlatformKind};
use crate::errors::{DomeError, DomeResult};
use crate::model::{
    GuestToolsState, NetworkMode, NetworkRecord, NetworkSpec, Parameterization, PlatformId,
    SshTarget, VmRecord, VmSpec, VmStatus,
};
use crate::platform::ratelimit::TokenBucket;
use crate::platform::{
    ssh_target_for_record, NetworkObservation, PlatformCapability, TemplateInfo, VmFilter,
    VmObservation,
};
use crate::secrets::PlatformCredentials;

const TASK_POLL_INTERVAL: Duration = Duration::from_secs(1);
const TASK_TIMEOUT: Duration = Duration::from_secs(120);
const AGENT_POLL_INTERVAL: Duration = Duration::from_secs(3);

enum Auth {
    Token { header: String },
    Password { username: String, password: String },
}

struct Ticket {
    cookie: String,
    csrf: String,
}

pub struct ProxmoxAdapter {
    platform_id: PlatformId,
    http: reqwest::Client,
    endpoint: String,
    node: String,
    storage: String,
    auth: Auth,
    ticket: Mutex<Option<Ticket>>,
    bucket: TokenBucket,
    tombstones: Mutex<HashSet<String>>,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    data: Option<T>,
}

#[derive(Deserialize)]
struct VmListItem {
    vmid: u64,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    template: Option<u8>,
    #[serde(default)]
    cpus: Option<f64>,
    #[serde(default)]
    maxmem: Option<u64>,
}

impl ProxmoxAdapter {
    pub fn new(config: &PlatformConfig, credentials: &PlatformCredentials) -> DomeResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;

        let auth = match (&credentials.token_id, &credentials.token_secret) {
            (Some(token_id), Some(token_secret)) => Auth::Token {
                header: format!("PVEAPIToken={token_id}={token_secret}"),
            },
            _ => {
                let username = credentials.username.clone().ok_or_else(|| {
                    DomeError::validation(format!(
                        "platform '{}' credentials need token_id/token_secret or username/password",
                        config.id
                    ))
                })?;
                let password = credentials.password.clone().ok_or_else(|| {
                    DomeError::validation(format!("platform '{}' credentials missing password", config.id))
                })?;
                Auth::Password { username, password }
            }
        };

        let node = config.default_node.clone().ok_or_else(|| {
            DomeError::validation(format!("platform '{}' requires default_node", config.id))
        })?;

        Ok(ProxmoxAdapter {
            platform_id: PlatformId(config.id.clone()),
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            node,
            storage: config.default_storage.clone().unwrap_or_else(|| "local-lvm".to_string()),
            auth,
            ticket: Mutex::new(None),
            bucket: TokenBucket::new(config.rate_limit),
            tombstones: Mutex::new(HashSet::new()),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}/api2/json{path}", self.endpoint)
    }

    async fn login(&self) -> DomeResult<()> {
        let (username, password) = match &self.auth {
            Auth::Password { username, password } => (username.clone(), password.clone()),
            Auth::Token { .. } => return Ok(()),
        };

        #[derive(Deserialize)]
        struct TicketData {
            ticket: String,
            #[serde(rename = "CSRFPreventionToken")]
            csrf: String,
        }

        let mut params = HashMap::new();
        params.insert("username", username);
        params.insert("password", password);
        let response = self
            .http
            .post(self.api_url("/access/ticket"))
            .form(&params)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DomeError::permanent_coded(
                format!("proxmox auth failed: {}", response.status()),
                response.status().as_str().to_string(),
            ));
        }
        let body: ApiResponse<TicketData> = response.json().await?;
        let data = body
            .data
            .ok_or_else(|| DomeError::permanent("proxmox auth returned no ticket"))?;
        *self.ticket.lock().await = Some(Ticket {
            cookie: format!("PVEAuthCookie={}", data.ticket),
            csrf: data.csrf,
        });
        Ok(())
    }

    async fn apply_auth(&self, builder: reqwest::RequestBuilder, mutating: bool) -> DomeResult<reqwest::RequestBuilder> {
        match &self.auth {
            Auth::Token { header } => Ok(builder.header("Authorization", header.clone())),
            Auth::Password { .. } => {
                if self.ticket.lock().await.is_none() {
                    self.login().await?;
                }
                let guard = self.ticket.lock().await;
                let ticket = guard.as_ref().ok_or_else(|| DomeError::transient("proxmox ticket unavailable"))?;
                let mut builder = builder.header("Cookie", ticket.cookie.clone());
                if mutating {
                    builder = builder.header("CSRFPreventionToken", ticket.csrf.clone());
                }
                Ok(builder)
            }
        }
    }

    async fn api_get(&self, path: &str) -> DomeResult<serde_json::Value> {
        self.bucket.acquire().await;
        let builder = self.http.get(self.api_url(path));
        let builder = self.apply_auth(builder, false).await?;
        let response = builder.send().await?;
        Self::handle_response(path, response).await
    }

    async fn api_form(&self, method: reqwest::Method, path: &str, params: &HashMap<String, String>) -> DomeResult<serde_json::Value> {
        self.bucket.acquire().await;
        let builder = self.http.request(method, self.api_url(path)).form(params);
        let builder = self.apply_auth(builder, true).await?;
        let response = builder.send().await?;
        Self::handle_response(path, response).await
    }

    async fn api_delete(&self, path: &str) -> DomeResult<serde_json::Value> {
        self.bucket.acquire().await;
        let builder = self.http.delete(self.api_url(path));
        let builder = self.apply_auth(builder, true).await?;
        let response = builder.send().await?;
        Self::handle_response(path, response).await
    }

    async fn handle_response(path: &str, response: reqwest::Response) -> DomeResult<serde_json::Value> {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            let value: serde_json::Value = serde_json::from_str(&text)
                .map_err(|e| DomeError::permanent(format!("proxmox {path}: unparseable response: {e}")))?;
            return Ok(value.get("data").cloned().unwrap_or(serde_json::Value::Null));
        }
        let message = format!("proxmox {path}: {status}: {}", text.trim());
        match status.as_u16() {
            429 | 500..=599 => Err(DomeError::transient_coded(message, status.as_str().to_string())),
            404 => Err(DomeError::missing(message)),
            401 | 403 => Err(DomeError::permanent_coded(message, status.as_str().to_string())),
            _ => Err(DomeError::permanent_coded(message, status.as_str().to_string())),
        }
    }

    /// Block until a PVE task UPID finishes; clone and delete are async
    /// server-side.
    async fn wait_for_task(&self, upid: &str) -> DomeResult<()> {
        let deadline = tokio::time::Instant::now() + TASK_TIMEOUT;
        loop {
            if tokio::time::Instant::now() >= deadline {
                return Err(DomeError::timeout(format!("proxmox task {upid}"), TASK_TIMEOUT));
            }
            let status = self
                .api_get(&format!("/nodes/{}/tasks/{}/status", self.node, urlencode(upid)))
                .await?;
            let state = status.get("status").and_then(|v| v.as_str()).unwrap_or("running");
            if state == "stopped" {
                let exit = status.get("exitstatus").and_then(|v| v.as_str()).unwrap_or("OK");
                if exit == "OK" {
                    return Ok(());
                }
                return Err(DomeError::permanent(format!("proxmox task {upid} failed: {exit}")));
            }
            tokio::time::sleep(TASK_POLL_INTERVAL).await;
        }
    }

    async fn next_vm_id(&self) -> DomeResult<String> {
        let data = self.api_get("/cluster/nextid").await?;
        let id = data
            .as_str()
            .map(str::to_string)
            .or_else(|| data.as_u64().map(|n| n.to_string()))
            .ok_or_else(|| DomeError::permanent("proxmox /cluster/nextid returned no id"))?;
        let tombstones = self.tombstones.lock().await;
        if tombstones.contains(&id) {
            return Err(DomeError::permanent(format!(
                "proxmox handed out vm id {id} which this session already tombstoned"
            )));
        }
        Ok(id)
    }

    fn disk_slot(spec: &VmSpec) -> &'static str {
        // Windows guests need a controller that works without driver
        // injection unless VirtIO drivers are baked into the template.
        if spec.os_family.is_windows() {
            "sata0"
        } else {
            "scsi0"
        }
    }

    fn net0_value(spec: &VmSpec, vlan: Option<u16>) -> String {
        let model = if spec.os_family.is_windows() { "e1000" } else { "virtio" };
        match vlan {
            Some(tag) => format!("{model},bridge=vmbr0,tag={tag}"),
            None => format!("{model},bridge=vmbr0"),
        }
    }

    fn cloudinit_params(parameterization: &Parameterization, params: &mut HashMap<String, String>) -> DomeResult<()> {
        match parameterization {
            Parameterization::LinuxCloudInit {
                username,
                ssh_public_key,
                static_ip,
                nameservers,
                ..
            } => {
                params.insert("ciuser".into(), username.clone());
                // Password auth is disabled in the base images; the public
                // key must ride the sshkeys field, base64-encoded.
                let encoded = base64::engine::general_purpose::STANDARD.encode(ssh_public_key.as_bytes());
                params.insert("sshkeys".into(), encoded);
                match static_ip {
                    Some(ip) => {
                        params.insert("ipconfig0".into(), format!("ip={},gw={}", ip.address, ip.gateway));
                    }
                    None => {
                        params.insert("ipconfig0".into(), "ip=dhcp".into());
                    }
                }
                if !nameservers.is_empty() {
                    params.insert("nameserver".into(), nameservers.join(" "));
                }
            }
            Parameterization::WindowsCloudbaseInit {
                admin_username,
                admin_password,
                static_ip,
                ..
            } => {
                // The template carries cloudbase-init pre-sysprep; the
                // cloud-init drive is presented to it as a ConfigDrive.
                params.insert("ciuser".into(), admin_username.clone());
                params.insert("cipassword".into(), admin_password.clone());
                match static_ip {
                    Some(ip) => {
                        params.insert("ipconfig0".into(), format!("ip={},gw={}", ip.address, ip.gateway));
                    }
                    None => {
                        params.insert("ipconfig0".into(), "ip=dhcp".into());
                    }
                }
            }
            Parameterization::WindowsAutounattend { .. } => {
                return Err(DomeError::validation(
                    "autounattend installs do not use the cloud-init drive; bake the XML into the install ISO",
                ));
            }
            Parameterization::PlatformAssigned => {}
        }
        Ok(())
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

    async fn template_tags(&self, template_id: &str) -> DomeResult<BTreeMap<String, String>> {
        let config = self
            .api_get(&format!("/nodes/{}/qemu/{template_id}/config", self.node))
            .await?;
        let mut tags = BTreeMap::new();
        if let Some(raw) = config.get("tags").and_then(|v| v.as_str()) {
            for tag in raw.split(';').filter(|t| !t.is_empty()) {
                tags.insert(tag.to_string(), "true".to_string());
            }
        }
        if config.get("agent").and_then(|v| v.as_str()).map(|s| s.starts_with('1')).unwrap_or(false) {
            tags.insert("guest-agent".to_string(), "true".to_string());
        }
        Ok(tags)
    }

    async fn find_free_bridge(&self) -> DomeResult<String> {
        let data = self.api_get(&format!("/nodes/{}/network", self.node)).await?;
        let mut highest = 0u32;
        if let Some(items) = data.as_array() {
            for item in items {
                if let Some(iface) = item.get("iface").and_then(|v| v.as_str()) {
                    if let Some(n) = iface.strip_prefix("vmbr").and_then(|s| s.parse::<u32>().ok()) {
                        highest = highest.max(n);
                    }
                }
            }
        }
        Ok(format!("vmbr{}", highest + 1))
    }
}

fn urlencode(s: &str) -> String {
    s.replace(':', "%3A")
}

#[async_trait]
impl PlatformCapability for ProxmoxAdapter {
    fn platform_id(&self) -> &PlatformId {
        &self.platform_id
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Proxmox
    }

    async fn ping(&self) -> DomeResult<()> {
        self.api_get("/version").await.map(|_| ())
    }

    async fn create_vm(&self, spec: &VmSpec, parameterization: &Parameterization) -> DomeResult<VmRecord> {
        // Live-image install path: an empty VM booting the family's install
        // ISO. Used only when no template exists for the requested OS.
        let vm_id = self.next_vm_id().await?;
        let mut params = HashMap::new();
        params.insert("vmid".into(), vm_id.clone());
        params.insert("name".into(), spec.name.clone());
        params.insert("cores".into(), spec.cores.to_string());
        params.insert("memory".into(), spec.memory_mib.to_string());
        params.insert("cpu".into(), "host".into());
        let disk_slot = Self::disk_slot(spec);
        if disk_slot == "scsi0" {
            // Only the Linux path puts the disk on a SCSI controller;
            // Windows boots from SATA and needs no scsihw at all.
            params.insert("scsihw".into(), "virtio-scsi-pci".into());
        }
        params.insert(disk_slot.into(), format!("{}:{}", self.storage, spec.disk_gib));
        params.insert("net0".into(), Self::net0_value(spec, None));
        params.insert("ostype".into(), if spec.os_family.is_windows() { "win11".into() } else { "l26".into() });
        params.insert("agent".into(), "1".into());
        Self::cloudinit_params(parameterization, &mut params)?;

        let upid = self
            .api_form(reqwest::Method::POST, &format!("/nodes/{}/qemu", self.node), &params)
            .await?;
        if let Some(upid) = upid.as_str() {
            self.wait_for_task(upid).await?;
        }
        self.start_vm(&vm_id).await?;
        info!(platform = %self.platform_id, %vm_id, name = %spec.name, "created vm from scratch");
        Ok(self.record_for(vm_id, spec))
    }

    async fn clone_from_template(
        &self,
        template_id: &str,
        spec: &VmSpec,
        parameterization: &Parameterization,
    ) -> DomeResult<VmRecord> {
        let vm_id = self.next_vm_id().await?;

        let mut clone_params = HashMap::new();
        clone_params.insert("newid".into(), vm_id.clone());
        clone_params.insert("name".into(), spec.name.clone());
        clone_params.insert("full".into(), "1".into());
        clone_params.insert("storage".into(), self.storage.clone());
        let upid = self
            .api_form(
                reqwest::Method::POST,
                &format!("/nodes/{}/qemu/{template_id}/clone", self.node),
                &clone_params,
            )
            .await?;
        if let Some(upid) = upid.as_str() {
            self.wait_for_task(upid).await?;
        }

        let template_tags = self.template_tags(template_id).await.unwrap_or_default();
        let vlan = spec
            .tags
            .get("vlan")
            .and_then(|v| v.parse::<u16>().ok());

        let mut config_params = HashMap::new();
        config_params.insert("cores".into(), spec.cores.to_string());
        config_params.insert("memory".into(), spec.memory_mib.to_string());
        config_params.insert("net0".into(), Self::net0_value(spec, vlan));
        config_params.insert("agent".into(), "1".into());
        if spec.os_family.is_windows() && !template_tags.contains_key("virtio-baked") {
            // Keep the cloned disk on SATA so the guest boots without
            // injected drivers.
            config_params.insert("scsihw".into(), "lsi".into());
        }
        Self::cloudinit_params(parameterization, &mut config_params)?;
        self.api_form(
            reqwest::Method::POST,
            &format!("/nodes/{}/qemu/{vm_id}/config", self.node),
            &config_params,
        )
        .await?;

        let mut resize_params = HashMap::new();
        resize_params.insert("disk".into(), Self::disk_slot(spec).to_string());
        resize_params.insert("size".into(), format!("{}G", spec.disk_gib));
        if let Err(err) = self
            .api_form(
                reqwest::Method::PUT,
                &format!("/nodes/{}/qemu/{vm_id}/resize", self.node),
                &resize_params,
            )
            .await
        {
            // Growing below the template size fails; the clone still boots.
            warn!(vm_id, %err, "disk resize skipped");
        }

        self.start_vm(&vm_id).await?;
        info!(platform = %self.platform_id, %vm_id, template_id, name = %spec.name, "cloned vm from template");
        Ok(self.record_for(vm_id, spec))
    }

    async fn inject_config(&self, vm_id: &str, parameterization: &Parameterization) -> DomeResult<()> {
        let mut params = HashMap::new();
        Self::cloudinit_params(parameterization, &mut params)?;
        if params.is_empty() {
            return Ok(());
        }
        self.api_form(
            reqwest::Method::POST,
            &format!("/nodes/{}/qemu/{vm_id}/config", self.node),
            &params,
        )
        .await
        .map(|_| ())
    }

    async fn start_vm(&self, vm_id: &str) -> DomeResult<()> {
        match self.get_vm_status(vm_id).await? {
            VmStatus::Running => return Ok(()),
            VmStatus::Deleted => return Err(DomeError::missing(format!("vm {vm_id} is deleted"))),
            _ => {}
        }
        self.api_form(
            reqwest::Method::POST,
            &format!("/nodes/{}/qemu/{vm_id}/status/start", self.node),
            &HashMap::new(),
        )
        .await
        .map(|_| ())
    }

    async fn stop_vm(&self, vm_id: &str) -> DomeResult<()> {
        if self.get_vm_status(vm_id).await? == VmStatus::Stopped {
            return Ok(());
        }
        self.api_form(
            reqwest::Method::POST,
            &format!("/nodes/{}/qemu/{vm_id}/status/stop", self.node),
            &HashMap::new(),
        )
        .await
        .map(|_| ())
    }

    async fn reboot_vm(&self, vm_id: &str) -> DomeResult<()> {
        self.api_form(
            reqwest::Method::POST,
            &format!("/nodes/{}/qemu/{vm_id}/status/reboot", self.node),
            &HashMap::new(),
        )
        .await
        .map(|_| ())
    }

    async fn delete_vm(&self, vm_id: &str) -> DomeResult<()> {
        {
            let tombstones = self.tombstones.lock().await;
            if tombstones.contains(vm_id) {
                return Ok(());
            }
        }
        match self.stop_vm(vm_id).await {
            Ok(()) => {}
            Err(DomeError::ResourceMissing { .. }) => {
                // Already gone; deleting a deleted VM is a no-op success.
                self.tombstones.lock().await.insert(vm_id.to_string());
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        let upid = self
            .api_delete(&format!("/nodes/{}/qemu/{vm_id}", self.node))
            .await?;
        if let Some(upid) = upid.as_str() {
            self.wait_for_task(upid).await?;
        }
        self.tombstones.lock().await.insert(vm_id.to_string());
        Ok(())
    }

    async fn get_vm_status(&self, vm_id: &str) -> DomeResult<VmStatus> {
        if self.tombstones.lock().await.contains(vm_id) {
            return Ok(VmStatus::Deleted);
        }
        let data = match self
            .api_get(&format!("/nodes/{}/qemu/{vm_id}/status/current", self.node))
            .await
        {
            Ok(data) => data,
            Err(DomeError::ResourceMissing { message }) => {
                return Err(DomeError::missing(message));
            }
            Err(err) => return Err(err),
        };
        let status = data.get("status").and_then(|v| v.as_str()).unwrap_or("unknown");
        Ok(match status {
            "running" => VmStatus::Running,
            "stopped" => VmStatus::Stopped,
            _ => VmStatus::Error,
        })
    }

    async fn get_vm_ip(&self, vm_id: &str, timeout: Duration) -> DomeResult<IpAddr> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self
                .api_get(&format!(
                    "/nodes/{}/qemu/{vm_id}/agent/network-get-interfaces",
                    self.node
                ))
                .await
            {
                Ok(data) => {
                    if let Some(ip) = first_guest_ip(&data) {
                        return Ok(ip);
                    }
                }
                Err(DomeError::ResourceMissing { message }) => return Err(DomeError::missing(message)),
                Err(err) if err.is_transient() => {
                    debug!(vm_id, %err, "guest agent not answering yet");
                }
                Err(err) => {
                    // The agent endpoint returns 500 while the agent is not
                    // running; keep polling until the deadline.
                    debug!(vm_id, %err, "guest agent query failed, retrying");
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DomeError::timeout(format!("guest-agent ip discovery for vm {vm_id}"), timeout));
            }
            tokio::time::sleep(AGENT_POLL_INTERVAL).await;
        }
    }

    async fn list_vms(&self, filter: &VmFilter) -> DomeResult<Vec<VmObservation>> {
        let data = self.api_get(&format!("/nodes/{}/qemu", self.node)).await?;
        let items: Vec<VmListItem> = serde_json::from_value(data).unwrap_or_default();
        let mut observations = Vec::new();
        for item in items {
            if item.template == Some(1) {
                continue;
            }
            let name = item.name.unwrap_or_else(|| item.vmid.to_string());
            if let Some(prefix) = &filter.name_prefix {
                if !name.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            let status = match item.status.as_deref() {
                Some("running") => VmStatus::Running,
                Some("stopped") => VmStatus::Stopped,
                _ => VmStatus::Error,
            };
            observations.push(VmObservation {
                vm_id: item.vmid.to_string(),
                name,
                status,
                primary_ip: None,
                guest_tools: GuestToolsState::Unknown,
                cores: item.cpus.map(|c| c as u32),
                memory_mib: item.maxmem.map(|b| b / (1024 * 1024)),
            });
        }
        Ok(observations)
    }

    async fn list_templates(&self) -> DomeResult<Vec<TemplateInfo>> {
        let data = self.api_get(&format!("/nodes/{}/qemu", self.node)).await?;
        let items: Vec<VmListItem> = serde_json::from_value(data).unwrap_or_default();
        let mut templates = Vec::new();
        for item in items {
            if item.template != Some(1) {
                continue;
            }
            let id = item.vmid.to_string();
            let tags = self.template_tags(&id).await.unwrap_or_default();
            templates.push(TemplateInfo {
                id,
                name: item.name.unwrap_or_default(),
                tags,
            });
        }
        Ok(templates)
    }

    async fn list_networks(&self) -> DomeResult<Vec<NetworkObservation>> {
        let data = self.api_get(&format!("/nodes/{}/network", self.node)).await?;
        let mut networks = Vec::new();
        if let Some(items) = data.as_array() {
            for item in items {
                let iface = item.get("iface").and_then(|v| v.as_str()).unwrap_or_default();
                if item.get("type").and_then(|v| v.as_str()) != Some("bridge") {
                    continue;
                }
                networks.push(NetworkObservation {
                    network_id: iface.to_string(),
                    name: iface.to_string(),
                    vlan_tag: None,
                });
            }
        }
        Ok(networks)
    }

    async fn create_network(&self, spec: &NetworkSpec) -> DomeResult<NetworkRecord> {
        let bridge = self.find_free_bridge().await?;
        let mut params = HashMap::new();
        params.insert("iface".into(), bridge.clone());
        params.insert("type".into(), "bridge".into());
        params.insert("autostart".into(), "1".into());
        if spec.vlan.is_some() {
            params.insert("bridge_vlan_aware".into(), "1".into());
        }
        if spec.mode != NetworkMode::Isolated {
            // Routed/bridged networks hang off the uplink bridge.
            params.insert("bridge_ports".into(), "vmbr0".into());
        }
        self.api_form(reqwest::Method::POST, &format!("/nodes/{}/network", self.node), &params)
            .await?;
        // Apply the pending network change.
        self.api_form(reqwest::Method::PUT, &format!("/nodes/{}/network", self.node), &HashMap::new())
            .await?;

        info!(platform = %self.platform_id, bridge, cidr = %spec.cidr, "created network bridge");
        Ok(NetworkRecord {
            network_id: bridge,
            platform_id: self.platform_id.clone(),
            name: spec.name.clone(),
            cidr: spec.cidr.clone(),
            gateway: spec.gateway,
            vlan_tag: spec.vlan,
            mode: spec.mode,
            owner_lab: None,
            created_at: Utc::now(),
        })
    }

    async fn delete_network(&self, network_id: &str) -> DomeResult<()> {
        match self
            .api_delete(&format!("/nodes/{}/network/{network_id}", self.node))
            .await
        {
            Ok(_) => {}
            Err(DomeError::ResourceMissing { .. }) => return Ok(()),
            Err(err) => return Err(err),
        }
        self.api_form(reqwest::Method::PUT, &format!("/nodes/{}/network", self.node), &HashMap::new())
            .await?;
        Ok(())
    }

    fn connection_hint(&self, record: &VmRecord) -> DomeResult<SshTarget> {
        ssh_target_for_record(record)
    }

    fn supports_live_install(&self) -> bool {
        true
    }
}

/// Pick the first non-loopback, non-link-local IPv4 the guest agent reports.
fn first_guest_ip(data: &serde_json::Value) -> Option<IpAddr> {
    let interfaces = data.get("result").or(Some(data))?.as_array()?;
    for interface in interfaces {
        let name = interface.get("name").and_then(|v| v.as_str()).unwrap_or_default();
        if name == "lo" {
            continue;
        }
        let addresses = interface.get("ip-addresses").and_then(|v| v.as_array());
        let Some(addresses) = addresses else { continue };
        for address in addresses {
            if address.get("ip-address-type").and_then(|v| v.as_str()) != Some("ipv4") {
                continue;
            }
            let Some(raw) = address.get("ip-address").and_then(|v| v.as_str()) else {
                continue;
            };
            let Ok(ip) = raw.parse::<IpAddr>() else { continue };
            match ip {
                IpAddr::V4(v4) if v4.is_loopback() || v4.is_link_local() => continue,
                _ => return Some(ip),
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CredentialsBundle, OsFamily, StaticIpConfig};

    fn spec(os: OsFamily) -> VmSpec {
        VmSpec {
            name: "web".into(),
            os_family: os,
            os_version: "22.04".into(),
            cores: 2,
            memory_mib: 2048,
            disk_gib: 20,
            networks: vec!["lan".into()],
            ip_policy: None,
            credentials: CredentialsBundle {
                username: "ubuntu".into(),
                ..Default::default()
            },
            post_config: vec![],
            tags: Default::default(),
            priority: 0,
        }
    }

    #[test]
    fn windows_guests_get_sata_disks() {
        assert_eq!(ProxmoxAdapter::disk_slot(&spec(OsFamily::Windows)), "sata0");
        assert_eq!(ProxmoxAdapter::disk_slot(&spec(OsFamily::Ubuntu)), "scsi0");
    }

    #[test]
    fn vlan_tag_lands_on_the_nic() {
        let value = ProxmoxAdapter::net0_value(&spec(OsFamily::Ubuntu), Some(101));
        assert_eq!(value, "virtio,bridge=vmbr0,tag=101");
        let untagged = ProxmoxAdapter::net0_value(&spec(OsFamily::Ubuntu), None);
        assert_eq!(untagged, "virtio,bridge=vmbr0");
    }

    #[test]
    fn cloudinit_sshkeys_are_base64() {
        let parameterization = Parameterization::LinuxCloudInit {
            username: "ubuntu".into(),
            user_data: String::new(),
            ssh_public_key: "ssh-ed25519 AAAAC3Nz lab".into(),
            static_ip: Some(StaticIpConfig {
                address: "10.101.0.30/24".into(),
                gateway: "10.101.0.1".into(),
                nameservers: vec![],
            }),
            nameservers: vec!["10.101.0.1".into()],
        };
        let mut params = HashMap::new();
        ProxmoxAdapter::cloudinit_params(&parameterization, &mut params).unwrap();
        assert_eq!(params.get("ciuser").unwrap(), "ubuntu");
        assert_eq!(params.get("ipconfig0").unwrap(), "ip=10.101.0.30/24,gw=10.101.0.1");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(params.get("sshkeys").unwrap())
            .unwrap();
        assert_eq!(decoded, b"ssh-ed25519 AAAAC3Nz lab");
    }

    #[test]
    fn autounattend_cannot_ride_the_cloudinit_drive() {
        let parameterization = Parameterization::WindowsAutounattend { xml: "<xml/>".into() };
        let mut params = HashMap::new();
        let err = ProxmoxAdapter::cloudinit_params(&parameterization, &mut params).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn guest_agent_ip_parsing_skips_loopback() {
        let payload = serde_json::json!({
            "result": [
                { "name": "lo", "ip-addresses": [
                    { "ip-address": "127.0.0.1", "ip-address-type": "ipv4" }
                ]},
                { "name": "eth0", "ip-addresses": [
                    { "ip-address": "fe80::1", "ip-address-type": "ipv6" },
                    { "ip-address": "10.101.0.30", "ip-address-type": "ipv4" }
                ]}
            ]
        });
        let ip = first_guest_ip(&payload).unwrap();
        assert_eq!(ip.to_string(), "10.101.0.30");
    }

    #[test]
    fn guest_agent_ip_parsing_handles_empty_result() {
        assert!(first_guest_ip(&serde_json::json!({ "result": [] })).is_none());
    }
}
