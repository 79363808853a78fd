// src/platform/cloud.rs
// Cloud-region adapter. One implementation covers the aws/azure/gcp kinds:
// instance ids are opaque, the control plane assigns addressing, and the
// primary IP shows up on the describe-instance call once the instance is
// running.

use chrono::Utc;
use serde::Deserialize;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Duration;
use tokio::sync::Mutex;

use async_trait::async_trait;

use crate::config::{PlatformConfig, PlatformKind};
use crate::errors::{DomeError, DomeResult};
use crate::model::{
    GuestToolsState, NetworkRecord, NetworkSpec, Parameterization, PlatformId, SshTarget, VmRecord,
    VmSpec, VmStatus,
};
use crate::platform::ratelimit::TokenBucket;
use crate::platform::{
    ssh_target_for_record, NetworkObservation, PlatformCapability, TemplateInfo, VmFilter,
    VmObservation,
};
use crate::secrets::PlatformCredentials;

const DESCRIBE_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub struct CloudAdapter {
    platform_id: PlatformId,
    kind: PlatformKind,
    http: reqwest::Client,
    endpoint: String,
    region: String,
    bearer: String,
    bucket: TokenBucket,
    tombstones: Mutex<HashSet<String>>,
}

#[derive(Deserialize)]
struct InstanceDescription {
    #[serde(default)]
    instance_id: String,
    #[serde(default)]
    name: Option<String>,
    state: String,
    #[serde(default)]
    private_ip: Option<IpAddr>,
    #[serde(default)]
    public_ip: Option<IpAddr>,
    #[serde(default)]
    cores: Option<u32>,
    #[serde(default)]
    memory_mib: Option<u64>,
}

impl InstanceDescription {
    fn status(&self) -> VmStatus {
        match self.state.as_str() {
            "pending" | "provisioning" | "starting" => VmStatus::Creating,
            "running" => VmStatus::Running,
            "stopped" | "stopping" | "deallocated" => VmStatus::Stopped,
            "terminated" | "deleted" => VmStatus::Deleted,
            _ => VmStatus::Error,
        }
    }

    fn ip(&self) -> Option<IpAddr> {
        self.private_ip.or(self.public_ip)
    }
}

impl CloudAdapter {
    pub fn new(config: &PlatformConfig, credentials: &PlatformCredentials) -> DomeResult<Self> {
        let secret = credentials
            .secret_key
            .clone()
            .or_else(|| credentials.token_secret.clone())
            .ok_or_else(|| {
                DomeError::validation(format!(
                    "platform '{}' credentials need a secret_key for API auth",
                    config.id
                ))
            })?;
        let bearer = match &credentials.access_key {
            Some(access) => format!("{access}:{secret}"),
            None => secret,
        };
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .build()?;
        Ok(CloudAdapter {
            platform_id: PlatformId(config.id.clone()),
            kind: config.kind,
            http,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            region: config.region.clone().unwrap_or_else(|| "default".to_string()),
            bearer,
            bucket: TokenBucket::new(config.rate_limit),
            tombstones: Mutex::new(HashSet::new()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/regions/{}{path}", self.endpoint, self.region)
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> DomeResult<serde_json::Value> {
        self.bucket.acquire().await;
        let response = builder
            .header("Authorization", format!("Bearer {}", self.bearer))
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            if text.is_empty() {
                return Ok(serde_json::Value::Null);
            }
            return serde_json::from_str(&text)
                .map_err(|e| DomeError::permanent(format!("cloud api: unparseable response: {e}")));
        }
        let message = format!("cloud api {status}: {}", text.trim());
        match status.as_u16() {
            404 => Err(DomeError::missing(message)),
            429 => Err(DomeError::transient_coded(message, "429")),
            500..=599 => Err(DomeError::transient_coded(message, status.as_str().to_string())),
            _ => Err(DomeError::permanent_coded(message, status.as_str().to_string())),
        }
    }

    async fn describe(&self, vm_id: &str) -> DomeResult<InstanceDescription> {
        let value = self
            .send(self.http.get(self.url(&format!("/instances/{vm_id}"))))
            .await?;
        serde_json::from_value(value)
            .map_err(|e| DomeError::permanent(format!("cloud api: bad instance description: {e}")))
    }

    async fn instance_action(&self, vm_id: &str, action: &str) -> DomeResult<()> {
        self.send(
            self.http
                .post(self.url(&format!("/instances/{vm_id}/actions")))
                .json(&serde_json::json!({ "action": action })),
        )
        .await
        .map(|_| ())
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
impl PlatformCapability for CloudAdapter {
    fn platform_id(&self) -> &PlatformId {
        &self.platform_id
    }

    fn kind(&self) -> PlatformKind {
        self.kind
    }

    async fn ping(&self) -> DomeResult<()> {
        self.send(self.http.get(self.url("/status"))).await.map(|_| ())
    }

    async fn create_vm(&self, _spec: &VmSpec, _parameterization: &Parameterization) -> DomeResult<VmRecord> {
        Err(DomeError::permanent(
            "cloud platforms launch from images; there is no live-install path",
        ))
    }

    async fn clone_from_template(
        &self,
        template_id: &str,
        spec: &VmSpec,
        parameterization: &Parameterization,
    ) -> DomeResult<VmRecord> {
        let user_data = match parameterization {
            Parameterization::LinuxCloudInit { user_data, .. } => user_data.clone(),
            Parameterization::WindowsCloudbaseInit { user_data, .. } => user_data.clone(),
            Parameterization::PlatformAssigned => String::new(),
            Parameterization::WindowsAutounattend { .. } => {
                return Err(DomeError::validation(
                    "cloud instances cannot boot a bare-ISO autounattend install",
                ))
            }
        };
        let body = serde_json::json!({
            "name": spec.name,
            "image_id": template_id,
            "cores": spec.cores,
            "memory_mib": spec.memory_mib,
            "disk_gib": spec.disk_gib,
            "user_data": user_data,
        });
        let value = self
            .send(self.http.post(self.url("/instances")).json(&body))
            .await?;
        let vm_id = value
            .get("instance_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DomeError::permanent("cloud api: launch response missing instance_id"))?
            .to_string();
        {
            let tombstones = self.tombstones.lock().await;
            if tombstones.contains(&vm_id) {
                return Err(DomeError::permanent(format!(
                    "cloud api reissued instance id {vm_id} tombstoned in this session"
                )));
            }
        }
        Ok(self.record_for(vm_id, spec))
    }

    async fn inject_config(&self, vm_id: &str, parameterization: &Parameterization) -> DomeResult<()> {
        let user_data = match parameterization {
            Parameterization::LinuxCloudInit { user_data, .. } => user_data,
            Parameterization::WindowsCloudbaseInit { user_data, .. } => user_data,
            _ => return Ok(()),
        };
        self.send(
            self.http
                .put(self.url(&format!("/instances/{vm_id}/user-data")))
                .json(&serde_json::json!({ "user_data": user_data })),
        )
        .await
        .map(|_| ())
    }

    async fn start_vm(&self, vm_id: &str) -> DomeResult<()> {
        if self.describe(vm_id).await?.status() == VmStatus::Running {
            return Ok(());
        }
        self.instance_action(vm_id, "start").await
    }

    async fn stop_vm(&self, vm_id: &str) -> DomeResult<()> {
        if self.describe(vm_id).await?.status() == VmStatus::Stopped {
            return Ok(());
        }
        self.instance_action(vm_id, "stop").await
    }

    async fn reboot_vm(&self, vm_id: &str) -> DomeResult<()> {
        self.instance_action(vm_id, "reboot").await
    }

    async fn delete_vm(&self, vm_id: &str) -> DomeResult<()> {
        {
            let tombstones = self.tombstones.lock().await;
            if tombstones.contains(vm_id) {
                return Ok(());
            }
        }
        match self
            .send(self.http.delete(self.url(&format!("/instances/{vm_id}"))))
            .await
        {
            Ok(_) | Err(DomeError::ResourceMissing { .. }) => {
                self.tombstones.lock().await.insert(vm_id.to_string());
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn get_vm_status(&self, vm_id: &str) -> DomeResult<VmStatus> {
        if self.tombstones.lock().await.contains(vm_id) {
            return Ok(VmStatus::Deleted);
        }
        Ok(self.describe(vm_id).await?.status())
    }

    async fn get_vm_ip(&self, vm_id: &str, timeout: Duration) -> DomeResult<IpAddr> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let description = self.describe(vm_id).await?;
            if description.status() == VmStatus::Running {
                if let Some(ip) = description.ip() {
                    return Ok(ip);
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DomeError::timeout(format!("describe-instance ip for {vm_id}"), timeout));
            }
            tokio::time::sleep(DESCRIBE_POLL_INTERVAL).await;
        }
    }

    async fn list_vms(&self, filter: &VmFilter) -> DomeResult<Vec<VmObservation>> {
        let value = self.send(self.http.get(self.url("/instances"))).await?;
        let items: Vec<InstanceDescription> = serde_json::from_value(
            value.get("instances").cloned().unwrap_or(serde_json::Value::Array(vec![])),
        )
        .unwrap_or_default();
        let mut observations = Vec::new();
        for item in items {
            let name = item.name.clone().unwrap_or_else(|| item.instance_id.clone());
            if let Some(prefix) = &filter.name_prefix {
                if !name.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            observations.push(VmObservation {
                vm_id: item.instance_id.clone(),
                name,
                status: item.status(),
                primary_ip: item.ip(),
                guest_tools: GuestToolsState::Unknown,
                cores: item.cores,
                memory_mib: item.memory_mib,
            });
        }
        Ok(observations)
    }

    async fn list_templates(&self) -> DomeResult<Vec<TemplateInfo>> {
        let value = self.send(self.http.get(self.url("/images"))).await?;
        let items = value
            .get("images")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let mut templates = Vec::new();
        for item in items {
            let id = item.get("image_id").and_then(|v| v.as_str()).unwrap_or_default();
            let name = item.get("name").and_then(|v| v.as_str()).unwrap_or_default();
            let mut tags = std::collections::BTreeMap::new();
            // Cloud images carry their guest agent (SSM, waagent, ...).
            tags.insert("guest-agent".to_string(), "true".to_string());
            templates.push(TemplateInfo { id: id.to_string(), name: name.to_string(), tags });
        }
        Ok(templates)
    }

    async fn list_networks(&self) -> DomeResult<Vec<NetworkObservation>> {
        let value = self.send(self.http.get(self.url("/networks"))).await?;
        let items = value
            .get("networks")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        Ok(items
            .iter()
            .map(|item| NetworkObservation {
                network_id: item.get("network_id").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                name: item.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                vlan_tag: None,
            })
            .collect())
    }

    async fn create_network(&self, spec: &NetworkSpec) -> DomeResult<NetworkRecord> {
        let value = self
            .send(self.http.post(self.url("/networks")).json(&serde_json::json!({
                "name": spec.name,
                "cidr": spec.cidr,
                "isolated": spec.mode == crate::model::NetworkMode::Isolated,
            })))
            .await?;
        let network_id = value
            .get("network_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| DomeError::permanent("cloud api: create-network response missing network_id"))?
            .to_string();
        Ok(NetworkRecord {
            network_id,
            platform_id: self.platform_id.clone(),
            name: spec.name.clone(),
            cidr: spec.cidr.clone(),
            gateway: spec.gateway,
            vlan_tag: None,
            mode: spec.mode,
            owner_lab: None,
            created_at: Utc::now(),
        })
    }

    async fn delete_network(&self, network_id: &str) -> DomeResult<()> {
        match self
            .send(self.http.delete(self.url(&format!("/networks/{network_id}"))))
            .await
        {
            Ok(_) | Err(DomeError::ResourceMissing { .. }) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn connection_hint(&self, record: &VmRecord) -> DomeResult<SshTarget> {
        ssh_target_for_record(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_states_map_to_vm_statuses() {
        let desc = |state: &str| InstanceDescription {
            instance_id: "i-1".into(),
            name: None,
            state: state.into(),
            private_ip: None,
            public_ip: None,
            cores: None,
            memory_mib: None,
        };
        assert_eq!(desc("pending").status(), VmStatus::Creating);
        assert_eq!(desc("running").status(), VmStatus::Running);
        assert_eq!(desc("deallocated").status(), VmStatus::Stopped);
        assert_eq!(desc("terminated").status(), VmStatus::Deleted);
        assert_eq!(desc("weird").status(), VmStatus::Error);
    }

    #[test]
    fn private_ip_wins_over_public() {
        let desc = InstanceDescription {
            instance_id: "i-1".into(),
            name: None,
            state: "running".into(),
            private_ip: Some("10.0.0.5".parse().unwrap()),
            public_ip: Some("198.51.100.7".parse().unwrap()),
            cores: None,
            memory_mib: None,
        };
        assert_eq!(desc.ip().unwrap().to_string(), "10.0.0.5");
    }
}
