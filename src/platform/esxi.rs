// src/platform/esxi.rs
// VMware-style hypervisor adapter driven over SSH to the host shell:
// vmkfstools for disk conversion and cloning, vim-cmd for lifecycle, a
// NoCloud seed ISO on an IDE CD-ROM for cloud-init.

use chrono::Utc;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

use async_trait::async_trait;

use crate::config::{PlatformConfig, PlatformKind};
use crate::errors::{DomeError, DomeResult};
use crate::model::{
    GuestToolsState, NetworkMode, NetworkRecord, NetworkSpec, Parameterization, PlatformId,
    SshAuth, SshTarget, VmRecord, VmSpec, VmStatus,
};
use crate::platform::ratelimit::TokenBucket;
use crate::platform::{
    ssh_target_for_record, NetworkObservation, PlatformCapability, TemplateInfo, VmFilter,
    VmObservation,
};
use crate::secrets::PlatformCredentials;
use crate::ssh::SshPool;

const HOST_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);
const CLONE_TIMEOUT: Duration = Duration::from_secs(600);
const GUEST_POLL_INTERVAL: Duration = Duration::from_secs(3);

pub struct EsxiAdapter {
    platform_id: PlatformId,
    host: SshTarget,
    ssh: Arc<SshPool>,
    datastore: String,
    bucket: TokenBucket,
    tombstones: Mutex<HashSet<String>>,
}

impl EsxiAdapter {
    pub fn new(
        config: &PlatformConfig,
        credentials: &PlatformCredentials,
        ssh: Arc<SshPool>,
    ) -> DomeResult<Self> {
        let host = config
            .endpoint
            .trim_start_matches("ssh://")
            .trim_start_matches("https://")
            .split('/')
            .next()
            .unwrap_or_default()
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string();
        if host.is_empty() {
            return Err(DomeError::validation(format!(
                "platform '{}' endpoint does not name a host",
                config.id
            )));
        }
        let username = credentials.username.clone().unwrap_or_else(|| "root".to_string());
        let auth = if let Some(key) = &credentials.ssh_private_key {
            SshAuth::Key { private_key: key.clone() }
        } else if let Some(password) = &credentials.password {
            SshAuth::Password { password: password.clone() }
        } else {
            return Err(DomeError::validation(format!(
                "platform '{}' credentials need ssh_private_key or password",
                config.id
            )));
        };
        Ok(EsxiAdapter {
            platform_id: PlatformId(config.id.clone()),
            host: SshTarget { host, port: 22, username, auth },
            ssh,
            datastore: config
                .datastore
                .clone()
                .or_else(|| config.default_storage.clone())
                .unwrap_or_else(|| "datastore1".to_string()),
            bucket: TokenBucket::new(config.rate_limit),
            tombstones: Mutex::new(HashSet::new()),
        })
    }

    fn vm_dir(&self, name: &str) -> String {
        format!("/vmfs/volumes/{}/{name}", self.datastore)
    }

    async fn host_exec(&self, command: &str, timeout: Duration) -> DomeResult<String> {
        self.bucket.acquire().await;
        let output = self.ssh.execute(&self.host, command, timeout).await?;
        if !output.success() {
            let stderr = output.stderr.trim();
            let message = format!("esxi host command failed ({}): {stderr}", output.exit_code);
            if stderr.contains("not found") || stderr.contains("No such") {
                return Err(DomeError::missing(message));
            }
            return Err(DomeError::permanent(message));
        }
        Ok(output.stdout)
    }

    /// `vim-cmd vmsvc/getallvms` lines: `vmid name datastore vmxfile guest ...`
    async fn all_vms(&self) -> DomeResult<Vec<(String, String)>> {
        let raw = self.host_exec("vim-cmd vmsvc/getallvms", HOST_COMMAND_TIMEOUT).await?;
        let mut vms = Vec::new();
        for line in raw.lines().skip(1) {
            let mut parts = line.split_whitespace();
            let (Some(vmid), Some(name)) = (parts.next(), parts.next()) else {
                continue;
            };
            if vmid.parse::<u64>().is_ok() {
                vms.push((vmid.to_string(), name.to_string()));
            }
        }
        Ok(vms)
    }

    async fn power_state(&self, vm_id: &str) -> DomeResult<VmStatus> {
        let raw = self
            .host_exec(&format!("vim-cmd vmsvc/power.getstate {vm_id}"), HOST_COMMAND_TIMEOUT)
            .await?;
        if raw.contains("Powered on") {
            Ok(VmStatus::Running)
        } else if raw.contains("Powered off") {
            Ok(VmStatus::Stopped)
        } else if raw.contains("Suspended") {
            Ok(VmStatus::Stopped)
        } else {
            Ok(VmStatus::Error)
        }
    }

    fn seed_iso_script(vm_dir: &str, parameterization: &Parameterization) -> DomeResult<String> {
        let (user_data, meta_data) = match parameterization {
            Parameterization::LinuxCloudInit { user_data, .. } => {
                (user_data.clone(), "instance-id: glassdome\n".to_string())
            }
            Parameterization::WindowsCloudbaseInit { user_data, meta_data, .. } => {
                (user_data.clone(), meta_data.clone())
            }
            Parameterization::PlatformAssigned => return Ok(String::new()),
            Parameterization::WindowsAutounattend { .. } => {
                return Err(DomeError::validation(
                    "autounattend installs boot their own ISO; no NoCloud seed applies",
                ))
            }
        };
        // Heredoc markers chosen to survive arbitrary cloud-init payloads.
        Ok(format!(
            "mkdir -p {vm_dir}/seed && \
             cat > {vm_dir}/seed/user-data <<'GLASSDOME_EOF'\n{user_data}\nGLASSDOME_EOF\n\
             cat > {vm_dir}/seed/meta-data <<'GLASSDOME_EOF'\n{meta_data}\nGLASSDOME_EOF\n\
             mkisofs -o {vm_dir}/seed.iso -volid cidata -joliet -rock {vm_dir}/seed/user-data {vm_dir}/seed/meta-data"
        ))
    }

    fn vmx_content(&self, spec: &VmSpec, vm_dir: &str, network_name: &str) -> String {
        let guest_os = if spec.os_family.is_windows() { "windows2019srv-64" } else { "ubuntu-64" };
        // Windows boots from SATA without driver injection; Linux rides pvscsi.
        let disk_stanza = if spec.os_family.is_windows() {
            format!(
                "sata0.present = \"TRUE\"\nsata0:0.present = \"TRUE\"\nsata0:0.fileName = \"{vm_dir}/disk.vmdk\"\n"
            )
        } else {
            format!(
                "scsi0.present = \"TRUE\"\nscsi0.virtualDev = \"pvscsi\"\nscsi0:0.present = \"TRUE\"\nscsi0:0.fileName = \"{vm_dir}/disk.vmdk\"\n"
            )
        };
        format!(
            "config.version = \"8\"\n\
             virtualHW.version = \"14\"\n\
             displayName = \"{name}\"\n\
             guestOS = \"{guest_os}\"\n\
             numvcpus = \"{cores}\"\n\
             memSize = \"{memory}\"\n\
             {disk_stanza}\
             ide1:0.present = \"TRUE\"\n\
             ide1:0.deviceType = \"cdrom-image\"\n\
             ide1:0.fileName = \"{vm_dir}/seed.iso\"\n\
             ethernet0.present = \"TRUE\"\n\
             ethernet0.virtualDev = \"vmxnet3\"\n\
             ethernet0.networkName = \"{network_name}\"\n\
             ethernet0.addressType = \"generated\"\n\
             tools.syncTime = \"TRUE\"\n",
            name = spec.name,
            cores = spec.cores,
            memory = spec.memory_mib,
        )
    }
}

#[async_trait]
impl PlatformCapability for EsxiAdapter {
    fn platform_id(&self) -> &PlatformId {
        &self.platform_id
    }

    fn kind(&self) -> PlatformKind {
        PlatformKind::Esxi
    }

    async fn ping(&self) -> DomeResult<()> {
        self.host_exec("vim-cmd hostsvc/hostsummary >/dev/null && echo up", HOST_COMMAND_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn create_vm(&self, _spec: &VmSpec, _parameterization: &Parameterization) -> DomeResult<VmRecord> {
        Err(DomeError::permanent(
            "esxi adapter provisions by template clone only; import an image first",
        ))
    }

    async fn clone_from_template(
        &self,
        template_id: &str,
        spec: &VmSpec,
        parameterization: &Parameterization,
    ) -> DomeResult<VmRecord> {
        let vm_dir = self.vm_dir(&spec.name);
        let template_dir = self.vm_dir(template_id);
        let network_name = spec.networks.first().cloned().unwrap_or_else(|| "VM Network".to_string());

        self.host_exec(&format!("mkdir -p {vm_dir}"), HOST_COMMAND_TIMEOUT).await?;

        // Cloud images arrive stream-optimized; convert to monolithicFlat
        // before the native-VMFS thin clone.
        let probe = self
            .host_exec(
                &format!("grep -l streamOptimized {template_dir}/*.vmdk 2>/dev/null || true"),
                HOST_COMMAND_TIMEOUT,
            )
            .await?;
        if !probe.trim().is_empty() {
            self.host_exec(
                &format!(
                    "vmkfstools -i {template_dir}/template.vmdk -d monolithicFlat {template_dir}/template-flat-import.vmdk && \
                     mv {template_dir}/template-flat-import.vmdk {template_dir}/template.vmdk"
                ),
                CLONE_TIMEOUT,
            )
            .await?;
        }
        self.host_exec(
            &format!("vmkfstools -i {template_dir}/template.vmdk -d thin {vm_dir}/disk.vmdk"),
            CLONE_TIMEOUT,
        )
        .await?;
        self.host_exec(
            &format!("vmkfstools -X {}G {vm_dir}/disk.vmdk || true", spec.disk_gib),
            HOST_COMMAND_TIMEOUT,
        )
        .await?;

        let seed_script = Self::seed_iso_script(&vm_dir, parameterization)?;
        if !seed_script.is_empty() {
            self.ssh
                .execute_script(&self.host, &seed_script, HOST_COMMAND_TIMEOUT)
                .await
                .and_then(|out| {
                    if out.success() {
                        Ok(())
                    } else {
                        Err(DomeError::permanent(format!("seed iso build failed: {}", out.stderr.trim())))
                    }
                })?;
        }

        let vmx = self.vmx_content(spec, &vm_dir, &network_name);
        self.ssh
            .execute_script(
                &self.host,
                &format!("cat > {vm_dir}/{name}.vmx <<'GLASSDOME_EOF'\n{vmx}\nGLASSDOME_EOF", name = spec.name),
                HOST_COMMAND_TIMEOUT,
            )
            .await?;

        let registered = self
            .host_exec(
                &format!("vim-cmd solo/registervm {vm_dir}/{}.vmx", spec.name),
                HOST_COMMAND_TIMEOUT,
            )
            .await?;
        let vm_id = registered.trim().to_string();
        if vm_id.parse::<u64>().is_err() {
            return Err(DomeError::permanent(format!("registervm returned '{vm_id}', expected a vmid")));
        }
        {
            let tombstones = self.tombstones.lock().await;
            if tombstones.contains(&vm_id) {
                return Err(DomeError::permanent(format!(
                    "esxi reissued vmid {vm_id} tombstoned in this session"
                )));
            }
        }

        self.host_exec(&format!("vim-cmd vmsvc/power.on {vm_id}"), HOST_COMMAND_TIMEOUT)
            .await?;
        info!(platform = %self.platform_id, %vm_id, name = %spec.name, "registered and powered on clone");

        Ok(VmRecord {
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
        })
    }

    async fn inject_config(&self, vm_id: &str, parameterization: &Parameterization) -> DomeResult<()> {
        // Rebuild the seed ISO; it is re-read on the next boot.
        let vms = self.all_vms().await?;
        let name = vms
            .iter()
            .find(|(id, _)| id == vm_id)
            .map(|(_, name)| name.clone())
            .ok_or_else(|| DomeError::missing(format!("esxi vm {vm_id} not found")))?;
        let vm_dir = self.vm_dir(&name);
        let script = Self::seed_iso_script(&vm_dir, parameterization)?;
        if script.is_empty() {
            return Ok(());
        }
        let output = self.ssh.execute_script(&self.host, &script, HOST_COMMAND_TIMEOUT).await?;
        if !output.success() {
            return Err(DomeError::permanent(format!("seed iso rebuild failed: {}", output.stderr.trim())));
        }
        Ok(())
    }

    async fn start_vm(&self, vm_id: &str) -> DomeResult<()> {
        if self.power_state(vm_id).await? == VmStatus::Running {
            return Ok(());
        }
        self.host_exec(&format!("vim-cmd vmsvc/power.on {vm_id}"), HOST_COMMAND_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn stop_vm(&self, vm_id: &str) -> DomeResult<()> {
        if self.power_state(vm_id).await? == VmStatus::Stopped {
            return Ok(());
        }
        self.host_exec(&format!("vim-cmd vmsvc/power.off {vm_id}"), HOST_COMMAND_TIMEOUT)
            .await
            .map(|_| ())
    }

    async fn reboot_vm(&self, vm_id: &str) -> DomeResult<()> {
        self.host_exec(&format!("vim-cmd vmsvc/power.reset {vm_id}"), HOST_COMMAND_TIMEOUT)
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
                self.tombstones.lock().await.insert(vm_id.to_string());
                return Ok(());
            }
            Err(err) => return Err(err),
        }
        self.host_exec(&format!("vim-cmd vmsvc/destroy {vm_id}"), HOST_COMMAND_TIMEOUT)
            .await?;
        self.tombstones.lock().await.insert(vm_id.to_string());
        Ok(())
    }

    async fn get_vm_status(&self, vm_id: &str) -> DomeResult<VmStatus> {
        if self.tombstones.lock().await.contains(vm_id) {
            return Ok(VmStatus::Deleted);
        }
        self.power_state(vm_id).await
    }

    async fn get_vm_ip(&self, vm_id: &str, timeout: Duration) -> DomeResult<IpAddr> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let raw = self
                .host_exec(&format!("vim-cmd vmsvc/get.guest {vm_id}"), HOST_COMMAND_TIMEOUT)
                .await?;
            if let Some(ip) = parse_guest_ip(&raw) {
                return Ok(ip);
            }
            debug!(vm_id, "vmware tools have not reported an address yet");
            if tokio::time::Instant::now() >= deadline {
                return Err(DomeError::timeout(format!("vmware-tools ip discovery for vm {vm_id}"), timeout));
            }
            tokio::time::sleep(GUEST_POLL_INTERVAL).await;
        }
    }

    async fn list_vms(&self, filter: &VmFilter) -> DomeResult<Vec<VmObservation>> {
        let vms = self.all_vms().await?;
        let mut observations = Vec::new();
        for (vm_id, name) in vms {
            if name.starts_with("template-") {
                continue;
            }
            if let Some(prefix) = &filter.name_prefix {
                if !name.starts_with(prefix.as_str()) {
                    continue;
                }
            }
            let status = self.power_state(&vm_id).await.unwrap_or(VmStatus::Error);
            observations.push(VmObservation {
                vm_id,
                name,
                status,
                primary_ip: None,
                guest_tools: GuestToolsState::Unknown,
                cores: None,
                memory_mib: None,
            });
        }
        Ok(observations)
    }

    async fn list_templates(&self) -> DomeResult<Vec<TemplateInfo>> {
        let vms = self.all_vms().await?;
        Ok(vms
            .into_iter()
            .filter(|(_, name)| name.starts_with("template-"))
            .map(|(_, name)| {
                let mut tags = std::collections::BTreeMap::new();
                tags.insert("guest-agent".to_string(), "true".to_string());
                TemplateInfo { id: name.clone(), name, tags }
            })
            .collect())
    }

    async fn list_networks(&self) -> DomeResult<Vec<NetworkObservation>> {
        let raw = self
            .host_exec(
                "esxcli network vswitch standard portgroup list | tail -n +3",
                HOST_COMMAND_TIMEOUT,
            )
            .await?;
        let mut networks = Vec::new();
        for line in raw.lines() {
            let mut parts = line.split_whitespace();
            let Some(name) = parts.next() else { continue };
            let vlan = line.split_whitespace().last().and_then(|v| v.parse::<u16>().ok());
            networks.push(NetworkObservation {
                network_id: name.to_string(),
                name: name.to_string(),
                vlan_tag: vlan.filter(|v| *v > 0),
            });
        }
        Ok(networks)
    }

    async fn create_network(&self, spec: &NetworkSpec) -> DomeResult<NetworkRecord> {
        if spec.mode == NetworkMode::Isolated {
            // A fresh vSwitch with no uplink is isolated by construction.
            self.host_exec(
                &format!("esxcli network vswitch standard add -v gd-{}", spec.name),
                HOST_COMMAND_TIMEOUT,
            )
            .await?;
            self.host_exec(
                &format!(
                    "esxcli network vswitch standard portgroup add -p {} -v gd-{}",
                    spec.name, spec.name
                ),
                HOST_COMMAND_TIMEOUT,
            )
            .await?;
        } else {
            self.host_exec(
                &format!("esxcli network vswitch standard portgroup add -p {} -v vSwitch0", spec.name),
                HOST_COMMAND_TIMEOUT,
            )
            .await?;
        }
        if let Some(vlan) = spec.vlan {
            self.host_exec(
                &format!("esxcli network vswitch standard portgroup set -p {} --vlan-id {vlan}", spec.name),
                HOST_COMMAND_TIMEOUT,
            )
            .await?;
        }
        Ok(NetworkRecord {
            network_id: spec.name.clone(),
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
            .host_exec(
                &format!(
                    "esxcli network vswitch standard portgroup remove -p {network_id} -v gd-{network_id} || \
                     esxcli network vswitch standard portgroup remove -p {network_id} -v vSwitch0"
                ),
                HOST_COMMAND_TIMEOUT,
            )
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

/// Pull the first IPv4 out of `vim-cmd vmsvc/get.guest` output.
fn parse_guest_ip(raw: &str) -> Option<IpAddr> {
    for line in raw.lines() {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("ipAddress = \"") {
            let candidate = rest.trim_end_matches("\",").trim_end_matches('"');
            if let Ok(ip) = candidate.parse::<IpAddr>() {
                match ip {
                    IpAddr::V4(v4) if v4.is_loopback() || v4.is_link_local() => continue,
                    IpAddr::V4(_) => return Some(ip),
                    IpAddr::V6(_) => continue,
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_ip_parses_vim_cmd_output() {
        let raw = r#"
            guest info:
            (vim.vm.GuestInfo) {
               toolsStatus = "toolsOk",
               ipAddress = "10.101.0.31",
               net = (vim.vm.GuestInfo.NicInfo) []
            }
        "#;
        assert_eq!(parse_guest_ip(raw).unwrap().to_string(), "10.101.0.31");
    }

    #[test]
    fn guest_ip_skips_unset_and_loopback() {
        assert!(parse_guest_ip("ipAddress = \"unset\",").is_none());
        assert!(parse_guest_ip("ipAddress = \"127.0.0.1\",").is_none());
    }

    #[test]
    fn seed_iso_script_carries_both_nocloud_files() {
        let parameterization = Parameterization::LinuxCloudInit {
            username: "ubuntu".into(),
            user_data: "#cloud-config\npackages: [qemu-guest-agent]".into(),
            ssh_public_key: "ssh-ed25519 AAAA lab".into(),
            static_ip: None,
            nameservers: vec![],
        };
        let script = EsxiAdapter::seed_iso_script("/vmfs/volumes/ds1/web", &parameterization).unwrap();
        assert!(script.contains("user-data"));
        assert!(script.contains("meta-data"));
        assert!(script.contains("-volid cidata"));
        assert!(script.contains("#cloud-config"));
    }
}
