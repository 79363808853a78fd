// src/provisioner/mod.rs
// OS provisioner: turns OS-level intent into a materialized VM on one
// platform. Chooses the template, renders the guest bootstrap, enforces the
// IP policy the target network demands, and guarantees a guest agent ends
// up in the machine one way or another.

pub mod parameterization;

use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{Config, PlatformKind};
use crate::errors::{retry, DomeError, DomeResult, RetryPolicy};
use crate::ippool::IpPool;
use crate::model::{
    IpAllocation, IpPolicy, NetworkMode, NetworkSpec, OsFamily, Parameterization, PlatformId,
    PostConfigStep, StaticIpConfig, VmRecord, VmSpec,
};
use crate::platform::{adapter_for, AdapterMap, TemplateInfo};

/// Playbook applied when the chosen template lacks a guest agent.
pub const GUEST_AGENT_PLAYBOOK: &str = "common/install_guest_agent.yml";

#[derive(Debug)]
pub struct ProvisionOutcome {
    pub record: VmRecord,
    pub allocation: Option<IpAllocation>,
    pub parameterization: Parameterization,
}

pub struct OsProvisioner {
    adapters: Arc<AdapterMap>,
    ip_pool: Arc<IpPool>,
    retry_policy: RetryPolicy,
}

impl OsProvisioner {
    pub fn new(adapters: Arc<AdapterMap>, ip_pool: Arc<IpPool>, config: &Config) -> Self {
        OsProvisioner {
            adapters,
            ip_pool,
            retry_policy: config.orchestrator.retry_policy(),
        }
    }

    /// Materialize a VM for `spec` on `platform_id`, attached to
    /// `target_network`. The returned record is CREATING; readiness is the
    /// orchestrator's business.
    pub async fn provision(
        &self,
        spec: &VmSpec,
        platform_id: &PlatformId,
        target_network: &NetworkSpec,
    ) -> DomeResult<ProvisionOutcome> {
        let adapter = adapter_for(&self.adapters, platform_id)?;
        let kind = adapter.kind();

        let policy = resolve_ip_policy(spec, target_network, kind)?;
        let allocation = match policy {
            IpPolicy::StaticPool => {
                let vm_ref = format!("{platform_id}/{}", spec.name);
                Some(self.ip_pool.allocate(&target_network.cidr, &vm_ref).await?)
            }
            IpPolicy::Dhcp | IpPolicy::PlatformAssigned => None,
        };

        let static_ip = match &allocation {
            Some(alloc) => Some(self.static_ip_config(alloc, target_network).await?),
            None => None,
        };

        let templates = adapter.list_templates().await?;
        let template = select_template(&templates, spec.os_family, &spec.os_version);
        let template_has_agent = template.map(|t| t.has_tag("guest-agent")).unwrap_or(false);
        let template_has_cloudbase = template.map(|t| t.has_tag("cloudbase-init")).unwrap_or(false);

        let parameterization =
            build_parameterization(spec, static_ip.clone(), template_has_agent, template_has_cloudbase)?;

        let param_ref = &parameterization;
        let result = match template {
            Some(template) => {
                debug!(vm = %spec.name, template = %template.id, "cloning from template");
                let template_id = template.id.as_str();
                retry(self.retry_policy, "clone_from_template", move || async move {
                    adapter.clone_from_template(template_id, spec, param_ref).await
                })
                .await
            }
            None if adapter.supports_live_install() => {
                info!(vm = %spec.name, os = %spec.os_family, version = %spec.os_version,
                      "no template; falling back to live-image install");
                retry(self.retry_policy, "create_vm", move || async move {
                    adapter.create_vm(spec, param_ref).await
                })
                .await
            }
            None => Err(DomeError::permanent(format!(
                "no template for {} {} on {platform_id} and the platform has no live-install path",
                spec.os_family, spec.os_version
            ))),
        };

        let mut record = match result {
            Ok(record) => record,
            Err(err) => {
                // Give the address back; the VM never came to exist.
                if let Some(alloc) = &allocation {
                    let _ = self.ip_pool.release(&alloc.cidr, alloc.ip).await;
                }
                return Err(err);
            }
        };

        if let Some(alloc) = &allocation {
            record.ip_fallback = alloc.fallback;
            record.expected_ip = Some(alloc.ip);
        }
        if !template_has_agent && !spec.os_family.is_windows() {
            ensure_guest_agent_step(&mut record.spec.post_config);
        }

        Ok(ProvisionOutcome { record, allocation, parameterization })
    }

    async fn static_ip_config(
        &self,
        allocation: &IpAllocation,
        network: &NetworkSpec,
    ) -> DomeResult<StaticIpConfig> {
        let prefix = network
            .cidr
            .split_once('/')
            .map(|(_, p)| p.to_string())
            .ok_or_else(|| DomeError::validation(format!("network cidr '{}' has no prefix", network.cidr)))?;
        let gateway = match network.gateway {
            Some(gw) => gw.to_string(),
            None => self.ip_pool.gateway(&allocation.cidr).await?.to_string(),
        };
        let nameservers = self
            .ip_pool
            .dns(&allocation.cidr)
            .await
            .iter()
            .map(ToString::to_string)
            .collect();
        Ok(StaticIpConfig {
            address: format!("{}/{prefix}", allocation.ip),
            gateway,
            nameservers,
        })
    }
}

/// IP policy by network class. ISOLATED on-prem networks have no DHCP; a
/// spec asking for it there is a bug in the spec, not a fallback.
pub fn resolve_ip_policy(
    spec: &VmSpec,
    network: &NetworkSpec,
    kind: PlatformKind,
) -> DomeResult<IpPolicy> {
    let on_prem = kind.is_on_prem();
    match (network.mode, on_prem) {
        (NetworkMode::Isolated, true) => {
            if spec.ip_policy == Some(IpPolicy::Dhcp) {
                return Err(DomeError::validation(format!(
                    "vm '{}' requests dhcp on isolated network '{}'; isolated on-prem networks require static addressing",
                    spec.name, network.name
                )));
            }
            Ok(IpPolicy::StaticPool)
        }
        (NetworkMode::Routed, true) | (NetworkMode::Bridged, true) => {
            Ok(spec.ip_policy.unwrap_or(IpPolicy::Dhcp))
        }
        (_, false) => Ok(IpPolicy::PlatformAssigned),
    }
}

/// Template key: the name is expected to start with `<family>-<version>`
/// with dots stripped, e.g. "ubuntu-2204-cloudinit".
pub fn select_template<'a>(
    templates: &'a [TemplateInfo],
    family: OsFamily,
    version: &str,
) -> Option<&'a TemplateInfo> {
    let normalized = version.replace('.', "");
    let prefix = format!("{family}-{normalized}");
    templates.iter().find(|t| t.name.starts_with(&prefix))
}

fn build_parameterization(
    spec: &VmSpec,
    static_ip: Option<StaticIpConfig>,
    template_has_agent: bool,
    template_has_cloudbase: bool,
) -> DomeResult<Parameterization> {
    match spec.os_family {
        OsFamily::Ubuntu | OsFamily::Debian | OsFamily::Kali => {
            let key = spec.credentials.ssh_public_key.as_deref().ok_or_else(|| {
                DomeError::validation(format!(
                    "vm '{}' has no ssh_public_key; cloud-init templates disable password auth",
                    spec.name
                ))
            })?;
            let user_data = parameterization::cloud_init_user_data(
                spec,
                key,
                static_ip.as_ref(),
                !template_has_agent,
            )?;
            let nameservers = static_ip
                .as_ref()
                .map(|ip| ip.nameservers.clone())
                .unwrap_or_default();
            Ok(Parameterization::LinuxCloudInit {
                username: spec.credentials.username.clone(),
                user_data,
                ssh_public_key: key.to_string(),
                static_ip,
                nameservers,
            })
        }
        OsFamily::Windows => {
            let password = spec.credentials.password.as_deref().ok_or_else(|| {
                DomeError::validation(format!(
                    "windows vm '{}' needs an admin password in its credentials bundle",
                    spec.name
                ))
            })?;
            if template_has_cloudbase {
                Ok(Parameterization::WindowsCloudbaseInit {
                    admin_username: spec.credentials.username.clone(),
                    admin_password: password.to_string(),
                    meta_data: parameterization::cloudbase_meta_data(spec, &spec.credentials.username),
                    user_data: parameterization::cloudbase_user_data(static_ip.as_ref()),
                    conf: parameterization::cloudbase_conf(),
                    static_ip,
                })
            } else {
                Ok(Parameterization::WindowsAutounattend {
                    xml: parameterization::autounattend_xml(spec, password, static_ip.as_ref()),
                })
            }
        }
        // Appliance images boot preconfigured; addressing and rules are
        // applied through post-config once the appliance is reachable.
        OsFamily::Pfsense => Ok(Parameterization::PlatformAssigned),
    }
}

fn ensure_guest_agent_step(steps: &mut Vec<PostConfigStep>) {
    if steps.iter().any(|s| s.playbook == GUEST_AGENT_PLAYBOOK) {
        return;
    }
    steps.push(PostConfigStep {
        playbook: GUEST_AGENT_PLAYBOOK.to_string(),
        vars: Default::default(),
        requires: vec![],
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IpPoolConfig;
    use crate::model::CredentialsBundle;
    use crate::platform::mock::MockPlatform;
    use std::collections::HashMap;

    fn vm_spec(name: &str, family: OsFamily) -> VmSpec {
        VmSpec {
            name: name.into(),
            os_family: family,
            os_version: if family.is_windows() { "2022".into() } else { "22.04".into() },
            cores: 2,
            memory_mib: 2048,
            disk_gib: 20,
            networks: vec!["lan".into()],
            ip_policy: None,
            credentials: CredentialsBundle {
                username: "ubuntu".into(),
                password: Some("S3cret!".into()),
                ssh_public_key: Some("ssh-ed25519 AAAA lab".into()),
                ssh_private_key_path: Some("~/.ssh/id_lab".into()),
            },
            post_config: vec![],
            tags: Default::default(),
            priority: 0,
        }
    }

    fn isolated_network() -> NetworkSpec {
        NetworkSpec {
            name: "lan".into(),
            cidr: "10.101.0.0/24".into(),
            mode: NetworkMode::Isolated,
            vlan: Some(101),
            gateway: None,
        }
    }

    fn provisioner() -> OsProvisioner {
        let platform = PlatformId::from("mock:a");
        let mut adapters: AdapterMap = HashMap::new();
        adapters.insert(platform.clone(), Arc::new(MockPlatform::new(platform)));
        let pool = IpPool::from_config(&[IpPoolConfig {
            cidr: "10.101.0.0/24".into(),
            range_start: "10.101.0.30".parse().unwrap(),
            range_end: "10.101.0.40".parse().unwrap(),
            gateway: "10.101.0.1".parse().unwrap(),
            dns: vec!["10.101.0.1".parse().unwrap()],
        }])
        .unwrap();
        let config = Config::default();
        OsProvisioner::new(Arc::new(adapters), Arc::new(pool), &config)
    }

    use crate::config::Config;

    #[tokio::test]
    async fn isolated_network_gets_a_pool_address() {
        let provisioner = provisioner();
        let outcome = provisioner
            .provision(&vm_spec("web", OsFamily::Ubuntu), &PlatformId::from("mock:a"), &isolated_network())
            .await
            .unwrap();
        let allocation = outcome.allocation.expect("static allocation");
        assert_eq!(allocation.ip.to_string(), "10.101.0.30");
        match &outcome.parameterization {
            Parameterization::LinuxCloudInit { static_ip: Some(ip), .. } => {
                assert_eq!(ip.address, "10.101.0.30/24");
                assert_eq!(ip.gateway, "10.101.0.1");
            }
            other => panic!("unexpected parameterization {other:?}"),
        }
    }

    #[tokio::test]
    async fn dhcp_on_isolated_network_is_rejected() {
        let provisioner = provisioner();
        let mut spec = vm_spec("web", OsFamily::Ubuntu);
        spec.ip_policy = Some(IpPolicy::Dhcp);
        let err = provisioner
            .provision(&spec, &PlatformId::from("mock:a"), &isolated_network())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn missing_ssh_key_is_rejected_before_any_platform_call() {
        let provisioner = provisioner();
        let mut spec = vm_spec("web", OsFamily::Ubuntu);
        spec.credentials.ssh_public_key = None;
        let err = provisioner
            .provision(&spec, &PlatformId::from("mock:a"), &isolated_network())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn windows_on_cloudbase_template_builds_configdrive() {
        let provisioner = provisioner();
        let outcome = provisioner
            .provision(&vm_spec("dc01", OsFamily::Windows), &PlatformId::from("mock:a"), &isolated_network())
            .await
            .unwrap();
        match &outcome.parameterization {
            Parameterization::WindowsCloudbaseInit { admin_password, conf, .. } => {
                assert_eq!(admin_password, "S3cret!");
                assert!(conf.contains("ConfigDriveService"));
            }
            other => panic!("unexpected parameterization {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_creation_releases_the_allocation() {
        let platform = PlatformId::from("mock:a");
        let mock = Arc::new(MockPlatform::new(platform.clone()));
        mock.fail_next("clone", DomeError::permanent("storage full")).await;
        let mut adapters: AdapterMap = HashMap::new();
        adapters.insert(platform.clone(), mock);
        let pool = Arc::new(
            IpPool::from_config(&[IpPoolConfig {
                cidr: "10.101.0.0/24".into(),
                range_start: "10.101.0.30".parse().unwrap(),
                range_end: "10.101.0.30".parse().unwrap(),
                gateway: "10.101.0.1".parse().unwrap(),
                dns: vec![],
            }])
            .unwrap(),
        );
        let provisioner = OsProvisioner::new(Arc::new(adapters), Arc::clone(&pool), &Config::default());
        provisioner
            .provision(&vm_spec("web", OsFamily::Ubuntu), &platform, &isolated_network())
            .await
            .unwrap_err();
        // The single pool address must be free again.
        let alloc = pool.allocate("10.101.0.0/24", "vm:retry").await.unwrap();
        assert_eq!(alloc.ip.to_string(), "10.101.0.30");
        assert!(!alloc.fallback);
    }

    #[test]
    fn template_selection_normalizes_versions() {
        let templates = vec![
            TemplateInfo { id: "9000".into(), name: "ubuntu-2204-cloudinit".into(), tags: Default::default() },
            TemplateInfo { id: "9100".into(), name: "windows-2022-cloudbase".into(), tags: Default::default() },
        ];
        assert_eq!(select_template(&templates, OsFamily::Ubuntu, "22.04").unwrap().id, "9000");
        assert_eq!(select_template(&templates, OsFamily::Windows, "2022").unwrap().id, "9100");
        assert!(select_template(&templates, OsFamily::Kali, "2024").is_none());
    }

    #[test]
    fn agentless_template_appends_the_install_step() {
        let mut steps = vec![];
        ensure_guest_agent_step(&mut steps);
        ensure_guest_agent_step(&mut steps);
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].playbook, GUEST_AGENT_PLAYBOOK);
    }
}
