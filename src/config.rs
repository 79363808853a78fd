// src/config.rs
use anyhow::{Context, Result};
use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use xdg::BaseDirectories;

use crate::errors::{DomeError, DomeResult, RetryPolicy};

pub const APP_NAME: &str = "glassdome";
pub const DEFAULT_CONFIG_FILENAME: &str = "config.toml";

// Main configuration structure, mapping to config.toml
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub platforms: Vec<PlatformConfig>,
    #[serde(default)]
    pub secrets: SecretsConfig,
    #[serde(default)]
    pub ip_pools: Vec<IpPoolConfig>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub overseer: OverseerConfig,
    #[serde(default)]
    pub ssh: SshPlaneConfig,
    #[serde(default)]
    pub knowledge_index: KnowledgeIndexConfig,
    #[serde(default)]
    pub postconfig: PostconfigConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    Proxmox,
    Esxi,
    Aws,
    Azure,
    Gcp,
    Mock,
}

impl PlatformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformKind::Proxmox => "proxmox",
            PlatformKind::Esxi => "esxi",
            PlatformKind::Aws => "aws",
            PlatformKind::Azure => "azure",
            PlatformKind::Gcp => "gcp",
            PlatformKind::Mock => "mock",
        }
    }

    /// On-prem hypervisor families get the static-IP rules; clouds do not.
    pub fn is_on_prem(&self) -> bool {
        matches!(self, PlatformKind::Proxmox | PlatformKind::Esxi | PlatformKind::Mock)
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PlatformConfig {
    pub id: String,
    pub kind: PlatformKind,
    pub endpoint: String,
    /// Name resolved through the secrets backend at startup.
    pub credentials_ref: String,
    #[serde(default)]
    pub default_node: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub default_storage: Option<String>,
    #[serde(default)]
    pub datastore: Option<String>,
    #[serde(default = "default_true")]
    pub verify_tls: bool,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct RateLimitConfig {
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,
    #[serde(default = "default_rate_refill")]
    pub refill_per_s: u32,
}

fn default_rate_capacity() -> u32 {
    8
}
fn default_rate_refill() -> u32 {
    4
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        RateLimitConfig {
            capacity: default_rate_capacity(),
            refill_per_s: default_rate_refill(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SecretsBackend {
    #[default]
    Env,
    Vault,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct SecretsConfig {
    #[serde(default)]
    pub backend: SecretsBackend,
    #[serde(default)]
    pub vault: Option<VaultConfig>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct VaultConfig {
    pub address: String,
    pub role_id: String,
    pub secret_id: String,
    #[serde(default)]
    pub skip_verify: bool,
    #[serde(default = "default_vault_mount")]
    pub mount: String,
}

fn default_vault_mount() -> String {
    "secret".to_string()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct IpPoolConfig {
    pub cidr: String,
    pub range_start: IpAddr,
    pub range_end: IpAddr,
    pub gateway: IpAddr,
    #[serde(default)]
    pub dns: Vec<IpAddr>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct RegistryConfig {
    #[serde(default = "default_persistence_path")]
    pub persistence_path: String,
    #[serde(default)]
    pub event_bus: EventBusConfig,
    #[serde(default)]
    pub poll_intervals: PollIntervalsConfig,
}

fn default_persistence_path() -> String {
    "~/.glassdome/registry".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            persistence_path: default_persistence_path(),
            event_bus: EventBusConfig::default(),
            poll_intervals: PollIntervalsConfig::default(),
        }
    }
}

impl RegistryConfig {
    pub fn persistence_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.persistence_path).into_owned())
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventBusKind {
    #[default]
    #[serde(rename = "in-memory")]
    InMemory,
    #[serde(rename = "redis")]
    Redis,
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct EventBusConfig {
    #[serde(default)]
    pub kind: EventBusKind,
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,
}

fn default_bus_capacity() -> usize {
    1024
}

impl Default for EventBusConfig {
    fn default() -> Self {
        EventBusConfig {
            kind: EventBusKind::InMemory,
            capacity: default_bus_capacity(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct PollIntervalsConfig {
    #[serde(default = "default_poll_lab_s")]
    pub lab_s: u64,
    #[serde(default = "default_poll_vm_s")]
    pub vm_s: u64,
    #[serde(default = "default_poll_host_s")]
    pub host_s: u64,
}

fn default_poll_lab_s() -> u64 {
    1
}
fn default_poll_vm_s() -> u64 {
    10
}
fn default_poll_host_s() -> u64 {
    45
}

impl Default for PollIntervalsConfig {
    fn default() -> Self {
        PollIntervalsConfig {
            lab_s: default_poll_lab_s(),
            vm_s: default_poll_vm_s(),
            host_s: default_poll_host_s(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub max_concurrency: MaxConcurrencyConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default = "default_task_timeout_s")]
    pub task_timeout_default_s: u64,
}

fn default_task_timeout_s() -> u64 {
    300
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            max_concurrency: MaxConcurrencyConfig::default(),
            retry: RetryConfig::default(),
            task_timeout_default_s: default_task_timeout_s(),
        }
    }
}

impl OrchestratorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            base_delay: std::time::Duration::from_secs(self.retry.base_delay_s),
            cap_delay: std::time::Duration::from_secs(self.retry.cap_delay_s),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct MaxConcurrencyConfig {
    #[serde(default = "default_vm_concurrency")]
    pub vm: usize,
    #[serde(default = "default_postconfig_concurrency")]
    pub postconfig: usize,
}

fn default_vm_concurrency() -> usize {
    8
}
fn default_postconfig_concurrency() -> usize {
    4
}

impl Default for MaxConcurrencyConfig {
    fn default() -> Self {
        MaxConcurrencyConfig {
            vm: default_vm_concurrency(),
            postconfig: default_postconfig_concurrency(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    #[serde(default = "default_retry_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_base_s")]
    pub base_delay_s: u64,
    #[serde(default = "default_retry_cap_s")]
    pub cap_delay_s: u64,
}

fn default_retry_attempts() -> u32 {
    2
}
fn default_retry_base_s() -> u64 {
    2
}
fn default_retry_cap_s() -> u64 {
    60
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: default_retry_attempts(),
            base_delay_s: default_retry_base_s(),
            cap_delay_s: default_retry_cap_s(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct OverseerConfig {
    #[serde(default)]
    pub loop_intervals: LoopIntervalsConfig,
    #[serde(default = "default_mass_action_cap")]
    pub mass_action_cap: usize,
    #[serde(default = "default_freshness_horizon_s")]
    pub freshness_horizon_s: u64,
    #[serde(default = "default_true")]
    pub auto_remediate: bool,
    #[serde(default = "default_request_queue_depth")]
    pub request_queue_depth: usize,
}

fn default_mass_action_cap() -> usize {
    5
}
fn default_freshness_horizon_s() -> u64 {
    120
}
fn default_request_queue_depth() -> usize {
    64
}

impl Default for OverseerConfig {
    fn default() -> Self {
        OverseerConfig {
            loop_intervals: LoopIntervalsConfig::default(),
            mass_action_cap: default_mass_action_cap(),
            freshness_horizon_s: default_freshness_horizon_s(),
            auto_remediate: true,
            request_queue_depth: default_request_queue_depth(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct LoopIntervalsConfig {
    #[serde(default = "default_monitor_s")]
    pub monitor_s: u64,
    #[serde(default = "default_sync_s")]
    pub sync_s: u64,
    #[serde(default = "default_health_s")]
    pub health_s: u64,
}

fn default_monitor_s() -> u64 {
    30
}
fn default_sync_s() -> u64 {
    60
}
fn default_health_s() -> u64 {
    300
}

impl Default for LoopIntervalsConfig {
    fn default() -> Self {
        LoopIntervalsConfig {
            monitor_s: default_monitor_s(),
            sync_s: default_sync_s(),
            health_s: default_health_s(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(deny_unknown_fields)]
pub struct SshPlaneConfig {
    #[serde(default = "default_connect_timeout_s")]
    pub connect_timeout_s: u64,
    #[serde(default = "default_session_ttl_s")]
    pub session_ttl_s: u64,
    #[serde(default = "default_pool_size_per_host")]
    pub pool_size_per_host: usize,
}

fn default_connect_timeout_s() -> u64 {
    10
}
fn default_session_ttl_s() -> u64 {
    600
}
fn default_pool_size_per_host() -> usize {
    4
}

impl Default for SshPlaneConfig {
    fn default() -> Self {
        SshPlaneConfig {
            connect_timeout_s: default_connect_timeout_s(),
            session_ttl_s: default_session_ttl_s(),
            pool_size_per_host: default_pool_size_per_host(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct KnowledgeIndexConfig {
    /// Directory of operational documents; queries return ranked passages.
    #[serde(default)]
    pub path: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct PostconfigConfig {
    /// External configuration-management executor; invoked, never reimplemented.
    #[serde(default = "default_executor")]
    pub executor: String,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_playbook_dir")]
    pub playbook_dir: String,
    #[serde(default = "default_playbook_timeout_s")]
    pub timeout_s: u64,
}

fn default_executor() -> String {
    "ansible-playbook".to_string()
}
fn default_playbook_dir() -> String {
    "playbooks".to_string()
}
fn default_playbook_timeout_s() -> u64 {
    900
}

impl Default for PostconfigConfig {
    fn default() -> Self {
        PostconfigConfig {
            executor: default_executor(),
            extra_args: vec![],
            playbook_dir: default_playbook_dir(),
            timeout_s: default_playbook_timeout_s(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_dir() -> String {
    "~/.glassdome/logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            log_dir: default_log_dir(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Where the bundle lives: an explicit `--config` override wins,
    /// otherwise the XDG config home is searched.
    fn bundle_path(overridden: Option<&Path>) -> Result<PathBuf> {
        if let Some(explicit) = overridden {
            return Ok(explicit.to_path_buf());
        }
        let dirs = BaseDirectories::with_prefix(APP_NAME)?;
        Ok(dirs
            .find_config_file(DEFAULT_CONFIG_FILENAME)
            .unwrap_or_else(|| dirs.get_config_home().join(DEFAULT_CONFIG_FILENAME)))
    }

    /// Read the configuration bundle. A missing bundle yields the built-in
    /// defaults (which `validate()` will then reject for lacking platforms,
    /// surfacing the real problem to the operator).
    pub fn load(overridden: Option<&Path>) -> Result<Self> {
        let bundle = Self::bundle_path(overridden)?;
        if !bundle.exists() {
            warn!("no config bundle at {}; starting from built-in defaults", bundle.display());
            return Ok(Config::default());
        }
        info!("reading config bundle {}", bundle.display());
        let raw = std::fs::read_to_string(&bundle)
            .with_context(|| format!("config bundle {} is unreadable", bundle.display()))?;
        let parsed = toml::from_str(&raw)
            .with_context(|| format!("config bundle {} is not valid TOML", bundle.display()))?;
        Ok(parsed)
    }

    /// Structural validation beyond what serde can express. Run once after load.
    pub fn validate(&self) -> DomeResult<()> {
        if self.platforms.is_empty() {
            return Err(DomeError::validation("at least one [[platforms]] entry is required"));
        }
        let mut seen = std::collections::HashSet::new();
        for platform in &self.platforms {
            if platform.id.is_empty() {
                return Err(DomeError::validation("platforms.id must not be empty"));
            }
            if !seen.insert(platform.id.as_str()) {
                return Err(DomeError::validation(format!("duplicate platform id '{}'", platform.id)));
            }
            if platform.endpoint.is_empty() && platform.kind != PlatformKind::Mock {
                return Err(DomeError::validation(format!(
                    "platforms.endpoint missing for '{}'",
                    platform.id
                )));
            }
        }

        for pool in &self.ip_pools {
            let net: IpNet = pool
                .cidr
                .parse()
                .map_err(|e| DomeError::validation(format!("ip_pools.cidr '{}': {e}", pool.cidr)))?;
            for (name, addr) in [("range_start", pool.range_start), ("range_end", pool.range_end), ("gateway", pool.gateway)] {
                if !net.contains(&addr) {
                    return Err(DomeError::validation(format!(
                        "ip_pools.{name} {addr} is outside cidr {}",
                        pool.cidr
                    )));
                }
            }
            if pool.range_start > pool.range_end {
                return Err(DomeError::validation(format!(
                    "ip_pools range_start {} is after range_end {}",
                    pool.range_start, pool.range_end
                )));
            }
        }

        if self.registry.event_bus.kind == EventBusKind::Redis {
            return Err(DomeError::validation(
                "registry.event_bus.kind = \"redis\" is not compiled into this build; use \"in-memory\"",
            ));
        }

        if self.secrets.backend == SecretsBackend::Vault && self.secrets.vault.is_none() {
            return Err(DomeError::validation(
                "secrets_backend = \"vault\" requires a [secrets.vault] block with address, role_id, secret_id",
            ));
        }

        Ok(())
    }

    pub fn platform(&self, id: &str) -> Option<&PlatformConfig> {
        self.platforms.iter().find(|p| p.id == id)
    }

    pub fn pool_for_cidr(&self, cidr: &str) -> Option<&IpPoolConfig> {
        self.ip_pools.iter().find(|p| p.cidr == cidr)
    }

    pub fn log_dir(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.logging.log_dir).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            [[platforms]]
            id = "proxmox:pve01"
            kind = "proxmox"
            endpoint = "https://pve01.example:8006"
            credentials_ref = "pve01"
            default_node = "pve01"
            default_storage = "local-lvm"

            [[ip_pools]]
            cidr = "10.101.0.0/24"
            range_start = "10.101.0.30"
            range_end = "10.101.0.40"
            gateway = "10.101.0.1"
            dns = ["10.101.0.1"]
        "#
    }

    #[test]
    fn minimal_config_parses_and_validates() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        config.validate().unwrap();
        assert_eq!(config.orchestrator.max_concurrency.vm, 8);
        assert_eq!(config.orchestrator.max_concurrency.postconfig, 4);
        assert_eq!(config.overseer.mass_action_cap, 5);
        assert_eq!(config.registry.poll_intervals.lab_s, 1);
        assert_eq!(config.ssh.pool_size_per_host, 4);
    }

    #[test]
    fn empty_platform_list_is_rejected() {
        let config = Config::default();
        let err = config.validate().unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn pool_outside_cidr_is_rejected() {
        let toml_str = minimal_toml().replace("10.101.0.40", "10.102.0.40");
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn redis_bus_is_rejected_by_this_build() {
        let toml_str = format!(
            "{}\n[registry.event_bus]\nkind = \"redis\"\n",
            minimal_toml()
        );
        let config: Config = toml::from_str(&toml_str).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("redis"));
    }

    #[test]
    fn duplicate_platform_ids_are_rejected() {
        let toml_str = r#"
            [[platforms]]
            id = "proxmox:pve01"
            kind = "proxmox"
            endpoint = "https://pve01.example:8006"
            credentials_ref = "pve01"

            [[platforms]]
            id = "proxmox:pve01"
            kind = "proxmox"
            endpoint = "https://pve01b.example:8006"
            credentials_ref = "pve01b"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate platform id"));
    }
}
