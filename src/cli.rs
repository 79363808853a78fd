// src/cli.rs

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::errors::{DomeError, DomeResult};
use crate::model::{
    ApprovalState, EntityKind, EntityRef, HostRecord, LabRecord, NetworkRecord, Request,
    RequestKind, Role, VmRecord,
};
use crate::overseer::Overseer;
use crate::registry::bus::TopicFilter;
use crate::registry::Registry;

/// Glassdome: cyber-range lab provisioning and supervision
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Cli {
    /// Optional path to the Glassdome configuration file
    #[clap(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Set log level
    #[clap(long, value_name = "LEVEL", value_enum, default_value_t = LogLevelCli::Info)]
    pub log_level: LogLevelCli,

    #[clap(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print an Overseer state summary
    Status,

    /// List known VMs
    Vms {
        /// Restrict to one lab
        #[clap(long, value_name = "ID")]
        lab: Option<String>,
    },

    /// List known networks
    Networks {
        #[clap(long, value_name = "ID")]
        lab: Option<String>,
    },

    /// List platforms and their health
    Hosts,

    /// Submit a deploy request for a lab spec file (YAML or JSON)
    Deploy {
        lab_spec_file: PathBuf,
        /// Requester recorded on the request
        #[clap(long, default_value = "operator")]
        requester: String,
        #[clap(long, value_enum, default_value_t = RoleCli::Admin)]
        role: RoleCli,
    },

    /// Submit a destroy request for a lab
    Destroy {
        lab_id: String,
        /// Override production protection
        #[clap(long)]
        force_production: bool,
        #[clap(long, default_value = "operator")]
        requester: String,
        #[clap(long, value_enum, default_value_t = RoleCli::Admin)]
        role: RoleCli,
    },

    /// List pending and recent requests with status
    Requests,

    /// Print registry events; --follow tails the live stream
    Events {
        #[clap(long)]
        follow: bool,
        /// Restrict to one entity ref, e.g. "lab:lab-12ab34"
        #[clap(long, value_name = "REF")]
        entity: Option<String>,
        /// Replay only events with a version greater than this
        #[clap(long, default_value_t = 0)]
        cursor: u64,
    },

    /// Print the consistent snapshot of one lab
    Snapshot { lab_id: String },
}

#[derive(clap::ValueEnum, Clone, Debug)]
pub enum LogLevelCli {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevelCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LogLevelCli::Trace => "trace",
            LogLevelCli::Debug => "debug",
            LogLevelCli::Info => "info",
            LogLevelCli::Warn => "warn",
            LogLevelCli::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
pub enum RoleCli {
    Viewer,
    Operator,
    Admin,
}

impl From<RoleCli> for Role {
    fn from(role: RoleCli) -> Role {
        match role {
            RoleCli::Viewer => Role::Viewer,
            RoleCli::Operator => Role::Operator,
            RoleCli::Admin => Role::Admin,
        }
    }
}

/// Parse a lab spec file, sniffing the format by extension.
pub fn read_lab_spec(path: &std::path::Path) -> DomeResult<crate::model::LabSpec> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        DomeError::validation(format!("cannot read lab spec {}: {e}", path.display()))
    })?;
    let is_json = path.extension().and_then(|e| e.to_str()) == Some("json");
    if is_json {
        Ok(serde_json::from_str(&raw)?)
    } else {
        Ok(serde_yaml::from_str(&raw)?)
    }
}

fn request_exit(request: &Request) -> DomeResult<()> {
    match request.approval_state {
        ApprovalState::Denied => {
            let reason = request.denial_reason.clone().unwrap_or(crate::model::DenialReason {
                rule: "unknown".into(),
                message: "denied without a recorded reason".into(),
                remediation: None,
            });
            if reason.rule == "platform_unreachable" {
                // Unreachable platforms get their own exit code.
                return Err(DomeError::transient(reason.message));
            }
            Err(DomeError::Authorization {
                rule: reason.rule,
                message: reason.message,
                remediation: reason.remediation,
            })
        }
        ApprovalState::Failed => Err(DomeError::permanent(
            request.failure.clone().unwrap_or_else(|| "request failed".to_string()),
        )),
        _ => Ok(()),
    }
}

pub async fn handle_command(
    command: Commands,
    registry: Arc<Registry>,
    overseer: Arc<Overseer>,
) -> DomeResult<()> {
    match command {
        Commands::Status => {
            let status = overseer.status().await;
            println!("overseer status");
            println!(
                "  requests: {} submitted / {} approved / {} denied / {} completed / {} failed",
                status.stats.submitted,
                status.stats.approved,
                status.stats.denied,
                status.stats.completed,
                status.stats.failed
            );
            println!("  remediations: {}", status.stats.remediations);
            println!("  pending requests: {}", status.pending_requests);
            println!("  watched labs: {}", if status.watched_labs.is_empty() {
                "none".to_string()
            } else {
                status.watched_labs.join(", ")
            });
            for (name, at) in &status.loop_ticks {
                println!("  loop {name}: last tick {at}");
            }
            Ok(())
        }

        Commands::Vms { lab } => {
            let vms: Vec<VmRecord> = registry.list(EntityKind::Vm).await;
            println!(
                "{:<18} {:<10} {:<18} {:<9} {:<16} {}",
                "NAME", "VM_ID", "PLATFORM", "STATUS", "IP", "LAB"
            );
            for vm in vms {
                if let Some(lab_filter) = &lab {
                    if vm.owner_lab.as_deref() != Some(lab_filter.as_str()) {
                        continue;
                    }
                }
                println!(
                    "{:<18} {:<10} {:<18} {:<9} {:<16} {}",
                    vm.spec.name,
                    vm.vm_id,
                    vm.platform_id,
                    vm.status.to_string(),
                    vm.primary_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "-".into()),
                    vm.owner_lab.unwrap_or_else(|| "-".into()),
                );
            }
            Ok(())
        }

        Commands::Networks { lab } => {
            let networks: Vec<NetworkRecord> = registry.list(EntityKind::Network).await;
            println!(
                "{:<14} {:<18} {:<18} {:<9} {:<6} {}",
                "NETWORK", "PLATFORM", "CIDR", "MODE", "VLAN", "LAB"
            );
            for network in networks {
                if let Some(lab_filter) = &lab {
                    if network.owner_lab.as_deref() != Some(lab_filter.as_str()) {
                        continue;
                    }
                }
                println!(
                    "{:<14} {:<18} {:<18} {:<9} {:<6} {}",
                    network.network_id,
                    network.platform_id,
                    network.cidr,
                    format!("{:?}", network.mode).to_lowercase(),
                    network.vlan_tag.map(|v| v.to_string()).unwrap_or_else(|| "-".into()),
                    network.owner_lab.unwrap_or_else(|| "-".into()),
                );
            }
            Ok(())
        }

        Commands::Hosts => {
            let hosts: Vec<HostRecord> = registry.list(EntityKind::Host).await;
            println!(
                "{:<18} {:<9} {:<10} {:<26} {:<5} {}",
                "PLATFORM", "KIND", "REACHABLE", "LAST_POLL", "VMS", "NETS"
            );
            for host in hosts {
                println!(
                    "{:<18} {:<9} {:<10} {:<26} {:<5} {}",
                    host.platform_id,
                    host.kind,
                    host.reachable,
                    host.last_successful_poll
                        .map(|at| at.to_rfc3339())
                        .unwrap_or_else(|| "never".into()),
                    host.vm_count,
                    host.network_count,
                );
            }
            Ok(())
        }

        Commands::Deploy { lab_spec_file, requester, role } => {
            let spec = read_lab_spec(&lab_spec_file)?;
            // Malformed specs are a validation error, not a denied request.
            overseer.validate_spec(&spec)?;
            let request = Request::new(RequestKind::DeployLab { spec }, requester, role.into());
            let finished = overseer.submit_and_wait(request).await?;
            println!(
                "request {} {}",
                finished.request_id, finished.approval_state
            );
            if let Some(reason) = &finished.denial_reason {
                println!("  denied by {}: {}", reason.rule, reason.message);
                if let Some(remediation) = &reason.remediation {
                    println!("  remediation: {remediation}");
                }
            }
            if let Some(failure) = &finished.failure {
                println!("  failure: {failure}");
            }
            request_exit(&finished)
        }

        Commands::Destroy { lab_id, force_production, requester, role } => {
            let request = Request::new(
                RequestKind::DestroyLab { lab_id, force_production },
                requester,
                role.into(),
            );
            let finished = overseer.submit_and_wait(request).await?;
            println!("request {} {}", finished.request_id, finished.approval_state);
            if let Some(reason) = &finished.denial_reason {
                println!("  denied by {}: {}", reason.rule, reason.message);
                if let Some(remediation) = &reason.remediation {
                    println!("  remediation: {remediation}");
                }
            }
            request_exit(&finished)
        }

        Commands::Requests => {
            let history = overseer.request_history().await;
            println!(
                "{:<38} {:<16} {:<10} {:<10} {}",
                "REQUEST", "KIND", "STATE", "REQUESTER", "DETAIL"
            );
            for request in history {
                let detail = request
                    .denial_reason
                    .as_ref()
                    .map(|r| r.rule.clone())
                    .or_else(|| request.failure.clone())
                    .unwrap_or_else(|| "-".into());
                println!(
                    "{:<38} {:<16} {:<10} {:<10} {}",
                    request.request_id,
                    request.kind.name(),
                    request.approval_state.to_string(),
                    request.requester,
                    detail,
                );
            }
            Ok(())
        }

        Commands::Events { follow, entity, cursor } => {
            let filter = match entity {
                Some(raw) => TopicFilter::for_entity(EntityRef::parse(&raw)?),
                None => TopicFilter::all(),
            };
            if follow {
                let mut subscription = registry.subscribe(filter, cursor).await;
                while let Some(event) = subscription.next().await {
                    print_event(&event);
                }
            } else {
                for event in registry.history_events(&filter, cursor).await {
                    print_event(&event);
                }
            }
            Ok(())
        }

        Commands::Snapshot { lab_id } => {
            let snapshot = registry.snapshot(&lab_id).await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
            Ok(())
        }
    }
}

fn print_event(event: &crate::model::StateChange) {
    let summary = event
        .next
        .get("status")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| "updated".to_string());
    println!(
        "v{:<5} {:<40} {:<13} {} {}",
        event.version,
        event.entity_ref.to_string(),
        format!("{:?}", event.source).to_lowercase(),
        event.detected_at.to_rfc3339(),
        summary,
    );
}

/// Print a lab record compactly; used by the resident mode's startup recap.
pub fn print_lab_line(lab: &LabRecord) {
    println!(
        "{:<16} {:<10} {:>3} vms {:>2} networks started {}",
        lab.lab_id,
        lab.status.to_string(),
        lab.vm_ids.len(),
        lab.network_ids.len(),
        lab.start_time.to_rfc3339(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lab_spec_parses_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lab.yaml");
        std::fs::write(
            &path,
            r#"
name: demo
platform: "mock:a"
networks:
  - name: lan
    cidr: "10.101.0.0/24"
    mode: isolated
    vlan: 101
vms:
  - name: web
    os_family: ubuntu
    os_version: "22.04"
    cores: 2
    memory_mib: 2048
    disk_gib: 20
    networks: [lan]
    credentials:
      username: ubuntu
      ssh_public_key: "ssh-ed25519 AAAA lab"
    post_config:
      - playbook: web/install_apache.yml
"#,
        )
        .unwrap();
        let spec = read_lab_spec(&path).unwrap();
        assert_eq!(spec.name, "demo");
        assert_eq!(spec.vms.len(), 1);
        assert_eq!(spec.vms[0].post_config[0].playbook, "web/install_apache.yml");
        assert_eq!(spec.networks[0].vlan, Some(101));
    }

    #[test]
    fn denied_requests_map_to_exit_code_three() {
        let mut request = Request::new(
            RequestKind::DestroyLab { lab_id: "x".into(), force_production: false },
            "alice",
            Role::Admin,
        );
        request.denial_reason = Some(crate::model::DenialReason {
            rule: "production_protected".into(),
            message: "no".into(),
            remediation: None,
        });
        request.transition(ApprovalState::Denied).unwrap();
        let err = request_exit(&request).unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn malformed_spec_is_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "nonsense: [").unwrap();
        let err = read_lab_spec(&path).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
