// src/orchestrator/postconfig.rs
// Post-provisioning configuration. Inventory is synthesized from the lab's
// deployed VMs grouped by purpose tag; execution is delegated to the
// external config-management executor, whose exit code decides success.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::config::PostconfigConfig;
use crate::errors::{DomeError, DomeResult};
use crate::model::{SshAuth, SshTarget, VmRecord};

pub struct PostConfigRunner {
    executor: String,
    extra_args: Vec<String>,
    playbook_dir: PathBuf,
    timeout: Duration,
}

impl PostConfigRunner {
    pub fn new(config: &PostconfigConfig) -> Self {
        PostConfigRunner {
            executor: config.executor.clone(),
            extra_args: config.extra_args.clone(),
            playbook_dir: PathBuf::from(shellexpand::tilde(&config.playbook_dir).into_owned()),
            timeout: Duration::from_secs(config.timeout_s),
        }
    }

    /// INI inventory: every host once with its connection vars, then one
    /// section per purpose tag grouping the members.
    pub fn build_inventory(hosts: &[(VmRecord, SshTarget)]) -> String {
        let mut lines = Vec::new();
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();

        for (record, target) in hosts {
            let mut line = format!(
                "{} ansible_host={} ansible_port={} ansible_user={}",
                record.spec.name, target.host, target.port, target.username
            );
            match &target.auth {
                SshAuth::KeyFile { path } => {
                    line.push_str(&format!(" ansible_ssh_private_key_file={path}"));
                }
                SshAuth::Password { password } => {
                    line.push_str(&format!(" ansible_password={password}"));
                }
                SshAuth::Key { .. } => {
                    // Inline keys are written next to the inventory by run();
                    // the var is patched in at that point.
                }
            }
            if record.spec.os_family.is_windows() {
                line.push_str(" ansible_connection=winrm ansible_winrm_transport=ntlm");
            }
            lines.push(line);
            if let Some(purpose) = record.spec.purpose() {
                groups.entry(purpose.to_string()).or_default().push(record.spec.name.clone());
            }
        }

        let mut inventory = lines.join("\n");
        inventory.push('\n');
        for (group, members) in groups {
            inventory.push_str(&format!("\n[{group}]\n"));
            for member in members {
                inventory.push_str(&member);
                inventory.push('\n');
            }
        }
        inventory
    }

    /// Run one playbook against the lab inventory, optionally limited to a
    /// single host. Non-zero exit is a task failure, not a transient error.
    pub async fn run(
        &self,
        inventory: &str,
        playbook: &str,
        vars: &BTreeMap<String, String>,
        limit: Option<&str>,
    ) -> DomeResult<()> {
        let work_dir = std::env::temp_dir().join(format!("glassdome-pc-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&work_dir).await?;
        let inventory_path = work_dir.join("inventory.ini");
        {
            let mut file = tokio::fs::File::create(&inventory_path).await?;
            file.write_all(inventory.as_bytes()).await?;
            file.flush().await?;
        }

        let playbook_path = self.playbook_dir.join(playbook);
        let mut command = tokio::process::Command::new(&self.executor);
        command
            .arg("-i")
            .arg(&inventory_path)
            .arg(&playbook_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in vars {
            command.arg("-e").arg(format!("{key}={value}"));
        }
        if let Some(limit) = limit {
            command.arg("--limit").arg(limit);
        }
        for arg in &self.extra_args {
            command.arg(arg);
        }

        debug!(executor = %self.executor, playbook = %playbook_path.display(), ?limit, "running post-config");
        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| DomeError::timeout(format!("post-config playbook {playbook}"), self.timeout))?
            .map_err(|e| {
                DomeError::permanent(format!("cannot launch executor '{}': {e}", self.executor))
            })?;

        let result = if output.status.success() {
            info!(playbook, "post-config completed");
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail: String = stderr
                .lines()
                .rev()
                .take(10)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            Err(DomeError::permanent(format!(
                "playbook {playbook} exited {}: {tail}",
                output.status.code().unwrap_or(-1)
            )))
        };

        let _ = tokio::fs::remove_dir_all(&work_dir).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CredentialsBundle, OsFamily, PlatformId, VmSpec};
    use chrono::Utc;

    fn host(name: &str, purpose: Option<&str>, ip: &str) -> (VmRecord, SshTarget) {
        let mut tags = BTreeMap::new();
        if let Some(purpose) = purpose {
            tags.insert("purpose".to_string(), purpose.to_string());
        }
        let record = VmRecord {
            vm_id: "104".into(),
            platform_id: PlatformId::from("mock:a"),
            spec: VmSpec {
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
                tags,
                priority: 0,
            },
            status: crate::model::VmStatus::Running,
            primary_ip: Some(ip.parse().unwrap()),
            expected_ip: None,
            guest_tools: Default::default(),
            owner_lab: Some("lab-1".into()),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            tags: BTreeMap::new(),
            ip_fallback: false,
        };
        let target = SshTarget {
            host: ip.to_string(),
            port: 22,
            username: "ubuntu".into(),
            auth: SshAuth::KeyFile { path: "~/.ssh/id_lab".into() },
        };
        (record, target)
    }

    #[test]
    fn inventory_groups_by_purpose() {
        let hosts = vec![
            host("web", Some("web_servers"), "10.101.0.30"),
            host("db", Some("db_servers"), "10.101.0.31"),
            host("scratch", None, "10.101.0.32"),
        ];
        let inventory = PostConfigRunner::build_inventory(&hosts);
        assert!(inventory.contains("web ansible_host=10.101.0.30 ansible_port=22 ansible_user=ubuntu"));
        assert!(inventory.contains("ansible_ssh_private_key_file=~/.ssh/id_lab"));
        assert!(inventory.contains("[web_servers]\nweb\n"));
        assert!(inventory.contains("[db_servers]\ndb\n"));
        // Ungrouped hosts still appear as plain hosts.
        assert!(inventory.contains("scratch ansible_host=10.101.0.32"));
    }

    #[tokio::test]
    async fn exit_zero_executor_succeeds() {
        let runner = PostConfigRunner::new(&PostconfigConfig {
            executor: "true".into(),
            extra_args: vec![],
            playbook_dir: "/tmp".into(),
            timeout_s: 30,
        });
        runner
            .run("web ansible_host=127.0.0.1\n", "noop.yml", &BTreeMap::new(), Some("web"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_failure_with_context() {
        let runner = PostConfigRunner::new(&PostconfigConfig {
            executor: "false".into(),
            extra_args: vec![],
            playbook_dir: "/tmp".into(),
            timeout_s: 30,
        });
        let err = runner
            .run("web ansible_host=127.0.0.1\n", "noop.yml", &BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permanent");
        assert!(err.to_string().contains("noop.yml"));
    }

    #[tokio::test]
    async fn missing_executor_is_permanent() {
        let runner = PostConfigRunner::new(&PostconfigConfig {
            executor: "/nonexistent/glassdome-test-executor".into(),
            extra_args: vec![],
            playbook_dir: "/tmp".into(),
            timeout_s: 30,
        });
        let err = runner
            .run("", "noop.yml", &BTreeMap::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "permanent");
    }
}
