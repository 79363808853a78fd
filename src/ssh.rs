// src/ssh.rs
// Remote execution plane: authenticated remote commands and file transfer
// against VMs and platform hosts. Sessions are pooled per (host, credential)
// and lent to exactly one caller at a time.

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::SshPlaneConfig;
use crate::errors::{DomeError, DomeResult};
use crate::model::{SshAuth, SshTarget};

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

struct ClientHandler;

#[async_trait]
impl client::Handler for ClientHandler {
    type Error = russh::Error;

    // Lab VMs are freshly provisioned; host keys are accepted on first use.
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

pub struct SshSession {
    handle: Handle<ClientHandler>,
    created: Instant,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession").field("created", &self.created).finish()
    }
}

impl SshSession {
    async fn connect(target: &SshTarget, connect_timeout: Duration) -> DomeResult<Self> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(3600)),
            ..Default::default()
        });

        let addr = (target.host.as_str(), target.port);
        let mut handle = tokio::time::timeout(connect_timeout, client::connect(config, addr, ClientHandler))
            .await
            .map_err(|_| DomeError::timeout(format!("ssh connect to {}:{}", target.host, target.port), connect_timeout))??;

        let authenticated = match &target.auth {
            SshAuth::Password { password } => {
                handle.authenticate_password(target.username.as_str(), password.as_str()).await?
            }
            SshAuth::Key { private_key } => {
                let keypair = russh_keys::decode_secret_key(private_key, None)
                    .map_err(|e| DomeError::permanent(format!("bad ssh private key: {e}")))?;
                handle
                    .authenticate_publickey(target.username.as_str(), Arc::new(keypair))
                    .await?
            }
            SshAuth::KeyFile { path } => {
                let expanded = shellexpand::tilde(path).into_owned();
                let keypair = russh_keys::load_secret_key(&expanded, None)
                    .map_err(|e| DomeError::permanent(format!("cannot load ssh key {expanded}: {e}")))?;
                handle
                    .authenticate_publickey(target.username.as_str(), Arc::new(keypair))
                    .await?
            }
        };
        if !authenticated {
            return Err(DomeError::permanent(format!(
                "ssh authentication failed for {}@{}",
                target.username, target.host
            )));
        }

        Ok(SshSession { handle, created: Instant::now() })
    }

    fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Run a command, collecting stdout/stderr. A non-zero exit code is not
    /// an error; the caller decides. Missing the deadline closes the session.
    pub async fn execute(&self, command: &str, timeout: Duration) -> DomeResult<ExecOutput> {
        tokio::time::timeout(timeout, self.execute_inner(command))
            .await
            .map_err(|_| DomeError::timeout(format!("ssh exec '{command}'"), timeout))?
    }

    async fn execute_inner(&self, command: &str) -> DomeResult<ExecOutput> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_code = -1;
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => exit_code = exit_status as i32,
                _ => {}
            }
        }
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code,
        })
    }

    /// Upload a script, run it through `sh`, and clean it up again.
    pub async fn execute_script(&self, script_text: &str, timeout: Duration) -> DomeResult<ExecOutput> {
        let remote_path = format!("/tmp/glassdome-{}.sh", uuid::Uuid::new_v4());
        self.put(script_text.as_bytes(), &remote_path).await?;
        let result = self.execute(&format!("sh {remote_path}"), timeout).await;
        // Best-effort cleanup; the result of the script is what matters.
        let _ = self.execute(&format!("rm -f {remote_path}"), Duration::from_secs(10)).await;
        result
    }

    pub async fn put(&self, local_bytes: &[u8], remote_path: &str) -> DomeResult<()> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| DomeError::transient(format!("sftp session: {e}")))?;
        let mut file = sftp
            .create(remote_path)
            .await
            .map_err(|e| DomeError::transient(format!("sftp create {remote_path}: {e}")))?;
        file.write_all(local_bytes)
            .await
            .map_err(|e| DomeError::transient(format!("sftp write {remote_path}: {e}")))?;
        file.shutdown()
            .await
            .map_err(|e| DomeError::transient(format!("sftp close {remote_path}: {e}")))?;
        Ok(())
    }

    pub async fn get(&self, remote_path: &str) -> DomeResult<Vec<u8>> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = russh_sftp::client::SftpSession::new(channel.into_stream())
            .await
            .map_err(|e| DomeError::transient(format!("sftp session: {e}")))?;
        let mut file = sftp
            .open(remote_path)
            .await
            .map_err(|e| DomeError::transient(format!("sftp open {remote_path}: {e}")))?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .await
            .map_err(|e| DomeError::transient(format!("sftp read {remote_path}: {e}")))?;
        Ok(contents)
    }

    pub async fn close(self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

fn pool_key(target: &SshTarget) -> String {
    let auth_tag = match &target.auth {
        SshAuth::Password { .. } => format!("pw:{}", target.username),
        SshAuth::Key { private_key } => {
            format!("key:{}:{}", target.username, private_key.len())
        }
        SshAuth::KeyFile { path } => format!("keyfile:{}:{path}", target.username),
    };
    format!("{}:{}|{auth_tag}", target.host, target.port)
}

/// Bounded per-(host, credential) session pool. A leased session is used by
/// one caller; it returns to the pool if still young, otherwise it is closed.
pub struct SshPool {
    config: SshPlaneConfig,
    idle: Mutex<HashMap<String, Vec<SshSession>>>,
}

impl SshPool {
    pub fn new(config: SshPlaneConfig) -> Self {
        SshPool { config, idle: Mutex::new(HashMap::new()) }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connect_timeout_s)
    }

    async fn acquire(&self, target: &SshTarget) -> DomeResult<SshSession> {
        let key = pool_key(target);
        let ttl = Duration::from_secs(self.config.session_ttl_s);
        {
            let mut idle = self.idle.lock().await;
            if let Some(sessions) = idle.get_mut(&key) {
                while let Some(session) = sessions.pop() {
                    if session.age() < ttl {
                        debug!(host = %target.host, "reusing pooled ssh session");
                        return Ok(session);
                    }
                    session.close().await;
                }
            }
        }
        SshSession::connect(target, self.connect_timeout()).await
    }

    async fn release(&self, target: &SshTarget, session: SshSession) {
        let ttl = Duration::from_secs(self.config.session_ttl_s);
        if session.age() >= ttl {
            session.close().await;
            return;
        }
        let key = pool_key(target);
        let mut idle = self.idle.lock().await;
        let sessions = idle.entry(key).or_default();
        if sessions.len() < self.config.pool_size_per_host {
            sessions.push(session);
        } else {
            drop(idle);
            session.close().await;
        }
    }

    pub async fn execute(&self, target: &SshTarget, command: &str, timeout: Duration) -> DomeResult<ExecOutput> {
        let session = self.acquire(target).await?;
        match session.execute(command, timeout).await {
            Ok(output) => {
                self.release(target, session).await;
                Ok(output)
            }
            Err(err) => {
                // A session that missed a deadline is not trustworthy.
                session.close().await;
                Err(err)
            }
        }
    }

    pub async fn execute_script(&self, target: &SshTarget, script_text: &str, timeout: Duration) -> DomeResult<ExecOutput> {
        let session = self.acquire(target).await?;
        match session.execute_script(script_text, timeout).await {
            Ok(output) => {
                self.release(target, session).await;
                Ok(output)
            }
            Err(err) => {
                session.close().await;
                Err(err)
            }
        }
    }

    pub async fn put(&self, target: &SshTarget, local_bytes: &[u8], remote_path: &str) -> DomeResult<()> {
        let session = self.acquire(target).await?;
        match session.put(local_bytes, remote_path).await {
            Ok(()) => {
                self.release(target, session).await;
                Ok(())
            }
            Err(err) => {
                session.close().await;
                Err(err)
            }
        }
    }

    pub async fn get(&self, target: &SshTarget, remote_path: &str) -> DomeResult<Vec<u8>> {
        let session = self.acquire(target).await?;
        match session.get(remote_path).await {
            Ok(contents) => {
                self.release(target, session).await;
                Ok(contents)
            }
            Err(err) => {
                session.close().await;
                Err(err)
            }
        }
    }

    /// TCP reachability probe used by readiness checks; no authentication.
    pub async fn probe_tcp(host: &str, port: u16, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, tokio::net::TcpStream::connect((host, port))).await {
            Ok(Ok(_)) => true,
            Ok(Err(err)) => {
                warn!(host, port, %err, "tcp probe refused");
                false
            }
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str, user: &str) -> SshTarget {
        SshTarget {
            host: host.to_string(),
            port: 22,
            username: user.to_string(),
            auth: SshAuth::Password { password: "pw".to_string() },
        }
    }

    #[test]
    fn pool_keys_separate_hosts_and_credentials() {
        let a = pool_key(&target("10.0.0.1", "ubuntu"));
        let b = pool_key(&target("10.0.0.2", "ubuntu"));
        let c = pool_key(&target("10.0.0.1", "admin"));
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn exec_output_success_is_exit_zero() {
        let ok = ExecOutput { stdout: String::new(), stderr: String::new(), exit_code: 0 };
        let bad = ExecOutput { stdout: String::new(), stderr: String::new(), exit_code: 2 };
        assert!(ok.success());
        assert!(!bad.success());
    }

    #[tokio::test]
    async fn tcp_probe_fails_fast_on_closed_port() {
        // Port 1 on localhost is essentially never listening.
        let reachable = SshPool::probe_tcp("127.0.0.1", 1, Duration::from_millis(300)).await;
        assert!(!reachable);
    }

    #[tokio::test]
    async fn connect_times_out_against_blackhole() {
        let target = SshTarget {
            host: "192.0.2.1".to_string(), // TEST-NET-1, never routable
            port: 22,
            username: "nobody".to_string(),
            auth: SshAuth::Password { password: "x".to_string() },
        };
        let err = SshSession::connect(&target, Duration::from_millis(200)).await.unwrap_err();
        assert!(err.is_transient());
    }
}
