// src/secrets.rs
// Process-wide secrets: resolved once at startup from the configured
// backend, immutable afterwards, threaded through constructors.

use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;

use crate::config::{Config, SecretsBackend, VaultConfig};
use crate::errors::{DomeError, DomeResult};

/// Credential material for one platform (or SSH endpoint). Which fields are
/// populated depends on the platform kind: Proxmox uses token or
/// username/password, clouds use key id/secret, hypervisor hosts may carry
/// an SSH private key.
#[derive(Deserialize, Clone, Default)]
pub struct PlatformCredentials {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub token_id: Option<String>,
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub ssh_private_key: Option<String>,
}

impl fmt::Debug for PlatformCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformCredentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("token_id", &self.token_id)
            .field("token_secret", &self.token_secret.as_ref().map(|_| "<redacted>"))
            .field("access_key", &self.access_key.as_ref().map(|_| "<redacted>"))
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("ssh_private_key", &self.ssh_private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Immutable bundle of every secret the configured platforms reference.
pub struct SecretsContext {
    entries: HashMap<String, PlatformCredentials>,
}

impl fmt::Debug for SecretsContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretsContext({} entries)", self.entries.len())
    }
}

impl SecretsContext {
    /// Resolve every `credentials_ref` named in the config, exactly once.
    /// Mock platforms authenticate nothing and are skipped.
    pub async fn load(config: &Config) -> DomeResult<Self> {
        let refs: Vec<&str> = config
            .platforms
            .iter()
            .filter(|p| p.kind != crate::config::PlatformKind::Mock)
            .map(|p| p.credentials_ref.as_str())
            .collect();

        let mut entries = HashMap::new();
        match config.secrets.backend {
            SecretsBackend::Env => {
                for name in refs {
                    entries.insert(name.to_string(), load_from_env(name)?);
                }
            }
            SecretsBackend::Vault => {
                let vault = config.secrets.vault.as_ref().ok_or_else(|| {
                    DomeError::validation("vault backend selected but [secrets.vault] is missing")
                })?;
                let client = VaultClient::connect(vault).await?;
                for name in refs {
                    entries.insert(name.to_string(), client.read_kv(name).await?);
                }
            }
        }
        Ok(SecretsContext { entries })
    }

    pub fn get(&self, credentials_ref: &str) -> DomeResult<&PlatformCredentials> {
        self.entries.get(credentials_ref).ok_or_else(|| {
            DomeError::missing(format!("no credentials loaded for ref '{credentials_ref}'"))
        })
    }

    #[cfg(test)]
    pub fn for_tests(entries: HashMap<String, PlatformCredentials>) -> Self {
        SecretsContext { entries }
    }
}

fn env_var_name(credentials_ref: &str) -> String {
    let sanitized: String = credentials_ref
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("GLASSDOME_SECRET_{sanitized}")
}

fn load_from_env(credentials_ref: &str) -> DomeResult<PlatformCredentials> {
    let var = env_var_name(credentials_ref);
    let raw = std::env::var(&var)
        .map_err(|_| DomeError::missing(format!("environment variable {var} is not set")))?;
    serde_json::from_str(&raw)
        .map_err(|e| DomeError::validation(format!("{var} does not contain credential JSON: {e}")))
}

struct VaultClient {
    http: reqwest::Client,
    address: String,
    mount: String,
    token: String,
}

impl VaultClient {
    async fn connect(config: &VaultConfig) -> DomeResult<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(config.skip_verify)
            .build()?;

        #[derive(Deserialize)]
        struct Auth {
            client_token: String,
        }
        #[derive(Deserialize)]
        struct LoginResponse {
            auth: Auth,
        }

        let url = format!("{}/v1/auth/approle/login", config.address.trim_end_matches('/'));
        let response = http
            .post(&url)
            .json(&serde_json::json!({
                "role_id": config.role_id,
                "secret_id": config.secret_id,
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DomeError::permanent_coded(
                format!("vault approle login failed: {}", response.status()),
                response.status().as_str().to_string(),
            ));
        }
        let login: LoginResponse = response.json().await?;

        Ok(VaultClient {
            http,
            address: config.address.trim_end_matches('/').to_string(),
            mount: config.mount.clone(),
            token: login.auth.client_token,
        })
    }

    async fn read_kv(&self, name: &str) -> DomeResult<PlatformCredentials> {
        #[derive(Deserialize)]
        struct Inner {
            data: PlatformCredentials,
        }
        #[derive(Deserialize)]
        struct KvResponse {
            data: Inner,
        }

        let url = format!("{}/v1/{}/data/{}", self.address, self.mount, name);
        let response = self
            .http
            .get(&url)
            .header("X-Vault-Token", &self.token)
            .send()
            .await?;
        if response.status().as_u16() == 404 {
            return Err(DomeError::missing(format!("vault has no secret at {}/data/{name}", self.mount)));
        }
        if !response.status().is_success() {
            return Err(DomeError::permanent_coded(
                format!("vault read of '{name}' failed: {}", response.status()),
                response.status().as_str().to_string(),
            ));
        }
        let kv: KvResponse = response.json().await?;
        Ok(kv.data.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_var_names_are_sanitized() {
        assert_eq!(env_var_name("pve01"), "GLASSDOME_SECRET_PVE01");
        assert_eq!(env_var_name("proxmox:pve-01"), "GLASSDOME_SECRET_PROXMOX_PVE_01");
    }

    #[test]
    fn env_backend_round_trip() {
        std::env::set_var(
            "GLASSDOME_SECRET_TESTREF",
            r#"{"username":"root@pam","token_id":"ops","token_secret":"abc123"}"#,
        );
        let creds = load_from_env("testref").unwrap();
        assert_eq!(creds.username.as_deref(), Some("root@pam"));
        assert_eq!(creds.token_secret.as_deref(), Some("abc123"));
        std::env::remove_var("GLASSDOME_SECRET_TESTREF");
    }

    #[test]
    fn missing_env_var_is_resource_missing() {
        let err = load_from_env("never-set").unwrap_err();
        assert_eq!(err.kind(), "resource_missing");
    }

    #[test]
    fn debug_output_redacts_material() {
        let creds = PlatformCredentials {
            password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let rendered = format!("{creds:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
