//! Immutable, validated connection configuration.
//!
//! The broker takes configuration as an explicit value rather than reading
//! process-wide mutable state. `BrokerConfig::from_env` covers the common
//! deployment path where parameters arrive through the environment.

use crate::error::BrokerError;
use crate::ssh::SshAuthMethod;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection parameters for one warehouse.
///
/// Immutable after construction; `validate` is called by the broker before
/// any network activity. The `Debug` impl redacts credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub debug_mode: bool,
    pub use_ssh: bool,
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub db_schema: String,
    /// Required when `use_ssh` is true, ignored otherwise.
    pub ssh: Option<SshConfig>,
}

/// SSH connection details for tunneled access.
#[derive(Clone, Serialize, Deserialize)]
pub struct SshConfig {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub auth: SshAuthMethod,
    /// Local port to bind for the forward (the name mirrors the
    /// `REMOTE_BIND_PORT` environment variable). None binds an ephemeral
    /// port.
    pub remote_bind_port: Option<u16>,
}

impl BrokerConfig {
    /// Build configuration from the process environment.
    ///
    /// Reads `DEBUG_MODE`, `USE_SSH`, `DB_HOST`, `DB_USER`, `DB_PASSWORD`,
    /// `DB_NAME`, `DB_SCHEMA`, `DB_PORT` and, when `USE_SSH=true`,
    /// `SSH_HOST`, `SSH_PORT` (default 22), `SSH_USER`, `SSHKEYPATH` or
    /// `SSH_PASSWORD`, and `REMOTE_BIND_PORT` (falling back to
    /// `LOCAL_BIND_PORT`, the older name for the same knob).
    pub fn from_env() -> Result<Self, BrokerError> {
        let use_ssh = env_flag("USE_SSH");

        let ssh = if use_ssh {
            let auth = match std::env::var("SSHKEYPATH") {
                Ok(path) if !path.is_empty() => SshAuthMethod::KeyFile {
                    path,
                    passphrase: std::env::var("SSH_KEY_PASSPHRASE").ok(),
                },
                _ => SshAuthMethod::Password(env_required("SSH_PASSWORD")?),
            };
            Some(SshConfig {
                ssh_host: env_required("SSH_HOST")?,
                ssh_port: env_port("SSH_PORT")?.unwrap_or(22),
                ssh_user: env_required("SSH_USER")?,
                auth,
                remote_bind_port: env_port("REMOTE_BIND_PORT")?
                    .or(env_port("LOCAL_BIND_PORT")?),
            })
        } else {
            None
        };

        let config = Self {
            debug_mode: env_flag("DEBUG_MODE"),
            use_ssh,
            db_host: env_required("DB_HOST")?,
            db_port: env_port("DB_PORT")?
                .ok_or_else(|| BrokerError::ConfigInvalid("DB_PORT is not set".into()))?,
            db_user: env_required("DB_USER")?,
            db_password: env_required("DB_PASSWORD")?,
            db_name: env_required("DB_NAME")?,
            db_schema: env_required("DB_SCHEMA")?,
            ssh,
        };
        config.validate()?;
        Ok(config)
    }

    /// Check the invariants the broker relies on.
    pub fn validate(&self) -> Result<(), BrokerError> {
        require_field(&self.db_host, "db_host")?;
        require_field(&self.db_user, "db_user")?;
        require_field(&self.db_name, "db_name")?;
        require_field(&self.db_schema, "db_schema")?;
        if self.db_port == 0 {
            return Err(BrokerError::ConfigInvalid("db_port must be 1-65535".into()));
        }

        if self.use_ssh {
            let ssh = self.ssh.as_ref().ok_or_else(|| {
                BrokerError::ConfigInvalid("use_ssh is true but ssh settings are missing".into())
            })?;
            require_field(&ssh.ssh_host, "ssh_host")?;
            require_field(&ssh.ssh_user, "ssh_user")?;
            if ssh.ssh_port == 0 {
                return Err(BrokerError::ConfigInvalid("ssh_port must be 1-65535".into()));
            }
            match &ssh.auth {
                SshAuthMethod::Password(p) if p.is_empty() => {
                    return Err(BrokerError::ConfigInvalid("ssh password is empty".into()));
                }
                SshAuthMethod::KeyFile { path, .. } if path.is_empty() => {
                    return Err(BrokerError::ConfigInvalid("ssh key path is empty".into()));
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("debug_mode", &self.debug_mode)
            .field("use_ssh", &self.use_ssh)
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_user", &self.db_user)
            .field("db_password", &"<redacted>")
            .field("db_name", &self.db_name)
            .field("db_schema", &self.db_schema)
            .field("ssh", &self.ssh)
            .finish()
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("ssh_host", &self.ssh_host)
            .field("ssh_port", &self.ssh_port)
            .field("ssh_user", &self.ssh_user)
            .field("auth", &self.auth)
            .field("remote_bind_port", &self.remote_bind_port)
            .finish()
    }
}

/// Per-stage time budgets for one connect call.
///
/// The system ssh binary performs authentication and forward setup inside a
/// single child process, so those two stages share the `tunnel_ready`
/// deadline; the TCP connect to the SSH host gets its own bound via
/// `-o ConnectTimeout`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    pub ssh_connect: Duration,
    pub tunnel_ready: Duration,
    pub db_connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            ssh_connect: Duration::from_secs(10),
            tunnel_ready: Duration::from_secs(15),
            db_connect: Duration::from_secs(10),
        }
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn env_required(key: &str) -> Result<String, BrokerError> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => Err(BrokerError::ConfigInvalid(format!("{} is not set", key))),
    }
}

fn env_port(key: &str) -> Result<Option<u16>, BrokerError> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => v
            .parse::<u16>()
            .map(Some)
            .map_err(|_| BrokerError::ConfigInvalid(format!("{} is not a valid port: {}", key, v))),
        _ => Ok(None),
    }
}

fn require_field(value: &str, name: &str) -> Result<(), BrokerError> {
    if value.is_empty() {
        Err(BrokerError::ConfigInvalid(format!("{} is empty", name)))
    } else {
        Ok(())
    }
}
