//! SSH tunnel configuration types.

use crate::config::BrokerConfig;
use crate::error::BrokerError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Credential used to authenticate against the SSH host.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SshAuthMethod {
    /// Password authentication, delivered via the askpass proxy.
    Password(String),
    /// Private key file with optional passphrase.
    KeyFile {
        path: String,
        passphrase: Option<String>,
    },
}

impl fmt::Debug for SshAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuthMethod::Password(_) => f.write_str("Password(<redacted>)"),
            SshAuthMethod::KeyFile { path, passphrase } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .field(
                    "passphrase",
                    &passphrase.as_ref().map(|_| "<redacted>"),
                )
                .finish(),
        }
    }
}

/// Parameters for one forwarded port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshTunnelConfig {
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub auth_method: SshAuthMethod,
    /// Database host as seen from the SSH server
    pub remote_host: String,
    pub remote_port: u16,
    /// Local bind address (loopback only)
    pub local_bind_host: String,
    /// Local port to bind; 0 picks an ephemeral port
    pub local_bind_port: u16,
}

impl SshTunnelConfig {
    /// Derive the tunnel parameters from a validated broker configuration.
    pub fn from_broker(config: &BrokerConfig) -> Result<Self, BrokerError> {
        let ssh = config.ssh.as_ref().ok_or_else(|| {
            BrokerError::ConfigInvalid("use_ssh is true but ssh settings are missing".into())
        })?;
        Ok(Self {
            ssh_host: ssh.ssh_host.clone(),
            ssh_port: ssh.ssh_port,
            ssh_user: ssh.ssh_user.clone(),
            auth_method: ssh.auth.clone(),
            remote_host: config.db_host.clone(),
            remote_port: config.db_port,
            local_bind_host: "127.0.0.1".to_string(),
            local_bind_port: ssh.remote_bind_port.unwrap_or(0),
        })
    }

    /// Destination argument for the ssh binary (user@host).
    pub fn ssh_destination(&self) -> String {
        if self.ssh_user.is_empty() {
            self.ssh_host.clone()
        } else {
            format!("{}@{}", self.ssh_user, self.ssh_host)
        }
    }
}
