//! Tunnel lifecycle and state broadcasting.

use super::tunnel::SshTunnel;
use super::types::SshTunnelConfig;
use crate::config::{BrokerConfig, Timeouts};
use crate::error::BrokerError;
use std::fmt;

/// Why a tunnel failed to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelFailure {
    SshUnreachable,
    SshAuthFailed,
    ForwardRejected,
    TimedOut,
}

impl TunnelFailure {
    fn from_error(err: &BrokerError) -> Option<Self> {
        match err {
            BrokerError::SshUnreachable(_) => Some(Self::SshUnreachable),
            BrokerError::SshAuthFailed(_) => Some(Self::SshAuthFailed),
            BrokerError::ForwardRejected(_) => Some(Self::ForwardRejected),
            BrokerError::Timeout { .. } => Some(Self::TimedOut),
            _ => None,
        }
    }
}

/// Observable lifecycle of the tunnel leg of a connect call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    /// Tunneling is off; the database is dialed directly.
    Disabled,
    Connecting,
    Open { local_port: u16 },
    Failed { cause: TunnelFailure },
    Closed,
}

impl TunnelState {
    pub fn is_open(&self) -> bool {
        matches!(self, TunnelState::Open { .. })
    }

    pub fn local_port(&self) -> Option<u16> {
        match self {
            TunnelState::Open { local_port } => Some(*local_port),
            _ => None,
        }
    }
}

/// Path the database connection takes.
pub enum TunnelRoute {
    /// Straight to the configured host, no SSH involved.
    Direct,
    Tunneled(SshTunnel),
}

impl TunnelRoute {
    /// Endpoint the database client should dial.
    pub fn endpoint(&self, config: &BrokerConfig) -> (String, u16) {
        match self {
            TunnelRoute::Direct => (config.db_host.clone(), config.db_port),
            TunnelRoute::Tunneled(tunnel) => {
                (tunnel.local_host().to_string(), tunnel.local_port())
            }
        }
    }
}

impl fmt::Debug for TunnelRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelRoute::Direct => f.write_str("Direct"),
            TunnelRoute::Tunneled(tunnel) => f
                .debug_tuple("Tunneled")
                .field(&tunnel.local_port())
                .finish(),
        }
    }
}

/// Establishes tunnels and broadcasts their state transitions.
pub struct TunnelManager {
    state_tx: async_channel::Sender<TunnelState>,
    state_rx: async_channel::Receiver<TunnelState>,
}

impl Default for TunnelManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TunnelManager {
    pub fn new() -> Self {
        let (state_tx, state_rx) = async_channel::bounded(256);
        Self { state_tx, state_rx }
    }

    /// Receiver for tunnel state transitions.
    ///
    /// The underlying channel is a queue, not a broadcast: each transition
    /// is delivered to exactly one receiver, so hold a single subscriber.
    pub fn subscribe(&self) -> async_channel::Receiver<TunnelState> {
        self.state_rx.clone()
    }

    /// Bring up the route the configuration asks for.
    ///
    /// With `use_ssh` off this performs no network activity at all and
    /// returns `TunnelRoute::Direct` after broadcasting `Disabled`.
    pub async fn establish(
        &self,
        config: &BrokerConfig,
        timeouts: &Timeouts,
    ) -> Result<TunnelRoute, BrokerError> {
        if !config.use_ssh {
            tracing::debug!("ssh disabled, dialing the database directly");
            self.broadcast(TunnelState::Disabled);
            return Ok(TunnelRoute::Direct);
        }

        let tunnel_config = SshTunnelConfig::from_broker(config)?;
        self.broadcast(TunnelState::Connecting);

        match SshTunnel::start(tunnel_config, timeouts).await {
            Ok(tunnel) => {
                self.broadcast(TunnelState::Open {
                    local_port: tunnel.local_port(),
                });
                Ok(TunnelRoute::Tunneled(tunnel))
            }
            Err(err) => {
                if let Some(cause) = TunnelFailure::from_error(&err) {
                    self.broadcast(TunnelState::Failed { cause });
                }
                Err(err)
            }
        }
    }

    /// Tear a route down, broadcasting `Closed` for tunneled routes.
    pub async fn teardown(&self, route: TunnelRoute) {
        if let TunnelRoute::Tunneled(tunnel) = route {
            tunnel.shutdown().await;
            self.broadcast(TunnelState::Closed);
        }
    }

    // try_send keeps establish from blocking when nobody is listening;
    // state updates are droppable once the buffer fills.
    fn broadcast(&self, state: TunnelState) {
        let _ = self.state_tx.try_send(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn direct_config() -> BrokerConfig {
        BrokerConfig {
            debug_mode: false,
            use_ssh: false,
            db_host: "localhost".into(),
            db_port: 5434,
            db_user: "test".into(),
            db_password: "hunter2".into(),
            db_name: "test".into(),
            db_schema: "public".into(),
            ssh: None,
        }
    }

    #[test]
    fn test_disabled_route_is_direct() {
        smol::block_on(async {
            let manager = TunnelManager::new();
            let states = manager.subscribe();

            let route = manager
                .establish(&direct_config(), &Timeouts::default())
                .await
                .unwrap();

            assert!(matches!(route, TunnelRoute::Direct));
            assert_eq!(states.recv().await.unwrap(), TunnelState::Disabled);

            let (host, port) = route.endpoint(&direct_config());
            assert_eq!(host, "localhost");
            assert_eq!(port, 5434);
        });
    }

    #[test]
    fn test_unreachable_ssh_host_fails_fast() {
        smol::block_on(async {
            let mut config = direct_config();
            config.use_ssh = true;
            config.ssh = Some(crate::config::SshConfig {
                // 127.0.0.1:1 refuses immediately, no real ssh server needed
                ssh_host: "127.0.0.1".into(),
                ssh_port: 1,
                ssh_user: "nobody".into(),
                auth: crate::ssh::SshAuthMethod::KeyFile {
                    path: "/nonexistent/key".into(),
                    passphrase: None,
                },
                remote_bind_port: None,
            });

            let timeouts = Timeouts {
                ssh_connect: Duration::from_secs(2),
                tunnel_ready: Duration::from_secs(5),
                db_connect: Duration::from_secs(2),
            };

            let manager = TunnelManager::new();
            let states = manager.subscribe();
            let err = manager.establish(&config, &timeouts).await.unwrap_err();
            assert!(matches!(err, BrokerError::SshUnreachable(_)));

            assert_eq!(states.recv().await.unwrap(), TunnelState::Connecting);
            assert_eq!(
                states.recv().await.unwrap(),
                TunnelState::Failed {
                    cause: TunnelFailure::SshUnreachable
                }
            );
        });
    }

    #[test]
    fn test_state_helpers() {
        assert!(TunnelState::Open { local_port: 6000 }.is_open());
        assert!(!TunnelState::Closed.is_open());
        assert_eq!(
            TunnelState::Open { local_port: 6000 }.local_port(),
            Some(6000)
        );
        assert_eq!(TunnelState::Disabled.local_port(), None);
    }
}
