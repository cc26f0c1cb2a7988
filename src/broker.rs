//! Connect orchestration.
//!
//! Drives a connect call through its phases: bring up the tunnel (or skip
//! it), dial the database through the chosen route, and hand back a
//! [`SessionHandle`]. A tunnel that came up for a connect that ultimately
//! fails is torn down before the error reaches the caller.

use crate::backoff::RetryConfig;
use crate::config::{BrokerConfig, Timeouts};
use crate::database;
use crate::error::BrokerError;
use crate::session::SessionHandle;
use crate::ssh::{TunnelManager, TunnelRoute, TunnelState};

/// Observable phases of one connect call, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectPhase {
    Start,
    /// Only emitted when SSH is enabled.
    TunnelEstablishing,
    /// SSH is disabled; the database gets dialed directly.
    TunnelSkipped,
    TunnelOpen { local_port: u16 },
    DatabaseConnecting,
    Ready,
    Failed { error: String },
}

/// Hands out database sessions, through an SSH tunnel when configured.
pub struct Broker {
    timeouts: Timeouts,
    retry: RetryConfig,
    tunnels: TunnelManager,
    phase_tx: async_channel::Sender<ConnectPhase>,
    phase_rx: async_channel::Receiver<ConnectPhase>,
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}

impl Broker {
    pub fn new() -> Self {
        let (phase_tx, phase_rx) = async_channel::bounded(256);
        Self {
            timeouts: Timeouts::default(),
            retry: RetryConfig::default(),
            tunnels: TunnelManager::new(),
            phase_tx,
            phase_rx,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Receiver for connect phase transitions.
    ///
    /// The underlying channel is a queue, not a broadcast: each phase is
    /// delivered to exactly one receiver, so hold a single subscriber.
    pub fn subscribe(&self) -> async_channel::Receiver<ConnectPhase> {
        self.phase_rx.clone()
    }

    /// Receiver for the tunnel layer's own state transitions.
    pub fn tunnel_events(&self) -> async_channel::Receiver<TunnelState> {
        self.tunnels.subscribe()
    }

    /// Run one connect call to completion.
    pub async fn connect(&self, config: &BrokerConfig) -> Result<SessionHandle, BrokerError> {
        self.broadcast(ConnectPhase::Start);
        let result = self.try_connect(config).await;
        self.finish(result)
    }

    /// Like [`Broker::connect`], but abandoned as soon as `cancel` yields.
    ///
    /// Cancellation drops the in-flight attempt, which kills any
    /// half-established ssh child. A closed cancel channel means the caller
    /// gave up the ability to cancel, not the connect itself.
    pub async fn connect_with_cancel(
        &self,
        config: &BrokerConfig,
        cancel: async_channel::Receiver<()>,
    ) -> Result<SessionHandle, BrokerError> {
        self.broadcast(ConnectPhase::Start);

        let attempt = self.try_connect(config);
        let cancelled = async {
            if cancel.recv().await.is_err() {
                futures::future::pending::<()>().await;
            }
            tracing::info!("connect cancelled by caller");
            Err(BrokerError::Cancelled)
        };

        let result = smol::future::or(attempt, cancelled).await;
        self.finish(result)
    }

    async fn try_connect(&self, config: &BrokerConfig) -> Result<SessionHandle, BrokerError> {
        config.validate()?;

        if config.use_ssh {
            self.broadcast(ConnectPhase::TunnelEstablishing);
        }
        let route = self.tunnels.establish(config, &self.timeouts).await?;
        match &route {
            TunnelRoute::Direct => self.broadcast(ConnectPhase::TunnelSkipped),
            TunnelRoute::Tunneled(tunnel) => self.broadcast(ConnectPhase::TunnelOpen {
                local_port: tunnel.local_port(),
            }),
        }

        let (host, port) = route.endpoint(config);
        self.broadcast(ConnectPhase::DatabaseConnecting);

        let opened =
            match database::open_session(&host, port, config, &self.retry, &self.timeouts).await {
                Ok(opened) => opened,
                Err(err) => {
                    // The tunnel must be down before the error escapes
                    self.tunnels.teardown(route).await;
                    return Err(err);
                }
            };

        let tunnel = match route {
            TunnelRoute::Direct => None,
            TunnelRoute::Tunneled(tunnel) => Some(tunnel),
        };

        Ok(SessionHandle::new(
            opened.pool,
            config.db_schema.clone(),
            opened.retries,
            tunnel,
        ))
    }

    fn finish(
        &self,
        result: Result<SessionHandle, BrokerError>,
    ) -> Result<SessionHandle, BrokerError> {
        match &result {
            Ok(handle) => {
                tracing::info!(session = %handle.id(), "session ready");
                self.broadcast(ConnectPhase::Ready);
            }
            Err(err) => {
                tracing::error!("connect failed: {}", err);
                self.broadcast(ConnectPhase::Failed {
                    error: err.to_string(),
                });
            }
        }
        result
    }

    // Phase updates are droppable when nobody is listening
    fn broadcast(&self, phase: ConnectPhase) {
        let _ = self.phase_tx.try_send(phase);
    }
}

/// Connect with default timeouts and retry schedule.
pub async fn connect(config: &BrokerConfig) -> Result<SessionHandle, BrokerError> {
    Broker::new().connect(config).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn direct_config(port: u16) -> BrokerConfig {
        BrokerConfig {
            debug_mode: false,
            use_ssh: false,
            db_host: "127.0.0.1".into(),
            db_port: port,
            db_user: "test".into(),
            db_password: "hunter2".into(),
            db_name: "test".into(),
            db_schema: "public".into(),
            ssh: None,
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            multiplier: 2.0,
            max_attempts: Some(2),
        }
    }

    #[test]
    fn test_invalid_config_fails_before_any_network() {
        smol::block_on(async {
            let broker = Broker::new();
            let phases = broker.subscribe();

            let mut config = direct_config(5432);
            config.db_host = String::new();

            let err = broker.connect(&config).await.unwrap_err();
            assert!(matches!(err, BrokerError::ConfigInvalid(_)));

            assert_eq!(phases.recv().await.unwrap(), ConnectPhase::Start);
            assert!(matches!(
                phases.recv().await.unwrap(),
                ConnectPhase::Failed { .. }
            ));
        });
    }

    #[test]
    fn test_direct_connect_phases_and_retry_exhaustion() {
        smol::block_on(async {
            let broker = Broker::new().with_retry(fast_retry());
            let phases = broker.subscribe();

            let err = broker.connect(&direct_config(1)).await.unwrap_err();
            match err {
                BrokerError::DbUnreachable { attempts, .. } => assert_eq!(attempts, 2),
                other => panic!("expected DbUnreachable, got {:?}", other),
            }

            // No tunnel phases beyond the explicit skip when ssh is off
            assert_eq!(phases.recv().await.unwrap(), ConnectPhase::Start);
            assert_eq!(phases.recv().await.unwrap(), ConnectPhase::TunnelSkipped);
            assert_eq!(
                phases.recv().await.unwrap(),
                ConnectPhase::DatabaseConnecting
            );
            assert!(matches!(
                phases.recv().await.unwrap(),
                ConnectPhase::Failed { .. }
            ));
        });
    }

    #[test]
    fn test_cancel_aborts_inflight_connect() {
        smol::block_on(async {
            // 192.0.2.1 (TEST-NET-1) never answers, so the connect hangs
            // until the timeout; cancelling must win the race.
            let broker = Broker::new();
            let mut config = direct_config(5432);
            config.db_host = "192.0.2.1".into();

            let (cancel_tx, cancel_rx) = async_channel::bounded::<()>(1);
            smol::spawn(async move {
                smol::Timer::after(Duration::from_millis(100)).await;
                let _ = cancel_tx.send(()).await;
            })
            .detach();

            let err = broker
                .connect_with_cancel(&config, cancel_rx)
                .await
                .unwrap_err();
            assert!(matches!(err, BrokerError::Cancelled));
        });
    }

    #[test]
    fn test_closed_cancel_channel_does_not_cancel() {
        smol::block_on(async {
            let retry = RetryConfig {
                max_attempts: Some(0),
                ..fast_retry()
            };
            let broker = Broker::new().with_retry(retry);

            let (cancel_tx, cancel_rx) = async_channel::bounded::<()>(1);
            drop(cancel_tx);

            let err = broker
                .connect_with_cancel(&direct_config(1), cancel_rx)
                .await
                .unwrap_err();
            // The connect runs to its own failure, not Cancelled
            assert!(matches!(err, BrokerError::DbUnreachable { .. }));
        });
    }
}
