//! wharf — a connection broker for Postgres-compatible warehouses.
//!
//! Given a validated configuration, wharf hands out a ready
//! [`SessionHandle`]: directly, or through an SSH tunnel it brings up and
//! tears down on the caller's behalf. The one-call path:
//!
//! ```no_run
//! # fn main() -> Result<(), wharf::BrokerError> {
//! smol::block_on(async {
//!     let config = wharf::BrokerConfig::from_env()?;
//!     let session = wharf::connect(&config).await?;
//!     // ... run queries against session.pool() ...
//!     session.release().await;
//!     Ok(())
//! })
//! # }
//! ```
//!
//! Binaries that enable SSH must call [`ssh::handle_askpass_mode`] first
//! thing in `main()`.

pub mod backoff;
pub mod broker;
pub mod config;
pub mod error;
pub mod session;
pub mod ssh;

mod database;

pub use backoff::RetryConfig;
pub use broker::{Broker, ConnectPhase, connect};
pub use config::{BrokerConfig, SshConfig, Timeouts};
pub use error::BrokerError;
pub use session::{SessionHandle, release};
pub use ssh::{SshAuthMethod, TunnelState};

pub type Result<T> = std::result::Result<T, BrokerError>;
