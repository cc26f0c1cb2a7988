//! SSH tunneling via the system ssh binary.

mod askpass;
mod manager;
mod tunnel;
mod types;

pub use askpass::{AskpassProxy, handle_askpass_mode};
pub use manager::{TunnelFailure, TunnelManager, TunnelRoute, TunnelState};
pub use tunnel::SshTunnel;
pub use types::{SshAuthMethod, SshTunnelConfig};
