//! SSH tunnel over the system ssh binary.
//!
//! Spawns `ssh -L <local>:<db_host>:<db_port> -N` rather than linking an SSH
//! library. This picks up the user's `~/.ssh/config`, ssh-agent, and
//! ProxyJump setup for free. `ExitOnForwardFailure=yes` makes the child exit
//! when the forward cannot be set up, which lets us classify failures from
//! captured stderr instead of guessing.

use super::askpass::AskpassProxy;
use super::types::{SshAuthMethod, SshTunnelConfig};
use crate::config::Timeouts;
use crate::error::BrokerError;
use smol::io::{AsyncBufReadExt, BufReader};
use smol::net::{TcpListener, TcpStream};
use smol::process::{Child, Command, Stdio};
use smol::stream::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// An open forwarded port, alive for as long as this value is held.
///
/// The ssh child is spawned with `kill_on_drop`, so dropping the tunnel
/// (including mid-establishment, when a connect future is cancelled) tears
/// the process down.
pub struct SshTunnel {
    config: SshTunnelConfig,
    local_port: u16,
    process: Child,
    // Keeps the askpass socket alive in case ssh re-prompts
    _askpass: Option<Arc<AskpassProxy>>,
}

impl SshTunnel {
    /// Spawn ssh and wait until the forwarded local port accepts
    /// connections or the readiness deadline passes.
    pub async fn start(
        config: SshTunnelConfig,
        timeouts: &Timeouts,
    ) -> Result<Self, BrokerError> {
        let local_port = if config.local_bind_port == 0 {
            find_available_port(&config.local_bind_host).await?
        } else {
            config.local_bind_port
        };

        let forward_spec = format!(
            "{}:{}:{}:{}",
            config.local_bind_host, local_port, config.remote_host, config.remote_port
        );

        let mut cmd = Command::new("ssh");
        cmd.kill_on_drop(true);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::piped());

        cmd.arg("-L").arg(&forward_spec);
        // Forward only, no remote command
        cmd.arg("-N");
        cmd.args(["-o", "ExitOnForwardFailure=yes"]);
        cmd.args(["-o", "StrictHostKeyChecking=accept-new"]);
        // Keep-alives make the child exit when the peer dies, which is how
        // a lost tunnel becomes observable to is_alive()
        cmd.args(["-o", "ServerAliveInterval=15"]);
        cmd.args(["-o", "ServerAliveCountMax=3"]);
        cmd.arg("-o")
            .arg(format!("ConnectTimeout={}", timeouts.ssh_connect.as_secs().max(1)));

        if config.ssh_port != 22 {
            cmd.arg("-p").arg(config.ssh_port.to_string());
        }

        let askpass = configure_auth(&mut cmd, &config).await?;
        cmd.arg(config.ssh_destination());

        tracing::info!(
            "starting ssh tunnel: -L {} -N {}",
            forward_spec,
            config.ssh_destination()
        );

        let mut process = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                BrokerError::SshUnreachable("ssh binary not found on PATH".into())
            } else {
                BrokerError::Io(e)
            }
        })?;

        let stderr_lines: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        if let Some(stderr) = process.stderr.take() {
            let sink = Arc::clone(&stderr_lines);
            smol::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();
                while let Some(Ok(line)) = lines.next().await {
                    tracing::debug!("ssh stderr: {}", line);
                    let mut sink = sink.lock().unwrap();
                    if sink.len() < 64 {
                        sink.push(line);
                    }
                }
            })
            .detach();
        }

        // Auth and forward setup happen inside the child; the combined
        // budget is the readiness deadline on the local port.
        let deadline = Instant::now() + timeouts.tunnel_ready;
        let verify_addr = format!("{}:{}", config.local_bind_host, local_port);
        loop {
            if let Ok(Some(status)) = process.try_status() {
                // Give the stderr reader a moment to drain
                smol::Timer::after(Duration::from_millis(50)).await;
                let lines = stderr_lines.lock().unwrap().clone();
                tracing::warn!(
                    "ssh exited with {} before the tunnel came up",
                    status
                );
                return Err(classify_stderr(&lines, &config.ssh_destination()));
            }

            if TcpStream::connect(verify_addr.as_str()).await.is_ok() {
                tracing::info!(
                    "ssh tunnel established: {} -> {}:{}",
                    verify_addr,
                    config.remote_host,
                    config.remote_port
                );
                break;
            }

            if Instant::now() >= deadline {
                let _ = process.kill();
                let _ = process.status().await;
                return Err(BrokerError::Timeout {
                    stage: "tunnel_ready",
                    limit: timeouts.tunnel_ready,
                });
            }

            smol::Timer::after(Duration::from_millis(200)).await;
        }

        Ok(Self {
            config,
            local_port,
            process,
            _askpass: askpass,
        })
    }

    /// Local port the forward is bound to.
    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Local address the database client should connect to.
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.config.local_bind_host, self.local_port)
    }

    pub fn local_host(&self) -> &str {
        &self.config.local_bind_host
    }

    /// Whether the ssh child is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.process.try_status(), Ok(None))
    }

    /// Terminate the child and wait for it to exit.
    pub async fn shutdown(mut self) {
        tracing::debug!(
            "shutting down ssh tunnel to {}",
            self.config.ssh_destination()
        );

        #[cfg(unix)]
        {
            // SIGTERM first so ssh can tear the forward down cleanly
            unsafe {
                libc::kill(self.process.id() as i32, libc::SIGTERM);
            }
            smol::Timer::after(Duration::from_millis(100)).await;
        }

        if self.is_alive() {
            let _ = self.process.kill();
        }
        let _ = self.process.status().await;

        tracing::info!("ssh tunnel closed");
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        let _ = self.process.kill();
    }
}

/// Wire up `-i` / askpass according to the configured credential. Returns
/// the proxy when a secret has to be delivered, so it outlives the spawn.
async fn configure_auth(
    cmd: &mut Command,
    config: &SshTunnelConfig,
) -> Result<Option<Arc<AskpassProxy>>, BrokerError> {
    let secret = match &config.auth_method {
        SshAuthMethod::Password(password) => Some(password.clone()),
        SshAuthMethod::KeyFile { path, passphrase } => {
            cmd.arg("-i").arg(path);
            cmd.args(["-o", "IdentitiesOnly=yes"]);
            passphrase.clone()
        }
    };

    let Some(secret) = secret else {
        return Ok(None);
    };

    let proxy = Arc::new(AskpassProxy::new().await?);
    cmd.env("SSH_ASKPASS", proxy.script_path());
    cmd.env("SSH_ASKPASS_REQUIRE", "force");
    // askpass needs ssh to believe a display exists
    cmd.env("DISPLAY", ":0");

    let server = Arc::clone(&proxy);
    smol::spawn(async move {
        // ssh may prompt more than once before giving up
        for _ in 0..3 {
            match server
                .serve_secret_with_timeout(&secret, Duration::from_secs(30))
                .await
            {
                Ok(true) => continue,
                _ => break,
            }
        }
    })
    .detach();

    Ok(Some(proxy))
}

/// Map ssh's stderr to a distinct failure cause. ssh does not use exit
/// codes to distinguish these, so pattern-matching the messages is the only
/// classification available.
fn classify_stderr(lines: &[String], destination: &str) -> BrokerError {
    const AUTH_PATTERNS: &[&str] = &[
        "permission denied",
        "authentication fail",
        "too many authentication failures",
        "no supported authentication",
        "host key verification failed",
        "key rejected",
    ];
    const FORWARD_PATTERNS: &[&str] = &[
        "forwarding failed",
        "cannot listen to port",
        "bad local forwarding",
        "administratively prohibited",
        "channel_setup_fwd_listener",
    ];

    let haystack = lines.join("\n").to_lowercase();
    let detail = lines
        .last()
        .cloned()
        .unwrap_or_else(|| format!("ssh to {} exited before the forward came up", destination));

    if AUTH_PATTERNS.iter().any(|p| haystack.contains(p)) {
        BrokerError::SshAuthFailed(detail)
    } else if FORWARD_PATTERNS.iter().any(|p| haystack.contains(p)) {
        BrokerError::ForwardRejected(detail)
    } else {
        BrokerError::SshUnreachable(detail)
    }
}

/// Bind port 0 to let the OS pick a free local port.
async fn find_available_port(bind_host: &str) -> Result<u16, BrokerError> {
    let listener = TcpListener::bind(format!("{}:0", bind_host)).await?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}
