//! Password delivery for SSH without secrets on disk.
//!
//! SSH reads passwords from an askpass program. Instead of writing the
//! secret into a script, we bind a Unix socket (0600) in a private temp
//! directory and point `SSH_ASKPASS` at a small script that connects to the
//! socket; the secret only ever travels over the socket.
//!
//! Binaries that spawn tunnels must call [`handle_askpass_mode`] first thing
//! in `main()`: when ssh re-invokes the binary with `--askpass <socket>`,
//! that call fetches the secret, prints it, and exits before any other
//! initialization runs.

use crate::error::BrokerError;
use futures::FutureExt;
use smol::io::AsyncWriteExt;
use smol::net::unix::UnixListener;
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

/// Handle `--askpass <socket_path>` invocations and exit; a no-op otherwise.
pub fn handle_askpass_mode() {
    let args: Vec<String> = std::env::args().collect();
    let Some(pos) = args.iter().position(|a| a == "--askpass") else {
        return;
    };

    match args.get(pos + 1) {
        Some(socket_path) => match relay_secret(socket_path) {
            Ok(()) => std::process::exit(0),
            Err(e) => {
                eprintln!("askpass error: {}", e);
                std::process::exit(1);
            }
        },
        None => {
            eprintln!("--askpass requires a socket path argument");
            std::process::exit(1);
        }
    }
}

/// Read the secret from the proxy socket and print it for ssh to consume.
#[cfg(unix)]
fn relay_secret(socket_path: &str) -> std::io::Result<()> {
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    let mut stream = UnixStream::connect(socket_path)?;
    let mut secret = String::new();
    stream.read_to_string(&mut secret)?;

    print!("{}", secret);
    std::io::stdout().flush()
}

#[cfg(not(unix))]
fn relay_secret(_socket_path: &str) -> std::io::Result<()> {
    Err(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "askpass mode is only supported on Unix systems",
    ))
}

/// One-shot server that hands the SSH secret to the askpass script.
pub struct AskpassProxy {
    listener: UnixListener,
    script_path: PathBuf,
    socket_path: PathBuf,
    _temp_dir: TempDir,
}

impl AskpassProxy {
    /// Set up the socket (0600) and askpass script (0700) in a fresh 0700
    /// temp directory.
    pub async fn new() -> Result<Self, BrokerError> {
        let temp_dir = TempDir::with_prefix("wharf-ssh-")?;
        let socket_path = temp_dir.path().join("askpass.sock");
        let script_path = temp_dir.path().join("askpass.sh");

        #[cfg(unix)]
        set_mode(temp_dir.path(), 0o700)?;

        let listener = UnixListener::bind(&socket_path)?;

        #[cfg(unix)]
        set_mode(&socket_path, 0o600)?;

        let current_exe = std::env::current_exe()?;
        let exe = shell_escape(&current_exe.to_string_lossy());
        let socket = shell_escape(&socket_path.to_string_lossy());

        // The script invokes this binary in --askpass mode, with nc as a
        // fallback for callers embedding wharf in a binary that does not
        // wire up handle_askpass_mode.
        let script = format!(
            "#!/bin/sh\nif {exe} --askpass {socket} 2>/dev/null; then\n    exit 0\nelif command -v nc >/dev/null 2>&1; then\n    nc -U {socket}\nelse\n    echo 'askpass: no delivery mechanism available' >&2\n    exit 1\nfi\n",
        );
        std::fs::write(&script_path, &script)?;

        #[cfg(unix)]
        set_mode(&script_path, 0o700)?;

        tracing::debug!(socket = %socket_path.display(), "askpass proxy ready");

        Ok(Self {
            listener,
            script_path,
            socket_path,
            _temp_dir: temp_dir,
        })
    }

    /// Path to the askpass script (goes into `SSH_ASKPASS`).
    pub fn script_path(&self) -> &PathBuf {
        &self.script_path
    }

    #[cfg(test)]
    pub(crate) fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }

    /// Block until the askpass script connects, then send the secret.
    pub async fn serve_secret(&self, secret: &str) -> Result<(), BrokerError> {
        let (mut stream, _addr) = self.listener.accept().await?;

        stream.write_all(secret.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        stream.flush().await?;
        drop(stream);

        tracing::debug!("served secret via askpass proxy");
        Ok(())
    }

    /// Serve the secret, giving up after `timeout`. Returns Ok(false) on
    /// timeout — ssh may simply not have needed a password.
    pub async fn serve_secret_with_timeout(
        &self,
        secret: &str,
        timeout: Duration,
    ) -> Result<bool, BrokerError> {
        futures::select! {
            result = Box::pin(self.serve_secret(secret)).fuse() => {
                result?;
                Ok(true)
            }
            _ = Box::pin(smol::Timer::after(timeout)).fuse() => {
                tracing::debug!("askpass timed out; ssh never asked for the secret");
                Ok(false)
            }
        }
    }
}

#[cfg(unix)]
fn set_mode(path: &std::path::Path, mode: u32) -> std::io::Result<()> {
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(mode);
    std::fs::set_permissions(path, perms)
}

/// Single-quote a string for safe embedding in the askpass script.
fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_contains_no_secret() {
        smol::block_on(async {
            let proxy = AskpassProxy::new().await.unwrap();
            assert!(proxy.script_path().exists());

            let script = std::fs::read_to_string(proxy.script_path()).unwrap();
            assert!(script.contains("--askpass"));
            assert!(!script.contains("secret"));
        });
    }

    #[test]
    fn test_secret_delivery() {
        smol::block_on(async {
            let proxy = AskpassProxy::new().await.unwrap();
            let socket_path = proxy.socket_path().clone();
            let secret = "tunnel-password-42";

            let serve = smol::spawn(async move {
                proxy
                    .serve_secret_with_timeout(secret, Duration::from_secs(5))
                    .await
            });

            smol::Timer::after(Duration::from_millis(50)).await;

            use smol::io::AsyncReadExt;
            let mut stream = smol::net::unix::UnixStream::connect(&socket_path)
                .await
                .unwrap();
            let mut received = String::new();
            stream.read_to_string(&mut received).await.unwrap();
            assert_eq!(received.trim(), secret);

            assert!(serve.await.unwrap());
        });
    }

    #[test]
    fn test_timeout_when_nobody_connects() {
        smol::block_on(async {
            let proxy = AskpassProxy::new().await.unwrap();
            let served = proxy
                .serve_secret_with_timeout("unused", Duration::from_millis(100))
                .await
                .unwrap();
            assert!(!served);
        });
    }

    #[test]
    fn test_shell_escape() {
        assert_eq!(shell_escape("/tmp/plain"), "'/tmp/plain'");
        assert_eq!(shell_escape("with space"), "'with space'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
    }
}
