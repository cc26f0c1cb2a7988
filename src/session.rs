//! A live database session and the tunnel that carries it.

use crate::error::BrokerError;
use crate::ssh::SshTunnel;
use sqlx::PgPool;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use uuid::Uuid;

/// A connected pool together with the SSH tunnel it rides on, if any.
///
/// Release order matters: the pool closes before the tunnel, so no
/// connection ever dials a dead forward. `release` is idempotent and safe
/// to call from multiple tasks.
pub struct SessionHandle {
    id: Uuid,
    pool: PgPool,
    schema: String,
    retries_used: u32,
    tunnel: async_lock::Mutex<Option<SshTunnel>>,
    released: AtomicBool,
}

impl SessionHandle {
    pub(crate) fn new(
        pool: PgPool,
        schema: String,
        retries_used: u32,
        tunnel: Option<SshTunnel>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            pool,
            schema,
            retries_used,
            tunnel: async_lock::Mutex::new(tunnel),
            released: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The connected pool. Queries issued here see `search_path` set to the
    /// configured schema.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Retries the database connect consumed before succeeding.
    pub fn retries_used(&self) -> u32 {
        self.retries_used
    }

    /// Local port of the underlying tunnel, None for direct sessions (or
    /// after release).
    pub async fn tunnel_local_port(&self) -> Option<u16> {
        self.tunnel.lock().await.as_ref().map(|t| t.local_port())
    }

    /// Close the pool, then tear down the tunnel. Later calls are no-ops.
    pub async fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            tracing::debug!(session = %self.id, "release called again, ignoring");
            return;
        }

        tracing::info!(session = %self.id, "releasing session");
        self.pool.close().await;

        if let Some(tunnel) = self.tunnel.lock().await.take() {
            tunnel.shutdown().await;
        }

        tracing::info!(session = %self.id, "session released");
    }

    /// Probe the session with a trivial query.
    ///
    /// On failure, checks whether the tunnel process died so a dropped
    /// forward surfaces as [`BrokerError::TunnelLost`] rather than a
    /// generic I/O error.
    pub async fn health_check(&self) -> Result<(), BrokerError> {
        match sqlx::query("select 1").execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(e) => {
                let mut guard = self.tunnel.lock().await;
                if let Some(tunnel) = guard.as_mut() {
                    if !tunnel.is_alive() {
                        return Err(BrokerError::TunnelLost);
                    }
                }
                Err(BrokerError::Db(e))
            }
        }
    }
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("schema", &self.schema)
            .field("retries_used", &self.retries_used)
            .field("released", &self.released.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if !self.released.load(Ordering::SeqCst) {
            // The tunnel child still dies via kill_on_drop; the pool's
            // connections close on their own drop path.
            tracing::warn!(session = %self.id, "session dropped without release");
        }
    }
}

/// Release a session: close the database pool first, then the tunnel.
pub async fn release(handle: &SessionHandle) {
    handle.release().await;
}
