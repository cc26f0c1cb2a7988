//! Error taxonomy for the connection broker.
//!
//! Callers get a typed error that distinguishes misconfiguration, fatal
//! failures, and retryable-exhausted transients, so they can decide whether
//! re-invoking `connect` is worth it.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BrokerError {
    /// Missing or contradictory configuration fields.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// Could not reach the SSH host (DNS failure, refused, no route).
    #[error("SSH host unreachable: {0}")]
    SshUnreachable(String),

    /// The SSH server rejected the supplied credential.
    #[error("SSH authentication failed: {0}")]
    SshAuthFailed(String),

    /// The SSH server refused to set up the requested port forward.
    #[error("SSH port forward rejected: {0}")]
    ForwardRejected(String),

    /// The tunnel dropped after it was established.
    #[error("SSH tunnel lost")]
    TunnelLost,

    /// Transient database-connect failures exhausted the retry budget.
    #[error("database unreachable after {attempts} retries: {source}")]
    DbUnreachable {
        attempts: u32,
        #[source]
        source: sqlx::Error,
    },

    /// The database rejected the supplied credentials. Never retried.
    #[error("database authentication failed: {0}")]
    DbAuthFailed(#[source] sqlx::Error),

    /// The configured database does not exist. Never retried.
    #[error("unknown database: {0}")]
    DbUnknownDatabase(String),

    /// The configured schema does not exist. Never retried.
    #[error("schema not found: {0}")]
    DbSchemaNotFound(String),

    /// The caller cancelled an in-flight connect.
    #[error("connect cancelled")]
    Cancelled,

    /// A connect stage exceeded its time budget.
    #[error("timed out during {stage} after {limit:?}")]
    Timeout { stage: &'static str, limit: Duration },

    /// Database error outside the classified taxonomy.
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl BrokerError {
    /// Whether retrying the whole `connect` call might succeed.
    ///
    /// Misconfiguration and credential failures are permanent; everything
    /// network-shaped may clear up on its own.
    pub fn is_retryable_call(&self) -> bool {
        match self {
            BrokerError::ConfigInvalid(_)
            | BrokerError::SshAuthFailed(_)
            | BrokerError::DbAuthFailed(_)
            | BrokerError::DbUnknownDatabase(_)
            | BrokerError::DbSchemaNotFound(_) => false,
            BrokerError::SshUnreachable(_)
            | BrokerError::ForwardRejected(_)
            | BrokerError::TunnelLost
            | BrokerError::DbUnreachable { .. }
            | BrokerError::Cancelled
            | BrokerError::Timeout { .. } => true,
            BrokerError::Db(_) | BrokerError::Io(_) => false,
        }
    }
}

/// Whether a database-connect error is worth retrying with backoff.
///
/// Connection refused/reset and timeouts arrive as I/O or pool-acquire
/// errors; server-side "come back later" conditions arrive as SQLSTATE
/// codes. Everything else fails the connect immediately.
pub(crate) fn is_transient_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| is_transient_sqlstate(&code))
            .unwrap_or(false),
        _ => false,
    }
}

/// SQLSTATE codes the server sends when a later attempt may succeed:
/// 53300 too_many_connections, 57P03 cannot_connect_now,
/// 08001/08006 connection exception.
pub(crate) fn is_transient_sqlstate(code: &str) -> bool {
    matches!(code, "53300" | "57P03" | "08001" | "08006")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_sqlstates() {
        assert!(is_transient_sqlstate("53300"));
        assert!(is_transient_sqlstate("57P03"));
        assert!(is_transient_sqlstate("08006"));
        // Auth and catalog failures are permanent
        assert!(!is_transient_sqlstate("28P01"));
        assert!(!is_transient_sqlstate("28000"));
        assert!(!is_transient_sqlstate("3D000"));
        assert!(!is_transient_sqlstate("3F000"));
    }

    #[test]
    fn test_io_errors_are_transient() {
        let refused = sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(is_transient_db_error(&refused));
        assert!(is_transient_db_error(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_retryable_call_classification() {
        assert!(!BrokerError::ConfigInvalid("missing DB_HOST".into()).is_retryable_call());
        assert!(!BrokerError::SshAuthFailed("permission denied".into()).is_retryable_call());
        assert!(!BrokerError::DbSchemaNotFound("analytics".into()).is_retryable_call());
        assert!(BrokerError::SshUnreachable("no route to host".into()).is_retryable_call());
        assert!(BrokerError::TunnelLost.is_retryable_call());
        assert!(
            BrokerError::DbUnreachable {
                attempts: 3,
                source: sqlx::Error::PoolTimedOut,
            }
            .is_retryable_call()
        );
        assert!(
            BrokerError::Timeout {
                stage: "ssh_connect",
                limit: Duration::from_secs(10),
            }
            .is_retryable_call()
        );
    }
}
