//! Database connect with bounded retry.
//!
//! Opens a sqlx pool against whatever endpoint the tunnel layer hands us,
//! retrying transient failures on an exponential backoff schedule and
//! failing immediately on credential or catalog errors.

use crate::backoff::{ExponentialBackoff, RetryConfig};
use crate::config::{BrokerConfig, Timeouts};
use crate::error::{BrokerError, is_transient_db_error};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use std::future::Future;

/// A connected pool plus how many retries it took to get there.
#[derive(Debug)]
pub(crate) struct OpenedSession {
    pub pool: PgPool,
    pub retries: u32,
}

/// Connect to the database at `host:port`, verify the configured schema
/// exists, and return the pool.
///
/// Transient failures (refused, reset, timeouts, server "come back later"
/// SQLSTATEs) are retried per `retry`; auth and catalog failures are not.
pub(crate) async fn open_session(
    host: &str,
    port: u16,
    config: &BrokerConfig,
    retry: &RetryConfig,
    timeouts: &Timeouts,
) -> Result<OpenedSession, BrokerError> {
    let options = connect_options(host, port, config);

    tracing::info!(
        "connecting to database {}@{}:{}/{} (schema {}, password <redacted>)",
        config.db_user,
        host,
        port,
        config.db_name,
        config.db_schema
    );

    let (pool, retries) =
        connect_with_retry(retry, config, || try_open(&options, timeouts)).await?;

    if let Err(err) = verify_schema(&pool, &config.db_schema).await {
        pool.close().await;
        return Err(err);
    }

    if retries > 0 {
        tracing::info!("database connected after {} retries", retries);
    }
    Ok(OpenedSession { pool, retries })
}

/// Run `attempt` until it succeeds, a fatal error surfaces, or the retry
/// budget is spent. Returns the value together with the retries consumed.
async fn connect_with_retry<T, F, Fut>(
    retry: &RetryConfig,
    config: &BrokerConfig,
    mut attempt: F,
) -> Result<(T, u32), BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, sqlx::Error>>,
{
    let mut backoff = ExponentialBackoff::new(retry.clone());
    loop {
        match attempt().await {
            Ok(value) => return Ok((value, backoff.attempt())),
            Err(e) if is_transient_db_error(&e) => match backoff.next_delay() {
                Some(delay) => {
                    tracing::warn!(
                        "database connect failed (attempt {}/{}), retrying in {:?}: {}",
                        backoff.attempt(),
                        backoff.max_attempts(),
                        delay,
                        e
                    );
                    smol::Timer::after(delay).await;
                }
                None => {
                    tracing::error!("database connect retries exhausted: {}", e);
                    return Err(BrokerError::DbUnreachable {
                        attempts: backoff.attempt(),
                        source: e,
                    });
                }
            },
            Err(e) => return Err(fatal_error(e, config)),
        }
    }
}

fn connect_options(host: &str, port: u16, config: &BrokerConfig) -> PgConnectOptions {
    PgConnectOptions::new()
        .host(host)
        .port(port)
        .username(&config.db_user)
        .password(&config.db_password)
        .database(&config.db_name)
        .application_name("wharf")
        // search_path travels in startup options so it applies to every
        // pooled connection, not just the first
        .options([("search_path", config.db_schema.as_str())])
}

async fn try_open(
    options: &PgConnectOptions,
    timeouts: &Timeouts,
) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(timeouts.db_connect)
        .connect_with(options.clone())
        .await
}

/// The startup-packet search_path is accepted even for schemas that do not
/// exist, so existence gets checked explicitly.
async fn verify_schema(pool: &PgPool, schema: &str) -> Result<(), BrokerError> {
    let row: Option<(i32,)> =
        sqlx::query_as("select 1 from information_schema.schemata where schema_name = $1")
            .bind(schema)
            .fetch_optional(pool)
            .await?;

    if row.is_none() {
        return Err(BrokerError::DbSchemaNotFound(schema.to_string()));
    }
    Ok(())
}

/// Classify a non-transient connect failure.
fn fatal_error(err: sqlx::Error, config: &BrokerConfig) -> BrokerError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            // invalid_password / invalid_authorization_specification
            Some("28P01") | Some("28000") => return BrokerError::DbAuthFailed(err),
            // invalid_catalog_name
            Some("3D000") => return BrokerError::DbUnknownDatabase(config.db_name.clone()),
            // invalid_schema_name
            Some("3F000") => return BrokerError::DbSchemaNotFound(config.db_schema.clone()),
            _ => {}
        }
    }
    BrokerError::Db(err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config_for(port: u16) -> BrokerConfig {
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

    #[test]
    fn test_refused_port_consumes_whole_retry_budget() {
        smol::block_on(async {
            // Port 1 is never listening, so every attempt is refused
            let config = config_for(1);
            let retry = RetryConfig {
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(40),
                multiplier: 2.0,
                max_attempts: Some(2),
            };
            let timeouts = Timeouts {
                db_connect: Duration::from_secs(2),
                ..Timeouts::default()
            };

            let err = open_session("127.0.0.1", 1, &config, &retry, &timeouts)
                .await
                .unwrap_err();

            match err {
                BrokerError::DbUnreachable { attempts, .. } => assert_eq!(attempts, 2),
                other => panic!("expected DbUnreachable, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_two_transient_failures_then_success_consumes_two_retries() {
        smol::block_on(async {
            let config = config_for(5432);
            let retry = RetryConfig {
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
                multiplier: 2.0,
                max_attempts: Some(3),
            };

            let calls = std::cell::Cell::new(0u32);
            let (value, retries) = connect_with_retry(&retry, &config, || {
                let n = calls.get();
                calls.set(n + 1);
                async move {
                    if n < 2 {
                        Err(sqlx::Error::Io(std::io::Error::new(
                            std::io::ErrorKind::ConnectionRefused,
                            "connection refused",
                        )))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await
            .unwrap();

            assert_eq!(value, 2);
            assert_eq!(retries, 2);
            assert_eq!(calls.get(), 3);
        });
    }

    #[test]
    fn test_fatal_error_short_circuits_retry() {
        smol::block_on(async {
            let config = config_for(5432);
            let calls = std::cell::Cell::new(0u32);

            let err = connect_with_retry(&RetryConfig::default(), &config, || {
                calls.set(calls.get() + 1);
                async { Err::<(), _>(sqlx::Error::RowNotFound) }
            })
            .await
            .unwrap_err();

            assert!(matches!(err, BrokerError::Db(_)));
            // No retry for non-transient errors
            assert_eq!(calls.get(), 1);
        });
    }

    #[test]
    fn test_fatal_error_default_classification() {
        let config = config_for(5432);
        let err = fatal_error(sqlx::Error::RowNotFound, &config);
        assert!(matches!(err, BrokerError::Db(_)));
    }

    #[test]
    fn test_connect_options_carry_search_path() {
        // connect_lazy_with builds a pool without touching the network
        let config = config_for(5432);
        let options = connect_options("127.0.0.1", 5432, &config);
        let pool = PgPoolOptions::new().connect_lazy_with(options);
        assert!(!pool.is_closed());
    }
}
