//! Broker Test Binary
//!
//! Exercises the full connect path against a live Postgres, directly and
//! (optionally) through an SSH tunnel.
//!
//! Prerequisites: a reachable Postgres described by the usual environment
//! variables (DB_HOST, DB_PORT, DB_USER, DB_PASSWORD, DB_NAME, DB_SCHEMA),
//! plus SSH_HOST/SSH_USER/SSH_PASSWORD and USE_SSH=true for the tunneled
//! tests. A .env file in the working directory is picked up.
//!
//! Run with:
//!   cargo run --bin test_broker

use anyhow::Result;
use std::time::Duration;
use wharf::ssh::handle_askpass_mode;
use wharf::{Broker, BrokerConfig, BrokerError, ConnectPhase, RetryConfig, SshAuthMethod};

fn main() -> Result<()> {
    // Handle --askpass mode first (before any other initialization)
    handle_askpass_mode();

    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("test_broker=debug".parse().unwrap())
                .add_directive("wharf=debug".parse().unwrap())
                .add_directive("warn".parse().unwrap()),
        )
        .init();

    println!("╔════════════════════════════════════════════╗");
    println!("║   Connection Broker Test Suite             ║");
    println!("╚════════════════════════════════════════════╝\n");

    let config = BrokerConfig::from_env()?;

    smol::block_on(async {
        println!("━━━ Test 1: Connect and Query ━━━");
        test_connect_and_query(&config).await?;

        println!("\n━━━ Test 2: Release Idempotency ━━━");
        test_release_idempotency(&config).await?;

        println!("\n━━━ Test 3: Phase Sequence ━━━");
        test_phase_sequence(&config).await?;

        if config.use_ssh {
            println!("\n━━━ Test 4: Unreachable SSH Host ━━━");
            test_unreachable_ssh_host(&config).await?;

            println!("\n━━━ Test 5: Tunnel Closed After DB Failure ━━━");
            test_tunnel_closed_after_db_failure(&config).await?;
        } else {
            println!("\n━━━ Test 4: Unreachable SSH Host (skipped, USE_SSH=false) ━━━");
            println!("━━━ Test 5: Tunnel Closed After DB Failure (skipped, USE_SSH=false) ━━━");
        }

        println!("\n╔════════════════════════════════════════════╗");
        println!("║       All tests passed! ✓                  ║");
        println!("╚════════════════════════════════════════════╝");

        Ok(())
    })
}

async fn test_connect_and_query(config: &BrokerConfig) -> Result<()> {
    let session = wharf::connect(config).await?;
    println!("  ✓ Session {} ready", session.id());

    if let Some(port) = session.tunnel_local_port().await {
        println!("  → Riding ssh tunnel on local port {}", port);
    } else {
        println!("  → Direct connection, no tunnel");
    }

    let row: (i32,) = sqlx::query_as("SELECT 1 + 1")
        .fetch_one(session.pool())
        .await?;
    assert_eq!(row.0, 2);
    println!("  ✓ SELECT 1 + 1 = {}", row.0);

    let (schema,): (String,) = sqlx::query_as("SELECT current_schema()")
        .fetch_one(session.pool())
        .await?;
    assert_eq!(schema, config.db_schema, "search_path should be applied");
    println!("  ✓ current_schema() = {}", schema);

    session.health_check().await?;
    println!("  ✓ Health check passed");

    session.release().await;
    println!("  ✓ Session released cleanly");
    Ok(())
}

async fn test_release_idempotency(config: &BrokerConfig) -> Result<()> {
    let session = wharf::connect(config).await?;

    session.release().await;
    println!("  ✓ First release completed");

    // Must be safe to call again
    session.release().await;
    wharf::release(&session).await;
    println!("  ✓ Repeated releases are no-ops");

    assert!(session.pool().is_closed());
    println!("  ✓ Pool is closed");
    Ok(())
}

async fn test_phase_sequence(config: &BrokerConfig) -> Result<()> {
    let broker = Broker::new();
    let phases = broker.subscribe();

    let session = broker.connect(config).await?;

    let mut seen = Vec::new();
    while let Ok(phase) = phases.try_recv() {
        seen.push(phase);
    }
    println!("  → Phases: {:?}", seen);

    assert_eq!(seen.first(), Some(&ConnectPhase::Start));
    assert_eq!(seen.last(), Some(&ConnectPhase::Ready));
    if config.use_ssh {
        assert!(seen.contains(&ConnectPhase::TunnelEstablishing));
        assert!(
            seen.iter()
                .any(|p| matches!(p, ConnectPhase::TunnelOpen { .. }))
        );
    } else {
        assert!(seen.contains(&ConnectPhase::TunnelSkipped));
    }
    assert!(seen.contains(&ConnectPhase::DatabaseConnecting));
    println!("  ✓ Phase sequence as expected");

    session.release().await;
    Ok(())
}

async fn test_tunnel_closed_after_db_failure(config: &BrokerConfig) -> Result<()> {
    let mut config = config.clone();
    // Forward to the discard port: the tunnel comes up fine, but there is
    // no Postgres behind it, so the database connect fails
    config.db_port = 9;

    let broker = Broker::new().with_retry(RetryConfig {
        base_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        multiplier: 2.0,
        max_attempts: Some(1),
    });
    let phases = broker.subscribe();

    let err = broker
        .connect(&config)
        .await
        .err()
        .expect("connect with no database behind the forward must fail");
    println!("  ✓ Connect failed as expected: {}", err);

    let mut local_port = None;
    while let Ok(phase) = phases.try_recv() {
        if let ConnectPhase::TunnelOpen { local_port: port } = phase {
            local_port = Some(port);
        }
    }
    let port = local_port.expect("the tunnel should have opened before the db failure");
    println!("  → Tunnel had opened on local port {}", port);

    // The forwarded port must be gone before connect() returned
    let probe = smol::net::TcpStream::connect(format!("127.0.0.1:{}", port)).await;
    assert!(
        probe.is_err(),
        "local forwarded port should refuse connections after the failure"
    );
    println!("  ✓ Local forwarded port {} no longer accepts connections", port);

    Ok(())
}

async fn test_unreachable_ssh_host(config: &BrokerConfig) -> Result<()> {
    let mut config = config.clone();
    let mut ssh = config.ssh.clone().expect("USE_SSH=true requires ssh settings");
    // 192.0.2.0/24 is reserved for documentation; nothing answers there
    ssh.ssh_host = "192.0.2.1".into();
    ssh.auth = SshAuthMethod::Password("unused".into());
    config.ssh = Some(ssh);

    let broker = Broker::new()
        .with_timeouts(wharf::Timeouts {
            ssh_connect: Duration::from_secs(3),
            tunnel_ready: Duration::from_secs(8),
            db_connect: Duration::from_secs(3),
        })
        .with_retry(RetryConfig::default());

    let err = broker
        .connect(&config)
        .await
        .err()
        .expect("connect to an unreachable bastion must fail");

    match err {
        BrokerError::SshUnreachable(detail) => {
            println!("  ✓ Classified as SshUnreachable: {}", detail);
        }
        BrokerError::Timeout { stage, .. } => {
            println!("  ✓ Timed out during {} as expected", stage);
        }
        other => anyhow::bail!("expected SshUnreachable or Timeout, got {:?}", other),
    }
    Ok(())
}
