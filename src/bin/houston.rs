//! houston: Voyager gateway service
//!
//! Startup sequence:
//! 1. tracing and configuration
//! 2. broker and record store connections, retried with backoff
//! 3. IPAM bootstrap (default pool and subnet, created once)
//! 4. inbox listener on the service's own exchange
//! 5. HTTP API until Ctrl+C
//!
//! Any failure before the HTTP API starts is fatal.
//!
//! ## Configuration
//! - HOUSTON_CONFIG: YAML config file (or `--config <path>`)
//! - HOUSTON__SECTION__KEY: per-key overrides, e.g. `HOUSTON__MESSAGING__AMQP__URL`
//! - PORT: HTTP port
//! - HOUSTON_LOG: tracing filter (default `info`)

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use houston::api;
use houston::bus::{init_broker, redact_url};
use houston::config::Config;
use houston::context::ServiceContext;
use houston::inbox::spawn_inbox;
use houston::ipam::BootstrapOutcome;
use houston::storage::init_storage;
use houston::utils::bootstrap::{connect_with_retry, init_tracing, parse_config_path};
use houston::utils::retry::connection_backoff;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = parse_config_path();
    let config = Config::load(config_path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!("Starting houston");

    let broker = connect_with_retry(
        "broker",
        &redact_url(&config.messaging.amqp.url),
        connection_backoff(),
        || init_broker(&config.messaging),
    )
    .await?;

    let store = connect_with_retry(
        "record store",
        &config.storage.address,
        connection_backoff(),
        || init_storage(&config.storage),
    )
    .await?;

    let ctx = ServiceContext::new(broker, store, &config);

    match ctx.ipam_bootstrap().run().await {
        Ok(BootstrapOutcome::Created { pool, subnet }) => {
            info!(pool_id = %pool.id, subnet_id = %subnet.id, "IPAM bootstrap complete");
        }
        Ok(BootstrapOutcome::AlreadyInitialized) => {}
        Err(e) => {
            error!(error = %e, "Could not initialize Houston's connection to IPAM");
            return Err(e.into());
        }
    }

    let shutdown = CancellationToken::new();
    let inbox = spawn_inbox(
        ctx.broker.clone(),
        config.messaging.amqp.inbox_binding(),
        shutdown.clone(),
    )
    .await?;

    let addr = config.server.bind_address();
    tokio::select! {
        result = api::serve(ctx, &addr) => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server failed");
                shutdown.cancel();
                let _ = inbox.await;
                let e: Box<dyn std::error::Error> = e;
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    shutdown.cancel();
    let _ = inbox.await;
    info!("Houston stopped");
    Ok(())
}
