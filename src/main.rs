use std::error::Error;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use tokio::sync::watch;
use userdir::config::Configuration;
use userdir::{app, config_path, decryptor, initialize_state, spawn_consumers, telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let (config, config_error) = match Configuration::default().path(config_path()).read() {
        Ok(config) => (config, None),
        Err(err) => (Arc::new(Configuration::default()), Some(err)),
    };

    let tracer = telemetry::init(config.telemetry.as_ref())?;
    if let Some(err) = config_error {
        tracing::error!(error = %err, "configuration not loaded, using defaults");
    }
    let metrics = match telemetry::setup_metrics_recorder() {
        Ok(handle) => Some(handle),
        Err(err) => {
            tracing::error!(error = %err, "prometheus recorder not installed");
            None
        },
    };

    let decryptor = decryptor()?;
    let state = initialize_state(Arc::clone(&config), metrics).await?;

    let (shutdown, signal) = watch::channel(false);
    let consumers = spawn_consumers(&config, decryptor, Arc::clone(&state.repo), signal);

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, name = %config.name, version = %config.version, "server started");

    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "cannot listen for shutdown signal");
            }
            tracing::info!("shutting down");
        })
        .await?;

    // Consumers finish the message in hand; unacknowledged ones are redelivered.
    shutdown.send_replace(true);
    for consumer in consumers {
        if let Err(err) = consumer.await {
            tracing::error!(error = %err, "consumer task failed");
        }
    }

    if let Some(provider) = tracer {
        provider.shutdown()?;
    }

    Ok(())
}
