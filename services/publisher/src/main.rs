// Publisher service main entry point.
use anyhow::{Context, Result};
use publisher::config::PublisherConfig;
use publisher::observability;
use publisher::transport;
use publisher::Publisher;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() -> Result<()> {
    let metrics_handle = observability::init_observability();

    let config = PublisherConfig::from_env_or_yaml().context("load publisher config")?;
    let metrics_bind = config.metrics_bind;
    let bind = config.bind;

    let (publisher, mut events) = Publisher::new(config);
    tracing::info!(node_id = %publisher.node_id(), "publisher started");

    tokio::spawn(async move {
        if let Err(err) = observability::serve_metrics(metrics_handle, metrics_bind).await {
            tracing::warn!(error = %err, "metrics endpoint exited");
        }
    });

    // Surface session callbacks; embedding applications replace this loop.
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::debug!(?event, "publisher event");
        }
    });

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind command channel listener on {bind}"))?;
    tracing::info!(addr = %listener.local_addr()?, "command channel listener started");

    let accept_task = {
        let publisher = publisher.clone();
        tokio::spawn(async move {
            if let Err(err) = transport::serve(listener, publisher).await {
                tracing::warn!(error = %err, "accept loop exited");
            }
        })
    };

    // Block until SIGINT so the process stays alive.
    let _ = tokio::signal::ctrl_c().await;
    publisher.set_disposing();
    accept_task.abort();
    tracing::info!("publisher stopped");
    Ok(())
}
