pub mod config;
pub mod server;

use std::sync::Arc;

use self::{config::Config, server::Environment};

#[rustfmt::skip]
pub(crate) static SOFTWARE: &str = concat!(
    "relay-rs.",
    env!("CARGO_PKG_VERSION")
);

/// Bring the proxy up and keep it running until a shutdown signal arrives.
///
/// Exposed as a library function so integration tests can start the server
/// without going through the binary.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    let environment = Environment::new(&config);

    for server in config.backend_servers() {
        environment.balancer.add_server(server);
    }

    if environment.balancer.is_empty() {
        log::warn!("backend registry is empty, waiting for discovery registrations");
    }

    server::start(&config, &environment).await?;

    shutdown_signal().await;
    log::info!("shutdown signal received, closing");

    Ok(())
}

/// Resolves on `SIGINT` or `SIGTERM`. In-flight connections run as separate
/// tasks and are torn down with the runtime.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut terminate = match signal(SignalKind::terminate()) {
            Ok(terminate) => terminate,
            Err(e) => {
                log::error!("unable to install SIGTERM handler: err={e}");
                std::future::pending::<()>().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
