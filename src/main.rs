use hostgate::admin::{PKG_NAME, VERSION};
use hostgate::config::Config;
use hostgate::docker::DockerSource;
use hostgate::gateway::{Gateway, GatewayOptions};
use hostgate::listener::Listener;
use hostgate::server::{GatewayServer, Router};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("hostgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    print_startup_banner(&config);

    let source = Arc::new(DockerSource::connect(&config.docker_host).await.map_err(|e| {
        error!(host = %config.docker_host, error = %e, "Failed to connect to Docker");
        e
    })?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway = Gateway::new(source, GatewayOptions::from(&config));

    let listener = Arc::new(Listener::new(Arc::clone(&gateway), config.event_workers));
    let listener_handle = listener.start(shutdown_rx.clone()).await?;

    let router = Router::from_config(&config, Arc::clone(&gateway));
    let server = GatewayServer::new(config.bind_address(), router, shutdown_rx);
    let mut server_handle = tokio::spawn(server.run());

    // Wait for shutdown signal (Ctrl+C or SIGTERM), or the server failing
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            result = &mut server_handle => {
                let _ = shutdown_tx.send(true);
                return result?;
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down...");
            }
            result = &mut server_handle => {
                let _ = shutdown_tx.send(true);
                return result?;
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // Wait for the server and listener to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = server_handle.await;
        let _ = listener_handle.await;
    })
    .await;

    let stats = gateway.forward_stats();
    info!(
        requests = stats.get_total_requests(),
        upgrades = stats.get_upgrades(),
        "Shutdown complete"
    );
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.bind_address(),
        domain = %config.domain,
        routing_mode = ?config.routing_mode,
        docker_host = %config.docker_host,
        "Server configuration"
    );
    info!(
        default_route = config.default_route.as_ref().map(|u| u.as_str()).unwrap_or("none"),
        default_port = config.default_port,
        skip_no_domain = config.skip_no_domain,
        bounce_bots = config.bounce_bots,
        debug_endpoints = config.debug_endpoints,
        "Routing settings"
    );
    info!(
        event_workers = config.event_workers,
        log_lines = config.log_lines,
        pool_max_idle = config.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.pool_idle_timeout_secs,
        "Worker and connection pool settings"
    );
}
