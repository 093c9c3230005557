use bullpen::admin::{AdminServer, PKG_NAME, VERSION};
use bullpen::config::Config;
use bullpen::proxy::{ProxyServer, ProxyState};
use bullpen::reaper::Reaper;
use bullpen::registry::InstanceRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bullpen=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("bullpen.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    if config.auth.is_none() {
        warn!("No [auth] section configured: every garden is reachable without login");
    }

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let registry = InstanceRegistry::new(config.instances.clone());

    // A failure here is retried by the reaper on its next cycle
    match registry.ensure_assets().await {
        Ok(_) => info!("Shared-assets instance running"),
        Err(e) => error!(error = %e, "Failed to start shared-assets instance"),
    }

    let state = Arc::new(ProxyState::from_config(&config, Arc::clone(&registry))?);
    let stats = state.pool().stats();

    let proxy_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let proxy = ProxyServer::bind(proxy_addr, state, shutdown_rx.clone()).await?;
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    let admin_handle = if config.server.admin_enabled() {
        let admin_addr = SocketAddr::from(([127, 0, 0, 1], config.server.admin_port));

        // Generate or use configured admin token
        let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
            let token = uuid::Uuid::new_v4().to_string();
            info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
            token
        });

        let admin_server = AdminServer::bind(
            admin_addr,
            Arc::clone(&registry),
            stats,
            shutdown_rx.clone(),
            admin_token,
        )
        .await?;

        Some(tokio::spawn(async move {
            if let Err(e) = admin_server.run().await {
                error!(error = %e, "Admin server error");
            }
        }))
    } else {
        None
    };

    // Spawn idle reaper
    let reaper = Reaper::from_settings(Arc::clone(&registry));
    let reaper_handle = tokio::spawn(reaper.run(shutdown_rx.clone()));

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
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
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for listeners and the reaper to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        if let Some(handle) = admin_handle {
            let _ = handle.await;
        }
        let _ = reaper_handle.await;
    })
    .await;

    info!(count = registry.len(), "Stopping all editor instances...");
    registry.stop_all().await;

    info!("Shutdown complete");
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting bullpen");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        admin_port = if config.server.admin_enabled() { Some(config.server.admin_port) } else { None },
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    let instances = &config.instances;
    info!(
        content_root = %instances.content_root.display(),
        backend = %instances.backend_command,
        assets_dir = %instances.assets_dir.display(),
        "Editor settings"
    );
    info!(
        port_range_start = instances.port_range_start,
        port_range_end = instances.port_range_end,
        idle_timeout_secs = instances.idle_timeout_secs,
        reap_interval_secs = instances.reap_interval_secs,
        startup_retries = instances.startup_retries,
        shutdown_grace_period_secs = instances.shutdown_grace_period_secs,
        "Instance lifecycle settings"
    );
}
