use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use turnstile_common::AppConfig;
use turnstile_server::{build_router, Limiters, Upstream};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).json().init();

    // Parse command-line args for config path
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/turnstile.yaml".to_string());

    info!(config_path = %config_path, "starting turnstile");

    let config = AppConfig::load(&config_path)?;
    let limiters = Limiters::from_settings(&config.rate_limit)?;
    limiters.start_sweepers(Duration::from_secs(config.rate_limit.sweep_interval_secs))?;

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let admin_task = if config.server.admin.enabled {
        let state = turnstile_admin::new_shared_state(config.clone(), limiters.all())?;
        let listen = config.server.admin.listen.clone();
        let token = shutdown.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = turnstile_admin::run_admin_server(state, &listen, token.clone()).await {
                error!(error = %e, "admin API server error");
                token.cancel();
            }
        }))
    } else {
        None
    };

    let upstream = Upstream::new(&config.server.upstream, config.server.body_limit)?;
    let app = build_router(upstream, &limiters, &config.rate_limit.auth_paths);

    let listener = tokio::net::TcpListener::bind(&config.server.listen).await?;
    info!(
        addr = %config.server.listen,
        upstream = %config.server.upstream,
        "turnstile listening"
    );

    let token = shutdown.clone();
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { token.cancelled().await })
    .await;

    shutdown.cancel();
    if let Some(task) = admin_task {
        if let Err(e) = task.await {
            error!(error = %e, "admin API task failed");
        }
    }
    if let Err(e) = limiters.stop_sweepers().await {
        error!(error = %e, "sweeper did not stop cleanly");
    }

    served?;
    info!("turnstile stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown signal received");
                shutdown.cancel();
            }
            Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
        }
    });
}
