use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gymbook::config::Settings;
use gymbook::directory::{
    Directory, Entitlements, HttpDirectory, HttpEntitlements, StaticDirectory, StaticEntitlements,
};
use gymbook::engine::Engine;
use gymbook::{compactor, observability, wire};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = Settings::from_env()?;
    observability::init(settings.metrics_port)?;
    let credentials = Arc::new(settings.credentials()?);

    let timeout = Duration::from_millis(settings.collaborator_timeout_ms);
    let directory: Arc<dyn Directory> = match &settings.user_service_url {
        Some(url) => Arc::new(HttpDirectory::new(url, timeout)?),
        None => Arc::new(StaticDirectory::permissive()),
    };
    let entitlements: Arc<dyn Entitlements> = match &settings.subscription_service_url {
        Some(url) => Arc::new(HttpEntitlements::new(url, timeout)?),
        None => Arc::new(StaticEntitlements::unlimited()),
    };

    let rules = settings.rules();
    let wal_path = PathBuf::from(&settings.data_dir).join("gymbook.wal");
    let engine = Arc::new(Engine::open(&wal_path, rules.clone(), directory, entitlements).await?);
    tokio::spawn(compactor::run_compactor(engine.clone(), settings.compact_threshold));

    let max_connections = settings.max_connections;
    let semaphore = Arc::new(Semaphore::new(max_connections));

    let addr = format!("{}:{}", settings.bind, settings.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("gymbook listening on {addr}");
    info!("  wal: {}", wal_path.display());
    info!("  max_connections: {max_connections}");
    info!("  named logins: {}", credentials.named_logins());
    info!(
        "  identity: {} ({})",
        settings.user_service_url.as_deref().unwrap_or("open directory"),
        rules.identity_policy.as_str()
    );
    info!(
        "  entitlements: {} ({})",
        settings.subscription_service_url.as_deref().unwrap_or("unlimited"),
        rules.entitlement_policy.as_str()
    );
    info!(
        "  cancel lead time: {}h, reoffer cancelled sessions: {}",
        settings.cancel_lead_time_hours, rules.reoffer_cancelled_sessions
    );
    info!(
        "  metrics: {}",
        settings
            .metrics_port
            .map_or("disabled".to_string(), |p| format!("http://0.0.0.0:{p}/metrics"))
    );

    // Graceful shutdown: stop accepting on SIGTERM/ctrl-c, drain in-flight connections
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let shutdown = async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            tokio::select! {
                _ = ctrl_c => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
        }
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (socket, peer) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::error!("accept error: {e}");
                        continue;
                    }
                };

                let Ok(permit) = semaphore.clone().try_acquire_owned() else {
                    tracing::warn!("connection limit reached, rejecting {peer}");
                    metrics::counter!(observability::CONNECTIONS_REJECTED_TOTAL).increment(1);
                    drop(socket);
                    continue;
                };

                info!("connection from {peer}");
                metrics::counter!(observability::CONNECTIONS_TOTAL).increment(1);
                metrics::gauge!(observability::CONNECTIONS_ACTIVE).increment(1.0);
                let engine = engine.clone();
                let credentials = credentials.clone();

                tokio::spawn(async move {
                    let _permit = permit; // held until connection closes
                    if let Err(e) = wire::process_connection(socket, engine, credentials).await {
                        tracing::error!("connection error from {peer}: {e}");
                    }
                    metrics::gauge!(observability::CONNECTIONS_ACTIVE).decrement(1.0);
                });
            }
            _ = &mut shutdown => {
                info!("shutdown signal received, stopping accept loop");
                break;
            }
        }
    }

    // Wait for in-flight connections to finish (up to 10s)
    info!("draining connections...");
    let drain_deadline = tokio::time::sleep(Duration::from_secs(10));
    tokio::pin!(drain_deadline);

    loop {
        if semaphore.available_permits() == max_connections {
            info!("all connections drained");
            break;
        }
        tokio::select! {
            _ = &mut drain_deadline => {
                let remaining = max_connections - semaphore.available_permits();
                tracing::warn!("drain timeout, {remaining} connections still open");
                break;
            }
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }

    info!("gymbook stopped");
    Ok(())
}
