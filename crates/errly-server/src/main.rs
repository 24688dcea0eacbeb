//! Errly binary entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use errly_platform::{PlatformClient, PlatformConfig};
use errly_server::{
    api, AppState, Config, ErrorGrouper, ErrorRateMeter, LogWatcher, PushHub, RetentionSweeper,
    WatcherConfig,
};
use errly_store::Store;
use secrecy::SecretString;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Overall shutdown budget; on expiry the process force-exits with failure.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(8);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "errly=info,tower_http=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting errly");

    let config = Arc::new(Config::load()?);
    let store = Store::open(&config.db_path).await?;
    tracing::info!(db_path = %config.db_path.display(), "store opened");

    let meter = Arc::new(ErrorRateMeter::new());
    let grouper = Arc::new(ErrorGrouper::new(store.clone()));
    let hub = PushHub::new(store.clone(), config.max_sse_clients);
    hub.start();

    let (platform, watcher) = if config.auto_capture_enabled() {
        let token = SecretString::from(
            config
                .platform_token
                .clone()
                .expect("auto_capture_enabled checked platform_token"),
        );
        let platform = Arc::new(PlatformClient::new(PlatformConfig::new(token))?);
        let watcher = LogWatcher::new(
            Arc::clone(&platform),
            store.clone(),
            Arc::clone(&grouper),
            Arc::clone(&hub),
            Arc::clone(&meter),
            WatcherConfig {
                project_id: config
                    .project_id
                    .clone()
                    .expect("auto_capture_enabled checked project_id"),
                environment_name: config.environment_name.clone(),
                self_service_id: config.self_service_id.clone(),
                max_subscriptions: config.max_subscriptions,
            },
        );
        watcher.start();
        tracing::info!("auto-capture enabled");
        (Some(platform), Some(watcher))
    } else {
        tracing::info!("auto-capture disabled (no platform token or project id)");
        (None, None)
    };

    let retention_cancel = CancellationToken::new();
    let sweeper = RetentionSweeper::new(store.clone(), Arc::clone(&hub), retention_cancel.clone());
    sweeper.start();

    let state = AppState {
        config: Arc::clone(&config),
        store: store.clone(),
        grouper,
        hub: Arc::clone(&hub),
        watcher: watcher.clone(),
        platform,
        meter,
        started_at: Instant::now(),
    };
    let app = api::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(address = %addr, "errly listening");

    let shutdown = {
        let hub = Arc::clone(&hub);
        async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");

            if let Some(watcher) = watcher {
                watcher.shutdown();
            }
            retention_cancel.cancel();
            // Closes every push stream, which lets the server drain.
            hub.shutdown();

            tokio::spawn(async {
                tokio::time::sleep(SHUTDOWN_BUDGET).await;
                tracing::error!("shutdown budget exceeded; forcing exit");
                std::process::exit(1);
            });
        }
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    store.close().await;
    tracing::info!("shutdown complete");
    Ok(())
}

/// Resolve on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received Ctrl+C"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}
