use std::sync::Arc;

use ride_dispatch::api;
use ride_dispatch::backend::HttpDispatchApi;
use ride_dispatch::clock::SystemClock;
use ride_dispatch::config::Config;
use ride_dispatch::error::AppError;
use ride_dispatch::observability::metrics::Metrics;
use ride_dispatch::runtime::{run_driver_runtime, RuntimeChannels};
use ride_dispatch::session::{DriverSession, SessionDeps};
use ride_dispatch::state::AppState;
use ride_dispatch::store::FileStore;
use ride_dispatch::transport::blacklist::TokenBlacklist;
use ride_dispatch::transport::events::DriverIdentity;
use ride_dispatch::transport::socket::{SocketClient, SocketConfig};
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(config.log_level.clone()))
        .with_target(false)
        .compact()
        .init();

    let metrics = Metrics::new();
    let store = Arc::new(FileStore::open(config.state_file())?);
    let blacklist = Arc::new(TokenBlacklist::new());

    let socket = Arc::new(SocketClient::spawn(
        SocketConfig {
            url: config.socket_url.clone(),
            token: config.auth_token.clone(),
            identity: DriverIdentity {
                driver_id: config.driver_id.clone(),
                vehicle_type: config.vehicle_type,
                pickup_location: config.pickup_location.clone(),
            },
            reconnect: config.reconnect_backoff(),
            event_buffer: config.event_buffer_size,
        },
        blacklist,
    )?);
    let backend = Arc::new(HttpDispatchApi::new(
        config.api_base_url.clone(),
        config.auth_token.clone(),
    )?);

    let (session, replies) = DriverSession::new(
        SessionDeps {
            driver_id: config.driver_id.clone(),
            sink: socket.clone(),
            api: backend,
            store,
            clock: Arc::new(SystemClock),
            metrics: metrics.clone(),
        },
        config.session_settings(),
    );

    let (app_state, shutdown_rx) = AppState::new(session.clone(), metrics.clone());
    let shared_state = Arc::new(app_state);

    let channels = RuntimeChannels {
        inbound: socket.subscribe(),
        connection: socket.connection(),
        replies,
        shutdown: shutdown_rx.clone(),
    };
    let runtime_settings = config.runtime_settings();
    let runtime_session = session.clone();
    let runtime = tokio::spawn(async move {
        runtime_session.mount().await;
        run_driver_runtime(runtime_session, channels, runtime_settings, metrics).await;
    });

    let app = api::rest::router(shared_state.clone()).layer(CorsLayer::permissive());

    let bind_addr = format!("0.0.0.0:{}", config.http_port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|err| AppError::Internal(format!("failed to bind {bind_addr}: {err}")))?;

    tracing::info!(
        http_port = config.http_port,
        driver_id = %config.driver_id,
        session_id = %session.session_id(),
        "driver client started"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_rx))
        .await
        .map_err(|err| AppError::Internal(format!("server error: {err}")))?;

    shared_state.request_shutdown();
    if let Err(err) = runtime.await {
        tracing::error!(error = %err, "driver runtime task failed");
    }
    socket.close();

    Ok(())
}

async fn shutdown_signal(mut logout: watch::Receiver<bool>) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
        }
        _ = logout.wait_for(|stopped| *stopped) => {
            tracing::info!("session ended; shutting down");
        }
    }
}
