// Entrypoint: loads configuration, sets up logging, wires state and serves until Ctrl+C or SIGTERM.

use std::net::SocketAddr;

use axum::{
    http::{header, HeaderValue, Method},
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer};
use tracing_subscriber::{fmt, EnvFilter};

use crud_server::config::AppConfig;
use crud_server::handlers::{app, AppState};
use crud_server::security::CSRF_HEADER;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Compact logs by default, JSON lines with LOG_FORMAT=json; RUST_LOG overrides the filter.
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,axum=info,tower_http=info"));
    if std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        fmt().with_env_filter(env_filter).json().init();
    } else {
        fmt().with_env_filter(env_filter).compact().init();
    }

    let cfg = match AppConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };
    if cfg.jwt.uses_dev_secret() {
        tracing::warn!("JWT_SECRET not set, using the development secret");
    }

    let state = AppState::initialize(&cfg).await?;

    let router: Router = app(state).layer(CompressionLayer::new()).layer(cors_layer(&cfg.security.cors_origins));

    let listener = tokio::net::TcpListener::bind((cfg.server.host.as_str(), cfg.server.port)).await?;
    let addr = listener.local_addr()?;
    tracing::info!(environment = %cfg.environment, csrf_enforced = cfg.security.csrf_enforce, "listening on {}", addr);

    // Connect info feeds the per-client rate limiter when no X-Forwarded-For is present.
    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::HeaderName::from_static(CSRF_HEADER)])
        .allow_credentials(true)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! { _ = ctrl_c => {}, _ = terminate => {}, }
    tracing::info!("shutdown signal received");
}
