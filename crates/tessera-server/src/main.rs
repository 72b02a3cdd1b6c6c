//! Tessera server binary.
//!
//! Starts an axum server with structured logging, database initialization,
//! and graceful shutdown on SIGTERM/SIGINT. With `[server.tls]` configured it
//! terminates TLS itself and reads device certificates from the handshake.
//! Otherwise it serves plain HTTP behind a proxy that forwards the client
//! certificate in a header, or devices authenticate with `Mdm-Signature`.

use std::net::SocketAddr;
use std::sync::Arc;

use tessera_db::SqliteCertAuthStore;
use tessera_server::{
    app, build_pipeline, config, service::LoggingService, tls, verifier_from_config, AppState,
};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

fn resolve_config_path() -> (Option<String>, &'static str) {
    if let Some(path) = std::env::args()
        .nth(1)
        .filter(|value| !value.trim().is_empty())
    {
        return (Some(path), "cli-arg");
    }

    if let Ok(path) = std::env::var("TESSERA_CONFIG_PATH") {
        if !path.trim().is_empty() {
            return (Some(path), "env-var");
        }
    }

    (None, "default")
}

#[tokio::main]
async fn main() {
    let (resolved_config_path, config_source) = resolve_config_path();
    let selected_config_path = resolved_config_path.as_deref().or(Some("config.toml"));

    let config = config::load_config(selected_config_path)
        .expect("failed to load configuration, the server cannot start without valid config");

    let filter =
        EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    if config.logging.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(
        source = config_source,
        path = selected_config_path.unwrap_or("<none>"),
        "resolved startup configuration path"
    );

    let pool = tessera_db::create_pool(
        &config.database.path,
        tessera_db::DbRuntimeSettings {
            busy_timeout_ms: config.database.busy_timeout_ms,
            pool_max_size: config.database.pool_max_size,
        },
    )
    .expect("failed to create database pool, check database.path in config");

    {
        let conn = pool
            .get()
            .expect("failed to get database connection for migrations");
        let applied =
            tessera_db::run_migrations(&conn).expect("failed to run database migrations");
        if applied > 0 {
            tracing::info!(count = applied, "applied database migrations");
        }
    }

    let verifier = verifier_from_config(&config.mdm)
        .expect("failed to set up certificate verification, check mdm.verify in config");
    let store = SqliteCertAuthStore::new(pool);
    let pipeline = build_pipeline(&config.mdm, verifier, Arc::new(store.clone()))
        .expect("failed to build identity pipeline, check the mdm section in config");

    tracing::info!(
        extractors = ?config.mdm.extractors,
        enforce_enrollment = config.mdm.enforce_enrollment,
        stages = pipeline.len(),
        "identity pipeline ready"
    );

    let app = app(AppState {
        pipeline: Arc::new(pipeline),
        service: Arc::new(LoggingService::new().with_cert_auth(Arc::new(store))),
    });
    let addr = SocketAddr::new(config.server.host, config.server.port);

    let listener = TcpListener::bind(addr)
        .await
        .expect("failed to bind to address, is another process using this port?");

    if let Some(tls_config) = &config.server.tls {
        let server_config = tls::load_server_config(tls_config)
            .expect("failed to load TLS certificate, check server.tls in config");
        tracing::info!(%addr, cert = %tls_config.cert_path, "starting tessera server with TLS");
        tls::serve_tls(listener, server_config, app, shutdown_signal()).await;
    } else {
        tracing::info!(%addr, "starting tessera server");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .expect("server error");
    }

    tracing::info!("tessera server shut down");
}

/// Waits for a SIGINT (Ctrl+C) or SIGTERM signal for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { tracing::info!("received SIGINT, initiating graceful shutdown"); }
        () = terminate => { tracing::info!("received SIGTERM, initiating graceful shutdown"); }
    }
}
