use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use directories::ProjectDirs;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    crypto::CryptoBox,
    handlers::{create_note, health, read_note, stat},
    hasher::{HasherConfig, PasswordHasher},
    service::{NoteService, ServiceConfig},
    store::RedbNoteStore,
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Collection (redb table) holding the notes.
    pub collection: String,
    /// Bound into every ciphertext as associated data when set.
    pub crypto_secret: Option<String>,
    pub hasher: HasherConfig,
    pub service: ServiceConfig,
    pub cors_origins: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let service_defaults = ServiceConfig::default();
        Self {
            host: std::env::var("TACHYON_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse::<u16>("TACHYON_PORT")
                .or_else(|| env_parse("PORT"))
                .unwrap_or(1323),
            data_dir: std::env::var("TACHYON_DATA_DIR").ok().map(PathBuf::from),
            collection: std::env::var("TACHYON_DB_NOTES_BASE").unwrap_or_else(|_| "notes".into()),
            crypto_secret: std::env::var("TACHYON_CRYPTO_SECRET")
                .ok()
                .filter(|s| !s.is_empty()),
            hasher: hasher_config_from_env(),
            service: ServiceConfig {
                store_timeout: std::env::var("TACHYON_STORE_TIMEOUT")
                    .ok()
                    .and_then(|v| humantime::parse_duration(&v).ok())
                    .unwrap_or(service_defaults.store_timeout),
                read_retries: env_parse("TACHYON_READ_RETRIES")
                    .unwrap_or(service_defaults.read_retries),
            },
            cors_origins: std::env::var("TACHYON_CORS_ORIGINS").ok(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

fn hasher_config_from_env() -> HasherConfig {
    let defaults = HasherConfig::default();
    let m_cost = env_parse("TACHYON_ARGON2_M_COST").unwrap_or(defaults.argon2_params.m_cost());
    let t_cost = env_parse("TACHYON_ARGON2_T_COST").unwrap_or(defaults.argon2_params.t_cost());
    let p_cost = env_parse("TACHYON_ARGON2_P_COST").unwrap_or(defaults.argon2_params.p_cost());

    let argon2_params = match argon2::Params::new(m_cost, t_cost, p_cost, None) {
        Ok(params) => params,
        Err(e) => {
            warn!(error = %e, "invalid argon2 parameters, using defaults");
            defaults.argon2_params.clone()
        }
    };

    HasherConfig {
        argon2_params,
        workers: env_parse::<usize>("TACHYON_HASH_WORKERS")
            .filter(|n| *n > 0)
            .unwrap_or(defaults.workers),
    }
}

/// Resolve (and create) the directory holding `tachyon.db`.
///
/// An explicit dir (`TACHYON_DATA_DIR` via `ServerConfig`) wins over the
/// platform data dir (`~/.local/share/tachyon/` on Linux).
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let path = match data_dir {
        Some(d) => d.clone(),
        None => ProjectDirs::from("", "", "tachyon")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create data dir {}", path.display()))?;
    Ok(path)
}

/// Routes without middleware, so tests can drive them directly.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/api/health", get(health))
        .route("/api/stat", get(stat))
        .route("/api/note", post(create_note))
        .route("/api/note/", post(create_note))
        .route("/api/note/{sign}", get(read_note))
        .route("/api/note/{sign}/", get(read_note))
        .with_state(state)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    // Opened once; dropped when the server stops.
    let db_path = data_dir.join("tachyon.db");
    let store = RedbNoteStore::open(&db_path, &cfg.collection).context("open note store")?;

    if cfg.crypto_secret.is_none() {
        info!("TACHYON_CRYPTO_SECRET not set; ciphertexts carry no server binding");
    }
    info!(
        workers = cfg.hasher.workers,
        retries = cfg.service.read_retries,
        timeout = ?cfg.service.store_timeout,
        "note service configured"
    );

    let notes = NoteService::new(
        Arc::new(store),
        CryptoBox::new(cfg.crypto_secret.as_deref()),
        PasswordHasher::new(cfg.hasher),
        cfg.service,
    );

    let app = router(AppState { notes })
        .layer(build_cors(cfg.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "tachyon server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("tachyon server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<http::HeaderValue> = o
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
