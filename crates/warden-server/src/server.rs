use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    http::{HeaderValue, Method},
    middleware,
    routing::{get, post},
    Router,
};
use rand::RngCore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::{refresh_token, require_user, verify_token},
    clock::SystemClock,
    config::AuthConfig,
    directory::ldap::LdapConnector,
    handlers::{create_admin, header_login, health, login, me},
    store::{crypto, Store},
    AppState,
};

/// Listener and storage settings. Built by the daemon from its flags.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub cors_origins: Option<String>,
    pub auth: AuthConfig,
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let enc_key = match &cfg.auth.password_encryption_key {
        Some(passphrase) => crypto::derive_key(passphrase),
        None => load_or_create_key(&data_dir)?,
    };
    let store = Store::open(&data_dir.join("warden.db"), enc_key).context("open store")?;

    let secret = match &cfg.auth.session_secret {
        Some(s) => s.as_bytes().to_vec(),
        None => load_or_create_secret(&data_dir)?,
    };

    if let Some(user) = &cfg.auth.dev_auto_login_username {
        warn!(username = %user, "dev auto-login enabled: every request is authenticated as this user");
    }
    if !cfg.auth.reverse_proxy_whitelist.is_empty() {
        info!(
            header = %cfg.auth.reverse_proxy_user_header,
            whitelist = %cfg.auth.reverse_proxy_whitelist,
            "reverse proxy authentication enabled"
        );
    }
    match &cfg.auth.directory {
        Some(dir) => info!(url = %dir.url, base = %dir.base, "directory login enabled"),
        None => info!("directory login disabled; using local accounts only"),
    }

    let state = AppState::new(
        &cfg.auth,
        Arc::new(store),
        &secret,
        Arc::new(SystemClock),
        Arc::new(LdapConnector),
    );

    let app = build_router(state)
        .layer(build_cors(cfg.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "warden server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

/// All routes with the auth middleware in place. Peer addresses come from
/// `ConnectInfo<SocketAddr>` (or `MockConnectInfo` in tests).
pub fn build_router(state: AppState) -> Router {
    // Public routes (no auth required).
    let public = Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .route("/auth/createAdmin", post(create_admin))
        .route("/auth/header-login", get(header_login));

    // Authenticated routes; refreshed tokens ride back on the response.
    let protected = Router::new()
        .route("/api/me", get(me))
        .route_layer(middleware::from_fn_with_state(state.clone(), refresh_token))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_user));

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(middleware::from_fn_with_state(state.clone(), verify_token))
        .with_state(state)
}

pub fn resolve_data_dir(explicit: Option<&PathBuf>) -> Result<PathBuf> {
    match explicit {
        Some(d) => {
            std::fs::create_dir_all(d).context("create data dir")?;
            Ok(d.clone())
        }
        None => crate::dirs::data_dir(),
    }
}

fn load_or_create_key(data_dir: &Path) -> Result<crypto::EncryptionKey> {
    let key_path = data_dir.join("warden.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path).context("read warden.key")?;
        crypto::load_key(&bytes).ok_or_else(|| {
            anyhow::anyhow!(
                "warden.key is corrupt (expected 32 bytes, got {})",
                bytes.len()
            )
        })
    } else {
        let key = crypto::generate_key();
        std::fs::write(&key_path, key.as_bytes()).context("write warden.key")?;
        info!("generated new credential encryption key");
        Ok(key)
    }
}

fn load_or_create_secret(data_dir: &Path) -> Result<Vec<u8>> {
    let path = data_dir.join("session.secret");
    if path.exists() {
        let secret = std::fs::read_to_string(&path).context("read session.secret")?;
        let secret = secret.trim();
        anyhow::ensure!(!secret.is_empty(), "session.secret is empty");
        Ok(secret.as_bytes().to_vec())
    } else {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let secret = hex::encode(bytes);
        std::fs::write(&path, &secret).context("write session.secret")?;
        info!("generated new session signing secret");
        Ok(secret.into_bytes())
    }
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([crate::token::LEGACY_AUTH_HEADER]);

    match origins {
        Some(o) => {
            let origins: Vec<HeaderValue> = o
                .split(',')
                .filter_map(|s| s.trim().parse().ok())
                .collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
