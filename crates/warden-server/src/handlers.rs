use axum::{
    body::Bytes,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::{
    auth::{remote_addr, CurrentUser},
    error::AuthError,
    payload::{build_auth_payload, AuthPayload},
    resolve::RequestAttrs,
    store::{BootstrapResult, Identity, UserMeta},
    AppState,
};

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Login ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct Credentials {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn parse_credentials(body: &[u8]) -> Result<Credentials, AuthError> {
    serde_json::from_slice(body).map_err(|e| {
        error!(error = %e, "parsing request body");
        AuthError::MalformedInput
    })
}

pub async fn login(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<AuthPayload>, AuthError> {
    let creds = parse_credentials(&body)?;
    do_login(&state, &creds.username, &creds.password).await
}

async fn do_login(
    state: &AppState,
    username: &str,
    password: &str,
) -> Result<Json<AuthPayload>, AuthError> {
    let user = match state.credentials.validate(username, password).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!(username, "unsuccessful login");
            return Err(AuthError::InvalidCredentials);
        }
        Err(e) => return Err(AuthError::Internal(e.context("validating credentials"))),
    };

    let token = state
        .tokens
        .issue(&user)
        .map_err(|e| AuthError::Internal(anyhow::Error::new(e).context("issuing session token")))?;

    info!(username = %user.username, "audit: user.login");
    let mut payload = build_auth_payload(&user, state.enable_gravatar);
    payload.token = Some(token);
    Ok(Json(payload))
}

// ── Bootstrap admin ───────────────────────────────────────────────────────────

pub async fn create_admin(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<AuthPayload>, AuthError> {
    let creds = parse_credentials(&body)?;
    if creds.username.trim().is_empty() {
        return Err(AuthError::MalformedInput);
    }

    warn!(username = %creds.username, "creating initial admin user");
    let admin = Identity {
        username: creds.username.clone(),
        name: title_case(&creds.username),
        password: creds.password.clone(),
        is_admin: true,
        ..Default::default()
    };

    match state.users.create_first_admin(&admin) {
        Ok(BootstrapResult::Created(_)) => {}
        Ok(BootstrapResult::AlreadyInitialized) => return Err(AuthError::AlreadyInitialized),
        Err(e) => return Err(AuthError::Internal(e.context("creating initial admin"))),
    }

    do_login(&state, &creds.username, &creds.password).await
}

fn title_case(s: &str) -> String {
    s.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

// ── Header login ──────────────────────────────────────────────────────────────

/// Login payload for callers identified by configuration or a trusted proxy
/// header. No token is issued. 204 when no such identity is available.
pub async fn header_login(State(state): State<AppState>, request: Request) -> Response {
    let addr = remote_addr(&request);
    let attrs = RequestAttrs {
        headers: request.headers(),
        remote_addr: addr.as_deref(),
        claims: None,
    };

    match header_login_payload(&state, &attrs) {
        Some(payload) => Json(payload).into_response(),
        None => StatusCode::NO_CONTENT.into_response(),
    }
}

fn header_login_payload(state: &AppState, attrs: &RequestAttrs<'_>) -> Option<AuthPayload> {
    let (source, username) = state.header_login.username(attrs)?;

    let user = match state.users.find_by_username_with_password(&username) {
        Ok(Some(user)) => user,
        Ok(None) => {
            warn!(username = %username, source, "user passed in header not found");
            return None;
        }
        Err(e) => {
            error!(username = %username, error = %e, "could not load header login user");
            return None;
        }
    };

    if let Err(e) = state.users.update_last_login_at(&user.username) {
        error!(username = %username, error = %e, "could not update last login");
        return None;
    }

    Some(build_auth_payload(&user, state.enable_gravatar))
}

// ── Current user ──────────────────────────────────────────────────────────────

pub async fn me(Extension(CurrentUser(user)): Extension<CurrentUser>) -> Json<UserMeta> {
    Json(UserMeta::from(&user))
}
