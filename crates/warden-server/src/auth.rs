use std::net::SocketAddr;

use axum::{
    extract::{
        connect_info::{ConnectInfo, MockConnectInfo},
        Request, State,
    },
    http::{HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{debug, error};

use crate::error::AuthError;
use crate::resolve::{RequestAttrs, ResolveError};
use crate::store::Identity;
use crate::token::{self, Claims, LEGACY_AUTH_HEADER};
use crate::AppState;

/// Claims of the token that passed verification on this request.
#[derive(Debug, Clone)]
pub struct VerifiedToken(pub Claims);

/// The caller, reloaded from the store for this request.
#[derive(Debug, Clone)]
pub struct CurrentUser(pub Identity);

/// Username of the caller, for handlers that need nothing else.
#[derive(Debug, Clone)]
pub struct Username(pub String);

/// Peer address of the connection, `ip:port`.
pub fn remote_addr(request: &Request) -> Option<String> {
    let ext = request.extensions();
    ext.get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .or_else(|| ext.get::<MockConnectInfo<SocketAddr>>().map(|MockConnectInfo(addr)| *addr))
        .map(|addr| addr.to_string())
}

/// Merges the legacy header, looks for a bearer token and, when it
/// verifies, attaches [`VerifiedToken`]. Never rejects on its own.
pub async fn verify_token(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    token::merge_legacy_header(request.headers_mut());

    if let Some(raw) = token::find_token(request.headers(), request.uri()) {
        match state.tokens.verify(&raw) {
            Ok(claims) => {
                request.extensions_mut().insert(VerifiedToken(claims));
            }
            Err(e) => debug!(error = %e, "ignoring unverifiable session token"),
        }
    }

    next.run(request).await
}

/// Resolves the caller through the resolver chain or answers 401.
pub async fn require_user(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let addr = remote_addr(&request);
    let verified = request.extensions().get::<VerifiedToken>().map(|t| t.0.clone());
    let attrs = RequestAttrs {
        headers: request.headers(),
        remote_addr: addr.as_deref(),
        claims: verified.as_ref(),
    };

    let user = match state.resolver.resolve(&attrs, state.users.as_ref()) {
        Ok(user) => user,
        Err(ResolveError::Repository(e)) => return AuthError::Internal(e).into_response(),
        Err(e) => {
            debug!(error = %e, uri = %request.uri(), "rejecting unauthenticated request");
            return AuthError::Unauthenticated.into_response();
        }
    };

    request.extensions_mut().insert(Username(user.username.clone()));
    request.extensions_mut().insert(CurrentUser(user));
    next.run(request).await
}

/// Hands back a re-signed token on every request that arrived with a valid
/// one. The incoming token is not revoked.
pub async fn refresh_token(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(VerifiedToken(claims)) = request.extensions().get::<VerifiedToken>().cloned() else {
        return next.run(request).await;
    };

    let fresh = match state.tokens.refresh(&claims) {
        Ok(fresh) => fresh,
        Err(e) => {
            error!(username = %claims.sub, error = %e, "could not sign refreshed token");
            return AuthError::Unauthenticated.into_response();
        }
    };

    let mut response = next.run(request).await;
    match HeaderValue::try_from(format!("Bearer {fresh}")) {
        Ok(value) => {
            response.headers_mut().insert(LEGACY_AUTH_HEADER, value);
        }
        Err(e) => {
            error!(error = %e, "refreshed token is not a valid header value");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }
    response
}
