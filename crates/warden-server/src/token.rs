use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Query;
use axum::http::{header, HeaderMap, HeaderName, Uri};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::Clock;
use crate::store::Identity;

pub const ISSUER: &str = "warden";

/// Header used by the web client; merged into `Authorization` before
/// verification and used to hand refreshed tokens back.
pub const LEGACY_AUTH_HEADER: HeaderName = HeaderName::from_static("x-warden-authorization");

pub const TOKEN_COOKIE: &str = "jwt";
pub const TOKEN_QUERY_PARAM: &str = "jwt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub adm: bool,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(#[from] jsonwebtoken::errors::Error),
    #[error("could not sign token: {0}")]
    Signing(jsonwebtoken::errors::Error),
}

/// Issues, verifies and refreshes HS256 session tokens. Stateless: any
/// number of tokens per subject may be valid at once.
#[derive(Clone)]
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    window: Duration,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    pub fn new(secret: &[u8], window: Duration, clock: Arc<dyn Clock>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        // Expiry is checked against the injected clock instead.
        validation.validate_exp = false;
        validation.leeway = 0;
        validation.set_issuer(&[ISSUER]);
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);

        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
            window,
            clock,
        }
    }

    pub fn issue(&self, user: &Identity) -> Result<String, TokenError> {
        let now = self.clock.now();
        let claims = Claims {
            sub: user.username.clone(),
            iat: now,
            exp: now.saturating_add(self.window_secs()),
            iss: ISSUER.to_owned(),
            uid: user.id.clone(),
            adm: user.is_admin,
        };
        self.sign(&claims)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let data = decode::<Claims>(token, &self.decoding, &self.validation)?;
        if data.claims.exp <= self.clock.now() {
            return Err(TokenError::Expired);
        }
        Ok(data.claims)
    }

    /// Re-sign `claims` with an extended expiry. The new expiry is never
    /// earlier than the one being refreshed.
    pub fn refresh(&self, claims: &Claims) -> Result<String, TokenError> {
        let now = self.clock.now();
        let refreshed = Claims {
            iat: now,
            exp: claims.exp.max(now.saturating_add(self.window_secs())),
            ..claims.clone()
        };
        self.sign(&refreshed)
    }

    fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding).map_err(TokenError::Signing)
    }

    fn window_secs(&self) -> i64 {
        i64::try_from(self.window.as_secs()).unwrap_or(i64::MAX)
    }
}

/// Copy the legacy client header into `Authorization`. A missing legacy
/// header leaves any existing `Authorization` value untouched.
pub fn merge_legacy_header(headers: &mut HeaderMap) {
    if let Some(value) = headers.get(&LEGACY_AUTH_HEADER).cloned() {
        headers.insert(header::AUTHORIZATION, value);
    }
}

/// Locate a bearer token: `Authorization` header, then the `jwt` cookie,
/// then the `jwt` query parameter. The first non-empty value is returned.
pub fn find_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    token_from_header(headers)
        .or_else(|| token_from_cookie(headers))
        .or_else(|| token_from_query(uri))
}

fn token_from_header(headers: &HeaderMap) -> Option<String> {
    let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then(|| token.to_owned())
}

fn token_from_cookie(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == TOKEN_COOKIE && !value.is_empty())
        .map(|(_, value)| value.to_owned())
}

fn token_from_query(uri: &Uri) -> Option<String> {
    let Query(params) = Query::<HashMap<String, String>>::try_from_uri(uri).ok()?;
    params
        .get(TOKEN_QUERY_PARAM)
        .filter(|v| !v.is_empty())
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use axum::http::HeaderValue;

    const HOUR: Duration = Duration::from_secs(3600);

    fn service(clock: &ManualClock) -> TokenService {
        TokenService::new(b"test-secret", HOUR, Arc::new(clock.clone()))
    }

    fn alice() -> Identity {
        Identity {
            id: "id-1".into(),
            username: "alice".into(),
            is_admin: true,
            ..Default::default()
        }
    }

    #[test]
    fn issued_token_verifies_with_subject() {
        let clock = ManualClock::new(1_000_000);
        let tokens = service(&clock);
        let token = tokens.issue(&alice()).unwrap();
        let claims = tokens.verify(&token).unwrap();
        assert_eq!(claims.sub, "alice");
        assert_eq!(claims.uid, "id-1");
        assert!(claims.adm);
        assert_eq!(claims.exp, 1_000_000 + 3600);
    }

    #[test]
    fn expired_token_is_rejected() {
        let clock = ManualClock::new(1_000_000);
        let tokens = service(&clock);
        let token = tokens.issue(&alice()).unwrap();
        clock.advance(3600);
        assert!(matches!(tokens.verify(&token), Err(TokenError::Expired)));
    }

    #[test]
    fn token_signed_with_other_secret_is_rejected() {
        let clock = ManualClock::new(1_000_000);
        let other = TokenService::new(b"other-secret", HOUR, Arc::new(clock.clone()));
        let token = other.issue(&alice()).unwrap();
        assert!(matches!(
            service(&clock).verify(&token),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn garbage_is_rejected() {
        let clock = ManualClock::new(1_000_000);
        assert!(service(&clock).verify("not.a.token").is_err());
    }

    #[test]
    fn refresh_extends_and_never_shortens() {
        let clock = ManualClock::new(1_000_000);
        let tokens = service(&clock);
        let original = tokens.verify(&tokens.issue(&alice()).unwrap()).unwrap();

        clock.advance(600);
        let refreshed = tokens.verify(&tokens.refresh(&original).unwrap()).unwrap();
        assert!(refreshed.exp >= original.exp);
        assert_eq!(refreshed.exp, 1_000_600 + 3600);
        assert_eq!(refreshed.sub, original.sub);

        // A shorter window must not pull expiry back.
        let short = TokenService::new(b"test-secret", Duration::from_secs(60), Arc::new(clock.clone()));
        let shortened = short.verify(&short.refresh(&refreshed).unwrap()).unwrap();
        assert_eq!(shortened.exp, refreshed.exp);
    }

    #[test]
    fn oversized_window_saturates_instead_of_expiring() {
        let clock = ManualClock::new(1_000_000);
        let tokens = TokenService::new(b"test-secret", Duration::from_secs(u64::MAX), Arc::new(clock.clone()));
        let claims = tokens.verify(&tokens.issue(&alice()).unwrap()).unwrap();
        assert_eq!(claims.exp, i64::MAX);

        clock.advance(600);
        let refreshed = tokens.verify(&tokens.refresh(&claims).unwrap()).unwrap();
        assert_eq!(refreshed.exp, i64::MAX);
    }

    #[test]
    fn refresh_does_not_revoke_old_token() {
        let clock = ManualClock::new(1_000_000);
        let tokens = service(&clock);
        let old = tokens.issue(&alice()).unwrap();
        let claims = tokens.verify(&old).unwrap();
        let _new = tokens.refresh(&claims).unwrap();
        assert!(tokens.verify(&old).is_ok());
    }

    #[test]
    fn header_beats_cookie_beats_query() {
        let uri: Uri = "/api/me?jwt=from-query".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(find_token(&headers, &uri).as_deref(), Some("from-query"));

        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; jwt=from-cookie"));
        assert_eq!(find_token(&headers, &uri).as_deref(), Some("from-cookie"));

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(find_token(&headers, &uri).as_deref(), Some("from-header"));
    }

    #[test]
    fn non_bearer_authorization_is_ignored() {
        let uri: Uri = "/".parse().unwrap();
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(find_token(&headers, &uri).is_none());
    }

    #[test]
    fn legacy_header_is_merged_into_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(&LEGACY_AUTH_HEADER, HeaderValue::from_static("Bearer legacy"));
        merge_legacy_header(&mut headers);
        assert_eq!(headers[header::AUTHORIZATION], "Bearer legacy");
    }

    #[test]
    fn absent_legacy_header_keeps_authorization() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer standard"));
        merge_legacy_header(&mut headers);
        assert_eq!(headers[header::AUTHORIZATION], "Bearer standard");
    }
}
