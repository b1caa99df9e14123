//! Per-request caller identification.
//!
//! A [`ResolverChain`] asks each [`UsernameSource`] in order for a username;
//! the first non-empty answer wins and is then reloaded from the repository.

use std::sync::Arc;

use axum::http::{HeaderMap, HeaderName};
use thiserror::Error;
use tracing::{error, trace, warn};

use crate::store::{Identity, UserRepository};
use crate::token::Claims;
use crate::trust::TrustList;

/// What the resolution strategies may look at.
#[derive(Debug, Clone, Copy)]
pub struct RequestAttrs<'a> {
    pub headers: &'a HeaderMap,
    /// Peer address as seen by the server, usually `ip:port`.
    pub remote_addr: Option<&'a str>,
    /// Claims of a token that already passed verification.
    pub claims: Option<&'a Claims>,
}

/// One way of naming the caller.
pub trait UsernameSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn username(&self, req: &RequestAttrs<'_>) -> Option<String>;
}

/// Fixed username from configuration. Always answers when set.
#[derive(Debug, Clone)]
pub struct ConfiguredUsername(pub Option<String>);

impl UsernameSource for ConfiguredUsername {
    fn name(&self) -> &'static str {
        "config"
    }

    fn username(&self, _req: &RequestAttrs<'_>) -> Option<String> {
        self.0.clone().filter(|u| !u.is_empty())
    }
}

/// Subject of the verified session token.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenSubject;

impl UsernameSource for TokenSubject {
    fn name(&self) -> &'static str {
        "token"
    }

    fn username(&self, req: &RequestAttrs<'_>) -> Option<String> {
        let claims = req.claims?;
        (!claims.sub.is_empty()).then(|| claims.sub.clone())
    }
}

/// Username asserted by a reverse proxy, honoured only from allowlisted peers.
#[derive(Debug, Clone)]
pub struct ProxyHeader {
    header: Option<HeaderName>,
    trusted: TrustList,
}

impl ProxyHeader {
    /// An unparsable header name disables the source.
    pub fn new(header: &str, allowlist: &str) -> Self {
        Self {
            header: HeaderName::try_from(header).ok(),
            trusted: TrustList::parse(allowlist),
        }
    }
}

impl UsernameSource for ProxyHeader {
    fn name(&self) -> &'static str {
        "reverse-proxy"
    }

    fn username(&self, req: &RequestAttrs<'_>) -> Option<String> {
        let header = self.header.as_ref()?;
        if self.trusted.is_empty() {
            return None;
        }
        let addr = req.remote_addr.unwrap_or_default();
        if !self.trusted.contains(addr) {
            if req.headers.contains_key(header) {
                warn!(ip = addr, "peer not allowlisted for reverse proxy login");
            }
            return None;
        }
        let value = req.headers.get(header)?.to_str().ok()?.trim();
        (!value.is_empty()).then(|| value.to_owned())
    }
}

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("request not authenticated")]
    Unauthenticated,
    #[error("authenticated user {0} no longer exists")]
    Vanished(String),
    #[error(transparent)]
    Repository(#[from] anyhow::Error),
}

/// Ordered list of username sources.
#[derive(Clone, Default)]
pub struct ResolverChain {
    sources: Vec<Arc<dyn UsernameSource>>,
}

impl ResolverChain {
    pub fn new(sources: Vec<Arc<dyn UsernameSource>>) -> Self {
        Self { sources }
    }

    /// Config, then token, then reverse-proxy header.
    pub fn standard(configured: Option<String>, proxy: ProxyHeader) -> Self {
        Self::new(vec![
            Arc::new(ConfiguredUsername(configured)),
            Arc::new(TokenSubject),
            Arc::new(proxy),
        ])
    }

    /// Sources usable without a session token: config, then reverse-proxy header.
    pub fn header_login(configured: Option<String>, proxy: ProxyHeader) -> Self {
        Self::new(vec![Arc::new(ConfiguredUsername(configured)), Arc::new(proxy)])
    }

    /// First non-empty username, with the name of the source that produced it.
    pub fn username(&self, req: &RequestAttrs<'_>) -> Option<(&'static str, String)> {
        self.sources.iter().find_map(|source| {
            let username = source.username(req)?;
            trace!(source = source.name(), username = %username, "username resolved");
            Some((source.name(), username))
        })
    }

    /// Resolve the caller and reload them from the repository.
    pub fn resolve(
        &self,
        req: &RequestAttrs<'_>,
        users: &dyn UserRepository,
    ) -> Result<Identity, ResolveError> {
        let (_, username) = self.username(req).ok_or(ResolveError::Unauthenticated)?;
        match users.find_by_username(&username) {
            Ok(Some(user)) => Ok(user),
            Ok(None) => {
                error!(username = %username, "authenticated username not found in store");
                Err(ResolveError::Vanished(username))
            }
            Err(e) => Err(ResolveError::Repository(e)),
        }
    }
}
