use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::{DirectoryConnection, DirectoryEntry, DirectoryError, DirectoryMatch};
use crate::config::DirectoryConfig;

/// Where a directory session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Connected,
    BoundService,
    BoundUser,
    Failed,
}

/// One short-lived directory connection used for a single login attempt.
///
/// Driven through [`DirectorySession::verify_credentials`], which always
/// restores the service bind and closes the connection.
pub(super) struct DirectorySession<'a> {
    conn: Box<dyn DirectoryConnection>,
    cfg: &'a DirectoryConfig,
    state: SessionState,
}

impl<'a> DirectorySession<'a> {
    /// Run one credential check over `conn`, then restore the service bind
    /// (best effort) and release the connection. Every outcome passes
    /// through the release step.
    pub(super) async fn verify_credentials(
        conn: Box<dyn DirectoryConnection>,
        cfg: &'a DirectoryConfig,
        username: &str,
        password: &str,
    ) -> Result<Option<DirectoryMatch>, DirectoryError> {
        let mut session = DirectorySession {
            conn,
            cfg,
            state: SessionState::Connected,
        };
        let outcome = session.check(username, password).await;
        session.release().await;
        outcome
    }

    async fn check(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<Option<DirectoryMatch>, DirectoryError> {
        self.bind_service().await?;

        let Some(found) = self.find_user(username).await? else {
            return Ok(None);
        };

        match self.bind_user(&found.dn, password).await {
            Ok(()) => Ok(Some(found)),
            Err(e) => {
                warn!(username, dn = %found.dn, error = %e, "directory rejected user bind");
                Ok(None)
            }
        }
    }

    async fn bind_service(&mut self) -> Result<(), DirectoryError> {
        let cfg = self.cfg;
        match bounded(cfg.timeout, "service bind", self.conn.bind(&cfg.bind_dn, &cfg.bind_password)).await {
            Ok(()) => {
                self.state = SessionState::BoundService;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    async fn bind_user(&mut self, dn: &str, password: &str) -> Result<(), DirectoryError> {
        if password.is_empty() {
            // Most servers treat an empty password as an anonymous bind that succeeds.
            self.state = SessionState::Failed;
            return Err(DirectoryError::Bind("empty password refused".into()));
        }
        match bounded(self.cfg.timeout, "user bind", self.conn.bind(dn, password)).await {
            Ok(()) => {
                self.state = SessionState::BoundUser;
                Ok(())
            }
            Err(e) => {
                self.state = SessionState::Failed;
                Err(e)
            }
        }
    }

    /// Search the configured base for `username`. `Ok(None)` unless exactly
    /// one entry matches.
    async fn find_user(&mut self, username: &str) -> Result<Option<DirectoryMatch>, DirectoryError> {
        let cfg = self.cfg;
        let filter = cfg.search_filter.replace("%s", &ldap3::ldap_escape(username));
        let attrs = ["dn", cfg.name_attr.as_str(), cfg.mail_attr.as_str()];

        let entries = bounded(cfg.timeout, "search", self.conn.search(&cfg.base, &filter, &attrs)).await;
        let mut entries = match entries {
            Ok(entries) => entries,
            Err(e) => {
                self.state = SessionState::Failed;
                return Err(e);
            }
        };

        if entries.len() != 1 {
            debug!(username, found = entries.len(), "directory search did not return exactly one entry");
            return Ok(None);
        }
        let entry = entries.remove(0);
        Ok(Some(DirectoryMatch {
            mail: first_value(&entry, &cfg.mail_attr),
            name: first_value(&entry, &cfg.name_attr),
            dn: entry.dn,
        }))
    }

    async fn release(mut self) {
        if self.state != SessionState::BoundService {
            if let Err(e) = self.bind_service().await {
                error!(error = %e, "could not restore directory service bind");
            }
        }
        if tokio::time::timeout(self.cfg.timeout, self.conn.close()).await.is_err() {
            warn!("directory unbind timed out; dropping connection");
        }
    }
}

fn first_value(entry: &DirectoryEntry, attr: &str) -> String {
    entry
        .attrs
        .get(attr)
        .and_then(|values| values.first())
        .cloned()
        .unwrap_or_default()
}

pub(super) async fn bounded<T>(
    timeout: Duration,
    op: &'static str,
    fut: impl Future<Output = Result<T, DirectoryError>>,
) -> Result<T, DirectoryError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res,
        Err(_) => Err(DirectoryError::Timeout(op)),
    }
}
