//! Credential checks against an external LDAP-compatible directory.
//!
//! The wire protocol sits behind [`DirectoryConnector`] /
//! [`DirectoryConnection`]; [`ldap::LdapConnector`] is the production
//! implementation. Every failure here degrades to "no directory match" so a
//! directory outage never locks out locally provisioned accounts.

pub mod ldap;
mod session;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{error, info};

use crate::config::DirectoryConfig;
use crate::store::{Identity, UserRepository};

use session::DirectorySession;

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("directory connect failed: {0}")]
    Connect(String),
    #[error("directory bind failed: {0}")]
    Bind(String),
    #[error("directory search failed: {0}")]
    Search(String),
    #[error("directory {0} timed out")]
    Timeout(&'static str),
}

/// A raw search result entry.
#[derive(Debug, Clone, Default)]
pub struct DirectoryEntry {
    pub dn: String,
    pub attrs: HashMap<String, Vec<String>>,
}

/// The single entry a username resolved to. Only `name` and `mail` outlive
/// the attempt, through mirroring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryMatch {
    pub dn: String,
    pub mail: String,
    pub name: String,
}

#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    async fn connect(
        &self,
        url: &str,
        timeout: Duration,
    ) -> Result<Box<dyn DirectoryConnection>, DirectoryError>;
}

#[async_trait]
pub trait DirectoryConnection: Send {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<(), DirectoryError>;

    /// Whole-subtree search under `base`.
    async fn search(
        &mut self,
        base: &str,
        filter: &str,
        attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>, DirectoryError>;

    async fn close(&mut self);
}

/// Validates credentials against the directory and mirrors successful
/// matches into the local repository.
#[derive(Clone)]
pub struct DirectoryAuthenticator {
    cfg: Arc<DirectoryConfig>,
    connector: Arc<dyn DirectoryConnector>,
    users: Arc<dyn UserRepository>,
}

impl DirectoryAuthenticator {
    pub fn new(
        cfg: DirectoryConfig,
        connector: Arc<dyn DirectoryConnector>,
        users: Arc<dyn UserRepository>,
    ) -> Self {
        Self {
            cfg: Arc::new(cfg),
            connector,
            users,
        }
    }

    /// Returns the mirrored identity (credential included) when the
    /// directory accepts `username`/`password`, `None` otherwise.
    pub async fn authenticate(&self, username: &str, password: &str) -> Option<Identity> {
        let connect = self.connector.connect(&self.cfg.url, self.cfg.timeout);
        let conn = match session::bounded(self.cfg.timeout, "connect", connect).await {
            Ok(conn) => conn,
            Err(e) => {
                error!(url = %self.cfg.url, error = %e, "directory unavailable");
                return None;
            }
        };

        let found =
            match DirectorySession::verify_credentials(conn, &self.cfg, username, password).await {
                Ok(Some(found)) => found,
                Ok(None) => return None,
                Err(e) => {
                    error!(username, error = %e, "directory login attempt failed");
                    return None;
                }
            };

        self.mirror(username, password, found)
    }

    /// Create or update the local record for a directory match. Never
    /// touches `id` or `is_admin` of an existing record.
    fn mirror(&self, username: &str, password: &str, found: DirectoryMatch) -> Option<Identity> {
        let mut user = match self.users.find_by_username(username) {
            Ok(Some(existing)) => existing,
            Ok(None) => {
                info!(username, dn = %found.dn, "creating local user from directory entry");
                Identity {
                    username: username.to_owned(),
                    ..Default::default()
                }
            }
            Err(e) => {
                error!(username, error = %e, "could not load user for directory mirroring");
                return None;
            }
        };

        user.name = found.name;
        user.email = found.mail;
        user.password = password.to_owned();

        match self.users.put(&user) {
            Ok(stored) => {
                user.id = stored.id;
                user.created_at = stored.created_at;
            }
            Err(e) => error!(username, error = %e, "could not store directory user"),
        }

        if let Err(e) = self.users.update_last_login_at(username) {
            error!(username, error = %e, "could not update last login");
        }

        Some(user)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::store::{crypto::generate_key, Store};

    /// Scripted in-memory directory. Records every call for inspection.
    #[derive(Clone, Default)]
    pub(crate) struct FakeDirectory {
        pub entries: Vec<DirectoryEntry>,
        /// dn -> password accepted for a user bind.
        pub passwords: HashMap<String, String>,
        pub service_password: String,
        pub fail_connect: bool,
        pub fail_search: bool,
        pub hang_search: bool,
        pub hang_close: bool,
        pub calls: Arc<Mutex<Vec<String>>>,
    }

    impl FakeDirectory {
        pub fn with_user(dn: &str, uid: &str, password: &str, mail: &str, name: &str) -> Self {
            let mut attrs = HashMap::new();
            attrs.insert("uid".to_owned(), vec![uid.to_owned()]);
            attrs.insert("mail".to_owned(), vec![mail.to_owned()]);
            attrs.insert("cn".to_owned(), vec![name.to_owned()]);
            Self {
                entries: vec![DirectoryEntry {
                    dn: dn.to_owned(),
                    attrs,
                }],
                passwords: HashMap::from([(dn.to_owned(), password.to_owned())]),
                service_password: "svc-pw".to_owned(),
                ..Default::default()
            }
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    struct FakeConnection(FakeDirectory);

    #[async_trait]
    impl DirectoryConnector for FakeDirectory {
        async fn connect(
            &self,
            _url: &str,
            _timeout: Duration,
        ) -> Result<Box<dyn DirectoryConnection>, DirectoryError> {
            self.calls.lock().unwrap().push("connect".into());
            if self.fail_connect {
                return Err(DirectoryError::Connect("connection refused".into()));
            }
            Ok(Box::new(FakeConnection(self.clone())))
        }
    }

    #[async_trait]
    impl DirectoryConnection for FakeConnection {
        async fn bind(&mut self, dn: &str, password: &str) -> Result<(), DirectoryError> {
            self.0.calls.lock().unwrap().push(format!("bind {dn}"));
            let ok = if dn == "cn=svc" {
                password == self.0.service_password
            } else {
                self.0.passwords.get(dn).is_some_and(|p| p == password)
            };
            if ok {
                Ok(())
            } else {
                Err(DirectoryError::Bind("invalid credentials".into()))
            }
        }

        async fn search(
            &mut self,
            _base: &str,
            filter: &str,
            _attrs: &[&str],
        ) -> Result<Vec<DirectoryEntry>, DirectoryError> {
            self.0.calls.lock().unwrap().push(format!("search {filter}"));
            if self.0.hang_search {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.0.fail_search {
                return Err(DirectoryError::Search("server busy".into()));
            }
            let wanted = filter.trim_start_matches("(uid=").trim_end_matches(')');
            Ok(self
                .0
                .entries
                .iter()
                .filter(|e| e.attrs.get("uid").is_some_and(|v| v.iter().any(|u| u == wanted)))
                .cloned()
                .collect())
        }

        async fn close(&mut self) {
            self.0.calls.lock().unwrap().push("close".into());
            if self.0.hang_close {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
        }
    }

    pub(crate) fn directory_config() -> DirectoryConfig {
        DirectoryConfig {
            url: "ldap://directory.test".into(),
            bind_dn: "cn=svc".into(),
            bind_password: "svc-pw".into(),
            base: "dc=example,dc=org".into(),
            search_filter: "(uid=%s)".into(),
            mail_attr: "mail".into(),
            name_attr: "cn".into(),
            timeout: Duration::from_millis(200),
        }
    }

    fn open_store() -> (tempfile::TempDir, Arc<Store>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("warden.db"), generate_key()).unwrap();
        (dir, Arc::new(store))
    }

    fn authenticator(fake: &FakeDirectory, store: Arc<Store>) -> DirectoryAuthenticator {
        DirectoryAuthenticator::new(directory_config(), Arc::new(fake.clone()), store)
    }

    fn alice_directory() -> FakeDirectory {
        FakeDirectory::with_user(
            "uid=alice,dc=example,dc=org",
            "alice",
            "ldap-pw",
            "alice@example.org",
            "Alice Liddell",
        )
    }

    #[tokio::test]
    async fn successful_bind_mirrors_new_user() {
        let (_dir, store) = open_store();
        let fake = alice_directory();
        let user = authenticator(&fake, store.clone())
            .authenticate("alice", "ldap-pw")
            .await
            .expect("directory should accept");

        assert_eq!(user.name, "Alice Liddell");
        assert_eq!(user.email, "alice@example.org");
        assert!(!user.is_admin);
        assert!(!user.id.is_empty());

        let stored = store.find_by_username_with_password("alice").unwrap().unwrap();
        assert_eq!(stored.id, user.id);
        assert_eq!(stored.password, "ldap-pw");
        assert!(stored.last_login_at.is_some());
    }

    #[tokio::test]
    async fn mirroring_keeps_id_and_admin_flag() {
        let (_dir, store) = open_store();
        let existing = store
            .put(&Identity {
                username: "alice".into(),
                name: "old".into(),
                password: "old-pw".into(),
                is_admin: true,
                ..Default::default()
            })
            .unwrap();

        let user = authenticator(&alice_directory(), store.clone())
            .authenticate("alice", "ldap-pw")
            .await
            .unwrap();

        assert_eq!(user.id, existing.id);
        assert!(user.is_admin);
        let stored = store.find_by_username_with_password("alice").unwrap().unwrap();
        assert!(stored.is_admin);
        assert_eq!(stored.name, "Alice Liddell");
        assert_eq!(stored.password, "ldap-pw");
    }

    #[tokio::test]
    async fn wrong_password_is_no_match_and_rebinds_service() {
        let (_dir, store) = open_store();
        let fake = alice_directory();
        let user = authenticator(&fake, store.clone())
            .authenticate("alice", "nope")
            .await;
        assert!(user.is_none());
        assert!(store.find_by_username("alice").unwrap().is_none());

        assert_eq!(
            fake.calls(),
            vec![
                "connect",
                "bind cn=svc",
                "search (uid=alice)",
                "bind uid=alice,dc=example,dc=org",
                "bind cn=svc",
                "close",
            ]
        );
    }

    #[tokio::test]
    async fn success_also_restores_service_bind() {
        let (_dir, store) = open_store();
        let fake = alice_directory();
        authenticator(&fake, store).authenticate("alice", "ldap-pw").await.unwrap();
        let calls = fake.calls();
        assert_eq!(calls[calls.len() - 2], "bind cn=svc");
        assert_eq!(calls[calls.len() - 1], "close");
    }

    #[tokio::test]
    async fn unknown_user_is_no_match() {
        let (_dir, store) = open_store();
        let fake = alice_directory();
        assert!(authenticator(&fake, store).authenticate("bob", "x").await.is_none());
        assert!(fake.calls().iter().all(|c| !c.starts_with("bind uid=")));
    }

    #[tokio::test]
    async fn ambiguous_search_is_no_match() {
        let (_dir, store) = open_store();
        let mut fake = alice_directory();
        let mut twin = fake.entries[0].clone();
        twin.dn = "uid=alice,ou=other,dc=example,dc=org".into();
        fake.entries.push(twin);
        assert!(authenticator(&fake, store).authenticate("alice", "ldap-pw").await.is_none());
    }

    #[tokio::test]
    async fn connect_failure_is_no_match() {
        let (_dir, store) = open_store();
        let mut fake = alice_directory();
        fake.fail_connect = true;
        assert!(authenticator(&fake, store).authenticate("alice", "ldap-pw").await.is_none());
    }

    #[tokio::test]
    async fn service_bind_failure_is_no_match_and_still_closes() {
        let (_dir, store) = open_store();
        let mut fake = alice_directory();
        fake.service_password = "rotated".into();
        assert!(authenticator(&fake, store).authenticate("alice", "ldap-pw").await.is_none());
        assert_eq!(fake.calls().last().map(String::as_str), Some("close"));
        assert!(!fake.calls().iter().any(|c| c.starts_with("search")));
    }

    #[tokio::test]
    async fn search_failure_is_no_match() {
        let (_dir, store) = open_store();
        let mut fake = alice_directory();
        fake.fail_search = true;
        assert!(authenticator(&fake, store).authenticate("alice", "ldap-pw").await.is_none());
        assert_eq!(fake.calls().last().map(String::as_str), Some("close"));
    }

    #[tokio::test]
    async fn slow_directory_times_out() {
        let (_dir, store) = open_store();
        let mut fake = alice_directory();
        fake.hang_search = true;
        let started = std::time::Instant::now();
        assert!(authenticator(&fake, store).authenticate("alice", "ldap-pw").await.is_none());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn stuck_unbind_does_not_hold_up_login() {
        let (_dir, store) = open_store();
        let mut fake = alice_directory();
        fake.hang_close = true;
        let started = std::time::Instant::now();
        let user = authenticator(&fake, store).authenticate("alice", "ldap-pw").await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(user.map(|u| u.username), Some("alice".to_owned()));
        assert_eq!(fake.calls().last().map(String::as_str), Some("close"));
    }

    #[tokio::test]
    async fn empty_password_never_binds_as_user() {
        let (_dir, store) = open_store();
        let mut fake = alice_directory();
        fake.passwords
            .insert("uid=alice,dc=example,dc=org".into(), String::new());
        assert!(authenticator(&fake, store).authenticate("alice", "").await.is_none());
        assert!(!fake.calls().iter().any(|c| c == "bind uid=alice,dc=example,dc=org"));
    }

    #[tokio::test]
    async fn username_is_escaped_in_filter() {
        let (_dir, store) = open_store();
        let fake = alice_directory();
        assert!(authenticator(&fake, store).authenticate("*)(uid=*", "x").await.is_none());
        let search = fake
            .calls()
            .into_iter()
            .find(|c| c.starts_with("search"))
            .unwrap();
        assert_eq!(search, r"search (uid=\2a\29\28uid=\2a)");
    }
}
