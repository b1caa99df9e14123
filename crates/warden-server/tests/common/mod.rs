#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::connect_info::MockConnectInfo;
use axum::Router;
use tempfile::TempDir;
use warden_server::clock::ManualClock;
use warden_server::config::{AuthConfig, DirectoryConfig};
use warden_server::directory::{
    DirectoryConnection, DirectoryConnector, DirectoryEntry, DirectoryError,
};
use warden_server::clock::SystemClock;
use warden_server::store::{crypto, BootstrapResult, Identity, Store, UserMeta, UserRepository};
use warden_server::{build_router, AppState};

pub const SECRET: &[u8] = b"integration-test-secret";
pub const START: i64 = 1_700_000_000;

/// A running app backed by a throwaway store.
pub struct TestApp {
    pub state: AppState,
    pub store: Arc<Store>,
    pub clock: ManualClock,
    _dir: TempDir,
}

impl TestApp {
    pub fn new(cfg: AuthConfig) -> Self {
        Self::with_connector(cfg, Arc::new(NoDirectory))
    }

    pub fn with_connector(cfg: AuthConfig, connector: Arc<dyn DirectoryConnector>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(&dir.path().join("warden.db"), crypto::generate_key()).unwrap());
        let clock = ManualClock::new(START);
        let state = AppState::new(
            &cfg,
            store.clone(),
            SECRET,
            Arc::new(clock.clone()),
            connector,
        );
        Self {
            state,
            store,
            clock,
            _dir: dir,
        }
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Router whose requests appear to come from `peer`.
    pub fn router_from(&self, peer: &str) -> Router {
        let addr: SocketAddr = peer.parse().unwrap();
        build_router(self.state.clone()).layer(MockConnectInfo(addr))
    }

    pub fn add_user(&self, username: &str, password: &str, is_admin: bool) -> Identity {
        self.store
            .put(&Identity {
                username: username.to_owned(),
                name: username.to_owned(),
                email: format!("{username}@example.org"),
                password: password.to_owned(),
                is_admin,
                ..Default::default()
            })
            .unwrap()
    }

    pub fn token_for(&self, username: &str) -> String {
        let user = self.store.find_by_username(username).unwrap().unwrap();
        self.state.tokens.issue(&user).unwrap()
    }
}

/// Repository that fails every call, as a broken disk would.
pub struct UnreadableStore;

impl UserRepository for UnreadableStore {
    fn count_all(&self) -> anyhow::Result<usize> {
        anyhow::bail!("redb: io error at /var/lib/warden/warden.db")
    }
    fn find_by_username(&self, _username: &str) -> anyhow::Result<Option<Identity>> {
        anyhow::bail!("redb: io error at /var/lib/warden/warden.db")
    }
    fn find_by_username_with_password(&self, _username: &str) -> anyhow::Result<Option<Identity>> {
        anyhow::bail!("redb: io error at /var/lib/warden/warden.db")
    }
    fn put(&self, _user: &Identity) -> anyhow::Result<Identity> {
        anyhow::bail!("redb: io error at /var/lib/warden/warden.db")
    }
    fn update_last_login_at(&self, _username: &str) -> anyhow::Result<()> {
        anyhow::bail!("redb: io error at /var/lib/warden/warden.db")
    }
    fn create_first_admin(&self, _user: &Identity) -> anyhow::Result<BootstrapResult> {
        anyhow::bail!("redb: io error at /var/lib/warden/warden.db")
    }
    fn list(&self) -> anyhow::Result<Vec<UserMeta>> {
        anyhow::bail!("redb: io error at /var/lib/warden/warden.db")
    }
}

/// Router over a repository that cannot be read.
pub fn unreadable_router(cfg: AuthConfig) -> Router {
    let state = AppState::new(
        &cfg,
        Arc::new(UnreadableStore),
        SECRET,
        Arc::new(SystemClock),
        Arc::new(NoDirectory),
    );
    build_router(state)
}

pub fn auth_config() -> AuthConfig {
    AuthConfig {
        session_secret: None,
        session_timeout: Duration::from_secs(48 * 60 * 60),
        dev_auto_login_username: None,
        reverse_proxy_user_header: "Remote-User".into(),
        reverse_proxy_whitelist: String::new(),
        enable_gravatar: false,
        password_encryption_key: None,
        directory: None,
    }
}

pub fn directory_config() -> DirectoryConfig {
    DirectoryConfig {
        url: "ldap://directory.test".into(),
        bind_dn: "cn=svc".into(),
        bind_password: "svc-pw".into(),
        base: "dc=example,dc=org".into(),
        search_filter: "(uid=%s)".into(),
        mail_attr: "mail".into(),
        name_attr: "cn".into(),
        timeout: Duration::from_millis(500),
    }
}

/// Connector for apps that never reach a directory.
pub struct NoDirectory;

#[async_trait]
impl DirectoryConnector for NoDirectory {
    async fn connect(
        &self,
        _url: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn DirectoryConnection>, DirectoryError> {
        Err(DirectoryError::Connect("no directory configured".into()))
    }
}

/// In-memory directory holding one account besides the service identity.
#[derive(Clone)]
pub struct OneUserDirectory {
    pub dn: String,
    pub uid: String,
    pub password: String,
    pub mail: String,
    pub name: String,
}

#[async_trait]
impl DirectoryConnector for OneUserDirectory {
    async fn connect(
        &self,
        _url: &str,
        _timeout: Duration,
    ) -> Result<Box<dyn DirectoryConnection>, DirectoryError> {
        Ok(Box::new(self.clone()))
    }
}

#[async_trait]
impl DirectoryConnection for OneUserDirectory {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<(), DirectoryError> {
        let ok = (dn == "cn=svc" && password == "svc-pw") || (dn == self.dn && password == self.password);
        if ok {
            Ok(())
        } else {
            Err(DirectoryError::Bind(format!("invalid credentials for {dn}")))
        }
    }

    async fn search(
        &mut self,
        _base: &str,
        filter: &str,
        _attrs: &[&str],
    ) -> Result<Vec<DirectoryEntry>, DirectoryError> {
        if filter != format!("(uid={})", self.uid) {
            return Ok(Vec::new());
        }
        let attrs = HashMap::from([
            ("mail".to_owned(), vec![self.mail.clone()]),
            ("cn".to_owned(), vec![self.name.clone()]),
        ]);
        Ok(vec![DirectoryEntry {
            dn: self.dn.clone(),
            attrs,
        }])
    }

    async fn close(&mut self) {}
}
