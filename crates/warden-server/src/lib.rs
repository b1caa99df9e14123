pub mod auth;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod directory;
pub mod dirs;
pub mod error;
pub mod handlers;
pub mod payload;
pub mod resolve;
pub mod server;
pub mod store;
pub mod token;
pub mod trust;

use std::sync::Arc;

use clock::Clock;
use config::AuthConfig;
use credentials::CredentialValidator;
use directory::{DirectoryAuthenticator, DirectoryConnector};
use resolve::{ProxyHeader, ResolverChain};
use store::UserRepository;
use token::TokenService;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub users: Arc<dyn UserRepository>,
    pub tokens: TokenService,
    pub credentials: CredentialValidator,
    /// Chain used to authenticate API requests.
    pub resolver: ResolverChain,
    /// Chain used by the header auto-login endpoint.
    pub header_login: ResolverChain,
    pub enable_gravatar: bool,
}

impl AppState {
    /// Wire the auth components from configuration. The directory connector
    /// is only used when `cfg.directory` is set.
    pub fn new(
        cfg: &AuthConfig,
        users: Arc<dyn UserRepository>,
        session_secret: &[u8],
        clock: Arc<dyn Clock>,
        connector: Arc<dyn DirectoryConnector>,
    ) -> Self {
        let tokens = TokenService::new(session_secret, cfg.session_timeout, clock);

        let directory = cfg
            .directory
            .clone()
            .map(|dir| DirectoryAuthenticator::new(dir, connector, users.clone()));
        let credentials = CredentialValidator::new(directory, users.clone());

        let proxy = ProxyHeader::new(&cfg.reverse_proxy_user_header, &cfg.reverse_proxy_whitelist);
        let configured = cfg.dev_auto_login_username.clone();

        Self {
            users,
            tokens,
            credentials,
            resolver: ResolverChain::standard(configured.clone(), proxy.clone()),
            header_login: ResolverChain::header_login(configured, proxy),
            enable_gravatar: cfg.enable_gravatar,
        }
    }
}

pub use server::{build_router, resolve_data_dir, run, ServerConfig};
