use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;
use warden_server::config::{AuthConfig, DirectoryConfig};
use warden_server::store::{crypto, Store, UserRepository};

// ── CLI definition ─────────────────────────────────────────────────────────────

#[derive(Parser)]
#[command(
    name = "wardend",
    about = "Wardend: authentication gateway server daemon",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the Warden HTTP server
    Serve(ServeArgs),
    /// List stored users (offline, read-only). Stop the server first.
    Users {
        /// Data directory (default: $WARDEN_DATA_DIR or the platform data dir)
        #[arg(long, env = "WARDEN_DATA_DIR")]
        data_dir: Option<PathBuf>,
        /// Passphrase the credentials were encrypted with, if any
        #[arg(long, env = "WARDEN_PASSWORD_ENCRYPTION_KEY", hide_env_values = true)]
        password_encryption_key: Option<String>,
    },
}

#[derive(Args)]
struct ServeArgs {
    /// Port to listen on
    #[arg(long, env = "WARDEN_PORT", default_value = "4533")]
    port: u16,
    /// Host to bind
    #[arg(long, env = "WARDEN_HOST", default_value = "0.0.0.0")]
    host: String,
    /// Log level: error, warn, info, debug, verbose (default: warn)
    #[arg(long, env = "WARDEN_LOG_LEVEL")]
    log_level: Option<String>,
    #[arg(long, env = "WARDEN_DATA_DIR")]
    data_dir: Option<PathBuf>,
    /// Comma-separated list of allowed CORS origins (default: any)
    #[arg(long, env = "WARDEN_CORS_ORIGINS")]
    cors_origins: Option<String>,

    /// Session token signing secret (default: generated and stored in the data dir)
    #[arg(long, env = "WARDEN_SESSION_SECRET", hide_env_values = true)]
    session_secret: Option<String>,
    /// Session token lifetime, e.g. "48h" or "30m"
    #[arg(long, env = "WARDEN_SESSION_TIMEOUT", default_value = "48h", value_parser = humantime::parse_duration)]
    session_timeout: Duration,
    /// Authenticate every request as this user. Never use on a networked host.
    #[arg(long, env = "WARDEN_DEV_AUTO_LOGIN_USERNAME")]
    dev_auto_login_username: Option<String>,
    /// Header a trusted reverse proxy uses to pass the username
    #[arg(long, env = "WARDEN_REVERSE_PROXY_USER_HEADER", default_value = "Remote-User")]
    reverse_proxy_user_header: String,
    /// Comma-separated CIDRs allowed to set the reverse proxy header (empty: disabled)
    #[arg(long, env = "WARDEN_REVERSE_PROXY_WHITELIST", default_value = "")]
    reverse_proxy_whitelist: String,
    #[arg(long, env = "WARDEN_ENABLE_GRAVATAR")]
    enable_gravatar: bool,
    /// Passphrase for stored-credential encryption (default: key file in the data dir)
    #[arg(long, env = "WARDEN_PASSWORD_ENCRYPTION_KEY", hide_env_values = true)]
    password_encryption_key: Option<String>,

    #[command(flatten)]
    ldap: LdapArgs,
}

#[derive(Args)]
struct LdapArgs {
    /// Directory URL, e.g. ldaps://ldap.example.org (unset: directory login off)
    #[arg(long = "ldap-url", env = "WARDEN_LDAP_URL")]
    url: Option<String>,
    #[arg(long = "ldap-bind-dn", env = "WARDEN_LDAP_BIND_DN", default_value = "")]
    bind_dn: String,
    #[arg(long = "ldap-bind-password", env = "WARDEN_LDAP_BIND_PASSWORD", default_value = "", hide_env_values = true)]
    bind_password: String,
    #[arg(long = "ldap-base", env = "WARDEN_LDAP_BASE", default_value = "")]
    base: String,
    /// Search filter; %s is replaced with the escaped username
    #[arg(long = "ldap-search-filter", env = "WARDEN_LDAP_SEARCH_FILTER", default_value = "(uid=%s)")]
    search_filter: String,
    #[arg(long = "ldap-mail", env = "WARDEN_LDAP_MAIL", default_value = "mail")]
    mail_attr: String,
    #[arg(long = "ldap-name", env = "WARDEN_LDAP_NAME", default_value = "cn")]
    name_attr: String,
    /// Bound on every directory call
    #[arg(long = "ldap-timeout", env = "WARDEN_LDAP_TIMEOUT", default_value = "10s", value_parser = humantime::parse_duration)]
    timeout: Duration,
}

impl LdapArgs {
    fn into_config(self) -> Option<DirectoryConfig> {
        let url = self.url.filter(|u| !u.is_empty())?;
        Some(DirectoryConfig {
            url,
            bind_dn: self.bind_dn,
            bind_password: self.bind_password,
            base: self.base,
            search_filter: self.search_filter,
            mail_attr: self.mail_attr,
            name_attr: self.name_attr,
            timeout: self.timeout,
        })
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let effective_log_level = if let Commands::Serve(ref args) = cli.command {
        let raw = args
            .log_level
            .clone()
            .unwrap_or_else(|| "warn".into());
        if raw.eq_ignore_ascii_case("verbose") {
            "debug".to_owned()
        } else {
            raw
        }
    } else {
        std::env::var("WARDEN_LOG_LEVEL").unwrap_or_else(|_| "warn".into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&effective_log_level))
        .init();

    match cli.command {
        Commands::Serve(args) => cmd_serve(args).await,
        Commands::Users {
            data_dir,
            password_encryption_key,
        } => cmd_users(data_dir, password_encryption_key),
    }
}

// ── Command implementations ───────────────────────────────────────────────────

async fn cmd_serve(args: ServeArgs) -> Result<()> {
    let auth = AuthConfig {
        session_secret: args.session_secret.filter(|s| !s.is_empty()),
        session_timeout: args.session_timeout,
        dev_auto_login_username: args.dev_auto_login_username.filter(|s| !s.is_empty()),
        reverse_proxy_user_header: args.reverse_proxy_user_header,
        reverse_proxy_whitelist: args.reverse_proxy_whitelist,
        enable_gravatar: args.enable_gravatar,
        password_encryption_key: args.password_encryption_key.filter(|s| !s.is_empty()),
        directory: args.ldap.into_config(),
    };

    let cfg = warden_server::ServerConfig {
        host: args.host,
        port: args.port,
        data_dir: args.data_dir,
        cors_origins: args.cors_origins,
        auth,
    };

    warden_server::run(cfg).await
}

fn cmd_users(data_dir: Option<PathBuf>, passphrase: Option<String>) -> Result<()> {
    let data_dir = warden_server::resolve_data_dir(data_dir.as_ref())?;
    tracing::debug!(data_dir = %data_dir.display(), "listing users");

    // Listing never decrypts credentials, so any key opens the store.
    let key = match passphrase {
        Some(p) => crypto::derive_key(&p),
        None => crypto::generate_key(),
    };
    let store = Store::open(&data_dir.join("warden.db"), key)
        .context("open store (is the server stopped?)")?;

    let users = store.list()?;
    if users.is_empty() {
        println!("no users (POST /auth/createAdmin to bootstrap the first admin)");
        return Ok(());
    }
    for u in users {
        let last_login = u
            .last_login_at
            .map(|t| t.to_string())
            .unwrap_or_else(|| "never".into());
        println!(
            "{:<24} {:<6} {:<32} last_login={}",
            u.username,
            if u.is_admin { "admin" } else { "user" },
            u.email,
            last_login
        );
    }
    Ok(())
}
