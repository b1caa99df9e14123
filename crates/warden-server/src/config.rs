use std::time::Duration;

/// Authentication settings, injected into the token service, the
/// resolution chain and the directory authenticator at construction.
/// The daemon fills this from its flags and `WARDEN_*` variables.
#[derive(Clone)]
pub struct AuthConfig {
    /// Session signing secret. Generated and persisted in the data dir when unset.
    pub session_secret: Option<String>,
    pub session_timeout: Duration,
    /// Username resolved unconditionally for every request. Dev/offline only.
    pub dev_auto_login_username: Option<String>,
    pub reverse_proxy_user_header: String,
    /// Comma-separated CIDR list allowed to set `reverse_proxy_user_header`.
    pub reverse_proxy_whitelist: String,
    pub enable_gravatar: bool,
    /// Passphrase for stored-credential encryption. Key file used when unset.
    pub password_encryption_key: Option<String>,
    pub directory: Option<DirectoryConfig>,
}

/// Connection and lookup settings for the external LDAP-compatible directory.
#[derive(Clone)]
pub struct DirectoryConfig {
    pub url: String,
    pub bind_dn: String,
    pub bind_password: String,
    pub base: String,
    /// Filter template; `%s` is replaced by the escaped username.
    pub search_filter: String,
    pub mail_attr: String,
    pub name_attr: String,
    /// Bound on every directory network call.
    pub timeout: Duration,
}

// Hand-written so the service password never reaches a log line.
impl std::fmt::Debug for DirectoryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryConfig")
            .field("url", &self.url)
            .field("bind_dn", &self.bind_dn)
            .field("base", &self.base)
            .field("search_filter", &self.search_filter)
            .field("mail_attr", &self.mail_attr)
            .field("name_attr", &self.name_attr)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
