use std::sync::Arc;

use anyhow::Result;
use constant_time_eq::constant_time_eq;
use tracing::{debug, error};

use crate::directory::DirectoryAuthenticator;
use crate::store::{Identity, UserRepository};

/// Checks a username/password pair: directory first, then the local store.
///
/// The local comparison is against the stored credential itself, not a
/// one-way hash; the repository keeps it encrypted at rest.
#[derive(Clone)]
pub struct CredentialValidator {
    directory: Option<DirectoryAuthenticator>,
    users: Arc<dyn UserRepository>,
}

impl CredentialValidator {
    pub fn new(directory: Option<DirectoryAuthenticator>, users: Arc<dyn UserRepository>) -> Self {
        Self { directory, users }
    }

    /// `Ok(None)` covers both an unknown user and a wrong password.
    /// The returned identity carries its credential.
    pub async fn validate(&self, username: &str, password: &str) -> Result<Option<Identity>> {
        if let Some(directory) = &self.directory {
            if let Some(user) = directory.authenticate(username, password).await {
                debug!(username, "credentials accepted by directory");
                return Ok(Some(user));
            }
        }

        let Some(user) = self.users.find_by_username_with_password(username)? else {
            return Ok(None);
        };
        if !constant_time_eq(user.password.as_bytes(), password.as_bytes()) {
            return Ok(None);
        }

        if let Err(e) = self.users.update_last_login_at(&user.username) {
            error!(username, error = %e, "could not update last login");
        }
        Ok(Some(user))
    }
}
