use md5::{Digest, Md5};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::store::Identity;

const GRAVATAR_SIZE: u32 = 50;

/// Identity handed to clients after login.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    pub id: String,
    pub name: String,
    pub username: String,
    pub is_admin: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub avatar: Option<String>,
    /// Per-login random salt for legacy salted-token clients.
    pub salt: String,
    /// `md5(credential + salt)`, hex encoded.
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub token: Option<String>,
}

/// Build the client payload for `user`. `user.password` must hold the
/// stored credential for the legacy digest to be usable.
pub fn build_auth_payload(user: &Identity, enable_gravatar: bool) -> AuthPayload {
    let avatar = (enable_gravatar && !user.email.is_empty()).then(|| gravatar_url(&user.email));
    let salt = generate_salt();
    let digest = legacy_digest(&user.password, &salt);

    AuthPayload {
        id: user.id.clone(),
        name: user.name.clone(),
        username: user.username.clone(),
        is_admin: user.is_admin,
        avatar,
        salt,
        digest,
        token: None,
    }
}

/// Six hex chars from three random bytes.
pub fn generate_salt() -> String {
    let bytes: [u8; 3] = rand::thread_rng().gen();
    hex::encode(bytes)
}

pub fn legacy_digest(credential: &str, salt: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(credential.as_bytes());
    hasher.update(salt.as_bytes());
    hex::encode(hasher.finalize())
}

pub fn gravatar_url(email: &str) -> String {
    let hash = Md5::digest(email.trim().to_lowercase().as_bytes());
    format!(
        "https://www.gravatar.com/avatar/{}?s={GRAVATAR_SIZE}",
        hex::encode(hash)
    )
}
