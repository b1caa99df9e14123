use serde::{Deserialize, Serialize};
use zeroize::ZeroizeOnDrop;

/// An authenticated principal as handed to the rest of the server.
///
/// `password` holds the plain credential only when loaded through
/// [`UserRepository::find_by_username_with_password`](super::UserRepository::find_by_username_with_password)
/// or when it has just been set; otherwise it is empty.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Identity {
    pub id: String,
    pub username: String,
    pub name: String,
    pub email: String,
    pub is_admin: bool,
    pub password: String,
    pub last_login_at: Option<i64>,
    pub created_at: i64,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("name", &self.name)
            .field("email", &self.email)
            .field("is_admin", &self.is_admin)
            .field("last_login_at", &self.last_login_at)
            .finish_non_exhaustive()
    }
}

/// On-disk form of a user. The credential is stored encrypted.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub struct UserRecord {
    pub id: String,
    pub username: String,
    pub name: String,
    pub email: String,
    pub is_admin: bool,
    pub password_encrypted: Vec<u8>,
    pub nonce: [u8; 12],
    pub created_at: i64,
    pub last_login_at: Option<i64>,
}

/// Outcome of [`UserRepository::create_first_admin`](super::UserRepository::create_first_admin).
#[derive(Debug)]
pub enum BootstrapResult {
    Created(Identity),
    AlreadyInitialized,
}

/// Public listing row; never carries the credential.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMeta {
    pub id: String,
    pub username: String,
    pub name: String,
    pub email: String,
    pub is_admin: bool,
    pub last_login_at: Option<i64>,
}

impl From<&Identity> for UserMeta {
    fn from(u: &Identity) -> Self {
        Self {
            id: u.id.clone(),
            username: u.username.clone(),
            name: u.name.clone(),
            email: u.email.clone(),
            is_admin: u.is_admin,
            last_login_at: u.last_login_at,
        }
    }
}
