pub mod crypto;
pub mod db;
pub mod model;

use anyhow::Result;

pub use db::Store;
pub use model::{BootstrapResult, Identity, UserMeta, UserRecord};

/// Persistence contract the auth core relies on.
///
/// Lookups return `Ok(None)` for a missing user; `Err` is reserved for
/// storage failures. Username uniqueness is enforced here, not by callers.
pub trait UserRepository: Send + Sync {
    fn count_all(&self) -> Result<usize>;

    /// Load a user with the credential cleared.
    fn find_by_username(&self, username: &str) -> Result<Option<Identity>>;

    /// Load a user including the decrypted credential.
    fn find_by_username_with_password(&self, username: &str) -> Result<Option<Identity>>;

    /// Insert or update by username. An empty `id` gets a fresh one assigned;
    /// an empty `password` keeps the stored credential. An existing record
    /// keeps its `id`, `created_at` and `is_admin` whatever `user` carries.
    /// Returns the stored identity (credential cleared).
    fn put(&self, user: &Identity) -> Result<Identity>;

    fn update_last_login_at(&self, username: &str) -> Result<()>;

    /// Insert `user` as an administrator only if no user exists yet.
    /// The emptiness check and the write happen atomically.
    fn create_first_admin(&self, user: &Identity) -> Result<BootstrapResult>;

    fn list(&self) -> Result<Vec<UserMeta>>;
}
