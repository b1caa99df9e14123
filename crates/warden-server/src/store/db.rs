use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::debug;

use super::crypto::{self, EncryptionKey};
use super::model::{BootstrapResult, Identity, UserMeta, UserRecord};
use super::UserRepository;
use crate::clock::unix_now;

/// Users keyed by lower-cased username.
pub(crate) const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");

/// redb-backed user repository. Credentials are encrypted at rest.
#[derive(Clone)]
pub struct Store {
    pub(crate) db: Arc<Database>,
    key: Arc<EncryptionKey>,
}

impl Store {
    pub fn open(path: &Path, key: EncryptionKey) -> Result<Self> {
        let db = Database::create(path).context("open redb database")?;

        // Make sure the table exists so read transactions never fail on a fresh db.
        let write_txn = db.begin_write()?;
        {
            write_txn.open_table(USERS)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(db),
            key: Arc::new(key),
        })
    }

    fn load(&self, username: &str) -> Result<Option<UserRecord>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;
        let record = match table.get(user_key(username).as_str())? {
            Some(guard) => Some(decode(guard.value())?),
            None => None,
        };
        Ok(record)
    }

    fn seal(&self, user: &Identity, id: String, created_at: i64) -> Result<UserRecord> {
        let (password_encrypted, nonce) = crypto::encrypt(&self.key, user.password.as_bytes())?;
        Ok(UserRecord {
            id,
            username: user.username.clone(),
            name: user.name.clone(),
            email: user.email.clone(),
            is_admin: user.is_admin,
            password_encrypted,
            nonce,
            created_at,
            last_login_at: user.last_login_at,
        })
    }

    fn unseal(&self, record: &UserRecord) -> Result<Identity> {
        let plain = crypto::decrypt(&self.key, &record.password_encrypted, &record.nonce)?;
        let password = String::from_utf8(plain).context("stored credential is not utf-8")?;
        Ok(Identity {
            password,
            ..to_identity(record)
        })
    }
}

impl UserRepository for Store {
    fn count_all(&self) -> Result<usize> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;
        Ok(table.len()? as usize)
    }

    fn find_by_username(&self, username: &str) -> Result<Option<Identity>> {
        Ok(self.load(username)?.as_ref().map(to_identity))
    }

    fn find_by_username_with_password(&self, username: &str) -> Result<Option<Identity>> {
        match self.load(username)? {
            Some(record) => Ok(Some(self.unseal(&record)?)),
            None => Ok(None),
        }
    }

    fn put(&self, user: &Identity) -> Result<Identity> {
        let key = user_key(&user.username);
        let write_txn = self.db.begin_write()?;
        let stored = {
            let mut table = write_txn.open_table(USERS)?;
            let existing: Option<UserRecord> = match table.get(key.as_str())? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };

            let record = match existing {
                Some(prev) => {
                    let mut next = self.seal(user, prev.id.clone(), prev.created_at)?;
                    next.is_admin = prev.is_admin;
                    if user.password.is_empty() {
                        next.password_encrypted = prev.password_encrypted.clone();
                        next.nonce = prev.nonce;
                    }
                    next
                }
                None => {
                    let id = if user.id.is_empty() {
                        generate_user_id()
                    } else {
                        user.id.clone()
                    };
                    let created_at = if user.created_at == 0 {
                        unix_now()
                    } else {
                        user.created_at
                    };
                    self.seal(user, id, created_at)?
                }
            };

            table.insert(key.as_str(), encode(&record)?.as_slice())?;
            to_identity(&record)
        };
        write_txn.commit()?;
        debug!(username = %stored.username, "user stored");
        Ok(stored)
    }

    fn update_last_login_at(&self, username: &str) -> Result<()> {
        let key = user_key(username);
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(USERS)?;
            let record: Option<UserRecord> = match table.get(key.as_str())? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            let Some(mut record) = record else {
                anyhow::bail!("user {username} not found");
            };
            record.last_login_at = Some(unix_now());
            table.insert(key.as_str(), encode(&record)?.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn create_first_admin(&self, user: &Identity) -> Result<BootstrapResult> {
        // redb serialises write transactions, so the emptiness check and the
        // insert cannot interleave with another bootstrap.
        let write_txn = self.db.begin_write()?;
        let created = {
            let mut table = write_txn.open_table(USERS)?;
            if table.len()? > 0 {
                None
            } else {
                let admin = Identity {
                    is_admin: true,
                    ..user.clone()
                };
                let id = if admin.id.is_empty() {
                    generate_user_id()
                } else {
                    admin.id.clone()
                };
                let record = self.seal(&admin, id, unix_now())?;
                table.insert(user_key(&admin.username).as_str(), encode(&record)?.as_slice())?;
                Some(to_identity(&record))
            }
        };

        match created {
            Some(identity) => {
                write_txn.commit()?;
                Ok(BootstrapResult::Created(identity))
            }
            None => {
                write_txn.abort()?;
                Ok(BootstrapResult::AlreadyInitialized)
            }
        }
    }

    fn list(&self) -> Result<Vec<UserMeta>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(USERS)?;

        let mut users = Vec::new();
        for item in table.iter()? {
            let (_k, v) = item?;
            let record = decode(v.value())?;
            users.push(UserMeta::from(&to_identity(&record)));
        }
        Ok(users)
    }
}

fn user_key(username: &str) -> String {
    username.to_lowercase()
}

fn to_identity(record: &UserRecord) -> Identity {
    Identity {
        id: record.id.clone(),
        username: record.username.clone(),
        name: record.name.clone(),
        email: record.email.clone(),
        is_admin: record.is_admin,
        password: String::new(),
        last_login_at: record.last_login_at,
        created_at: record.created_at,
    }
}

fn encode(record: &UserRecord) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(record, bincode::config::standard())
        .context("bincode encode user")
}

fn decode(bytes: &[u8]) -> Result<UserRecord> {
    let (record, _): (UserRecord, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .context("bincode decode user")?;
    Ok(record)
}

/// 16 random bytes, hex encoded.
pub fn generate_user_id() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}
