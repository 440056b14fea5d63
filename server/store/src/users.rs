//! Username -> password-hash store persisted as `users.json`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::persist;

pub const GENERATED_PASSWORD_LEN: usize = 12;

pub struct CredentialStore {
    inner: Mutex<Inner>,
}

struct Inner {
    path: PathBuf,
    users: BTreeMap<String, String>,
}

impl CredentialStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let users = persist::load_map(&path);
        Self { inner: Mutex::new(Inner { path, users }) }
    }

    /// True when the user exists and the password hashes to the stored value.
    /// Holds the lock for the whole check so concurrent bot mutations are
    /// observed as a consistent snapshot.
    pub fn verify(&self, username: &str, password: &str) -> bool {
        let inner = self.inner.lock();
        inner
            .users
            .get(username)
            .is_some_and(|stored| *stored == hash_password(password))
    }

    pub fn exists(&self, username: &str) -> bool {
        self.inner.lock().users.contains_key(username)
    }

    pub fn create_if_absent(&self, username: &str, password: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.users.contains_key(username) {
            return Err(StoreError::UserExists);
        }
        inner.users.insert(username.to_string(), hash_password(password));
        inner.persist();
        Ok(())
    }

    /// Allocate an account with a generated password; returns the password
    /// so the caller (the bot) can hand it to the user.
    pub fn create_with_random_password(&self, username: &str) -> StoreResult<String> {
        let mut inner = self.inner.lock();
        if inner.users.contains_key(username) {
            return Err(StoreError::UserExists);
        }
        let password = generate_password();
        inner.users.insert(username.to_string(), hash_password(&password));
        inner.persist();
        Ok(password)
    }

    pub fn reset(&self, username: &str) -> StoreResult<String> {
        let mut inner = self.inner.lock();
        if !inner.users.contains_key(username) {
            return Err(StoreError::NoSuchUser);
        }
        let password = generate_password();
        inner.users.insert(username.to_string(), hash_password(&password));
        inner.persist();
        Ok(password)
    }

    pub fn change(&self, username: &str, new_password: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if !inner.users.contains_key(username) {
            return Err(StoreError::NoSuchUser);
        }
        if new_password.is_empty() {
            return Err(StoreError::EmptyPassword);
        }
        inner.users.insert(username.to_string(), hash_password(new_password));
        inner.persist();
        Ok(())
    }
}

impl Inner {
    fn persist(&self) {
        if let Err(e) = persist::write_map(&self.path, &self.users) {
            warn!(path = %self.path.display(), error = %e, "failed to persist user store");
        }
    }
}

fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_PASSWORD_LEN)
        .map(char::from)
        .collect()
}
