//! Mutation surface consumed by the external Telegram bot.
//!
//! The bot is a separate process concern; the server only guarantees that
//! these operations are safe to run concurrently with logins, which the
//! per-store mutexes provide. Nothing here talks to Telegram.

use std::sync::Arc;

use crate::error::{StoreError, StoreResult};
use crate::{CredentialStore, TelegramLinks};

/// Upper bound on one batch of generated test accounts.
pub const TEST_USER_CAP: usize = 50;

#[derive(Clone)]
pub struct BotSurface {
    users: Arc<CredentialStore>,
    links: Arc<TelegramLinks>,
}

impl BotSurface {
    pub fn new(users: Arc<CredentialStore>, links: Arc<TelegramLinks>) -> Self {
        Self { users, links }
    }

    /// Allocate a fresh account with a generated password and bind it to a
    /// telegram id. One account per id, ever.
    pub fn register(&self, telegram_id: i64, username: &str) -> StoreResult<String> {
        if username.is_empty() {
            return Err(StoreError::EmptyUsername);
        }
        if self.links.has_account(telegram_id) {
            return Err(StoreError::AlreadyLinked);
        }
        let password = self.users.create_with_random_password(username)?;
        self.links.link(telegram_id, username)?;
        Ok(password)
    }

    /// Generate a new password for the account bound to this telegram id.
    pub fn reset(&self, telegram_id: i64) -> StoreResult<String> {
        let username = self.links.username_for(telegram_id).ok_or(StoreError::NoSuchUser)?;
        self.users.reset(&username)
    }

    pub fn change_password(&self, telegram_id: i64, new_password: &str) -> StoreResult<()> {
        let username = self.links.username_for(telegram_id).ok_or(StoreError::NoSuchUser)?;
        self.users.change(&username, new_password)
    }

    /// Batch-create `testuser<N>` accounts, skipping names already taken.
    /// Returns the `(username, password)` pairs actually created.
    pub fn create_test_users(&self, count: usize) -> Vec<(String, String)> {
        let count = count.clamp(1, TEST_USER_CAP);
        let mut created = Vec::new();
        let mut suffix = 1;
        while created.len() < count && suffix < count + 1000 {
            let username = format!("testuser{suffix}");
            suffix += 1;
            if self.users.exists(&username) {
                continue;
            }
            if let Ok(password) = self.users.create_with_random_password(&username) {
                created.push((username, password));
            }
        }
        created
    }
}
