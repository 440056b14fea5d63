//! Telegram id -> username links persisted as `telegram_links.json`.
//! One-to-one and write-once per telegram id.

use std::collections::BTreeMap;
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::{StoreError, StoreResult};
use crate::persist;

pub struct TelegramLinks {
    inner: Mutex<Inner>,
}

struct Inner {
    path: PathBuf,
    links: BTreeMap<i64, String>,
}

impl TelegramLinks {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        // Keys are stored as JSON strings; entries with non-numeric keys are
        // skipped rather than poisoning the whole file.
        let links = persist::load_map(&path)
            .into_iter()
            .filter_map(|(k, v)| k.parse::<i64>().ok().map(|id| (id, v)))
            .collect();
        Self { inner: Mutex::new(Inner { path, links }) }
    }

    pub fn has_account(&self, telegram_id: i64) -> bool {
        self.inner.lock().links.contains_key(&telegram_id)
    }

    pub fn username_for(&self, telegram_id: i64) -> Option<String> {
        self.inner.lock().links.get(&telegram_id).cloned()
    }

    pub fn link(&self, telegram_id: i64, username: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if inner.links.contains_key(&telegram_id) {
            return Err(StoreError::AlreadyLinked);
        }
        inner.links.insert(telegram_id, username.to_string());
        inner.persist();
        Ok(())
    }
}

impl Inner {
    fn persist(&self) {
        let as_strings: BTreeMap<String, String> = self
            .links
            .iter()
            .map(|(id, name)| (id.to_string(), name.clone()))
            .collect();
        if let Err(e) = persist::write_map(&self.path, &as_strings) {
            warn!(path = %self.path.display(), error = %e, "failed to persist telegram links");
        }
    }
}
