//! Persistent state shared by the hub server and the external bot.
//!
//! Every store keeps an in-memory mirror guarded by one mutex and rewrites
//! its backing file atomically on mutation. A failed write is logged and the
//! mirror stays authoritative; the next successful write resynchronizes.

pub mod bot;
mod error;
mod history;
mod links;
mod persist;
mod users;

pub use error::{StoreError, StoreResult};
pub use history::ChatHistory;
pub use links::TelegramLinks;
pub use users::CredentialStore;
