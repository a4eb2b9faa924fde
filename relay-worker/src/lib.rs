//! Flowerinbox relay - scans IMAP mailboxes and forwards every message to
//! signed webhooks.
//!
//! A message is only deleted from the mailbox once every webhook of its
//! account accepted it (2xx or 409).
//!
//! ## Architecture
//!
//! ```text
//! cron job / GET /cron/run → MailboxSynchronizer → WebhookDispatcher → deletion gate
//! ```

pub mod accounts;
pub mod config;
pub mod cron;
pub mod mailbox;
pub mod sync;
pub mod util;
pub mod web;
pub mod webhook;

// Re-export commonly used types
pub use accounts::{Account, AccountProvider, AccountStore, AccountsError, AccountsFile};
pub use config::Config;
pub use crate::cron::CronScheduler;
pub use mailbox::imap::ImapClientFactory;
pub use mailbox::{MailboxClientFactory, MailboxError, MailboxSession};
pub use sync::{MailboxSynchronizer, MessageOutcome, RunError, RunOptions};
pub use web::AppState;
pub use webhook::{verify_signature, WebhookDispatcher, WebhookResponse};
