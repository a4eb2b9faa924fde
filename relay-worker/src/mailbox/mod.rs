//! Mailbox client capability.
//!
//! The relay never speaks IMAP directly. It consumes a factory that yields
//! connected sessions, and a session that can lock a mailbox, stream its
//! messages, flag them for deletion and finally expunge and log out.
//!
//! ## Flow
//!
//! ```text
//! MailboxClientFactory::connect → MailboxSession::lock → fetch (lazy) → delete → close
//! ```

pub mod imap;
#[cfg(test)]
pub(crate) mod memory;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::stream::BoxStream;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

use crate::accounts::Account;

/// Mailbox used when a run does not name one.
pub const DEFAULT_MAILBOX: &str = "INBOX";

/// Sequence range covering every message.
pub const DEFAULT_SEQUENCE: &str = "1:*";

static SEQUENCE_SET: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d+|\*)(:(\d+|\*))?(,(\d+|\*)(:(\d+|\*))?)*$").expect("valid sequence regex")
});

/// Whether `seq` is a syntactically valid IMAP sequence set such as `5:*` or `1,3:4`.
pub fn is_valid_sequence_set(seq: &str) -> bool {
    SEQUENCE_SET.is_match(seq)
}

#[derive(Debug, Error)]
pub enum MailboxError {
    #[error("mailbox {0} not found")]
    NotFound(String),

    #[error("account {0} has no mailbox settings")]
    NotConfigured(String),

    #[error("invalid sequence set {0:?}")]
    InvalidSequence(String),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("mailbox protocol error: {0}")]
    Protocol(String),

    #[error("mailbox operation timed out")]
    Timeout,
}

/// Envelope address as reported by the server.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Address {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

/// Envelope metadata of a message.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    pub from: Vec<Address>,
    pub sender: Vec<Address>,
    pub reply_to: Vec<Address>,
    pub to: Vec<Address>,
    pub cc: Vec<Address>,
    pub bcc: Vec<Address>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Everything known about a message except its raw source.
///
/// This is what webhook payloads and run results carry.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAttributes {
    pub seq: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    pub flags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub envelope: Option<Envelope>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub internal_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
}

/// A message as fetched, including bookkeeping the relay does not forward.
#[derive(Debug, Clone, Default)]
pub struct FetchedMessage {
    pub attributes: MessageAttributes,
    pub source: Vec<u8>,
    pub modseq: Option<u64>,
}

impl FetchedMessage {
    /// Split off the raw source, dropping `modseq`.
    pub fn into_parts(self) -> (MessageAttributes, Vec<u8>) {
        (self.attributes, self.source)
    }
}

pub type MessageStream = BoxStream<'static, Result<FetchedMessage, MailboxError>>;

/// Exclusive hold on one mailbox. Released when dropped.
pub struct MailboxLock {
    key: String,
    mailbox: String,
    _guard: OwnedMutexGuard<()>,
}

impl MailboxLock {
    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }
}

impl Drop for MailboxLock {
    fn drop(&mut self) {
        debug!(lock = %self.key, mailbox = %self.mailbox, "mailbox_lock_released");
    }
}

/// Process-wide registry of per-mailbox mutexes.
///
/// Keys are `<account>/<mailbox>`; two sessions of the same account cannot
/// hold the same mailbox at once.
#[derive(Clone, Default)]
pub struct MailboxLocks {
    inner: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>,
}

impl MailboxLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the lock of `mailbox` within `account_id`.
    pub async fn acquire(&self, account_id: &str, mailbox: &str) -> MailboxLock {
        let key = format!("{}/{}", account_id, mailbox);
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(map.entry(key.clone()).or_default())
        };

        let guard = mutex.lock_owned().await;
        debug!(lock = %key, "mailbox_lock_acquired");

        MailboxLock {
            key,
            mailbox: mailbox.to_string(),
            _guard: guard,
        }
    }

    /// Whether someone currently holds the lock.
    pub fn is_locked(&self, account_id: &str, mailbox: &str) -> bool {
        let key = format!("{}/{}", account_id, mailbox);
        let map = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        map.get(&key)
            .map(|m| m.try_lock().is_err())
            .unwrap_or(false)
    }
}

/// Yields connected, authenticated sessions for an account.
#[async_trait]
pub trait MailboxClientFactory: Send + Sync {
    async fn connect(&self, account: &Account) -> Result<Arc<dyn MailboxSession>, MailboxError>;
}

/// One authenticated connection to an account's mail server.
#[async_trait]
pub trait MailboxSession: Send + Sync {
    /// Take exclusive access to `mailbox`. Fails with `NotFound` when it does not exist.
    async fn lock(&self, mailbox: &str) -> Result<MailboxLock, MailboxError>;

    /// Lazily stream non-deleted messages of the locked mailbox matching `seq`,
    /// in ascending sequence order, with source and uid.
    async fn fetch(&self, lock: &MailboxLock, seq: &str) -> Result<MessageStream, MailboxError>;

    /// Flag the message with sequence number `seq` as deleted.
    async fn delete(&self, seq: u32) -> Result<(), MailboxError>;

    /// Expunge flagged messages of the selected mailbox and log out.
    async fn close(&self) -> Result<(), MailboxError>;
}

/// Session wrapper that closes the inner session once the last handle drops.
///
/// Detached deletions hold clones of the same `Arc`, so the expunge only
/// happens after every flag of the run has been stored.
pub struct ClosingSession {
    account_id: String,
    inner: Arc<dyn MailboxSession>,
    closed: AtomicBool,
}

impl ClosingSession {
    pub fn new(account_id: &str, inner: Arc<dyn MailboxSession>) -> Self {
        Self {
            account_id: account_id.to_string(),
            inner,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl MailboxSession for ClosingSession {
    async fn lock(&self, mailbox: &str) -> Result<MailboxLock, MailboxError> {
        self.inner.lock(mailbox).await
    }

    async fn fetch(&self, lock: &MailboxLock, seq: &str) -> Result<MessageStream, MailboxError> {
        self.inner.fetch(lock, seq).await
    }

    async fn delete(&self, seq: u32) -> Result<(), MailboxError> {
        self.inner.delete(seq).await
    }

    async fn close(&self) -> Result<(), MailboxError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.close().await
    }
}

impl Drop for ClosingSession {
    fn drop(&mut self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        let account_id = self.account_id.clone();
        let inner = Arc::clone(&self.inner);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = inner.close().await {
                        warn!(account_id = %account_id, error = %e, "mailbox_close_failed");
                    }
                });
            }
            Err(_) => warn!(account_id = %account_id, "mailbox_close_skipped_no_runtime"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_sequence_set_validation() {
        for valid in ["1:*", "5", "*", "1,3:4,10:*", "2:1"] {
            assert!(is_valid_sequence_set(valid), "{} should be valid", valid);
        }
        for invalid in ["", "1:", "a", "1 UNDELETED", "1;2", "1:*)"] {
            assert!(!is_valid_sequence_set(invalid), "{} should be invalid", invalid);
        }
    }

    #[test]
    fn test_into_parts_drops_bookkeeping() {
        let message = FetchedMessage {
            attributes: MessageAttributes {
                seq: 3,
                uid: Some(42),
                ..Default::default()
            },
            source: b"Subject: hi\n\nbody".to_vec(),
            modseq: Some(99),
        };

        let (attributes, source) = message.into_parts();
        assert_eq!(attributes.uid, Some(42));
        assert_eq!(source, b"Subject: hi\n\nbody");

        let json = serde_json::to_value(&attributes).unwrap();
        assert!(json.get("modseq").is_none());
        assert!(json.get("source").is_none());
    }

    #[tokio::test]
    async fn test_closing_session_closes_once_after_last_handle() {
        let mailbox = memory::MemoryMailbox::new();
        mailbox.add_message("INBOX", 1, b"x");
        let account = crate::accounts::fixtures::account("acct1", "https://e.com");
        let inner = mailbox.connect(&account).await.unwrap();
        let session: Arc<dyn MailboxSession> = Arc::new(ClosingSession::new("acct1", inner));

        let held = Arc::clone(&session);
        drop(session);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mailbox.closes(), 0);

        drop(held);
        tokio::time::timeout(Duration::from_secs(1), async {
            while mailbox.closes() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(mailbox.closes(), 1);
    }

    #[tokio::test]
    async fn test_explicit_close_is_not_repeated_on_drop() {
        let mailbox = memory::MemoryMailbox::new();
        let account = crate::accounts::fixtures::account("acct1", "https://e.com");
        let inner = mailbox.connect(&account).await.unwrap();
        let session = ClosingSession::new("acct1", inner);

        session.close().await.unwrap();
        session.close().await.unwrap();
        drop(session);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(mailbox.closes(), 1);
    }

    #[tokio::test]
    async fn test_lock_is_exclusive_and_released_on_drop() {
        let locks = MailboxLocks::new();
        let held = locks.acquire("acct1", "INBOX").await;
        assert!(locks.is_locked("acct1", "INBOX"));
        assert!(!locks.is_locked("acct1", "Archive"));

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("acct1", "INBOX").await.mailbox().to_string() })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(held);
        let mailbox = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(mailbox, "INBOX");
        assert!(!locks.is_locked("acct1", "INBOX"));
    }
}
