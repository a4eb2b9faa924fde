//! In-memory mailbox used by the tests of the synchronizer, scheduler and web layer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{
    FetchedMessage, MailboxClientFactory, MailboxError, MailboxLock, MailboxLocks,
    MailboxSession, MessageAttributes, MessageStream,
};
use crate::accounts::Account;

struct Inner {
    mailboxes: Mutex<HashMap<String, Vec<FetchedMessage>>>,
    deleted: Mutex<Vec<u32>>,
    flagged: Mutex<Vec<u32>>,
    expunged: Mutex<Vec<u32>>,
    closes: AtomicUsize,
    delete_events: Mutex<Option<mpsc::UnboundedSender<u32>>>,
    fail_deletes: bool,
    connects: AtomicUsize,
    locks: MailboxLocks,
}

/// Shared fake server: every `connect` returns a session over the same state.
#[derive(Clone)]
pub struct MemoryMailbox {
    inner: Arc<Inner>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::build(false)
    }

    /// A mailbox whose delete calls always fail.
    pub fn failing_deletes() -> Self {
        Self::build(true)
    }

    fn build(fail_deletes: bool) -> Self {
        Self {
            inner: Arc::new(Inner {
                mailboxes: Mutex::new(HashMap::new()),
                deleted: Mutex::new(Vec::new()),
                flagged: Mutex::new(Vec::new()),
                expunged: Mutex::new(Vec::new()),
                closes: AtomicUsize::new(0),
                delete_events: Mutex::new(None),
                fail_deletes,
                connects: AtomicUsize::new(0),
                locks: MailboxLocks::new(),
            }),
        }
    }

    /// Append a message to `mailbox`, numbering it after the existing ones.
    pub fn add_message(&self, mailbox: &str, uid: u32, source: &[u8]) -> u32 {
        let mut mailboxes = self.inner.mailboxes.lock().unwrap();
        let messages = mailboxes.entry(mailbox.to_string()).or_default();
        let seq = messages.len() as u32 + 1;
        messages.push(FetchedMessage {
            attributes: MessageAttributes {
                seq,
                uid: Some(uid),
                flags: vec!["\\Seen".to_string()],
                ..Default::default()
            },
            source: source.to_vec(),
            modseq: Some(1),
        });
        seq
    }

    /// Create an empty mailbox.
    pub fn add_mailbox(&self, mailbox: &str) {
        self.inner
            .mailboxes
            .lock()
            .unwrap()
            .entry(mailbox.to_string())
            .or_default();
    }

    /// Receive every sequence number passed to `delete`, as it happens.
    pub fn watch_deletes(&self) -> mpsc::UnboundedReceiver<u32> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.delete_events.lock().unwrap() = Some(tx);
        rx
    }

    /// Every sequence number successfully flagged, in call order.
    pub fn deleted(&self) -> Vec<u32> {
        self.inner.deleted.lock().unwrap().clone()
    }

    /// Uids removed by `close`.
    pub fn expunged(&self) -> Vec<u32> {
        self.inner.expunged.lock().unwrap().clone()
    }

    pub fn closes(&self) -> usize {
        self.inner.closes.load(Ordering::SeqCst)
    }

    /// Uids still present in `mailbox`, in sequence order.
    pub fn uids(&self, mailbox: &str) -> Vec<u32> {
        self.inner
            .mailboxes
            .lock()
            .unwrap()
            .get(mailbox)
            .map(|messages| messages.iter().filter_map(|m| m.attributes.uid).collect())
            .unwrap_or_default()
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn locks(&self) -> &MailboxLocks {
        &self.inner.locks
    }
}

#[async_trait]
impl MailboxClientFactory for MemoryMailbox {
    async fn connect(&self, account: &Account) -> Result<Arc<dyn MailboxSession>, MailboxError> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemorySession {
            account_id: account.id.clone(),
            mailbox: self.clone(),
            selected: Mutex::new(None),
        }))
    }
}

struct MemorySession {
    account_id: String,
    mailbox: MemoryMailbox,
    selected: Mutex<Option<String>>,
}

#[async_trait]
impl MailboxSession for MemorySession {
    async fn lock(&self, mailbox: &str) -> Result<MailboxLock, MailboxError> {
        let exists = self
            .mailbox
            .inner
            .mailboxes
            .lock()
            .unwrap()
            .contains_key(mailbox);
        if !exists {
            return Err(MailboxError::NotFound(mailbox.to_string()));
        }
        let lock = self.mailbox.inner.locks.acquire(&self.account_id, mailbox).await;
        *self.selected.lock().unwrap() = Some(mailbox.to_string());
        Ok(lock)
    }

    async fn fetch(&self, lock: &MailboxLock, seq: &str) -> Result<MessageStream, MailboxError> {
        let flagged = self.mailbox.inner.flagged.lock().unwrap().clone();
        let messages: Vec<FetchedMessage> = self
            .mailbox
            .inner
            .mailboxes
            .lock()
            .unwrap()
            .get(lock.mailbox())
            .cloned()
            .unwrap_or_default();

        let total = messages.len() as u32;
        let selected: Vec<Result<FetchedMessage, MailboxError>> = messages
            .into_iter()
            .filter(|m| in_sequence_set(seq, m.attributes.seq, total))
            .filter(|m| !flagged.contains(&m.attributes.seq))
            .map(Ok)
            .collect();

        Ok(Box::pin(futures::stream::iter(selected)))
    }

    async fn delete(&self, seq: u32) -> Result<(), MailboxError> {
        if let Some(tx) = self.mailbox.inner.delete_events.lock().unwrap().as_ref() {
            let _ = tx.send(seq);
        }
        if self.mailbox.inner.fail_deletes {
            return Err(MailboxError::Protocol("STORE rejected".to_string()));
        }
        self.mailbox.inner.deleted.lock().unwrap().push(seq);
        self.mailbox.inner.flagged.lock().unwrap().push(seq);
        Ok(())
    }

    async fn close(&self) -> Result<(), MailboxError> {
        self.mailbox.inner.closes.fetch_add(1, Ordering::SeqCst);

        let selected = self.selected.lock().unwrap().take();
        let Some(selected) = selected else {
            return Ok(());
        };

        let flagged: Vec<u32> = self.mailbox.inner.flagged.lock().unwrap().drain(..).collect();
        let mut mailboxes = self.mailbox.inner.mailboxes.lock().unwrap();
        if let Some(messages) = mailboxes.get_mut(&selected) {
            let (gone, kept): (Vec<_>, Vec<_>) = messages
                .drain(..)
                .partition(|m| flagged.contains(&m.attributes.seq));
            self.mailbox
                .inner
                .expunged
                .lock()
                .unwrap()
                .extend(gone.iter().filter_map(|m| m.attributes.uid));
            *messages = kept
                .into_iter()
                .enumerate()
                .map(|(i, mut m)| {
                    m.attributes.seq = i as u32 + 1;
                    m
                })
                .collect();
        }
        Ok(())
    }
}

/// Minimal sequence-set matcher: `*`, `n`, `n:m` and comma lists.
fn in_sequence_set(set: &str, seq: u32, total: u32) -> bool {
    let resolve = |part: &str| -> u32 {
        if part == "*" {
            total
        } else {
            part.parse().unwrap_or(0)
        }
    };

    set.split(',').any(|range| match range.split_once(':') {
        Some((start, end)) => {
            let (a, b) = (resolve(start), resolve(end));
            (a.min(b)..=a.max(b)).contains(&seq)
        }
        None => resolve(range) == seq,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    use crate::accounts::fixtures;

    #[tokio::test]
    async fn test_close_expunges_flagged_and_renumbers() {
        let mailbox = MemoryMailbox::new();
        for uid in [10, 11, 12] {
            mailbox.add_message("INBOX", uid, b"x");
        }
        let session = mailbox
            .connect(&fixtures::account("acct1", "https://e.com"))
            .await
            .unwrap();

        let lock = session.lock("INBOX").await.unwrap();
        session.delete(2).await.unwrap();
        drop(lock);
        session.close().await.unwrap();

        assert_eq!(mailbox.closes(), 1);
        assert_eq!(mailbox.expunged(), vec![11]);
        assert_eq!(mailbox.uids("INBOX"), vec![10, 12]);

        let session = mailbox
            .connect(&fixtures::account("acct1", "https://e.com"))
            .await
            .unwrap();
        let lock = session.lock("INBOX").await.unwrap();
        let seqs: Vec<u32> = session
            .fetch(&lock, "1:*")
            .await
            .unwrap()
            .map(|m| m.unwrap().attributes.seq)
            .collect()
            .await;
        assert_eq!(seqs, vec![1, 2]);
    }
}
