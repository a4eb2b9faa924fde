//! Per-account mailbox scan.

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use tracing::{error, info};

use super::gate::process_to_delete;
use super::{MessageOutcome, RunError, RunOptions};
use crate::accounts::Account;
use crate::mailbox::{
    is_valid_sequence_set, ClosingSession, MailboxClientFactory, MailboxError, MailboxLock,
    MailboxSession, MessageAttributes,
};
use crate::webhook::WebhookDispatcher;

/// Scans one mailbox of an account and relays every message it finds.
#[derive(Clone)]
pub struct MailboxSynchronizer {
    factory: Arc<dyn MailboxClientFactory>,
    dispatcher: WebhookDispatcher,
}

impl MailboxSynchronizer {
    pub fn new(factory: Arc<dyn MailboxClientFactory>, dispatcher: WebhookDispatcher) -> Self {
        Self {
            factory,
            dispatcher,
        }
    }

    /// Run one scan of `seq` in the mailbox named by `options`.
    ///
    /// The mailbox lock is held for the whole scan and released on every
    /// exit path. The session expunges and logs out once the scan and every
    /// deletion it started are done. Per-message webhook failures never fail
    /// the run.
    pub async fn process(
        &self,
        account: &Account,
        seq: &str,
        options: &RunOptions,
    ) -> Result<Vec<MessageOutcome>, RunError> {
        if !is_valid_sequence_set(seq) {
            return Err(MailboxError::InvalidSequence(seq.to_string()).into());
        }

        let mailbox = options.mailbox();
        info!(
            account_id = %account.id,
            mailbox = %mailbox,
            seq = %seq,
            sync = options.is_sync(),
            "mailbox_scan_started"
        );

        let session: Arc<dyn MailboxSession> = Arc::new(ClosingSession::new(
            &account.id,
            self.factory.connect(account).await?,
        ));
        let lock = session.lock(mailbox).await.map_err(|e| {
            error!(account_id = %account.id, mailbox = %mailbox, error = %e, "mailbox_lock_failed");
            e
        })?;

        let account = Arc::new(account.clone());
        let result = self.scan(&session, &lock, &account, seq, options).await;
        drop(lock);

        match &result {
            Ok(outcomes) => info!(
                account_id = %account.id,
                mailbox = %mailbox,
                messages = outcomes.len(),
                "mailbox_scan_complete"
            ),
            Err(e) => error!(
                account_id = %account.id,
                mailbox = %mailbox,
                error = %e,
                "mailbox_scan_failed"
            ),
        }

        result
    }

    async fn scan(
        &self,
        session: &Arc<dyn MailboxSession>,
        lock: &MailboxLock,
        account: &Arc<Account>,
        seq: &str,
        options: &RunOptions,
    ) -> Result<Vec<MessageOutcome>, RunError> {
        let mut messages = session.fetch(lock, seq).await?;
        let mut outcomes = Vec::new();

        while let Some(fetched) = messages.next().await {
            let (message, source) = fetched?.into_parts();

            if !options.is_sync() {
                let chain = relay_message(
                    self.dispatcher.clone(),
                    Arc::clone(session),
                    Arc::clone(account),
                    message.clone(),
                    source,
                    options.clone(),
                );
                spawn_detached(&account.id, message.seq, chain);
                outcomes.push(MessageOutcome::detached(message));
                continue;
            }

            match self.dispatcher.trigger(account, &message, &source).await {
                Ok(responses) => {
                    let deleting =
                        process_to_delete(session, &account.id, message.seq, options, &responses);
                    outcomes.push(MessageOutcome::completed(message, responses, deleting));
                }
                Err(e) => {
                    error!(
                        account_id = %account.id,
                        seq = message.seq,
                        error = %e,
                        "message_relay_failed"
                    );
                }
            }
        }

        Ok(outcomes)
    }
}

/// Webhook chain of one message in detached mode: trigger, then gate.
async fn relay_message(
    dispatcher: WebhookDispatcher,
    session: Arc<dyn MailboxSession>,
    account: Arc<Account>,
    message: MessageAttributes,
    source: Vec<u8>,
    options: RunOptions,
) {
    match dispatcher.trigger(&account, &message, &source).await {
        Ok(responses) => {
            process_to_delete(&session, &account.id, message.seq, &options, &responses);
        }
        Err(e) => {
            error!(
                account_id = %account.id,
                seq = message.seq,
                error = %e,
                "message_relay_failed"
            );
        }
    }
}

/// Spawn `chain` and log it if it panics.
fn spawn_detached<F>(account_id: &str, seq: u32, chain: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let handle = tokio::spawn(chain);
    let account_id = account_id.to_string();
    tokio::spawn(async move {
        if let Err(e) = handle.await {
            if e.is_panic() {
                error!(account_id = %account_id, seq = seq, error = %e, "message_relay_panicked");
            }
        }
    });
}
