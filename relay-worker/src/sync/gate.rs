//! Deletion gate: decides whether a relayed message may be removed.
//!
//! Deletion is the only irreversible step of a run. A message is deleted only
//! when the run allows it and every webhook accepted the delivery.

use std::sync::Arc;

use tracing::{error, info, warn};

use super::RunOptions;
use crate::mailbox::MailboxSession;
use crate::webhook::WebhookResponse;

/// Whether the message may be deleted given the webhook outcomes.
///
/// An explicit `delete: false` wins over any outcome. Otherwise every
/// response must be 2xx or 409.
pub fn should_delete(
    options: &RunOptions,
    responses: &[WebhookResponse],
    account_id: &str,
    seq: u32,
) -> bool {
    if options.delete == Some(false) {
        warn!(account_id = %account_id, seq = seq, "message_delete_skipped");
        return false;
    }

    if let Some(rejected) = responses.iter().find(|r| !r.is_accepted()) {
        error!(
            account_id = %account_id,
            seq = seq,
            status_code = rejected.status_code,
            "message_kept_after_webhook_error"
        );
        return false;
    }

    if responses.is_empty() {
        warn!(account_id = %account_id, seq = seq, "message_delete_without_webhooks");
    }

    true
}

/// Apply the gate and, when it passes, delete the message in the background.
///
/// The deletion itself is best-effort: its outcome is logged and never
/// returned. The return value is the gate's decision.
pub fn process_to_delete(
    session: &Arc<dyn MailboxSession>,
    account_id: &str,
    seq: u32,
    options: &RunOptions,
    responses: &[WebhookResponse],
) -> bool {
    if !should_delete(options, responses, account_id, seq) {
        return false;
    }

    let session = Arc::clone(session);
    let account_id = account_id.to_string();
    tokio::spawn(async move {
        match session.delete(seq).await {
            Ok(()) => info!(account_id = %account_id, seq = seq, "message_deleted"),
            Err(e) => error!(
                account_id = %account_id,
                seq = seq,
                error = %e,
                "message_delete_failed"
            ),
        }
    });

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::accounts::fixtures;
    use crate::mailbox::memory::MemoryMailbox;
    use crate::mailbox::MailboxClientFactory;

    fn response(status: Option<u16>) -> WebhookResponse {
        WebhookResponse {
            status_code: status,
            data: None,
        }
    }

    #[test]
    fn test_all_accepted_allows_delete() {
        let options = RunOptions::default();
        let responses = vec![response(Some(200)), response(Some(299)), response(Some(409))];
        assert!(should_delete(&options, &responses, "acct1", 1));
    }

    #[test]
    fn test_any_rejection_keeps_message() {
        let options = RunOptions::default();
        for bad in [Some(199), Some(300), Some(404), Some(500), None] {
            let responses = vec![response(Some(200)), response(bad)];
            assert!(!should_delete(&options, &responses, "acct1", 1), "{:?}", bad);
        }
    }

    #[test]
    fn test_explicit_no_delete_wins() {
        let options = RunOptions {
            delete: Some(false),
            ..Default::default()
        };
        assert!(!should_delete(&options, &[response(Some(200))], "acct1", 1));
    }

    #[test]
    fn test_empty_responses_allow_delete() {
        assert!(should_delete(&RunOptions::default(), &[], "acct1", 1));
    }

    #[tokio::test]
    async fn test_process_to_delete_issues_delete() {
        let mailbox = MemoryMailbox::new();
        let mut deletes = mailbox.watch_deletes();
        let session = mailbox
            .connect(&fixtures::account("acct1", "https://e.com"))
            .await
            .unwrap();

        assert!(process_to_delete(
            &session,
            "acct1",
            4,
            &RunOptions::default(),
            &[response(Some(200))]
        ));

        let seq = tokio::time::timeout(Duration::from_secs(1), deletes.recv())
            .await
            .unwrap();
        assert_eq!(seq, Some(4));
    }

    #[tokio::test]
    async fn test_delete_failure_is_swallowed() {
        let mailbox = MemoryMailbox::failing_deletes();
        let mut deletes = mailbox.watch_deletes();
        let session = mailbox
            .connect(&fixtures::account("acct1", "https://e.com"))
            .await
            .unwrap();

        assert!(process_to_delete(&session, "acct1", 2, &RunOptions::default(), &[]));

        let seq = tokio::time::timeout(Duration::from_secs(1), deletes.recv())
            .await
            .unwrap();
        assert_eq!(seq, Some(2));
        assert!(mailbox.deleted().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_delivery_never_calls_delete() {
        let mailbox = MemoryMailbox::new();
        let session = mailbox
            .connect(&fixtures::account("acct1", "https://e.com"))
            .await
            .unwrap();

        assert!(!process_to_delete(
            &session,
            "acct1",
            1,
            &RunOptions::default(),
            &[response(Some(500))]
        ));
        tokio::task::yield_now().await;
        assert!(mailbox.deleted().is_empty());
    }
}
