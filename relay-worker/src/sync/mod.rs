//! Mailbox runs: scan a mailbox, relay each message to webhooks, and gate its
//! deletion on the webhook outcomes.
//!
//! ## Modes
//!
//! - **async** (default): each message's webhook chain is detached and the
//!   outcome reports `state: "async"` with no response yet.
//! - **sync**: each message's chain is awaited; the outcome carries the
//!   responses and the deletion decision.

pub mod gate;
pub mod synchronizer;

pub use gate::{process_to_delete, should_delete};
pub use synchronizer::MailboxSynchronizer;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::accounts::AccountsError;
use crate::mailbox::{MailboxError, MessageAttributes, DEFAULT_MAILBOX};
use crate::webhook::WebhookResponse;

/// Caller-supplied knobs of a run. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct RunOptions {
    pub mailbox: Option<String>,
    pub sync: Option<bool>,
    pub delete: Option<bool>,
}

impl RunOptions {
    /// Options of a scheduled firing: INBOX, detached, deleting.
    pub fn scheduled() -> Self {
        Self {
            mailbox: Some(DEFAULT_MAILBOX.to_string()),
            sync: Some(false),
            delete: Some(true),
        }
    }

    pub fn mailbox(&self) -> &str {
        self.mailbox.as_deref().unwrap_or(DEFAULT_MAILBOX)
    }

    pub fn is_sync(&self) -> bool {
        self.sync == Some(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessState {
    Async,
    Sync,
}

/// What a run reports for one message.
///
/// The message attributes are flattened next to `state`, `response` and
/// `deleting`; the raw source is never included.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageOutcome {
    #[serde(flatten)]
    pub message: MessageAttributes,
    pub state: ProcessState,
    pub response: Option<Vec<WebhookResponse>>,
    pub deleting: Option<bool>,
}

impl MessageOutcome {
    /// Placeholder for a message whose chain was detached.
    pub fn detached(message: MessageAttributes) -> Self {
        Self {
            message,
            state: ProcessState::Async,
            response: None,
            deleting: None,
        }
    }

    pub fn completed(
        message: MessageAttributes,
        responses: Vec<WebhookResponse>,
        deleting: bool,
    ) -> Self {
        Self {
            message,
            state: ProcessState::Sync,
            response: Some(responses),
            deleting: Some(deleting),
        }
    }
}

#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Accounts(#[from] AccountsError),

    #[error(transparent)]
    Mailbox(#[from] MailboxError),
}

impl RunError {
    /// Unknown account or mailbox.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RunError::Accounts(AccountsError::NotFound(_)) | RunError::Mailbox(MailboxError::NotFound(_))
        )
    }

    /// The caller supplied something unusable, such as a malformed sequence set.
    pub fn is_bad_request(&self) -> bool {
        matches!(self, RunError::Mailbox(MailboxError::InvalidSequence(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scheduled_options() {
        let options = RunOptions::scheduled();
        assert_eq!(options.mailbox(), "INBOX");
        assert!(!options.is_sync());
        assert_eq!(options.delete, Some(true));
    }

    #[test]
    fn test_defaults_are_async_inbox() {
        let options = RunOptions::default();
        assert_eq!(options.mailbox(), "INBOX");
        assert!(!options.is_sync());
    }

    #[test]
    fn test_detached_outcome_shape() {
        let outcome = MessageOutcome::detached(MessageAttributes {
            seq: 3,
            uid: Some(7),
            ..Default::default()
        });

        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["seq"], json!(3));
        assert_eq!(value["uid"], json!(7));
        assert_eq!(value["state"], json!("async"));
        assert_eq!(value["response"], json!(null));
        assert_eq!(value["deleting"], json!(null));
        assert!(value.get("source").is_none());
    }

    #[test]
    fn test_completed_outcome_shape() {
        let outcome = MessageOutcome::completed(
            MessageAttributes::default(),
            vec![WebhookResponse {
                status_code: Some(409),
                data: None,
            }],
            true,
        );

        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["state"], json!("sync"));
        assert_eq!(value["response"], json!([{"statusCode": 409, "data": null}]));
        assert_eq!(value["deleting"], json!(true));
    }

    #[test]
    fn test_error_classification() {
        assert!(RunError::from(AccountsError::NotFound("x".into())).is_not_found());
        assert!(RunError::from(MailboxError::NotFound("Spam".into())).is_not_found());
        assert!(RunError::from(MailboxError::InvalidSequence("a".into())).is_bad_request());
        assert!(!RunError::from(MailboxError::Timeout).is_not_found());
    }
}
