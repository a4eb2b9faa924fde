//! Delivery of signed message payloads to an account's webhooks.

use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info};

use super::payload::{build_message_payload, MultipartPayload};
use super::signature::{signature_header, SIGNATURE_HEADER};
use crate::accounts::{Account, Webhook};
use crate::mailbox::MessageAttributes;
use crate::util::retry::{is_transient_transport_error, with_retry, RetryPolicy};
use crate::util::user_agent::build_headers;

/// Per-call timeout of a webhook request.
pub const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of one webhook call for one message.
///
/// `status_code` is `None` when no HTTP response was received at all.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookResponse {
    pub status_code: Option<u16>,
    pub data: Option<Value>,
}

impl WebhookResponse {
    /// 2xx, or 409 which endpoints use for "already processed".
    pub fn is_accepted(&self) -> bool {
        matches!(self.status_code, Some(200..=299) | Some(409))
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to serialize message attributes: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("cannot sign payload for webhook {0}")]
    Signature(String),
}

/// Sends every message to every enabled webhook of its account.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: Client,
    retry: RetryPolicy,
    timeout: Duration,
}

impl WebhookDispatcher {
    pub fn new(client: Client, timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            client,
            retry,
            timeout,
        }
    }

    /// Deliver `message` to each enabled webhook of `account`, in order.
    ///
    /// Individual webhook failures are recorded in the returned list, never
    /// raised. Errors only come from building the payload itself.
    pub async fn trigger(
        &self,
        account: &Account,
        message: &MessageAttributes,
        source: &[u8],
    ) -> Result<Vec<WebhookResponse>, DispatchError> {
        let payload = build_message_payload(account.mailbox_user(), message, source)?;
        let signed = payload.signed_text();

        let mut responses = Vec::new();
        for webhook in account.enabled_webhooks() {
            let signature = signature_header(webhook.alg, &webhook.secret, signed.as_bytes())
                .map_err(|_| DispatchError::Signature(webhook.id.clone()))?;

            let response = self
                .deliver(account, webhook, message, &payload, &signature)
                .await;
            responses.push(response);
        }

        Ok(responses)
    }

    async fn deliver(
        &self,
        account: &Account,
        webhook: &Webhook,
        message: &MessageAttributes,
        payload: &MultipartPayload,
        signature: &str,
    ) -> WebhookResponse {
        let result = with_retry(&self.retry, is_transient_transport_error, |attempt| {
            let mut request = self
                .client
                .post(&webhook.url)
                .timeout(self.timeout)
                .header(CONTENT_TYPE, payload.content_type())
                .header(SIGNATURE_HEADER, signature)
                .body(payload.body().to_vec());

            for (key, value) in build_headers(attempt) {
                request = request.header(key, value);
            }

            async move {
                let response = request.send().await?;
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                Ok::<_, reqwest::Error>((status, parse_body(text)))
            }
        })
        .await;

        match result {
            Ok((status, data)) if status.is_success() => {
                info!(
                    account_id = %account.id,
                    webhook_id = %webhook.id,
                    url = %webhook.url,
                    seq = message.seq,
                    status_code = status.as_u16(),
                    "webhook_triggered"
                );
                WebhookResponse {
                    status_code: Some(status.as_u16()),
                    data,
                }
            }
            Ok((status, data)) => {
                log_rejection(account, webhook, message, Some(status), data.as_ref());
                WebhookResponse {
                    status_code: Some(status.as_u16()),
                    data,
                }
            }
            Err(e) => {
                error!(
                    account_id = %account.id,
                    webhook_id = %webhook.id,
                    url = %webhook.url,
                    seq = message.seq,
                    error = %e,
                    "webhook_delivery_failed"
                );
                WebhookResponse {
                    status_code: e.status().map(|s| s.as_u16()),
                    data: None,
                }
            }
        }
    }
}

fn log_rejection(
    account: &Account,
    webhook: &Webhook,
    message: &MessageAttributes,
    status: Option<StatusCode>,
    data: Option<&Value>,
) {
    let body = data
        .map(|d| serde_json::to_string_pretty(d).unwrap_or_default())
        .unwrap_or_default();
    error!(
        account_id = %account.id,
        webhook_id = %webhook.id,
        url = %webhook.url,
        seq = message.seq,
        status_code = status.map(|s| s.as_u16()),
        body = %body,
        "webhook_rejected"
    );
}

/// JSON bodies are kept structured, anything else as a string.
fn parse_body(text: String) -> Option<Value> {
    if text.is_empty() {
        return None;
    }
    Some(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}
