//! Outbound webhooks.
//!
//! This module:
//! - Builds the multipart payload of a fetched message
//! - Signs it with the webhook secret
//! - Delivers it to every enabled webhook of the account, with retry on
//!   connection failures
//!
//! ## Wire contract
//!
//! ```text
//! POST <webhook.url>
//! Content-Type: multipart/form-data; boundary=...
//! X-Webhook-Signature: sha256=<hex>
//! X-Webhook-Attempt: <n>
//! User-Agent: flowerinbox-relay/<version>
//! ```

pub mod dispatcher;
pub mod payload;
pub mod signature;

pub use dispatcher::{DispatchError, WebhookDispatcher, WebhookResponse, WEBHOOK_TIMEOUT};
pub use payload::{build_message_payload, MultipartBuilder, MultipartPayload};
pub use signature::{sign, signature_header, verify_signature, SIGNATURE_HEADER};
