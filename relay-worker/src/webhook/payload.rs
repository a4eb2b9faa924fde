//! Multipart body sent to webhooks.
//!
//! The body is assembled in memory rather than streamed: the signature covers
//! the exact bytes on the wire, and retries resend them unchanged.

use std::borrow::Cow;

use rand::Rng;
use serde_json::Value;

use crate::mailbox::MessageAttributes;

/// A finished `multipart/form-data` body and its boundary.
#[derive(Debug, Clone)]
pub struct MultipartPayload {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartPayload {
    pub fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// UTF-8 text of the body, the input of the signature.
    ///
    /// Bytes that are not valid UTF-8 (binary attachments inside the message
    /// source) are replaced with U+FFFD.
    pub fn signed_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Incremental `multipart/form-data` writer.
pub struct MultipartBuilder {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartBuilder {
    pub fn new() -> Self {
        Self::with_boundary(random_boundary())
    }

    pub fn with_boundary(boundary: impl Into<String>) -> Self {
        Self {
            boundary: boundary.into(),
            body: Vec::new(),
        }
    }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.open_part(&format!("Content-Disposition: form-data; name=\"{}\"", escape(name)));
        self.body.extend_from_slice(value.as_bytes());
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn file(mut self, name: &str, filename: &str, content_type: &str, content: &[u8]) -> Self {
        self.open_part(&format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\nContent-Type: {}",
            escape(name),
            escape(filename),
            content_type
        ));
        self.body.extend_from_slice(content);
        self.body.extend_from_slice(b"\r\n");
        self
    }

    pub fn finish(mut self) -> MultipartPayload {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        MultipartPayload {
            boundary: self.boundary,
            body: self.body,
        }
    }

    fn open_part(&mut self, headers: &str) {
        self.body
            .extend_from_slice(format!("--{}\r\n{}\r\n\r\n", self.boundary, headers).as_bytes());
    }
}

impl Default for MultipartBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn random_boundary() -> String {
    let mut rng = rand::thread_rng();
    let digits: String = (0..24)
        .map(|_| char::from(b'0' + rng.gen_range(0..10u8)))
        .collect();
    format!("--------------------------{}", digits)
}

fn escape(value: &str) -> String {
    value.replace('"', "%22").replace('\r', "%0D").replace('\n', "%0A")
}

/// Build the payload for one message: `account`, the source as `file`, then
/// one field per attribute.
///
/// Strings are sent as-is, numbers and booleans in decimal form, lists and
/// objects as JSON. Absent attributes are omitted.
pub fn build_message_payload(
    account_user: &str,
    attributes: &MessageAttributes,
    source: &[u8],
) -> Result<MultipartPayload, serde_json::Error> {
    let filename = format!(
        "{}.eml",
        attributes.uid.unwrap_or(attributes.seq)
    );

    let mut builder = MultipartBuilder::new()
        .text("account", account_user)
        .file("file", &filename, "message/rfc822", source);

    if let Value::Object(fields) = serde_json::to_value(attributes)? {
        for (name, value) in fields {
            let rendered = match value {
                Value::Null => continue,
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                other => serde_json::to_string(&other)?,
            };
            builder = builder.text(&name, &rendered);
        }
    }

    Ok(builder.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mailbox::{Address, Envelope};

    fn attributes() -> MessageAttributes {
        MessageAttributes {
            seq: 7,
            uid: Some(42),
            flags: vec!["\\Seen".to_string()],
            envelope: Some(Envelope {
                subject: Some("hi".to_string()),
                from: vec![Address {
                    name: None,
                    address: Some("ada@example.com".to_string()),
                }],
                ..Default::default()
            }),
            internal_date: None,
            size: Some(17),
        }
    }

    #[test]
    fn test_builder_layout() {
        let payload = MultipartBuilder::with_boundary("XYZ")
            .text("account", "acct1@example.com")
            .file("file", "42.eml", "message/rfc822", b"Subject: hi\n\nbody")
            .finish();

        let expected = "--XYZ\r\n\
            Content-Disposition: form-data; name=\"account\"\r\n\r\n\
            acct1@example.com\r\n\
            --XYZ\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"42.eml\"\r\n\
            Content-Type: message/rfc822\r\n\r\n\
            Subject: hi\n\nbody\r\n\
            --XYZ--\r\n";

        assert_eq!(payload.signed_text(), expected);
        assert_eq!(payload.content_type(), "multipart/form-data; boundary=XYZ");
    }

    #[test]
    fn test_random_boundary_shape() {
        let boundary = random_boundary();
        assert_eq!(boundary.len(), 50);
        assert!(boundary.ends_with(|c: char| c.is_ascii_digit()));
        assert_ne!(random_boundary(), boundary);
    }

    #[test]
    fn test_message_payload_fields() {
        let payload =
            build_message_payload("acct1@example.com", &attributes(), b"Subject: hi\n\nbody").unwrap();
        let text = payload.signed_text();

        assert!(text.contains("name=\"account\"\r\n\r\nacct1@example.com\r\n"));
        assert!(text.contains("filename=\"42.eml\""));
        assert!(text.contains("name=\"uid\"\r\n\r\n42\r\n"));
        assert!(text.contains("name=\"seq\"\r\n\r\n7\r\n"));
        assert!(text.contains("name=\"flags\"\r\n\r\n[\"\\\\Seen\"]\r\n"));
        assert!(text.contains("\"subject\":\"hi\""));
        assert!(!text.contains("name=\"internalDate\""));
        assert!(!text.contains("name=\"source\""));
    }

    #[test]
    fn test_message_without_uid_uses_sequence_filename() {
        let mut attrs = attributes();
        attrs.uid = None;
        let payload = build_message_payload("a", &attrs, b"").unwrap();
        assert!(payload.signed_text().contains("filename=\"7.eml\""));
    }

    #[test]
    fn test_signed_text_replaces_invalid_utf8() {
        let payload = MultipartBuilder::with_boundary("B")
            .file("file", "1.eml", "message/rfc822", &[0xff, b'a'])
            .finish();
        assert!(payload.signed_text().contains("\u{fffd}a"));
        assert!(payload.body().windows(2).any(|w| w == [0xff, b'a']));
    }
}
