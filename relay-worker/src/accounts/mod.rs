//! Account configuration types.
//!
//! An accounts file is a versioned list of accounts. Each account carries its
//! IMAP credentials, optional SMTP settings and the webhooks new messages are
//! relayed to.
//!
//! ```yaml
//! version: "1"
//! accounts:
//!   - id: acct1
//!     name: Support inbox
//!     imap:
//!       host: imap.example.com
//!       auth: { user: support@example.com, pass: secret }
//!     webhooks:
//!       - id: crm
//!         enabled: true
//!         url: https://crm.example.com/hooks/mail
//!         secret: s3cr3t
//!         cron: { enabled: true, pattern: "*/5 * * * *", seq: "1:*" }
//! ```

pub mod store;

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

pub use store::{AccountProvider, AccountStore, AccountsError, StaticAccounts};

/// The only accounts file version understood.
pub const ACCOUNTS_FILE_VERSION: &str = "1";

const REDACTED: &str = "******";

/// Root of the accounts file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountsFile {
    pub version: String,
    #[serde(default)]
    pub accounts: Vec<Account>,
}

impl Default for AccountsFile {
    fn default() -> Self {
        Self {
            version: ACCOUNTS_FILE_VERSION.to_string(),
            accounts: Vec::new(),
        }
    }
}

/// One mailbox owner and the webhooks its messages go to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imap: Option<ImapSettings>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub smtp: Option<SmtpSettings>,
    #[serde(default)]
    pub webhooks: Vec<Webhook>,
}

impl Account {
    /// Login name of the mailbox, sent as the `account` field of webhook payloads.
    pub fn mailbox_user(&self) -> &str {
        self.imap
            .as_ref()
            .map(|imap| imap.auth.user.as_str())
            .unwrap_or_default()
    }

    /// Enabled webhooks, in configured order.
    pub fn enabled_webhooks(&self) -> impl Iterator<Item = &Webhook> {
        self.webhooks.iter().filter(|w| w.enabled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImapSettings {
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secure: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servername: Option<String>,
    pub auth: ImapAuth,
}

impl ImapSettings {
    /// Implicit TLS unless explicitly disabled.
    pub fn is_secure(&self) -> bool {
        self.secure.unwrap_or(true)
    }

    pub fn effective_port(&self) -> u16 {
        self.port
            .unwrap_or(if self.is_secure() { 993 } else { 143 })
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImapAuth {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
}

impl fmt::Debug for ImapAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImapAuth")
            .field("user", &self.user)
            .field("pass", &self.pass.as_ref().map(|_| REDACTED))
            .field("access_token", &self.access_token.as_ref().map(|_| REDACTED))
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, rename = "ignoreTLS")]
    pub ignore_tls: bool,
    #[serde(default = "default_true")]
    pub secure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<SmtpAuth>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SmtpAuth {
    pub user: String,
    pub pass: String,
}

impl fmt::Debug for SmtpAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SmtpAuth")
            .field("user", &self.user)
            .field("pass", &REDACTED)
            .finish()
    }
}

fn default_smtp_port() -> u16 {
    25
}

fn default_true() -> bool {
    true
}

/// HMAC digest used to sign webhook payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WebhookAlg {
    #[default]
    Sha256,
    Sha512,
}

impl WebhookAlg {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookAlg::Sha256 => "sha256",
            WebhookAlg::Sha512 => "sha512",
        }
    }
}

impl fmt::Display for WebhookAlg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An external endpoint notified for every relayed message.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Webhook {
    pub id: String,
    pub enabled: bool,
    pub url: String,
    pub secret: String,
    #[serde(default)]
    pub alg: WebhookAlg,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cron: Option<WebhookCron>,
}

impl fmt::Debug for Webhook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Webhook")
            .field("id", &self.id)
            .field("enabled", &self.enabled)
            .field("url", &self.url)
            .field("secret", &REDACTED)
            .field("alg", &self.alg)
            .field("cron", &self.cron)
            .finish()
    }
}

/// Recurring trigger attached to a webhook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookCron {
    pub enabled: bool,
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<String>,
}

/// One validation failure, located by a dotted path into the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub path: String,
    pub message: String,
}

impl FieldError {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

impl AccountsFile {
    /// Check every constraint the file must satisfy before it is used or written.
    pub fn validate(&self) -> Result<(), Vec<FieldError>> {
        let mut errors = Vec::new();

        if self.version != ACCOUNTS_FILE_VERSION {
            errors.push(FieldError::new(
                "version",
                format!("unsupported version {:?}", self.version),
            ));
        }

        let mut ids = HashSet::new();
        for (i, account) in self.accounts.iter().enumerate() {
            let path = format!("accounts[{}]", i);
            if !ids.insert(account.id.as_str()) {
                errors.push(FieldError::new(
                    format!("{}.id", path),
                    format!("duplicate account id {:?}", account.id),
                ));
            }
            account.validate_into(&path, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

impl Account {
    fn validate_into(&self, path: &str, errors: &mut Vec<FieldError>) {
        if self.id.trim().is_empty() {
            errors.push(FieldError::new(format!("{}.id", path), "must not be empty"));
        }

        if let Some(imap) = &self.imap {
            if imap.host.trim().is_empty() {
                errors.push(FieldError::new(format!("{}.imap.host", path), "must not be empty"));
            }
            if let Some(port) = imap.port {
                check_port(port, &format!("{}.imap.port", path), errors);
            }
            if imap.auth.user.trim().is_empty() {
                errors.push(FieldError::new(
                    format!("{}.imap.auth.user", path),
                    "must not be empty",
                ));
            }
        }

        if let Some(smtp) = &self.smtp {
            if smtp.host.trim().is_empty() {
                errors.push(FieldError::new(format!("{}.smtp.host", path), "must not be empty"));
            }
            check_port(smtp.port, &format!("{}.smtp.port", path), errors);
        }

        let mut webhook_ids = HashSet::new();
        for (i, webhook) in self.webhooks.iter().enumerate() {
            let wh_path = format!("{}.webhooks[{}]", path, i);
            if !webhook_ids.insert(webhook.id.as_str()) {
                errors.push(FieldError::new(
                    format!("{}.id", wh_path),
                    format!("duplicate webhook id {:?}", webhook.id),
                ));
            }
            match url::Url::parse(&webhook.url) {
                Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
                Ok(parsed) => errors.push(FieldError::new(
                    format!("{}.url", wh_path),
                    format!("unsupported scheme {:?}", parsed.scheme()),
                )),
                Err(e) => errors.push(FieldError::new(format!("{}.url", wh_path), e.to_string())),
            }
            if let Some(cron) = &webhook.cron {
                if cron.enabled && cron.pattern.trim().is_empty() {
                    errors.push(FieldError::new(
                        format!("{}.cron.pattern", wh_path),
                        "must not be empty when cron is enabled",
                    ));
                }
            }
        }
    }
}

fn check_port(port: u16, path: &str, errors: &mut Vec<FieldError>) {
    if port < 25 {
        errors.push(FieldError::new(path, "must be between 25 and 65535"));
    }
}
