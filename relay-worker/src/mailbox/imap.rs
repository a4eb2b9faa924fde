//! IMAP implementation of the mailbox capability, on top of `async-imap`.
//!
//! Deletion only sets `\Deleted`, so sequence numbers stay stable while
//! detached deletions run. The flagged messages are expunged by `CLOSE` once
//! the session is closed, under the mailbox lock, right before `LOGOUT`.

use std::fmt::Debug;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use async_imap::imap_proto::types::{Address as ImapAddress, Envelope as ImapEnvelope};
use async_imap::types::{Fetch, Flag};
use async_imap::Session;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::{
    Address, Envelope, FetchedMessage, MailboxClientFactory, MailboxError, MailboxLock,
    MailboxLocks, MailboxSession, MessageAttributes, MessageStream,
};
use crate::accounts::{Account, ImapSettings};

const FETCH_QUERY: &str = "(UID FLAGS ENVELOPE INTERNALDATE RFC822.SIZE BODY.PEEK[])";
const DELETE_QUERY: &str = "+FLAGS.SILENT (\\Deleted)";

/// Transport an IMAP session runs over: TLS or plain TCP.
pub trait ImapStream: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

impl<T> ImapStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + Debug {}

type ImapSession = Session<Box<dyn ImapStream>>;

/// XOAUTH2 SASL authenticator for token-based accounts.
struct XOAuth2 {
    user: String,
    access_token: String,
}

impl async_imap::Authenticator for XOAuth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> Self::Response {
        format!("user={}\x01auth=Bearer {}\x01\x01", self.user, self.access_token)
    }
}

/// Connects to the IMAP server configured on each account.
#[derive(Clone)]
pub struct ImapClientFactory {
    locks: MailboxLocks,
    connect_timeout: Duration,
}

impl ImapClientFactory {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            locks: MailboxLocks::new(),
            connect_timeout,
        }
    }

    async fn open(&self, settings: &ImapSettings) -> Result<ImapSession, MailboxError> {
        let host = settings.host.as_str();
        let port = settings.effective_port();

        let tcp = TcpStream::connect((host, port))
            .await
            .map_err(|e| MailboxError::Connection(e.to_string()))?;

        let stream: Box<dyn ImapStream> = if settings.is_secure() {
            let connector = tokio_native_tls::native_tls::TlsConnector::builder()
                .build()
                .map_err(|e| MailboxError::Connection(e.to_string()))?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            let server_name = settings.servername.as_deref().unwrap_or(host);
            let tls = connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| MailboxError::Connection(e.to_string()))?;
            Box::new(tls)
        } else {
            Box::new(tcp)
        };

        let client = async_imap::Client::new(stream);
        let auth = &settings.auth;

        let session = match (&auth.access_token, &auth.pass) {
            (Some(token), _) => client
                .authenticate(
                    "XOAUTH2",
                    XOAuth2 {
                        user: auth.user.clone(),
                        access_token: token.clone(),
                    },
                )
                .await
                .map_err(|(e, _)| MailboxError::Auth(e.to_string()))?,
            (None, Some(pass)) => client
                .login(&auth.user, pass)
                .await
                .map_err(|(e, _)| MailboxError::Auth(e.to_string()))?,
            (None, None) => {
                return Err(MailboxError::Auth(
                    "neither password nor access token configured".to_string(),
                ))
            }
        };

        Ok(session)
    }
}

#[async_trait]
impl MailboxClientFactory for ImapClientFactory {
    async fn connect(&self, account: &Account) -> Result<Arc<dyn MailboxSession>, MailboxError> {
        let settings = account
            .imap
            .as_ref()
            .ok_or_else(|| MailboxError::NotConfigured(account.id.clone()))?;

        info!(
            account_id = %account.id,
            host = %settings.host,
            port = settings.effective_port(),
            secure = settings.is_secure(),
            "imap_connecting"
        );

        let session = timeout(self.connect_timeout, self.open(settings))
            .await
            .map_err(|_| MailboxError::Timeout)??;

        info!(account_id = %account.id, "imap_connected");

        Ok(Arc::new(ImapMailboxSession {
            account_id: account.id.clone(),
            session: Arc::new(Mutex::new(session)),
            locks: self.locks.clone(),
            selected: StdMutex::new(None),
        }))
    }
}

/// A logged-in IMAP connection shared between a scan and its detached deletions.
pub struct ImapMailboxSession {
    account_id: String,
    session: Arc<Mutex<ImapSession>>,
    locks: MailboxLocks,
    selected: StdMutex<Option<String>>,
}

#[async_trait]
impl MailboxSession for ImapMailboxSession {
    async fn lock(&self, mailbox: &str) -> Result<MailboxLock, MailboxError> {
        let lock = self.locks.acquire(&self.account_id, mailbox).await;

        let mut session = self.session.lock().await;
        match session.select(mailbox).await {
            Ok(selected) => {
                debug!(
                    account_id = %self.account_id,
                    mailbox = %mailbox,
                    exists = selected.exists,
                    "imap_mailbox_selected"
                );
                *self.selected.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(mailbox.to_string());
                Ok(lock)
            }
            Err(e) => {
                warn!(
                    account_id = %self.account_id,
                    mailbox = %mailbox,
                    error = %e,
                    "imap_select_failed"
                );
                Err(MailboxError::NotFound(mailbox.to_string()))
            }
        }
    }

    async fn fetch(&self, lock: &MailboxLock, seq: &str) -> Result<MessageStream, MailboxError> {
        if !super::is_valid_sequence_set(seq) {
            return Err(MailboxError::InvalidSequence(seq.to_string()));
        }

        let mut numbers: Vec<u32> = {
            let mut session = self.session.lock().await;
            session
                .search(format!("{} UNDELETED", seq))
                .await
                .map_err(protocol)?
                .into_iter()
                .collect()
        };
        numbers.sort_unstable();

        debug!(
            account_id = %self.account_id,
            mailbox = %lock.mailbox(),
            seq = %seq,
            matched = numbers.len(),
            "imap_search_complete"
        );

        let session = Arc::clone(&self.session);
        let stream = futures::stream::iter(numbers)
            .then(move |number| {
                let session = Arc::clone(&session);
                async move { fetch_one(&session, number).await }
            })
            .filter_map(|result| async move { result.transpose() });

        Ok(Box::pin(stream))
    }

    async fn delete(&self, seq: u32) -> Result<(), MailboxError> {
        let mut session = self.session.lock().await;
        let updates: Vec<Fetch> = session
            .store(seq.to_string(), DELETE_QUERY)
            .await
            .map_err(protocol)?
            .try_collect()
            .await
            .map_err(protocol)?;

        debug!(
            account_id = %self.account_id,
            seq = seq,
            updates = updates.len(),
            "imap_message_flagged_deleted"
        );

        Ok(())
    }

    async fn close(&self) -> Result<(), MailboxError> {
        let selected = self
            .selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(mailbox) = selected {
            let _lock = self.locks.acquire(&self.account_id, &mailbox).await;
            let mut session = self.session.lock().await;
            session.close().await.map_err(protocol)?;
            debug!(account_id = %self.account_id, mailbox = %mailbox, "imap_mailbox_expunged");
        }

        self.session.lock().await.logout().await.map_err(protocol)?;
        info!(account_id = %self.account_id, "imap_session_closed");
        Ok(())
    }
}

/// Fetch one message by sequence number. `None` if it vanished since the search.
async fn fetch_one(
    session: &Mutex<ImapSession>,
    number: u32,
) -> Result<Option<FetchedMessage>, MailboxError> {
    let mut session = session.lock().await;
    let mut responses = session
        .fetch(number.to_string(), FETCH_QUERY)
        .await
        .map_err(protocol)?;

    let mut found = None;
    while let Some(item) = responses.next().await {
        let fetch = item.map_err(protocol)?;
        if fetch.message == number && found.is_none() {
            found = Some(convert_fetch(&fetch));
        }
    }

    Ok(found)
}

fn convert_fetch(fetch: &Fetch) -> FetchedMessage {
    FetchedMessage {
        attributes: MessageAttributes {
            seq: fetch.message,
            uid: fetch.uid,
            flags: fetch.flags().map(|f| flag_name(&f)).collect(),
            envelope: fetch.envelope().map(convert_envelope),
            internal_date: fetch.internal_date().map(|d| d.to_rfc3339()),
            size: fetch.size,
        },
        source: fetch.body().map(|b| b.to_vec()).unwrap_or_default(),
        modseq: fetch.modseq,
    }
}

fn flag_name(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
    }
}

fn text(bytes: &Option<std::borrow::Cow<'_, [u8]>>) -> Option<String> {
    bytes
        .as_ref()
        .map(|b| String::from_utf8_lossy(b).into_owned())
}

fn addresses(list: &Option<Vec<ImapAddress<'_>>>) -> Vec<Address> {
    list.iter()
        .flatten()
        .map(|a| Address {
            name: text(&a.name),
            address: match (text(&a.mailbox), text(&a.host)) {
                (Some(mailbox), Some(host)) => Some(format!("{}@{}", mailbox, host)),
                (Some(mailbox), None) => Some(mailbox),
                _ => None,
            },
        })
        .collect()
}

fn convert_envelope(envelope: &ImapEnvelope<'_>) -> Envelope {
    Envelope {
        date: text(&envelope.date),
        subject: text(&envelope.subject),
        from: addresses(&envelope.from),
        sender: addresses(&envelope.sender),
        reply_to: addresses(&envelope.reply_to),
        to: addresses(&envelope.to),
        cc: addresses(&envelope.cc),
        bcc: addresses(&envelope.bcc),
        in_reply_to: text(&envelope.in_reply_to),
        message_id: text(&envelope.message_id),
    }
}

fn protocol(e: async_imap::error::Error) -> MailboxError {
    MailboxError::Protocol(e.to_string())
}
