//! IMAP sessions over TLS.

use std::sync::Arc;
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_imap::types::{Capability, Fetch, Flag};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use super::{FetchOptions, MailboxConnector, MailboxEvent, MailboxSession, SearchCriteria, uid_set};
use crate::config::Config;
use crate::mail::error::MailError;
use crate::mail::parser::{parse_flags_from_imap, parse_message_id};
use crate::mail::types::{MailFlags, RawMessage};

type TlsTransport = Compat<tokio_rustls::client::TlsStream<TcpStream>>;

/// Byte stream an IMAP session runs over.
trait Transport: AsyncRead + AsyncWrite + Unpin + std::fmt::Debug + Send + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Unpin + std::fmt::Debug + Send + 'static {}

/// Everything needed to log in to the mailbox.
#[derive(Clone)]
pub struct ImapSettings {
    pub server: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    /// Bounds connect, TLS handshake and login together
    pub auth_timeout: Duration,
}

impl std::fmt::Debug for ImapSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImapSettings")
            .field("server", &self.server)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("auth_timeout", &self.auth_timeout)
            .finish_non_exhaustive()
    }
}

impl ImapSettings {
    /// Build settings from the config and a resolved password.
    ///
    /// Fails with `MailError::Configuration` when any piece is missing, so
    /// callers can refuse to start before touching either side.
    pub fn from_config(config: &Config, password: Option<String>) -> Result<Self, MailError> {
        let mut missing = Vec::new();
        if config.imap.server.trim().is_empty() {
            missing.push("IMAP server");
        }
        if config.account.email.trim().is_empty() {
            missing.push("account email");
        }
        let password = password.filter(|p| !p.is_empty());
        if password.is_none() {
            missing.push("IMAP password");
        }

        match password {
            Some(password) if missing.is_empty() => Ok(Self {
                server: config.imap.server.clone(),
                port: config.imap.port,
                user: config.account.email.clone(),
                password,
                auth_timeout: Duration::from_millis(config.imap.auth_timeout_ms),
            }),
            _ => Err(MailError::Configuration(format!(
                "IMAP access not configured: missing {}",
                missing.join(", ")
            ))),
        }
    }
}

pub struct ImapConnector {
    settings: ImapSettings,
}

impl ImapConnector {
    pub fn new(settings: ImapSettings) -> Self {
        Self { settings }
    }
}

#[async_trait]
impl MailboxConnector for ImapConnector {
    async fn connect(&self) -> Result<Box<dyn MailboxSession>, MailError> {
        let opening = ImapClient::<TlsTransport>::open(&self.settings);
        let client = tokio::time::timeout(self.settings.auth_timeout, opening)
            .await
            .map_err(|_| {
                MailError::Connection(format!(
                    "timed out after {:?} logging in to {}",
                    self.settings.auth_timeout, self.settings.server
                ))
            })??;
        Ok(Box::new(client))
    }
}

fn tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

struct ImapClient<T: Transport> {
    session: Option<async_imap::Session<T>>,
    server: String,
    /// Server advertises X-GM-EXT-1
    gmail: bool,
}

impl ImapClient<TlsTransport> {
    async fn open(settings: &ImapSettings) -> Result<Self, MailError> {
        let addr = format!("{}:{}", settings.server, settings.port);

        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| MailError::Connection(format!("failed to connect to {}: {}", addr, e)))?;

        let server_name = ServerName::try_from(settings.server.clone()).map_err(|_| {
            MailError::Configuration(format!("invalid IMAP server name: {}", settings.server))
        })?;

        let tls = tls_connector()
            .connect(server_name, tcp)
            .await
            .map_err(|e| MailError::Connection(format!("TLS handshake failed: {}", e)))?;

        // Wrap tokio stream with compat layer for futures-io compatibility
        Self::login(tls.compat(), &settings.server, &settings.user, &settings.password).await
    }
}

impl<T: Transport> ImapClient<T> {
    /// Read the greeting, log in and probe capabilities.
    async fn login(stream: T, server: &str, user: &str, password: &str) -> Result<Self, MailError> {
        let mut client = async_imap::Client::new(stream);
        match client.read_response().await {
            Ok(Some(_)) => {}
            Ok(None) => {
                return Err(MailError::Connection(format!(
                    "{} closed the connection before greeting",
                    server
                )));
            }
            Err(e) => {
                return Err(MailError::Connection(format!("failed to read greeting: {}", e)));
            }
        }

        let mut session = client
            .login(user, password)
            .await
            .map_err(|(e, _)| MailError::Connection(format!("login failed: {}", e)))?;

        let gmail = match session.capabilities().await {
            Ok(caps) => caps.has(&Capability::Atom("X-GM-EXT-1".into())),
            Err(e) => {
                tracing::warn!("Failed to read capabilities: {:?}", e);
                false
            }
        };

        tracing::info!(server = %server, gmail, "Connected to IMAP server");

        Ok(Self {
            session: Some(session),
            server: server.to_string(),
            gmail,
        })
    }

    fn session(&mut self) -> Result<&mut async_imap::Session<T>, MailError> {
        self.session
            .as_mut()
            .ok_or_else(|| MailError::Protocol("not connected to IMAP server".to_string()))
    }

    fn fetch_items(&self, fetch: FetchOptions) -> &'static str {
        match (fetch.bodies, self.gmail) {
            (true, true) => "(UID FLAGS INTERNALDATE X-GM-LABELS BODY.PEEK[])",
            (true, false) => "(UID FLAGS INTERNALDATE BODY.PEEK[])",
            (false, _) => "(UID FLAGS INTERNALDATE BODY.PEEK[HEADER.FIELDS (MESSAGE-ID)])",
        }
    }
}

fn to_raw_message(fetch: &Fetch) -> Option<RawMessage> {
    let uid = fetch.uid?;
    let flag_vec: Vec<Flag> = fetch.flags().collect();
    let body = fetch.body().map(<[u8]>::to_vec).unwrap_or_default();
    let message_id = fetch
        .header()
        .or_else(|| (!body.is_empty()).then_some(body.as_slice()))
        .and_then(parse_message_id);

    Some(RawMessage {
        uid,
        flags: parse_flags_from_imap(&flag_vec),
        labels: fetch
            .gmail_labels()
            .map(|labels| labels.iter().map(|l| l.to_string()).collect())
            .unwrap_or_default(),
        message_id,
        internal_date: fetch.internal_date().map(|dt| dt.with_timezone(&Utc)),
        body,
    })
}

#[async_trait]
impl<T: Transport> MailboxSession for ImapClient<T> {
    async fn open_box(&mut self, name: &str) -> Result<(), MailError> {
        self.session()?
            .select(name)
            .await
            .map_err(|e| MailError::Protocol(format!("failed to open '{}': {}", name, e)))?;
        tracing::debug!(mailbox = name, "Opened mailbox");
        Ok(())
    }

    async fn search(
        &mut self,
        criteria: &SearchCriteria,
        fetch: FetchOptions,
    ) -> Result<Vec<RawMessage>, MailError> {
        let query = criteria.to_imap();
        let items = self.fetch_items(fetch);
        let session = self.session()?;
        let mut uids: Vec<u32> = session
            .uid_search(&query)
            .await
            .map_err(|e| MailError::Protocol(format!("search '{}' failed: {}", query, e)))?
            .into_iter()
            .collect();
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        uids.sort_unstable();

        let set = uid_set(&uids);

        let responses: Vec<_> = session
            .uid_fetch(&set, items)
            .await
            .map_err(|e| MailError::Protocol(format!("fetch failed: {}", e)))?
            .collect()
            .await;

        let mut messages = Vec::with_capacity(uids.len());
        for response in responses {
            let fetch = response.map_err(|e| MailError::Protocol(format!("fetch failed: {}", e)))?;
            if let Some(message) = to_raw_message(&fetch) {
                messages.push(message);
            }
        }

        tracing::debug!(criteria = %query, count = messages.len(), "Search complete");
        Ok(messages)
    }

    async fn add_flags(&mut self, uids: &[u32], flags: MailFlags) -> Result<(), MailError> {
        if uids.is_empty() || flags.is_empty() {
            return Ok(());
        }
        let session = self.session()?;
        let responses: Vec<_> = session
            .uid_store(uid_set(uids), format!("+FLAGS ({})", flags.imap_list()))
            .await
            .map_err(|e| MailError::remote("flag", e))?
            .collect()
            .await;

        for response in responses {
            response.map_err(|e| MailError::remote("flag", e))?;
        }
        Ok(())
    }

    async fn copy(&mut self, uids: &[u32], destination: &str) -> Result<(), MailError> {
        if uids.is_empty() {
            return Ok(());
        }
        self.session()?
            .uid_copy(uid_set(uids), destination)
            .await
            .map_err(|e| MailError::remote("copy", e))
    }

    async fn expunge(&mut self) -> Result<(), MailError> {
        let session = self.session()?;
        let responses: Vec<_> = session
            .expunge()
            .await
            .map_err(|e| MailError::remote("expunge", e))?
            .collect()
            .await;

        for response in responses {
            response.map_err(|e| MailError::remote("expunge", e))?;
        }
        Ok(())
    }

    async fn list_folders(&mut self) -> Result<Vec<String>, MailError> {
        let session = self.session()?;
        let names: Vec<_> = session
            .list(Some(""), Some("*"))
            .await
            .map_err(|e| MailError::Protocol(format!("folder list failed: {}", e)))?
            .collect()
            .await;

        let mut folders = Vec::new();
        for name in names.into_iter().flatten() {
            // Label paths always use '/'
            let folder = match name.delimiter() {
                Some(delim) if delim != "/" => name.name().replace(delim, "/"),
                _ => name.name().to_string(),
            };
            folders.push(folder);
        }
        folders.sort();
        Ok(folders)
    }

    async fn wait_for_mail(&mut self, timeout: Duration) -> Result<MailboxEvent, MailError> {
        let session = self
            .session
            .take()
            .ok_or_else(|| MailError::Protocol("not connected to IMAP server".to_string()))?;

        let mut idle = session.idle();
        if let Err(e) = idle.init().await {
            if let Ok(session) = idle.done().await {
                self.session = Some(session);
            }
            return Err(MailError::Protocol(format!("failed to start IDLE: {}", e)));
        }

        tracing::debug!(server = %self.server, "IDLE started, waiting for notifications...");

        let result = {
            let (idle_future, _stop_source) = idle.wait();
            tokio::time::timeout(timeout, idle_future).await
        };

        // Get session back first
        let session = idle
            .done()
            .await
            .map_err(|e| MailError::Protocol(format!("failed to end IDLE: {}", e)))?;
        self.session = Some(session);

        match result {
            Ok(Ok(IdleResponse::NewData(_))) => Ok(MailboxEvent::NewMail),
            Ok(Ok(_)) => Ok(MailboxEvent::Timeout),
            Ok(Err(e)) => Err(MailError::Protocol(format!("IDLE failed: {}", e))),
            Err(_) => Ok(MailboxEvent::Timeout),
        }
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.logout().await.ok();
        }
    }
}
