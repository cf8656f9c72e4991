use crate::store::StoreError;

/// Errors surfaced by the mailbox mirror.
#[derive(Debug, thiserror::Error)]
pub enum MailError {
    /// Required settings or secrets are missing
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Connecting or authenticating to the IMAP server failed
    #[error("IMAP connection failed: {0}")]
    Connection(String),
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// A non-mutating IMAP command (select, search, list, idle) failed
    #[error("IMAP command failed: {0}")]
    Protocol(String),
    /// Copy, flag or expunge failed; local state was left untouched
    #[error("remote {operation} failed: {reason}")]
    RemoteMutation {
        operation: &'static str,
        reason: String,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MailError {
    pub fn remote(operation: &'static str, reason: impl ToString) -> Self {
        Self::RemoteMutation {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// Why a fetched message could not be turned into an entry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("message has no Message-ID header")]
    MissingMessageId,
    #[error("malformed MIME message")]
    Malformed,
}
