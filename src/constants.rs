//! Application-wide constants for tuning and configuration
//!
//! Centralizes magic numbers and well-known names so they are discoverable.

/// Record store collection holding one record per mirrored message.
pub const ENTRIES_COLLECTION: &str = "mail_inbox_entries";

/// Record store collection of sender/recipient addresses.
pub const ADDRESSES_COLLECTION: &str = "mail_inbox_addresses";

/// Record store collection of the label (folder) tree.
pub const LABELS_COLLECTION: &str = "mail_inbox_labels";

/// Record store collection of attachment files, each owned by one entry.
pub const ATTACHMENTS_COLLECTION: &str = "mail_inbox_attachments";

/// Well-known root label and remote mailbox watched for new mail.
pub const INBOX_LABEL: &str = "INBOX";

/// Well-known root label that mirrors the remote trash folder.
pub const TRASH_LABEL: &str = "Trash";

/// Delay before the watcher reconnects after a connection error.
pub const WATCH_RETRY_DELAY_SECS: u64 = 10;

/// Upper bound for the exponential backoff policy.
pub const MAX_RETRY_DELAY_SECS: u64 = 300;

/// IDLE connection timeout in seconds before refresh.
/// RFC 3501 recommends 29 minutes; we use 5 minutes for reliability.
pub const IDLE_TIMEOUT_SECS: u64 = 300;

/// Search window used when no entry has been mirrored yet.
pub const DEFAULT_WATERMARK_WINDOW_MINS: i64 = 60;

/// Allowed disagreement between the server's arrival clock and stored dates.
pub const CLOCK_SKEW_TOLERANCE_MINS: i64 = 15;

/// Login must complete within this many milliseconds.
pub const IMAP_AUTH_TIMEOUT_MS: u64 = 3000;

/// Number of entries per page when listing.
pub const ENTRY_PAGE_SIZE: usize = 25;

/// Batch size used when walking a full collection.
pub const FULL_LIST_BATCH_SIZE: usize = 500;

/// Placeholder text when a message has no readable body.
pub const EMPTY_BODY_TEXT: &str = "No content";

/// Attachment name used when the MIME part carries no filename.
pub const UNTITLED_ATTACHMENT: &str = "Untitled";

/// Elements removed from message HTML before it is stored.
pub const FORBIDDEN_HTML_TAGS: [&str; 4] = ["style", "script", "link", "meta"];
