//! Inbox mirroring: IMAP access, message parsing, the label tree, the record
//! synchronizer, the inbox watcher and the trash/delete operations.

mod entries;
pub mod error;
pub mod html;
pub mod imap;
mod inbox;
pub mod labels;
pub mod parser;
pub mod sync;
mod trash;
pub mod types;
pub mod watcher;

pub use entries::{EntryView, LabelSelector, LabelView};
pub use error::{MailError, ParseError};
pub use imap::{ImapConnector, ImapSettings, MailboxConnector};
pub use inbox::MailInbox;
pub use sync::{MailSynchronizer, SyncReport};
pub use trash::TrashReport;
pub use watcher::{WatchOptions, WatcherHandle, WatcherState, spawn_inbox_watcher};
