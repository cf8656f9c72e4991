//! Inbox watcher: a supervised task that keeps the mirror current.
//!
//! The task owns one long-lived session. It opens the inbox, runs a
//! catch-up pass, then idles; every new-mail notification triggers another
//! pass. Any error closes the session and the whole watch is retried after
//! the backoff policy's delay, until shutdown is requested.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::error::MailError;
use super::imap::{FetchOptions, MailboxConnector, MailboxEvent, MailboxSession, SearchCriteria};
use super::sync::{MailSynchronizer, SyncReport};
use super::types::{RawMessage, parse_datetime};
use crate::actor::retry::BackoffPolicy;
use crate::config::Config;
use crate::constants::ENTRIES_COLLECTION;
use crate::store::{ListOptions, RecordStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherState {
    Disconnected,
    Connecting,
    Watching,
    /// Waiting `delay` before reconnect attempt `attempt`
    Backoff {
        attempt: u32,
        delay: Duration,
    },
    Stopped,
}

#[derive(Debug, Clone)]
pub struct WatchOptions {
    pub inbox: String,
    pub backoff: BackoffPolicy,
    pub idle_timeout: Duration,
    /// How far back to look when nothing has been mirrored yet
    pub default_window: chrono::Duration,
    /// Slack subtracted from the watermark before filtering on arrival time
    pub clock_skew_tolerance: chrono::Duration,
}

impl WatchOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            inbox: config.imap.inbox.clone(),
            backoff: config.watch.backoff_policy(),
            idle_timeout: config.watch.idle_timeout(),
            default_window: config.watch.default_window(),
            clock_skew_tolerance: config.watch.clock_skew_tolerance(),
        }
    }
}

impl Default for WatchOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Handle for controlling a running watcher.
pub struct WatcherHandle {
    shutdown_tx: mpsc::Sender<()>,
    state_rx: watch::Receiver<WatcherState>,
    report_rx: mpsc::Receiver<SyncReport>,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    pub fn state(&self) -> WatcherState {
        self.state_rx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<WatcherState> {
        self.state_rx.clone()
    }

    /// Report of the next completed pass. Reports are dropped, not queued
    /// without bound, when nobody reads them.
    pub async fn next_report(&mut self) -> Option<SyncReport> {
        self.report_rx.recv().await
    }

    /// Request shutdown and wait for the task to finish.
    pub async fn shutdown(self) {
        self.shutdown_tx.send(()).await.ok();
        if let Err(e) = self.task.await {
            tracing::error!("Watcher task ended abnormally: {}", e);
        }
    }
}

/// Spawn the watcher task.
pub fn spawn_inbox_watcher(
    connector: Arc<dyn MailboxConnector>,
    store: Arc<dyn RecordStore>,
    options: WatchOptions,
) -> WatcherHandle {
    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let (state_tx, state_rx) = watch::channel(WatcherState::Disconnected);
    let (report_tx, report_rx) = mpsc::channel(16);

    let task = tokio::spawn(
        Watcher {
            connector,
            store,
            options,
            state_tx,
            report_tx,
        }
        .run(shutdown_rx),
    );

    WatcherHandle {
        shutdown_tx,
        state_rx,
        report_rx,
        task,
    }
}

enum Exit {
    Shutdown,
    Failed(MailError),
}

struct Watcher {
    connector: Arc<dyn MailboxConnector>,
    store: Arc<dyn RecordStore>,
    options: WatchOptions,
    state_tx: watch::Sender<WatcherState>,
    report_tx: mpsc::Sender<SyncReport>,
}

impl Watcher {
    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) {
        let synchronizer = MailSynchronizer::new(self.store.clone());
        let mut failures = 0u32;

        loop {
            self.state_tx.send_replace(WatcherState::Connecting);

            let exit = tokio::select! {
                _ = shutdown_rx.recv() => Exit::Shutdown,
                connected = self.connector.connect() => match connected {
                    Ok(mut session) => {
                        let exit = self
                            .watch(session.as_mut(), &synchronizer, &mut shutdown_rx, &mut failures)
                            .await;
                        session.close().await;
                        exit
                    }
                    Err(e) => Exit::Failed(e),
                },
            };

            let error = match exit {
                Exit::Shutdown => break,
                Exit::Failed(e) => e,
            };

            failures = failures.saturating_add(1);
            let delay = self.options.backoff.delay_for(failures);
            tracing::error!(attempt = failures, "Inbox watch failed, retrying in {:?}: {}", delay, error);
            self.state_tx.send_replace(WatcherState::Backoff {
                attempt: failures,
                delay,
            });

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.state_tx.send_replace(WatcherState::Stopped);
        tracing::info!("Inbox watcher stopped");
    }

    async fn watch(
        &self,
        session: &mut dyn MailboxSession,
        synchronizer: &MailSynchronizer,
        shutdown_rx: &mut mpsc::Receiver<()>,
        failures: &mut u32,
    ) -> Exit {
        if let Err(e) = session.open_box(&self.options.inbox).await {
            return Exit::Failed(e);
        }
        self.state_tx.send_replace(WatcherState::Watching);
        *failures = 0;
        tracing::info!(mailbox = %self.options.inbox, "Watching for new mail");

        // Catch up on anything that arrived while disconnected.
        if let Err(e) = self.pass(session, synchronizer).await {
            return Exit::Failed(e);
        }

        loop {
            let event = tokio::select! {
                _ = shutdown_rx.recv() => return Exit::Shutdown,
                event = session.wait_for_mail(self.options.idle_timeout) => event,
            };

            match event {
                Ok(MailboxEvent::NewMail) => {
                    tracing::info!("New mail notification");
                    if let Err(e) = self.pass(session, synchronizer).await {
                        return Exit::Failed(e);
                    }
                }
                // Re-arm IDLE; servers drop long idles
                Ok(MailboxEvent::Timeout) => tracing::debug!("IDLE timeout, refreshing..."),
                Err(e) => return Exit::Failed(e),
            }
        }
    }

    async fn pass(
        &self,
        session: &mut dyn MailboxSession,
        synchronizer: &MailSynchronizer,
    ) -> Result<(), MailError> {
        let report = run_watermark_pass(
            session,
            self.store.as_ref(),
            synchronizer,
            &self.options,
        )
        .await?;
        if self.report_tx.try_send(report).is_err() {
            tracing::debug!("No reader for sync report");
        }
        Ok(())
    }
}

/// `date` of the most recently created entry.
pub async fn latest_entry_date(
    store: &dyn RecordStore,
) -> Result<Option<DateTime<Utc>>, MailError> {
    let options = ListOptions {
        skip_total: true,
        ..ListOptions::default().sorted("-created")
    };
    let page = store.get_list(ENTRIES_COLLECTION, 1, 1, &options).await?;
    Ok(page
        .items
        .first()
        .and_then(|entry| entry["date"].as_str())
        .and_then(parse_datetime))
}

/// Messages at or after `cutoff` by arrival time.
fn arrived_since(messages: Vec<RawMessage>, cutoff: DateTime<Utc>) -> Vec<RawMessage> {
    messages
        .into_iter()
        .filter(|m| m.internal_date.is_none_or(|date| date >= cutoff))
        .collect()
}

/// Sync everything in the open inbox that arrived since the watermark.
///
/// SEARCH SINCE only has day resolution, so the search starts a day before
/// the cutoff and hits are filtered on INTERNALDATE. Message-ID dedup keeps
/// the overlap harmless.
pub async fn run_watermark_pass(
    session: &mut dyn MailboxSession,
    store: &dyn RecordStore,
    synchronizer: &MailSynchronizer,
    options: &WatchOptions,
) -> Result<SyncReport, MailError> {
    let watermark = match latest_entry_date(store).await? {
        Some(date) => date,
        None => Utc::now() - options.default_window,
    };
    let cutoff = watermark - options.clock_skew_tolerance;
    let since = (cutoff - chrono::Duration::days(1)).date_naive();

    let hits = session
        .search(&SearchCriteria::Since(since), FetchOptions::full())
        .await?;
    let found = hits.len();
    let fresh = arrived_since(hits, cutoff);
    tracing::debug!(%watermark, %cutoff, found, fresh = fresh.len(), "Watermark pass");

    let report = synchronizer.sync(&fresh, &options.inbox).await?;
    if report.created > 0 {
        tracing::info!(created = report.created, "Synced new mail");
    }
    Ok(report)
}

/// Connect, run a single watermark pass over the inbox, disconnect.
pub async fn fetch_once(
    connector: &dyn MailboxConnector,
    store: Arc<dyn RecordStore>,
    options: &WatchOptions,
) -> Result<SyncReport, MailError> {
    let mut session = connector.connect().await?;
    let synchronizer = MailSynchronizer::new(store.clone());

    let result: Result<SyncReport, MailError> = async {
        session.open_box(&options.inbox).await?;
        run_watermark_pass(session.as_mut(), store.as_ref(), &synchronizer, options).await
    }
    .await;

    session.close().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mail::imap::fake::{FakeMailServer, rfc822};
    use crate::mail::types::MailEntry;
    use crate::store::decode_all;
    use crate::store::memory::InMemoryRecordStore;

    fn fast_options() -> WatchOptions {
        WatchOptions {
            backoff: BackoffPolicy::fixed(Duration::from_millis(10)),
            idle_timeout: Duration::from_millis(50),
            ..WatchOptions::default()
        }
    }

    async fn report_with_created(handle: &mut WatcherHandle) -> SyncReport {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let report = handle.next_report().await.unwrap();
                if report.created > 0 {
                    return report;
                }
            }
        })
        .await
        .unwrap()
    }

    fn subjects(store: &InMemoryRecordStore) -> Vec<String> {
        decode_all::<MailEntry>(store.records(ENTRIES_COLLECTION))
            .unwrap()
            .into_iter()
            .map(|e| e.subject)
            .collect()
    }

    #[tokio::test]
    async fn test_default_window_includes_recent_and_excludes_old() {
        let server = FakeMailServer::new();
        let now = Utc::now();
        server.append(
            "INBOX",
            rfc822("recent@x.com", "a@x.com", &[], "recent"),
            now - chrono::Duration::minutes(30),
        );
        server.append(
            "INBOX",
            rfc822("old@x.com", "a@x.com", &[], "old"),
            now - chrono::Duration::hours(2),
        );
        let store = Arc::new(InMemoryRecordStore::new());

        let mut handle = spawn_inbox_watcher(Arc::new(server.clone()), store.clone(), fast_options());
        let report = report_with_created(&mut handle).await;

        assert_eq!(report.created, 1);
        assert_eq!(subjects(&store), vec!["recent"]);

        handle.shutdown().await;
        assert_eq!(server.closes(), 1);
    }

    #[tokio::test]
    async fn test_new_mail_event_triggers_pass() {
        let server = FakeMailServer::new();
        let store = Arc::new(InMemoryRecordStore::new());
        let mut handle = spawn_inbox_watcher(Arc::new(server.clone()), store.clone(), fast_options());

        let mut state = handle.subscribe();
        state
            .wait_for(|s| *s == WatcherState::Watching)
            .await
            .unwrap();

        server.deliver(
            "INBOX",
            rfc822("fresh@x.com", "a@x.com", &[], "fresh"),
            Utc::now(),
        );
        report_with_created(&mut handle).await;
        assert_eq!(subjects(&store), vec!["fresh"]);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnects_after_connect_and_idle_errors() {
        let server = FakeMailServer::new();
        server.fail_connects(1);
        let store = Arc::new(InMemoryRecordStore::new());
        let mut handle = spawn_inbox_watcher(Arc::new(server.clone()), store.clone(), fast_options());

        let mut state = handle.subscribe();
        state
            .wait_for(|s| *s == WatcherState::Watching)
            .await
            .unwrap();
        assert_eq!(server.connects(), 2);

        server.break_next_wait();
        tokio::time::timeout(Duration::from_secs(5), async {
            while server.connects() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        server.deliver(
            "INBOX",
            rfc822("after@x.com", "a@x.com", &[], "after reconnect"),
            Utc::now(),
        );
        report_with_created(&mut handle).await;
        assert_eq!(subjects(&store), vec!["after reconnect"]);

        handle.shutdown().await;
        assert!(server.closes() >= 2);
    }

    #[tokio::test]
    async fn test_shutdown_during_backoff_stops() {
        let server = FakeMailServer::new();
        server.fail_connects(u32::MAX);
        let store = Arc::new(InMemoryRecordStore::new());
        let options = WatchOptions {
            backoff: BackoffPolicy::fixed(Duration::from_secs(3600)),
            ..fast_options()
        };
        let handle = spawn_inbox_watcher(Arc::new(server), store, options);

        let mut state = handle.subscribe();
        state
            .wait_for(|s| matches!(s, WatcherState::Backoff { attempt: 1, .. }))
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle.shutdown())
            .await
            .unwrap();
        assert_eq!(*state.borrow(), WatcherState::Stopped);
    }

    #[tokio::test]
    async fn test_watermark_uses_latest_entry() {
        let server = FakeMailServer::new();
        let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
        let now = Utc::now();

        // Seed one mirrored entry dated three hours ago.
        store
            .create(
                ENTRIES_COLLECTION,
                serde_json::json!({
                    "messageId": "seed@x.com",
                    "date": crate::mail::types::format_datetime(now - chrono::Duration::hours(3)),
                }),
            )
            .await
            .unwrap();
        server.append(
            "INBOX",
            rfc822("two-hours@x.com", "a@x.com", &[], "two hours"),
            now - chrono::Duration::hours(2),
        );
        server.append(
            "INBOX",
            rfc822("five-hours@x.com", "a@x.com", &[], "five hours"),
            now - chrono::Duration::hours(5),
        );

        let report = fetch_once(&server, store.clone(), &WatchOptions::default())
            .await
            .unwrap();
        assert_eq!(report.created, 1);
        assert_eq!(server.closes(), 1);
        assert!(latest_entry_date(store.as_ref()).await.unwrap().is_some());
    }
}
