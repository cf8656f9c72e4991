mod actor;
mod config;
mod constants;
mod credentials;
mod mail;
mod store;

use anyhow::{Context, Result};
use serde::Serialize;
use std::env;
use std::sync::Arc;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::mail::{
    ImapConnector, ImapSettings, LabelSelector, MailInbox, MailboxConnector, WatchOptions,
    WatcherState, spawn_inbox_watcher,
};
use crate::store::{PocketBaseStore, RecordStore};

fn setup_logging() {
    use std::fs::OpenOptions;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,inboxd=debug"));

    let log_file = Config::config_dir()
        .ok()
        .and_then(|dir| std::fs::create_dir_all(&dir).ok().map(|_| dir.join("inboxd.log")))
        .and_then(|path| {
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .ok()
        });

    if let Some(file) = log_file {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_usage() {
    eprintln!(
        r#"inboxd - Mirror an IMAP inbox into a PocketBase record store

Usage: inboxd [command] [args]

Commands:
    (none), watch           Watch the inbox and mirror new mail until Ctrl-C
    sync                    Run one catch-up pass and exit
    list [label] [page]     List entries (label: all, inbox, trash or a label id)
    read <id>               Show one entry and mark it seen
    labels                  List labels with their paths and counts
    import-labels           Create labels for every remote folder
    trash <id>...           Move entries to Trash
    purge <id>...           Permanently delete entries that are in Trash
    empty-trash             Permanently delete everything in Trash
    setup                   Configure the mailbox and store credentials
    help                    Show this help message

Environment:
    PB_HOST, PB_EMAIL, PB_PASSWORD     Record store location and superuser
    INBOXD_EMAIL                       Mailbox login
    INBOXD_IMAP_PASSWORD               Mailbox app password
    RUST_LOG                           Log filter (default: info,inboxd=debug)

Configuration file: ~/.config/inboxd/config.toml
"#
    );
}

/// Everything a command needs, wired from config and credentials.
struct Services {
    config: Config,
    store: Arc<dyn RecordStore>,
    connector: Option<Arc<dyn MailboxConnector>>,
}

impl Services {
    async fn load() -> Result<Self> {
        let config = Config::load()?;
        config.validate_store()?;

        let creds = CredentialStore::new(&config.account.email);
        let store_password = creds.store_password()?;
        let store = PocketBaseStore::connect(&config.store.url, &config.store.email, &store_password)
            .await
            .with_context(|| format!("Failed to connect to record store at {}", config.store.url))?;

        let connector = match ImapSettings::from_config(&config, creds.imap_password()) {
            Ok(settings) => {
                Some(Arc::new(ImapConnector::new(settings)) as Arc<dyn MailboxConnector>)
            }
            Err(e) => {
                tracing::warn!("{}", e);
                None
            }
        };

        Ok(Self {
            config,
            store: Arc::new(store),
            connector,
        })
    }

    fn inbox(&self) -> MailInbox {
        MailInbox::new(self.store.clone(), self.connector.clone(), &self.config.imap)
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_watch(ctx: Services) -> Result<()> {
    let connector = ctx
        .connector
        .clone()
        .context("IMAP access is not configured. Run 'inboxd setup' or set INBOXD_IMAP_PASSWORD.")?;

    let options = WatchOptions::from_config(&ctx.config);
    tracing::info!(inbox = %options.inbox, "Starting inbox watcher");
    let mut handle = spawn_inbox_watcher(connector, ctx.store.clone(), options);
    let mut states = handle.subscribe();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = states.borrow_and_update().clone();
                match state {
                    WatcherState::Backoff { attempt, delay } => {
                        eprintln!("Connection lost, retry {} in {}s", attempt, delay.as_secs());
                    }
                    WatcherState::Watching => eprintln!("Watching for new mail"),
                    _ => {}
                }
            }
            Some(report) = handle.next_report() => {
                if report.created > 0 {
                    eprintln!("Mirrored {} new message(s)", report.created);
                }
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

fn ids_from(args: &[String]) -> Result<Vec<String>> {
    if args.is_empty() {
        anyhow::bail!("Expected at least one entry id");
    }
    Ok(args.to_vec())
}

async fn run_command(cmd: &str, args: &[String]) -> Result<()> {
    let ctx = Services::load().await?;

    match cmd {
        "watch" => return run_watch(ctx).await,
        "sync" => {
            let options = WatchOptions::from_config(&ctx.config);
            print_json(&ctx.inbox().sync_once(&options).await?)?;
        }
        "list" => {
            let selector = LabelSelector::parse(args.first().map(String::as_str).unwrap_or("all"));
            let page = match args.get(1) {
                Some(p) => p.parse().with_context(|| format!("Invalid page number: {}", p))?,
                None => 1,
            };
            print_json(&ctx.inbox().list_entries(&selector, page).await?)?;
        }
        "read" => {
            let id = args.first().context("Usage: inboxd read <id>")?;
            print_json(&ctx.inbox().read_entry(id).await?)?;
        }
        "labels" => print_json(&ctx.inbox().list_labels().await?)?,
        "import-labels" => {
            let created = ctx.inbox().import_labels().await?;
            println!("Created {} label(s)", created);
        }
        "trash" => print_json(&ctx.inbox().move_to_trash(&ids_from(args)?).await?)?,
        "purge" => print_json(&ctx.inbox().delete_permanently(&ids_from(args)?).await?)?,
        "empty-trash" => print_json(&ctx.inbox().empty_trash().await?)?,
        other => anyhow::bail!("Unknown command: {}", other),
    }
    Ok(())
}

fn prompt(label: &str, default: Option<&str>) -> Result<String> {
    use std::io::{self, Write};

    loop {
        match default {
            Some(d) => print!("{} [{}]: ", label, d),
            None => print!("{}: ", label),
        }
        io::stdout().flush()?;
        let mut input = String::new();
        io::stdin().read_line(&mut input)?;
        let input = input.trim();
        match (input.is_empty(), default) {
            (false, _) => return Ok(input.to_string()),
            (true, Some(d)) => return Ok(d.to_string()),
            (true, None) => println!("A value is required."),
        }
    }
}

fn is_email(value: &str) -> bool {
    let parts: Vec<&str> = value.split('@').collect();
    parts.len() == 2
        && !parts[0].is_empty()
        && parts[1].contains('.')
        && !parts[1].starts_with('.')
        && !parts[1].ends_with('.')
}

async fn run_setup() -> Result<()> {
    use std::io::{self, Write};

    println!("inboxd Setup");
    println!("============\n");

    let config_path = Config::config_path()?;
    let mut config = if config_path.exists() {
        Config::load()?
    } else {
        Config::default()
    };

    let email = loop {
        let email = prompt("Mailbox address", non_empty(&config.account.email))?;
        if is_email(&email) {
            break email;
        }
        println!("Invalid email format. Please enter a valid email address (e.g., user@example.com)");
    };
    config.account.email = email.clone();
    config.imap.server = prompt("IMAP server", Some(config.imap.server.as_str()))?;
    config.store.url = prompt("Record store URL", non_empty(&config.store.url))?;
    config.store.email = prompt("Record store superuser email", non_empty(&config.store.email))?;

    print!("Mailbox app password: ");
    io::stdout().flush()?;
    let imap_password = read_password()?;
    println!();

    print!("Record store password: ");
    io::stdout().flush()?;
    let store_password = read_password()?;
    println!();

    config.save()?;
    println!("Configuration saved to {}", config_path.display());

    let creds = CredentialStore::new(&email);
    creds.set_imap_password(&imap_password)?;
    if let Err(e) = creds.set_store_password(&store_password) {
        eprintln!("Warning: {}", e);
    }

    if !creds.has_imap_password() {
        eprintln!("{}", creds.debug_info());
        anyhow::bail!("Credential storage failed");
    }

    println!("\nSetup complete! Run 'inboxd' to start watching.");
    Ok(())
}

fn non_empty(value: &str) -> Option<&str> {
    (!value.is_empty()).then_some(value)
}

fn read_password() -> Result<String> {
    let _guard = DisableEcho::new()?;

    let mut password = String::new();
    std::io::stdin().read_line(&mut password)?;
    Ok(password.trim().to_string())
}

struct DisableEcho {
    #[cfg(unix)]
    original: libc::termios,
}

impl DisableEcho {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use std::mem::MaybeUninit;
        use std::os::unix::io::AsRawFd;

        let fd = std::io::stdin().as_raw_fd();
        let mut termios = MaybeUninit::<libc::termios>::uninit();

        // SAFETY: tcgetattr initializes `termios` on success; fd is stdin.
        unsafe {
            if libc::tcgetattr(fd, termios.as_mut_ptr()) != 0 {
                anyhow::bail!("Failed to get terminal attributes");
            }
            let original = termios.assume_init();
            let mut silent = original;
            silent.c_lflag &= !libc::ECHO;
            if libc::tcsetattr(fd, libc::TCSANOW, &silent) != 0 {
                anyhow::bail!("Failed to set terminal attributes");
            }
            Ok(Self { original })
        }
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }
}

#[cfg(unix)]
impl Drop for DisableEcho {
    fn drop(&mut self) {
        use std::os::unix::io::AsRawFd;
        let fd = std::io::stdin().as_raw_fd();
        // SAFETY: restores attributes read from the same fd in `new`.
        unsafe {
            libc::tcsetattr(fd, libc::TCSANOW, &self.original);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = env::args().collect();
    let rest = args.get(2..).unwrap_or_default();

    match args.get(1).map(|s| s.as_str()) {
        Some("help") | Some("--help") | Some("-h") => {
            print_usage();
            Ok(())
        }
        Some("setup") => run_setup().await,
        None => {
            setup_logging();
            run_command("watch", rest).await
        }
        Some(
            cmd @ ("watch" | "sync" | "list" | "read" | "labels" | "import-labels" | "trash"
            | "purge" | "empty-trash"),
        ) => {
            setup_logging();
            run_command(cmd, rest).await
        }
        Some(cmd) => {
            eprintln!("Unknown command: {}", cmd);
            print_usage();
            std::process::exit(1);
        }
    }
}
