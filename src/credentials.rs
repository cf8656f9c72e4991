use anyhow::Result;
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

const KEYRING_SERVICE: &str = "inboxd";
const ENV_IMAP_PASSWORD: &str = "INBOXD_IMAP_PASSWORD";
const ENV_STORE_PASSWORD: &str = "PB_PASSWORD";

/// Debug information about credential storage backends
#[derive(Debug, Clone)]
pub struct CredentialDebugInfo {
    pub keyring_available: bool,
    pub imap_env_set: bool,
    pub store_env_set: bool,
    pub file_path: PathBuf,
    pub file_exists: bool,
}

impl std::fmt::Display for CredentialDebugInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set = |b: bool| if b { "set" } else { "not set" };
        writeln!(f, "Credential Storage Status:")?;
        writeln!(
            f,
            "  Keyring: {}",
            if self.keyring_available {
                "available"
            } else {
                "unavailable"
            }
        )?;
        writeln!(f, "  {}: {}", ENV_IMAP_PASSWORD, set(self.imap_env_set))?;
        writeln!(f, "  {}: {}", ENV_STORE_PASSWORD, set(self.store_env_set))?;
        writeln!(f, "  File fallback: {}", self.file_path.display())?;
        writeln!(f, "  File exists: {}", self.file_exists)?;
        Ok(())
    }
}

/// Secrets for one mailbox: the IMAP app password and the record store
/// superuser password.
///
/// Lookup order is environment, then OS keyring, then (IMAP only) a
/// `0600` file in the config directory.
pub struct CredentialStore {
    email: String,
    password_file: PathBuf,
}

impl CredentialStore {
    pub fn new(email: &str) -> Self {
        let safe_email = email.replace(['@', '.', '/', '\\', ':'], "_");
        let password_file = crate::config::Config::config_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(format!(".password_{}", safe_email));

        Self {
            email: email.to_string(),
            password_file,
        }
    }

    pub fn debug_info(&self) -> CredentialDebugInfo {
        let test_key = format!("test:{}", self.email);
        let keyring_available = if let Ok(entry) = keyring::Entry::new(KEYRING_SERVICE, &test_key)
        {
            entry.set_password("__test__").is_ok()
                && entry.get_password().is_ok()
                && entry.delete_credential().is_ok()
        } else {
            false
        };

        CredentialDebugInfo {
            keyring_available,
            imap_env_set: env_var(ENV_IMAP_PASSWORD).is_some(),
            store_env_set: env_var(ENV_STORE_PASSWORD).is_some(),
            file_path: self.password_file.clone(),
            file_exists: self.password_file.exists(),
        }
    }

    fn imap_key(&self) -> String {
        format!("imap:{}", self.email)
    }

    fn store_key(&self) -> String {
        format!("store:{}", self.email)
    }

    fn keyring_get(&self, key: &str) -> Option<String> {
        let entry = keyring::Entry::new(KEYRING_SERVICE, key).ok()?;
        entry.get_password().ok()
    }

    fn keyring_set(&self, key: &str, password: &str) -> bool {
        keyring::Entry::new(KEYRING_SERVICE, key)
            .and_then(|entry| entry.set_password(password))
            .is_ok()
            && self.keyring_get(key).as_deref() == Some(password)
    }

    fn file_get(&self) -> Option<String> {
        fs::read_to_string(&self.password_file)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    }

    /// Write the fallback file with restricted permissions.
    fn file_set(&self, password: &str) -> Result<()> {
        if let Some(parent) = self.password_file.parent() {
            fs::create_dir_all(parent)?;
        }

        // Created with its final mode so the secret is never world-readable.
        #[cfg(unix)]
        {
            let mut file = fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&self.password_file)?;
            file.write_all(password.as_bytes())?;
        }

        #[cfg(not(unix))]
        {
            fs::write(&self.password_file, password)?;
        }

        Ok(())
    }

    /// The IMAP app password, or `None` when it is not stored anywhere.
    pub fn imap_password(&self) -> Option<String> {
        self.imap_password_with(env_var)
    }

    fn imap_password_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Option<String> {
        lookup(ENV_IMAP_PASSWORD)
            .or_else(|| self.keyring_get(&self.imap_key()))
            .or_else(|| self.file_get())
    }

    /// The record store superuser password.
    pub fn store_password(&self) -> Result<String> {
        self.store_password_with(env_var)
    }

    fn store_password_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<String> {
        if let Some(pwd) = lookup(ENV_STORE_PASSWORD) {
            return Ok(pwd);
        }
        if let Some(pwd) = self.keyring_get(&self.store_key()) {
            return Ok(pwd);
        }
        anyhow::bail!(
            "Record store password not found. Set {} or run 'inboxd setup'.",
            ENV_STORE_PASSWORD
        )
    }

    pub fn set_imap_password(&self, password: &str) -> Result<()> {
        if self.keyring_set(&self.imap_key(), password) {
            return Ok(());
        }
        eprintln!("Note: Keyring unavailable, using file-based storage.");
        self.file_set(password)
    }

    pub fn set_store_password(&self, password: &str) -> Result<()> {
        if self.keyring_set(&self.store_key(), password) {
            return Ok(());
        }
        anyhow::bail!(
            "Keyring unavailable; export {} instead",
            ENV_STORE_PASSWORD
        )
    }

    pub fn has_imap_password(&self) -> bool {
        self.imap_password().is_some()
    }
}

fn env_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.is_empty())
}
