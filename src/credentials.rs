//! Credential bootstrap
//!
//! An external registrar publishes the client identity obtained from the
//! identity provider to two shared-volume files. This module waits for
//! those files at startup, installs their content into the exchange
//! configuration snapshot, and optionally keeps watching for rewrites.
//!
//! Readers of the snapshot copy the value out under a shared lock so the
//! request path never holds the lock across a network call.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::{Mutex, RwLock};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::config::FilterConfig;
use crate::{Error, Result};

/// Interval between credential file polls during startup
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// The parameters needed to mint a new token via RFC 8693 exchange
///
/// Either fully populated (all five fields non-empty, exchange is
/// attempted) or incomplete (outbound requests pass through with their
/// original Authorization header).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExchangeConfig {
    /// OAuth client id (typically the workload's SPIFFE ID)
    pub client_id: String,
    /// OAuth client secret
    pub client_secret: String,
    /// Token endpoint URL
    pub token_url: String,
    /// Default audience for exchanged tokens
    pub target_audience: String,
    /// Default scopes for exchanged tokens
    pub target_scopes: String,
}

impl ExchangeConfig {
    /// Whether every field needed for token exchange is present
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.client_id.is_empty()
            && !self.client_secret.is_empty()
            && !self.token_url.is_empty()
            && !self.target_audience.is_empty()
            && !self.target_scopes.is_empty()
    }
}

/// Thread-safe holder of the current exchange configuration
///
/// Writers swap the whole value under the write lock; readers copy it out,
/// so they are never blocked for longer than the write itself.
#[derive(Debug, Default)]
pub struct CredentialStore {
    current: RwLock<ExchangeConfig>,
}

impl CredentialStore {
    /// Create a store seeded with the bootstrap configuration
    #[must_use]
    pub fn new(initial: ExchangeConfig) -> Self {
        Self {
            current: RwLock::new(initial),
        }
    }

    /// Copy out the current configuration
    #[must_use]
    pub fn snapshot(&self) -> ExchangeConfig {
        self.current.read().clone()
    }

    /// Atomically replace the whole configuration
    pub fn install(&self, config: ExchangeConfig) {
        *self.current.write() = config;
    }

    /// Replace only the client identity, keeping endpoint and targets
    pub fn update_credentials(&self, client_id: String, client_secret: String) {
        let mut current = self.current.write();
        current.client_id = client_id;
        current.client_secret = client_secret;
    }
}

/// Poll until both credential files are readable and non-empty
///
/// Returns `true` when the files became ready within `deadline`, `false`
/// on timeout. Timing out is not fatal: the caller falls back to
/// environment credentials or runs in passthrough mode.
pub async fn wait_for_files(
    client_id_file: &Path,
    client_secret_file: &Path,
    deadline: Duration,
) -> bool {
    info!(
        client_id_file = %client_id_file.display(),
        client_secret_file = %client_secret_file.display(),
        deadline_secs = deadline.as_secs(),
        "Waiting for credential files"
    );

    let started = Instant::now();
    loop {
        if read_trimmed(client_id_file).is_some() && read_trimmed(client_secret_file).is_some() {
            info!("Credential files are ready");
            return true;
        }
        if started.elapsed() >= deadline {
            warn!("Timed out waiting for credentials, falling back to environment variables");
            return false;
        }
        debug!("Credentials not ready yet, waiting");
        sleep(POLL_INTERVAL).await;
    }
}

/// Build the initial exchange configuration snapshot
///
/// Credential files are preferred over the `CLIENT_ID` / `CLIENT_SECRET`
/// environment fallbacks; file content is whitespace-trimmed.
#[must_use]
pub fn bootstrap(config: &FilterConfig) -> ExchangeConfig {
    let client_id = match read_trimmed(&config.client_id_file) {
        Some(value) => {
            info!(file = %config.client_id_file.display(), "Loaded client id from file");
            value
        }
        None => {
            if !config.client_id.is_empty() {
                info!("Using client id from environment");
            }
            config.client_id.clone()
        }
    };

    let client_secret = match read_trimmed(&config.client_secret_file) {
        Some(value) => {
            info!(file = %config.client_secret_file.display(), "Loaded client secret from file");
            value
        }
        None => {
            if !config.client_secret.is_empty() {
                info!("Using client secret from environment");
            }
            config.client_secret.clone()
        }
    };

    ExchangeConfig {
        client_id,
        client_secret,
        token_url: config.token_url.clone(),
        target_audience: config.target_audience.clone(),
        target_scopes: config.target_scopes.clone(),
    }
}

/// File watcher that re-reads the credential files when the registrar
/// rewrites them
///
/// Holds the underlying `notify` watcher alive for the lifetime of the
/// struct.
pub struct CredentialWatcher {
    /// Kept alive to prevent the OS watcher from being dropped
    _watcher: Mutex<Option<RecommendedWatcher>>,
}

impl CredentialWatcher {
    /// Start watching the credential files
    ///
    /// Spawns a debounced background task that re-reads both files and
    /// swaps the store's client identity whenever both are present and
    /// non-empty.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying `notify` watcher cannot be
    /// created or the shared directory cannot be watched.
    pub fn start(
        client_id_file: PathBuf,
        client_secret_file: PathBuf,
        store: Arc<CredentialStore>,
    ) -> Result<Self> {
        let (event_tx, mut event_rx) = tokio::sync::mpsc::channel(32);

        let watch_dir = client_id_file
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let id_path = client_id_file.clone();
        let secret_path = client_secret_file.clone();

        let mut watcher = RecommendedWatcher::new(
            move |result: std::result::Result<Event, notify::Error>| {
                let is_relevant = result
                    .as_ref()
                    .is_ok_and(|e| is_credential_event(e, &id_path, &secret_path));
                if is_relevant {
                    let _ = event_tx.try_send(());
                }
            },
            NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
        )
        .map_err(|e| Error::Config(format!("Failed to create credential watcher: {e}")))?;

        watcher
            .watch(&watch_dir, RecursiveMode::NonRecursive)
            .map_err(|e| Error::Config(format!("Failed to watch credential directory: {e}")))?;

        tokio::spawn(async move {
            const DEBOUNCE: Duration = Duration::from_millis(500);
            while event_rx.recv().await.is_some() {
                sleep(DEBOUNCE).await;
                // Collapse the burst of events a single rewrite produces
                while event_rx.try_recv().is_ok() {}
                reload_once(&client_id_file, &client_secret_file, &store);
            }
        });

        Ok(Self {
            _watcher: Mutex::new(Some(watcher)),
        })
    }
}

/// Returns `true` for create/modify events touching either credential file
fn is_credential_event(event: &Event, id_path: &Path, secret_path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| p == id_path || p == secret_path)
}

/// Re-read both files and swap the snapshot when both are populated
fn reload_once(client_id_file: &Path, client_secret_file: &Path, store: &CredentialStore) {
    match (read_trimmed(client_id_file), read_trimmed(client_secret_file)) {
        (Some(client_id), Some(client_secret)) => {
            info!("Credential files changed, snapshot updated");
            store.update_credentials(client_id, client_secret);
        }
        _ => debug!("Credential files incomplete, keeping current snapshot"),
    }
}

/// Read a file, trimming surrounding whitespace
///
/// Returns `None` when the file is missing, unreadable, or blank.
fn read_trimmed(path: &Path) -> Option<String> {
    let content = std::fs::read_to_string(path).ok()?;
    let trimmed = content.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
