//! The Librarian: background watcher.
//!
//! Listens for filesystem events under the managed directories and, once
//! activity settles, asks the registry for a reconciliation pass. Also runs
//! the Incinerator on a fixed interval. Everything it does goes through the
//! public `Registry` API.

use crate::error::{MediaError, Result};
use crate::registry::Registry;
use crate::scanner::{is_managed_path, IGNORE_FILE};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const POLL: Duration = Duration::from_millis(50);
const FENCED_RETRY: Duration = Duration::from_secs(5);

pub struct Librarian {
    registry: Arc<Registry>,
    cancel: CancellationToken,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl Librarian {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry, cancel: CancellationToken::new(), thread_handle: None }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.thread_handle.is_some() {
            return Err(MediaError::State("librarian already running".into()));
        }
        let registry = Arc::clone(&self.registry);
        let cancel = self.cancel.clone();
        let handle = thread::Builder::new()
            .name("librarian".into())
            .spawn(move || Self::watcher_loop(registry, cancel))?;
        self.thread_handle = Some(handle);
        Ok(())
    }

    /// Stop the loop. An in-flight pass is cancelled before it commits.
    pub fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("[Librarian] Watcher thread panicked");
            }
        }
    }

    fn watcher_loop(registry: Arc<Registry>, cancel: CancellationToken) {
        let config = registry.config().clone();
        let roots = config.managed_dirs.clone();

        let (tx, rx) = mpsc::channel();
        // Keep the watcher alive for the whole loop.
        let _watcher = if config.librarian.watch {
            match Self::watch(&roots, tx) {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::error!("[Librarian] File watcher unavailable, relying on explicit passes: {}", e);
                    None
                }
            }
        } else {
            None
        };
        tracing::info!("[Librarian] Watching {} managed directories", roots.len());

        let debounce = Duration::from_millis(config.librarian.debounce_ms);
        let eviction_interval = Duration::from_secs(config.librarian.eviction_interval_secs);
        let mut pending = false;
        let mut last_activity = Instant::now();
        let mut last_eviction = Instant::now();
        // Deferred orphans need another look once their grace period is over.
        // A fenced registry (restored from backup) keeps retrying until a pass commits.
        let mut recheck_at: Option<Instant> =
            registry.state().is_write_fenced().then(Instant::now);

        while !cancel.is_cancelled() {
            match rx.recv_timeout(POLL) {
                Ok(Ok(event)) => {
                    if Self::is_relevant(&event, &roots) {
                        pending = true;
                        last_activity = Instant::now();
                    }
                }
                Ok(Err(e)) => tracing::warn!("[Librarian] Watch error: {}", e),
                Err(_) => {
                    let recheck_due = recheck_at.map_or(false, |at| Instant::now() >= at);
                    if (pending && last_activity.elapsed() >= debounce) || recheck_due {
                        pending = false;
                        recheck_at = None;
                        match registry.request_reconciliation_with(&cancel) {
                            Ok(report) if !report.deferred.is_empty() => {
                                recheck_at = Some(Instant::now() + config.orphan_grace() + debounce);
                            }
                            Ok(_) => {}
                            Err(MediaError::Cancelled) => break,
                            Err(e) => {
                                tracing::error!("[Librarian] Reconciliation failed: {}", e);
                                if registry.state().is_write_fenced() {
                                    recheck_at = Some(Instant::now() + FENCED_RETRY);
                                }
                            }
                        }
                    }

                    if !config.eviction.is_unbounded() && last_eviction.elapsed() >= eviction_interval {
                        tracing::debug!("[Librarian] Running periodic Incinerator check...");
                        if let Err(e) = registry.run_eviction_with(&config.eviction, &cancel) {
                            tracing::error!("[Librarian] Eviction failed: {}", e);
                        }
                        last_eviction = Instant::now();
                    }
                }
            }
        }
        tracing::info!("[Librarian] Stopped");
    }

    fn watch(roots: &[std::path::PathBuf], tx: mpsc::Sender<notify::Result<Event>>) -> notify::Result<RecommendedWatcher> {
        let mut watcher = RecommendedWatcher::new(tx, notify::Config::default())?;
        for root in roots {
            watcher.watch(root, RecursiveMode::Recursive)?;
        }
        Ok(watcher)
    }

    /// Creations, modifications and removals of managed files, plus edits to
    /// an ignore file (which change what is managed).
    fn is_relevant(event: &Event, roots: &[std::path::PathBuf]) -> bool {
        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
            return false;
        }
        event.paths.iter().any(|path| {
            is_ignore_file(path) || is_managed_path(roots, path)
        })
    }
}

impl Drop for Librarian {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_ignore_file(path: &Path) -> bool {
    path.file_name().map_or(false, |n| n == IGNORE_FILE)
}
