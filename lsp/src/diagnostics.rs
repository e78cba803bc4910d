//! Diagnostics store: accumulates per-file diagnostics pushed by a server.
//!
//! Each protocol client owns one store. Pushes replace a file's list
//! wholesale; an empty push is kept as an entry, recording that the server
//! analyzed the file and found nothing. Waiters block on a [`Notify`] with a
//! hard deadline instead of polling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use crate::types::Diagnostic;

pub(crate) struct DiagnosticsStore {
    data: Mutex<HashMap<PathBuf, Vec<Diagnostic>>>,
    changed: Notify,
}

impl DiagnosticsStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(HashMap::new()),
            changed: Notify::new(),
        }
    }

    /// Replace the diagnostics for `path` with the latest push and wake
    /// waiters. Empty pushes are stored, not dropped.
    pub async fn replace(&self, path: PathBuf, items: Vec<Diagnostic>) {
        self.data.lock().await.insert(path, items);
        self.changed.notify_waiters();
    }

    /// Diagnostics from the most recent push, or empty if the server has
    /// not reported on `path` yet.
    pub async fn get(&self, path: &Path) -> Vec<Diagnostic> {
        self.data.lock().await.get(path).cloned().unwrap_or_default()
    }

    /// Whether the server has pushed anything (even an empty list) for
    /// `path` since it was opened.
    #[cfg_attr(not(test), allow(dead_code))]
    pub async fn has_report(&self, path: &Path) -> bool {
        self.data.lock().await.contains_key(path)
    }

    /// Forget `path` entirely. Used on close and re-open so a stale report
    /// is never mistaken for one covering the new open.
    pub async fn clear(&self, path: &Path) {
        self.data.lock().await.remove(path);
    }

    /// Wait until the server has reported on `path`, up to `timeout`.
    /// Returns the reported list, or empty on deadline. Timing out is a
    /// degraded result, not an error.
    pub async fn wait_for(&self, path: &Path, timeout: Duration) -> Vec<Diagnostic> {
        let deadline = Instant::now() + timeout;
        loop {
            // Register before checking so a push between the check and the
            // await still wakes us.
            let notified = self.changed.notified();
            if let Some(items) = self.data.lock().await.get(path) {
                return items.clone();
            }
            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep_until(deadline) => return Vec::new(),
            }
        }
    }

    /// Every path with a report, for aggregation.
    pub async fn paths(&self) -> Vec<PathBuf> {
        self.data.lock().await.keys().cloned().collect()
    }

    /// All files with at least one diagnostic, files with errors first,
    /// then alphabetical.
    pub async fn snapshot(&self) -> Vec<(PathBuf, Vec<Diagnostic>)> {
        let mut files: Vec<(PathBuf, Vec<Diagnostic>)> = self
            .data
            .lock()
            .await
            .iter()
            .filter(|(_, items)| !items.is_empty())
            .map(|(path, items)| (path.clone(), items.clone()))
            .collect();

        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });
        files
    }
}
