//! LspManager facade: the public API the rest of the system consumes.
//!
//! Clients are keyed by `(workspace root, server id)` and spawned lazily on
//! the first file that needs the pair. Concurrent requests for the same
//! client or the same file analysis are de-duplicated (single flight), so
//! two racing callers never spawn two processes or run two analyses. The
//! leader of a flight owns its map entry; a leader cancelled mid-work closes
//! the channel, and waiters take over instead of blocking.
//!
//! Removal from the client map is the state transition for death; a dead
//! client's entry disappears when its stop event is polled.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::hash::Hash;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};

use crate::client::ProtocolClient;
use crate::insights;
use crate::registry::{ServerDefinition, ServerRegistry};
use crate::types::{
    ClientKey, CompletionItem, Diagnostic, DiagnosticTally, FileContext, Hover, LspEvent,
    StopReason, Symbol, SymbolTally, WorkspaceInsights,
};
use crate::workspace;

/// Channel capacity for events flowing from client tasks to the manager.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// How long an analysis waits for the first diagnostics push after opening
/// a file. Bounded; expiry degrades to "no diagnostics yet".
const DIAGNOSTICS_WAIT: Duration = Duration::from_secs(2);

/// Absolute, lexically normalized form of `path`. `std::path::absolute`
/// keeps `..` components, but diagnostics come back keyed by the normalized
/// paths in server URIs, so map keys must be normalized the same way.
fn absolute(path: &Path) -> PathBuf {
    let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    workspace::normalize_path(&path)
}

/// Leader-owned handle on one single-flight entry.
///
/// The map entry holds the only sender for the flight's channel. Dropping
/// the handle without [`complete`](Self::complete) removes the entry and
/// closes the channel, so followers of an abandoned flight wake with a
/// closed-channel error instead of waiting forever.
struct Flight<'a, K: Eq + Hash, T> {
    entries: &'a StdMutex<HashMap<K, broadcast::Sender<T>>>,
    key: K,
}

enum FlightRole<'a, K: Eq + Hash, T> {
    Leader(Flight<'a, K, T>),
    Follower(broadcast::Receiver<T>),
}

impl<'a, K: Eq + Hash + Clone, T: Clone> Flight<'a, K, T> {
    /// Become the leader for `key`, or subscribe to the flight already in
    /// progress.
    fn join(
        entries: &'a StdMutex<HashMap<K, broadcast::Sender<T>>>,
        key: &K,
    ) -> FlightRole<'a, K, T> {
        let mut map = entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(tx) = map.get(key) {
            return FlightRole::Follower(tx.subscribe());
        }
        let (tx, _rx) = broadcast::channel(1);
        map.insert(key.clone(), tx);
        FlightRole::Leader(Self {
            entries,
            key: key.clone(),
        })
    }

    /// Publish the leader's result to current followers and retire the
    /// entry.
    fn complete(&self, value: T) {
        let tx = self
            .entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&self.key);
        if let Some(tx) = tx {
            let _ = tx.send(value);
        }
    }
}

impl<K: Eq + Hash, T> Drop for Flight<'_, K, T> {
    fn drop(&mut self) {
        self.entries
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&self.key);
    }
}

/// Multiplexer over per-workspace protocol clients.
///
/// An explicit service object: construct one, pass it around, call
/// [`shutdown`](Self::shutdown) when done. All methods take `&self`; share
/// it behind an `Arc` for concurrent use.
pub struct LspManager {
    registry: ServerRegistry,
    clients: RwLock<HashMap<ClientKey, Arc<ProtocolClient>>>,
    roots: RwLock<BTreeSet<PathBuf>>,
    contexts: RwLock<HashMap<PathBuf, FileContext>>,
    /// Server ids that failed availability; warned once, then skipped.
    unavailable: Mutex<HashSet<String>>,
    /// Flight maps are behind sync mutexes: a [`Flight`]'s `Drop` must be
    /// able to remove its entry, and nothing holds these across an await.
    spawn_flights: StdMutex<HashMap<ClientKey, broadcast::Sender<Result<(), String>>>>,
    analysis_flights: StdMutex<HashMap<PathBuf, broadcast::Sender<FileContext>>>,
    event_tx: mpsc::Sender<LspEvent>,
    event_rx: Mutex<mpsc::Receiver<LspEvent>>,
}

impl LspManager {
    /// Build a manager over `registry`. No servers spawn until a file
    /// needs one.
    #[must_use]
    pub fn new(registry: ServerRegistry) -> Self {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            registry,
            clients: RwLock::new(HashMap::new()),
            roots: RwLock::new(BTreeSet::new()),
            contexts: RwLock::new(HashMap::new()),
            unavailable: Mutex::new(HashSet::new()),
            spawn_flights: StdMutex::new(HashMap::new()),
            analysis_flights: StdMutex::new(HashMap::new()),
            event_tx,
            event_rx: Mutex::new(event_rx),
        }
    }

    #[must_use]
    pub fn registry(&self) -> &ServerRegistry {
        &self.registry
    }

    /// One ready client per applicable server for `path`, spawning and
    /// handshaking as needed. Servers that cannot be obtained are skipped;
    /// an empty result means "no LSP support available", not an error.
    pub async fn clients_for_file(&self, path: &Path) -> Vec<Arc<ProtocolClient>> {
        let path = absolute(path);
        let mut clients = Vec::new();
        for def in self.registry.applicable_servers(&path) {
            if self.unavailable.lock().await.contains(def.id()) {
                tracing::debug!("Skipping unavailable LSP server '{}'", def.id());
                continue;
            }
            let markers: Vec<&str> = def.root_markers().iter().map(String::as_str).collect();
            let root = workspace::resolve_workspace_root_or_parent(&path, &markers);
            match self.obtain_client(def, root).await {
                Ok(client) => clients.push(client),
                Err(e) => {
                    tracing::warn!(
                        "No LSP client for {} via '{}': {e:#}",
                        path.display(),
                        def.id()
                    );
                }
            }
        }
        clients
    }

    /// Reuse or spawn the client for `(root, definition)`. Concurrent
    /// callers for the same key share one spawn attempt; a waiter whose
    /// leader was cancelled takes over on its next pass.
    async fn obtain_client(
        &self,
        def: &ServerDefinition,
        root: PathBuf,
    ) -> anyhow::Result<Arc<ProtocolClient>> {
        let key = ClientKey::new(root, def.id());
        loop {
            if let Some(client) = self.clients.read().await.get(&key) {
                return Ok(Arc::clone(client));
            }
            match Flight::join(&self.spawn_flights, &key) {
                FlightRole::Follower(mut rx) => match rx.recv().await {
                    // Spawned; the next pass picks it out of the map.
                    Ok(Ok(())) => {}
                    Ok(Err(message)) => return Err(anyhow::anyhow!(message)),
                    // Leader dropped without a verdict; take over.
                    Err(_) => {}
                },
                FlightRole::Leader(flight) => {
                    // A prior leader may have landed the client between the
                    // map check and the flight claim.
                    if let Some(client) = self.clients.read().await.get(&key) {
                        flight.complete(Ok(()));
                        return Ok(Arc::clone(client));
                    }
                    let result = self.spawn_client(def, &key).await;
                    match &result {
                        Ok(_) => flight.complete(Ok(())),
                        Err(e) => flight.complete(Err(format!("{e:#}"))),
                    }
                    return result;
                }
            }
        }
    }

    async fn spawn_client(
        &self,
        def: &ServerDefinition,
        key: &ClientKey,
    ) -> anyhow::Result<Arc<ProtocolClient>> {
        if let Err(e) = def.ensure_available().await {
            // Warn once; later files just skip this server quietly.
            self.unavailable.lock().await.insert(def.id().to_string());
            tracing::warn!("LSP server '{}' is unavailable: {e:#}", def.id());
            return Err(e);
        }

        tracing::info!(
            "Starting LSP server '{}' for {}",
            def.id(),
            key.root().display()
        );
        let client = ProtocolClient::spawn(def, key.clone(), self.event_tx.clone()).await?;
        client.initialize().await?;
        let client = Arc::new(client);

        self.clients
            .write()
            .await
            .insert(key.clone(), Arc::clone(&client));
        self.roots.write().await.insert(key.root().to_path_buf());
        Ok(client)
    }

    /// Analyze `path`: open it on every applicable client, wait briefly for
    /// diagnostics, collect document symbols, and cache the result by path.
    /// Never fails; a file with no usable server yields an empty context.
    ///
    /// The cache has no staleness check. Call
    /// [`invalidate_file`](Self::invalidate_file) after editing a file.
    pub async fn analyze_file(&self, path: &Path) -> FileContext {
        let path = absolute(path);
        loop {
            if let Some(ctx) = self.contexts.read().await.get(&path) {
                return ctx.clone();
            }
            match Flight::join(&self.analysis_flights, &path) {
                FlightRole::Follower(mut rx) => {
                    if let Ok(ctx) = rx.recv().await {
                        return ctx;
                    }
                    // Leader dropped without delivering; take over.
                }
                FlightRole::Leader(flight) => {
                    if let Some(ctx) = self.contexts.read().await.get(&path) {
                        let ctx = ctx.clone();
                        flight.complete(ctx.clone());
                        return ctx;
                    }
                    let ctx = self.analyze_uncached(&path).await;
                    flight.complete(ctx.clone());
                    return ctx;
                }
            }
        }
    }

    async fn analyze_uncached(&self, path: &Path) -> FileContext {
        let mut language = self
            .registry
            .applicable_servers(path)
            .first()
            .map(|def| def.language_id_for(path).to_string());
        let mut symbols = Vec::new();
        let mut diagnostics = Vec::new();
        let mut root = None;

        for client in self.clients_for_file(path).await {
            if !client.is_open(path).await
                && let Err(e) = client.open_file(path).await
            {
                tracing::warn!(
                    "Failed to open {} on '{}': {e:#}",
                    path.display(),
                    client.key().server_id()
                );
                continue;
            }
            diagnostics.extend(client.wait_for_diagnostics(path, DIAGNOSTICS_WAIT).await);
            symbols.extend(client.document_symbols(path).await);
            language = Some(client.server_definition().language_id_for(path).to_string());
            root = Some(client.key().root().to_path_buf());
        }

        let root = root.unwrap_or_else(|| {
            let markers = self.registry.all_root_markers();
            workspace::resolve_workspace_root_or_parent(path, &markers)
        });

        let ctx = FileContext::new(path.to_path_buf(), language, symbols, diagnostics, root);
        self.contexts
            .write()
            .await
            .insert(path.to_path_buf(), ctx.clone());
        ctx
    }

    /// Drop the cached analysis for `path`, forcing the next
    /// [`analyze_file`](Self::analyze_file) to recompute.
    pub async fn invalidate_file(&self, path: &Path) {
        self.contexts.write().await.remove(&absolute(path));
    }

    /// Aggregate report over every client whose workspace root is `root` or
    /// sits beneath it.
    pub async fn workspace_insights(&self, root: &Path) -> WorkspaceInsights {
        let root = absolute(root);
        let clients: Vec<Arc<ProtocolClient>> = self
            .clients
            .read()
            .await
            .iter()
            .filter(|(key, _)| key.under_root(&root))
            .map(|(_, client)| Arc::clone(client))
            .collect();

        let mut files: BTreeSet<PathBuf> = BTreeSet::new();
        let mut languages: BTreeMap<String, usize> = BTreeMap::new();
        let mut diagnostics = DiagnosticTally::default();
        let mut errors_by_language: BTreeMap<String, usize> = BTreeMap::new();

        for client in &clients {
            for path in client.open_paths().await {
                *languages
                    .entry(client.server_definition().language_id_for(&path).to_string())
                    .or_insert(0) += 1;
                files.insert(path);
            }
            for (path, items) in client.store().snapshot().await {
                let language = client.server_definition().language_id_for(&path).to_string();
                for diag in items {
                    diagnostics.record(diag.severity());
                    if diag.severity().is_error() {
                        *errors_by_language.entry(language.clone()).or_insert(0) += 1;
                    }
                }
            }
        }

        let mut symbols = SymbolTally::default();
        for ctx in self.contexts.read().await.values() {
            if ctx.workspace_root().starts_with(&root) {
                for symbol in ctx.symbols() {
                    symbols.record(symbol.kind());
                }
            }
        }

        let problems = insights::derive_problems(&diagnostics, files.len());
        let suggestions = insights::derive_suggestions(&errors_by_language);
        WorkspaceInsights {
            frameworks: insights::detect_frameworks(&root),
            root,
            files_analyzed: files.len(),
            languages,
            diagnostics,
            symbols,
            problems,
            suggestions,
        }
    }

    /// Fan a symbol search out to every client, optionally scoped to one
    /// workspace root, and merge the results.
    pub async fn search_symbols(&self, query: &str, root: Option<&Path>) -> Vec<Symbol> {
        let root = root.map(absolute);
        let clients: Vec<Arc<ProtocolClient>> = self
            .clients
            .read()
            .await
            .iter()
            .filter(|(key, _)| root.as_deref().is_none_or(|r| key.under_root(r)))
            .map(|(_, client)| Arc::clone(client))
            .collect();

        let results = join_all(clients.iter().map(|c| c.workspace_symbols(query))).await;
        results.into_iter().flatten().collect()
    }

    /// Hover text at a position, from the first client that has any.
    /// Opens the file on its clients if it is not open yet.
    pub async fn hover_info(&self, path: &Path, line: u32, character: u32) -> Option<Hover> {
        let path = absolute(path);
        let position = crate::types::Position::new(line, character);
        for client in self.clients_for_file(&path).await {
            if !client.is_open(&path).await && client.open_file(&path).await.is_err() {
                continue;
            }
            if let Some(hover) = client.hover(&path, position).await {
                return Some(hover);
            }
        }
        None
    }

    /// Completion items at a position, merged across applicable clients.
    pub async fn completions(&self, path: &Path, line: u32, character: u32) -> Vec<CompletionItem> {
        let path = absolute(path);
        let position = crate::types::Position::new(line, character);
        let mut items = Vec::new();
        for client in self.clients_for_file(&path).await {
            if !client.is_open(&path).await && client.open_file(&path).await.is_err() {
                continue;
            }
            items.extend(client.completions(&path, position).await);
        }
        items
    }

    /// Whether any tracked file currently has an error diagnostic.
    pub async fn has_errors(&self) -> bool {
        for client in self.clients.read().await.values() {
            for (_, items) in client.store().snapshot().await {
                if items.iter().any(|d| d.severity().is_error()) {
                    return true;
                }
            }
        }
        false
    }

    /// Total error diagnostics across all clients.
    pub async fn error_count(&self) -> usize {
        let mut count = 0;
        for client in self.clients.read().await.values() {
            for (_, items) in client.store().snapshot().await {
                count += items.iter().filter(|d| d.severity().is_error()).count();
            }
        }
        count
    }

    /// Every file with diagnostics across all clients, files with errors
    /// first, then alphabetical.
    pub async fn all_diagnostics(&self) -> Vec<(PathBuf, Vec<Diagnostic>)> {
        let mut files = Vec::new();
        for client in self.clients.read().await.values() {
            files.extend(client.store().snapshot().await);
        }
        files.sort_by(|a, b| {
            let a_has_errors = a.1.iter().any(|d| d.severity().is_error());
            let b_has_errors = b.1.iter().any(|d| d.severity().is_error());
            b_has_errors.cmp(&a_has_errors).then_with(|| a.0.cmp(&b.0))
        });
        files
    }

    /// Workspace roots with at least one client, past or present.
    pub async fn workspace_roots(&self) -> Vec<PathBuf> {
        self.roots.read().await.iter().cloned().collect()
    }

    /// Drain up to `budget` pending events, reacting to client deaths by
    /// dropping their map entries, and hand the events to the caller.
    /// Non-blocking; returns immediately when the channel is empty.
    pub async fn poll_events(&self, budget: usize) -> Vec<LspEvent> {
        let mut event_rx = self.event_rx.lock().await;
        let mut events = Vec::new();
        while events.len() < budget {
            match event_rx.try_recv() {
                Ok(event) => {
                    self.handle_event(&event).await;
                    events.push(event);
                }
                Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {
                    break;
                }
            }
        }
        events
    }

    async fn handle_event(&self, event: &LspEvent) {
        match event {
            LspEvent::ClientStopped { key, reason } => {
                match reason {
                    StopReason::Exited => {
                        tracing::info!("LSP client '{key}' exited");
                    }
                    StopReason::Failed(message) => {
                        tracing::warn!("LSP client '{key}' failed: {message}");
                    }
                }
                // Removal is the death transition; kill_on_drop covers the
                // process if it is somehow still alive.
                self.clients.write().await.remove(key);
            }
            LspEvent::Diagnostics { path, items, .. } => {
                tracing::debug!(
                    "Diagnostics updated for {}: {} item(s)",
                    path.display(),
                    items.len()
                );
            }
        }
    }

    /// Shut down every client in parallel, tolerating individual failures,
    /// then clear all tracking state. Safe to call more than once.
    pub async fn shutdown(&self) {
        let clients: Vec<(ClientKey, Arc<ProtocolClient>)> =
            self.clients.write().await.drain().collect();
        join_all(clients.iter().map(|(key, client)| async move {
            tracing::info!("Shutting down LSP client '{key}'");
            client.shutdown().await;
        }))
        .await;
        self.roots.write().await.clear();
        self.contexts.write().await.clear();
    }

    #[cfg(test)]
    pub(crate) fn event_sender(&self) -> &mpsc::Sender<LspEvent> {
        &self.event_tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeLspServer, ServerLog};
    use std::fs;

    fn rust_definition() -> ServerDefinition {
        ServerDefinition::new(
            "rust",
            "rust-analyzer",
            "rust",
            &["rs"],
            &["Cargo.toml"],
            "rust-analyzer",
            &[],
        )
    }

    fn test_registry() -> ServerRegistry {
        ServerRegistry::builtin()
    }

    fn error_diag_json() -> serde_json::Value {
        serde_json::json!({
            "range": { "start": { "line": 2, "character": 4 }, "end": { "line": 2, "character": 9 } },
            "severity": 1,
            "source": "rustc",
            "message": "cannot find value `x`"
        })
    }

    fn warning_diag_json(line: u32) -> serde_json::Value {
        serde_json::json!({
            "range": { "start": { "line": line, "character": 0 }, "end": { "line": line, "character": 3 } },
            "severity": 2,
            "source": "rustc",
            "message": "unused variable"
        })
    }

    /// Put a duplex-backed client into the manager's map, as if it had been
    /// spawned for `root`.
    async fn inject_client(
        manager: &LspManager,
        fake: FakeLspServer,
        root: &Path,
        def: &ServerDefinition,
    ) -> Arc<ProtocolClient> {
        let (client_io, _task) = fake.start();
        let (read_half, write_half) = tokio::io::split(client_io);
        let key = ClientKey::new(root.to_path_buf(), def.id());
        let client = Arc::new(ProtocolClient::from_transport(
            def.clone(),
            key.clone(),
            manager.event_sender().clone(),
            read_half,
            write_half,
        ));
        client.initialize().await.unwrap();
        manager
            .clients
            .write()
            .await
            .insert(key, Arc::clone(&client));
        manager.roots.write().await.insert(root.to_path_buf());
        client
    }

    fn workspace_with_marker() -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("Cargo.toml"), "[package]").unwrap();
        let file = tmp.path().join("main.rs");
        fs::write(&file, "fn main() { x }\n").unwrap();
        let root = tmp.path().to_path_buf();
        (tmp, root.join("main.rs"))
    }

    /// Wait until the fake's log satisfies `check`. Parks on a short timer
    /// instead of spinning on `yield_now`: the traffic being awaited passes
    /// through `spawn_blocking` (the file read in `open_file`), which
    /// inhibits paused-time auto-advance, so the sleep hands real CPU time
    /// to the blocking pool that a yield spin would starve on one core.
    async fn wait_for_log<F>(log: &Arc<Mutex<ServerLog>>, check: F)
    where
        F: Fn(&ServerLog) -> bool,
    {
        for _ in 0..1_000 {
            if check(&*log.lock().await) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("fake server never observed the expected traffic");
    }

    #[tokio::test]
    async fn test_analyze_file_reuses_injected_client() {
        let (tmp, file) = workspace_with_marker();
        let other = tmp.path().join("lib.rs");
        fs::write(&other, "pub fn f() {}\n").unwrap();

        let manager = LspManager::new(test_registry());
        let fake = FakeLspServer::new().push_diagnostics_on_open(vec![]);
        let log = fake.log();
        inject_client(&manager, fake, tmp.path(), &rust_definition()).await;

        let ctx = manager.analyze_file(&file).await;
        assert_eq!(ctx.language(), Some("rust"));
        assert_eq!(ctx.workspace_root(), tmp.path());

        manager.analyze_file(&other).await;
        // Both files ran through the one injected client.
        assert_eq!(manager.clients.read().await.len(), 1);
        assert_eq!(
            log.lock().await.count_notifications("textDocument/didOpen"),
            2
        );
    }

    #[tokio::test]
    async fn test_analyze_file_caches_by_path() {
        let (tmp, file) = workspace_with_marker();
        let manager = LspManager::new(test_registry());
        let fake = FakeLspServer::new().push_diagnostics_on_open(vec![]);
        let log = fake.log();
        inject_client(&manager, fake, tmp.path(), &rust_definition()).await;

        manager.analyze_file(&file).await;
        manager.analyze_file(&file).await;

        // Second call served from cache, no second open.
        assert_eq!(
            log.lock().await.count_notifications("textDocument/didOpen"),
            1
        );
    }

    #[tokio::test]
    async fn test_analyze_normalizes_dot_components() {
        let (tmp, file) = workspace_with_marker();
        fs::create_dir_all(tmp.path().join("src")).unwrap();
        let dotted = tmp.path().join("src/../main.rs");

        let manager = LspManager::new(test_registry());
        let fake = FakeLspServer::new().push_diagnostics_on_open(vec![error_diag_json()]);
        let log = fake.log();
        inject_client(&manager, fake, tmp.path(), &rust_definition()).await;

        // Servers echo URIs with dot segments resolved; the store key must
        // match or the diagnostics wait comes back empty.
        let ctx = manager.analyze_file(&dotted).await;
        assert_eq!(ctx.path(), file);
        assert_eq!(ctx.error_count(), 1);

        // Both spellings share one cache entry and one open.
        manager.analyze_file(&file).await;
        assert_eq!(
            log.lock().await.count_notifications("textDocument/didOpen"),
            1
        );
    }

    #[tokio::test]
    async fn test_concurrent_analyze_single_flight() {
        let (tmp, file) = workspace_with_marker();
        let manager = Arc::new(LspManager::new(test_registry()));
        let fake = FakeLspServer::new().push_diagnostics_on_open(vec![error_diag_json()]);
        let log = fake.log();
        inject_client(&manager, fake, tmp.path(), &rust_definition()).await;

        let (a, b) = tokio::join!(manager.analyze_file(&file), manager.analyze_file(&file));
        assert_eq!(a.error_count(), 1);
        assert_eq!(b.error_count(), 1);
        assert_eq!(
            log.lock().await.count_notifications("textDocument/didOpen"),
            1,
            "concurrent analyses must share one open"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_analysis_releases_its_flight() {
        let (tmp, file) = workspace_with_marker();
        let manager = Arc::new(LspManager::new(test_registry()));
        // No diagnostics scripted: the analysis parks in the bounded
        // diagnostics wait right after opening the file.
        let fake = FakeLspServer::new();
        let log = fake.log();
        inject_client(&manager, fake, tmp.path(), &rust_definition()).await;

        let leader = tokio::spawn({
            let manager = Arc::clone(&manager);
            let file = file.clone();
            async move { manager.analyze_file(&file).await }
        });
        wait_for_log(&log, |l| l.count_notifications("textDocument/didOpen") == 1).await;
        leader.abort();
        let _ = leader.await;

        assert!(
            manager.analysis_flights.lock().unwrap().is_empty(),
            "an aborted leader must not leave its flight behind"
        );
        let ctx = tokio::time::timeout(Duration::from_secs(30), manager.analyze_file(&file))
            .await
            .expect("analysis after an aborted one must complete");
        assert_eq!(ctx.language(), Some("rust"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_analysis_takes_over_abandoned_flight() {
        let (tmp, file) = workspace_with_marker();
        let manager = Arc::new(LspManager::new(test_registry()));
        let fake = FakeLspServer::new();
        let log = fake.log();
        inject_client(&manager, fake, tmp.path(), &rust_definition()).await;

        let leader = tokio::spawn({
            let manager = Arc::clone(&manager);
            let file = file.clone();
            async move { manager.analyze_file(&file).await }
        });
        wait_for_log(&log, |l| l.count_notifications("textDocument/didOpen") == 1).await;

        let follower = tokio::spawn({
            let manager = Arc::clone(&manager);
            let file = file.clone();
            async move { manager.analyze_file(&file).await }
        });
        // Let the follower subscribe to the flight before the leader dies.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
        leader.abort();

        let ctx = tokio::time::timeout(Duration::from_secs(30), follower)
            .await
            .expect("waiting caller must outlive an aborted leader")
            .unwrap();
        assert_eq!(ctx.language(), Some("rust"));
    }

    #[tokio::test]
    async fn test_invalidate_forces_reanalysis() {
        let (tmp, file) = workspace_with_marker();
        let manager = LspManager::new(test_registry());
        let fake = FakeLspServer::new().push_diagnostics_on_open(vec![]);
        let log = fake.log();
        inject_client(&manager, fake, tmp.path(), &rust_definition()).await;

        manager.analyze_file(&file).await;
        manager.invalidate_file(&file).await;
        manager.analyze_file(&file).await;

        // The file stayed open; eviction forces a fresh query pass, not a
        // re-open.
        let log = log.lock().await;
        assert_eq!(log.count_notifications("textDocument/didOpen"), 1);
        assert_eq!(log.count_requests("textDocument/documentSymbol"), 2);
    }

    #[tokio::test]
    async fn test_analyze_without_any_server_degrades() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("notes.txt");
        fs::write(&file, "hello").unwrap();

        let manager = LspManager::new(test_registry());
        let ctx = manager.analyze_file(&file).await;
        assert!(ctx.language().is_none());
        assert!(ctx.symbols().is_empty());
        assert!(ctx.diagnostics().is_empty());
        assert_eq!(ctx.workspace_root(), tmp.path());
    }

    #[tokio::test]
    async fn test_unavailable_server_yields_empty_clients_and_degraded_context() {
        let (_tmp, file) = workspace_with_marker();
        // Swap the builtin rust server for one whose binary cannot exist
        // and which has no installer to fall back on.
        let registry = ServerRegistry::builtin().with_overrides(
            &serde_json::from_value(serde_json::json!({
                "servers": {
                    "rust": { "disabled": true },
                    "fake": {
                        "command": "loupe-test-missing-binary",
                        "language_id": "rust",
                        "file_extensions": ["rs"]
                    }
                }
            }))
            .unwrap(),
        );
        let manager = LspManager::new(registry);

        assert!(manager.clients_for_file(&file).await.is_empty());
        // Second lookup takes the warned-once fast path.
        assert!(manager.clients_for_file(&file).await.is_empty());
        assert!(manager.unavailable.lock().await.contains("fake"));

        let ctx = manager.analyze_file(&file).await;
        assert_eq!(ctx.language(), Some("rust"));
        assert!(ctx.diagnostics().is_empty());
        assert!(ctx.symbols().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_racing_spawns_share_one_install_attempt() {
        use crate::registry::InstallCommand;

        let (tmp, file) = workspace_with_marker();
        // The installer leaves a line per run, then fails; the leader runs
        // it once and the racing caller receives the same verdict.
        let marker = tmp.path().join("install-attempts");
        let script = format!("echo run >> '{}'; exit 3", marker.display());
        let def = ServerDefinition::new(
            "ghost",
            "Ghost",
            "rust",
            &["rs"],
            &["Cargo.toml"],
            "loupe-test-missing-binary",
            &[],
        )
        .with_install(InstallCommand::new("sh", &["-c", script.as_str()]));
        let manager = LspManager::new(ServerRegistry::new(vec![def]));

        let (a, b) = tokio::join!(manager.clients_for_file(&file), manager.clients_for_file(&file));
        assert!(a.is_empty());
        assert!(b.is_empty());
        assert!(manager.unavailable.lock().await.contains("ghost"));
        assert!(manager.spawn_flights.lock().unwrap().is_empty());

        let attempts = fs::read_to_string(&marker).unwrap();
        assert_eq!(attempts.lines().count(), 1, "install must run exactly once");
    }

    #[tokio::test]
    async fn test_workspace_insights_tallies_diagnostics() {
        let (tmp, file) = workspace_with_marker();
        let manager = LspManager::new(test_registry());
        let fake = FakeLspServer::new().push_diagnostics_on_open(vec![
            error_diag_json(),
            warning_diag_json(5),
            warning_diag_json(9),
        ]);
        inject_client(&manager, fake, tmp.path(), &rust_definition()).await;

        manager.analyze_file(&file).await;
        let report = manager.workspace_insights(tmp.path()).await;

        assert_eq!(report.diagnostics.errors, 1);
        assert_eq!(report.diagnostics.warnings, 2);
        assert_eq!(report.files_analyzed, 1);
        assert_eq!(report.languages.get("rust"), Some(&1));
        assert!(report.frameworks.contains(&"cargo".to_string()));
        assert_eq!(report.problems, vec!["1 compilation error needs fixing"]);
        assert!(report.suggestions[0].contains("cargo check"));
    }

    #[tokio::test]
    async fn test_workspace_insights_scopes_by_root() {
        let (tmp_a, file_a) = workspace_with_marker();
        let (tmp_b, _file_b) = workspace_with_marker();
        let manager = LspManager::new(test_registry());

        let fake = FakeLspServer::new().push_diagnostics_on_open(vec![error_diag_json()]);
        inject_client(&manager, fake, tmp_a.path(), &rust_definition()).await;
        inject_client(
            &manager,
            FakeLspServer::new().push_diagnostics_on_open(vec![]),
            tmp_b.path(),
            &rust_definition(),
        )
        .await;

        manager.analyze_file(&file_a).await;

        let report_a = manager.workspace_insights(tmp_a.path()).await;
        assert_eq!(report_a.diagnostics.errors, 1);

        let report_b = manager.workspace_insights(tmp_b.path()).await;
        assert_eq!(report_b.diagnostics.errors, 0);
        assert_eq!(report_b.files_analyzed, 0);
        assert!(report_b.problems[0].contains("No files have been analyzed"));
    }

    #[tokio::test]
    async fn test_hover_info_opens_file_transparently() {
        let (tmp, file) = workspace_with_marker();
        let manager = LspManager::new(test_registry());
        let fake = FakeLspServer::new()
            .push_diagnostics_on_open(vec![])
            .respond_with(
                "textDocument/hover",
                serde_json::json!({ "contents": "fn main()" }),
            );
        let log = fake.log();
        inject_client(&manager, fake, tmp.path(), &rust_definition()).await;

        let hover = manager.hover_info(&file, 0, 4).await.unwrap();
        assert_eq!(hover.contents, "fn main()");
        assert_eq!(
            log.lock().await.count_notifications("textDocument/didOpen"),
            1
        );
    }

    #[tokio::test]
    async fn test_completions_collected_from_clients() {
        let (tmp, file) = workspace_with_marker();
        let manager = LspManager::new(test_registry());
        let fake = FakeLspServer::new()
            .push_diagnostics_on_open(vec![])
            .respond_with(
                "textDocument/completion",
                serde_json::json!({
                    "items": [{ "label": "push", "kind": 2 }, { "label": "pop", "kind": 2 }]
                }),
            );
        inject_client(&manager, fake, tmp.path(), &rust_definition()).await;

        let items = manager.completions(&file, 1, 8).await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].label, "push");
    }

    #[tokio::test]
    async fn test_search_symbols_scoped_and_merged() {
        let (tmp, _file) = workspace_with_marker();
        let manager = LspManager::new(test_registry());
        let fake = FakeLspServer::new().respond_with(
            "workspace/symbol",
            serde_json::json!([{
                "name": "main",
                "kind": 12,
                "location": {
                    "uri": "file:///proj/src/main.rs",
                    "range": { "start": { "line": 0, "character": 0 }, "end": { "line": 1, "character": 0 } }
                }
            }]),
        );
        inject_client(&manager, fake, tmp.path(), &rust_definition()).await;

        let hits = manager.search_symbols("main", None).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name(), "main");

        let elsewhere = tempfile::tempdir().unwrap();
        let scoped = manager.search_symbols("main", Some(elsewhere.path())).await;
        assert!(scoped.is_empty());
    }

    #[tokio::test]
    async fn test_error_counts_and_all_diagnostics() {
        let (tmp, file) = workspace_with_marker();
        let manager = LspManager::new(test_registry());
        let fake = FakeLspServer::new()
            .push_diagnostics_on_open(vec![error_diag_json(), warning_diag_json(7)]);
        inject_client(&manager, fake, tmp.path(), &rust_definition()).await;

        assert!(!manager.has_errors().await);
        manager.analyze_file(&file).await;

        assert!(manager.has_errors().await);
        assert_eq!(manager.error_count().await, 1);
        let all = manager.all_diagnostics().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, file);
        assert_eq!(all[0].1.len(), 2);
    }

    #[tokio::test]
    async fn test_poll_events_removes_stopped_clients() {
        let (tmp, _file) = workspace_with_marker();
        let manager = LspManager::new(test_registry());
        inject_client(
            &manager,
            FakeLspServer::new(),
            tmp.path(),
            &rust_definition(),
        )
        .await;
        assert_eq!(manager.clients.read().await.len(), 1);

        let key = ClientKey::new(absolute(tmp.path()), "rust");
        manager
            .event_sender()
            .send(LspEvent::ClientStopped {
                key,
                reason: StopReason::Failed("crash".to_string()),
            })
            .await
            .unwrap();

        let events = manager.poll_events(10).await;
        assert_eq!(events.len(), 1);
        assert!(manager.clients.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_poll_events_respects_budget() {
        let manager = LspManager::new(test_registry());
        for i in 0..5 {
            manager
                .event_sender()
                .send(LspEvent::Diagnostics {
                    key: ClientKey::new(PathBuf::from("/w"), "rust"),
                    path: PathBuf::from(format!("/w/file{i}.rs")),
                    items: vec![],
                })
                .await
                .unwrap();
        }

        assert_eq!(manager.poll_events(3).await.len(), 3);
        assert_eq!(manager.poll_events(10).await.len(), 2);
        assert!(manager.poll_events(10).await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent_and_clears_state() {
        let (tmp, file) = workspace_with_marker();
        let manager = LspManager::new(test_registry());
        let fake = FakeLspServer::new().push_diagnostics_on_open(vec![]);
        let log = fake.log();
        inject_client(&manager, fake, tmp.path(), &rust_definition()).await;
        manager.analyze_file(&file).await;

        manager.shutdown().await;
        manager.shutdown().await;

        assert!(manager.clients.read().await.is_empty());
        assert!(manager.contexts.read().await.is_empty());
        assert!(manager.workspace_roots().await.is_empty());
        assert_eq!(log.lock().await.count_requests("shutdown"), 1);
    }
}
