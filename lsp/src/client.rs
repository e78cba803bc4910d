//! Protocol client: owns one language-server process and one JSON-RPC
//! channel, scoped to a single workspace root.
//!
//! Correlation is explicit. Requests get monotonically increasing ids and a
//! pending-table entry; the reader task resolves responses by id, answers
//! server-to-client requests with "method not found", and routes
//! notifications into the client's diagnostics store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};
use crate::diagnostics::DiagnosticsStore;
use crate::protocol::{self, Notification, PublishDiagnosticsParams, Request};
use crate::registry::ServerDefinition;
use crate::types::{
    ClientKey, CompletionItem, Diagnostic, Hover, Location, LspEvent, Position, StopReason, Symbol,
};
use crate::workspace::normalize_path;

const INIT_TIMEOUT_SECS: u64 = 30;

const REQUEST_TIMEOUT_SECS: u64 = 15;

const SHUTDOWN_TIMEOUT_SECS: u64 = 2;

const WRITER_CHANNEL_CAPACITY: usize = 64;

/// Lifecycle of a client. Transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    Created,
    Initializing,
    Ready,
    ShuttingDown,
    Terminated,
}

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

enum IncomingFrame {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

fn parse_incoming(frame: &serde_json::Value) -> Option<IncomingFrame> {
    let id = frame.get("id");
    let method = frame
        .get("method")
        .and_then(|m| m.as_str())
        .map(String::from);
    let has_result_or_error = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, has_result_or_error) {
        (Some(id_val), None, true) => Some(IncomingFrame::Response {
            id: id_val.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id_val), Some(method), _) => Some(IncomingFrame::ServerRequest {
            id: id_val.clone(),
            method,
        }),
        (None, Some(method), _) => Some(IncomingFrame::Notification {
            method,
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// Per-document tracking. `version` survives a close so a re-open never
/// regresses the version the server last saw.
struct DocEntry {
    open: bool,
    version: i32,
}

/// State shared between the client and its reader task.
struct Shared {
    pending: Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>,
    store: DiagnosticsStore,
    state: Mutex<ClientState>,
}

pub struct ProtocolClient {
    key: ClientKey,
    definition: ServerDefinition,
    shared: Arc<Shared>,
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: AtomicU64,
    docs: Mutex<HashMap<PathBuf, DocEntry>>,
    child: Mutex<Option<Child>>,
    #[allow(dead_code)]
    reader_handle: JoinHandle<()>,
    #[allow(dead_code)]
    writer_handle: JoinHandle<()>,
}

impl ProtocolClient {
    /// Spawn the server process and wire up the channel. The returned client
    /// is `Created`; call [`initialize`](Self::initialize) before use.
    pub(crate) async fn spawn(
        definition: &ServerDefinition,
        key: ClientKey,
        event_tx: mpsc::Sender<LspEvent>,
    ) -> Result<Self> {
        let resolved_cmd = which::which(definition.command())
            .with_context(|| format!("{} not found in PATH", definition.command()))?;
        let mut cmd = Command::new(&resolved_cmd);
        cmd.args(definition.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        // Strip secret-bearing env vars using the canonical denylist.
        for (env_key, _) in std::env::vars() {
            if loupe_types::is_secret_env(&env_key) {
                cmd.env_remove(&env_key);
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning {}", definition.command()))?;
        let stdout = child.stdout.take().context("no stdout from child")?;
        let stdin = child.stdin.take().context("no stdin from child")?;

        let client = Self::from_transport(definition.clone(), key, event_tx, stdout, stdin);
        *client.child.lock().await = Some(child);
        Ok(client)
    }

    /// Build a client on an arbitrary transport. Production goes through
    /// [`spawn`](Self::spawn); tests connect a duplex pipe here.
    pub(crate) fn from_transport<R, W>(
        definition: ServerDefinition,
        key: ClientKey,
        event_tx: mpsc::Sender<LspEvent>,
        reader_io: R,
        writer_io: W,
    ) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            store: DiagnosticsStore::new(),
            state: Mutex::new(ClientState::Created),
        });

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_CHANNEL_CAPACITY);
        let writer_handle = tokio::spawn(async move {
            let mut writer = FrameWriter::new(writer_io);
            while let Some(cmd) = writer_rx.recv().await {
                match cmd {
                    WriterCommand::Send(frame) => {
                        if let Err(e) = writer.write_message(&frame).await {
                            tracing::warn!("LSP write error: {e}");
                            break;
                        }
                    }
                    WriterCommand::Shutdown => break,
                }
            }
        });

        let reader_shared = Arc::clone(&shared);
        let reader_writer_tx = writer_tx.clone();
        let reader_key = key.clone();
        let reader_root = normalize_path(key.root());
        let reader_handle = tokio::spawn(async move {
            let mut reader = FrameReader::new(reader_io);
            let reason = loop {
                match reader.read_message().await {
                    Ok(Some(frame)) => {
                        Self::dispatch_frame(
                            &reader_shared,
                            &frame,
                            &reader_writer_tx,
                            &event_tx,
                            &reader_key,
                            &reader_root,
                        )
                        .await;
                    }
                    Ok(None) => {
                        tracing::info!(
                            "LSP server '{}' closed its output",
                            reader_key.server_id()
                        );
                        break StopReason::Exited;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "LSP reader error for '{}': {e}",
                            reader_key.server_id()
                        );
                        break StopReason::Failed(e.to_string());
                    }
                }
            };
            // Fail outstanding requests before announcing death, so callers
            // blocked on a response unblock immediately.
            reader_shared.pending.lock().await.clear();
            *reader_shared.state.lock().await = ClientState::Terminated;
            let stopped = LspEvent::ClientStopped {
                key: reader_key,
                reason,
            };
            if event_tx.try_send(stopped).is_err() {
                tracing::debug!("event channel full or closed, dropping stop event");
            }
        });

        Self {
            key,
            definition,
            shared,
            writer_tx,
            next_id: AtomicU64::new(1),
            docs: Mutex::new(HashMap::new()),
            child: Mutex::new(None),
            reader_handle,
            writer_handle,
        }
    }

    async fn dispatch_frame(
        shared: &Shared,
        frame: &serde_json::Value,
        writer_tx: &mpsc::Sender<WriterCommand>,
        event_tx: &mpsc::Sender<LspEvent>,
        key: &ClientKey,
        workspace_root: &Path,
    ) {
        let Some(incoming) = parse_incoming(frame) else {
            tracing::trace!(
                "Ignoring malformed JSON-RPC frame from '{}'",
                key.server_id()
            );
            return;
        };

        match incoming {
            IncomingFrame::Response { id, body } => {
                let sender = shared.pending.lock().await.remove(&id);
                if let Some(tx) = sender {
                    let _ = tx.send(body);
                }
            }
            IncomingFrame::ServerRequest { id, method } => {
                // Many servers send client/registerCapability, workspace/configuration, etc.
                // We must respond or the server may block.
                tracing::debug!(
                    "LSP '{}' sent request {method}, replying method not found",
                    key.server_id()
                );
                let response = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32601,
                        "message": format!("Method not found: {method}")
                    }
                });
                let _ = writer_tx.send(WriterCommand::Send(response)).await;
            }
            IncomingFrame::Notification { method, params } => {
                Self::handle_notification(shared, &method, params, event_tx, key, workspace_root)
                    .await;
            }
        }
    }

    async fn handle_notification(
        shared: &Shared,
        method: &str,
        params: Option<serde_json::Value>,
        event_tx: &mpsc::Sender<LspEvent>,
        key: &ClientKey,
        workspace_root: &Path,
    ) {
        match method {
            "textDocument/publishDiagnostics" => {
                let Some(params) = params else { return };
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(diag_params) => {
                        let Some(path) = protocol::file_uri_to_path(&diag_params.uri) else {
                            return;
                        };
                        let normalized = normalize_path(&path);
                        if !normalized.starts_with(workspace_root) {
                            tracing::warn!(
                                "LSP '{}' reported diagnostics for path outside workspace: {}",
                                key.server_id(),
                                path.display()
                            );
                            return;
                        }
                        let items: Vec<Diagnostic> = diag_params
                            .diagnostics
                            .iter()
                            .map(protocol::LspDiagnostic::to_diagnostic)
                            .collect();
                        shared.store.replace(path.clone(), items.clone()).await;
                        let event = LspEvent::Diagnostics {
                            key: key.clone(),
                            path,
                            items,
                        };
                        // Events are advisory; the store above stays
                        // authoritative even when the channel is full.
                        if event_tx.try_send(event).is_err() {
                            tracing::trace!("event channel full, dropping diagnostics event");
                        }
                    }
                    Err(e) => {
                        tracing::debug!(
                            "Failed to parse publishDiagnostics from '{}': {e}",
                            key.server_id()
                        );
                    }
                }
            }
            "window/logMessage" => {
                if let Some(message) = params
                    .as_ref()
                    .and_then(|p| p.get("message"))
                    .and_then(|m| m.as_str())
                {
                    tracing::debug!("LSP '{}': {message}", key.server_id());
                }
            }
            _ => {
                tracing::trace!(
                    "Ignoring notification from '{}': {method}",
                    key.server_id()
                );
            }
        }
    }

    /// Perform the initialize handshake. A no-op when already `Ready`;
    /// concurrent callers serialize on the state lock and observe the
    /// outcome of the first.
    pub async fn initialize(&self) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        match *state {
            ClientState::Ready => return Ok(()),
            ClientState::ShuttingDown | ClientState::Terminated => {
                bail!("client for '{}' is shut down", self.key.server_id())
            }
            ClientState::Initializing => bail!("initialize already in flight"),
            ClientState::Created => {}
        }
        *state = ClientState::Initializing;

        match self.handshake().await {
            Ok(()) => {
                *state = ClientState::Ready;
                Ok(())
            }
            Err(e) => {
                *state = ClientState::Terminated;
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<()> {
        let root_uri = protocol::path_to_file_uri(self.key.root())
            .context("converting workspace root to URI")?;

        let params = protocol::initialize_params(root_uri.as_str(), self.definition.init_options());
        let response = self
            .request(
                "initialize",
                Some(params),
                Duration::from_secs(INIT_TIMEOUT_SECS),
            )
            .await?;

        if let Some(error) = response.get("error") {
            bail!(
                "LSP initialize failed: {}",
                error["message"].as_str().unwrap_or("unknown error")
            );
        }

        self.send_notification("initialized", Some(serde_json::json!({})))
            .await?;
        Ok(())
    }

    pub async fn is_initialized(&self) -> bool {
        *self.shared.state.lock().await == ClientState::Ready
    }

    #[must_use]
    pub fn key(&self) -> &ClientKey {
        &self.key
    }

    pub(crate) fn server_definition(&self) -> &ServerDefinition {
        &self.definition
    }

    pub(crate) fn store(&self) -> &DiagnosticsStore {
        &self.shared.store
    }

    async fn request(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id, tx);

        let request = Request::new(id, method, params);
        let frame = serde_json::to_value(&request).context("serializing request")?;
        if self
            .writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .is_err()
        {
            // Failed to enqueue; don't leak the pending entry.
            self.shared.pending.lock().await.remove(&id);
            bail!("writer channel closed");
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => {
                // Reader task dropped / server exited.
                self.shared.pending.lock().await.remove(&id);
                bail!("response channel dropped");
            }
            Err(_) => {
                // Timeout: remove the entry so repeated failures don't grow the map.
                self.shared.pending.lock().await.remove(&id);
                bail!("request timed out");
            }
        }
    }

    async fn send_notification(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<()> {
        let notification = Notification::new(method, params);
        let frame = serde_json::to_value(&notification).context("serializing notification")?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| anyhow::anyhow!("writer channel closed"))?;
        Ok(())
    }

    /// Open `path`, reading its current content from disk. An already-open
    /// path is closed first, and its version keeps increasing rather than
    /// resetting, so the server never sees a version regression.
    pub async fn open_file(&self, path: &Path) -> Result<()> {
        {
            let state = self.shared.state.lock().await;
            if *state != ClientState::Ready {
                bail!("client for '{}' not initialized", self.key.server_id());
            }
        }
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let uri = protocol::path_to_file_uri(path)?;

        let mut docs = self.docs.lock().await;
        let entry = docs
            .entry(path.to_path_buf())
            .or_insert(DocEntry {
                open: false,
                version: 0,
            });
        if entry.open {
            self.send_notification(
                "textDocument/didClose",
                Some(protocol::did_close_params(uri.as_str())),
            )
            .await?;
        }
        // A stale report must not satisfy a wait that expects the new open.
        self.shared.store.clear(path).await;
        entry.version += 1;
        entry.open = true;
        let params = protocol::did_open_params(
            uri.as_str(),
            self.definition.language_id_for(path),
            entry.version,
            &text,
        );
        self.send_notification("textDocument/didOpen", Some(params))
            .await
    }

    /// Close `path` and drop its diagnostics. Closing a path that is not
    /// open is a no-op.
    pub async fn close_file(&self, path: &Path) -> Result<()> {
        {
            let mut docs = self.docs.lock().await;
            match docs.get_mut(path) {
                Some(entry) if entry.open => entry.open = false,
                _ => return Ok(()),
            }
        }
        self.shared.store.clear(path).await;
        let uri = protocol::path_to_file_uri(path)?;
        self.send_notification(
            "textDocument/didClose",
            Some(protocol::did_close_params(uri.as_str())),
        )
        .await
    }

    pub async fn is_open(&self, path: &Path) -> bool {
        self.docs.lock().await.get(path).is_some_and(|e| e.open)
    }

    /// Paths currently open on this client.
    pub async fn open_paths(&self) -> Vec<PathBuf> {
        self.docs
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| entry.open)
            .map(|(path, _)| path.clone())
            .collect()
    }

    /// Diagnostics from the most recent push for `path`.
    pub async fn diagnostics_for(&self, path: &Path) -> Vec<Diagnostic> {
        self.shared.store.get(path).await
    }

    /// Wait until the server reports on `path`, up to `timeout`. Best
    /// effort: an empty result means "nothing yet", not "clean".
    pub async fn wait_for_diagnostics(&self, path: &Path, timeout: Duration) -> Vec<Diagnostic> {
        self.shared.store.wait_for(path, timeout).await
    }

    /// Issue an advisory request. Errors and error-responses degrade to
    /// `None`; these lookups are never critical path.
    async fn query(
        &self,
        method: &'static str,
        params: serde_json::Value,
    ) -> Option<serde_json::Value> {
        match self
            .request(
                method,
                Some(params),
                Duration::from_secs(REQUEST_TIMEOUT_SECS),
            )
            .await
        {
            Ok(body) => {
                if body.get("error").is_some() {
                    tracing::debug!("LSP '{}' returned error for {method}", self.key.server_id());
                    return None;
                }
                Some(body.get("result").cloned().unwrap_or(serde_json::Value::Null))
            }
            Err(e) => {
                tracing::debug!("LSP '{}' {method} failed: {e}", self.key.server_id());
                None
            }
        }
    }

    pub async fn hover(&self, path: &Path, position: Position) -> Option<Hover> {
        let uri = protocol::path_to_file_uri(path).ok()?;
        let result = self
            .query(
                "textDocument/hover",
                protocol::text_document_position_params(uri.as_str(), position),
            )
            .await?;
        protocol::hover_from_value(&result)
    }

    pub async fn completions(&self, path: &Path, position: Position) -> Vec<CompletionItem> {
        let Ok(uri) = protocol::path_to_file_uri(path) else {
            return Vec::new();
        };
        match self
            .query(
                "textDocument/completion",
                protocol::text_document_position_params(uri.as_str(), position),
            )
            .await
        {
            Some(result) => protocol::completions_from_value(&result),
            None => Vec::new(),
        }
    }

    pub async fn definition(&self, path: &Path, position: Position) -> Vec<Location> {
        let Ok(uri) = protocol::path_to_file_uri(path) else {
            return Vec::new();
        };
        match self
            .query(
                "textDocument/definition",
                protocol::text_document_position_params(uri.as_str(), position),
            )
            .await
        {
            Some(result) => protocol::locations_from_value(&result),
            None => Vec::new(),
        }
    }

    pub async fn references(&self, path: &Path, position: Position) -> Vec<Location> {
        let Ok(uri) = protocol::path_to_file_uri(path) else {
            return Vec::new();
        };
        match self
            .query(
                "textDocument/references",
                protocol::references_params(uri.as_str(), position),
            )
            .await
        {
            Some(result) => protocol::locations_from_value(&result),
            None => Vec::new(),
        }
    }

    pub async fn document_symbols(&self, path: &Path) -> Vec<Symbol> {
        let Ok(uri) = protocol::path_to_file_uri(path) else {
            return Vec::new();
        };
        match self
            .query(
                "textDocument/documentSymbol",
                protocol::document_symbol_params(uri.as_str()),
            )
            .await
        {
            Some(result) => protocol::symbols_from_value(&result),
            None => Vec::new(),
        }
    }

    pub async fn workspace_symbols(&self, query: &str) -> Vec<Symbol> {
        match self
            .query("workspace/symbol", protocol::workspace_symbol_params(query))
            .await
        {
            Some(result) => protocol::workspace_symbols_from_value(&result),
            None => Vec::new(),
        }
    }

    /// Gracefully stop the server. Idempotent; partial failures (process
    /// already dead, channel closed) are absorbed.
    pub async fn shutdown(&self) {
        let mut state = self.shared.state.lock().await;
        if matches!(
            *state,
            ClientState::ShuttingDown | ClientState::Terminated
        ) {
            return;
        }
        let was_ready = *state == ClientState::Ready;
        *state = ClientState::ShuttingDown;

        if was_ready {
            let open: Vec<PathBuf> = {
                let mut docs = self.docs.lock().await;
                let open = docs
                    .iter()
                    .filter(|(_, entry)| entry.open)
                    .map(|(path, _)| path.clone())
                    .collect();
                docs.clear();
                open
            };
            for path in open {
                if let Ok(uri) = protocol::path_to_file_uri(&path) {
                    let _ = self
                        .send_notification(
                            "textDocument/didClose",
                            Some(protocol::did_close_params(uri.as_str())),
                        )
                        .await;
                }
            }
            if let Ok(response) = self
                .request("shutdown", None, Duration::from_secs(SHUTDOWN_TIMEOUT_SECS))
                .await
                && response.get("error").is_none()
            {
                let _ = self.send_notification("exit", None).await;
            }
        }

        let _ = self.writer_tx.send(WriterCommand::Shutdown).await;

        if let Some(mut child) = self.child.lock().await.take() {
            let waited = tokio::time::timeout(
                Duration::from_secs(SHUTDOWN_TIMEOUT_SECS),
                child.wait(),
            )
            .await;
            if waited.is_err() {
                tracing::debug!(
                    "LSP '{}' didn't exit in time, killing",
                    self.key.server_id()
                );
                let _ = child.kill().await;
            }
        }
        *state = ClientState::Terminated;
    }
}
