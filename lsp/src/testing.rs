//! In-process fake language server for tests.
//!
//! Speaks real Content-Length framed JSON-RPC over a duplex pipe, so client
//! and manager tests exercise the actual codec, dispatch, and handshake
//! paths without spawning external binaries.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::DuplexStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::codec::{FrameReader, FrameWriter};

const PIPE_CAPACITY: usize = 64 * 1024;

/// Everything the fake server has received, for assertions.
#[derive(Default)]
pub(crate) struct ServerLog {
    pub requests: Vec<String>,
    pub notifications: Vec<(String, serde_json::Value)>,
}

impl ServerLog {
    pub fn count_notifications(&self, method: &str) -> usize {
        self.notifications.iter().filter(|(m, _)| m == method).count()
    }

    pub fn count_requests(&self, method: &str) -> usize {
        self.requests.iter().filter(|m| m.as_str() == method).count()
    }

    /// Params of every notification with `method`, in arrival order.
    pub fn notification_params(&self, method: &str) -> Vec<serde_json::Value> {
        self.notifications
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

/// A scripted server: canned results per request method, optional
/// diagnostics pushed in response to every `didOpen`.
pub(crate) struct FakeLspServer {
    results: HashMap<String, serde_json::Value>,
    diagnostics_on_open: Option<Vec<serde_json::Value>>,
    log: Arc<Mutex<ServerLog>>,
}

impl FakeLspServer {
    pub fn new() -> Self {
        let mut results = HashMap::new();
        results.insert(
            "initialize".to_string(),
            serde_json::json!({ "capabilities": {} }),
        );
        results.insert("shutdown".to_string(), serde_json::Value::Null);
        Self {
            results,
            diagnostics_on_open: None,
            log: Arc::new(Mutex::new(ServerLog::default())),
        }
    }

    /// Set the canned `result` for a request method.
    pub fn respond_with(mut self, method: &str, result: serde_json::Value) -> Self {
        self.results.insert(method.to_string(), result);
        self
    }

    /// Push `textDocument/publishDiagnostics` with these raw diagnostic
    /// objects (echoing the opened uri) after every `didOpen`.
    pub fn push_diagnostics_on_open(mut self, diagnostics: Vec<serde_json::Value>) -> Self {
        self.diagnostics_on_open = Some(diagnostics);
        self
    }

    pub fn log(&self) -> Arc<Mutex<ServerLog>> {
        Arc::clone(&self.log)
    }

    /// Start serving. Returns the client side of the pipe and the serve
    /// task handle; the task ends on `exit` or when the client hangs up.
    pub fn start(self) -> (DuplexStream, JoinHandle<()>) {
        let (client_io, server_io) = tokio::io::duplex(PIPE_CAPACITY);
        let handle = tokio::spawn(self.serve(server_io));
        (client_io, handle)
    }

    async fn serve(self, server_io: DuplexStream) {
        let (read_half, write_half) = tokio::io::split(server_io);
        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        while let Ok(Some(frame)) = reader.read_message().await {
            let method = frame
                .get("method")
                .and_then(|m| m.as_str())
                .map(String::from);
            let id = frame.get("id").cloned();

            match (id, method) {
                (Some(id), Some(method)) => {
                    self.log.lock().await.requests.push(method.clone());
                    let result = self
                        .results
                        .get(&method)
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    let response = serde_json::json!({
                        "jsonrpc": "2.0",
                        "id": id,
                        "result": result
                    });
                    if writer.write_message(&response).await.is_err() {
                        break;
                    }
                }
                (None, Some(method)) => {
                    let params = frame.get("params").cloned().unwrap_or(serde_json::Value::Null);
                    self.log
                        .lock()
                        .await
                        .notifications
                        .push((method.clone(), params.clone()));
                    if method == "exit" {
                        break;
                    }
                    if method == "textDocument/didOpen"
                        && let Some(diags) = &self.diagnostics_on_open
                    {
                        let uri = params["textDocument"]["uri"].clone();
                        let push = serde_json::json!({
                            "jsonrpc": "2.0",
                            "method": "textDocument/publishDiagnostics",
                            "params": { "uri": uri, "diagnostics": diags }
                        });
                        if writer.write_message(&push).await.is_err() {
                            break;
                        }
                    }
                }
                _ => {}
            }
        }
    }
}
