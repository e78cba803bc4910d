//! Internal LSP message serde types for JSON-RPC communication.
//!
//! Requests and notifications are built here; responses are parsed here into
//! the public types. Nothing outside the crate sees raw `serde_json::Value`s.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{
    CompletionItem, Diagnostic, DiagnosticSeverity, Hover, Location, Position, Range, Symbol,
    SymbolKind,
};

#[derive(Debug, thiserror::Error)]
#[error("cannot convert path to file URI: {}", path.display())]
pub(crate) struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

pub(crate) fn initialize_params(
    root_uri: &str,
    init_options: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut params = serde_json::json!({
        "processId": std::process::id(),
        "rootUri": root_uri,
        "capabilities": {
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "willSave": false,
                    "willSaveWaitUntil": false,
                    "didSave": false
                },
                "publishDiagnostics": {
                    "relatedInformation": false
                },
                "hover": {
                    "contentFormat": ["plaintext", "markdown"]
                },
                "completion": {
                    "completionItem": {
                        "snippetSupport": false
                    }
                },
                "signatureHelp": {},
                "definition": {},
                "references": {},
                "documentSymbol": {
                    "hierarchicalDocumentSymbolSupport": true
                },
                "formatting": {},
                "codeAction": {},
                "rename": {}
            },
            "workspace": {
                "symbol": {},
                "workspaceFolders": true
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    });
    if let Some(options) = init_options {
        params["initializationOptions"] = options.clone();
    }
    params
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_close_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

pub(crate) fn text_document_position_params(uri: &str, position: Position) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": { "line": position.line, "character": position.character }
    })
}

pub(crate) fn references_params(uri: &str, position: Position) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri },
        "position": { "line": position.line, "character": position.character },
        "context": { "includeDeclaration": true }
    })
}

pub(crate) fn document_symbol_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

pub(crate) fn workspace_symbol_params(query: &str) -> serde_json::Value {
    serde_json::json!({ "query": query })
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<LspDiagnostic>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LspDiagnostic {
    pub range: Range,
    pub severity: Option<u64>,
    pub source: Option<String>,
    pub message: String,
}

impl LspDiagnostic {
    pub fn to_diagnostic(&self) -> Diagnostic {
        Diagnostic::new(
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.message.clone(),
            self.range,
            self.source
                .clone()
                .unwrap_or_else(|| String::from("unknown")),
        )
    }
}

/// Flatten a hover result to plain text. Handles the three shapes servers
/// send for `contents`: a bare string, a `MarkedString`/`MarkupContent`
/// object with a `value`, or an array of either.
pub(crate) fn hover_from_value(value: &serde_json::Value) -> Option<Hover> {
    let contents = value.get("contents")?;
    let mut parts: Vec<String> = Vec::new();
    collect_hover_text(contents, &mut parts);
    let text = parts.join("\n\n");
    if text.trim().is_empty() {
        return None;
    }
    let range = value
        .get("range")
        .and_then(|r| serde_json::from_value::<Range>(r.clone()).ok());
    Some(Hover {
        contents: text,
        range,
    })
}

fn collect_hover_text(value: &serde_json::Value, out: &mut Vec<String>) {
    match value {
        serde_json::Value::String(s) => {
            if !s.is_empty() {
                out.push(s.clone());
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                collect_hover_text(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            if let Some(serde_json::Value::String(s)) = map.get("value")
                && !s.is_empty()
            {
                out.push(s.clone());
            }
        }
        _ => {}
    }
}

/// Parse a completion response. Servers reply with either a bare
/// `CompletionItem[]` or a `CompletionList { items }`.
pub(crate) fn completions_from_value(value: &serde_json::Value) -> Vec<CompletionItem> {
    let items = match value {
        serde_json::Value::Array(items) => items.as_slice(),
        serde_json::Value::Object(map) => match map.get("items") {
            Some(serde_json::Value::Array(items)) => items.as_slice(),
            _ => return Vec::new(),
        },
        _ => return Vec::new(),
    };
    items
        .iter()
        .filter_map(|item| {
            let label = item.get("label")?.as_str()?.to_string();
            Some(CompletionItem {
                label,
                detail: item
                    .get("detail")
                    .and_then(serde_json::Value::as_str)
                    .map(String::from),
                kind: item.get("kind").and_then(serde_json::Value::as_u64),
            })
        })
        .collect()
}

/// Parse a `textDocument/documentSymbol` response. Hierarchical
/// `DocumentSymbol[]` trees are flattened depth-first; flat
/// `SymbolInformation[]` lists are taken as-is. Entries with unknown kind
/// codes are skipped.
pub(crate) fn symbols_from_value(value: &serde_json::Value) -> Vec<Symbol> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for item in items {
        if item.get("location").is_some() {
            if let Some(symbol) = symbol_information(item, false) {
                out.push(symbol);
            }
        } else {
            flatten_document_symbol(item, &mut out);
        }
    }
    out
}

fn flatten_document_symbol(value: &serde_json::Value, out: &mut Vec<Symbol>) {
    if let Some(name) = value.get("name").and_then(serde_json::Value::as_str)
        && let Some(kind) = value
            .get("kind")
            .and_then(serde_json::Value::as_u64)
            .and_then(SymbolKind::from_lsp)
        && let Some(range) = value
            .get("range")
            .and_then(|r| serde_json::from_value::<Range>(r.clone()).ok())
    {
        out.push(Symbol::new(name.to_string(), kind, range));
    }
    if let Some(children) = value.get("children").and_then(serde_json::Value::as_array) {
        for child in children {
            flatten_document_symbol(child, out);
        }
    }
}

/// Parse a `workspace/symbol` response (`SymbolInformation[]`). Entries
/// whose location URI is not a convertible file path are skipped.
pub(crate) fn workspace_symbols_from_value(value: &serde_json::Value) -> Vec<Symbol> {
    let Some(items) = value.as_array() else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| symbol_information(item, true))
        .collect()
}

fn symbol_information(value: &serde_json::Value, require_path: bool) -> Option<Symbol> {
    let name = value.get("name")?.as_str()?.to_string();
    let kind = value
        .get("kind")
        .and_then(serde_json::Value::as_u64)
        .and_then(SymbolKind::from_lsp)?;
    let location = value.get("location")?;
    let range = serde_json::from_value::<Range>(location.get("range")?.clone()).ok()?;
    let path = location
        .get("uri")
        .and_then(serde_json::Value::as_str)
        .and_then(file_uri_to_path);
    match path {
        Some(path) => Some(Symbol::with_path(name, kind, range, path)),
        None if require_path => None,
        None => Some(Symbol::new(name, kind, range)),
    }
}

/// Parse a definition/references response. Servers reply with `null`, a
/// single `Location`, a `Location[]`, or a `LocationLink[]`.
pub(crate) fn locations_from_value(value: &serde_json::Value) -> Vec<Location> {
    match value {
        serde_json::Value::Array(items) => items.iter().filter_map(location_entry).collect(),
        serde_json::Value::Object(_) => location_entry(value).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn location_entry(value: &serde_json::Value) -> Option<Location> {
    // LocationLink carries targetUri/targetRange instead of uri/range.
    let (uri, range) = if let Some(uri) = value.get("targetUri") {
        (uri, value.get("targetRange")?)
    } else {
        (value.get("uri")?, value.get("range")?)
    };
    let path = file_uri_to_path(uri.as_str()?)?;
    let range = serde_json::from_value::<Range>(range.clone()).ok()?;
    Some(Location { path, range })
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri)
        .ok()
        .and_then(|u| u.to_file_path().ok())
}
