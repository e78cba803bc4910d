//! Public types consumed by the rest of Loupe.
//!
//! Everything the engine, agents, and tools see from this crate comes
//! through these types: [`FileContext`] from analysis, [`WorkspaceInsights`]
//! from aggregation, and [`LspEvent`]s from the manager's event channel.
//! They are plain data: no handles, no protocol detail.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Severity level for a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from the LSP numeric severity (1=Error, 2=Warning, 3=Info,
    /// 4=Hint). Returns `None` for values outside the defined range;
    /// boundary code decides the fallback.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warning => "warning",
            Self::Information => "info",
            Self::Hint => "hint",
        }
    }
}

/// Zero-indexed position in a document, in LSP's line/character terms.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Position {
    pub line: u32,
    pub character: u32,
}

impl Position {
    #[must_use]
    pub fn new(line: u32, character: u32) -> Self {
        Self { line, character }
    }
}

/// Half-open text range between two positions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub start: Position,
    pub end: Position,
}

impl Range {
    #[must_use]
    pub fn new(start: Position, end: Position) -> Self {
        Self { start, end }
    }
}

/// A single diagnostic reported by a language server.
///
/// Fields are private; construction happens at the protocol boundary and
/// consumers read via accessors.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    range: Range,
    /// Tool that produced the diagnostic (e.g. "rustc", "ts"). Resolved to a
    /// concrete string at the boundary.
    source: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: String,
        range: Range,
        source: String,
    ) -> Self {
        Self {
            severity,
            message,
            range,
            source,
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    #[must_use]
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Format as `path:line:col: severity: message` (1-indexed for display).
    #[must_use]
    pub fn display_with_path(&self, path: &Path) -> String {
        format!(
            "{}:{}:{}: {}: [{}] {}",
            path.display(),
            self.range.start.line + 1,
            self.range.start.character + 1,
            self.severity.label(),
            self.source,
            self.message,
        )
    }
}

/// The LSP symbol-kind set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SymbolKind {
    File = 1,
    Module = 2,
    Namespace = 3,
    Package = 4,
    Class = 5,
    Method = 6,
    Property = 7,
    Field = 8,
    Constructor = 9,
    Enum = 10,
    Interface = 11,
    Function = 12,
    Variable = 13,
    Constant = 14,
    String = 15,
    Number = 16,
    Boolean = 17,
    Array = 18,
    Object = 19,
    Key = 20,
    Null = 21,
    EnumMember = 22,
    Struct = 23,
    Event = 24,
    Operator = 25,
    TypeParameter = 26,
}

impl SymbolKind {
    /// Convert from the LSP numeric kind. Returns `None` outside 1..=26.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::File),
            2 => Some(Self::Module),
            3 => Some(Self::Namespace),
            4 => Some(Self::Package),
            5 => Some(Self::Class),
            6 => Some(Self::Method),
            7 => Some(Self::Property),
            8 => Some(Self::Field),
            9 => Some(Self::Constructor),
            10 => Some(Self::Enum),
            11 => Some(Self::Interface),
            12 => Some(Self::Function),
            13 => Some(Self::Variable),
            14 => Some(Self::Constant),
            15 => Some(Self::String),
            16 => Some(Self::Number),
            17 => Some(Self::Boolean),
            18 => Some(Self::Array),
            19 => Some(Self::Object),
            20 => Some(Self::Key),
            21 => Some(Self::Null),
            22 => Some(Self::EnumMember),
            23 => Some(Self::Struct),
            24 => Some(Self::Event),
            25 => Some(Self::Operator),
            26 => Some(Self::TypeParameter),
            _ => None,
        }
    }

    /// The histogram bucket this kind falls into, if any.
    #[must_use]
    pub fn bucket(self) -> Option<SymbolBucket> {
        match self {
            Self::Function | Self::Method => Some(SymbolBucket::Function),
            Self::Class | Self::Struct => Some(SymbolBucket::Class),
            Self::Interface => Some(SymbolBucket::Interface),
            Self::Variable | Self::Constant => Some(SymbolBucket::Variable),
            _ => None,
        }
    }
}

/// Coarse symbol grouping used by [`WorkspaceInsights`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolBucket {
    Function,
    Class,
    Interface,
    Variable,
}

/// A named code element reported by a symbol query.
///
/// `path` is `None` for document-scoped symbols (the file is implied by the
/// containing [`FileContext`]) and `Some` for workspace-search hits.
#[derive(Debug, Clone, Serialize)]
pub struct Symbol {
    name: String,
    kind: SymbolKind,
    range: Range,
    #[serde(skip_serializing_if = "Option::is_none")]
    path: Option<PathBuf>,
}

impl Symbol {
    #[must_use]
    pub fn new(name: String, kind: SymbolKind, range: Range) -> Self {
        Self {
            name,
            kind,
            range,
            path: None,
        }
    }

    #[must_use]
    pub fn with_path(name: String, kind: SymbolKind, range: Range, path: PathBuf) -> Self {
        Self {
            name,
            kind,
            range,
            path: Some(path),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> SymbolKind {
        self.kind
    }

    #[must_use]
    pub fn range(&self) -> Range {
        self.range
    }

    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

/// Hover contents at a position, flattened to plain text.
#[derive(Debug, Clone, Serialize)]
pub struct Hover {
    pub contents: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
}

/// One completion suggestion. `kind` is the raw LSP completion-item kind
/// code; consumers that care can map it themselves.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionItem {
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<u64>,
}

/// A file location, as returned by definition/reference queries.
#[derive(Debug, Clone, Serialize)]
pub struct Location {
    pub path: PathBuf,
    pub range: Range,
}

/// Cached analysis result for one file.
///
/// Created by `analyze_file` and cached by path; it is never invalidated
/// automatically when the file changes on disk.
#[derive(Debug, Clone, Serialize)]
pub struct FileContext {
    path: PathBuf,
    /// LSP language id, or `None` when no registered server claims the
    /// file's extension.
    language: Option<String>,
    symbols: Vec<Symbol>,
    diagnostics: Vec<Diagnostic>,
    workspace_root: PathBuf,
}

impl FileContext {
    #[must_use]
    pub fn new(
        path: PathBuf,
        language: Option<String>,
        symbols: Vec<Symbol>,
        diagnostics: Vec<Diagnostic>,
        workspace_root: PathBuf,
    ) -> Self {
        Self {
            path,
            language,
            symbols,
            diagnostics,
            workspace_root,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn language(&self) -> Option<&str> {
        self.language.as_deref()
    }

    #[must_use]
    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }

    #[must_use]
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    #[must_use]
    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    #[must_use]
    pub fn has_errors(&self) -> bool {
        self.diagnostics.iter().any(|d| d.severity().is_error())
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| d.severity().is_error())
            .count()
    }
}

/// Identity of one protocol client: a workspace root paired with the server
/// that covers it. At most one client exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientKey {
    root: PathBuf,
    server_id: String,
}

impl ClientKey {
    #[must_use]
    pub fn new(root: PathBuf, server_id: impl Into<String>) -> Self {
        Self {
            root,
            server_id: server_id.into(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    /// Whether this key's workspace root is `root` or lies beneath it.
    /// Comparison is component-wise, so `/proj` does not cover `/proj2`.
    #[must_use]
    pub fn under_root(&self, root: &Path) -> bool {
        self.root.starts_with(root)
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.root.display(), self.server_id)
    }
}

/// Why a client stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Server closed its side of the channel.
    Exited,
    /// Reader failed or the process died unexpectedly.
    Failed(String),
}

/// An event pushed from a protocol client to the manager's channel.
#[derive(Debug)]
pub enum LspEvent {
    /// A server published diagnostics for a file (wholesale replacement).
    Diagnostics {
        key: ClientKey,
        path: PathBuf,
        items: Vec<Diagnostic>,
    },
    /// A client's process exited or its reader failed.
    ClientStopped { key: ClientKey, reason: StopReason },
}

/// Diagnostic counts by severity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DiagnosticTally {
    pub errors: usize,
    pub warnings: usize,
    pub infos: usize,
    pub hints: usize,
}

impl DiagnosticTally {
    pub fn record(&mut self, severity: DiagnosticSeverity) {
        match severity {
            DiagnosticSeverity::Error => self.errors += 1,
            DiagnosticSeverity::Warning => self.warnings += 1,
            DiagnosticSeverity::Information => self.infos += 1,
            DiagnosticSeverity::Hint => self.hints += 1,
        }
    }

    #[must_use]
    pub fn total(&self) -> usize {
        self.errors + self.warnings + self.infos + self.hints
    }
}

/// Symbol counts by bucket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SymbolTally {
    pub functions: usize,
    pub classes: usize,
    pub interfaces: usize,
    pub variables: usize,
}

impl SymbolTally {
    pub fn record(&mut self, kind: SymbolKind) {
        match kind.bucket() {
            Some(SymbolBucket::Function) => self.functions += 1,
            Some(SymbolBucket::Class) => self.classes += 1,
            Some(SymbolBucket::Interface) => self.interfaces += 1,
            Some(SymbolBucket::Variable) => self.variables += 1,
            None => {}
        }
    }
}

/// Aggregate report for one workspace root, computed on demand.
#[derive(Debug, Clone, Serialize)]
pub struct WorkspaceInsights {
    pub root: PathBuf,
    /// Files tracked by clients under `root`.
    pub files_analyzed: usize,
    /// Language id → tracked file count.
    pub languages: BTreeMap<String, usize>,
    /// Toolchains detected from marker files at the root (e.g. "cargo").
    pub frameworks: Vec<String>,
    pub diagnostics: DiagnosticTally,
    pub symbols: SymbolTally,
    /// Human-readable problem statements derived from the tallies.
    pub problems: Vec<String>,
    /// Suggested follow-up actions.
    pub suggestions: Vec<String>,
}
