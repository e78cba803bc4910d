//! Language server integration: a registry of known servers, per-workspace
//! protocol clients over child-process stdio, and a multiplexing manager
//! that routes files to clients and aggregates diagnostics and symbols.

pub mod codec;
pub mod types;

pub(crate) mod diagnostics;
pub(crate) mod insights;
pub(crate) mod protocol;

mod client;
mod manager;
mod registry;
mod workspace;

#[cfg(test)]
mod testing;

pub use client::ProtocolClient;
pub use manager::LspManager;
pub use registry::{InstallCommand, ServerDefinition, ServerRegistry};
pub use types::{
    ClientKey, CompletionItem, Diagnostic, DiagnosticSeverity, DiagnosticTally, FileContext,
    Hover, Location, LspEvent, Position, Range, StopReason, Symbol, SymbolBucket, SymbolKind,
    SymbolTally, WorkspaceInsights,
};
pub use workspace::{resolve_workspace_root, resolve_workspace_root_or_parent};
