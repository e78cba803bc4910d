//! User-facing language-server settings.
//!
//! The built-in server catalog lives in `loupe-lsp`; these types carry the
//! overrides a user may layer on top of it (swap a command, add arguments,
//! disable a server, or define an entirely new one). Raw deserialization
//! structs stay private; the `try_from` boundary rejects nonsense before it
//! can reach the spawn path.

use serde::Deserialize;
use std::collections::HashMap;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerOverrideError {
    #[error("server command must not be empty")]
    EmptyCommand,
    #[error("language_id must not be empty")]
    EmptyLanguageId,
    #[error("file extension must not be empty")]
    EmptyExtension,
}

#[derive(Deserialize)]
struct RawServerOverride {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Option<Vec<String>>,
    #[serde(default)]
    language_id: Option<String>,
    #[serde(default)]
    file_extensions: Option<Vec<String>>,
    #[serde(default)]
    root_markers: Option<Vec<String>>,
    #[serde(default)]
    init_options: Option<serde_json::Value>,
    #[serde(default)]
    disabled: bool,
}

/// Validated override for one language server.
///
/// Invariant: when present, `command` and `language_id` are non-empty and
/// every file extension is non-empty with no leading dot (enforced via
/// `#[serde(try_from)]` at the deserialization boundary). Absent fields mean
/// "keep the built-in value".
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawServerOverride")]
pub struct ServerOverride {
    command: Option<String>,
    args: Option<Vec<String>>,
    language_id: Option<String>,
    file_extensions: Option<Vec<String>>,
    root_markers: Option<Vec<String>>,
    init_options: Option<serde_json::Value>,
    disabled: bool,
}

impl TryFrom<RawServerOverride> for ServerOverride {
    type Error = ServerOverrideError;

    fn try_from(raw: RawServerOverride) -> Result<Self, Self::Error> {
        if let Some(command) = &raw.command
            && command.trim().is_empty()
        {
            return Err(ServerOverrideError::EmptyCommand);
        }
        if let Some(language_id) = &raw.language_id
            && language_id.trim().is_empty()
        {
            return Err(ServerOverrideError::EmptyLanguageId);
        }
        let file_extensions = match raw.file_extensions {
            Some(exts) => {
                let mut normalized = Vec::with_capacity(exts.len());
                for ext in exts {
                    let trimmed = ext.trim().trim_start_matches('.');
                    if trimmed.is_empty() {
                        return Err(ServerOverrideError::EmptyExtension);
                    }
                    normalized.push(trimmed.to_ascii_lowercase());
                }
                Some(normalized)
            }
            None => None,
        };
        Ok(Self {
            command: raw.command,
            args: raw.args,
            language_id: raw.language_id,
            file_extensions,
            root_markers: raw.root_markers,
            init_options: raw.init_options,
            disabled: raw.disabled,
        })
    }
}

impl ServerOverride {
    #[must_use]
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    #[must_use]
    pub fn args(&self) -> Option<&[String]> {
        self.args.as_deref()
    }

    #[must_use]
    pub fn language_id(&self) -> Option<&str> {
        self.language_id.as_deref()
    }

    #[must_use]
    pub fn file_extensions(&self) -> Option<&[String]> {
        self.file_extensions.as_deref()
    }

    #[must_use]
    pub fn root_markers(&self) -> Option<&[String]> {
        self.root_markers.as_deref()
    }

    #[must_use]
    pub fn init_options(&self) -> Option<&serde_json::Value> {
        self.init_options.as_ref()
    }

    #[must_use]
    pub fn disabled(&self) -> bool {
        self.disabled
    }
}

/// LSP settings: per-server overrides keyed by server id (e.g. "rust").
///
/// There is no `enabled` flag here; the config loader only constructs this
/// type when the LSP subsystem is active, and an empty map means "built-in
/// catalog as shipped".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LspSettings {
    #[serde(default)]
    servers: HashMap<String, ServerOverride>,
}

impl LspSettings {
    /// Construct from a validated override map.
    #[must_use]
    pub fn new(servers: HashMap<String, ServerOverride>) -> Self {
        Self { servers }
    }

    #[must_use]
    pub fn servers(&self) -> &HashMap<String, ServerOverride> {
        &self.servers
    }

    #[must_use]
    pub fn get(&self, server_id: &str) -> Option<&ServerOverride> {
        self.servers.get(server_id)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}
