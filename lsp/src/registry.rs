//! Static catalog of supported language servers.
//!
//! The registry is pure data plus a spawn-side availability check. It holds
//! no runtime state; the manager owns client lifecycles.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, bail};
use loupe_types::LspSettings;
use tokio::process::Command;
use tracing::{info, warn};

/// Upper bound on a package-manager install invocation. Interactive or
/// wedged installers are killed rather than blocking server startup forever.
const INSTALL_TIMEOUT: Duration = Duration::from_secs(120);

/// How to install a server binary when it is absent from `PATH`.
#[derive(Debug, Clone)]
pub struct InstallCommand {
    command: String,
    args: Vec<String>,
}

impl InstallCommand {
    #[must_use]
    pub fn new(command: impl Into<String>, args: &[&str]) -> Self {
        Self {
            command: command.into(),
            args: args.iter().map(|&a| a.to_string()).collect(),
        }
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }
}

/// One supported language server: identity, file coverage, and how to spawn
/// it. Loaded once at startup, optionally adjusted by user settings.
#[derive(Debug, Clone)]
pub struct ServerDefinition {
    id: String,
    display_name: String,
    language_id: String,
    file_extensions: Vec<String>,
    root_markers: Vec<String>,
    command: String,
    args: Vec<String>,
    install: Option<InstallCommand>,
    init_options: Option<serde_json::Value>,
    /// Extension-specific language ids (e.g. `tsx` speaks `typescriptreact`
    /// to the same server).
    dialects: Vec<(String, String)>,
}

impl ServerDefinition {
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        display_name: impl Into<String>,
        language_id: impl Into<String>,
        file_extensions: &[&str],
        root_markers: &[&str],
        command: impl Into<String>,
        args: &[&str],
    ) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            language_id: language_id.into(),
            file_extensions: file_extensions.iter().map(|&e| e.to_string()).collect(),
            root_markers: root_markers.iter().map(|&m| m.to_string()).collect(),
            command: command.into(),
            args: args.iter().map(|&a| a.to_string()).collect(),
            install: None,
            init_options: None,
            dialects: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_install(mut self, install: InstallCommand) -> Self {
        self.install = Some(install);
        self
    }

    #[must_use]
    pub fn with_init_options(mut self, options: serde_json::Value) -> Self {
        self.init_options = Some(options);
        self
    }

    #[must_use]
    pub fn with_dialects(mut self, dialects: &[(&str, &str)]) -> Self {
        self.dialects = dialects
            .iter()
            .map(|&(ext, lang)| (ext.to_string(), lang.to_string()))
            .collect();
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    #[must_use]
    pub fn file_extensions(&self) -> &[String] {
        &self.file_extensions
    }

    #[must_use]
    pub fn root_markers(&self) -> &[String] {
        &self.root_markers
    }

    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub fn args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn init_options(&self) -> Option<&serde_json::Value> {
        self.init_options.as_ref()
    }

    /// Whether this server claims `path` by extension. Matching is
    /// case-insensitive on the extension.
    #[must_use]
    pub fn matches_path(&self, path: &Path) -> bool {
        let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.file_extensions.iter().any(|e| *e == ext)
    }

    /// Language id to open a file under, honoring per-extension dialects.
    #[must_use]
    pub fn language_id_for(&self, path: &Path) -> &str {
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            let ext = ext.to_ascii_lowercase();
            for (dialect_ext, lang) in &self.dialects {
                if *dialect_ext == ext {
                    return lang;
                }
            }
        }
        &self.language_id
    }

    /// Check that the server binary is on `PATH`, running the definition's
    /// install command (bounded) when it is not.
    pub async fn ensure_available(&self) -> anyhow::Result<()> {
        if which::which(&self.command).is_ok() {
            return Ok(());
        }
        let Some(install) = &self.install else {
            bail!("{} binary `{}` not found on PATH", self.display_name, self.command);
        };

        info!(
            server = %self.id,
            command = %install.command,
            "server binary missing, running install"
        );
        let mut child = Command::new(&install.command)
            .args(&install.args)
            // Installers must never wait on a TTY.
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to run installer `{}`", install.command))?;

        let status = match tokio::time::timeout(INSTALL_TIMEOUT, child.wait()).await {
            Ok(result) => result.context("installer did not report a status")?,
            Err(_) => {
                child.kill().await.ok();
                bail!(
                    "install of {} timed out after {}s",
                    self.display_name,
                    INSTALL_TIMEOUT.as_secs()
                );
            }
        };
        if !status.success() {
            bail!("install of {} failed with {status}", self.display_name);
        }
        if which::which(&self.command).is_err() {
            bail!(
                "{} binary `{}` still not found after install",
                self.display_name,
                self.command
            );
        }
        Ok(())
    }
}

/// The catalog of server definitions, in routing order.
#[derive(Debug, Clone)]
pub struct ServerRegistry {
    definitions: Vec<ServerDefinition>,
}

impl ServerRegistry {
    /// A registry over an explicit set of definitions, in routing order.
    #[must_use]
    pub fn new(definitions: Vec<ServerDefinition>) -> Self {
        Self { definitions }
    }

    /// The built-in catalog.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            definitions: vec![
                ServerDefinition::new(
                    "typescript",
                    "TypeScript Language Server",
                    "typescript",
                    &["ts", "tsx", "js", "jsx"],
                    &["tsconfig.json", "package.json"],
                    "typescript-language-server",
                    &["--stdio"],
                )
                .with_dialects(&[
                    ("tsx", "typescriptreact"),
                    ("js", "javascript"),
                    ("jsx", "javascriptreact"),
                ])
                .with_install(InstallCommand::new(
                    "npm",
                    &["install", "-g", "typescript-language-server", "typescript"],
                )),
                ServerDefinition::new(
                    "python",
                    "Pyright",
                    "python",
                    &["py", "pyi"],
                    &["pyproject.toml", "setup.py", "requirements.txt"],
                    "pyright-langserver",
                    &["--stdio"],
                )
                .with_install(InstallCommand::new("npm", &["install", "-g", "pyright"])),
                ServerDefinition::new(
                    "rust",
                    "rust-analyzer",
                    "rust",
                    &["rs"],
                    &["Cargo.toml"],
                    "rust-analyzer",
                    &[],
                )
                .with_install(InstallCommand::new(
                    "rustup",
                    &["component", "add", "rust-analyzer"],
                )),
                ServerDefinition::new(
                    "go",
                    "gopls",
                    "go",
                    &["go"],
                    &["go.mod"],
                    "gopls",
                    &[],
                )
                .with_install(InstallCommand::new(
                    "go",
                    &["install", "golang.org/x/tools/gopls@latest"],
                )),
                ServerDefinition::new(
                    "ruby",
                    "Solargraph",
                    "ruby",
                    &["rb"],
                    &["Gemfile"],
                    "solargraph",
                    &["stdio"],
                )
                .with_install(InstallCommand::new("gem", &["install", "solargraph"])),
            ],
        }
    }

    /// Apply user settings on top of the built-in catalog. Overrides patch
    /// matching definitions field by field, `disabled = true` removes one,
    /// and unknown ids add new definitions when they carry enough to spawn
    /// (command, language id, extensions). Incomplete additions are logged
    /// and skipped.
    #[must_use]
    pub fn with_overrides(mut self, settings: &LspSettings) -> Self {
        self.definitions.retain(|def| {
            !settings.get(&def.id).is_some_and(loupe_types::ServerOverride::disabled)
        });
        for def in &mut self.definitions {
            let Some(over) = settings.get(&def.id) else {
                continue;
            };
            if let Some(command) = over.command() {
                def.command = command.to_string();
            }
            if let Some(args) = over.args() {
                def.args = args.to_vec();
            }
            if let Some(language_id) = over.language_id() {
                def.language_id = language_id.to_string();
            }
            if let Some(extensions) = over.file_extensions() {
                def.file_extensions = extensions.to_vec();
            }
            if let Some(markers) = over.root_markers() {
                def.root_markers = markers.to_vec();
            }
            if let Some(options) = over.init_options() {
                def.init_options = Some(options.clone());
            }
        }

        let mut additions: Vec<_> = settings
            .servers()
            .iter()
            .filter(|(id, over)| {
                !over.disabled() && !self.definitions.iter().any(|d| d.id == **id)
            })
            .collect();
        additions.sort_unstable_by(|a, b| a.0.cmp(b.0));
        for (id, over) in additions {
            let (Some(command), Some(language_id), Some(extensions)) =
                (over.command(), over.language_id(), over.file_extensions())
            else {
                warn!(
                    server = %id,
                    "ignoring custom server: needs command, language_id and file_extensions"
                );
                continue;
            };
            self.definitions.push(ServerDefinition {
                id: id.clone(),
                display_name: id.clone(),
                language_id: language_id.to_string(),
                file_extensions: extensions.to_vec(),
                root_markers: over.root_markers().map(<[String]>::to_vec).unwrap_or_default(),
                command: command.to_string(),
                args: over.args().map(<[String]>::to_vec).unwrap_or_default(),
                install: None,
                init_options: over.init_options().cloned(),
                dialects: Vec::new(),
            });
        }
        self
    }

    /// Every definition claiming the file's extension, in registry order.
    /// Empty means "no LSP support for this file type", not an error.
    #[must_use]
    pub fn applicable_servers(&self, path: &Path) -> Vec<&ServerDefinition> {
        self.definitions
            .iter()
            .filter(|def| def.matches_path(path))
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<&ServerDefinition> {
        self.definitions.iter().find(|def| def.id == id)
    }

    #[must_use]
    pub fn definitions(&self) -> &[ServerDefinition] {
        &self.definitions
    }

    /// Union of every definition's root markers, for root resolution when no
    /// specific server is in play.
    #[must_use]
    pub fn all_root_markers(&self) -> Vec<&str> {
        let mut markers: Vec<&str> = Vec::new();
        for def in &self.definitions {
            for marker in &def.root_markers {
                if !markers.contains(&marker.as_str()) {
                    markers.push(marker);
                }
            }
        }
        markers
    }
}
