//! Heuristics behind workspace insight reports.
//!
//! Pure functions over tallies and the workspace root; the manager owns the
//! data collection.

use std::collections::BTreeMap;
use std::path::Path;

use crate::types::DiagnosticTally;

/// Above this many warnings the report flags them explicitly.
const WARNING_ADVISORY_THRESHOLD: usize = 10;

const TOOLCHAIN_MARKERS: &[(&str, &str)] = &[
    ("Cargo.toml", "cargo"),
    ("go.mod", "go"),
    ("Gemfile", "bundler"),
    ("pyproject.toml", "python"),
    ("requirements.txt", "pip"),
    ("tsconfig.json", "typescript"),
    ("package.json", "node"),
];

const NODE_FRAMEWORKS: &[(&str, &str)] = &[
    ("react", "react"),
    ("vue", "vue"),
    ("@angular/core", "angular"),
    ("svelte", "svelte"),
    ("next", "next.js"),
    ("express", "express"),
    ("@nestjs/core", "nestjs"),
];

const PYTHON_FRAMEWORKS: &[&str] = &["django", "flask", "fastapi"];

/// Detect toolchains and frameworks from marker files at the workspace
/// root. Best effort; unreadable or malformed files contribute nothing.
pub(crate) fn detect_frameworks(root: &Path) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    for (marker, name) in TOOLCHAIN_MARKERS {
        if root.join(marker).exists() {
            found.push((*name).to_string());
        }
    }

    if let Ok(raw) = std::fs::read_to_string(root.join("package.json"))
        && let Ok(manifest) = serde_json::from_str::<serde_json::Value>(&raw)
    {
        for section in ["dependencies", "devDependencies"] {
            let Some(deps) = manifest.get(section).and_then(|d| d.as_object()) else {
                continue;
            };
            for (dep, framework) in NODE_FRAMEWORKS {
                if deps.contains_key(*dep) && !found.iter().any(|f| f == framework) {
                    found.push((*framework).to_string());
                }
            }
        }
    }

    if let Ok(raw) = std::fs::read_to_string(root.join("requirements.txt")) {
        for framework in PYTHON_FRAMEWORKS {
            let listed = raw
                .lines()
                .any(|line| line.trim().to_ascii_lowercase().starts_with(framework));
            if listed && !found.iter().any(|f| f == framework) {
                found.push((*framework).to_string());
            }
        }
    }

    found
}

/// Problem statements derived from diagnostic counts. An empty workspace is
/// called out so zero diagnostics is not mistaken for a clean bill.
pub(crate) fn derive_problems(diagnostics: &DiagnosticTally, files_analyzed: usize) -> Vec<String> {
    let mut problems = Vec::new();
    if files_analyzed == 0 {
        problems.push(
            "No files have been analyzed yet; diagnostic counts may not reflect the workspace"
                .to_string(),
        );
        return problems;
    }
    if diagnostics.errors > 0 {
        let (noun, verb) = if diagnostics.errors == 1 {
            ("error", "needs")
        } else {
            ("errors", "need")
        };
        problems.push(format!(
            "{} compilation {noun} {verb} fixing",
            diagnostics.errors
        ));
    }
    if diagnostics.warnings > WARNING_ADVISORY_THRESHOLD {
        problems.push(format!(
            "{} warnings may be worth addressing",
            diagnostics.warnings
        ));
    }
    problems
}

/// Follow-up commands suggested per language that has errors.
pub(crate) fn derive_suggestions(errors_by_language: &BTreeMap<String, usize>) -> Vec<String> {
    let mut suggestions: Vec<String> = Vec::new();
    for (language, count) in errors_by_language {
        if *count == 0 {
            continue;
        }
        let suggestion = match language.as_str() {
            "typescript" | "typescriptreact" | "javascript" | "javascriptreact" => {
                "Run `tsc --noEmit` for the full TypeScript error list"
            }
            "rust" => "Run `cargo check` to confirm the fixes compile",
            "python" => "Run `pyright` over the project for the full report",
            "go" => "Run `go build ./...` to confirm the fixes compile",
            _ => continue,
        };
        if !suggestions.iter().any(|s| s == suggestion) {
            suggestions.push(suggestion.to_string());
        }
    }
    suggestions
}
