//! Denylist of secret-bearing environment variables.
//!
//! Language servers (and any other child process Loupe spawns) inherit the
//! parent environment. Provider keys and loader-injection variables have no
//! business there, so the spawn path strips everything matching this list
//! before `exec`.

/// Patterns for environment variables that must not reach child processes.
///
/// A leading `*` anchors at the end of the key, a trailing `*` at the start,
/// both means substring, neither means exact match. Matching is
/// case-insensitive.
pub const ENV_SECRET_DENYLIST: &[&str] = &[
    "*_KEY",
    "*_TOKEN",
    "*_SECRET*",
    "*_CREDENTIAL*",
    "*_PASSWORD*",
    "AWS_*",
    "AZURE_*",
    "OPENAI_*",
    "ANTHROPIC_*",
    "GOOGLE_*",
    "DYLD_*",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
];

/// Match one denylist pattern against an environment variable name.
fn pattern_matches(pattern: &str, key_upper: &str) -> bool {
    let pat = pattern.to_ascii_uppercase();
    let core = pat.trim_matches('*');
    match (pat.starts_with('*'), pat.ends_with('*')) {
        (true, true) => key_upper.contains(core),
        (true, false) => key_upper.ends_with(core),
        (false, true) => key_upper.starts_with(core),
        (false, false) => key_upper == core,
    }
}

/// Whether `key` names a variable that must not leak into child processes.
#[must_use]
pub fn is_secret_env(key: &str) -> bool {
    let upper = key.to_ascii_uppercase();
    ENV_SECRET_DENYLIST
        .iter()
        .any(|pat| pattern_matches(pat, &upper))
}
