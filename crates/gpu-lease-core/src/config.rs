//! Provider credential loading (design §4.7 "Configuration loading").
//!
//! Priority order: CLI flag overrides, then process environment variables,
//! then the dotfile at `~/.gpu-lease/credentials.toml` (or the path named by
//! `GPU_LEASE_CONFIG`). A missing key simply means that provider is absent
//! from the registry; only an empty registry is an error, and that is
//! surfaced by the registry itself, not here.

use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

/// The five provider names in their registry priority order (design §4.3).
pub const PROVIDER_ORDER: [&str; 5] = ["vast", "lambda", "runpod", "coreweave", "paperspace"];

fn env_var_for(provider: &str) -> &'static str {
    match provider {
        "vast" => "VAST_API_KEY",
        "lambda" => "LAMBDA_API_KEY",
        "runpod" => "RUNPOD_API_KEY",
        "coreweave" => "COREWEAVE_API_KEY",
        "paperspace" => "PAPERSPACE_API_KEY",
        _ => "",
    }
}

/// Loaded API keys, one slot per provider, in priority order. Absent ⇒ that
/// provider is not instantiated by the registry.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    keys: HashMap<String, String>,
}

impl Credentials {
    pub fn key_for(&self, provider: &str) -> Option<&str> {
        self.keys.get(provider).map(String::as_str)
    }

    pub fn configured_providers(&self) -> Vec<&str> {
        PROVIDER_ORDER
            .iter()
            .copied()
            .filter(|p| self.keys.contains_key(*p))
            .collect()
    }

    fn set(&mut self, provider: &str, key: String) {
        if !key.is_empty() {
            self.keys.insert(provider.to_string(), key);
        }
    }
}

/// The dotfile schema: a flat table of provider name to API key.
#[derive(Debug, Deserialize, Default)]
struct CredentialsFile {
    #[serde(flatten)]
    keys: HashMap<String, String>,
}

fn dotfile_path() -> PathBuf {
    if let Ok(path) = std::env::var("GPU_LEASE_CONFIG") {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".gpu-lease").join("credentials.toml")
}

/// Load credentials from the dotfile, if it exists. A missing file is not
/// an error; a present-but-unparsable file is.
fn load_dotfile() -> Result<CredentialsFile> {
    let path = dotfile_path();
    if !path.exists() {
        return Ok(CredentialsFile::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("reading credentials file {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("parsing credentials file {}", path.display()))
}

/// Load credentials in priority order: `overrides` (CLI flags) beat
/// environment variables, which beat the dotfile.
pub fn load_credentials(overrides: &HashMap<String, String>) -> Result<Credentials> {
    let dotfile = load_dotfile()?;
    let mut creds = Credentials::default();

    for provider in PROVIDER_ORDER {
        if let Some(key) = dotfile.keys.get(provider) {
            creds.set(provider, key.clone());
        }
        if let Ok(key) = std::env::var(env_var_for(provider)) {
            creds.set(provider, key);
        }
        if let Some(key) = overrides.get(provider) {
            creds.set(provider, key.clone());
        }
    }
    Ok(creds)
}

/// Parse a `--timeout` value (`Nh` or a bare integer, both meaning hours),
/// clamping to `[1, 72]`. Returns the clamped hours and whether clamping
/// changed the input (the CLI logs a warning exactly once when it did).
pub fn parse_timeout_hours(input: &str) -> Result<(u32, bool)> {
    let trimmed = input.trim();
    let digits = trimmed.strip_suffix(['h', 'H']).unwrap_or(trimmed);
    let hours: i64 = digits
        .parse()
        .with_context(|| format!("invalid --timeout value: {input}"))?;
    let clamped = hours.clamp(1, 72) as u32;
    Ok((clamped, clamped as i64 != hours))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bare_integer_hours() {
        assert_eq!(parse_timeout_hours("10").unwrap(), (10, false));
    }

    #[test]
    fn parses_suffixed_hours() {
        assert_eq!(parse_timeout_hours("6h").unwrap(), (6, false));
        assert_eq!(parse_timeout_hours("6H").unwrap(), (6, false));
    }

    #[test]
    fn clamps_out_of_range_values() {
        assert_eq!(parse_timeout_hours("999h").unwrap(), (72, true));
        assert_eq!(parse_timeout_hours("0").unwrap(), (1, true));
    }

    #[test]
    fn rejects_non_numeric_input() {
        assert!(parse_timeout_hours("forever").is_err());
    }

    #[test]
    fn credentials_respect_priority_order() {
        let mut overrides = HashMap::new();
        overrides.insert("vast".to_string(), "override-key".to_string());
        std::env::set_var("VAST_API_KEY", "env-key");
        let creds = load_credentials(&overrides).unwrap();
        assert_eq!(creds.key_for("vast"), Some("override-key"));
        std::env::remove_var("VAST_API_KEY");
    }
}
