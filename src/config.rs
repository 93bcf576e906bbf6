//! TOML configuration parsing and validation.
//!
//! See `config/redirects.example.toml` for a full example.

use anyhow::{Context, Result};
use redirects_core::{Dimension, RedirectCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub resolver: ResolverConfig,
    #[serde(default)]
    pub dimensions: DimensionsConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DbConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn default_max_connections() -> u32 {
    5
}
fn default_busy_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Bulk-write and timeout settings for the durable store.
#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

fn default_batch_size() -> usize {
    1000
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct IndexConfig {
    /// Periodic reload interval; `0` reloads on change signals only.
    #[serde(default)]
    pub poll_interval_secs: u64,
}

impl IndexConfig {
    pub fn poll_interval(&self) -> Option<Duration> {
        (self.poll_interval_secs > 0).then(|| Duration::from_secs(self.poll_interval_secs))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResolverConfig {
    #[serde(default = "default_reserved_prefixes")]
    pub reserved_prefixes: Vec<String>,
    #[serde(default = "default_excluded_substrings")]
    pub excluded_substrings: Vec<String>,
    #[serde(default)]
    pub standard_redirects: bool,
    #[serde(default)]
    pub patterns: Vec<PatternConfig>,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            reserved_prefixes: default_reserved_prefixes(),
            excluded_substrings: default_excluded_substrings(),
            standard_redirects: false,
            patterns: Vec::new(),
        }
    }
}

fn default_reserved_prefixes() -> Vec<String> {
    vec!["/services".to_string(), "/gateway".to_string()]
}
fn default_excluded_substrings() -> Vec<String> {
    vec!["/_next/".to_string()]
}

/// A regex matcher: `target` may reference capture groups (`$1`, `$name`).
#[derive(Debug, Deserialize, Clone)]
pub struct PatternConfig {
    pub pattern: String,
    pub target: String,
    #[serde(default = "default_pattern_code")]
    pub code: u16,
}

fn default_pattern_code() -> u16 {
    301
}

#[derive(Debug, Deserialize, Clone)]
pub struct DimensionsConfig {
    #[serde(default = "default_dimension")]
    pub default: String,
    /// `Host` header value → dimension.
    #[serde(default)]
    pub hosts: HashMap<String, String>,
}

impl Default for DimensionsConfig {
    fn default() -> Self {
        Self {
            default: default_dimension(),
            hosts: HashMap::new(),
        }
    }
}

impl DimensionsConfig {
    pub fn default_dimension(&self) -> Dimension {
        Dimension::new(self.default.clone())
    }
}

fn default_dimension() -> String {
    "global".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    /// Glob patterns no manual redirect may use as its source.
    #[serde(default)]
    pub restricted_sources: Vec<String>,
    #[serde(default)]
    pub automatic_initially_stale: bool,
    #[serde(default = "default_user")]
    pub default_user: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            restricted_sources: Vec::new(),
            automatic_initially_stale: false,
            default_user: default_user(),
        }
    }
}

fn default_user() -> String {
    "unknown".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    parse_config(&content)
}

/// Parses and validates configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    if config.db.max_connections == 0 {
        anyhow::bail!("db.max_connections must be > 0");
    }
    if config.store.batch_size == 0 {
        anyhow::bail!("store.batch_size must be > 0");
    }
    if config.store.max_retries < 1 {
        anyhow::bail!("store.max_retries must be >= 1");
    }
    if config.dimensions.default.trim().is_empty() {
        anyhow::bail!("dimensions.default must not be empty");
    }

    for (i, p) in config.resolver.patterns.iter().enumerate() {
        regex::Regex::new(&p.pattern)
            .with_context(|| format!("resolver.patterns[{}]: invalid regex '{}'", i, p.pattern))?;
        RedirectCode::try_from(p.code)
            .with_context(|| format!("resolver.patterns[{}]: invalid code", i))?;
    }

    for glob in &config.api.restricted_sources {
        globset::Glob::new(glob)
            .with_context(|| format!("api.restricted_sources: invalid glob '{}'", glob))?;
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [db]
        path = "./data/redirects.sqlite"

        [server]
        bind = "127.0.0.1:8080"
    "#;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.store.batch_size, 1000);
        assert_eq!(config.store.max_retries, 3);
        assert_eq!(config.store.retry_backoff(), Duration::from_millis(200));
        assert_eq!(config.store.timeout(), Duration::from_secs(10));
        assert_eq!(config.index.poll_interval(), None);
        assert_eq!(config.resolver.reserved_prefixes, vec!["/services", "/gateway"]);
        assert!(!config.resolver.standard_redirects);
        assert_eq!(config.dimensions.default_dimension().as_str(), "global");
        assert_eq!(config.api.default_user, "unknown");
    }

    #[test]
    fn test_full_config() {
        let toml = format!(
            "{MINIMAL}\n{}",
            r#"
            [index]
            poll_interval_secs = 30

            [resolver]
            reserved_prefixes = ["/api"]
            excluded_substrings = []
            standard_redirects = true

            [[resolver.patterns]]
            pattern = "^/legacy/(?P<rest>.*)$"
            target = "/$rest"
            code = 302

            [dimensions]
            default = "de"
            hosts = { "www.example.fr" = "fr" }

            [api]
            restricted_sources = ["/checkout/*"]
            automatic_initially_stale = true
            "#
        );
        let config = parse_config(&toml).unwrap();
        assert_eq!(config.index.poll_interval(), Some(Duration::from_secs(30)));
        assert_eq!(config.resolver.patterns[0].code, 302);
        assert_eq!(config.dimensions.hosts["www.example.fr"], "fr");
        assert!(config.api.automatic_initially_stale);
    }

    #[test]
    fn test_db_defaults_and_overrides() {
        let config = parse_config(MINIMAL).unwrap();
        assert_eq!(config.db.max_connections, 5);
        assert_eq!(config.db.busy_timeout(), Duration::from_secs(5));

        let toml = r#"
            [db]
            path = "./redirects.sqlite"
            max_connections = 1
            busy_timeout_ms = 250

            [server]
            bind = "127.0.0.1:8080"
        "#;
        let config = parse_config(toml).unwrap();
        assert_eq!(config.db.max_connections, 1);
        assert_eq!(config.db.busy_timeout(), Duration::from_millis(250));

        let zero = toml.replace("max_connections = 1", "max_connections = 0");
        assert!(parse_config(&zero).is_err());
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let toml = format!("{MINIMAL}\n[store]\nbatch_size = 0\n");
        assert!(parse_config(&toml).is_err());
    }

    #[test]
    fn test_rejects_bad_pattern_and_code() {
        let bad_regex = format!(
            "{MINIMAL}\n[[resolver.patterns]]\npattern = \"(\"\ntarget = \"/\"\n"
        );
        assert!(parse_config(&bad_regex).is_err());

        let bad_code = format!(
            "{MINIMAL}\n[[resolver.patterns]]\npattern = \"^/a$\"\ntarget = \"/b\"\ncode = 200\n"
        );
        assert!(parse_config(&bad_code).is_err());
    }

    #[test]
    fn test_rejects_bad_glob_and_empty_dimension() {
        let bad_glob = format!("{MINIMAL}\n[api]\nrestricted_sources = [\"/a/[\"]\n");
        assert!(parse_config(&bad_glob).is_err());

        let empty_dim = format!("{MINIMAL}\n[dimensions]\ndefault = \"\"\n");
        assert!(parse_config(&empty_dim).is_err());
    }

    #[test]
    fn test_example_config_parses() {
        let config = parse_config(include_str!("../config/redirects.example.toml")).unwrap();
        assert_eq!(config.resolver.patterns.len(), 1);
        assert_eq!(config.resolver.excluded_substrings, vec!["/_next/"]);
        assert_eq!(config.dimensions.hosts.len(), 2);
    }
}
