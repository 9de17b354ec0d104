//! Tape store configuration loading
//!
//! Loads configuration from `~/.config/tape/tape.toml` (or `TAPE_CONFIG` env).
//! Every field has a default, so a missing file yields a working config.

use crate::errors::{Result, TapeError};
use crate::types::ContextPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Env var that overrides the config file location.
pub const CONFIG_ENV: &str = "TAPE_CONFIG";

/// Sentinel `db_path` for a private in-memory database.
pub const MEMORY_DB_PATH: &str = ":memory:";

/// Root configuration for the tape store and service
#[derive(Debug, Deserialize, Clone)]
pub struct TapeConfig {
    /// Path to the SQLite database (`:memory:` for a throwaway store)
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Connection pool settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Full-text search settings
    #[serde(default)]
    pub search: SearchConfig,

    /// Context window settings
    #[serde(default)]
    pub context: ContextConfig,

    /// Anchor listing settings
    #[serde(default)]
    pub anchors: AnchorsConfig,

    /// Socket service settings
    #[serde(default)]
    pub service: ServiceConfig,
}

fn default_db_path() -> String {
    dirs::data_dir()
        .map(|d| d.join("tape").join("tape.db").to_string_lossy().into_owned())
        .unwrap_or_else(|| "tape.db".to_string())
}

/// Connection pool configuration
#[derive(Debug, Deserialize, Clone)]
pub struct PoolConfig {
    /// Maximum pooled connections
    #[serde(default = "default_max_size")]
    pub max_size: u32,

    /// How long to wait for a free connection before reporting `Busy`
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,

    /// SQLite busy timeout applied to every connection
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_max_size() -> u32 {
    8
}
fn default_connection_timeout_ms() -> u64 {
    5_000
}
fn default_busy_timeout_ms() -> u64 {
    5_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            connection_timeout_ms: default_connection_timeout_ms(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Search index configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    /// Payload field whose text is indexed
    #[serde(default = "default_text_field")]
    pub text_field: String,

    /// Result limit when the caller gives none
    #[serde(default = "default_search_limit")]
    pub default_limit: usize,

    /// Approximate tokens per snippet
    #[serde(default = "default_snippet_tokens")]
    pub snippet_tokens: u32,
}

fn default_text_field() -> String {
    "content".to_string()
}
fn default_search_limit() -> usize {
    20
}
fn default_snippet_tokens() -> u32 {
    12
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            text_field: default_text_field(),
            default_limit: default_search_limit(),
            snippet_tokens: default_snippet_tokens(),
        }
    }
}

/// Context window configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ContextConfig {
    /// Policy used when the caller does not name one (`last_anchor` or `full`)
    #[serde(default = "default_policy")]
    pub default_policy: String,
}

fn default_policy() -> String {
    "last_anchor".to_string()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            default_policy: default_policy(),
        }
    }
}

/// Anchor listing configuration
#[derive(Debug, Deserialize, Clone)]
pub struct AnchorsConfig {
    #[serde(default = "default_list_limit")]
    pub default_list_limit: usize,
}

fn default_list_limit() -> usize {
    50
}

impl Default for AnchorsConfig {
    fn default() -> Self {
        Self {
            default_list_limit: default_list_limit(),
        }
    }
}

/// Socket service configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Socket path override (defaults to `$XDG_RUNTIME_DIR/tape.sock`)
    #[serde(default)]
    pub socket_path: Option<String>,

    /// Caller-side timeout per request; expiry is reported as `Busy`
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Exit after this many idle seconds (0 = never)
    #[serde(default)]
    pub idle_timeout_secs: u64,
}

fn default_call_timeout_ms() -> u64 {
    5_000
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            socket_path: None,
            call_timeout_ms: default_call_timeout_ms(),
            idle_timeout_secs: 0,
        }
    }
}

impl Default for TapeConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            pool: PoolConfig::default(),
            search: SearchConfig::default(),
            context: ContextConfig::default(),
            anchors: AnchorsConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

impl TapeConfig {
    /// Load from `TAPE_CONFIG` or the default location; a missing file is not an error.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV)
            .map(PathBuf::from)
            .ok()
            .or_else(Self::default_config_path);

        match path {
            Some(path) if path.exists() => Self::load_from(&path),
            Some(path) => {
                tracing::debug!(path = %path.display(), "No tape config file, using defaults");
                Ok(Self::default())
            }
            None => Ok(Self::default()),
        }
    }

    /// Load from an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            TapeError::config_with_source(format!("failed to read {}", path.display()), e)
        })?;
        let cfg = Self::from_toml(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded tape config");
        Ok(cfg)
    }

    /// Parse and validate TOML text
    pub fn from_toml(raw: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(raw)
            .map_err(|e| TapeError::config_with_source("failed to parse tape config", e))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// A config pointing at an in-memory database (tests, scratch stores)
    pub fn in_memory() -> Self {
        Self {
            db_path: MEMORY_DB_PATH.to_string(),
            ..Self::default()
        }
    }

    /// A config pointing at `path`, everything else defaulted
    pub fn with_db_path(path: impl AsRef<Path>) -> Self {
        Self {
            db_path: path.as_ref().to_string_lossy().into_owned(),
            ..Self::default()
        }
    }

    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("tape").join("tape.toml"))
    }

    pub fn is_in_memory(&self) -> bool {
        self.db_path == MEMORY_DB_PATH
    }

    /// Resolved database path, expanding a leading `~/`
    pub fn resolved_db_path(&self) -> PathBuf {
        if let Some(rest) = self.db_path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(rest);
        }
        PathBuf::from(&self.db_path)
    }

    /// The configured default context policy
    pub fn default_context_policy(&self) -> ContextPolicy {
        ContextPolicy::parse_simple(&self.context.default_policy).unwrap_or_default()
    }

    fn validate(&self) -> Result<()> {
        if self.pool.max_size == 0 {
            return Err(TapeError::config("pool.max_size must be at least 1"));
        }
        if self.search.default_limit == 0 {
            return Err(TapeError::config("search.default_limit must be at least 1"));
        }
        if self.anchors.default_list_limit == 0 {
            return Err(TapeError::config(
                "anchors.default_list_limit must be at least 1",
            ));
        }
        if self.service.call_timeout_ms == 0 {
            return Err(TapeError::config(
                "service.call_timeout_ms must be at least 1",
            ));
        }
        if self.search.text_field.trim().is_empty() {
            return Err(TapeError::config("search.text_field must not be empty"));
        }
        if ContextPolicy::parse_simple(&self.context.default_policy).is_none() {
            return Err(TapeError::config(format!(
                "context.default_policy must be \"full\" or \"last_anchor\", got {:?}",
                self.context.default_policy
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorCategory;

    #[test]
    fn empty_toml_yields_defaults() {
        let cfg = TapeConfig::from_toml("").expect("parse");
        assert_eq!(cfg.pool.max_size, 8);
        assert_eq!(cfg.search.text_field, "content");
        assert_eq!(cfg.service.call_timeout_ms, 5_000);
        assert_eq!(cfg.default_context_policy(), ContextPolicy::LastAnchor);
    }

    #[test]
    fn sections_override_defaults() {
        let cfg = TapeConfig::from_toml(
            r#"
            db_path = ":memory:"

            [pool]
            max_size = 2
            busy_timeout_ms = 250

            [search]
            text_field = "text"

            [context]
            default_policy = "full"
            "#,
        )
        .expect("parse");
        assert!(cfg.is_in_memory());
        assert_eq!(cfg.pool.max_size, 2);
        assert_eq!(cfg.pool.busy_timeout_ms, 250);
        assert_eq!(cfg.pool.connection_timeout_ms, 5_000);
        assert_eq!(cfg.search.text_field, "text");
        assert_eq!(cfg.default_context_policy(), ContextPolicy::Full);
    }

    #[test]
    fn config_without_service_section_keeps_call_timeout() {
        let cfg = TapeConfig::from_toml("db_path = \":memory:\"\n").expect("parse");
        assert_eq!(cfg.service.call_timeout_ms, 5_000);
        assert_eq!(cfg.service.idle_timeout_secs, 0);

        let cfg = TapeConfig::from_toml("[service]\nidle_timeout_secs = 60\n").expect("parse");
        assert_eq!(cfg.service.call_timeout_ms, 5_000);
        assert_eq!(cfg.service.idle_timeout_secs, 60);
    }

    #[test]
    fn zero_call_timeout_is_rejected() {
        let err = TapeConfig::from_toml("[service]\ncall_timeout_ms = 0\n").expect_err("invalid");
        assert_eq!(err.category(), ErrorCategory::Config);
    }

    #[test]
    fn zero_pool_is_rejected() {
        let err = TapeConfig::from_toml("[pool]\nmax_size = 0\n").expect_err("invalid");
        assert_eq!(err.category(), ErrorCategory::Config);
    }

    #[test]
    fn unknown_policy_is_rejected() {
        let err = TapeConfig::from_toml("[context]\ndefault_policy = \"sometimes\"\n")
            .expect_err("invalid");
        assert_eq!(err.category(), ErrorCategory::Config);
    }
}
