//! Configuration loading and root folder resolution
//!
//! Settings come from a single TOML file (`legis.toml`). Every section is
//! optional: a missing file or a missing key falls back to compiled defaults,
//! so a bare install can run with nothing but an API key in the environment.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable overriding the root folder
pub const ROOT_ENV_VAR: &str = "LEGIS_ROOT";

/// Environment variable overriding the config file location
pub const CONFIG_ENV_VAR: &str = "LEGIS_CONFIG";

/// Top-level TOML configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    /// Root folder holding the record store and the target database
    pub root_folder: Option<PathBuf>,
    pub logging: LoggingConfig,
    pub sources: SourcesConfig,
    pub fetch: FetchConfig,
    pub migration: MigrationConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default tracing level (`RUST_LOG` and `--log-level` take precedence)
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Per-upstream sections: `[sources.congress]` and `[sources.lda]`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourcesConfig {
    pub congress: SourceSection,
    pub lda: SourceSection,
}

/// Raw settings for one upstream API
///
/// All fields are optional here; the ingest crate owns the per-source
/// defaults (rate ceilings differ between sources and auth modes).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceSection {
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Requests allowed per window when authenticated
    pub rate_limit: Option<u32>,
    /// Requests allowed per window when anonymous
    pub anonymous_rate_limit: Option<u32>,
    pub window_secs: Option<u64>,
    /// Minimum spacing between two requests, smooths bursts inside a window
    pub min_interval_ms: Option<u64>,
    pub page_size: Option<u32>,
    pub timeout_secs: Option<u64>,
}

/// `[fetch]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Worker pool size
    pub concurrency: usize,
    /// Attempt ceiling for transient upstream failures
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Jitter fraction in [0.0, 1.0]
    pub jitter: f64,
    /// Attempts for a single record/index write before the run aborts
    pub storage_write_attempts: u32,
    /// Automatic restarts of a run aborted by a storage failure
    pub max_restarts: u32,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_attempts: 4,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: 0.25,
            storage_write_attempts: 3,
            max_restarts: 2,
        }
    }
}

/// `[migration]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Rows (source records) per transaction
    pub batch_size: usize,
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_attempts: 5,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
        }
    }
}

/// Resolve the config file path
///
/// Priority: explicit path → `LEGIS_CONFIG` → `<config_dir>/legis/legis.toml`
pub fn resolve_config_path(cli_arg: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = cli_arg {
        return Some(path.to_path_buf());
    }

    if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
        if !path.trim().is_empty() {
            return Some(PathBuf::from(path));
        }
    }

    dirs::config_dir().map(|d| d.join("legis").join("legis.toml"))
}

/// Load TOML configuration
///
/// A missing file is not an error: defaults are returned and a warning logged.
/// A file that exists but does not parse is a configuration error.
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    if !path.exists() {
        warn!(
            path = %path.display(),
            "Config file not found, using defaults"
        );
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read TOML failed ({}): {}", path.display(), e)))?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse TOML failed ({}): {}", path.display(), e)))?;

    debug!(path = %path.display(), "Loaded config file");
    Ok(config)
}

/// Write TOML configuration atomically (temp sibling, fsync, rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("toml.tmp");
    {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(Error::Io(e));
    }

    Ok(())
}

/// Root folder resolution, in priority order:
/// 1. Command-line argument
/// 2. Environment variable
/// 3. TOML `root_folder`
/// 4. OS-dependent default
pub fn resolve_root_folder(
    cli_arg: Option<&Path>,
    env_var_name: &str,
    toml_config: &TomlConfig,
) -> PathBuf {
    if let Some(path) = cli_arg {
        return path.to_path_buf();
    }

    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }

    if let Some(path) = &toml_config.root_folder {
        return path.clone();
    }

    default_root_folder()
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("legis"))
        .unwrap_or_else(|| PathBuf::from("./legis_data"))
}

/// Layout of a resolved root folder
#[derive(Debug, Clone)]
pub struct RootLayout {
    root: PathBuf,
}

impl RootLayout {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the file-tier record store
    pub fn records_dir(&self) -> PathBuf {
        self.root.join("records")
    }

    /// Relational target database
    pub fn database_path(&self) -> PathBuf {
        self.root.join("legis.db")
    }

    /// Create the root and records directories if missing
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.records_dir())?;
        Ok(())
    }
}

/// Standard User-Agent for outbound HTTP requests
pub fn get_user_agent() -> String {
    format!(
        "legis-ingest/{} (+https://github.com/legis-data/legis)",
        env!("CARGO_PKG_VERSION")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_section_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            [fetch]
            concurrency = 12

            [sources.congress]
            api_key = "abc"
            "#,
        )
        .unwrap();

        assert_eq!(config.fetch.concurrency, 12);
        assert_eq!(config.fetch.max_attempts, FetchConfig::default().max_attempts);
        assert_eq!(config.migration, MigrationConfig::default());
        assert_eq!(config.sources.congress.api_key.as_deref(), Some("abc"));
        assert!(config.sources.lda.api_key.is_none());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_cli_root_wins() {
        let config = TomlConfig {
            root_folder: Some(PathBuf::from("/from/toml")),
            ..Default::default()
        };
        let root = resolve_root_folder(
            Some(Path::new("/from/cli")),
            "LEGIS_TEST_UNUSED_ROOT_VAR",
            &config,
        );
        assert_eq!(root, PathBuf::from("/from/cli"));
    }

    #[test]
    fn test_root_layout_paths() {
        let layout = RootLayout::new(PathBuf::from("/data/legis"));
        assert_eq!(layout.records_dir(), PathBuf::from("/data/legis/records"));
        assert_eq!(layout.database_path(), PathBuf::from("/data/legis/legis.db"));
    }
}
