//! Application configuration for starload.
//!
//! User config lives at `~/.starload/starload.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, StarloadError};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "starload.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".starload";

// ---------------------------------------------------------------------------
// Config structs (matching starload.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Artifact store the raw files are fetched from.
    #[serde(default)]
    pub source: SourceConfig,

    /// Bulk loader settings.
    #[serde(default)]
    pub load: LoadConfig,

    /// Database location.
    #[serde(default)]
    pub store: StoreConfig,

    /// Validator settings.
    #[serde(default)]
    pub validate: ValidateConfig,
}

/// `[source]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the artifact store: `https://…/` or `file:///…/`.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://github.com/nikitarogers333/ads507-team4-project/releases/download/v1.0-raw-data/".into()
}
fn default_timeout_secs() -> u64 {
    120
}

/// `[load]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    /// The only directory the loader may read source files from.
    /// The extractor writes its output here.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Bulk loading must be switched on explicitly.
    #[serde(default)]
    pub bulk_load_enabled: bool,

    /// Rows per multi-row INSERT statement.
    #[serde(default = "default_batch_rows")]
    pub batch_rows: usize,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            bulk_load_enabled: false,
            batch_rows: default_batch_rows(),
        }
    }
}

fn default_data_dir() -> String {
    "var/data/raw".into()
}
fn default_batch_rows() -> usize {
    500
}

/// `[store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_store_path() -> String {
    "var/starload.db".into()
}

/// `[validate]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidateConfig {
    /// Rows sampled and printed from each analytical view.
    #[serde(default = "default_sample_rows")]
    pub sample_rows: u32,

    /// Row-count bounds overriding the defaults for specific tables.
    #[serde(default)]
    pub bounds: Vec<RowBound>,
}

impl Default for ValidateConfig {
    fn default() -> Self {
        Self {
            sample_rows: default_sample_rows(),
            bounds: Vec::new(),
        }
    }
}

fn default_sample_rows() -> u32 {
    5
}

/// `[[validate.bounds]]` entry: inclusive row-count range for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowBound {
    pub table: String,
    pub min: u64,
    pub max: u64,
}

impl ValidateConfig {
    /// Bound for `table`: an explicit override, else `[1, DEFAULT_MAX_ROWS]`.
    pub fn bound_for(&self, table: &str) -> RowBound {
        self.bounds
            .iter()
            .find(|b| b.table == table)
            .cloned()
            .unwrap_or_else(|| RowBound {
                table: table.to_string(),
                min: 1,
                max: DEFAULT_MAX_ROWS,
            })
    }
}

/// Upper row-count bound applied when a table has no override.
pub const DEFAULT_MAX_ROWS: u64 = 5_000_000;

// ---------------------------------------------------------------------------
// Runtime config (merged from config + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime pipeline configuration, merged from config file + CLI flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Parsed artifact store base URL.
    pub base_url: Url,
    /// Request timeout for remote fetches.
    pub timeout_secs: u64,
    /// Data dir shared by extractor (writer) and loader (reader).
    pub data_dir: PathBuf,
    /// Whether the loader may run.
    pub bulk_load_enabled: bool,
    /// Rows per INSERT batch.
    pub batch_rows: usize,
    /// Validator settings: view sample size and row-count bounds.
    pub validate: ValidateConfig,
}

impl TryFrom<&AppConfig> for RunConfig {
    type Error = StarloadError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        let base_url = parse_base_url(&config.source.base_url)?;
        if config.load.batch_rows == 0 {
            return Err(StarloadError::config("load.batch_rows must be at least 1"));
        }
        Ok(Self {
            base_url,
            timeout_secs: config.source.timeout_secs,
            data_dir: PathBuf::from(&config.load.data_dir),
            bulk_load_enabled: config.load.bulk_load_enabled,
            batch_rows: config.load.batch_rows,
            validate: config.validate.clone(),
        })
    }
}

/// Parse an artifact-store base URL, forcing a trailing slash so object
/// names join underneath it rather than replacing the last segment.
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)
        .map_err(|e| StarloadError::config(format!("invalid source.base_url '{raw}': {e}")))?;
    match url.scheme() {
        "http" | "https" | "file" => {}
        other => {
            return Err(StarloadError::config(format!(
                "unsupported source.base_url scheme '{other}': expected http, https, or file"
            )));
        }
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.starload/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| StarloadError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.starload/starload.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| StarloadError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| StarloadError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file with bulk
/// loading explicitly enabled. Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| StarloadError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let mut config = AppConfig::default();
    config.load.bulk_load_enabled = true;
    let content =
        toml::to_string_pretty(&config).map_err(|e| StarloadError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| StarloadError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
