use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use log::info;
use serde::{Deserialize, Deserializer};

/// watcher名。bucket名やconfigディレクトリ名に利用する。
pub const WATCHER_NAME: &str = "aw-watcher-toggl";

/// 初回起動時に書き出すデフォルト設定。
const DEFAULT_CONFIG: &str = r#"# Toggl API token
api_token = ""
# Polling time in seconds
poll_time = 300.0
# Whether to backfill missing data at startup
backfill = false
# Format: "YYYY-MM-DD" Day is ignored!
backfill_since = ""
# Whether to update existing events
update_existing_events = true
"#;

/// watcherの設定。
#[derive(Debug, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_token: String,
    pub poll_time: f64,
    pub backfill: bool,
    #[serde(deserialize_with = "deserialize_backfill_since")]
    pub backfill_since: Option<NaiveDate>,
    pub update_existing_events: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_token: String::new(),
            poll_time: 300.0,
            backfill: false,
            backfill_since: None,
            update_existing_events: true,
        }
    }
}

/// 設定ファイルを置くディレクトリを返す。
pub fn config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().context("Failed to resolve the user config directory")?;

    Ok(base.join(WATCHER_NAME))
}

/// 設定を読み込む。
///
/// 設定ファイルが存在しない場合はデフォルト設定を書き出してから読み込む。
pub fn load() -> Result<Config> {
    load_from(&config_dir()?.join("config.toml"))
}

/// 指定されたパスから設定を読み込む。
pub fn load_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(path, DEFAULT_CONFIG)
            .with_context(|| format!("Failed to write default config to {}", path.display()))?;
        info!("Wrote default config to {}", path.display());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse {}", path.display()))?;

    Ok(config)
}

/// `backfill_since`をパースする。空文字列は未設定として扱う。
fn deserialize_backfill_since<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = String::deserialize(deserializer)?;
    if value.is_empty() {
        return Ok(None);
    }

    NaiveDate::parse_from_str(&value, "%Y-%m-%d")
        .map(Some)
        .map_err(serde::de::Error::custom)
}
