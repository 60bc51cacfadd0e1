use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Application configuration, loaded entirely from the environment.
///
/// Field names match the lowercased form of their environment variable, which is how
/// the `config` crate's [`config::Environment`] source presents them after lowercasing keys.
#[derive(Debug, Deserialize)]
pub struct Config {
    pub telegram_api_id: Option<i32>,
    pub telegram_api_hash: Option<String>,
    pub telegram_phone_number: Option<String>,

    #[serde(default = "default_mcp_host")]
    pub mcp_host: String,
    #[serde(default = "default_mcp_port")]
    pub mcp_port: u16,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub sync_batch_size: u32,
    #[serde(default = "default_inter_job_delay_secs")]
    pub sync_inter_job_delay_secs: u64,
    #[serde(default = "default_inter_batch_delay_ms")]
    pub sync_inter_batch_delay_ms: u64,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_sync_target")]
    pub default_sync_target: u32,
}

fn default_mcp_host() -> String {
    "127.0.0.1".to_string()
}
fn default_mcp_port() -> u16 {
    8080
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_batch_size() -> u32 {
    100
}
fn default_inter_job_delay_secs() -> u64 {
    3
}
fn default_inter_batch_delay_ms() -> u64 {
    1100
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_sync_target() -> u32 {
    1000
}

impl Config {
    /// Path to the session blob.
    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join("session.json")
    }

    /// Path to the archive database.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("messages.db")
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.mcp_host, self.mcp_port)
    }
}

/// Load configuration from the environment, optionally seeded by a `.env` file.
pub fn load_config() -> Result<Config> {
    dotenv::dotenv().ok();

    let builder = config::Config::builder().add_source(config::Environment::default().try_parsing(true));
    let config: Config = builder
        .build()
        .context("building configuration from environment")?
        .try_deserialize()
        .context("deserializing configuration")?;

    Ok(config)
}

/// Validate required fields, surfacing human-readable messages.
pub fn validate_config(config: &Config) -> Result<()> {
    match config.telegram_api_id {
        None | Some(0) => {
            anyhow::bail!("TELEGRAM_API_ID is required and must be non-zero (get one at https://my.telegram.org)");
        }
        _ => {}
    }

    if config.telegram_api_hash.as_deref().is_none_or(str::is_empty) {
        anyhow::bail!("TELEGRAM_API_HASH is required and must be non-empty");
    }

    let phone = config
        .telegram_phone_number
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("TELEGRAM_PHONE_NUMBER is required"))?;
    if !phone.starts_with('+') {
        anyhow::bail!("TELEGRAM_PHONE_NUMBER must be in E.164 format (start with '+'): got '{phone}'");
    }

    if config.sync_batch_size == 0 {
        anyhow::bail!("SYNC_BATCH_SIZE must be greater than zero");
    }

    Ok(())
}

/// Ensure the data directory (and therefore the parent of the session file and the
/// archive DB) exists before either subsystem tries to open its file.
pub fn ensure_data_dir(path: &Path) -> Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("creating data directory: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            telegram_api_id: Some(12345),
            telegram_api_hash: Some("hash".to_string()),
            telegram_phone_number: Some("+15551234567".to_string()),
            mcp_host: default_mcp_host(),
            mcp_port: default_mcp_port(),
            data_dir: default_data_dir(),
            sync_batch_size: default_batch_size(),
            sync_inter_job_delay_secs: default_inter_job_delay_secs(),
            sync_inter_batch_delay_ms: default_inter_batch_delay_ms(),
            log_level: default_log_level(),
            default_sync_target: default_sync_target(),
        }
    }

    #[test]
    fn rejects_missing_api_id() {
        let mut config = base_config();
        config.telegram_api_id = None;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_zero_api_id() {
        let mut config = base_config();
        config.telegram_api_id = Some(0);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_empty_api_hash() {
        let mut config = base_config();
        config.telegram_api_hash = Some(String::new());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn rejects_phone_without_plus() {
        let mut config = base_config();
        config.telegram_phone_number = Some("15551234567".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn accepts_valid_config() {
        assert!(validate_config(&base_config()).is_ok());
    }

    #[test]
    fn paths_are_under_data_dir() {
        let config = base_config();
        assert_eq!(config.session_path(), PathBuf::from("./data/session.json"));
        assert_eq!(config.db_path(), PathBuf::from("./data/messages.db"));
    }
}
