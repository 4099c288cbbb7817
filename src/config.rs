use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use relaychat_core::pool::normalize_relay_url;
use relaychat_core::storage::default_relays;
use relaychat_core::{PoolConfig, RelayConfigSource};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONFIG_PATH: &str = "~/.relaychat/config.toml";

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub relays: Vec<String>,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Where this config was loaded from and is saved to.
    #[serde(skip)]
    path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct IdentityConfig {
    #[serde(default = "default_key_file")]
    pub key_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PoolSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_eose_timeout")]
    pub eose_timeout_secs: u64,
    #[serde(default = "default_publish_timeout")]
    pub publish_timeout_secs: u64,
    #[serde(default = "default_reconnect_min")]
    pub reconnect_min_secs: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_secs: u64,
    #[serde(default = "default_dedup_capacity")]
    pub dedup_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            key_file: default_key_file(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            eose_timeout_secs: default_eose_timeout(),
            publish_timeout_secs: default_publish_timeout(),
            reconnect_min_secs: default_reconnect_min(),
            reconnect_max_secs: default_reconnect_max(),
            dedup_capacity: default_dedup_capacity(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_key_file() -> String {
    "~/.relaychat/key.json".to_string()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_eose_timeout() -> u64 {
    8
}

fn default_publish_timeout() -> u64 {
    10
}

fn default_reconnect_min() -> u64 {
    1
}

fn default_reconnect_max() -> u64 {
    60
}

fn default_dedup_capacity() -> usize {
    relaychat_core::dedup::DEFAULT_DEDUP_CAPACITY
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    /// Load `path`, or start from defaults if it does not exist yet. An empty
    /// relay list is replaced by the default relays and written back.
    pub fn load(path: &str) -> Result<Self> {
        let expanded = PathBuf::from(shellexpand::tilde(path).as_ref());
        let mut config = if expanded.exists() {
            let content = fs::read_to_string(&expanded)
                .with_context(|| format!("Failed to read config file: {}", expanded.display()))?;
            toml::from_str::<Config>(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", expanded.display()))?
        } else {
            Config::default()
        };
        config.path = expanded;

        if config.relays.is_empty() {
            config.relays = default_relays();
            config.save().context("Failed to write default relays")?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&self.path, content)
            .with_context(|| format!("Failed to write config file: {}", self.path.display()))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn validate(&self) -> Result<()> {
        for relay in &self.relays {
            validate_relay_url(relay)?;
        }
        if self.pool.reconnect_min_secs == 0 {
            bail!("pool.reconnect_min_secs must be at least 1");
        }
        if self.pool.reconnect_max_secs < self.pool.reconnect_min_secs {
            bail!("pool.reconnect_max_secs must not be below pool.reconnect_min_secs");
        }
        Ok(())
    }

    pub fn key_file(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.identity.key_file).as_ref())
    }

    /// Add a relay; returns the normalized URL.
    pub fn add_relay(&mut self, url: &str) -> Result<String> {
        let url = validate_relay_url(url)?;
        if self.relays.iter().any(|r| r.trim_end_matches('/') == url) {
            bail!("Relay {url} is already configured");
        }
        self.relays.push(url.clone());
        Ok(url)
    }

    pub fn remove_relay(&mut self, url: &str) -> Result<()> {
        let wanted = url.trim().trim_end_matches('/');
        let before = self.relays.len();
        self.relays.retain(|r| r.trim_end_matches('/') != wanted);
        if self.relays.len() == before {
            bail!("Relay {wanted} is not configured");
        }
        Ok(())
    }

    pub fn clear_relays(&mut self) {
        self.relays.clear();
    }

    pub fn pool_config(&self) -> PoolConfig {
        let pool = &self.pool;
        PoolConfig {
            connect_timeout: Duration::from_secs(pool.connect_timeout_secs),
            eose_timeout: Duration::from_secs(pool.eose_timeout_secs),
            publish_timeout: Duration::from_secs(pool.publish_timeout_secs),
            reconnect_min: Duration::from_secs(pool.reconnect_min_secs),
            reconnect_max: Duration::from_secs(pool.reconnect_max_secs),
            dedup_capacity: pool.dedup_capacity,
        }
    }
}

impl RelayConfigSource for Config {
    fn load_relay_urls(&self) -> Vec<String> {
        self.relays.clone()
    }
}

fn validate_relay_url(url: &str) -> Result<String> {
    normalize_relay_url(url).map_err(|_| anyhow::anyhow!("Relay URL must start with ws:// or wss://: {url}"))
}
