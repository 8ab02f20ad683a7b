use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub thumbnail: ThumbnailConfig,
    pub monitor: MonitorConfig,
    pub notifier: NotifierConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// 存放 `settings.json` 与 `history.jsonl` 的目录
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThumbnailConfig {
    /// 缩略图最长边(像素)
    pub max_size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub settle_ms: u64,
    pub retry_attempts: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    pub capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl MonitorConfig {
    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    /// 第 `attempt` 次重试前的退避时长(从 1 开始,每次翻倍)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor))
    }
}

impl fmt::Display for MonitorConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "settle={}ms, attempts={}, backoff={}ms",
            self.settle_ms, self.retry_attempts, self.retry_backoff_ms
        )
    }
}

impl Config {
    /// 从指定路径加载配置
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// 配置文件存在则加载,否则使用默认配置
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::load_from(path)
        } else {
            Ok(Self::default())
        }
    }

    /// 获取默认配置文件路径
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Unable to locate the user config directory")?
            .join("shotwatch");
        Ok(config_dir.join("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        if self.thumbnail.max_size == 0 {
            anyhow::bail!("thumbnail.max_size must be greater than 0");
        }
        if self.monitor.retry_attempts == 0 {
            anyhow::bail!("monitor.retry_attempts must be greater than 0");
        }
        if self.monitor.retry_backoff_ms == 0 {
            anyhow::bail!("monitor.retry_backoff_ms must be greater than 0");
        }
        if self.notifier.capacity == 0 {
            anyhow::bail!("notifier.capacity must be greater than 0");
        }
        if self.storage.data_dir.as_os_str().is_empty() {
            anyhow::bail!("storage.data_dir must not be empty");
        }
        Ok(())
    }

    pub fn settings_path(&self) -> PathBuf {
        self.storage.data_dir.join("settings.json")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.storage.data_dir.join("history.jsonl")
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("shotwatch");
        Self { data_dir }
    }
}

impl Default for ThumbnailConfig {
    fn default() -> Self {
        Self { max_size: 150 }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            settle_ms: 200,
            retry_attempts: 5,
            retry_backoff_ms: 100,
        }
    }
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}
