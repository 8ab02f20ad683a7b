use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::{info, warn};

use crate::persist::atomic_write;

/// 用户设置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub save_dir: PathBuf,
    pub is_monitoring: bool,
}

impl Default for Settings {
    /// 默认监视下载目录,并在启动时自动开始监视
    fn default() -> Self {
        Self {
            save_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            is_monitoring: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("settings file is corrupt: {0}")]
    ConfigCorrupt(String),

    #[error("settings io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 读取持久化设置
///
/// 文件不存在返回默认值;文件存在但无法解析返回 `ConfigCorrupt`。
pub fn load(path: &Path) -> Result<Settings, SettingsError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Settings::default()),
        Err(e) => return Err(e.into()),
    };
    serde_json::from_str(&content).map_err(|e| SettingsError::ConfigCorrupt(e.to_string()))
}

pub fn save(path: &Path, settings: &Settings) -> Result<(), SettingsError> {
    let content = serde_json::to_vec_pretty(settings)?;
    atomic_write(path, &content)?;
    Ok(())
}

/// 设置存储:内存中的当前设置 + 磁盘上的 `settings.json`
///
/// 所有修改先落盘再更新内存,两者在同一把写锁内完成;
/// 落盘失败时内存状态保持不变。
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    /// 启动时加载;损坏的设置文件记录警告后回退到默认值,不会失败
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let settings = match load(&path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(
                    "Failed to load settings from {}, using defaults: {}",
                    path.display(),
                    e
                );
                Settings::default()
            }
        };
        info!(
            "Loaded settings: save_dir={}, is_monitoring={}",
            settings.save_dir.display(),
            settings.is_monitoring
        );

        Self {
            path,
            current: RwLock::new(settings),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self) -> Settings {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 应用修改并持久化,返回修改后的设置
    pub fn update<F>(&self, f: F) -> Result<Settings, SettingsError>
    where
        F: FnOnce(&mut Settings),
    {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        let mut next = current.clone();
        f(&mut next);

        if next != *current {
            save(&self.path, &next)?;
            *current = next.clone();
        }
        Ok(next)
    }

    pub fn set_monitoring(&self, is_monitoring: bool) -> Result<Settings, SettingsError> {
        self.update(|s| s.is_monitoring = is_monitoring)
    }

    pub fn set_save_dir(&self, save_dir: PathBuf) -> Result<Settings, SettingsError> {
        self.update(|s| s.save_dir = save_dir)
    }
}
