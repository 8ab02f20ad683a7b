use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tracing::{info, warn};

use crate::capture::{CaptureMonitor, CapturePipeline, normalize_path, validate_dir};
use crate::config::Config;
use crate::error::CommandError;
use crate::event::{EventNotifier, ImageSaved};
use crate::history::{HistoryIndex, ImageRecord};
use crate::settings::{Settings, SettingsStore};
use crate::thumbnail::ThumbnailGenerator;

/// 用系统默认程序打开图片
pub trait ImageOpener: Send + Sync {
    fn open(&self, path: &Path) -> io::Result<()>;
}

pub struct SystemOpener;

impl ImageOpener for SystemOpener {
    fn open(&self, path: &Path) -> io::Result<()> {
        open::that(path)
    }
}

/// 监视状态,由 `Settings.is_monitoring` 决定,不单独持久化
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MonitoringState {
    Idle,
    Active,
}

/// 前端可调用的全部操作,以及 `image-saved` 事件订阅
pub struct CaptureService {
    settings: SettingsStore,
    index: Arc<HistoryIndex>,
    notifier: EventNotifier,
    pipeline: CapturePipeline,
    monitor: CaptureMonitor,
    opener: Box<dyn ImageOpener>,
    // 串行化 start/stop/set_save_dir,保证设置与监视器状态一起变化
    lifecycle: Mutex<()>,
}

impl CaptureService {
    pub fn open(config: &Config) -> Result<Self, CommandError> {
        let settings = SettingsStore::open(config.settings_path());
        let index = Arc::new(HistoryIndex::open(config.manifest_path())?);
        let notifier = EventNotifier::new(config.notifier.capacity);
        let pipeline = CapturePipeline::new(
            index.clone(),
            notifier.clone(),
            ThumbnailGenerator::new(config.thumbnail.max_size),
        );
        let monitor = CaptureMonitor::new(pipeline.clone(), config.monitor.clone());

        Ok(Self {
            settings,
            index,
            notifier,
            pipeline,
            monitor,
            opener: Box::new(SystemOpener),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn with_opener(mut self, opener: impl ImageOpener + 'static) -> Self {
        self.opener = Box::new(opener);
        self
    }

    /// 启动时调用:按持久化状态恢复监视,并补录保存目录中已有的图片
    ///
    /// 保存目录无效时回退到 `Idle` 并持久化,不返回错误。
    pub async fn restore(&self) {
        let settings = self.settings.get();

        if settings.is_monitoring {
            // start_monitoring 在订阅建立后补录
            match self.start_monitoring().await {
                Ok(()) => return,
                Err(e) => {
                    warn!("Could not resume monitoring, falling back to idle: {}", e);
                    if let Err(e) = self.settings.set_monitoring(false) {
                        warn!("Failed to persist idle state: {}", e);
                    }
                }
            }
        } else {
            info!("Monitoring disabled in settings, staying idle");
        }

        if let Ok(dir) = validate_dir(&settings.save_dir) {
            self.backfill(&dir).await;
        }
    }

    pub fn get_settings(&self) -> Settings {
        self.settings.get()
    }

    pub fn monitoring_state(&self) -> MonitoringState {
        if self.settings.get().is_monitoring {
            MonitoringState::Active
        } else {
            MonitoringState::Idle
        }
    }

    /// 完整历史,按入库顺序
    pub fn get_saved_images(&self) -> Vec<ImageRecord> {
        self.index.list_all()
    }

    pub fn open_image(&self, path: &Path) -> Result<(), CommandError> {
        let record = self
            .index
            .find_by_path(&normalize_path(path))
            .or_else(|| self.index.find_by_path(path))
            .ok_or_else(|| CommandError::NotFound(path.to_path_buf()))?;
        if !record.path.is_file() {
            return Err(CommandError::NotFound(record.path));
        }

        info!("Opening {}", record.path.display());
        self.opener.open(&record.path).map_err(CommandError::Open)
    }

    /// 开始监视;已在监视时为空操作
    ///
    /// 目录无效时返回 `InvalidDirectory`,状态保持 `Idle`。
    /// 订阅建立后补录目录中尚未入库的图片,空闲期间出现的文件不会遗漏。
    pub async fn start_monitoring(&self) -> Result<(), CommandError> {
        let _guard = self.lifecycle.lock().await;
        let save_dir = self.settings.get().save_dir;

        let started = self.monitor.start(&save_dir).await?;
        if let Err(e) = self.settings.set_monitoring(true) {
            if started {
                self.monitor.stop().await;
            }
            return Err(e.into());
        }

        if let Some(dir) = self.monitor.watched_dir().await {
            if started {
                self.backfill(&dir).await;
            }
            info!("Monitoring {}", dir.display());
        }
        Ok(())
    }

    /// 停止监视;未在监视时为空操作
    pub async fn stop_monitoring(&self) -> Result<(), CommandError> {
        let _guard = self.lifecycle.lock().await;
        let watched = self.monitor.watched_dir().await;
        let stopped = self.monitor.stop().await;

        if let Err(e) = self.settings.set_monitoring(false) {
            // 落盘失败:恢复原来的监视,保持内存与磁盘一致
            if let (true, Some(dir)) = (stopped, watched) {
                self.resume_watch(&dir).await;
            }
            return Err(e.into());
        }

        info!("Monitoring stopped");
        Ok(())
    }

    /// 修改保存目录;正在监视时切换到新目录
    ///
    /// 保存的是规范化后的路径。失败时保存目录和监视状态都保持原样。
    pub async fn set_save_dir(&self, path: PathBuf) -> Result<Settings, CommandError> {
        let _guard = self.lifecycle.lock().await;
        let dir = validate_dir(&path)?;
        let previous = self.monitor.watched_dir().await;

        if let Some(previous) = &previous {
            if let Err(e) = self.monitor.start(&dir).await {
                self.resume_watch(previous).await;
                return Err(e.into());
            }
        }

        let settings = match self.settings.set_save_dir(dir.clone()) {
            Ok(settings) => settings,
            Err(e) => {
                if let Some(previous) = &previous {
                    self.resume_watch(previous).await;
                }
                return Err(e.into());
            }
        };

        if previous.is_some() {
            self.backfill(&dir).await;
        }
        info!("Save directory set to {}", dir.display());
        Ok(settings)
    }

    /// 补录保存目录中尚未入库的图片,返回新增数量
    pub async fn rescan(&self) -> Result<usize, CommandError> {
        let dir = validate_dir(&self.settings.get().save_dir)?;
        Ok(self.pipeline.backfill(&dir).await?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImageSaved> {
        self.notifier.subscribe()
    }

    /// 进程退出:停止监视但不修改持久化的监视状态
    pub async fn shutdown(&self) {
        let _guard = self.lifecycle.lock().await;
        self.monitor.shutdown().await;
    }

    async fn backfill(&self, dir: &Path) {
        if let Err(e) = self.pipeline.backfill(dir).await {
            warn!("Backfill of {} failed: {}", dir.display(), e);
        }
    }

    /// 回到原来的订阅;连原目录也无法监视时退回 `Idle`
    async fn resume_watch(&self, dir: &Path) {
        if let Err(e) = self.monitor.start(dir).await {
            warn!("Failed to resume monitoring {}: {}", dir.display(), e);
            self.monitor.stop().await;
            if let Err(e) = self.settings.set_monitoring(false) {
                warn!("Failed to persist idle state: {}", e);
            }
        }
    }
}
