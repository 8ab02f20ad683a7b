use chrono::Utc;
use image::ImageFormat;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info, warn};

use crate::event::EventNotifier;
use crate::history::{AppendOutcome, HistoryError, HistoryIndex, ImageRecord};
use crate::thumbnail::{ThumbnailError, ThumbnailGenerator};

/// 浏览器/编辑器写入过程中的临时文件后缀
const PARTIAL_SUFFIXES: &[&str] = &["part", "crdownload", "tmp", "download"];

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to read image: {0}")]
    Io(#[from] io::Error),

    #[error("failed to record image: {0}")]
    History(#[from] HistoryError),

    #[error("processing task failed: {0}")]
    Task(String),
}

impl CaptureError {
    /// 文件暂时不可读,值得退避重试
    pub fn is_transient(&self) -> bool {
        match self {
            CaptureError::Io(e) => e.kind() != io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

/// 单个文件的处理结果
#[derive(Debug)]
pub enum ProcessOutcome {
    Captured(ImageRecord),
    /// 索引中已有该路径
    Duplicate,
    /// 不是可解码的图片(或尚未写完),不记录、不通知
    Skipped(ThumbnailError),
}

/// 捕获流水线:读文件 -> 生成缩略图 -> 写入历史索引 -> 推送事件
#[derive(Clone)]
pub struct CapturePipeline {
    index: Arc<HistoryIndex>,
    notifier: EventNotifier,
    generator: ThumbnailGenerator,
}

impl CapturePipeline {
    pub fn new(
        index: Arc<HistoryIndex>,
        notifier: EventNotifier,
        generator: ThumbnailGenerator,
    ) -> Self {
        Self {
            index,
            notifier,
            generator,
        }
    }

    pub fn index(&self) -> &Arc<HistoryIndex> {
        &self.index
    }

    /// 处理一个新出现的文件
    ///
    /// 读取失败直接返回 `CaptureError::Io`,由监视器负责退避重试。
    pub async fn process(&self, path: &Path) -> Result<ProcessOutcome, CaptureError> {
        self.ingest(path, true).await
    }

    /// 把目录中已有但尚未入库的图片补进索引,不推送事件
    ///
    /// 返回新增记录数。单个文件失败只记录日志。
    pub async fn backfill(&self, dir: &Path) -> Result<usize, CaptureError> {
        let mut candidates = Vec::new();
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !is_candidate(&path) || self.index.contains(&path) {
                continue;
            }
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            candidates.push((modified, path));
        }

        // 按修改时间入库,保证历史顺序与文件出现顺序一致
        candidates.sort();

        let mut added = 0;
        for (_, path) in candidates {
            match self.ingest(&path, false).await {
                Ok(ProcessOutcome::Captured(_)) => added += 1,
                Ok(ProcessOutcome::Duplicate) => {}
                Ok(ProcessOutcome::Skipped(e)) => {
                    debug!("Backfill skipped {}: {}", path.display(), e);
                }
                Err(e) => warn!("Backfill failed for {}: {}", path.display(), e),
            }
        }

        info!("Backfilled {} images from {}", added, dir.display());
        Ok(added)
    }

    async fn ingest(&self, path: &Path, notify: bool) -> Result<ProcessOutcome, CaptureError> {
        if self.index.contains(path) {
            return Ok(ProcessOutcome::Duplicate);
        }

        let bytes = tokio::fs::read(path).await?;

        let generator = self.generator;
        let index = self.index.clone();
        let notifier = notify.then(|| self.notifier.clone());
        let path = path.to_path_buf();

        tokio::task::spawn_blocking(move || {
            ingest_blocking(&generator, &index, notifier.as_ref(), path, &bytes)
        })
        .await
        .map_err(|e| CaptureError::Task(e.to_string()))?
    }
}

fn ingest_blocking(
    generator: &ThumbnailGenerator,
    index: &HistoryIndex,
    notifier: Option<&EventNotifier>,
    path: PathBuf,
    bytes: &[u8],
) -> Result<ProcessOutcome, CaptureError> {
    let thumbnail = match generator.generate(bytes) {
        Ok(thumbnail) => thumbnail,
        Err(e) => return Ok(ProcessOutcome::Skipped(e)),
    };

    let record = ImageRecord::new(path, thumbnail, Utc::now());

    // 在索引写锁内推送,保证事件顺序与入库顺序一致
    let outcome = index.append_then(record.clone(), |inserted| {
        if let Some(notifier) = notifier {
            notifier.publish(inserted);
        }
    })?;

    Ok(match outcome {
        AppendOutcome::Inserted => ProcessOutcome::Captured(record),
        AppendOutcome::Duplicate => ProcessOutcome::Duplicate,
    })
}

/// 文件名看起来像一张可解码的图片
pub fn is_candidate(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    if name.starts_with('.') {
        return false;
    }

    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    if PARTIAL_SUFFIXES.iter().any(|s| ext.eq_ignore_ascii_case(s)) {
        return false;
    }

    ImageFormat::from_extension(ext)
        .map(|format| format.reading_enabled())
        .unwrap_or(false)
}

/// 把路径所在目录规范化,与监视/补录得到的记录路径保持一致
///
/// 只解析目录部分,文件本身不存在或是符号链接时也能得到同一个键。
pub fn normalize_path(path: &Path) -> PathBuf {
    match (path.parent(), path.file_name()) {
        (Some(parent), Some(name)) if !parent.as_os_str().is_empty() => {
            fs::canonicalize(parent)
                .map(|dir| dir.join(name))
                .unwrap_or_else(|_| path.to_path_buf())
        }
        _ => path.to_path_buf(),
    }
}
