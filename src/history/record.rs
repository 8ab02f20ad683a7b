use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::thumbnail::Thumbnail;

/// 一次捕获的元数据记录
///
/// 创建后不再修改;同一 `path` 在历史索引中只出现一次。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub path: PathBuf,
    pub filename: String,
    pub width: u32,
    pub height: u32,
    /// base64 编码的 PNG 预览图
    pub thumbnail: String,
    /// 本地时间,`%Y-%m-%d_%H-%M-%S`
    pub timestamp: String,
    /// 仅用于排序,不展示
    pub captured_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn new(path: PathBuf, thumbnail: Thumbnail, captured_at: DateTime<Utc>) -> Self {
        let filename = display_name(&path);
        let timestamp = captured_at
            .with_timezone(&Local)
            .format("%Y-%m-%d_%H-%M-%S")
            .to_string();

        Self {
            path,
            filename,
            width: thumbnail.width,
            height: thumbnail.height,
            thumbnail: thumbnail.data,
            timestamp,
            captured_at,
        }
    }
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .unwrap_or(path.as_os_str())
        .to_string_lossy()
        .to_string()
}
