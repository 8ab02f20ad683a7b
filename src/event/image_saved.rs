use serde::Serialize;
use std::path::PathBuf;

use crate::history::ImageRecord;

/// 推送事件名
pub const IMAGE_SAVED: &str = "image-saved";

/// `image-saved` 事件负载
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageSaved {
    pub path: PathBuf,
    pub filename: String,
    pub width: u32,
    pub height: u32,
    pub thumbnail: String,
    pub timestamp: String,
}

impl From<&ImageRecord> for ImageSaved {
    fn from(record: &ImageRecord) -> Self {
        Self {
            path: record.path.clone(),
            filename: record.filename.clone(),
            width: record.width,
            height: record.height,
            thumbnail: record.thumbnail.clone(),
            timestamp: record.timestamp.clone(),
        }
    }
}
