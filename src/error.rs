use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::io;
use std::path::PathBuf;

use crate::capture::{CaptureError, MonitorError};
use crate::history::HistoryError;
use crate::settings::SettingsError;

/// 命令层错误,原样返回给调用方
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("invalid directory {}: {reason}", .path.display())]
    InvalidDirectory { path: PathBuf, reason: String },

    #[error("image not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error(transparent)]
    Settings(#[from] SettingsError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("failed to watch directory: {0}")]
    Watch(#[from] notify::Error),

    #[error("failed to open image: {0}")]
    Open(#[source] io::Error),
}

impl CommandError {
    /// 稳定的错误类别,供前端区分处理
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::InvalidDirectory { .. } => "InvalidDirectory",
            CommandError::NotFound(_) => "NotFound",
            CommandError::Settings(SettingsError::ConfigCorrupt(_)) => "ConfigCorrupt",
            CommandError::Settings(_) | CommandError::History(_) | CommandError::Capture(_) => {
                "IOError"
            }
            CommandError::Watch(_) => "WatchError",
            CommandError::Open(_) => "OpenFailed",
        }
    }
}

impl From<MonitorError> for CommandError {
    fn from(err: MonitorError) -> Self {
        match err {
            MonitorError::InvalidDirectory { path, reason } => {
                CommandError::InvalidDirectory { path, reason }
            }
            MonitorError::Watch(e) => CommandError::Watch(e),
        }
    }
}

impl Serialize for CommandError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("CommandError", 2)?;
        state.serialize_field("kind", self.kind())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}
