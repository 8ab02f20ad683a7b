use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// 正在处理中的路径表
///
/// 每个路径同时最多一个处理任务。处理期间再次收到同一路径的事件时
/// 只打上重跑标记,当前任务结束后再处理一遍。
#[derive(Default)]
pub struct InFlight {
    paths: Mutex<HashMap<PathBuf, bool>>,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// 返回 true 表示调用方应启动处理任务
    pub fn begin(&self, path: &Path) -> bool {
        let mut paths = self.lock();
        match paths.get_mut(path) {
            Some(rerun) => {
                *rerun = true;
                false
            }
            None => {
                paths.insert(path.to_path_buf(), false);
                true
            }
        }
    }

    /// 当前一轮处理结束;返回 true 表示期间有新事件,需要再处理一遍
    pub fn finish(&self, path: &Path) -> bool {
        let mut paths = self.lock();
        match paths.get_mut(path) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                paths.remove(path);
                false
            }
        }
    }

    /// 放弃处理(例如监视已停止),不再重跑
    pub fn abandon(&self, path: &Path) {
        self.lock().remove(path);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PathBuf, bool>> {
        self.paths.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
