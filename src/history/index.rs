use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::history::ImageRecord;
use crate::persist::atomic_write;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("manifest io error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// 追加结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// 路径已存在,保留已有记录
    Duplicate,
}

#[derive(Default)]
struct IndexState {
    records: Vec<ImageRecord>,
    positions: HashMap<PathBuf, usize>,
}

impl IndexState {
    fn insert(&mut self, record: ImageRecord) -> bool {
        if self.positions.contains_key(&record.path) {
            return false;
        }
        self.positions.insert(record.path.clone(), self.records.len());
        self.records.push(record);
        true
    }
}

/// 历史索引
///
/// 按插入顺序保存 [`ImageRecord`],以路径去重(重复路径忽略,不更新)。
/// 持久化为 JSON Lines 清单,每条记录一行;写操作持有写锁,
/// 读者只会看到插入前或插入后的完整状态。
pub struct HistoryIndex {
    manifest_path: PathBuf,
    state: RwLock<IndexState>,
}

impl HistoryIndex {
    /// 加载清单;无法解析的行(例如崩溃留下的半行)被跳过,并重写清单
    pub fn open(manifest_path: impl Into<PathBuf>) -> Result<Self, HistoryError> {
        let manifest_path = manifest_path.into();
        let mut state = IndexState::default();
        let mut dropped = 0usize;

        match fs::read(&manifest_path) {
            Ok(bytes) => {
                let torn_tail = !bytes.is_empty() && !bytes.ends_with(b"\n");
                for (line_no, line) in bytes.split(|b| *b == b'\n').enumerate() {
                    if line.iter().all(u8::is_ascii_whitespace) {
                        continue;
                    }
                    match serde_json::from_slice::<ImageRecord>(line) {
                        Ok(record) => {
                            if !state.insert(record) {
                                debug!("Dropping duplicate manifest entry at line {}", line_no + 1);
                                dropped += 1;
                            }
                        }
                        Err(e) => {
                            warn!(
                                "Skipping unreadable manifest entry at line {}: {}",
                                line_no + 1,
                                e
                            );
                            dropped += 1;
                        }
                    }
                }
                if torn_tail && dropped == 0 {
                    dropped += 1;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No manifest at {}, starting empty", manifest_path.display());
            }
            Err(e) => return Err(e.into()),
        }

        let index = Self {
            manifest_path,
            state: RwLock::new(state),
        };

        if dropped > 0 {
            info!("Compacting manifest after dropping {} entries", dropped);
            index.compact()?;
        }

        info!(
            "Loaded history index with {} records from {}",
            index.len(),
            index.manifest_path.display()
        );
        Ok(index)
    }

    pub fn manifest_path(&self) -> &Path {
        &self.manifest_path
    }

    /// 追加记录;同一路径重复追加是幂等的
    ///
    /// 去重检查、清单写入、内存插入在同一把写锁内完成。
    /// 清单写入失败时内存状态不变。
    pub fn append(&self, record: ImageRecord) -> Result<AppendOutcome, HistoryError> {
        self.append_then(record, |_| {})
    }

    /// 同 [`append`](Self::append),插入成功后仍持有写锁时调用 `on_insert`
    ///
    /// 用于让事件推送顺序与入库顺序严格一致;`on_insert` 不能访问本索引。
    pub fn append_then<F>(
        &self,
        record: ImageRecord,
        on_insert: F,
    ) -> Result<AppendOutcome, HistoryError>
    where
        F: FnOnce(&ImageRecord),
    {
        let mut state = self.write();
        if state.positions.contains_key(&record.path) {
            return Ok(AppendOutcome::Duplicate);
        }

        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        self.append_line(&line)?;

        on_insert(&record);
        state.insert(record);
        Ok(AppendOutcome::Inserted)
    }

    /// 全部记录,按插入顺序
    pub fn list_all(&self) -> Vec<ImageRecord> {
        self.read().records.clone()
    }

    pub fn find_by_path(&self, path: &Path) -> Option<ImageRecord> {
        let state = self.read();
        state
            .positions
            .get(path)
            .map(|&idx| state.records[idx].clone())
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.read().positions.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn append_line(&self, line: &[u8]) -> io::Result<()> {
        if let Some(parent) = self.manifest_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.manifest_path)?;
        let len_before = file.metadata()?.len();

        let result = file.write_all(line).and_then(|_| file.sync_data());
        if let Err(e) = result {
            // 回滚半写入的行,避免污染下一条记录
            if let Err(truncate_err) = file.set_len(len_before) {
                warn!("Failed to roll back partial manifest write: {}", truncate_err);
            }
            return Err(e);
        }
        Ok(())
    }

    fn compact(&self) -> Result<(), HistoryError> {
        let state = self.read();
        let mut contents = Vec::new();
        for record in &state.records {
            serde_json::to_writer(&mut contents, record)?;
            contents.push(b'\n');
        }
        atomic_write(&self.manifest_path, &contents)?;
        Ok(())
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}
