use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinHandle;
use tokio::time::{Duration, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::capture::inflight::InFlight;
use crate::capture::pipeline::{CapturePipeline, ProcessOutcome, is_candidate};
use crate::config::MonitorConfig;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("invalid directory {}: {reason}", .path.display())]
    InvalidDirectory { path: PathBuf, reason: String },

    #[error("failed to watch directory: {0}")]
    Watch(#[from] notify::Error),
}

/// 捕获监视器
///
/// 订阅保存目录的文件系统通知,把新出现的图片交给 [`CapturePipeline`]。
/// `start`/`stop` 都是幂等的;停止时只释放订阅,已收到通知的文件照常处理完。
/// 单个文件的处理任务只在 `shutdown` 时取消。
pub struct CaptureMonitor {
    pipeline: CapturePipeline,
    config: MonitorConfig,
    inflight: Arc<InFlight>,
    // 进程级令牌:取消所有文件处理任务
    cancellation_token: CancellationToken,
    active: Mutex<Option<ActiveWatch>>,
}

/// 一次活跃的目录订阅
struct ActiveWatch {
    dir: PathBuf,
    watcher: RecommendedWatcher,
    cancellation_token: CancellationToken,
    task_handle: JoinHandle<()>,
}

impl CaptureMonitor {
    pub fn new(pipeline: CapturePipeline, config: MonitorConfig) -> Self {
        info!("Initialized capture monitor: {}", config);
        Self {
            pipeline,
            config,
            inflight: Arc::new(InFlight::new()),
            cancellation_token: CancellationToken::new(),
            active: Mutex::new(None),
        }
    }

    /// 开始监视 `save_dir`
    ///
    /// 目录按规范化后的路径订阅。已在监视同一目录时直接返回 `Ok(false)`;
    /// 正在监视其他目录时切换过去。目录无效时返回错误,原有订阅保持不变。
    pub async fn start(&self, save_dir: &Path) -> Result<bool, MonitorError> {
        let dir = validate_dir(save_dir)?;

        let mut active = self.active.lock().await;
        if let Some(watch) = active.as_ref() {
            if watch.dir == dir {
                debug!("Already watching {}", dir.display());
                return Ok(false);
            }
        }

        if let Some(previous) = active.take() {
            info!(
                "Switching watch from {} to {}",
                previous.dir.display(),
                dir.display()
            );
            previous.shutdown().await;
        }

        *active = Some(self.spawn_watch(&dir)?);
        Ok(true)
    }

    /// 停止监视;未在监视时返回 `false`
    pub async fn stop(&self) -> bool {
        let watch = self.active.lock().await.take();
        match watch {
            Some(watch) => {
                watch.shutdown().await;
                true
            }
            None => {
                debug!("Capture monitor already idle");
                false
            }
        }
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn watched_dir(&self) -> Option<PathBuf> {
        self.active.lock().await.as_ref().map(|w| w.dir.clone())
    }

    /// 优雅关闭:停止订阅并取消所有等待中的文件处理任务
    pub async fn shutdown(&self) {
        info!("Shutting down capture monitor...");
        self.stop().await;
        self.cancellation_token.cancel();
    }

    fn spawn_watch(&self, dir: &Path) -> Result<ActiveWatch, MonitorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            let _ = tx.send(res);
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;

        // 订阅令牌:stop 时只结束监视循环,不影响已分派的文件
        let cancellation_token = self.cancellation_token.child_token();
        let dispatcher = self.dispatcher();

        let watch_dir = dir.to_path_buf();
        let watch_token = cancellation_token.clone();
        let task_handle = tokio::spawn(async move {
            watch_task(watch_dir, rx, dispatcher, watch_token).await;
        });

        info!("Started watching {}", dir.display());
        Ok(ActiveWatch {
            dir: dir.to_path_buf(),
            watcher,
            cancellation_token,
            task_handle,
        })
    }

    fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            pipeline: self.pipeline.clone(),
            config: self.config.clone(),
            inflight: self.inflight.clone(),
            cancel_token: self.cancellation_token.clone(),
        }
    }
}

impl ActiveWatch {
    async fn shutdown(self) {
        let ActiveWatch {
            dir,
            watcher,
            cancellation_token,
            task_handle,
        } = self;

        // 先释放订阅,目录不再被占用
        drop(watcher);
        cancellation_token.cancel();

        match timeout(SHUTDOWN_TIMEOUT, task_handle).await {
            Ok(Ok(())) => info!("Stopped watching {}", dir.display()),
            Ok(Err(e)) => error!("Watch task for {} failed: {}", dir.display(), e),
            Err(_) => warn!(
                "Watch task for {} did not stop within {:?}",
                dir.display(),
                SHUTDOWN_TIMEOUT
            ),
        }
    }
}

impl Drop for CaptureMonitor {
    fn drop(&mut self) {
        if let Some(watch) = self.active.get_mut().take() {
            warn!(
                "Capture monitor dropped while watching {}, sending cancellation signal",
                watch.dir.display()
            );
            watch.cancellation_token.cancel();
        }
        self.cancellation_token.cancel();
    }
}

/// 目录必须存在、是目录、可写;返回规范化后的绝对路径
///
/// 记录路径以规范化目录为前缀,通知与目录扫描得到的路径才能一致。
pub fn validate_dir(path: &Path) -> Result<PathBuf, MonitorError> {
    let invalid = |reason: String| MonitorError::InvalidDirectory {
        path: path.to_path_buf(),
        reason,
    };

    if !path.is_absolute() {
        return Err(invalid("path is not absolute".to_string()));
    }
    let metadata = fs::metadata(path).map_err(|e| invalid(e.to_string()))?;
    if !metadata.is_dir() {
        return Err(invalid("not a directory".to_string()));
    }
    let path = fs::canonicalize(path).map_err(|e| invalid(e.to_string()))?;

    let probe = path.join(format!(".shotwatch-probe-{}", std::process::id()));
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)
        .map_err(|e| invalid(format!("not writable: {}", e)))?;
    let _ = fs::remove_file(&probe);

    Ok(path)
}

/// 从通知中挑出可能是新图片的路径
fn candidate_paths(event: Event) -> Vec<PathBuf> {
    let paths = match event.kind {
        EventKind::Create(CreateKind::Folder) => return Vec::new(),
        EventKind::Create(_)
        | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Name(RenameMode::To))
        | EventKind::Modify(ModifyKind::Name(RenameMode::Any))
        | EventKind::Access(AccessKind::Close(AccessMode::Write)) => event.paths,
        // (from, to):只关心新名字
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            event.paths.into_iter().last().into_iter().collect()
        }
        _ => return Vec::new(),
    };

    paths.into_iter().filter(|p| is_candidate(p)).collect()
}

async fn watch_task(
    dir: PathBuf,
    mut events: UnboundedReceiver<notify::Result<Event>>,
    dispatcher: Dispatcher,
    cancel_token: CancellationToken,
) {
    info!("Watch task for {} started", dir.display());

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                info!("Watch task for {} received cancellation signal", dir.display());
                break;
            }
            received = events.recv() => match received {
                Some(Ok(event)) => {
                    for path in candidate_paths(event) {
                        dispatcher.dispatch(path);
                    }
                }
                Some(Err(e)) => warn!("Watch error on {}: {}", dir.display(), e),
                None => {
                    info!("Watch channel for {} closed", dir.display());
                    break;
                }
            }
        }
    }

    info!("Watch task for {} terminated", dir.display());
}

/// 把候选路径分派给独立任务,监视循环本身从不阻塞
#[derive(Clone)]
struct Dispatcher {
    pipeline: CapturePipeline,
    config: MonitorConfig,
    inflight: Arc<InFlight>,
    cancel_token: CancellationToken,
}

impl Dispatcher {
    fn dispatch(&self, path: PathBuf) {
        if !self.inflight.begin(&path) {
            debug!("{} already in flight, marked for another pass", path.display());
            return;
        }

        let dispatcher = self.clone();
        tokio::spawn(async move {
            dispatcher.run(path).await;
        });
    }

    async fn run(&self, path: PathBuf) {
        loop {
            // 等文件写完再读
            tokio::select! {
                _ = sleep(self.config.settle()) => {}
                _ = self.cancel_token.cancelled() => {
                    self.inflight.abandon(&path);
                    return;
                }
            }

            if !self.process_with_retry(&path).await {
                debug!("Abandoned {} on shutdown", path.display());
                self.inflight.abandon(&path);
                return;
            }

            if !self.inflight.finish(&path) {
                break;
            }
        }
    }

    /// 返回 false 表示在退避等待中被取消
    async fn process_with_retry(&self, path: &Path) -> bool {
        let mut attempt = 1;
        loop {
            match self.pipeline.process(path).await {
                Ok(ProcessOutcome::Captured(record)) => {
                    info!(
                        "Captured {} ({}x{})",
                        record.filename, record.width, record.height
                    );
                    return true;
                }
                Ok(ProcessOutcome::Duplicate) => {
                    debug!("{} already recorded", path.display());
                    return true;
                }
                Ok(ProcessOutcome::Skipped(e)) => {
                    debug!("Skipped {}: {}", path.display(), e);
                    return true;
                }
                Err(e) if e.is_transient() && attempt < self.config.retry_attempts => {
                    let delay = self.config.backoff(attempt);
                    debug!(
                        "Attempt {} for {} failed ({}), retrying in {:?}",
                        attempt,
                        path.display(),
                        e,
                        delay
                    );
                    attempt += 1;

                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = self.cancel_token.cancelled() => return false,
                    }
                }
                Err(e) => {
                    warn!(
                        "Giving up on {} after {} attempts: {}",
                        path.display(),
                        attempt,
                        e
                    );
                    return true;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventNotifier, ImageSaved};
    use crate::history::HistoryIndex;
    use crate::thumbnail::{ThumbnailGenerator, png_bytes};
    use tokio::sync::broadcast::{self, error::TryRecvError};

    struct Harness {
        _data: tempfile::TempDir,
        shots_dir: tempfile::TempDir,
        shots: PathBuf,
        index: Arc<HistoryIndex>,
        notifier: EventNotifier,
        monitor: CaptureMonitor,
    }

    fn harness() -> Harness {
        harness_with(MonitorConfig {
            settle_ms: 50,
            retry_attempts: 3,
            retry_backoff_ms: 20,
        })
    }

    fn harness_with(config: MonitorConfig) -> Harness {
        let data = tempfile::tempdir().unwrap();
        let shots_dir = tempfile::tempdir().unwrap();
        let shots = shots_dir.path().to_path_buf();

        let index = Arc::new(HistoryIndex::open(data.path().join("history.jsonl")).unwrap());
        let notifier = EventNotifier::new(16);
        let pipeline =
            CapturePipeline::new(index.clone(), notifier.clone(), ThumbnailGenerator::new(64));

        Harness {
            _data: data,
            shots_dir,
            shots,
            index,
            notifier,
            monitor: CaptureMonitor::new(pipeline, config),
        }
    }

    impl Harness {
        /// 监视器实际使用的目录前缀
        fn real_shots(&self) -> PathBuf {
            fs::canonicalize(&self.shots).unwrap()
        }
    }

    async fn next_event(rx: &mut broadcast::Receiver<ImageSaved>) -> Option<ImageSaved> {
        timeout(Duration::from_secs(5), rx.recv()).await.ok()?.ok()
    }

    #[test]
    fn test_validate_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(
            validate_dir(dir.path()).unwrap(),
            fs::canonicalize(dir.path()).unwrap()
        );

        let missing = dir.path().join("missing");
        assert!(matches!(
            validate_dir(&missing),
            Err(MonitorError::InvalidDirectory { .. })
        ));

        let file = dir.path().join("file.png");
        fs::write(&file, "").unwrap();
        assert!(validate_dir(&file).is_err());

        assert!(validate_dir(Path::new("relative/dir")).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_validate_dir_resolves_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real");
        fs::create_dir(&real).unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&real, &link).unwrap();

        assert_eq!(validate_dir(&link).unwrap(), fs::canonicalize(&real).unwrap());
        assert_eq!(
            validate_dir(&real.join("..").join("link")).unwrap(),
            fs::canonicalize(&real).unwrap()
        );
    }

    #[test]
    fn test_candidate_paths_filters_kinds_and_names() {
        let png = PathBuf::from("/shots/a.png");
        let txt = PathBuf::from("/shots/a.txt");

        let created = Event::new(EventKind::Create(CreateKind::File))
            .add_path(png.clone())
            .add_path(txt.clone());
        assert_eq!(candidate_paths(created), vec![png.clone()]);

        let removed = Event::new(EventKind::Remove(notify::event::RemoveKind::File))
            .add_path(png.clone());
        assert!(candidate_paths(removed).is_empty());

        let renamed = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/shots/a.png.part"))
            .add_path(png.clone());
        assert_eq!(candidate_paths(renamed), vec![png]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_and_stop_are_idempotent() {
        let h = harness();
        assert!(!h.monitor.stop().await);

        assert!(h.monitor.start(&h.shots).await.unwrap());
        assert!(!h.monitor.start(&h.shots).await.unwrap());
        assert_eq!(h.monitor.watched_dir().await, Some(h.real_shots()));

        assert!(h.monitor.stop().await);
        assert!(!h.monitor.stop().await);
        assert!(!h.monitor.is_active().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_start_invalid_dir_keeps_idle() {
        let h = harness();
        let missing = h.shots.join("missing");
        assert!(h.monitor.start(&missing).await.is_err());
        assert!(!h.monitor.is_active().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_image_is_captured_once() {
        let h = harness();
        let mut rx = h.notifier.subscribe();
        h.monitor.start(&h.shots).await.unwrap();

        fs::write(h.shots.join("shot.png"), png_bytes(100, 50)).unwrap();
        let path = h.real_shots().join("shot.png");

        let event = next_event(&mut rx).await.expect("image-saved event");
        assert_eq!((event.width, event.height), (100, 50));
        assert_eq!(event.path, path);

        sleep(Duration::from_millis(500)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        let records = h.index.list_all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].path, path);

        h.monitor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_restart_does_not_double_events() {
        let h = harness();
        let mut rx = h.notifier.subscribe();

        h.monitor.start(&h.shots).await.unwrap();
        h.monitor.stop().await;
        h.monitor.start(&h.shots).await.unwrap();

        fs::write(h.shots.join("again.png"), png_bytes(30, 30)).unwrap();

        assert!(next_event(&mut rx).await.is_some());
        sleep(Duration::from_millis(500)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.index.len(), 1);

        h.monitor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_corrupt_file_does_not_block_later_files() {
        let h = harness();
        let mut rx = h.notifier.subscribe();
        h.monitor.start(&h.shots).await.unwrap();

        let bytes = png_bytes(100, 50);
        fs::write(h.shots.join("broken.png"), &bytes[..bytes.len() / 3]).unwrap();
        fs::write(h.shots.join("notes.txt"), "not an image").unwrap();
        sleep(Duration::from_millis(300)).await;

        fs::write(h.shots.join("good.png"), &bytes).unwrap();

        let event = next_event(&mut rx).await.expect("image-saved event");
        assert_eq!(event.path, h.real_shots().join("good.png"));

        sleep(Duration::from_millis(300)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.index.len(), 1);

        h.monitor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stopped_monitor_ignores_new_files() {
        let h = harness();
        h.monitor.start(&h.shots).await.unwrap();
        h.monitor.stop().await;

        fs::write(h.shots.join("late.png"), png_bytes(10, 10)).unwrap();
        sleep(Duration::from_millis(400)).await;

        assert!(h.index.is_empty());
        assert!(h.shots_dir.path().exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_lets_detected_files_finish() {
        let h = harness_with(MonitorConfig {
            settle_ms: 400,
            retry_attempts: 3,
            retry_backoff_ms: 20,
        });
        let mut rx = h.notifier.subscribe();
        h.monitor.start(&h.shots).await.unwrap();

        fs::write(h.shots.join("shot.png"), png_bytes(40, 20)).unwrap();
        // 通知已分派,文件仍在等待写完
        sleep(Duration::from_millis(150)).await;
        assert!(h.monitor.stop().await);

        let event = next_event(&mut rx).await.expect("image-saved event");
        assert_eq!(event.filename, "shot.png");
        assert_eq!(h.index.len(), 1);
        assert!(h.monitor.inflight.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_cancels_pending_files() {
        let h = harness_with(MonitorConfig {
            settle_ms: 400,
            retry_attempts: 3,
            retry_backoff_ms: 20,
        });
        h.monitor.start(&h.shots).await.unwrap();

        fs::write(h.shots.join("shot.png"), png_bytes(40, 20)).unwrap();
        sleep(Duration::from_millis(150)).await;
        h.monitor.shutdown().await;

        sleep(Duration::from_millis(600)).await;
        assert!(h.index.is_empty());
        assert!(h.monitor.inflight.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_truncated_then_completed_file_is_captured_once() {
        let h = harness();
        let mut rx = h.notifier.subscribe();
        h.monitor.start(&h.shots).await.unwrap();

        let path = h.shots.join("x.png");
        let bytes = png_bytes(100, 50);
        fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        sleep(Duration::from_millis(250)).await;
        assert!(h.index.is_empty());

        fs::write(&path, &bytes).unwrap();

        let event = next_event(&mut rx).await.expect("image-saved event");
        assert_eq!((event.width, event.height), (100, 50));
        assert_eq!(event.path, h.real_shots().join("x.png"));

        sleep(Duration::from_millis(400)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert_eq!(h.index.len(), 1);

        h.monitor.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_unreadable_file_is_retried_until_readable() {
        let h = harness_with(MonitorConfig {
            settle_ms: 10,
            retry_attempts: 4,
            retry_backoff_ms: 150,
        });
        let mut rx = h.notifier.subscribe();
        let dispatcher = h.monitor.dispatcher();

        // 读目录会得到 EISDIR 之类的非 NotFound 错误,视为暂时不可读
        let path = h.real_shots().join("slow.png");
        fs::create_dir(&path).unwrap();
        let err = h.monitor.pipeline.process(&path).await.unwrap_err();
        assert!(err.is_transient());

        let task = {
            let path = path.clone();
            tokio::spawn(async move { dispatcher.process_with_retry(&path).await })
        };

        sleep(Duration::from_millis(50)).await;
        fs::remove_dir(&path).unwrap();
        fs::write(&path, png_bytes(24, 12)).unwrap();

        assert!(timeout(Duration::from_secs(5), task).await.unwrap().unwrap());
        let event = next_event(&mut rx).await.expect("image-saved event");
        assert_eq!((event.width, event.height), (24, 12));
        assert_eq!(h.index.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_retries_are_bounded() {
        let h = harness_with(MonitorConfig {
            settle_ms: 10,
            retry_attempts: 3,
            retry_backoff_ms: 10,
        });
        let dispatcher = h.monitor.dispatcher();

        let path = h.real_shots().join("stuck.png");
        fs::create_dir(&path).unwrap();

        // 10ms + 20ms 两次退避后放弃
        let finished = timeout(Duration::from_secs(2), dispatcher.process_with_retry(&path))
            .await
            .unwrap();
        assert!(finished);
        assert!(h.index.is_empty());
    }
}
