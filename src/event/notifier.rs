use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::event::ImageSaved;
use crate::history::ImageRecord;

/// 事件通知器
///
/// 基于 broadcast 通道的即发即弃推送:没有监听者时事件直接丢弃,
/// 晚连接的监听者收不到之前的事件,需要通过历史索引补齐。
#[derive(Clone)]
pub struct EventNotifier {
    sender: broadcast::Sender<ImageSaved>,
}

impl EventNotifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 返回送达的监听者数量
    pub fn publish(&self, record: &ImageRecord) -> usize {
        match self.sender.send(ImageSaved::from(record)) {
            Ok(receivers) => {
                trace!("Published {} to {} listeners", record.filename, receivers);
                receivers
            }
            Err(_) => {
                debug!("No listeners for {}", record.filename);
                0
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImageSaved> {
        self.sender.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
