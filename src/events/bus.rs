//! 事件总线
//!
//! 队列、扫描器和会话管理器共享同一个广播通道；
//! 没有订阅者或订阅者落后时事件直接丢弃，不阻塞发布方

use super::types::UploadEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// 默认广播缓冲区容量
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UploadEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// 发布事件
    pub fn publish(&self, event: impl Into<UploadEvent>) {
        let event = event.into();
        trace!(
            "发布事件: {}/{}",
            event.category(),
            event.event_type_name()
        );
        // 没有订阅者时 send 返回错误，属正常情况
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SessionEvent;

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        bus.publish(SessionEvent::Paused);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(SessionEvent::Resumed);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_type_name(), "resumed");
    }
}
