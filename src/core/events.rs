use crate::core::model::{Download, DownloadId};
use tokio::sync::broadcast;

/// Everything observers learn about the queue. Payloads are owned snapshots;
/// the engine keeps the only mutable copy.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    Loaded { downloads: Vec<Download> },
    Added { download: Download },
    Queued { download: Download },
    Started { download: Download },
    Progress { download: Download },
    Paused { download: Download },
    Completed { download: Download },
    Error { download: Download },
    Deleted { id: DownloadId },
}

impl QueueEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::Loaded { .. } => "loaded",
            Self::Added { .. } => "added",
            Self::Queued { .. } => "queued",
            Self::Started { .. } => "started",
            Self::Progress { .. } => "progress",
            Self::Paused { .. } => "paused",
            Self::Completed { .. } => "complete",
            Self::Error { .. } => "error",
            Self::Deleted { .. } => "deleted",
        }
    }

    pub fn download(&self) -> Option<&Download> {
        match self {
            Self::Added { download }
            | Self::Queued { download }
            | Self::Started { download }
            | Self::Progress { download }
            | Self::Paused { download }
            | Self::Completed { download }
            | Self::Error { download } => Some(download),
            Self::Loaded { .. } | Self::Deleted { .. } => None,
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<QueueEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.tx.subscribe()
    }

    /// Having no subscribers is fine; the event is simply dropped.
    pub fn publish(&self, event: QueueEvent) {
        tracing::trace!(topic = event.topic(), "publish");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::DownloadRequest;

    #[tokio::test]
    async fn every_subscriber_gets_its_own_copy() {
        let bus = EventBus::default();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();

        let d = Download::new(DownloadRequest::new("https://example.com/v"), 1);
        bus.publish(QueueEvent::Added { download: d.clone() });

        for rx in [&mut a, &mut b] {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.topic(), "added");
            assert_eq!(ev.download().map(|x| x.id), Some(d.id));
        }
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        bus.publish(QueueEvent::Deleted { id: uuid::Uuid::new_v4() });
    }
}
