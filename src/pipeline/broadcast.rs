use tokio::sync::broadcast;
use tracing::warn;

use crate::entities::SourceName;
use crate::entities::progress::{ProgressEvent, SourceStatus};

const CHANNEL_CAPACITY: usize = 256;

/// Fire-and-forget progress event fan-out.
///
/// The WebSocket layer (external to this crate) subscribes; a rejected
/// or unobserved event is logged at warning and never fails the
/// pipeline.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(CHANNEL_CAPACITY);
        ProgressBroadcaster { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    /// Stream view for the WebSocket layer; lagged subscribers observe
    /// an error item and keep receiving.
    pub fn subscribe_stream(
        &self,
    ) -> tokio_stream::wrappers::BroadcastStream<ProgressEvent> {
        tokio_stream::wrappers::BroadcastStream::new(self.tx.subscribe())
    }

    pub fn publish(
        &self,
        source_name: SourceName,
        status: SourceStatus,
        current_page: u64,
        total_pages: Option<u64>,
        items_processed: u64,
        operation_description: impl Into<String>,
    ) {
        let event = ProgressEvent {
            source_name,
            status,
            current_page,
            total_pages,
            items_processed,
            timestamp: chrono::Utc::now(),
            operation_description: operation_description.into(),
        };
        if let Err(err) = self.tx.send(event) {
            // No live subscriber. The run does not care.
            warn!(source = %source_name, error = %err, "progress event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_observe_events_in_order() {
        let broadcaster = ProgressBroadcaster::new();
        let mut rx = broadcaster.subscribe();

        for page in 0..3u64 {
            broadcaster.publish(
                SourceName::PubTator,
                SourceStatus::Running,
                page,
                Some(10),
                page * 100,
                "page complete",
            );
        }

        for expected in 0..3u64 {
            let event = rx.recv().await.unwrap();
            assert_eq!(event.current_page, expected);
            assert_eq!(event.source_name, SourceName::PubTator);
        }
    }

    #[test]
    fn publishing_without_subscribers_never_panics() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.publish(
            SourceName::Hpo,
            SourceStatus::Succeeded,
            5,
            Some(5),
            1000,
            "finished",
        );
    }
}
