//! Progress events for an import job.
//!
//! The orchestrator publishes [`ImportEvent`]s on a broadcast channel so a
//! caller (a CLI progress line, an SSE endpoint) can follow a job without
//! polling. Publishing with nobody listening is fine.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Buffered events per subscriber before the slowest one starts lagging.
const CHANNEL_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ImportEvent {
    Started {
        chunk_size: usize,
    },
    ChunkCompleted {
        /// 1-based chunk number.
        chunk: usize,
        rows: usize,
        /// Rows processed so far, this chunk included.
        processed: usize,
    },
    Finished {
        total: usize,
        created: usize,
        updated: usize,
        skipped: usize,
        failed: usize,
    },
    Aborted {
        reason: String,
        processed: usize,
    },
}

/// Fans job events out to every subscriber.
#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    sender: broadcast::Sender<ImportEvent>,
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: ImportEvent) {
        // No receivers is not an error
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ImportEvent> {
        self.sender.subscribe()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let progress = ProgressBroadcaster::new();
        progress.publish(ImportEvent::Started { chunk_size: 1 });

        let mut rx = progress.subscribe();
        progress.publish(ImportEvent::ChunkCompleted {
            chunk: 1,
            rows: 1,
            processed: 1,
        });
        progress.publish(ImportEvent::Aborted {
            reason: "Import cancelled".into(),
            processed: 1,
        });

        assert!(matches!(
            rx.recv().await.unwrap(),
            ImportEvent::ChunkCompleted { chunk: 1, .. }
        ));
        assert!(matches!(rx.recv().await.unwrap(), ImportEvent::Aborted { .. }));
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_value(ImportEvent::Started { chunk_size: 200 }).unwrap();
        assert_eq!(json["event"], "started");
        assert_eq!(json["chunk_size"], 200);
    }
}
