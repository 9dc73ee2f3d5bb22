//! Completion notification
//!
//! Native callbacks push [`RecordEvent`]s into an unbounded channel and return
//! immediately. The controller drains that channel on its own task, updates
//! session state, then republishes to listeners over a broadcast channel.

use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::backend::RecordWindow;
use crate::native::RecordingInfo;
use crate::session::SourceId;

/// A finished segment
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompletionRecord {
    pub source_id: SourceId,
    pub file_path: PathBuf,
    pub directory: PathBuf,
    pub duration_seconds: f64,
    pub trigger_label: String,
}

impl CompletionRecord {
    /// Duration comes from the engine when it reports one, otherwise from the
    /// requested window.
    pub fn from_recording(
        source_id: SourceId,
        info: &RecordingInfo,
        trigger_label: String,
        window: Option<RecordWindow>,
    ) -> Self {
        let duration_seconds = if info.duration.is_zero() {
            window.map(|w| w.total().as_secs_f64()).unwrap_or(0.0)
        } else {
            info.duration.as_secs_f64()
        };

        Self {
            source_id,
            file_path: info.dirpath.join(&info.filename),
            directory: info.dirpath.clone(),
            duration_seconds,
            trigger_label,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RecordEvent {
    Completed(CompletionRecord),
    /// The engine gave up on a segment; no file will follow
    Faulted { source_id: SourceId, reason: String },
}

impl RecordEvent {
    pub fn source_id(&self) -> SourceId {
        match self {
            RecordEvent::Completed(record) => record.source_id,
            RecordEvent::Faulted { source_id, .. } => *source_id,
        }
    }
}

/// Sending half handed to callback contexts
pub type EventSender = mpsc::UnboundedSender<RecordEvent>;

pub struct CompletionNotifier {
    tx: EventSender,
    rx: Mutex<Option<mpsc::UnboundedReceiver<RecordEvent>>>,
    listeners: broadcast::Sender<RecordEvent>,
}

impl CompletionNotifier {
    pub fn new(listener_capacity: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (listeners, _) = broadcast::channel(listener_capacity.max(1));
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            listeners,
        }
    }

    pub fn sender(&self) -> EventSender {
        self.tx.clone()
    }

    /// The single consumer of raw callback events; `None` once taken
    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<RecordEvent>> {
        self.rx.lock().take()
    }

    /// Events queued so far, for callers without a dispatcher task.
    /// Empty once the receiver has been taken.
    pub fn drain_pending(&self) -> Vec<RecordEvent> {
        let mut rx = self.rx.lock();
        let Some(rx) = rx.as_mut() else {
            return Vec::new();
        };
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RecordEvent> {
        self.listeners.subscribe()
    }

    /// Forward to every listener. Returns how many received it.
    pub fn publish(&self, event: RecordEvent) -> usize {
        match self.listeners.send(event) {
            Ok(receivers) => receivers,
            Err(broadcast::error::SendError(event)) => {
                debug!("No listeners for event on source {}", event.source_id());
                0
            }
        }
    }
}

impl Default for CompletionNotifier {
    fn default() -> Self {
        Self::new(64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::Container;
    use std::time::Duration;

    fn info(duration: Duration) -> RecordingInfo {
        RecordingInfo {
            session_id: 1,
            filename: "cam0_00001.mp4".into(),
            dirpath: PathBuf::from("/data/rec"),
            duration,
            container: Container::Mp4,
            width: 0,
            height: 0,
        }
    }

    #[test]
    fn test_duration_falls_back_to_window() {
        let record = CompletionRecord::from_recording(
            0,
            &info(Duration::ZERO),
            "person".into(),
            Some(RecordWindow::new(60, 10)),
        );
        assert_eq!(record.duration_seconds, 70.0);
        assert_eq!(record.file_path, PathBuf::from("/data/rec/cam0_00001.mp4"));
        assert_eq!(record.directory, PathBuf::from("/data/rec"));

        let reported = CompletionRecord::from_recording(
            0,
            &info(Duration::from_millis(19_500)),
            "person".into(),
            Some(RecordWindow::new(10, 10)),
        );
        assert_eq!(reported.duration_seconds, 19.5);
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = RecordEvent::Faulted {
            source_id: 2,
            reason: "disk full".into(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "faulted");
        assert_eq!(json["source_id"], 2);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let notifier = CompletionNotifier::default();
        assert_eq!(
            notifier.publish(RecordEvent::Faulted {
                source_id: 0,
                reason: "nobody listening".into()
            }),
            0
        );

        let mut listener = notifier.subscribe();
        let record = CompletionRecord::from_recording(3, &info(Duration::ZERO), "manual".into(), None);
        assert_eq!(notifier.publish(RecordEvent::Completed(record.clone())), 1);
        assert_eq!(listener.recv().await.unwrap(), RecordEvent::Completed(record));
    }

    #[tokio::test]
    async fn test_receiver_taken_once() {
        let notifier = CompletionNotifier::default();
        let mut rx = notifier.take_receiver().unwrap();
        assert!(notifier.take_receiver().is_none());

        notifier
            .sender()
            .send(RecordEvent::Faulted {
                source_id: 1,
                reason: "x".into(),
            })
            .unwrap();
        assert_eq!(rx.recv().await.unwrap().source_id(), 1);
    }
}
