//! Progress events for lab spawning and their multicast log.
//!
//! Each user has one append-only event log per spawn. Any number of
//! subscribers may attach before or during the spawn; each one replays the
//! full sequence from the start and then follows live events until a
//! terminal event ends the stream. Subscribers are independent cursors over
//! the shared log, so a slow or disconnected subscriber never affects the
//! producer or other subscribers.

use std::sync::{Arc, Mutex};

use futures::Stream;
use serde_json::json;
use tokio::sync::Notify;

/// Kinds of spawn progress events, as they appear on the SSE stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnEventType {
    Info,
    Warning,
    Error,
    Failed,
    Complete,
}

impl SpawnEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpawnEventType::Info => "info",
            SpawnEventType::Warning => "warning",
            SpawnEventType::Error => "error",
            SpawnEventType::Failed => "failed",
            SpawnEventType::Complete => "complete",
        }
    }
}

/// One progress event for a lab spawn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnEvent {
    pub event_type: SpawnEventType,
    pub message: String,
    pub progress: Option<u8>,
}

impl SpawnEvent {
    pub fn info(message: impl Into<String>, progress: u8) -> Self {
        SpawnEvent {
            event_type: SpawnEventType::Info,
            message: message.into(),
            progress: Some(progress),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        SpawnEvent {
            event_type: SpawnEventType::Error,
            message: message.into(),
            progress: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        SpawnEvent {
            event_type: SpawnEventType::Failed,
            message: message.into(),
            progress: None,
        }
    }

    pub fn complete(message: impl Into<String>) -> Self {
        SpawnEvent {
            event_type: SpawnEventType::Complete,
            message: message.into(),
            progress: Some(100),
        }
    }

    /// Whether this event ends the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self.event_type, SpawnEventType::Failed | SpawnEventType::Complete)
    }

    /// The JSON data payload of the SSE event.
    pub fn to_sse_data(&self) -> String {
        let data = match self.progress {
            Some(progress) => json!({ "message": self.message, "progress": progress }),
            None => json!({ "message": self.message }),
        };
        data.to_string()
    }
}

#[derive(Debug, Default)]
struct EventLogInner {
    events: Vec<SpawnEvent>,
    closed: bool,
}

/// Append-only multicast log of spawn events for one user.
#[derive(Debug, Default)]
pub struct EventLog {
    inner: Mutex<EventLogInner>,
    notify: Notify,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(EventLog::default())
    }

    /// Append an event to the log and wake all subscribers.
    ///
    /// Appending a terminal event closes the log; later appends are dropped.
    /// This never suspends.
    pub fn publish(&self, event: SpawnEvent) {
        let mut inner = self.inner.lock().expect("event log lock poisoned");
        if inner.closed {
            return;
        }
        if event.is_terminal() {
            inner.closed = true;
        }
        inner.events.push(event);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Whether a terminal event has been published.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().expect("event log lock poisoned").closed
    }

    /// Snapshot of all events published so far.
    pub fn events(&self) -> Vec<SpawnEvent> {
        self.inner.lock().expect("event log lock poisoned").events.clone()
    }

    /// Wait until the event at `index` exists and return it, or `None` if
    /// the log closed before reaching that index.
    async fn wait_for(&self, index: usize) -> Option<SpawnEvent> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let inner = self.inner.lock().expect("event log lock poisoned");
                if index < inner.events.len() {
                    return Some(inner.events[index].clone());
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// A new subscriber: replays the log from the start, then follows live
    /// events, ending after the terminal event.
    pub fn subscribe(self: &Arc<Self>) -> impl Stream<Item = SpawnEvent> + Send + 'static + use<> {
        let log = Arc::clone(self);
        futures::stream::unfold((log, 0usize), |(log, index)| async move {
            let event = log.wait_for(index).await?;
            Some((event, (log, index + 1)))
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;

    #[test]
    fn test_sse_data() {
        let event = SpawnEvent::info("Pod requested", 45);
        assert_eq!(event.to_sse_data(), r#"{"message":"Pod requested","progress":45}"#);
        let event = SpawnEvent::failed("Lab spawn failed");
        assert_eq!(event.to_sse_data(), r#"{"message":"Lab spawn failed"}"#);
    }

    #[tokio::test]
    async fn test_replay_after_close() {
        let log = EventLog::new();
        log.publish(SpawnEvent::info("one", 2));
        log.publish(SpawnEvent::info("two", 45));
        log.publish(SpawnEvent::complete("done"));
        assert!(log.is_closed());

        // Late joiners still receive the full historical sequence.
        let events: Vec<_> = log.subscribe().collect().await;
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].message, "one");
        assert_eq!(events[2].event_type, SpawnEventType::Complete);

        // Publishing after close is a no-op.
        log.publish(SpawnEvent::info("ignored", 99));
        assert_eq!(log.events().len(), 3);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_see_same_sequence() {
        let log = EventLog::new();
        log.publish(SpawnEvent::info("early", 2));

        let mut tasks = Vec::new();
        for _ in 0..3 {
            let stream = log.subscribe();
            tasks.push(tokio::spawn(async move { stream.collect::<Vec<_>>().await }));
        }
        // Give the subscribers a chance to start waiting.
        tokio::task::yield_now().await;

        log.publish(SpawnEvent::info("live", 45));
        log.publish(SpawnEvent::complete("done"));

        for task in tasks {
            let events = task.await.unwrap();
            let messages: Vec<_> = events.iter().map(|e| e.message.clone()).collect();
            assert_eq!(messages, vec!["early", "live", "done"]);
        }
    }

    #[tokio::test]
    async fn test_dropped_subscriber_does_not_block_others() {
        let log = EventLog::new();
        log.publish(SpawnEvent::info("one", 2));

        // A subscriber that is dropped mid-stream frees its resources
        // without affecting the log.
        let mut stream = Box::pin(log.subscribe());
        assert_eq!(stream.next().await.unwrap().message, "one");
        drop(stream);

        log.publish(SpawnEvent::complete("done"));
        let events: Vec<_> = log.subscribe().collect().await;
        assert_eq!(events.len(), 2);
    }
}
