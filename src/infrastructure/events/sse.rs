//! Rate-limited frame dispatcher for streaming subscribers
//!
//! Sits between the event bus and one streaming connection. Frames pass
//! through a token bucket refilled once per second and a bounded queue;
//! overflow drops the oldest frames and surfaces a single rate-limit notice.

use super::{EventFilter, FilestoreEvent};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;

/// Tuning for one connection
#[derive(Debug, Clone)]
pub struct SseSettings {
    pub tokens_per_second: usize,
    pub max_queue: usize,
    pub heartbeat: Duration,
}

impl Default for SseSettings {
    fn default() -> Self {
        Self {
            tokens_per_second: 200,
            max_queue: 500,
            heartbeat: Duration::from_secs(15),
        }
    }
}

/// A frame ready for SSE serialization by the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// `event:` name plus JSON `data:` body
    Event { event: String, data: String },
    /// Keep-alive comment frame
    Heartbeat,
    /// Emitted once per overflow burst with the number of dropped frames
    RateLimited { dropped: u64 },
}

pub struct SseDispatcher;

impl SseDispatcher {
    /// Attach a dispatcher to an event subscription.
    ///
    /// Returns the frame receiver for the connection and the pump task
    /// handle. The task ends when the receiver is dropped or the bus closes.
    pub fn attach(
        mut events: broadcast::Receiver<FilestoreEvent>,
        filter: EventFilter,
        settings: SseSettings,
    ) -> (mpsc::Receiver<SseFrame>, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(settings.max_queue.max(1));

        let handle = tokio::spawn(async move {
            let mut queue: VecDeque<SseFrame> = VecDeque::new();
            let mut tokens = settings.tokens_per_second;
            let mut dropped: u64 = 0;
            let mut refill = tokio::time::interval(Duration::from_secs(1));
            let mut heartbeat = tokio::time::interval(settings.heartbeat);
            // Consume the immediate first ticks
            refill.tick().await;
            heartbeat.tick().await;

            loop {
                tokio::select! {
                    received = events.recv() => match received {
                        Ok(event) => {
                            if !filter.matches(&event) {
                                continue;
                            }
                            let frame = match serde_json::to_string(&event) {
                                Ok(data) => SseFrame::Event {
                                    event: event.event_type().to_string(),
                                    data,
                                },
                                Err(_) => continue,
                            };
                            if queue.len() >= settings.max_queue {
                                queue.pop_front();
                                dropped += 1;
                            }
                            queue.push_back(frame);
                            if !drain(&tx, &mut queue, &mut tokens, &mut dropped).await {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!("Streaming subscriber lagged, skipped {} events", skipped);
                            dropped += skipped;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            let _ = drain(&tx, &mut queue, &mut tokens, &mut dropped).await;
                            return;
                        }
                    },
                    _ = refill.tick() => {
                        tokens = settings.tokens_per_second;
                        if !drain(&tx, &mut queue, &mut tokens, &mut dropped).await {
                            return;
                        }
                    }
                    _ = heartbeat.tick() => {
                        if tx.send(SseFrame::Heartbeat).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        (rx, handle)
    }

    /// Same as [`attach`](Self::attach), but exposes the frames as a
    /// `Stream` for transport layers that speak in streams.
    pub fn attach_stream(
        events: broadcast::Receiver<FilestoreEvent>,
        filter: EventFilter,
        settings: SseSettings,
    ) -> (
        tokio_stream::wrappers::ReceiverStream<SseFrame>,
        JoinHandle<()>,
    ) {
        let (rx, handle) = Self::attach(events, filter, settings);
        (tokio_stream::wrappers::ReceiverStream::new(rx), handle)
    }
}

/// Flush queued frames while tokens remain. Returns false once the
/// connection is gone.
async fn drain(
    tx: &mpsc::Sender<SseFrame>,
    queue: &mut VecDeque<SseFrame>,
    tokens: &mut usize,
    dropped: &mut u64,
) -> bool {
    if *dropped > 0 && *tokens > 0 {
        let notice = SseFrame::RateLimited { dropped: *dropped };
        *dropped = 0;
        *tokens -= 1;
        if tx.send(notice).await.is_err() {
            return false;
        }
    }
    while *tokens > 0 {
        let Some(frame) = queue.pop_front() else {
            break;
        };
        *tokens -= 1;
        if tx.send(frame).await.is_err() {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::{NodeKind, NodeState};
    use crate::infrastructure::events::{CommandContext, EventBus, NodeEventPayload};
    use chrono::Utc;
    use uuid::Uuid;

    fn created(mount: Uuid, path: &str) -> FilestoreEvent {
        FilestoreEvent::NodeCreated(NodeEventPayload {
            backend_mount_id: mount,
            node_id: Some(Uuid::new_v4()),
            path: path.to_string(),
            kind: NodeKind::Directory,
            state: NodeState::Active,
            parent_id: None,
            version: 1,
            size_bytes: 0,
            checksum: None,
            content_hash: None,
            metadata: serde_json::json!({}),
            observed_at: Utc::now(),
            context: CommandContext::default(),
        })
    }

    #[tokio::test]
    async fn delivers_matching_events_only() {
        let bus = EventBus::default();
        let mount = Uuid::new_v4();
        let filter = EventFilter {
            backend_mount_id: Some(mount),
            path_prefix: Some("datasets/".to_string()),
            event_types: vec![],
        };
        let (mut rx, handle) = SseDispatcher::attach(bus.subscribe(), filter, SseSettings::default());

        bus.emit(created(mount, "other"));
        bus.emit(created(mount, "datasets/x"));

        let frame = rx.recv().await.unwrap();
        match frame {
            SseFrame::Event { event, data } => {
                assert_eq!(event, "node.created");
                assert!(data.contains("datasets/x"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        handle.abort();
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_notices() {
        let bus = EventBus::new(4096);
        let settings = SseSettings {
            tokens_per_second: 1,
            max_queue: 2,
            heartbeat: Duration::from_secs(3600),
        };
        let (mut rx, handle) =
            SseDispatcher::attach(bus.subscribe(), EventFilter::default(), settings);

        let mount = Uuid::new_v4();
        for i in 0..6 {
            bus.emit(created(mount, &format!("p/{i}")));
        }

        // First frame consumes the single token; subsequent ones queue, and
        // the queue bound forces drops that must be surfaced as one notice.
        let mut saw_notice = false;
        for _ in 0..4 {
            match rx.recv().await {
                Some(SseFrame::RateLimited { dropped }) => {
                    assert!(dropped > 0);
                    saw_notice = true;
                    break;
                }
                Some(_) => continue,
                None => break,
            }
        }
        assert!(saw_notice);
        handle.abort();
    }
}
