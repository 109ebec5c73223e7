//! Event publisher: in-process delivery plus an optional redis channel
//!
//! Every event is emitted on the local bus synchronously. In redis mode the
//! event is additionally published on a named channel wrapped in an origin
//! envelope, and a listener task re-emits events received from other
//! processes (skipping our own by origin token).

use super::{EventBus, FilestoreEvent};
use crate::config::{EventsConfig, RedisConfig};
use crate::shared::error::{FilestoreError, FilestoreResult};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Guard that must be set before a requested redis mode may fall back inline
pub const ALLOW_INLINE_MODE_ENV: &str = "FILESTORE_ALLOW_INLINE_MODE";

/// Delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventsMode {
    Inline,
    Redis,
}

/// Readiness snapshot
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherStatus {
    pub mode: EventsMode,
    pub ready: bool,
    pub last_error: Option<String>,
}

/// Cross-process wire envelope
#[derive(Debug, Serialize, Deserialize)]
struct WireEnvelope {
    origin: String,
    event: FilestoreEvent,
}

pub struct EventPublisher {
    bus: EventBus,
    origin: String,
    channel: String,
    redis: Option<redis::aio::ConnectionManager>,
    status: RwLock<PublisherStatus>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl EventPublisher {
    /// In-process only publisher
    pub fn inline(bus: EventBus) -> Arc<Self> {
        Arc::new(Self {
            bus,
            origin: Uuid::new_v4().to_string(),
            channel: String::new(),
            redis: None,
            status: RwLock::new(PublisherStatus {
                mode: EventsMode::Inline,
                ready: true,
                last_error: None,
            }),
            listener: Mutex::new(None),
        })
    }

    /// Connect according to configuration.
    ///
    /// A failing redis connection is an error unless the allow-inline guard
    /// is set, in which case the publisher downgrades to inline with a
    /// warning.
    pub async fn connect(
        events: &EventsConfig,
        redis_cfg: &RedisConfig,
        bus: EventBus,
    ) -> FilestoreResult<Arc<Self>> {
        match events.mode {
            EventsMode::Inline => Ok(Self::inline(bus)),
            EventsMode::Redis => {
                let channel = format!("{}{}", redis_cfg.key_prefix, events.channel);
                match Self::connect_redis(&redis_cfg.url, &channel, bus).await {
                    Ok(publisher) => Ok(publisher),
                    Err(err) if inline_fallback_allowed() => {
                        warn!(
                            "Redis event channel unavailable, falling back inline ({}): {}",
                            ALLOW_INLINE_MODE_ENV, err
                        );
                        Ok(Self::inline(EventBus::default()))
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    async fn connect_redis(
        url: &str,
        channel: &str,
        bus: EventBus,
    ) -> FilestoreResult<Arc<Self>> {
        let client = redis::Client::open(url)
            .map_err(|e| FilestoreError::internal(format!("redis client: {e}")))?;

        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| FilestoreError::internal(format!("redis publish connection: {e}")))?;

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| FilestoreError::internal(format!("redis subscribe connection: {e}")))?;
        pubsub
            .subscribe(channel)
            .await
            .map_err(|e| FilestoreError::internal(format!("redis subscribe: {e}")))?;

        let origin = Uuid::new_v4().to_string();
        let publisher = Arc::new(Self {
            bus,
            origin: origin.clone(),
            channel: channel.to_string(),
            redis: Some(manager),
            status: RwLock::new(PublisherStatus {
                mode: EventsMode::Redis,
                ready: true,
                last_error: None,
            }),
            listener: Mutex::new(None),
        });

        // Re-emit events published by other processes on the local bus
        let listener_publisher = publisher.clone();
        let handle = tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(message) = stream.next().await {
                let payload: String = match message.get_payload() {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!("Dropping unreadable event frame: {}", err);
                        continue;
                    }
                };
                match serde_json::from_str::<WireEnvelope>(&payload) {
                    Ok(envelope) if envelope.origin != listener_publisher.origin => {
                        listener_publisher.bus.emit(envelope.event);
                    }
                    Ok(_) => {} // Our own echo
                    Err(err) => warn!("Dropping malformed event frame: {}", err),
                }
            }
            let mut status = listener_publisher.status.write().await;
            status.ready = false;
            status.last_error = Some("subscriber connection closed".to_string());
        });
        *publisher.listener.lock().await = Some(handle);

        info!("Event publisher connected to redis channel '{}'", channel);
        Ok(publisher)
    }

    /// Publish an event: local bus always, redis channel when configured.
    pub async fn publish(&self, event: FilestoreEvent) {
        self.bus.emit(event.clone());

        if let Some(manager) = &self.redis {
            let envelope = WireEnvelope {
                origin: self.origin.clone(),
                event,
            };
            let payload = match serde_json::to_string(&envelope) {
                Ok(payload) => payload,
                Err(err) => {
                    error!("Failed to serialize event envelope: {}", err);
                    return;
                }
            };
            let mut conn = manager.clone();
            if let Err(err) = redis::cmd("PUBLISH")
                .arg(&self.channel)
                .arg(payload)
                .query_async::<()>(&mut conn)
                .await
            {
                error!("Failed to publish event to redis: {}", err);
                let mut status = self.status.write().await;
                status.ready = false;
                status.last_error = Some(err.to_string());
            }
        }
    }

    /// Subscribe to the local bus (includes re-emitted remote events)
    pub fn subscribe(&self) -> broadcast::Receiver<FilestoreEvent> {
        self.bus.subscribe()
    }

    pub async fn status(&self) -> PublisherStatus {
        self.status.read().await.clone()
    }

    /// Stop the subscriber task
    pub async fn shutdown(&self) {
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
    }
}

fn inline_fallback_allowed() -> bool {
    std::env::var(ALLOW_INLINE_MODE_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::node::{NodeKind, NodeState};
    use crate::infrastructure::events::{CommandContext, NodeEventPayload};
    use chrono::Utc;

    #[tokio::test]
    async fn inline_publisher_is_ready_and_delivers() {
        let publisher = EventPublisher::inline(EventBus::default());
        let status = publisher.status().await;
        assert_eq!(status.mode, EventsMode::Inline);
        assert!(status.ready);

        let mut rx = publisher.subscribe();
        publisher
            .publish(FilestoreEvent::NodeDeleted(NodeEventPayload {
                backend_mount_id: Uuid::new_v4(),
                node_id: None,
                path: "a".to_string(),
                kind: NodeKind::File,
                state: NodeState::Deleted,
                parent_id: None,
                version: 2,
                size_bytes: 0,
                checksum: None,
                content_hash: None,
                metadata: serde_json::json!({}),
                observed_at: Utc::now(),
                context: CommandContext::default(),
            }))
            .await;
        assert_eq!(rx.recv().await.unwrap().event_type(), "node.deleted");
    }

    #[test]
    fn wire_envelope_round_trips() {
        let envelope = WireEnvelope {
            origin: "proc-a".to_string(),
            event: FilestoreEvent::CommandCompleted(
                crate::infrastructure::events::CommandCompletedPayload {
                    journal_id: Uuid::new_v4(),
                    command: "directory.create".to_string(),
                    status: "succeeded".to_string(),
                    backend_mount_id: None,
                    node_id: None,
                    path: None,
                    idempotency_key: None,
                    principal: None,
                    result: serde_json::json!({}),
                    observed_at: Utc::now(),
                },
            ),
        };
        let json = serde_json::to_string(&envelope).unwrap();
        let back: WireEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back.origin, "proc-a");
        assert_eq!(back.event.event_type(), "command.completed");
    }
}
