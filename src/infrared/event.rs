//! Connection lifecycle events.
//!
//! `Pre*` topics are requested synchronously: every attached handler runs and
//! the first error cancels the action. The rest are pushed without waiting.

use std::{
    fmt,
    sync::{
        Arc, OnceLock, RwLock,
        atomic::{AtomicU64, Ordering},
    },
};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Topic {
    AcceptedConn,
    PreConnProcessing,
    PostConnProcessing,
    PrePlayerJoin,
    PlayerJoin,
    PlayerLeave,
    ConnError,
}

impl Topic {
    pub const ALL: [Topic; 7] = [
        Topic::AcceptedConn,
        Topic::PreConnProcessing,
        Topic::PostConnProcessing,
        Topic::PrePlayerJoin,
        Topic::PlayerJoin,
        Topic::PlayerLeave,
        Topic::ConnError,
    ];
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edition: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requested_host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol_version: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_in: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes_out: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_login_request: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: u64,
    pub topic: Topic,
    pub payload: EventPayload,
}

#[derive(Debug, Clone, Error)]
pub enum EventError {
    #[error("{handler} rejected {topic}: {reason}")]
    Rejected {
        handler: String,
        topic: Topic,
        reason: String,
    },
    #[error("{0}")]
    Handler(String),
}

impl EventError {
    pub fn reject(reason: impl Into<String>) -> Self {
        EventError::Handler(reason.into())
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), EventError>;
}

/// Adapts a plain function into a [`Handler`].
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> Handler for FnHandler<F>
where
    F: Fn(&Event) -> Result<(), EventError> + Send + Sync,
{
    async fn handle(&self, event: &Event) -> Result<(), EventError> {
        (self.0)(event)
    }
}

struct Registration {
    id: String,
    topics: Vec<Topic>,
    handler: Arc<dyn Handler>,
}

pub struct EventBus {
    handlers: RwLock<Vec<Registration>>,
    tx: broadcast::Sender<Event>,
    next_id: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("handlers", &self.handler_ids())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            handlers: RwLock::new(Vec::new()),
            tx,
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `handler` for `topics`, replacing any handler with the same id.
    pub fn attach(&self, id: impl Into<String>, topics: &[Topic], handler: Arc<dyn Handler>) {
        let id = id.into();
        let Ok(mut handlers) = self.handlers.write() else {
            return;
        };
        handlers.retain(|r| r.id != id);
        handlers.push(Registration {
            id,
            topics: topics.to_vec(),
            handler,
        });
    }

    pub fn detach(&self, id: &str) -> bool {
        let Ok(mut handlers) = self.handlers.write() else {
            return false;
        };
        let before = handlers.len();
        handlers.retain(|r| r.id != id);
        handlers.len() != before
    }

    pub fn handler_ids(&self) -> Vec<String> {
        self.handlers
            .read()
            .map(|h| h.iter().map(|r| r.id.clone()).collect())
            .unwrap_or_default()
    }

    /// Every event published on this bus, regardless of topic.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    fn build(&self, topic: Topic, payload: EventPayload) -> Event {
        Event {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            topic,
            payload,
        }
    }

    fn handlers_for(&self, topic: Topic) -> Vec<(String, Arc<dyn Handler>)> {
        self.handlers
            .read()
            .map(|h| {
                h.iter()
                    .filter(|r| r.topics.contains(&topic))
                    .map(|r| (r.id.clone(), Arc::clone(&r.handler)))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Runs every handler for `topic` and waits for them. The first error
    /// cancels the remaining handlers and is returned.
    pub async fn request(&self, topic: Topic, payload: EventPayload) -> Result<Event, EventError> {
        let event = self.build(topic, payload);
        let _ = self.tx.send(event.clone());

        let handlers = self.handlers_for(topic);
        if handlers.is_empty() {
            return Ok(event);
        }
        let event_ref = &event;
        let calls = handlers.into_iter().map(|(id, h)| async move {
            h.handle(event_ref).await.map_err(|err| match err {
                EventError::Handler(reason) => EventError::Rejected {
                    handler: id,
                    topic,
                    reason,
                },
                other => other,
            })
        });
        futures_util::future::try_join_all(calls).await?;
        Ok(event)
    }

    /// Publishes without waiting; handler errors are only logged.
    pub fn push(&self, topic: Topic, payload: EventPayload) -> Event {
        let event = self.build(topic, payload);
        let _ = self.tx.send(event.clone());

        for (id, h) in self.handlers_for(topic) {
            let event = event.clone();
            tokio::spawn(async move {
                if let Err(err) = h.handle(&event).await {
                    tracing::debug!(handler = %id, topic = %event.topic, err = %err, "event: handler failed");
                }
            });
        }
        event
    }
}

/// Bus shared by every proxy in the process.
pub fn default_bus() -> Arc<EventBus> {
    static BUS: OnceLock<Arc<EventBus>> = OnceLock::new();
    Arc::clone(BUS.get_or_init(|| Arc::new(EventBus::new())))
}
