use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::error::Result;

/// A single event delivered on a subscribed stream. At-least-once
/// delivery: handlers must be idempotent (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct RecvEvent {
    pub tag: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub org: Option<String>,
    #[serde(default)]
    pub project: Option<String>,
}

pub type EventHandler = Arc<dyn Fn(RecvEvent) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Collaborator seam for the external event bus (spec.md §6). Real
/// deployments bridge this to a message broker; `auto_ack` means the
/// client acks on successful handler return without an explicit `ack`
/// call from the caller.
#[async_trait]
pub trait EventBusClient: Send + Sync {
    async fn subscribe_group(&self, stream: &str, handler: EventHandler, auto_ack: bool) -> Result<()>;

    async fn ack(&self, acks: &HashMap<String, Vec<String>>) -> Result<()>;
}

/// In-process client used for tests and for deployments with no event
/// bus configured: `ack` is a no-op, `subscribe_group` never delivers
/// events on its own. `emit` lets tests/callers push events directly.
#[derive(Default)]
pub struct InProcessEventBusClient {
    handlers: Mutex<HashMap<String, (EventHandler, bool)>>,
}

impl InProcessEventBusClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn emit(&self, stream: &str, event: RecvEvent) {
        let handlers = self.handlers.lock().await;
        if let Some((handler, _)) = handlers.get(stream) {
            handler(event).await;
        }
    }
}

#[async_trait]
impl EventBusClient for InProcessEventBusClient {
    async fn subscribe_group(&self, stream: &str, handler: EventHandler, auto_ack: bool) -> Result<()> {
        self.handlers
            .lock()
            .await
            .insert(stream.to_string(), (handler, auto_ack));
        Ok(())
    }

    async fn ack(&self, _acks: &HashMap<String, Vec<String>>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn emit_invokes_subscribed_handler() {
        let client = InProcessEventBusClient::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        client
            .subscribe_group(
                "platform-admin",
                Arc::new(move |_ev| {
                    let count = count_clone.clone();
                    Box::pin(async move {
                        count.fetch_add(1, Ordering::SeqCst);
                    })
                }),
                true,
            )
            .await
            .unwrap();

        client
            .emit(
                "platform-admin",
                RecvEvent {
                    tag: "t1".to_string(),
                    event_type: "project-remove".to_string(),
                    org: Some("acme".to_string()),
                    project: Some("widgets".to_string()),
                },
            )
            .await;

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn emit_on_unsubscribed_stream_is_noop() {
        let client = InProcessEventBusClient::new();
        client
            .emit(
                "platform-admin",
                RecvEvent {
                    tag: "t1".to_string(),
                    event_type: "project-remove".to_string(),
                    org: None,
                    project: None,
                },
            )
            .await;
    }
}
