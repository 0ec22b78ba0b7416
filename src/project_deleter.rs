use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, warn};

use crate::events::{EventBusClient, RecvEvent};
use crate::upstream_client::UpstreamClient;

const ADMIN_STREAM: &str = "platform-admin";
const PROJECT_REMOVE: &str = "project-remove";

/// Subscribes to the `platform-admin` event stream and bulk-deletes a
/// project's images on `project-remove` events (spec.md §4.9).
pub struct ProjectDeleter {
    upstream: Arc<UpstreamClient>,
    events: Arc<dyn EventBusClient>,
}

impl ProjectDeleter {
    pub fn new(upstream: Arc<UpstreamClient>, events: Arc<dyn EventBusClient>) -> Self {
        Self { upstream, events }
    }

    pub async fn subscribe(self: &Arc<Self>) -> crate::error::Result<()> {
        let this = Arc::clone(self);
        let handler: crate::events::EventHandler = Arc::new(move |event: RecvEvent| {
            let this = Arc::clone(&this);
            Box::pin(async move {
                this.on_admin_event(event).await;
            })
        });
        info!(stream = ADMIN_STREAM, "subscribing to project removal events");
        self.events.subscribe_group(ADMIN_STREAM, handler, true).await?;
        Ok(())
    }

    async fn on_admin_event(&self, event: RecvEvent) {
        if event.event_type != PROJECT_REMOVE {
            return;
        }
        let (Some(org), Some(project)) = (event.org.clone(), event.project.clone()) else {
            warn!(tag = %event.tag, "project-remove event missing org/project, skipping");
            return;
        };
        match self.upstream.delete_project_images(&org, &project).await {
            Ok(()) => {
                let mut acks = HashMap::new();
                acks.insert(ADMIN_STREAM.to_string(), vec![event.tag.clone()]);
                if let Err(e) = self.events.ack(&acks).await {
                    warn!(tag = %event.tag, error = %e, "failed to ack project-remove event after successful deletion");
                }
            }
            Err(e) => {
                warn!(org, project, error = %e, "failed to delete project images, leaving event unacked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth_strategy::BasicAuthStrategy;
    use crate::events::InProcessEventBusClient;
    use std::time::Duration;

    #[tokio::test]
    async fn ignores_events_of_other_types() {
        let upstream = Arc::new(
            UpstreamClient::new(
                url::Url::parse("https://upstream.example").unwrap(),
                "testproject".to_string(),
                None,
                Arc::new(BasicAuthStrategy::new("u", "p")),
                1000,
                Duration::from_secs(30),
                Duration::from_secs(30),
            )
            .unwrap(),
        );
        let events = Arc::new(InProcessEventBusClient::new());
        let deleter = Arc::new(ProjectDeleter::new(upstream, events.clone()));
        deleter.subscribe().await.unwrap();

        events
            .emit(
                ADMIN_STREAM,
                RecvEvent {
                    tag: "t1".to_string(),
                    event_type: "project-create".to_string(),
                    org: Some("acme".to_string()),
                    project: Some("widgets".to_string()),
                },
            )
            .await;
    }
}
