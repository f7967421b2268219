//! Workspace lifecycle events.

use crate::workspace::{Workspace, WorkspaceStatus};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::mpsc;
use tracing::trace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
    SnapshotCreating,
    SnapshotCreated,
    SnapshotCreationError,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkspaceStatusEvent {
    pub workspace_id: String,
    pub prev_status: WorkspaceStatus,
    pub status: WorkspaceStatus,
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum WorkspaceEvent {
    StatusChanged(WorkspaceStatusEvent),
    Created(Box<Workspace>),
    Removed { workspace_id: String },
}

impl WorkspaceEvent {
    pub fn workspace_id(&self) -> &str {
        match self {
            WorkspaceEvent::StatusChanged(e) => &e.workspace_id,
            WorkspaceEvent::Created(ws) => &ws.id,
            WorkspaceEvent::Removed { workspace_id } => workspace_id,
        }
    }

    /// The status change carried by this event, if any.
    pub fn status_change(&self) -> Option<&WorkspaceStatusEvent> {
        match self {
            WorkspaceEvent::StatusChanged(e) => Some(e),
            _ => None,
        }
    }
}

pub type SubscriptionId = u64;

type Handler = Arc<dyn Fn(&WorkspaceEvent) + Send + Sync>;

/// Synchronous in-process event bus.
///
/// Handlers run on the publishing thread, in subscription order, before
/// `publish` returns. Handlers must not block.
#[derive(Default)]
pub struct EventBus {
    next_id: AtomicU64,
    handlers: RwLock<Vec<(SubscriptionId, Handler)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&WorkspaceEvent) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(handler)));
        id
    }

    /// Subscribe with an unbounded channel; events arrive in publish order.
    pub fn subscribe_channel(&self) -> (SubscriptionId, mpsc::UnboundedReceiver<WorkspaceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(move |event| {
            let _ = tx.send(event.clone());
        });
        (id, rx)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self
            .handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|(handler_id, _)| *handler_id != id);
        handlers.len() != before
    }

    pub fn publish(&self, event: WorkspaceEvent) {
        trace!(workspace_id = event.workspace_id(), "Publishing {:?}", event);
        let handlers: Vec<Handler> = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        for handler in handlers {
            handler(&event);
        }
    }

    pub fn publish_status(
        &self,
        workspace_id: &str,
        prev_status: WorkspaceStatus,
        status: WorkspaceStatus,
        event_type: EventType,
        error: Option<String>,
    ) {
        self.publish(WorkspaceEvent::StatusChanged(WorkspaceStatusEvent {
            workspace_id: workspace_id.to_string(),
            prev_status,
            status,
            event_type,
            error,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_handlers_receive_events_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.subscribe(move |event| {
            if let Some(change) = event.status_change() {
                sink.lock().unwrap().push(change.status);
            }
        });

        bus.publish_status(
            "ws1",
            WorkspaceStatus::Stopped,
            WorkspaceStatus::Starting,
            EventType::Starting,
            None,
        );
        bus.publish_status(
            "ws1",
            WorkspaceStatus::Starting,
            WorkspaceStatus::Running,
            EventType::Running,
            None,
        );

        assert_eq!(
            *seen.lock().unwrap(),
            vec![WorkspaceStatus::Starting, WorkspaceStatus::Running]
        );
    }

    #[tokio::test]
    async fn test_channel_subscription_and_unsubscribe() {
        let bus = EventBus::new();
        let (id, mut rx) = bus.subscribe_channel();

        bus.publish(WorkspaceEvent::Removed {
            workspace_id: "ws1".to_string(),
        });
        assert_eq!(rx.recv().await.unwrap().workspace_id(), "ws1");

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(WorkspaceEvent::Removed {
            workspace_id: "ws2".to_string(),
        });
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn test_event_type_wire_names() {
        assert_eq!(
            serde_json::to_string(&EventType::SnapshotCreationError).unwrap(),
            "\"SNAPSHOT_CREATION_ERROR\""
        );
    }
}
