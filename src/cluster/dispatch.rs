use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::models::{ClusterEvent, ClusterEventKind};
use crate::store::SchedulerStore;
use crate::tasks::SystemTaskBody;

/// Handler for one kind of cluster event. Handlers must be idempotent:
/// delivery is at-least-once and a crashed cycle may lose or replay effects.
pub type ClusterEventHandler = Arc<dyn Fn(&ClusterEvent) -> Result<()> + Send + Sync>;

/// Maps event tags to collaborator handlers. The `Shutdown` tag is special:
/// it cancels the process shutdown token instead of calling a handler.
pub struct EventDispatcher {
    handlers: Mutex<HashMap<ClusterEventKind, ClusterEventHandler>>,
    shutdown: CancellationToken,
}

impl EventDispatcher {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    /// Register the handler for an event kind, replacing any previous one.
    /// Registration works after the dispatcher has been shared, so handlers
    /// may capture components constructed later.
    pub fn register<F>(&self, kind: ClusterEventKind, handler: F)
    where
        F: Fn(&ClusterEvent) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.lock().unwrap().insert(kind, Arc::new(handler));
    }

    pub fn dispatch(&self, event: &ClusterEvent) -> Result<()> {
        if matches!(event, ClusterEvent::Shutdown) {
            info!("shutdown requested via cluster event");
            self.shutdown.cancel();
            return Ok(());
        }

        let handler = self.handlers.lock().unwrap().get(&event.kind()).cloned();
        match handler {
            Some(handler) => handler(event),
            None => {
                debug!(tag = %event.tag(), "no handler registered for cluster event");
                Ok(())
            }
        }
    }
}

/// One poll cycle over the local node's mailbox: fetch all rows addressed to
/// this node, delete the batch, then decode and dispatch in row order.
///
/// The delete happens before dispatch, so a failure mid-batch loses the
/// undispatched remainder for this cycle (documented at-least-once
/// tradeoff). Unknown tags are skipped silently; decode and handler errors
/// abort the remaining batch and surface as the poll task's failure.
pub fn poll_cluster_events(
    store: &dyn SchedulerStore,
    node_id: i64,
    dispatcher: &EventDispatcher,
) -> Result<()> {
    let rows = store.fetch_cluster_events(node_id)?;
    if rows.is_empty() {
        return Ok(());
    }

    let max_id = rows.iter().map(|row| row.id).max().unwrap_or(0);
    store.delete_cluster_events_up_to(node_id, max_id)?;
    debug!(node_id, batch = rows.len(), "polled cluster events");

    for row in rows {
        match ClusterEvent::decode(&row.content_tag, &row.payload)? {
            Some(event) => dispatcher
                .dispatch(&event)
                .with_context(|| format!("dispatching cluster event '{}'", row.content_tag))?,
            None => {
                debug!(tag = %row.content_tag, "ignoring unknown cluster event tag");
            }
        }
    }
    Ok(())
}

/// Build the body of the cluster-event-poll system task.
pub fn poll_task_body(
    store: Arc<dyn SchedulerStore>,
    node_id: i64,
    dispatcher: Arc<EventDispatcher>,
) -> SystemTaskBody {
    Arc::new(move || poll_cluster_events(store.as_ref(), node_id, &dispatcher))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::models::{CacheInvalidatePayload, SchedulesChangedPayload};
    use crate::store::SqliteSchedulerStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn create_store() -> (Arc<SqliteSchedulerStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store =
            Arc::new(SqliteSchedulerStore::new(temp_dir.path().join("scheduler.db")).unwrap());
        (store, temp_dir)
    }

    fn insert(store: &SqliteSchedulerStore, node_id: i64, event: &ClusterEvent) {
        store
            .insert_cluster_event(node_id, event.tag(), &event.payload())
            .unwrap();
    }

    #[test]
    fn test_poll_dispatches_only_local_node_events() {
        let (store, _temp_dir) = create_store();
        let dispatcher = EventDispatcher::new(CancellationToken::new());

        let dispatched = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&dispatched);
        dispatcher.register(ClusterEventKind::SchedulesChanged, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let event = ClusterEvent::SchedulesChanged(SchedulesChangedPayload::default());
        insert(&store, 1, &event);
        insert(&store, 2, &event);
        insert(&store, 1, &event);

        poll_cluster_events(store.as_ref(), 1, &dispatcher).unwrap();

        assert_eq!(dispatched.load(Ordering::SeqCst), 2);
        // Node 2's row stays untouched in the mailbox.
        assert_eq!(store.fetch_cluster_events(2).unwrap().len(), 1);
        assert!(store.fetch_cluster_events(1).unwrap().is_empty());
    }

    #[test]
    fn test_unknown_tags_are_ignored() {
        let (store, _temp_dir) = create_store();
        let dispatcher = EventDispatcher::new(CancellationToken::new());

        store
            .insert_cluster_event(1, "node_gossip", &serde_json::json!({"v": 2}))
            .unwrap();
        insert(
            &store,
            1,
            &ClusterEvent::SchedulesChanged(SchedulesChangedPayload::default()),
        );

        let dispatched = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&dispatched);
        dispatcher.register(ClusterEventKind::SchedulesChanged, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        poll_cluster_events(store.as_ref(), 1, &dispatcher).unwrap();
        assert_eq!(dispatched.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_event_cancels_token_without_handler() {
        let (store, _temp_dir) = create_store();
        let token = CancellationToken::new();
        let dispatcher = EventDispatcher::new(token.clone());

        // A registered handler for Shutdown must not be consulted.
        dispatcher.register(ClusterEventKind::Shutdown, |_| {
            panic!("shutdown must bypass data-layer handlers")
        });

        insert(&store, 1, &ClusterEvent::Shutdown);
        poll_cluster_events(store.as_ref(), 1, &dispatcher).unwrap();
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_handler_error_aborts_remaining_batch() {
        let (store, _temp_dir) = create_store();
        let dispatcher = EventDispatcher::new(CancellationToken::new());

        dispatcher.register(ClusterEventKind::ConfigChanged, |_| {
            anyhow::bail!("collaborator exploded")
        });
        let cache_calls = Arc::new(AtomicUsize::new(0));
        let count = Arc::clone(&cache_calls);
        dispatcher.register(ClusterEventKind::CacheInvalidate, move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        insert(
            &store,
            1,
            &ClusterEvent::ConfigChanged(crate::cluster::ConfigChangedPayload {
                keys: vec!["mail.relay".to_string()],
            }),
        );
        insert(
            &store,
            1,
            &ClusterEvent::CacheInvalidate(CacheInvalidatePayload {
                scope: "folders".to_string(),
                tenant_id: None,
            }),
        );

        let result = poll_cluster_events(store.as_ref(), 1, &dispatcher);
        assert!(result.is_err());
        assert_eq!(cache_calls.load(Ordering::SeqCst), 0);
        // The batch was already deleted: the undispatched event is lost.
        assert!(store.fetch_cluster_events(1).unwrap().is_empty());
    }

    #[test]
    fn test_malformed_payload_aborts_batch_after_delete() {
        let (store, _temp_dir) = create_store();
        let dispatcher = EventDispatcher::new(CancellationToken::new());

        store
            .insert_cluster_event(1, "cache_invalidate", &serde_json::json!({"bogus": true}))
            .unwrap();

        let result = poll_cluster_events(store.as_ref(), 1, &dispatcher);
        assert!(result.is_err());
        assert!(store.fetch_cluster_events(1).unwrap().is_empty());
    }

    #[test]
    fn test_unhandled_known_tag_is_a_no_op() {
        let (store, _temp_dir) = create_store();
        let dispatcher = EventDispatcher::new(CancellationToken::new());
        insert(
            &store,
            1,
            &ClusterEvent::ConfigChanged(crate::cluster::ConfigChangedPayload { keys: vec![] }),
        );
        poll_cluster_events(store.as_ref(), 1, &dispatcher).unwrap();
    }
}
