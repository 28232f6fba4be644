//! Cluster event channel: a durable, per-node mailbox in the shared
//! database, polled by a system task and fanned out to typed handlers.

mod dispatch;
mod models;

pub use dispatch::{poll_cluster_events, poll_task_body, ClusterEventHandler, EventDispatcher};
pub use models::{
    CacheInvalidatePayload, ClusterEvent, ClusterEventKind, ConfigChangedPayload,
    SchedulesChangedPayload,
};
