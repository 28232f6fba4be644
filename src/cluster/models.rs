use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tag of a cluster event. Unknown tags on the wire are ignored so that
/// nodes running different versions can share one mailbox table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterEventKind {
    /// Persisted configuration changed; caches for the named keys are stale.
    ConfigChanged,
    /// Drop a cached scope, optionally for a single tenant.
    CacheInvalidate,
    /// The persisted schedule set changed; the receiving node must rebuild
    /// its task registry.
    SchedulesChanged,
    /// Request an orderly process shutdown.
    Shutdown,
}

impl ClusterEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterEventKind::ConfigChanged => "config_changed",
            ClusterEventKind::CacheInvalidate => "cache_invalidate",
            ClusterEventKind::SchedulesChanged => "schedules_changed",
            ClusterEventKind::Shutdown => "shutdown",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "config_changed" => Some(ClusterEventKind::ConfigChanged),
            "cache_invalidate" => Some(ClusterEventKind::CacheInvalidate),
            "schedules_changed" => Some(ClusterEventKind::SchedulesChanged),
            "shutdown" => Some(ClusterEventKind::Shutdown),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClusterEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigChangedPayload {
    /// Configuration keys whose cached values are stale.
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheInvalidatePayload {
    /// Named cache scope, e.g. "folders" or "user_settings".
    pub scope: String,
    /// Restrict the invalidation to one tenant; `None` drops the whole scope.
    pub tenant_id: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulesChangedPayload {
    /// Routine whose schedules changed; `None` means any.
    pub routine_id: Option<i64>,
}

/// A decoded cluster event addressed to this node.
#[derive(Debug, Clone)]
pub enum ClusterEvent {
    ConfigChanged(ConfigChangedPayload),
    CacheInvalidate(CacheInvalidatePayload),
    SchedulesChanged(SchedulesChangedPayload),
    Shutdown,
}

impl ClusterEvent {
    pub fn kind(&self) -> ClusterEventKind {
        match self {
            ClusterEvent::ConfigChanged(_) => ClusterEventKind::ConfigChanged,
            ClusterEvent::CacheInvalidate(_) => ClusterEventKind::CacheInvalidate,
            ClusterEvent::SchedulesChanged(_) => ClusterEventKind::SchedulesChanged,
            ClusterEvent::Shutdown => ClusterEventKind::Shutdown,
        }
    }

    pub fn tag(&self) -> &'static str {
        self.kind().as_str()
    }

    /// JSON payload for inserting into the mailbox table.
    pub fn payload(&self) -> serde_json::Value {
        match self {
            ClusterEvent::ConfigChanged(p) => serde_json::to_value(p),
            ClusterEvent::CacheInvalidate(p) => serde_json::to_value(p),
            ClusterEvent::SchedulesChanged(p) => serde_json::to_value(p),
            ClusterEvent::Shutdown => Ok(serde_json::json!({})),
        }
        // payload structs only contain serializable fields
        .unwrap_or_else(|_| serde_json::json!({}))
    }

    /// Decode a stored row. `Ok(None)` means an unknown tag, which the poll
    /// cycle skips silently; a malformed payload for a known tag is an error.
    pub fn decode(tag: &str, payload: &str) -> Result<Option<ClusterEvent>> {
        let Some(kind) = ClusterEventKind::parse(tag) else {
            return Ok(None);
        };
        let event = match kind {
            ClusterEventKind::ConfigChanged => ClusterEvent::ConfigChanged(
                serde_json::from_str(payload)
                    .with_context(|| format!("malformed {} payload", tag))?,
            ),
            ClusterEventKind::CacheInvalidate => ClusterEvent::CacheInvalidate(
                serde_json::from_str(payload)
                    .with_context(|| format!("malformed {} payload", tag))?,
            ),
            ClusterEventKind::SchedulesChanged => ClusterEvent::SchedulesChanged(
                serde_json::from_str(payload)
                    .with_context(|| format!("malformed {} payload", tag))?,
            ),
            ClusterEventKind::Shutdown => ClusterEvent::Shutdown,
        };
        Ok(Some(event))
    }
}
