//! Control-plane events with structured tracing

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

use crate::{ContainerId, ProcessId};

/// Events emitted by the reconciliation engine and the notification bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// Every planned controller write succeeded
    ResourcesUpdated {
        /// Container ID
        id: ContainerId,
        /// Number of controller writes performed
        writes: usize,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// An update stopped at a failed controller write
    PartialUpdate {
        /// Container ID
        id: ContainerId,
        /// Fields carried by the failed write
        failed: Vec<String>,
        /// Number of fields never attempted
        not_attempted: usize,
        /// Kernel errno of the failure
        errno: i32,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// A notification session entered brokering
    SessionStarted {
        /// Container ID
        id: ContainerId,
        /// Monitored process
        pid: ProcessId,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// A verdict arrived for a notification the kernel already dropped
    StaleNotification {
        /// Container ID
        id: ContainerId,
        /// Kernel notification id
        notification: u64,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },

    /// A notification session was torn down
    SessionClosed {
        /// Container ID
        id: ContainerId,
        /// Why the session closed
        reason: String,
        /// Notifications answered with an agent verdict
        answered: u64,
        /// Notifications answered with the default deny
        denied: u64,
        /// Timestamp
        #[serde(with = "systemtime_serde")]
        timestamp: SystemTime,
    },
}

impl RuntimeEvent {
    /// Get the container ID from any event
    #[must_use]
    pub const fn container_id(&self) -> &ContainerId {
        match self {
            Self::ResourcesUpdated { id, .. }
            | Self::PartialUpdate { id, .. }
            | Self::SessionStarted { id, .. }
            | Self::StaleNotification { id, .. }
            | Self::SessionClosed { id, .. } => id,
        }
    }

    /// Get the timestamp from any event
    #[must_use]
    pub const fn timestamp(&self) -> SystemTime {
        match self {
            Self::ResourcesUpdated { timestamp, .. }
            | Self::PartialUpdate { timestamp, .. }
            | Self::SessionStarted { timestamp, .. }
            | Self::StaleNotification { timestamp, .. }
            | Self::SessionClosed { timestamp, .. } => *timestamp,
        }
    }

    /// Whether an operator should look at this event
    #[must_use]
    pub const fn is_critical(&self) -> bool {
        matches!(self, Self::PartialUpdate { .. })
    }

    /// Emit structured tracing event
    pub fn emit_trace(&self) {
        match self {
            Self::ResourcesUpdated { id, writes, .. } => {
                tracing::info!(
                    container_id = %id,
                    writes,
                    event = "resources_updated",
                    "Resources updated"
                );
            }
            Self::PartialUpdate {
                id,
                failed,
                not_attempted,
                errno,
                ..
            } => {
                tracing::warn!(
                    container_id = %id,
                    failed = ?failed,
                    not_attempted,
                    errno,
                    event = "partial_update",
                    "Partial resource update"
                );
            }
            Self::SessionStarted { id, pid, .. } => {
                tracing::info!(
                    container_id = %id,
                    pid = pid.as_raw(),
                    event = "session_started",
                    "Seccomp notification session started"
                );
            }
            Self::StaleNotification { id, notification, .. } => {
                tracing::warn!(
                    container_id = %id,
                    notification,
                    event = "stale_notification",
                    "Dropping verdict for stale notification"
                );
            }
            Self::SessionClosed {
                id,
                reason,
                answered,
                denied,
                ..
            } => {
                tracing::info!(
                    container_id = %id,
                    reason = %reason,
                    answered,
                    denied,
                    event = "session_closed",
                    "Seccomp notification session closed"
                );
            }
        }
    }
}

impl fmt::Display for RuntimeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResourcesUpdated { id, writes, .. } => {
                write!(f, "Container {id} resources updated ({writes} writes)")
            }
            Self::PartialUpdate { id, failed, .. } => {
                write!(f, "Container {id} partial update, failed: {}", failed.join(", "))
            }
            Self::SessionStarted { id, pid, .. } => {
                write!(f, "Container {id} notification session started for pid {pid}")
            }
            Self::StaleNotification { id, notification, .. } => {
                write!(f, "Container {id} stale notification {notification}")
            }
            Self::SessionClosed { id, reason, .. } => {
                write!(f, "Container {id} notification session closed: {reason}")
            }
        }
    }
}

// Custom SystemTime serialization
mod systemtime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::{SystemTime, UNIX_EPOCH};

    pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let since_epoch = time
            .duration_since(UNIX_EPOCH)
            .map_err(serde::ser::Error::custom)?;
        serializer.serialize_u64(since_epoch.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(UNIX_EPOCH + std::time::Duration::from_secs(secs))
    }
}
