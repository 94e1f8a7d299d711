//! Error types for Keel

use std::fmt;
use std::path::PathBuf;

use nix::errno::Errno;
use thiserror::Error;

use crate::document::FieldId;
use crate::types::ContainerId;

/// Keel error types
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed input, rejected before any kernel interaction
    #[error("invalid value for {subject}: {message}")]
    Validation {
        /// Option name or document key that was rejected
        subject: String,
        /// What is wrong with it
        message: String,
    },

    /// Malformed resources document
    #[error("cannot parse resources document: {message}")]
    Parse {
        /// Error message
        message: String,
    },

    /// Field has no analogue on the active cgroup backend
    #[error("{field} is not supported on cgroup {backend}")]
    Unsupported {
        /// Rejected field
        field: FieldId,
        /// Backend name (`v1` or `v2`)
        backend: &'static str,
    },

    /// The container's cgroup no longer exists
    #[error("container {id} not found: no cgroup at {}", .path.display())]
    ContainerNotFound {
        /// Container ID
        id: ContainerId,
        /// Path that was checked
        path: PathBuf,
    },

    /// Some controller writes of an update failed
    #[error("{0}")]
    PartialUpdate(PartialUpdate),

    /// Seccomp listener cannot be installed
    #[error("seccomp listener unsupported: {cause}")]
    ListenerUnsupported {
        /// Why the listener could not be installed
        cause: ListenerCause,
    },

    /// Verdict for a notification id the kernel no longer knows
    #[error("stale seccomp notification {id}")]
    StaleNotification {
        /// Kernel notification id
        id: u64,
    },

    /// Malformed message on the agent socket
    #[error("agent protocol error: {message}")]
    Protocol {
        /// Error message
        message: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig {
        /// Error message
        message: String,
    },

    /// System error from nix
    #[error("System error: {0}")]
    System(#[from] nix::Error),

    /// Channel send error
    #[error("Channel send error")]
    ChannelSend,

    /// Task join error
    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl Error {
    /// Shorthand for a [`Error::Validation`]
    pub fn validation(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            subject: subject.into(),
            message: message.into(),
        }
    }

    /// Whether the error was raised before anything was written to the kernel
    #[must_use]
    pub const fn is_pre_kernel(&self) -> bool {
        matches!(
            self,
            Self::Validation { .. } | Self::Parse { .. } | Self::Unsupported { .. }
        )
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelSend
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Parse {
            message: e.to_string(),
        }
    }
}

/// Why a seccomp listener could not be installed.
///
/// `MissingNoNewPrivileges` is a caller misconfiguration, `Kernel` means the
/// running kernel (or the caller's privileges) lacks the capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerCause {
    /// `PR_SET_NO_NEW_PRIVS` was not set before installing the filter
    MissingNoNewPrivileges,
    /// The kernel rejected the listener flag
    Kernel(Errno),
}

impl ListenerCause {
    /// True when the failure is a configuration problem rather than a kernel gap
    #[must_use]
    pub const fn is_misconfiguration(self) -> bool {
        matches!(self, Self::MissingNoNewPrivileges)
    }
}

impl fmt::Display for ListenerCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingNoNewPrivileges => {
                write!(f, "misconfigured: no_new_privs must be set first")
            }
            Self::Kernel(errno) => write!(f, "kernel refused listener: {errno}"),
        }
    }
}

/// One failed controller write
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("write {value:?} to {} failed: {errno}", .path.display())]
pub struct WriteError {
    /// Controller file
    pub path: PathBuf,
    /// Value that was written
    pub value: String,
    /// Kernel errno
    pub errno: Errno,
}

impl WriteError {
    /// Build from an I/O error, falling back to `EIO` when it carries no errno
    #[must_use]
    pub fn from_io(path: PathBuf, value: String, err: &std::io::Error) -> Self {
        let errno = err.raw_os_error().map_or(Errno::EIO, Errno::from_raw);
        Self { path, value, errno }
    }
}

/// Outcome of an update that stopped at its first failed write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialUpdate {
    /// Container ID
    pub container_id: ContainerId,
    /// Fields written successfully, in write order
    pub succeeded: Vec<FieldId>,
    /// Fields carried by the failed write
    pub failed: Vec<FieldId>,
    /// The failure itself
    pub error: WriteError,
    /// Fields never attempted, in plan order
    pub not_attempted: Vec<FieldId>,
}

impl fmt::Display for PartialUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = |fields: &[FieldId]| {
            if fields.is_empty() {
                "none".to_string()
            } else {
                fields
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join(", ")
            }
        };

        write!(
            f,
            "partial update of {}: failed [{}] ({}); succeeded [{}]; not attempted [{}]",
            self.container_id,
            names(&self.failed),
            self.error,
            names(&self.succeeded),
            names(&self.not_attempted)
        )
    }
}

/// Result type alias for Keel operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listener_cause_distinguishes_misconfiguration() {
        assert!(ListenerCause::MissingNoNewPrivileges.is_misconfiguration());
        assert!(!ListenerCause::Kernel(Errno::EINVAL).is_misconfiguration());

        let err = Error::ListenerUnsupported {
            cause: ListenerCause::MissingNoNewPrivileges,
        };
        assert!(err.to_string().contains("misconfigured"));
    }

    #[test]
    fn write_error_from_io_keeps_errno() {
        let io = std::io::Error::from_raw_os_error(libc::EPERM);
        let err = WriteError::from_io(PathBuf::from("/x/cpu.max"), "1 2".into(), &io);
        assert_eq!(err.errno, Errno::EPERM);

        let io = std::io::Error::other("no errno");
        let err = WriteError::from_io(PathBuf::from("/x/cpu.max"), "1 2".into(), &io);
        assert_eq!(err.errno, Errno::EIO);
    }

    #[test]
    fn partial_update_display_lists_fields() {
        let report = PartialUpdate {
            container_id: ContainerId::new("c1").unwrap(),
            succeeded: vec![],
            failed: vec![FieldId::MemoryLimit],
            error: WriteError {
                path: PathBuf::from("/sys/fs/cgroup/memory.max"),
                value: "1000".into(),
                errno: Errno::EPERM,
            },
            not_attempted: vec![FieldId::MemorySwap],
        };

        let text = report.to_string();
        assert!(text.contains("failed [memory.limit]"));
        assert!(text.contains("not attempted [memory.swap]"));
        assert!(text.contains("succeeded [none]"));
    }
}
