//! Seccomp user-notification support for keel
//!
//! - [`filter`]: BPF programs routing syscalls to a listener descriptor
//! - [`notify`]: the notification descriptor and its ioctls
//! - [`protocol`]: framed JSON messages exchanged with the policy agent
//! - [`agent`]: descriptor handoff and the agent's end of a session
//! - [`session`]: the per-container broker
//! - [`bridge`]: the registry of running sessions
//! - [`support`]: kernel feature checks

#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod agent;
pub mod bridge;
pub mod filter;
pub mod notify;
pub mod protocol;
pub mod session;
pub mod support;

pub use agent::{receive_handoff, send_handoff, AgentConnection, Handoff};
pub use bridge::Bridge;
pub use filter::{
    native_arch, no_new_privs_set, set_no_new_privs, BpfProgram, Instruction, NotifyFilter,
};
pub use notify::{KernelNotifyFd, Notification, NotifyChannel, Response};
pub use protocol::{
    AgentCodec, AgentMessage, JsonCodec, RuntimeCodec, RuntimeMessage, SessionMetadata, Verdict,
    VerdictAction,
};
pub use session::{CloseReason, NotificationSession, SessionState, SessionSummary};
pub use support::{check_feature, listener_supported, FEATURES};

pub use keel_core::{ContainerId, Error, ProcessId, Result};
