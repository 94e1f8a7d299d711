//! Keel Core - identifiers, resource documents, configuration and events
//!
//! This crate provides the types shared by the cgroup reconciliation engine
//! and the seccomp notification bridge.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod codec;
pub mod config;
pub mod document;
pub mod error;
pub mod events;
pub mod types;

pub use config::{CgroupVersion, RuntimeConfig};
pub use document::{FieldDescriptor, FieldId, FieldKind, FieldValue, ResourceDocument, Section};
pub use error::{Error, ListenerCause, PartialUpdate, Result, WriteError};
pub use events::RuntimeEvent;
pub use types::{ContainerId, ProcessId};
