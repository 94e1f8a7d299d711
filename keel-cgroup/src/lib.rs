//! Cgroup resource reconciliation with pluggable backends
//!
//! This crate applies resource documents to the existing cgroup of a running
//! container, on either the v1 per-controller hierarchies or the v2 unified
//! hierarchy, with a mock backend for tests.

#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod backend;
pub mod detect;
pub mod reconcile;
pub mod v1;
pub mod v2;

pub use backend::{
    CgroupBackend, CgroupTarget, Controller, ControllerWrite, MockBackend, WriteStage,
};
pub use detect::{backend_from_config, detect_version};
pub use reconcile::{Reconciler, UpdateSummary};
pub use v1::CgroupV1;
pub use v2::CgroupV2;

// Re-export commonly used types
pub use keel_core::{CgroupVersion, FieldId, PartialUpdate, ResourceDocument, WriteError};
