//! Resource reconciliation
//!
//! Applies a [`ResourceDocument`] to a running container's existing cgroup.
//! Updates to one container are serialized; updates to different containers
//! run concurrently.

use keel_core::{
    CgroupVersion, ContainerId, Error, FieldId, PartialUpdate, ResourceDocument, Result,
    RuntimeEvent,
};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use std::time::SystemTime;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info};

use crate::backend::{CgroupBackend, ControllerWrite};

/// Outcome of a fully applied update
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSummary {
    /// Container ID
    pub container_id: ContainerId,
    /// Fields written, in write order
    pub applied: Vec<FieldId>,
    /// Number of controller-file writes
    pub writes: usize,
}

type LockMap = HashMap<ContainerId, Arc<Mutex<()>>>;

/// Reconciliation engine
///
/// # Example
/// ```
/// use std::sync::Arc;
/// use keel_cgroup::{CgroupBackend, MockBackend, Reconciler};
/// use keel_core::{codec, ContainerId};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let backend = Arc::new(MockBackend::new()) as Arc<dyn CgroupBackend>;
/// let reconciler = Reconciler::new(backend);
///
/// let doc = codec::parse_from_options([("pids-limit", "64")]).unwrap();
/// let summary = reconciler
///     .update(&ContainerId::new("c1").unwrap(), &doc)
///     .await
///     .unwrap();
/// assert_eq!(summary.writes, 1);
/// # });
/// ```
pub struct Reconciler {
    backend: Arc<dyn CgroupBackend>,
    locks: Arc<std::sync::Mutex<LockMap>>,
    event_tx: Option<mpsc::Sender<RuntimeEvent>>,
}

impl Reconciler {
    /// Create a reconciler over a backend
    #[must_use]
    pub fn new(backend: Arc<dyn CgroupBackend>) -> Self {
        Self {
            backend,
            locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
            event_tx: None,
        }
    }

    /// Add event channel for emitting events
    #[must_use]
    pub fn with_events(mut self, tx: mpsc::Sender<RuntimeEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Generation of the underlying backend
    #[must_use]
    pub fn version(&self) -> CgroupVersion {
        self.backend.version()
    }

    /// Apply `document` to the cgroup of container `id`.
    ///
    /// Writes run in stage order (block I/O, cpu, cpuset, memory, pids) and
    /// stop at the first failure. Writes that already succeeded stay in
    /// place.
    ///
    /// # Errors
    /// - [`Error::ContainerNotFound`] if the cgroup no longer exists
    /// - [`Error::Validation`] or [`Error::Unsupported`] before any write
    /// - [`Error::PartialUpdate`] naming succeeded, failed and unattempted
    ///   fields when a write fails
    pub async fn update(
        &self,
        id: &ContainerId,
        document: &ResourceDocument,
    ) -> Result<UpdateSummary> {
        let lock = self.container_lock(id);
        let result = {
            let _guard = lock.lock().await;
            self.update_locked(id, document).await
        };
        self.release_lock(id, &lock);
        result
    }

    async fn update_locked(
        &self,
        id: &ContainerId,
        document: &ResourceDocument,
    ) -> Result<UpdateSummary> {
        let target = self.backend.resolve(id).await?;
        let mut plan = self.backend.plan(document, &target).await?;
        plan.sort_by_key(|write| write.stage);

        debug!(container_id = %id, writes = plan.len(), "Planned resource update");

        for (index, write) in plan.iter().enumerate() {
            if let Err(error) = self.backend.apply(write).await {
                let report = PartialUpdate {
                    container_id: id.clone(),
                    succeeded: fields_of(&plan[..index]),
                    failed: write.fields.clone(),
                    error,
                    not_attempted: fields_of(&plan[index + 1..]),
                };

                self.emit(RuntimeEvent::PartialUpdate {
                    id: id.clone(),
                    failed: report.failed.iter().map(ToString::to_string).collect(),
                    not_attempted: report.not_attempted.len(),
                    errno: report.error.errno as i32,
                    timestamp: SystemTime::now(),
                })
                .await;

                return Err(Error::PartialUpdate(report));
            }
        }

        self.emit(RuntimeEvent::ResourcesUpdated {
            id: id.clone(),
            writes: plan.len(),
            timestamp: SystemTime::now(),
        })
        .await;

        info!(container_id = %id, writes = plan.len(), "Resource update applied");

        Ok(UpdateSummary {
            container_id: id.clone(),
            applied: fields_of(&plan),
            writes: plan.len(),
        })
    }

    fn container_lock(&self, id: &ContainerId) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(id.clone()).or_default())
    }

    // Only the map and this caller hold the lock: nobody is waiting on it
    fn release_lock(&self, id: &ContainerId, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        if Arc::strong_count(lock) == 2 {
            locks.remove(id);
        }
    }

    async fn emit(&self, event: RuntimeEvent) {
        event.emit_trace();
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event).await;
        }
    }

    #[cfg(test)]
    fn tracked_containers(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

fn fields_of(writes: &[ControllerWrite]) -> Vec<FieldId> {
    writes.iter().flat_map(|w| w.fields.iter().copied()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MockBackend;
    use keel_core::codec::parse_from_options;
    use nix::errno::Errno;

    fn reconciler() -> (MockBackend, Reconciler) {
        let backend = MockBackend::new();
        let reconciler = Reconciler::new(Arc::new(backend.clone()));
        (backend, reconciler)
    }

    #[tokio::test]
    async fn test_update_applies_in_stage_order() {
        let (backend, reconciler) = reconciler();
        let id = ContainerId::new("c1").unwrap();
        let doc =
            parse_from_options([("pids-limit", "5"), ("blkio-weight", "100"), ("memory", "1")])
                .unwrap();

        let summary = reconciler.update(&id, &doc).await.unwrap();
        assert_eq!(
            summary.applied,
            vec![FieldId::BlockIoWeight, FieldId::MemoryLimit, FieldId::PidsLimit]
        );
        assert_eq!(backend.applied().await.len(), 3);
        assert_eq!(reconciler.tracked_containers(), 0);
    }

    #[tokio::test]
    async fn test_first_failure_stops_update() {
        let (backend, reconciler) = reconciler();
        let id = ContainerId::new("c1").unwrap();
        backend
            .fail_writes_to(MockBackend::path_for(&id, FieldId::MemoryLimit), Errno::EBUSY)
            .await;

        let doc =
            parse_from_options([("cpu-share", "512"), ("memory", "1"), ("pids-limit", "5")])
                .unwrap();
        let err = reconciler.update(&id, &doc).await.unwrap_err();

        let Error::PartialUpdate(report) = err else {
            panic!("expected a partial update, got {err:?}");
        };
        assert_eq!(report.succeeded, vec![FieldId::CpuShare]);
        assert_eq!(report.failed, vec![FieldId::MemoryLimit]);
        assert_eq!(report.not_attempted, vec![FieldId::PidsLimit]);
        assert_eq!(report.error.errno, Errno::EBUSY);
        assert_eq!(backend.applied().await.len(), 1);
    }

    #[tokio::test]
    async fn test_events_emitted() {
        let backend = MockBackend::new();
        let (tx, mut rx) = mpsc::channel(8);
        let reconciler = Reconciler::new(Arc::new(backend.clone())).with_events(tx);
        let id = ContainerId::new("c1").unwrap();

        let doc = parse_from_options([("pids-limit", "5")]).unwrap();
        reconciler.update(&id, &doc).await.unwrap();
        assert!(matches!(
            rx.recv().await,
            Some(RuntimeEvent::ResourcesUpdated { writes: 1, .. })
        ));

        backend
            .fail_writes_to(MockBackend::path_for(&id, FieldId::PidsLimit), Errno::EPERM)
            .await;
        assert!(reconciler.update(&id, &doc).await.is_err());
        match rx.recv().await {
            Some(RuntimeEvent::PartialUpdate { errno, not_attempted, .. }) => {
                assert_eq!(errno, libc::EPERM);
                assert_eq!(not_attempted, 0);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_missing_container_writes_nothing() {
        let (backend, reconciler) = reconciler();
        let id = ContainerId::new("gone").unwrap();
        backend.remove_container(&id).await;

        let doc = parse_from_options([("memory", "1")]).unwrap();
        let err = reconciler.update(&id, &doc).await.unwrap_err();
        assert!(matches!(err, Error::ContainerNotFound { .. }));
        assert!(backend.applied().await.is_empty());
        assert_eq!(reconciler.tracked_containers(), 0);
    }
}
