//! Cgroup backend trait for pluggable implementations

use async_trait::async_trait;
use keel_core::{
    CgroupVersion, ContainerId, Error, FieldId, ResourceDocument, Result, WriteError,
};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// v1 controller hierarchies the engine writes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Controller {
    /// Block I/O
    Blkio,
    /// CFS and realtime CPU scheduling
    Cpu,
    /// CPU and memory-node placement
    Cpuset,
    /// Memory
    Memory,
    /// Process count
    Pids,
}

impl Controller {
    /// All controllers, in write order
    pub const ALL: [Self; 5] = [Self::Blkio, Self::Cpu, Self::Cpuset, Self::Memory, Self::Pids];

    /// Controller name as mounted under the cgroup root
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Blkio => "blkio",
            Self::Cpu => "cpu",
            Self::Cpuset => "cpuset",
            Self::Memory => "memory",
            Self::Pids => "pids",
        }
    }
}

impl fmt::Display for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Ordering class of a write. Plans are applied stage by stage, in
/// declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum WriteStage {
    /// `blockIO` fields
    BlockIo,
    /// cpu bandwidth, shares and realtime fields
    Cpu,
    /// cpuset lists
    Cpuset,
    /// memory fields
    Memory,
    /// pids fields
    Pids,
}

impl WriteStage {
    /// Stage a document field belongs to
    #[must_use]
    pub const fn for_field(field: FieldId) -> Self {
        match field {
            FieldId::BlockIoWeight => Self::BlockIo,
            FieldId::CpuPeriod
            | FieldId::CpuQuota
            | FieldId::CpuShare
            | FieldId::CpuRealtimePeriod
            | FieldId::CpuRealtimeRuntime => Self::Cpu,
            FieldId::CpusetCpus | FieldId::CpusetMems => Self::Cpuset,
            FieldId::MemoryKernel
            | FieldId::MemoryKernelTcp
            | FieldId::MemoryLimit
            | FieldId::MemoryReservation
            | FieldId::MemorySwap => Self::Memory,
            FieldId::PidsLimit => Self::Pids,
        }
    }
}

/// Location of a container's existing cgroup
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CgroupTarget {
    /// v2: one directory in the unified hierarchy
    Unified(PathBuf),
    /// v1: one directory per controller hierarchy
    PerController(BTreeMap<Controller, PathBuf>),
}

impl CgroupTarget {
    /// Directory holding a controller's files
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] if a v1 target lacks the controller
    pub fn dir(&self, controller: Controller) -> Result<&Path> {
        match self {
            Self::Unified(path) => Ok(path),
            Self::PerController(paths) => {
                paths
                    .get(&controller)
                    .map(PathBuf::as_path)
                    .ok_or_else(|| Error::InvalidConfig {
                        message: format!("cgroup target has no {controller} hierarchy"),
                    })
            }
        }
    }
}

/// One controller-file write derived from document fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerWrite {
    /// Ordering class
    pub stage: WriteStage,
    /// Document fields carried by this write (more than one for combined
    /// v2 interfaces such as `cpu.max`)
    pub fields: Vec<FieldId>,
    /// Controller file
    pub path: PathBuf,
    /// Value written
    pub value: String,
}

impl ControllerWrite {
    /// Write carrying a single field
    #[must_use]
    pub fn single(field: FieldId, path: PathBuf, value: impl Into<String>) -> Self {
        Self {
            stage: WriteStage::for_field(field),
            fields: vec![field],
            path,
            value: value.into(),
        }
    }
}

/// Trait for cgroup backends
///
/// This allows for different implementations:
/// - [`CgroupV1`](crate::CgroupV1) - one hierarchy per controller
/// - [`CgroupV2`](crate::CgroupV2) - unified hierarchy
/// - [`MockBackend`] - Testing without filesystem
///
/// # Thread Safety
/// All implementations must be `Send + Sync` for use across async tasks.
#[async_trait]
pub trait CgroupBackend: Send + Sync {
    /// API generation this backend speaks
    fn version(&self) -> CgroupVersion;

    /// Locate a container's existing cgroup
    ///
    /// # Errors
    /// Returns [`Error::ContainerNotFound`] if the cgroup no longer exists
    async fn resolve(&self, id: &ContainerId) -> Result<CgroupTarget>;

    /// Translate a document into ordered controller writes. Nothing is
    /// written; current values may be read.
    ///
    /// # Errors
    /// Returns [`Error::Validation`] or [`Error::Unsupported`] for fields
    /// this backend cannot express
    async fn plan(
        &self,
        document: &ResourceDocument,
        target: &CgroupTarget,
    ) -> Result<Vec<ControllerWrite>>;

    /// Perform one controller write
    async fn apply(&self, write: &ControllerWrite) -> std::result::Result<(), WriteError>;
}

/// Write a value to an existing controller file.
///
/// The file is never created: cgroupfs files always exist, so a missing file
/// means a missing controller or cgroup.
pub(crate) async fn write_controller_file(
    write: &ControllerWrite,
) -> std::result::Result<(), WriteError> {
    let failed =
        |e: &std::io::Error| WriteError::from_io(write.path.clone(), write.value.clone(), e);

    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(&write.path)
        .await
        .map_err(|e| failed(&e))?;

    file.write_all(write.value.as_bytes())
        .await
        .map_err(|e| failed(&e))?;
    file.flush().await.map_err(|e| failed(&e))?;

    tracing::debug!(
        path = %write.path.display(),
        value = %write.value,
        "Wrote controller file"
    );
    Ok(())
}

/// Read a controller file, trimmed
pub(crate) async fn read_controller_file(path: &Path) -> Result<String> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(content.trim().to_string())
}

/// Mock backend for testing (doesn't touch filesystem)
///
/// Plans one write per set field under `/mock/<container>/<field>` and
/// records every applied write. Failures can be injected per path.
///
/// # Example
/// ```
/// use keel_cgroup::{CgroupBackend, MockBackend};
/// use keel_core::{ContainerId, FieldId, FieldValue, ResourceDocument};
///
/// # tokio::runtime::Runtime::new().unwrap().block_on(async {
/// let backend = MockBackend::new();
/// let id = ContainerId::new("c1").unwrap();
/// let doc = ResourceDocument::new()
///     .with(FieldId::PidsLimit, FieldValue::Number(10))
///     .unwrap();
///
/// let target = backend.resolve(&id).await.unwrap();
/// let plan = backend.plan(&doc, &target).await.unwrap();
/// assert_eq!(plan.len(), 1);
/// # });
/// ```
#[derive(Clone)]
pub struct MockBackend {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    missing: Vec<ContainerId>,
    failures: BTreeMap<PathBuf, nix::errno::Errno>,
    applied: Vec<ControllerWrite>,
    call_count: usize,
}

impl MockBackend {
    /// Create a new mock backend
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Path the mock plans for a field
    #[must_use]
    pub fn path_for(id: &ContainerId, field: FieldId) -> PathBuf {
        PathBuf::from("/mock").join(id.as_str()).join(field.to_string())
    }

    /// Make `resolve` report the container as gone
    pub async fn remove_container(&self, id: &ContainerId) {
        self.state.lock().await.missing.push(id.clone());
    }

    /// Make writes to `path` fail with `errno`
    pub async fn fail_writes_to(&self, path: PathBuf, errno: nix::errno::Errno) {
        self.state.lock().await.failures.insert(path, errno);
    }

    /// Writes applied so far, in order
    pub async fn applied(&self) -> Vec<ControllerWrite> {
        self.state.lock().await.applied.clone()
    }

    /// Get the number of backend calls made (for testing)
    pub async fn call_count(&self) -> usize {
        self.state.lock().await.call_count
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBackend").finish_non_exhaustive()
    }
}

#[async_trait]
impl CgroupBackend for MockBackend {
    fn version(&self) -> CgroupVersion {
        CgroupVersion::V1
    }

    async fn resolve(&self, id: &ContainerId) -> Result<CgroupTarget> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        let root = PathBuf::from("/mock").join(id.as_str());
        if state.missing.contains(id) {
            return Err(Error::ContainerNotFound {
                id: id.clone(),
                path: root,
            });
        }
        Ok(CgroupTarget::Unified(root))
    }

    async fn plan(
        &self,
        document: &ResourceDocument,
        target: &CgroupTarget,
    ) -> Result<Vec<ControllerWrite>> {
        self.state.lock().await.call_count += 1;

        let CgroupTarget::Unified(root) = target else {
            return Err(Error::InvalidConfig {
                message: "mock backend expects a unified target".to_string(),
            });
        };

        Ok(document
            .fields()
            .map(|(field, value)| {
                ControllerWrite::single(field, root.join(field.to_string()), value.to_string())
            })
            .collect())
    }

    async fn apply(&self, write: &ControllerWrite) -> std::result::Result<(), WriteError> {
        let mut state = self.state.lock().await;
        state.call_count += 1;

        if let Some(errno) = state.failures.get(&write.path) {
            tracing::debug!(path = %write.path.display(), %errno, "Mock: Injected write failure");
            return Err(WriteError {
                path: write.path.clone(),
                value: write.value.clone(),
                errno: *errno,
            });
        }

        tracing::debug!(path = %write.path.display(), value = %write.value, "Mock: Applied write");
        state.applied.push(write.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::FieldValue;

    #[test]
    fn stages_follow_kernel_dependency_order() {
        assert!(WriteStage::BlockIo < WriteStage::Cpu);
        assert!(WriteStage::Cpu < WriteStage::Cpuset);
        assert!(WriteStage::Cpuset < WriteStage::Memory);
        assert!(WriteStage::Memory < WriteStage::Pids);
        assert_eq!(WriteStage::for_field(FieldId::CpusetMems), WriteStage::Cpuset);
        assert_eq!(WriteStage::for_field(FieldId::CpuShare), WriteStage::Cpu);
    }

    #[test]
    fn target_dir_lookup() {
        let unified = CgroupTarget::Unified(PathBuf::from("/sys/fs/cgroup/keel/c1"));
        assert_eq!(
            unified.dir(Controller::Memory).unwrap(),
            Path::new("/sys/fs/cgroup/keel/c1")
        );

        let mut paths = BTreeMap::new();
        paths.insert(Controller::Cpu, PathBuf::from("/sys/fs/cgroup/cpu/keel/c1"));
        let split = CgroupTarget::PerController(paths);
        assert!(split.dir(Controller::Cpu).is_ok());
        assert!(split.dir(Controller::Pids).is_err());
    }

    #[tokio::test]
    async fn test_mock_backend_records_and_fails() {
        let backend = MockBackend::new();
        let id = ContainerId::new("c1").unwrap();
        let doc = ResourceDocument::new()
            .with(FieldId::MemoryLimit, FieldValue::Number(1))
            .unwrap()
            .with(FieldId::PidsLimit, FieldValue::Number(2))
            .unwrap();

        backend
            .fail_writes_to(
                MockBackend::path_for(&id, FieldId::PidsLimit),
                nix::errno::Errno::EBUSY,
            )
            .await;

        let target = backend.resolve(&id).await.unwrap();
        let plan = backend.plan(&doc, &target).await.unwrap();
        assert_eq!(plan.len(), 2);

        assert!(backend.apply(&plan[0]).await.is_ok());
        let err = backend.apply(&plan[1]).await.unwrap_err();
        assert_eq!(err.errno, nix::errno::Errno::EBUSY);
        assert_eq!(backend.applied().await.len(), 1);
        assert_eq!(backend.call_count().await, 4);
    }

    #[tokio::test]
    async fn test_write_never_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        let write = ControllerWrite::single(
            FieldId::PidsLimit,
            dir.path().join("pids.max"),
            "10",
        );

        let err = write_controller_file(&write).await.unwrap_err();
        assert_eq!(err.errno, nix::errno::Errno::ENOENT);
        assert!(!dir.path().join("pids.max").exists());

        std::fs::write(dir.path().join("pids.max"), "max\n").unwrap();
        write_controller_file(&write).await.unwrap();
        assert_eq!(std::fs::read_to_string(dir.path().join("pids.max")).unwrap(), "10");
    }
}
