//! cgroup v1 backend
//!
//! One hierarchy per controller, mounted as `<root>/<controller>`. Every
//! document field maps to exactly one controller file and is written on its
//! own.

use async_trait::async_trait;
use keel_core::{
    CgroupVersion, ContainerId, Error, FieldId, ResourceDocument, Result, WriteError,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::backend::{
    write_controller_file, CgroupBackend, CgroupTarget, Controller, ControllerWrite,
};

/// Write order inside the v1 plan. Period goes before quota and limit
/// before swap and reservation so intermediate states stay acceptable to
/// the kernel.
const WRITE_ORDER: [FieldId; 14] = [
    FieldId::BlockIoWeight,
    FieldId::CpuPeriod,
    FieldId::CpuQuota,
    FieldId::CpuShare,
    FieldId::CpuRealtimePeriod,
    FieldId::CpuRealtimeRuntime,
    FieldId::CpusetCpus,
    FieldId::CpusetMems,
    FieldId::MemoryLimit,
    FieldId::MemorySwap,
    FieldId::MemoryReservation,
    FieldId::MemoryKernel,
    FieldId::MemoryKernelTcp,
    FieldId::PidsLimit,
];

/// Controller and file a v1 field is written to
#[must_use]
pub const fn controller_file(field: FieldId) -> (Controller, &'static str) {
    match field {
        FieldId::BlockIoWeight => (Controller::Blkio, "blkio.weight"),
        FieldId::CpuPeriod => (Controller::Cpu, "cpu.cfs_period_us"),
        FieldId::CpuQuota => (Controller::Cpu, "cpu.cfs_quota_us"),
        FieldId::CpuShare => (Controller::Cpu, "cpu.shares"),
        FieldId::CpuRealtimePeriod => (Controller::Cpu, "cpu.rt_period_us"),
        FieldId::CpuRealtimeRuntime => (Controller::Cpu, "cpu.rt_runtime_us"),
        FieldId::CpusetCpus => (Controller::Cpuset, "cpuset.cpus"),
        FieldId::CpusetMems => (Controller::Cpuset, "cpuset.mems"),
        FieldId::MemoryKernel => (Controller::Memory, "memory.kmem.limit_in_bytes"),
        FieldId::MemoryKernelTcp => (Controller::Memory, "memory.kmem.tcp.limit_in_bytes"),
        FieldId::MemoryLimit => (Controller::Memory, "memory.limit_in_bytes"),
        FieldId::MemoryReservation => (Controller::Memory, "memory.soft_limit_in_bytes"),
        FieldId::MemorySwap => (Controller::Memory, "memory.memsw.limit_in_bytes"),
        FieldId::PidsLimit => (Controller::Pids, "pids.max"),
    }
}

/// cgroup v1 backend
#[derive(Debug, Clone)]
pub struct CgroupV1 {
    root: PathBuf,
    parent: PathBuf,
}

impl CgroupV1 {
    /// Create a backend for hierarchies mounted under `root`, with container
    /// cgroups living at `<root>/<controller>/<parent>/<id>`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, parent: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            parent: parent.into(),
        }
    }

    /// Mount point of a controller. `cpu` is commonly co-mounted with
    /// `cpuacct`; the combined mount is used when no plain `cpu` link exists.
    fn mount_point(&self, controller: Controller) -> PathBuf {
        let plain = self.root.join(controller.name());
        if controller == Controller::Cpu && !plain.exists() {
            let combined = self.root.join("cpu,cpuacct");
            if combined.exists() {
                return combined;
            }
        }
        plain
    }

    fn container_dir(&self, mount: &Path, id: &ContainerId) -> PathBuf {
        mount.join(&self.parent).join(id.as_str())
    }
}

#[async_trait]
impl CgroupBackend for CgroupV1 {
    fn version(&self) -> CgroupVersion {
        CgroupVersion::V1
    }

    async fn resolve(&self, id: &ContainerId) -> Result<CgroupTarget> {
        let mut paths = BTreeMap::new();
        let mut found = false;

        for controller in Controller::ALL {
            let dir = self.container_dir(&self.mount_point(controller), id);
            if tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
                found = true;
            } else {
                debug!(
                    controller = %controller,
                    path = %dir.display(),
                    "Controller cgroup missing"
                );
            }
            paths.insert(controller, dir);
        }

        if !found {
            return Err(Error::ContainerNotFound {
                id: id.clone(),
                path: self.container_dir(&self.mount_point(Controller::Memory), id),
            });
        }

        Ok(CgroupTarget::PerController(paths))
    }

    async fn plan(
        &self,
        document: &ResourceDocument,
        target: &CgroupTarget,
    ) -> Result<Vec<ControllerWrite>> {
        let mut plan = Vec::new();

        for field in WRITE_ORDER {
            let Some(value) = document.get(field) else {
                continue;
            };
            let (controller, file) = controller_file(field);
            let dir = target.dir(controller)?;
            plan.push(ControllerWrite::single(field, dir.join(file), value.to_string()));
        }

        Ok(plan)
    }

    async fn apply(&self, write: &ControllerWrite) -> std::result::Result<(), WriteError> {
        write_controller_file(write).await
    }
}
