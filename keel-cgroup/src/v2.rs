//! cgroup v2 backend
//!
//! The unified hierarchy has different interface files and value scales than
//! v1, so several document fields are translated rather than copied:
//!
//! | field                | file               | value                              |
//! |----------------------|--------------------|------------------------------------|
//! | `cpu.quota`/`period` | `cpu.max`          | `"<quota> <period>"`               |
//! | `cpu.share`          | `cpu.weight`       | `1 + (share - 2) * 9999 / 262142`  |
//! | `blockIO.weight`     | `io.bfq.weight`    | raw, when BFQ is active            |
//! | `blockIO.weight`     | `io.weight`        | `"default <1 + (w - 10) * 9999 / 990>"` |
//! | `memory.limit`       | `memory.max`       | raw                                |
//! | `memory.swap`        | `memory.swap.max`  | `swap - limit`                     |
//! | `memory.reservation` | `memory.low`       | raw                                |
//!
//! Realtime scheduling and kernel memory have no v2 interface and are
//! rejected while planning.

use async_trait::async_trait;
use keel_core::{
    CgroupVersion, ContainerId, Error, FieldId, ResourceDocument, Result, WriteError,
};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::backend::{
    read_controller_file, write_controller_file, CgroupBackend, CgroupTarget, Controller,
    ControllerWrite, WriteStage,
};

const BACKEND: &str = "v2";

/// Accepted range of `cpu.share` when converting to `cpu.weight`
pub const CPU_SHARES_RANGE: std::ops::RangeInclusive<u64> = 2..=262_144;

/// Accepted range of `blockIO.weight` when converting to `io.weight`
pub const BLKIO_WEIGHT_RANGE: std::ops::RangeInclusive<u64> = 10..=1000;

/// Convert v1 CPU shares to a v2 CPU weight
///
/// # Errors
/// Returns [`Error::Validation`] outside [`CPU_SHARES_RANGE`]
pub fn shares_to_weight(shares: u64) -> Result<u64> {
    if !CPU_SHARES_RANGE.contains(&shares) {
        return Err(Error::validation(
            FieldId::CpuShare.to_string(),
            format!("{shares} is outside {CPU_SHARES_RANGE:?}"),
        ));
    }
    Ok(1 + (shares - 2) * 9999 / 262_142)
}

/// Convert a v1 blkio weight to a v2 io weight
///
/// # Errors
/// Returns [`Error::Validation`] outside [`BLKIO_WEIGHT_RANGE`]
pub fn blkio_to_io_weight(weight: u64) -> Result<u64> {
    if !BLKIO_WEIGHT_RANGE.contains(&weight) {
        return Err(Error::validation(
            FieldId::BlockIoWeight.to_string(),
            format!("{weight} is outside {BLKIO_WEIGHT_RANGE:?}"),
        ));
    }
    Ok(1 + (weight - 10) * 9999 / 990)
}

/// cgroup v2 backend
#[derive(Debug, Clone)]
pub struct CgroupV2 {
    root: PathBuf,
    parent: PathBuf,
}

impl CgroupV2 {
    /// Create a backend for the unified hierarchy at `root`, with container
    /// cgroups living at `<root>/<parent>/<id>`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>, parent: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            parent: parent.into(),
        }
    }

    fn container_dir(&self, id: &ContainerId) -> PathBuf {
        self.root.join(&self.parent).join(id.as_str())
    }

    async fn plan_block_io(
        &self,
        dir: &Path,
        weight: u64,
        plan: &mut Vec<ControllerWrite>,
    ) -> Result<()> {
        let bfq = dir.join("io.bfq.weight");
        if tokio::fs::try_exists(&bfq).await? {
            plan.push(ControllerWrite::single(FieldId::BlockIoWeight, bfq, weight.to_string()));
        } else {
            let weight = blkio_to_io_weight(weight)?;
            plan.push(ControllerWrite::single(
                FieldId::BlockIoWeight,
                dir.join("io.weight"),
                format!("default {weight}"),
            ));
        }
        Ok(())
    }

    /// `cpu.max` holds quota and period together; whichever half the
    /// document leaves unset is carried over from the current file.
    async fn plan_cpu_max(
        &self,
        dir: &Path,
        document: &ResourceDocument,
        plan: &mut Vec<ControllerWrite>,
    ) -> Result<()> {
        let quota = document.number(FieldId::CpuQuota);
        let period = document.number(FieldId::CpuPeriod);
        if quota.is_none() && period.is_none() {
            return Ok(());
        }

        let path = dir.join("cpu.max");
        let (quota, period) = match (quota, period) {
            (Some(quota), Some(period)) => (quota.to_string(), period.to_string()),
            (quota, period) => {
                let current = read_controller_file(&path).await?;
                let mut parts = current.split_whitespace();
                let (Some(cur_quota), Some(cur_period)) = (parts.next(), parts.next()) else {
                    return Err(Error::validation(
                        "cpu.max",
                        format!("unexpected content {current:?}"),
                    ));
                };
                debug!(path = %path.display(), current = %current, "Merging with current cpu.max");
                (
                    quota.map_or_else(|| cur_quota.to_string(), |q| q.to_string()),
                    period.map_or_else(|| cur_period.to_string(), |p| p.to_string()),
                )
            }
        };

        let fields = [FieldId::CpuPeriod, FieldId::CpuQuota]
            .into_iter()
            .filter(|f| document.contains(*f))
            .collect();

        plan.push(ControllerWrite {
            stage: WriteStage::Cpu,
            fields,
            path,
            value: format!("{quota} {period}"),
        });
        Ok(())
    }

    /// v2 swap excludes memory, so the write is `swap - limit`, with the
    /// limit taken from the document or the current `memory.max`.
    async fn swap_max(&self, dir: &Path, document: &ResourceDocument, swap: u64) -> Result<u64> {
        let limit = match document.number(FieldId::MemoryLimit) {
            Some(limit) => limit,
            None => {
                let current = read_controller_file(&dir.join("memory.max")).await?;
                if current == "max" {
                    return Err(Error::validation(
                        FieldId::MemorySwap.to_string(),
                        "cannot set swap while memory.max is unlimited",
                    ));
                }
                current.parse().map_err(|e| {
                    Error::validation("memory.max", format!("unexpected content {current:?}: {e}"))
                })?
            }
        };

        swap.checked_sub(limit).ok_or_else(|| {
            Error::validation(
                FieldId::MemorySwap.to_string(),
                format!("swap {swap} is lower than the memory limit {limit}"),
            )
        })
    }
}

#[async_trait]
impl CgroupBackend for CgroupV2 {
    fn version(&self) -> CgroupVersion {
        CgroupVersion::V2
    }

    async fn resolve(&self, id: &ContainerId) -> Result<CgroupTarget> {
        let dir = self.container_dir(id);
        if !tokio::fs::metadata(&dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(Error::ContainerNotFound {
                id: id.clone(),
                path: dir,
            });
        }
        Ok(CgroupTarget::Unified(dir))
    }

    async fn plan(
        &self,
        document: &ResourceDocument,
        target: &CgroupTarget,
    ) -> Result<Vec<ControllerWrite>> {
        for field in [
            FieldId::CpuRealtimePeriod,
            FieldId::CpuRealtimeRuntime,
            FieldId::MemoryKernel,
            FieldId::MemoryKernelTcp,
        ] {
            if document.contains(field) {
                return Err(Error::Unsupported {
                    field,
                    backend: BACKEND,
                });
            }
        }

        let dir = target.dir(Controller::Memory)?;
        let mut plan = Vec::new();

        if let Some(weight) = document.number(FieldId::BlockIoWeight) {
            self.plan_block_io(dir, weight, &mut plan).await?;
        }

        self.plan_cpu_max(dir, document, &mut plan).await?;

        if let Some(shares) = document.number(FieldId::CpuShare) {
            plan.push(ControllerWrite::single(
                FieldId::CpuShare,
                dir.join("cpu.weight"),
                shares_to_weight(shares)?.to_string(),
            ));
        }

        for (field, file) in [
            (FieldId::CpusetCpus, "cpuset.cpus"),
            (FieldId::CpusetMems, "cpuset.mems"),
        ] {
            if let Some(list) = document.get(field) {
                plan.push(ControllerWrite::single(field, dir.join(file), list.to_string()));
            }
        }

        if let Some(limit) = document.number(FieldId::MemoryLimit) {
            plan.push(ControllerWrite::single(
                FieldId::MemoryLimit,
                dir.join("memory.max"),
                limit.to_string(),
            ));
        }
        if let Some(swap) = document.number(FieldId::MemorySwap) {
            let swap_max = self.swap_max(dir, document, swap).await?;
            plan.push(ControllerWrite::single(
                FieldId::MemorySwap,
                dir.join("memory.swap.max"),
                swap_max.to_string(),
            ));
        }
        if let Some(reservation) = document.number(FieldId::MemoryReservation) {
            plan.push(ControllerWrite::single(
                FieldId::MemoryReservation,
                dir.join("memory.low"),
                reservation.to_string(),
            ));
        }

        if let Some(pids) = document.number(FieldId::PidsLimit) {
            plan.push(ControllerWrite::single(
                FieldId::PidsLimit,
                dir.join("pids.max"),
                pids.to_string(),
            ));
        }

        Ok(plan)
    }

    async fn apply(&self, write: &ControllerWrite) -> std::result::Result<(), WriteError> {
        write_controller_file(write).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::codec::parse_from_options;

    const FILES: [(&str, &str); 9] = [
        ("cpu.max", "max 100000"),
        ("cpu.weight", "100"),
        ("cpuset.cpus", ""),
        ("cpuset.mems", ""),
        ("io.weight", "default 100"),
        ("memory.max", "max"),
        ("memory.swap.max", "max"),
        ("memory.low", "0"),
        ("pids.max", "max"),
    ];

    fn v2_tree(id: &str) -> (tempfile::TempDir, CgroupV2, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("keel").join(id);
        std::fs::create_dir_all(&dir).unwrap();
        for (file, content) in FILES {
            std::fs::write(dir.join(file), format!("{content}\n")).unwrap();
        }
        let backend = CgroupV2::new(tmp.path(), "keel");
        (tmp, backend, dir)
    }

    async fn plan_for(
        backend: &CgroupV2,
        options: &[(&str, &str)],
    ) -> Result<Vec<ControllerWrite>> {
        let doc = parse_from_options(options.iter().copied())?;
        let target = backend.resolve(&ContainerId::new("c1").unwrap()).await?;
        backend.plan(&doc, &target).await
    }

    #[test]
    fn weight_conversions() {
        assert_eq!(shares_to_weight(2).unwrap(), 1);
        assert_eq!(shares_to_weight(1024).unwrap(), 39);
        assert_eq!(shares_to_weight(262_144).unwrap(), 10_000);
        assert!(shares_to_weight(1).is_err());
        assert!(shares_to_weight(262_145).is_err());

        assert_eq!(blkio_to_io_weight(10).unwrap(), 1);
        assert_eq!(blkio_to_io_weight(500).unwrap(), 4950);
        assert_eq!(blkio_to_io_weight(1000).unwrap(), 10_000);
        assert!(blkio_to_io_weight(9).is_err());
    }

    #[tokio::test]
    async fn test_quota_only_keeps_current_period() {
        let (_tmp, backend, dir) = v2_tree("c1");
        std::fs::write(dir.join("cpu.max"), "max 250000\n").unwrap();

        let plan = plan_for(&backend, &[("cpu-quota", "50000")]).await.unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].path, dir.join("cpu.max"));
        assert_eq!(plan[0].value, "50000 250000");
        assert_eq!(plan[0].fields, vec![FieldId::CpuQuota]);
    }

    #[tokio::test]
    async fn test_period_only_keeps_unlimited_quota() {
        let (_tmp, backend, _dir) = v2_tree("c1");
        let plan = plan_for(&backend, &[("cpu-period", "50000")]).await.unwrap();
        assert_eq!(plan[0].value, "max 50000");
    }

    #[tokio::test]
    async fn test_quota_and_period_are_one_write() {
        let (_tmp, backend, _dir) = v2_tree("c1");
        let plan = plan_for(&backend, &[("cpu-quota", "50000"), ("cpu-period", "100000")])
            .await
            .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].value, "50000 100000");
        assert_eq!(plan[0].fields, vec![FieldId::CpuPeriod, FieldId::CpuQuota]);
    }

    #[tokio::test]
    async fn test_swap_is_written_relative_to_limit() {
        let (_tmp, backend, dir) = v2_tree("c1");
        let plan = plan_for(&backend, &[("memory", "1000000"), ("memory-swap", "3000000")])
            .await
            .unwrap();

        let files: Vec<_> = plan.iter().map(|w| w.path.clone()).collect();
        assert_eq!(files, vec![dir.join("memory.max"), dir.join("memory.swap.max")]);
        assert_eq!(plan[1].value, "2000000");
    }

    #[tokio::test]
    async fn test_swap_uses_current_limit() {
        let (_tmp, backend, dir) = v2_tree("c1");
        std::fs::write(dir.join("memory.max"), "1000\n").unwrap();
        let plan = plan_for(&backend, &[("memory-swap", "1500")]).await.unwrap();
        assert_eq!(plan[0].value, "500");
    }

    #[tokio::test]
    async fn test_swap_rejected_without_limit_or_below_limit() {
        let (_tmp, backend, _dir) = v2_tree("c1");
        let err = plan_for(&backend, &[("memory-swap", "1500")]).await.unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let err = plan_for(&backend, &[("memory", "2000"), ("memory-swap", "1500")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[tokio::test]
    async fn test_unsupported_fields_rejected() {
        let (_tmp, backend, _dir) = v2_tree("c1");
        for option in ["cpu-rt-period", "cpu-rt-runtime", "kernel-memory", "kernel-memory-tcp"] {
            let err = plan_for(&backend, &[(option, "1")]).await.unwrap_err();
            assert!(matches!(err, Error::Unsupported { .. }), "{option}");
            assert!(err.is_pre_kernel());
        }
    }

    #[tokio::test]
    async fn test_blkio_weight_prefers_bfq() {
        let (_tmp, backend, dir) = v2_tree("c1");
        let plan = plan_for(&backend, &[("blkio-weight", "500")]).await.unwrap();
        assert_eq!(plan[0].path, dir.join("io.weight"));
        assert_eq!(plan[0].value, "default 4950");

        std::fs::write(dir.join("io.bfq.weight"), "100\n").unwrap();
        let plan = plan_for(&backend, &[("blkio-weight", "500")]).await.unwrap();
        assert_eq!(plan[0].path, dir.join("io.bfq.weight"));
        assert_eq!(plan[0].value, "500");
    }

    #[tokio::test]
    async fn test_plan_follows_stage_order_and_applies() {
        let (_tmp, backend, dir) = v2_tree("c1");
        let plan = plan_for(
            &backend,
            &[
                ("pids-limit", "64"),
                ("memory-reservation", "1024"),
                ("cpuset-cpus", "0-1"),
                ("cpu-share", "1024"),
                ("blkio-weight", "10"),
            ],
        )
        .await
        .unwrap();

        assert!(plan.windows(2).all(|w| w[0].stage <= w[1].stage));
        for write in &plan {
            backend.apply(write).await.unwrap();
        }
        assert_eq!(std::fs::read_to_string(dir.join("cpu.weight")).unwrap(), "39");
        assert_eq!(std::fs::read_to_string(dir.join("memory.low")).unwrap(), "1024");
        assert_eq!(std::fs::read_to_string(dir.join("pids.max")).unwrap(), "64");
    }

    #[tokio::test]
    async fn test_resolve_requires_directory() {
        let (_tmp, backend, _dir) = v2_tree("c1");
        let err = backend
            .resolve(&ContainerId::new("c2").unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ContainerNotFound { .. }));
    }
}
