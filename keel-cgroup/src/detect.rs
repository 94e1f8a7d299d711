//! Backend selection

use keel_core::{CgroupVersion, Error, Result, RuntimeConfig};
use nix::sys::statfs::{statfs, CGROUP2_SUPER_MAGIC, CGROUP_SUPER_MAGIC, TMPFS_MAGIC};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::backend::CgroupBackend;
use crate::v1::CgroupV1;
use crate::v2::CgroupV2;

/// Detect the cgroup generation mounted at `root` from its filesystem type.
///
/// A cgroup2 mount is v2. A tmpfs (holding per-controller mounts) or a
/// cgroup v1 mount is v1. Anything else falls back to looking for
/// `cgroup.controllers`, which only the unified hierarchy has.
///
/// # Errors
/// Returns [`Error::System`] if `root` cannot be inspected and
/// [`Error::InvalidConfig`] if it is not a cgroup mount
pub fn detect_version(root: &Path) -> Result<CgroupVersion> {
    let fs = statfs(root)?;
    let magic = fs.filesystem_type();

    let version = if magic == CGROUP2_SUPER_MAGIC {
        CgroupVersion::V2
    } else if magic == TMPFS_MAGIC || magic == CGROUP_SUPER_MAGIC {
        CgroupVersion::V1
    } else if root.join("cgroup.controllers").exists() {
        CgroupVersion::V2
    } else {
        return Err(Error::InvalidConfig {
            message: format!(
                "{} is not a cgroup mount (filesystem type {magic:?})",
                root.display()
            ),
        });
    };

    debug!(root = %root.display(), version = %version, "Detected cgroup version");
    Ok(version)
}

/// Build the backend described by `config`, probing the filesystem unless
/// the version is pinned.
///
/// # Errors
/// Returns error if the version cannot be detected
pub fn backend_from_config(config: &RuntimeConfig) -> Result<Arc<dyn CgroupBackend>> {
    let version = match config.cgroup_version {
        Some(version) => version,
        None => detect_version(&config.cgroup_root)?,
    };

    info!(
        root = %config.cgroup_root.display(),
        parent = %config.cgroup_parent.display(),
        version = %version,
        "Using cgroup backend"
    );

    let backend: Arc<dyn CgroupBackend> = match version {
        CgroupVersion::V1 => Arc::new(CgroupV1::new(&config.cgroup_root, &config.cgroup_parent)),
        CgroupVersion::V2 => Arc::new(CgroupV2::new(&config.cgroup_root, &config.cgroup_parent)),
    };
    Ok(backend)
}
