//! Runtime configuration
//!
//! Defaults, then an optional JSON file, then `KEEL_*` environment variables,
//! then whatever the caller sets through the `with_*` builders.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::{Error, Result};

/// Largest errno the kernel accepts in a syscall return
pub const MAX_ERRNO: i32 = 4095;

/// cgroup API generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupVersion {
    /// One hierarchy per controller
    V1,
    /// Single unified hierarchy
    V2,
}

impl CgroupVersion {
    /// Short name (`v1` / `v2`)
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::V1 => "v1",
            Self::V2 => "v2",
        }
    }
}

impl fmt::Display for CgroupVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CgroupVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "v1" | "1" => Ok(Self::V1),
            "v2" | "2" => Ok(Self::V2),
            other => Err(Error::InvalidConfig {
                message: format!("unknown cgroup version {other:?}"),
            }),
        }
    }
}

/// Control-plane configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Mount point of the cgroup filesystem(s)
    pub cgroup_root: PathBuf,

    /// Directory under the root (or under each v1 controller) holding
    /// container cgroups
    pub cgroup_parent: PathBuf,

    /// Pin the backend instead of probing the filesystem type
    pub cgroup_version: Option<CgroupVersion>,

    /// Maximum notifications awaiting a verdict per session
    pub max_in_flight: usize,

    /// errno returned for notifications nobody answered
    pub default_deny_errno: i32,

    /// Policy agent socket
    pub agent_socket: Option<PathBuf>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            cgroup_parent: PathBuf::from("keel"),
            cgroup_version: None,
            max_in_flight: 256,
            default_deny_errno: libc::EPERM,
            agent_socket: None,
        }
    }
}

impl RuntimeConfig {
    /// Create a configuration with defaults
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a JSON file; missing keys keep their defaults
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let config: Self = serde_json::from_slice(&bytes).map_err(|e| Error::InvalidConfig {
            message: format!("{}: {e}", path.display()),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `KEEL_*` overrides from the process environment
    ///
    /// # Errors
    /// Returns error if an override cannot be parsed
    pub fn from_env(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply `KEEL_*` overrides from an arbitrary lookup
    ///
    /// # Errors
    /// Returns error if an override cannot be parsed
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(root) = lookup("KEEL_CGROUP_ROOT") {
            self.cgroup_root = PathBuf::from(root);
        }
        if let Some(parent) = lookup("KEEL_CGROUP_PARENT") {
            self.cgroup_parent = PathBuf::from(parent);
        }
        if let Some(version) = lookup("KEEL_CGROUP_VERSION") {
            self.cgroup_version = Some(version.parse()?);
        }
        if let Some(max) = lookup("KEEL_MAX_IN_FLIGHT") {
            self.max_in_flight = max.parse().map_err(|e| Error::InvalidConfig {
                message: format!("KEEL_MAX_IN_FLIGHT={max:?}: {e}"),
            })?;
        }
        if let Some(errno) = lookup("KEEL_DEFAULT_DENY_ERRNO") {
            self.default_deny_errno = errno.parse().map_err(|e| Error::InvalidConfig {
                message: format!("KEEL_DEFAULT_DENY_ERRNO={errno:?}: {e}"),
            })?;
        }
        if let Some(socket) = lookup("KEEL_AGENT_SOCKET") {
            self.agent_socket = Some(PathBuf::from(socket));
        }
        self.validate()?;
        Ok(self)
    }

    /// Set the cgroup root
    #[must_use]
    pub fn with_cgroup_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.cgroup_root = root.into();
        self
    }

    /// Set the cgroup parent
    #[must_use]
    pub fn with_cgroup_parent(mut self, parent: impl Into<PathBuf>) -> Self {
        self.cgroup_parent = parent.into();
        self
    }

    /// Pin the cgroup version
    #[must_use]
    pub const fn with_cgroup_version(mut self, version: CgroupVersion) -> Self {
        self.cgroup_version = Some(version);
        self
    }

    /// Set the per-session in-flight bound
    #[must_use]
    pub const fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    /// Returns [`Error::InvalidConfig`] describing the first violation
    pub fn validate(&self) -> Result<()> {
        if self.max_in_flight == 0 {
            return Err(Error::InvalidConfig {
                message: "max_in_flight must be at least 1".to_string(),
            });
        }
        if !(1..=MAX_ERRNO).contains(&self.default_deny_errno) {
            return Err(Error::InvalidConfig {
                message: format!(
                    "default_deny_errno {} must be in 1..={MAX_ERRNO}",
                    self.default_deny_errno
                ),
            });
        }
        if self.cgroup_parent.is_absolute()
            || self
                .cgroup_parent
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(Error::InvalidConfig {
                message: format!(
                    "cgroup_parent {} must be relative and stay below the root",
                    self.cgroup_parent.display()
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_valid() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cgroup_root, PathBuf::from("/sys/fs/cgroup"));
        assert_eq!(config.default_deny_errno, libc::EPERM);
    }

    #[test]
    fn overrides_apply() {
        let env: HashMap<&str, &str> = [
            ("KEEL_CGROUP_ROOT", "/tmp/cg"),
            ("KEEL_CGROUP_VERSION", "v1"),
            ("KEEL_MAX_IN_FLIGHT", "8"),
            ("KEEL_DEFAULT_DENY_ERRNO", "13"),
        ]
        .into_iter()
        .collect();

        let config = RuntimeConfig::new()
            .with_overrides(|k| env.get(k).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.cgroup_root, PathBuf::from("/tmp/cg"));
        assert_eq!(config.cgroup_version, Some(CgroupVersion::V1));
        assert_eq!(config.max_in_flight, 8);
        assert_eq!(config.default_deny_errno, libc::EACCES);
    }

    #[test]
    fn bad_overrides_rejected() {
        assert!(RuntimeConfig::new()
            .with_overrides(|k| (k == "KEEL_CGROUP_VERSION").then(|| "v3".to_string()))
            .is_err());
        assert!(RuntimeConfig::new()
            .with_overrides(|k| (k == "KEEL_MAX_IN_FLIGHT").then(|| "0".to_string()))
            .is_err());
        assert!(RuntimeConfig::new()
            .with_overrides(|k| (k == "KEEL_CGROUP_PARENT").then(|| "../escape".to_string()))
            .is_err());
    }

    #[test]
    fn deny_errno_override_checked() {
        for bad in ["EPERM", "0", "-1", "4096"] {
            let result = RuntimeConfig::new()
                .with_overrides(|k| (k == "KEEL_DEFAULT_DENY_ERRNO").then(|| bad.to_string()));
            assert!(matches!(result, Err(Error::InvalidConfig { .. })), "{bad}");
        }
    }

    #[test]
    fn load_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keel.json");
        std::fs::write(&path, r#"{"cgroup_parent": "runtime", "cgroup_version": "v2"}"#).unwrap();

        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.cgroup_parent, PathBuf::from("runtime"));
        assert_eq!(config.cgroup_version, Some(CgroupVersion::V2));
        assert_eq!(config.max_in_flight, 256);

        std::fs::write(&path, r#"{"cgroup_prent": "typo"}"#).unwrap();
        assert!(matches!(RuntimeConfig::load(&path), Err(Error::InvalidConfig { .. })));
    }
}
