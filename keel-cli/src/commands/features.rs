//! Features command implementation

use anyhow::{Context, Result};
use keel_cgroup::detect_version;
use keel_core::RuntimeConfig;
use serde_json::{json, Map, Value};
use tracing::debug;

pub fn execute(config: &RuntimeConfig) -> Result<()> {
    let cgroup_version = match config.cgroup_version {
        Some(version) => Some(version),
        None => match detect_version(&config.cgroup_root) {
            Ok(version) => Some(version),
            Err(e) => {
                debug!(
                    root = %config.cgroup_root.display(),
                    error = %e,
                    "No cgroup hierarchy detected"
                );
                None
            }
        },
    };

    let mut features = Map::new();
    for name in keel_security::support::FEATURES {
        let supported = keel_security::check_feature(name)
            .with_context(|| format!("Cannot check {name}"))?;
        features.insert(name.to_string(), Value::Bool(supported));
    }

    let report = json!({
        "cgroupVersion": cgroup_version.map(|v| v.as_str()),
        "cgroupRoot": config.cgroup_root,
        "features": features,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
