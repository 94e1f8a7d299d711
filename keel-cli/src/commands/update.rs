//! Update command implementation

use anyhow::{Context, Result};
use keel_cgroup::{backend_from_config, Reconciler};
use keel_core::{codec, ContainerId, ResourceDocument, RuntimeConfig};
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

use crate::cli::UpdateArgs;

pub async fn execute(config: &RuntimeConfig, args: UpdateArgs) -> Result<()> {
    let container_id = ContainerId::new(&args.container).context("Invalid container ID")?;

    let document = match &args.resources {
        Some(path) => read_document(path)?,
        None => {
            codec::parse_from_options(args.fields.options()).context("Invalid resource option")?
        }
    };
    debug!(container_id = %container_id, fields = document.fields().count(), "Parsed resources");

    let backend = backend_from_config(config).context("Failed to select cgroup backend")?;
    let reconciler = Reconciler::new(backend);

    let summary = reconciler
        .update(&container_id, &document)
        .await
        .with_context(|| format!("Failed to update container {container_id}"))?;

    info!(
        container_id = %container_id,
        backend = %reconciler.version(),
        writes = summary.writes,
        "Resources updated"
    );
    println!(
        "Updated {container_id}: {} field(s), {} write(s)",
        summary.applied.len(),
        summary.writes
    );
    Ok(())
}

fn read_document(path: &Path) -> Result<ResourceDocument> {
    let bytes = if path == Path::new("-") {
        let mut bytes = Vec::new();
        std::io::stdin()
            .read_to_end(&mut bytes)
            .context("Failed to read resources from stdin")?;
        bytes
    } else {
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?
    };

    codec::parse_from_file(&bytes)
        .with_context(|| format!("Invalid resources document {}", path.display()))
}
