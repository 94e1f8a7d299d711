//! Check-feature command implementation

use anyhow::{Context, Result};
use std::process::ExitCode;

pub fn execute(name: &str) -> Result<ExitCode> {
    let supported = keel_security::check_feature(name).context("Cannot check feature")?;

    println!("{name}: {}", if supported { "supported" } else { "unsupported" });
    Ok(if supported { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
