//! CLI argument definitions

use clap::{Args, Parser, Subcommand};
use keel_core::CgroupVersion;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "keel")]
#[command(
    about = "Keel runtime control plane: live resource updates and seccomp notification",
    long_about = None
)]
#[command(version)]
pub struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Runtime configuration file (JSON)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Root of the cgroup filesystem
    #[arg(long, global = true, value_name = "DIR")]
    pub cgroup_root: Option<PathBuf>,

    /// Parent cgroup of the container cgroups, relative to the root
    #[arg(long, global = true, value_name = "PATH")]
    pub cgroup_parent: Option<PathBuf>,

    /// Cgroup generation, skipping detection (v1 or v2)
    #[arg(long, global = true, value_name = "VERSION", value_parser = parse_version)]
    pub cgroup_version: Option<CgroupVersion>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Update the resource limits of a running container
    Update(UpdateArgs),

    /// Check one kernel feature; exits 0 if supported, 1 if not
    CheckFeature {
        /// Feature name (seccomp-listener, open_tree, move_mount)
        name: String,
    },

    /// Print the detected cgroup version and kernel features as JSON
    Features,
}

#[derive(Args)]
pub struct UpdateArgs {
    /// Container ID
    pub container: String,

    /// Read the resources document from FILE ("-" for stdin)
    #[arg(short, long, value_name = "FILE", conflicts_with = "fields")]
    pub resources: Option<PathBuf>,

    #[command(flatten)]
    pub fields: FieldFlags,
}

/// One flag per document field. Values stay raw strings so that
/// validation errors name the offending option.
#[derive(Args)]
#[group(id = "fields", multiple = true)]
pub struct FieldFlags {
    /// Specifies per cgroup weight
    #[arg(long, value_name = "WEIGHT")]
    pub blkio_weight: Option<String>,

    /// CPU CFS period to be used for hardcapping
    #[arg(long, value_name = "USEC")]
    pub cpu_period: Option<String>,

    /// CPU CFS hardcap limit
    #[arg(long, value_name = "USEC")]
    pub cpu_quota: Option<String>,

    /// CPU shares
    #[arg(long, value_name = "SHARES")]
    pub cpu_share: Option<String>,

    /// CPU realtime period to be used for hardcapping
    #[arg(long, value_name = "USEC")]
    pub cpu_rt_period: Option<String>,

    /// CPU realtime hardcap limit
    #[arg(long, value_name = "USEC")]
    pub cpu_rt_runtime: Option<String>,

    /// CPU(s) to use
    #[arg(long, value_name = "LIST")]
    pub cpuset_cpus: Option<String>,

    /// Memory node(s) to use
    #[arg(long, value_name = "LIST")]
    pub cpuset_mems: Option<String>,

    /// Kernel memory limit
    #[arg(long, value_name = "BYTES")]
    pub kernel_memory: Option<String>,

    /// Kernel memory limit for tcp buffer
    #[arg(long, value_name = "BYTES")]
    pub kernel_memory_tcp: Option<String>,

    /// Memory limit
    #[arg(long, value_name = "BYTES")]
    pub memory: Option<String>,

    /// Memory reservation or soft_limit
    #[arg(long, value_name = "BYTES")]
    pub memory_reservation: Option<String>,

    /// Total memory usage
    #[arg(long, value_name = "BYTES")]
    pub memory_swap: Option<String>,

    /// Maximum number of pids allowed in the container
    #[arg(long, value_name = "N")]
    pub pids_limit: Option<String>,
}

impl FieldFlags {
    /// Given flags as `(option-name, raw value)` pairs
    pub fn options(&self) -> Vec<(&'static str, &str)> {
        [
            ("blkio-weight", &self.blkio_weight),
            ("cpu-period", &self.cpu_period),
            ("cpu-quota", &self.cpu_quota),
            ("cpu-share", &self.cpu_share),
            ("cpu-rt-period", &self.cpu_rt_period),
            ("cpu-rt-runtime", &self.cpu_rt_runtime),
            ("cpuset-cpus", &self.cpuset_cpus),
            ("cpuset-mems", &self.cpuset_mems),
            ("kernel-memory", &self.kernel_memory),
            ("kernel-memory-tcp", &self.kernel_memory_tcp),
            ("memory", &self.memory),
            ("memory-reservation", &self.memory_reservation),
            ("memory-swap", &self.memory_swap),
            ("pids-limit", &self.pids_limit),
        ]
        .into_iter()
        .filter_map(|(option, value)| value.as_deref().map(|v| (option, v)))
        .collect()
    }
}

fn parse_version(raw: &str) -> Result<CgroupVersion, String> {
    raw.parse().map_err(|e: keel_core::Error| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn flag_names_match_document_options() {
        let cli = Cli::parse_from([
            "keel",
            "update",
            "c1",
            "--cpu-quota",
            "50000",
            "--cpuset-cpus",
            "0-1",
            "--memory-swap",
            "2",
        ]);
        let Commands::Update(args) = cli.command else {
            panic!("expected update");
        };
        let options = args.fields.options();
        assert_eq!(
            options,
            vec![("cpu-quota", "50000"), ("cpuset-cpus", "0-1"), ("memory-swap", "2")]
        );
        for (option, _) in options {
            assert!(keel_core::FieldId::from_option(option).is_some(), "{option}");
        }
    }

    #[test]
    fn every_field_has_a_flag() {
        let command = Cli::command();
        let update = command.find_subcommand("update").unwrap();
        for descriptor in &keel_core::document::FIELDS {
            assert!(
                update.get_arguments().any(|arg| arg.get_long() == Some(descriptor.option)),
                "missing flag --{}",
                descriptor.option
            );
        }
    }

    #[test]
    fn resources_conflicts_with_flags() {
        let result =
            Cli::try_parse_from(["keel", "update", "c1", "--resources", "r.json", "--memory", "1"]);
        assert!(result.is_err());
    }
}
