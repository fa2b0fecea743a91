use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use driftguard::plan::ExternalDriftPolicy;

#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Directory holding snapshots and lock files
    #[arg(long, global = true, env = "DRIFTGUARD_STATE_DIR")]
    pub state_dir: Option<PathBuf>,

    /// Partition to operate on
    #[arg(
        long,
        short,
        global = true,
        env = "DRIFTGUARD_PARTITION",
        default_value = "default"
    )]
    pub partition: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Show fields that differ between declared, last-applied and live
    Diff(RunArgs),
    /// Show the ordered corrective actions without applying them
    Plan(RunArgs),
    /// Apply the planned actions
    Apply(RunArgs),
    /// Seed the snapshot store from a Terraform state file
    Import(ImportArgs),
    Lock {
        #[command(subcommand)]
        command: LockCommand,
    },
    State {
        #[command(subcommand)]
        command: StateCommand,
    },
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Declarations document (JSON)
    #[arg(long, short)]
    pub config: PathBuf,

    #[arg(long, value_enum, default_value_t = ProviderKind::Http)]
    pub provider: ProviderKind,

    #[arg(long, env = "DRIFTGUARD_PROVIDER_URL")]
    pub provider_url: Option<String>,

    #[arg(
        long,
        env = "DRIFTGUARD_PROVIDER_TOKEN",
        hide_env_values = true,
        hide = true
    )]
    pub provider_token: Option<String>,

    /// Live attributes for the fixture provider
    #[arg(long)]
    pub fixture: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = ExternalDrift::Revert)]
    pub external_drift: ExternalDrift,

    /// Seconds to wait for the partition lock
    #[arg(long, default_value_t = 30)]
    pub lock_timeout: u64,

    /// Maximum concurrent provider fetches
    #[arg(long, default_value_t = 8)]
    pub concurrency: usize,

    /// Print the full report as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderKind {
    Http,
    Fixture,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Http => "http",
            ProviderKind::Fixture => "fixture",
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExternalDrift {
    /// Restore declared values
    Revert,
    /// Report only
    Report,
}

impl From<ExternalDrift> for ExternalDriftPolicy {
    fn from(value: ExternalDrift) -> Self {
        match value {
            ExternalDrift::Revert => ExternalDriftPolicy::Revert,
            ExternalDrift::Report => ExternalDriftPolicy::Report,
        }
    }
}

#[derive(clap::Args, Debug)]
pub struct ImportArgs {
    /// Terraform state file (format version 4)
    #[arg(long)]
    pub tfstate: PathBuf,

    /// Overwrite records that already exist
    #[arg(long)]
    pub replace: bool,
}

#[derive(Subcommand, Debug)]
pub enum LockCommand {
    /// Show the current lock holder
    Status,
    /// Take the lock by hand, e.g. to freeze a partition
    Acquire {
        #[arg(long)]
        holder: String,
        /// Seconds until the lock expires
        #[arg(long, default_value_t = 900)]
        ttl: u64,
    },
    /// Release a lock taken with `acquire`
    Release {
        #[arg(long)]
        holder: String,
    },
    /// Remove the lock regardless of holder
    ForceUnlock,
}

#[derive(Subcommand, Debug)]
pub enum StateCommand {
    /// List recorded resources
    List,
    /// Forget a resource without touching the provider
    Rm { resource_id: String },
}
