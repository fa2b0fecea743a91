mod cli;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::{Result, bail};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command, LockCommand, RunArgs, StateCommand};
use driftguard::lock::{FileLockCoordinator, LockCoordinator};
use driftguard::paths::{StateLayout, default_state_dir};
use driftguard::providers::{self, ProviderSettings};
use driftguard::reconcile::{self, Reconciler, RunMode};
use driftguard::store::{FileSnapshotStore, SnapshotStore};
use driftguard::terraform::TerraformState;
use driftguard::{ReconcileConfig, load_declarations, output};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let layout = StateLayout::new(cli.state_dir.clone().unwrap_or_else(default_state_dir));
    let store = Arc::new(FileSnapshotStore::new(layout.snapshots_dir())?);
    let locks = Arc::new(FileLockCoordinator::new(layout.locks_dir())?);
    let partition = cli.partition.as_str();
    tracing::debug!(state_dir = %layout.root().display(), partition, "state opened");

    match cli.command {
        Command::Diff(args) => {
            let reconciler = build_reconciler(&args, store, locks)?;
            let declared = load_declarations(&args.config)?;
            let report = reconciler.run(partition, &declared, RunMode::Plan).await?;
            if args.json {
                println!("{}", serde_json::to_string_pretty(&report.diffs)?);
            } else {
                match output::divergence_table(&report.diffs) {
                    Some(table) => println!("{table}"),
                    None => println!("no drift"),
                }
            }
        }
        Command::Plan(args) => run(&args, store, locks, partition, RunMode::Plan).await?,
        Command::Apply(args) => run(&args, store, locks, partition, RunMode::Apply).await?,
        Command::Import(args) => {
            let state = TerraformState::from_path(&args.tfstate)?;
            let summary = reconcile::import_records(
                store.as_ref(),
                locks.as_ref(),
                &ReconcileConfig::default(),
                partition,
                state.records(),
                args.replace,
            )
            .await?;
            println!(
                "imported {} record(s), skipped {} existing",
                summary.imported.len(),
                summary.skipped.len()
            );
            for id in &summary.skipped {
                println!("  skipped {id} (use --replace to overwrite)");
            }
        }
        Command::Lock { command } => match command {
            LockCommand::Status => match locks.current(partition)? {
                Some(token) => println!(
                    "locked by '{}' since {} (expires {})",
                    token.holder_id,
                    token.acquired_at,
                    token.expires_at()
                ),
                None => println!("unlocked"),
            },
            LockCommand::Acquire { holder, ttl } => {
                let token = locks.acquire(partition, &holder, Duration::from_secs(ttl))?;
                println!("locked by '{}' until {}", token.holder_id, token.expires_at());
            }
            LockCommand::Release { holder } => {
                locks.release(partition, &holder)?;
                println!("released");
            }
            LockCommand::ForceUnlock => match locks.force_release(partition)? {
                Some(token) => println!("removed lock held by '{}'", token.holder_id),
                None => println!("no lock to remove"),
            },
        },
        Command::State { command } => match command {
            StateCommand::List => {
                for record in store.list(partition)? {
                    println!("{}\t{}\t{}", record.id, record.resource_type, record.provider_ref);
                }
            }
            StateCommand::Rm { resource_id } => {
                reconcile::remove_record(
                    store.as_ref(),
                    locks.as_ref(),
                    &ReconcileConfig::default(),
                    partition,
                    &resource_id,
                )
                .await?;
                println!("removed {resource_id}");
            }
        },
    }

    Ok(())
}

fn build_reconciler(
    args: &RunArgs,
    store: Arc<FileSnapshotStore>,
    locks: Arc<FileLockCoordinator>,
) -> Result<Reconciler> {
    let settings = ProviderSettings {
        url: args.provider_url.clone(),
        token: args.provider_token.clone(),
        fixture: args.fixture.clone(),
    };
    let provider = providers::get_provider(args.provider.as_str(), &settings)?;

    let config = ReconcileConfig {
        lock_timeout: Duration::from_secs(args.lock_timeout),
        concurrency: args.concurrency,
        external_drift: args.external_drift.into(),
        ..Default::default()
    };

    Ok(Reconciler::new(provider, store, locks, config))
}

async fn run(
    args: &RunArgs,
    store: Arc<FileSnapshotStore>,
    locks: Arc<FileLockCoordinator>,
    partition: &str,
    mode: RunMode,
) -> Result<()> {
    let reconciler = build_reconciler(args, store, locks)?;
    let declared = load_declarations(&args.config)?;
    let report = reconciler.run(partition, &declared, mode).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", output::plan_tree(&report));
        println!("{}", output::summary(&report));
    }

    if !report.failures.is_empty() {
        bail!("{} resource(s) could not be reconciled", report.failures.len());
    }
    Ok(())
}
