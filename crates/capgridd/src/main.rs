//! capgridd — the capgrid daemon.
//!
//! Single binary over a local state store:
//! - Seed the store from an inventory file
//! - List capacity pools
//! - Run a reservation under a deadline
//! - Print journaled task documents
//!
//! # Usage
//!
//! ```text
//! capgridd --config capgrid.toml seed demos/inventory.toml
//! capgridd reserve /descriptions/web --count 2 --tenant /tenants/team-a
//! capgridd task reservation-1a2b3c4d5e6f
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use capgrid_core::config::CapgridConfig;
use capgrid_placement::ScoringWeights;
use capgrid_scheduler::{
    ReservationCompletion, ReservationRequest, ReservationScheduler, collaborators, supervise,
};
use capgrid_state::{Inventory, StateStore, TenantScope};
use capgrid_task::TaskCompletion;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

const DEFAULT_DATA_DIR: &str = "/var/lib/capgrid";

#[derive(Parser)]
#[command(name = "capgridd", about = "capgrid capacity reservation daemon")]
struct Cli {
    /// Configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory for persistent state. Overrides the config file.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load an inventory file into the state store.
    Seed {
        /// Inventory TOML file.
        inventory: PathBuf,
    },

    /// List capacity pools, optionally only those owned by tenants.
    Pools {
        #[arg(long = "tenant")]
        tenants: Vec<String>,
    },

    /// Reserve capacity for a resource description.
    Reserve {
        /// Link of the resource description.
        description: String,

        /// Number of instances.
        #[arg(long, default_value = "1")]
        count: u64,

        /// Tenant/group link; repeat for several. None = global.
        #[arg(long = "tenant")]
        tenants: Vec<String>,

        /// Correlation id for host grouping.
        #[arg(long)]
        context_id: Option<String>,

        /// Custom property as key=value; repeatable.
        #[arg(long = "property", value_parser = parse_property)]
        properties: Vec<(String, String)>,
    },

    /// Print the journaled document of a task.
    Task {
        task_id: String,
    },

    /// Print the effective configuration.
    Config,
}

fn parse_property(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => CapgridConfig::from_file(path)?,
        None => CapgridConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_filter())),
        )
        .init();

    let data_dir = cli
        .data_dir
        .clone()
        .or_else(|| config.daemon.data_dir.clone())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));

    match cli.command {
        Command::Seed { inventory } => seed(&data_dir, inventory),
        Command::Pools { tenants } => list_pools(&data_dir, tenants),
        Command::Reserve {
            description,
            count,
            tenants,
            context_id,
            properties,
        } => {
            let mut request = ReservationRequest::new(&description, count);
            request.tenant_scope = TenantScope::new(tenants);
            request.context_id = context_id;
            request.custom_properties.extend(properties);
            reserve(&data_dir, &config, request).await
        }
        Command::Task { task_id } => print_task(&data_dir, &task_id),
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn open_store(data_dir: &Path) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data directory {}", data_dir.display()))?;
    let db_path = data_dir.join("capgrid.redb");
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

fn seed(data_dir: &Path, inventory: PathBuf) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let inventory = Inventory::from_file(&inventory)?;
    let summary = store.seed(&inventory)?;
    println!(
        "seeded {} capacity pools, {} resource pools, {} endpoints, {} profiles, {} descriptions, {} hosts",
        summary.capacity_pools,
        summary.resource_pools,
        summary.endpoints,
        summary.profiles,
        summary.descriptions,
        summary.hosts
    );
    Ok(())
}

fn list_pools(data_dir: &Path, tenants: Vec<String>) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let scope = TenantScope::new(tenants);
    for pool in store.list_capacity_pools()? {
        if !scope.is_global() && !scope.owns(&pool.tenant_links) {
            continue;
        }
        let available = if pool.is_unbounded() {
            "unbounded".to_string()
        } else {
            format!("{}/{}", pool.available_instances, pool.max_instances)
        };
        println!(
            "{:<40} {:<10} priority={:<4} available={:<12} pool={}",
            pool.id,
            pool.resource_type.label(),
            pool.priority,
            available,
            pool.resource_pool_link
        );
    }
    Ok(())
}

async fn reserve(
    data_dir: &Path,
    config: &CapgridConfig,
    request: ReservationRequest,
) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let weights = ScoringWeights::from(&config.scheduler.placement);
    let scheduler = ReservationScheduler::new(collaborators(store.clone(), weights))
        .with_journal(store);

    let (tx, mut rx) = mpsc::unbounded_channel::<ReservationCompletion>();
    let handle = scheduler.submit(request, Arc::new(tx)).await?;
    info!(task_id = %handle.task_id(), "reservation started");

    let deadline = Duration::from_secs(config.scheduler.task_deadline_secs);
    supervise(&handle, deadline).await;

    match rx.recv().await {
        Some(TaskCompletion::Finished { task_id, output }) => {
            info!(task_id = %task_id, pool = %output.winning_pool, "reservation completed");
            println!("{}", serde_json::to_string_pretty(&output)?);
            Ok(())
        }
        Some(TaskCompletion::Failed { task_id, error }) => {
            warn!(task_id = %task_id, class = ?error.class(), "reservation failed");
            bail!("reservation {task_id} failed: {error}")
        }
        None => bail!("reservation {} ended without a result", handle.task_id()),
    }
}

fn print_task(data_dir: &Path, task_id: &str) -> anyhow::Result<()> {
    let store = open_store(data_dir)?;
    let Some(doc) = store.get_task_document(task_id)? else {
        bail!("no journaled task {task_id}");
    };
    println!("{}", serde_json::to_string_pretty(&doc)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn property_needs_separator() {
        assert_eq!(
            parse_property("owner=team-a=x").unwrap(),
            ("owner".to_string(), "team-a=x".to_string())
        );
        assert!(parse_property("owner").is_err());
    }

    #[test]
    fn reserve_collects_repeated_flags() {
        let cli = Cli::try_parse_from([
            "capgridd",
            "--data-dir",
            "/tmp/capgrid",
            "reserve",
            "/descriptions/web",
            "--count",
            "3",
            "--tenant",
            "/tenants/a",
            "--tenant",
            "/tenants/b",
            "--property",
            "owner=ops",
        ])
        .unwrap();
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/capgrid")));
        let Command::Reserve {
            count,
            tenants,
            properties,
            ..
        } = cli.command
        else {
            panic!("expected reserve");
        };
        assert_eq!(count, 3);
        assert_eq!(tenants.len(), 2);
        assert_eq!(properties, vec![("owner".to_string(), "ops".to_string())]);
    }
}
