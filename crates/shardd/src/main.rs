//! shardd — the ShardGrid daemon.
//!
//! # Usage
//!
//! ```text
//! shardd --config /etc/shardgrid/shardgrid.toml run
//! shardd info
//! shardd pause | resume
//! shardd reindex-project 42
//! shardd rollout --dry-run --batch-size 100
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use shardd::{ControlPlane, admin};
use shardgrid_core::{FleetSettings, epoch_secs};
use shardgrid_events::EventBus;
use shardgrid_metrics::render_prometheus;
use shardgrid_rollout::RolloutController;
use shardgrid_state::StateStore;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "info,shardd=debug,shardgrid=debug";

#[derive(Parser)]
#[command(name = "shardd", about = "ShardGrid search fleet control plane")]
struct Cli {
    /// Path to shardgrid.toml. Built-in defaults apply when it does not exist.
    #[arg(long, global = true, default_value = "/etc/shardgrid/shardgrid.toml")]
    config: PathBuf,

    /// Overrides `store.data_dir`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Log as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control plane until Ctrl-C.
    Run {
        /// Lease holder name for this host. Defaults to `$HOSTNAME-<pid>`.
        #[arg(long)]
        holder: Option<String>,
    },
    /// Print fleet flags, the metrics snapshot and per-node storage.
    Info {
        /// Print Prometheus text instead of JSON.
        #[arg(long)]
        prometheus: bool,
    },
    /// Pause indexing dispatch fleet-wide.
    Pause,
    /// Resume indexing dispatch.
    Resume,
    /// Toggle automatic onboarding of eligible root namespaces.
    AutoIndex {
        #[arg(long)]
        disable: bool,
    },
    /// Re-queue every repository of a project for indexing.
    ReindexProject { project_id: u64 },
    /// Skip a namespace in provisioning for `rollout.failed_retry_secs`.
    MarkRolloutFailed { root_namespace_id: u64 },
    /// Remove a namespace from the fleet.
    Offboard { root_namespace_id: u64 },
    /// Run one rollout pass.
    Rollout {
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// Print the effective configuration as TOML.
    PrintConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let mut settings = load_settings(&cli.config)?;
    if let Some(data_dir) = cli.data_dir {
        settings.store.data_dir = data_dir;
    }

    match cli.command {
        Command::Run { holder } => {
            let holder = holder.unwrap_or_else(default_holder);
            info!(%holder, "starting shardd");
            ControlPlane::open(settings, &holder)?.run().await
        }
        Command::Info { prometheus } => {
            let store = open_store(&settings)?;
            let info = admin::fleet_info(&store, epoch_secs())?;
            if prometheus {
                print!("{}", render_prometheus(&info.snapshot));
            } else {
                println!("{}", serde_json::to_string_pretty(&info)?);
            }
            Ok(())
        }
        Command::Pause => {
            admin::set_indexing_paused(&open_store(&settings)?, true)?;
            println!("indexing paused");
            Ok(())
        }
        Command::Resume => {
            admin::set_indexing_paused(&open_store(&settings)?, false)?;
            println!("indexing resumed");
            Ok(())
        }
        Command::AutoIndex { disable } => {
            admin::set_auto_index(&open_store(&settings)?, !disable)?;
            println!(
                "auto-index root namespaces {}",
                if disable { "disabled" } else { "enabled" }
            );
            Ok(())
        }
        Command::ReindexProject { project_id } => {
            let store = open_store(&settings)?;
            let retries = settings.limits.repository_retries;
            let reset = admin::reindex_project(&store, project_id, retries, epoch_secs())?;
            println!("{reset} repositories of project {project_id} queued for re-indexing");
            Ok(())
        }
        Command::MarkRolloutFailed { root_namespace_id } => {
            let store = open_store(&settings)?;
            if admin::mark_rollout_failed(&store, root_namespace_id, epoch_secs())? {
                println!("rollout of namespace {root_namespace_id} marked failed");
            } else {
                anyhow::bail!("namespace {root_namespace_id} is not enabled");
            }
            Ok(())
        }
        Command::Offboard { root_namespace_id } => {
            let store = open_store(&settings)?;
            if admin::offboard(&store, root_namespace_id)? {
                println!("namespace {root_namespace_id} offboarded");
            } else {
                anyhow::bail!("namespace {root_namespace_id} is not enabled");
            }
            Ok(())
        }
        Command::Rollout {
            dry_run,
            batch_size,
        } => {
            let store = open_store(&settings)?;
            let bus = EventBus::new(settings.bus.clone());
            let controller =
                RolloutController::new(store, bus, Arc::new(settings), default_holder());
            let report = controller.execute(dry_run, batch_size, epoch_secs())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::PrintConfig => {
            print!("{}", settings.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_settings(path: &Path) -> anyhow::Result<FleetSettings> {
    if path.exists() {
        let settings = FleetSettings::from_file(path)?;
        info!(path = ?path, "configuration loaded");
        Ok(settings)
    } else {
        debug!(path = ?path, "no configuration file, using defaults");
        Ok(FleetSettings::default())
    }
}

fn open_store(settings: &FleetSettings) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&settings.store.data_dir)?;
    Ok(StateStore::open(&settings.db_path())?)
}

fn default_holder() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "shardd".to_string());
    format!("{host}-{}", std::process::id())
}
