//! Replica Orchestrator CLI
//!
//! Runs one continuous-copy or replication operation against a topology
//! seeded from YAML and prints the resulting tasks as JSON.
//!
//! ```text
//! replica-orchestrator --topology topology.yaml pause --source vol-1
//! replica-orchestrator --topology topology.yaml --complete attach --source vol-1 --count 2
//! replica-orchestrator --topology topology.yaml failback --group rrgroup-1
//! ```

use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use replica_orchestrator::{
    AttachRequest, ControlPlane, ControlPlaneConfig, GatewayOperation, InMemoryDataStore,
    MirrorRequest, OperationOutcome, PauseRequest, SingleMirrorRequest, Task, TaskList,
    TopologySeed,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Replica Orchestrator - control plane for continuous copies and remote replication
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Topology snapshot to seed the in-memory store with
    #[arg(long, env = "TOPOLOGY")]
    topology: Option<PathBuf>,

    /// Control plane configuration file
    #[arg(long, env = "CONFIG")]
    config: Option<PathBuf>,

    /// Operation id; generated when omitted
    #[arg(long, env = "OP_ID")]
    op_id: Option<String>,

    /// Apply a successful device completion right after dispatch
    #[arg(long)]
    complete: bool,

    /// Print Prometheus metrics after the operation
    #[arg(long)]
    print_metrics: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Attach new continuous copies to a volume
    Attach {
        #[arg(long)]
        source: String,
        /// Base name of the new copies
        #[arg(long, default_value = "copy")]
        name: String,
        #[arg(long, default_value_t = 1)]
        count: u32,
    },
    /// Detach continuous copies, promoting each to a volume
    Detach {
        #[arg(long)]
        source: String,
        /// Copies to detach; all active copies when omitted
        #[arg(long = "mirror")]
        mirrors: Vec<String>,
    },
    /// Pause (fracture) continuous copies
    Pause {
        #[arg(long)]
        source: String,
        #[arg(long = "mirror")]
        mirrors: Vec<String>,
        /// Synchronize before fracturing
        #[arg(long)]
        sync: bool,
    },
    /// Resume paused continuous copies
    Resume {
        #[arg(long)]
        source: String,
        #[arg(long = "mirror")]
        mirrors: Vec<String>,
    },
    /// Establish the group relation of a consistency-group copy
    Establish {
        #[arg(long)]
        source: String,
        #[arg(long)]
        mirror: String,
    },
    /// Tear down a continuous copy
    Deactivate {
        #[arg(long)]
        source: String,
        #[arg(long)]
        mirror: String,
    },
    /// Fail back a remote replication group
    Failback {
        #[arg(long)]
        group: String,
    },
    /// List tasks still waiting on the device
    Pending,
    /// Show control plane status
    Status,
}

fn mirror_list(mirrors: Vec<String>) -> Option<Vec<String>> {
    if mirrors.is_empty() {
        None
    } else {
        Some(mirrors)
    }
}

// =============================================================================
// Output
// =============================================================================

#[derive(Serialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
enum Report {
    Dispatched { tasks: TaskList },
    NoOp { task: Task },
    Rejected { reason: String },
    Completed { tasks: TaskList },
    Pending { tasks: Vec<Task> },
}

impl From<OperationOutcome> for Report {
    fn from(outcome: OperationOutcome) -> Self {
        match outcome {
            OperationOutcome::Dispatched(tasks) => Report::Dispatched { tasks },
            OperationOutcome::NoOp(task) => Report::NoOp { task },
            OperationOutcome::Rejected(error) => Report::Rejected {
                reason: error.to_string(),
            },
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    init_logging(&args);

    info!("Starting Replica Orchestrator {}", replica_orchestrator::VERSION);

    let config = match &args.config {
        Some(path) => ControlPlaneConfig::load(path)?,
        None => ControlPlaneConfig::default(),
    };

    let store = Arc::new(InMemoryDataStore::new());
    if let Some(path) = &args.topology {
        let seed = TopologySeed::load(path)?;
        seed.apply(store.as_ref()).await?;
    } else {
        warn!("No topology given; the store is empty");
    }

    let control_plane = ControlPlane::new(config, store)?;
    let op_id = args
        .op_id
        .clone()
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let (operation, outcome) = match args.command {
        Command::Attach {
            source,
            name,
            count,
        } => {
            let request = AttachRequest {
                source,
                name,
                count,
                op_id: op_id.clone(),
            };
            (GatewayOperation::Attach, control_plane.attach(&request).await?)
        }
        Command::Detach { source, mirrors } => {
            let request = MirrorRequest {
                source,
                mirrors: mirror_list(mirrors),
                op_id: op_id.clone(),
            };
            (GatewayOperation::Detach, control_plane.detach(&request).await?)
        }
        Command::Pause {
            source,
            mirrors,
            sync,
        } => {
            let request = PauseRequest {
                source,
                mirrors: mirror_list(mirrors),
                sync,
                op_id: op_id.clone(),
            };
            (GatewayOperation::Pause, control_plane.pause(&request).await?)
        }
        Command::Resume { source, mirrors } => {
            let request = MirrorRequest {
                source,
                mirrors: mirror_list(mirrors),
                op_id: op_id.clone(),
            };
            (GatewayOperation::Resume, control_plane.resume(&request).await?)
        }
        Command::Establish { source, mirror } => {
            let request = SingleMirrorRequest {
                source,
                mirror,
                op_id: op_id.clone(),
            };
            (
                GatewayOperation::EstablishGroupRelation,
                control_plane.establish_group_relation(&request).await?,
            )
        }
        Command::Deactivate { source, mirror } => {
            let request = SingleMirrorRequest {
                source,
                mirror,
                op_id: op_id.clone(),
            };
            (GatewayOperation::Deactivate, control_plane.deactivate(&request).await?)
        }
        Command::Failback { group } => (
            GatewayOperation::FailbackGroup,
            control_plane.failback(&group, &op_id).await?,
        ),
        Command::Pending => {
            let tasks = control_plane.pending_tasks().await?;
            print_json(&Report::Pending { tasks })?;
            return Ok(ExitCode::SUCCESS);
        }
        Command::Status => {
            print_json(&control_plane.status().await?)?;
            return Ok(ExitCode::SUCCESS);
        }
    };

    let dispatched_ok = matches!(&outcome, OperationOutcome::Dispatched(tasks) if !tasks.any_failed());
    let failed = match &outcome {
        OperationOutcome::Dispatched(tasks) => tasks.any_failed(),
        OperationOutcome::NoOp(_) => false,
        OperationOutcome::Rejected(_) => true,
    };
    print_json(&Report::from(outcome))?;

    if args.complete && dispatched_ok && operation != GatewayOperation::FailbackGroup {
        let tasks = control_plane.complete(&op_id, operation, Ok(())).await?;
        print_json(&Report::Completed { tasks })?;
    }

    if args.print_metrics {
        print!("{}", control_plane.metrics().encode()?);
    }

    info!("Operation {} finished", op_id);
    Ok(if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    // stdout carries the JSON report
    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_writer(std::io::stderr))
            .init();
    }
}
