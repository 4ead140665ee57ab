use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::exit;
use std::time::{Duration, SystemTime};
use tracing::{error, info};

use weir_server_common::{encode_metrics, init_logging};
use weir_state::handles::{KeyGroupRange, KeyGroupsStateHandle, StreamStateHandle};
use weir_state::{
    CheckpointHandle, CheckpointProperties, CheckpointStatus, PendingCheckpoint, SubtaskState,
};
use weir_types::config::{config, initialize_config};
use weir_types::{to_millis, ExecutionAttemptId, JobId, JobVertexId, TaskVertex};

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to a config file, layered over the defaults and any weir.toml in the working directory
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drives a single checkpoint from start to completion or expiry and prints the outcome
    Simulate(SimulateArgs),
}

#[derive(Args, Debug, Clone)]
struct SimulateArgs {
    /// Number of job vertices taking part in the checkpoint
    #[arg(long, default_value_t = 2)]
    tasks: usize,

    /// Subtasks per job vertex
    #[arg(long, default_value_t = 2)]
    parallelism: usize,

    /// How many of the vertices report state with their acknowledgment
    #[arg(long, default_value_t = 1)]
    stateful: usize,

    /// How many subtasks never acknowledge, leaving the checkpoint to expire
    #[arg(long, default_value_t = 0)]
    missing: usize,

    /// Take a forced, externalized savepoint instead of a regular checkpoint
    #[arg(long)]
    savepoint: bool,

    /// Where savepoints are written; defaults to the configured checkpoint-url
    #[arg(long)]
    target_dir: Option<String>,

    /// Seconds before an incomplete checkpoint is aborted; defaults to checkpoint.timeout
    #[arg(long)]
    expire_after: Option<u64>,

    #[arg(long, default_value_t = 1)]
    checkpoint_id: u64,

    /// Print the prometheus metrics to stderr once the checkpoint has terminated
    #[arg(long)]
    print_metrics: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = initialize_config(cli.config.as_deref()) {
        eprintln!("{:#}", e);
        exit(1);
    }

    let _guard = init_logging("weir");

    match cli.command {
        Commands::Simulate(args) => {
            let print_metrics = args.print_metrics;
            match simulate(args).await {
                Ok(outcome) => match serde_json::to_string_pretty(&outcome) {
                    Ok(s) => println!("{}", s),
                    Err(e) => {
                        error!("Failed to serialize outcome: {}", e);
                        exit(1);
                    }
                },
                Err(e) => {
                    error!("Simulation failed: {:#}", e);
                    exit(1);
                }
            }

            if print_metrics {
                match encode_metrics() {
                    Ok(metrics) => eprintln!("{}", metrics),
                    Err(e) => error!("Failed to encode metrics: {}", e),
                }
            }
        }
    }
}

fn subtask_state(vertex: &TaskVertex) -> SubtaskState {
    let groups_per_subtask = (vertex.max_parallelism / vertex.parallelism).max(1) as u32;
    let start = vertex.subtask_index as u32 * groups_per_subtask;
    let name = format!("{}-{}", vertex.job_vertex_id, vertex.subtask_index);

    SubtaskState::with_keyed_state(KeyGroupsStateHandle::new(
        KeyGroupRange::of(start, start + groups_per_subtask - 1),
        StreamStateHandle::bytes(name.clone(), name.into_bytes()),
    ))
}

async fn simulate(args: SimulateArgs) -> anyhow::Result<Value> {
    if args.tasks == 0 || args.parallelism == 0 {
        bail!("--tasks and --parallelism must both be at least 1");
    }

    let total = args.tasks * args.parallelism;
    if args.missing > total {
        bail!(
            "--missing ({}) is larger than the number of subtasks ({})",
            args.missing,
            total
        );
    }

    let config = config();

    let props = if args.savepoint {
        CheckpointProperties::for_standard_savepoint()
    } else {
        CheckpointProperties::for_standard_checkpoint()
    };

    let target_dir = args.target_dir.clone().or_else(|| {
        props
            .externalize_checkpoint()
            .then(|| config.checkpoint_url.clone())
    });

    let attempts: Vec<(ExecutionAttemptId, TaskVertex)> = (0..args.tasks)
        .flat_map(|v| {
            (0..args.parallelism).map(move |i| {
                (
                    ExecutionAttemptId::new(),
                    TaskVertex::new(
                        JobVertexId::new(format!("vertex-{}", v)),
                        i,
                        args.parallelism,
                        args.parallelism.max(128),
                    ),
                )
            })
        })
        .collect();

    let job_id = JobId::new("simulated");
    let pending = PendingCheckpoint::new(
        job_id.clone(),
        args.checkpoint_id,
        SystemTime::now(),
        attempts.iter().cloned().collect(),
        props,
        target_dir,
    )
    .context("failed to start checkpoint")?;

    info!(message = "simulating checkpoint", %pending);

    let expire_after = args
        .expire_after
        .map(Duration::from_secs)
        .unwrap_or(*config.checkpoint.timeout);

    let (handle, actor) =
        CheckpointHandle::spawn(pending, config.checkpoint.actor_queue_size, Some(expire_after));
    let completion = handle.completion_future();

    let stateful: Vec<_> = (0..args.stateful.min(args.tasks))
        .map(|v| JobVertexId::new(format!("vertex-{}", v)))
        .collect();

    let acks = attempts
        .into_iter()
        .take(total - args.missing)
        .map(|(attempt_id, vertex)| {
            let handle = handle.clone();
            let state = stateful
                .contains(&vertex.job_vertex_id)
                .then(|| subtask_state(&vertex));
            tokio::spawn(async move { handle.acknowledge_task(attempt_id, state).await })
        });

    let mut acknowledged = 0;
    for ack in futures::future::join_all(acks).await {
        if ack.context("acknowledging task panicked")?? {
            acknowledged += 1;
        }
    }

    let outcome = if handle.status().await? == CheckpointStatus::FullyAcknowledged {
        handle.finalize_checkpoint().await
    } else {
        completion.await
    };

    drop(handle);
    actor.await.context("checkpoint actor panicked")?;

    Ok(match outcome {
        Ok(completed) => json!({
            "job_id": job_id.to_string(),
            "checkpoint_id": completed.checkpoint_id(),
            "status": "completed",
            "acknowledged": acknowledged,
            "timestamp": to_millis(completed.timestamp()),
            "duration_ms": completed.duration().as_millis() as u64,
            "state_size": completed.state_size(),
            "stateful_vertices": completed.task_states().len(),
            "external_path": completed.external_path(),
        }),
        Err(e) => json!({
            "job_id": job_id.to_string(),
            "checkpoint_id": args.checkpoint_id,
            "status": "failed",
            "acknowledged": acknowledged,
            "reason": e.reason(),
            "error": e.to_string(),
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> SimulateArgs {
        SimulateArgs {
            tasks: 3,
            parallelism: 2,
            stateful: 2,
            missing: 0,
            savepoint: false,
            target_dir: None,
            expire_after: None,
            checkpoint_id: 4,
            print_metrics: false,
        }
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from([
            "weir",
            "simulate",
            "--tasks",
            "4",
            "--savepoint",
            "--target-dir",
            "memory://savepoints",
        ]);
        let Commands::Simulate(args) = cli.command;
        assert_eq!(args.tasks, 4);
        assert_eq!(args.parallelism, 2);
        assert!(args.savepoint);
        assert_eq!(args.target_dir.as_deref(), Some("memory://savepoints"));
    }

    #[tokio::test]
    async fn test_simulate_completes() {
        let outcome = simulate(args()).await.unwrap();
        assert_eq!(outcome["status"], "completed");
        assert_eq!(outcome["checkpoint_id"], 4);
        assert_eq!(outcome["acknowledged"], 6);
        assert_eq!(outcome["stateful_vertices"], 2);
        assert_eq!(outcome["external_path"], Value::Null);
    }

    #[tokio::test]
    async fn test_simulate_savepoint() {
        let dir = tempfile::tempdir().unwrap();
        let directory = dir.path().to_str().unwrap().to_string();
        let outcome = simulate(SimulateArgs {
            savepoint: true,
            target_dir: Some(directory.clone()),
            ..args()
        })
        .await
        .unwrap();

        assert_eq!(outcome["status"], "completed");
        assert_eq!(
            outcome["external_path"],
            format!("file://{}/savepoint-simulated-4/_metadata", directory)
        );
        assert!(dir.path().join("savepoint-simulated-4/_metadata").exists());
    }

    #[tokio::test]
    async fn test_simulate_expires() {
        let outcome = simulate(SimulateArgs {
            missing: 1,
            expire_after: Some(0),
            ..args()
        })
        .await
        .unwrap();

        assert_eq!(outcome["status"], "failed");
        assert_eq!(outcome["reason"], "expired");
    }

    #[tokio::test]
    async fn test_simulate_rejects_invalid_args() {
        assert!(simulate(SimulateArgs {
            tasks: 0,
            ..args()
        })
        .await
        .is_err());

        assert!(simulate(SimulateArgs {
            missing: 7,
            ..args()
        })
        .await
        .is_err());
    }
}
