use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use shard_lite::config::{CoordinatorConfig, JobConfig, ShardingStrategyType};
use shard_lite::error::JobError;
use shard_lite::executor::ShardingJob;
use shard_lite::instance::{JobInstance, DELIMITER};
use shard_lite::node::{JobNode, Node};
use shard_lite::registry::{MemoryRegistry, MemorySession};
use shard_lite::sharding::{strategy_for, ShardingContext};
use shard_lite::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "shard-lite")]
#[command(version)]
#[command(about = "Distributed job sharding over a shared registry")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start several instances of a job in-process and show how items move
    Simulate(SimulateArgs),

    /// Print the assignment a strategy computes, without any registry
    Assign(AssignArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct SimulateArgs {
    /// Job name
    #[arg(long, default_value = "demo_job")]
    job: String,

    /// Number of instances to start
    #[arg(long, short = 'n', default_value = "3")]
    instances: usize,

    /// Sharding total count
    #[arg(long, short = 't', default_value = "10")]
    total: u32,

    /// Sharding strategy
    #[arg(long, default_value = "average")]
    strategy: StrategyArg,

    /// Item parameters, e.g. "0=Beijing,1=Shanghai"
    #[arg(long, default_value = "")]
    item_parameters: String,

    /// Crash the instance at this index after the first assignment
    #[arg(long)]
    kill: Option<usize>,

    /// Enable failover of items left running by a crashed instance
    #[arg(long)]
    failover: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct AssignArgs {
    /// Job name (round-robin and odevity depend on it)
    #[arg(long, default_value = "demo_job")]
    job: String,

    /// Number of instances
    #[arg(long, short = 'n', default_value = "3")]
    instances: usize,

    /// Sharding total count
    #[arg(long, short = 't', default_value = "10")]
    total: u32,

    /// Sharding strategy
    #[arg(long, default_value = "average")]
    strategy: StrategyArg,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Average,
    RoundRobin,
    Odevity,
}

impl From<StrategyArg> for ShardingStrategyType {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Average => ShardingStrategyType::AverageAllocation,
            StrategyArg::RoundRobin => ShardingStrategyType::RoundRobin,
            StrategyArg::Odevity => ShardingStrategyType::Odevity,
        }
    }
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct InstanceOutput {
    instance_id: String,
    items: Vec<u32>,
}

#[derive(Serialize)]
struct SnapshotOutput {
    phase: String,
    job: String,
    total: u32,
    leader: Option<String>,
    instances: Vec<InstanceOutput>,
    failover_queue: Vec<u32>,
}

#[derive(Serialize)]
struct SimulationOutput {
    snapshots: Vec<SnapshotOutput>,
}

// =============================================================================
// Simulated job
// =============================================================================

/// Pretends to process each item for a short while.
struct SimulatedJob;

#[async_trait]
impl ShardingJob for SimulatedJob {
    async fn execute(&self, context: ShardingContext) -> Result<(), JobError> {
        tracing::info!(
            job = %context.job_name,
            item = context.sharding_item,
            parameter = %context.sharding_parameter,
            "Processing item"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(())
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

fn instance_for(index: usize) -> JobInstance {
    let ip = format!("10.0.0.{}", index + 1);
    JobInstance::with_id(format!("{}{}{}", ip, DELIMITER, std::process::id()), ip)
}

/// Run every live instance until the assignment settles or attempts run out.
async fn settle(nodes: &[Arc<JobNode>]) -> Result<(), Box<dyn std::error::Error>> {
    for _ in 0..50 {
        for node in nodes {
            if let Err(e) = node.run_once().await {
                tracing::debug!(instance_id = %node.instance_id(), error = %e, "Run failed while settling");
            }
        }
        let Some(first) = nodes.first() else {
            return Ok(());
        };
        let sharding = first.sharding();
        if !sharding.is_need_sharding().await?
            && !sharding.has_unassigned_items().await?
            && !sharding.has_sharding_info_in_offline_servers().await?
        {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    tracing::warn!("Assignment did not settle");
    Ok(())
}

async fn snapshot(
    phase: &str,
    nodes: &[Arc<JobNode>],
    total: u32,
) -> Result<SnapshotOutput, Box<dyn std::error::Error>> {
    let Some(first) = nodes.first() else {
        return Err("no live instances".into());
    };
    let mut by_instance: BTreeMap<String, Vec<u32>> = nodes
        .iter()
        .map(|n| (n.instance_id().to_string(), Vec::new()))
        .collect();
    for (item, owner) in first.sharding().get_sharding_assignment().await? {
        by_instance.entry(owner).or_default().push(item);
    }
    Ok(SnapshotOutput {
        phase: phase.to_string(),
        job: first.job_name().to_string(),
        total,
        leader: first.leader().leader_id().await?,
        instances: by_instance
            .into_iter()
            .map(|(instance_id, items)| InstanceOutput { instance_id, items })
            .collect(),
        failover_queue: first.failover().queued_items().await?,
    })
}

fn print_snapshot(snapshot: &SnapshotOutput) {
    println!("{} ({} items)", snapshot.phase, snapshot.total);
    println!("{}", "=".repeat(50));
    println!("Leader: {}", snapshot.leader.as_deref().unwrap_or("-"));
    println!();
    println!("{:<30} ITEMS", "INSTANCE");
    println!("{}", "-".repeat(50));
    for instance in &snapshot.instances {
        let items: Vec<String> = instance.items.iter().map(u32::to_string).collect();
        println!("{:<30} {}", instance.instance_id, items.join(","));
    }
    if !snapshot.failover_queue.is_empty() {
        println!();
        println!("Failover queue: {:?}", snapshot.failover_queue);
    }
    println!();
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn run_simulation(
    args: SimulateArgs,
    registry: MemoryRegistry,
    sessions: &mut Vec<Arc<MemorySession>>,
    nodes: &mut Vec<Arc<JobNode>>,
    hosts: &mut Vec<Node>,
) -> Result<SimulationOutput, Box<dyn std::error::Error>> {
    let config = JobConfig::new(args.job.clone(), args.total)
        .with_strategy(args.strategy.into())
        .with_item_parameters(args.item_parameters.clone())
        .with_failover(args.failover)
        .with_reconcile_interval_minutes(0);
    let coordinator = CoordinatorConfig {
        election_retry_interval_ms: 20,
        running_wait_timeout_ms: 500,
        leader_poll_interval_ms: 20,
        ..CoordinatorConfig::default()
    };

    for index in 0..args.instances {
        let session = registry.session();
        let host = Node::with_instance(instance_for(index)).with_coordinator_config(coordinator.clone());
        let node = host
            .start_job(config.clone(), Arc::new(SimulatedJob), session.clone())
            .await?;
        sessions.push(session);
        nodes.push(node);
        hosts.push(host);
    }

    let mut output = SimulationOutput {
        snapshots: Vec::new(),
    };
    settle(nodes).await?;
    output
        .snapshots
        .push(snapshot("Initial assignment", nodes, args.total).await?);

    if let Some(index) = args.kill {
        if index >= nodes.len() {
            return Err(format!("--kill {} is out of range", index).into());
        }
        let victim = nodes.remove(index);
        let session = sessions.remove(index);
        // Leave a running marker behind the way a crash mid-run would.
        victim
            .execution()
            .register_begin(&victim.sharding().get_local_sharding_items().await?)
            .await?;
        session.close().await;
        victim.stop().await;
        hosts.remove(index);
        tracing::info!(instance_id = %victim.instance_id(), "Instance crashed");

        // The leader flags the stale assignment and reclaims the orphaned items.
        for node in nodes.iter() {
            node.leader().elect_if_needed().await?;
        }
        for node in nodes.iter() {
            node.reconcile().reconcile_once().await?;
        }
        settle(nodes).await?;
        output.snapshots.push(
            snapshot(
                &format!("After crash of {}", victim.instance_id()),
                nodes,
                args.total,
            )
            .await?,
        );
    }
    Ok(output)
}

async fn handle_simulate(args: SimulateArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler();
    let output_format = args.output.clone();
    let registry = MemoryRegistry::new();
    let mut sessions = Vec::new();
    let mut nodes = Vec::new();
    let mut hosts = Vec::new();

    let result = tokio::select! {
        result = run_simulation(args, registry, &mut sessions, &mut nodes, &mut hosts) => result,
        _ = shutdown.cancelled() => Err("interrupted".into()),
    };

    for host in &hosts {
        host.shutdown_all().await;
    }
    let output = result?;

    match output_format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => {
            for snapshot in &output.snapshots {
                print_snapshot(snapshot);
            }
        }
    }
    Ok(())
}

fn handle_assign(args: AssignArgs) -> Result<(), Box<dyn std::error::Error>> {
    let instances: Vec<JobInstance> = (0..args.instances).map(instance_for).collect();
    let strategy = strategy_for(args.strategy.into());
    let assignment = strategy.sharding(&instances, &args.job, args.total);
    let output = SnapshotOutput {
        phase: format!("{} assignment", strategy.strategy_type()),
        job: args.job,
        total: args.total,
        leader: None,
        instances: assignment
            .into_iter()
            .map(|(instance, items)| InstanceOutput {
                instance_id: instance.instance_id,
                items,
            })
            .collect(),
        failover_queue: Vec::new(),
    };
    match args.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&output)?),
        OutputFormat::Table => print_snapshot(&output),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Simulate(simulate_args) => handle_simulate(simulate_args).await?,
        Commands::Assign(assign_args) => handle_assign(assign_args)?,
    }
    Ok(())
}
