use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kvstore_raft::{Cluster, ClusterStatus, RaftConfig};

mod shutdown;

#[derive(Parser, Debug)]
#[command(name = "kvstore-raft")]
#[command(version)]
#[command(about = "Leader election for a replicated key/value store, simulated in-process")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a cluster and report its status until stopped
    Run(RunArgs),

    /// Elect a leader, stop it, and check that the cluster recovers
    Failover(FailoverArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClusterArgs {
    /// Number of nodes in the cluster
    #[arg(long, short = 'n', default_value = "5")]
    nodes: usize,

    /// Lower bound of the randomized election timeout
    #[arg(long, default_value = "150")]
    election_min_ms: u64,

    /// Upper bound of the randomized election timeout
    #[arg(long, default_value = "300")]
    election_max_ms: u64,

    /// Leader heartbeat interval
    #[arg(long, default_value = "50")]
    heartbeat_ms: u64,

    /// Per-peer RPC timeout inside an election or heartbeat round
    #[arg(long, default_value = "100")]
    rpc_timeout_ms: u64,

    /// Only incoming RPCs update a node's term; higher terms in replies are ignored
    #[arg(long)]
    ignore_reply_term: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

impl ClusterArgs {
    fn config(&self) -> RaftConfig {
        RaftConfig::default()
            .with_election_timeout(self.election_min_ms, self.election_max_ms)
            .with_heartbeat_interval(self.heartbeat_ms)
            .with_rpc_timeout(self.rpc_timeout_ms)
            .with_adopt_reply_term(!self.ignore_reply_term)
    }
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Stop after this many seconds (runs until SIGINT/SIGTERM if omitted)
    #[arg(long)]
    duration_secs: Option<u64>,

    /// Seconds between status reports
    #[arg(long, default_value = "2")]
    report_secs: u64,
}

#[derive(Parser, Debug)]
struct FailoverArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// How long to wait for each election to settle
    #[arg(long, default_value = "10")]
    settle_secs: u64,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Output
// =============================================================================

fn print_status(
    status: &ClusterStatus,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    match output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string(status)?);
        }
        OutputFormat::Table => {
            match status.leader {
                Some(leader) => println!("Leader: node {}", leader),
                None => println!("Leader: none"),
            }
            println!("{:<8} {:<10} {:<6} {:<10} {:<8}", "NODE", "ROLE", "TERM", "VOTED", "STOPPED");
            for node in &status.nodes {
                let voted = node
                    .voted_for
                    .map(|id| id.to_string())
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "{:<8} {:<10} {:<6} {:<10} {:<8}",
                    node.id,
                    node.role.to_string(),
                    node.term,
                    voted,
                    node.stopped
                );
            }
            println!();
        }
    }
    Ok(())
}

/// Poll until `check_invariant` passes or `timeout` elapses.
async fn wait_until_valid(cluster: &Cluster, timeout: Duration) -> kvstore_raft::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match cluster.check_invariant().await {
            Ok(()) => return Ok(()),
            Err(e) if tokio::time::Instant::now() >= deadline => return Err(e),
            Err(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

async fn handle_run(args: RunArgs, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.cluster.config();
    config.validate()?;

    let cluster = Cluster::with_nodes(args.cluster.nodes, config);
    cluster.start_all().await;

    let stop_after = async {
        match args.duration_secs {
            Some(secs) => tokio::time::sleep(Duration::from_secs(secs)).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(stop_after);

    let mut report = tokio::time::interval(Duration::from_secs(args.report_secs.max(1)));
    report.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = &mut stop_after => break,
            _ = report.tick() => {
                print_status(&cluster.status().await, &args.cluster.output)?;
            }
        }
    }

    cluster.stop_all().await;
    print_status(&cluster.status().await, &args.cluster.output)?;
    Ok(())
}

async fn handle_failover(args: FailoverArgs, shutdown: CancellationToken) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.cluster.config();
    config.validate()?;
    let settle = Duration::from_secs(args.settle_secs);

    let cluster: Arc<Cluster> = Cluster::with_nodes(args.cluster.nodes, config);
    cluster.start_all().await;

    let outcome = tokio::select! {
        _ = shutdown.cancelled() => None,
        outcome = run_failover(&cluster, settle, &args.cluster.output) => Some(outcome),
    };

    cluster.stop_all().await;
    match outcome {
        Some(result) => result,
        None => {
            tracing::info!("Failover interrupted");
            Ok(())
        }
    }
}

async fn run_failover(
    cluster: &Arc<Cluster>,
    settle: Duration,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    wait_until_valid(cluster, settle).await?;
    print_status(&cluster.status().await, output)?;

    let old_leader = cluster.stop_leader().await?;
    tracing::info!(node_id = old_leader.id(), "Waiting for a new leader");

    wait_until_valid(cluster, settle).await?;
    let new_leader = cluster.find_leader().await?;
    print_status(&cluster.status().await, output)?;

    old_leader.start(cluster).await;
    wait_until_valid(cluster, settle).await?;
    print_status(&cluster.status().await, output)?;

    tracing::info!(
        old_leader = old_leader.id(),
        new_leader = new_leader.id(),
        "Failover complete"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let shutdown = shutdown::install_shutdown_handler();

    match args.command {
        Commands::Run(run_args) => {
            handle_run(run_args, shutdown).await?;
        }
        Commands::Failover(failover_args) => {
            handle_failover(failover_args, shutdown).await?;
        }
    }

    Ok(())
}
