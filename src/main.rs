use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use tew_node::config::{load_config, NodeContext};
use tew_node::supervisor::assets::DirectoryAssets;
use tew_node::supervisor::Servers;

#[derive(Parser, Debug)]
#[command(name = "tew-node")]
#[command(version)]
#[command(about = "Node supervisor with virtual IP failover")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start the servers of this node and provision it
    Run(RunArgs),

    /// Show which servers and commands apply to a node
    Plan(NodeArgs),
}

#[derive(Parser, Debug)]
struct NodeArgs {
    /// Cluster configuration file
    #[arg(long, short = 'c', default_value = "config.yaml")]
    config: PathBuf,

    /// Name of this node in the cluster configuration
    #[arg(long, short = 'n')]
    node: String,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    node: NodeArgs,

    /// Attempts per provisioning command, one second apart
    #[arg(long, default_value = "1200")]
    command_retries: u32,

    /// Seconds a process gets to exit after SIGTERM before it is killed
    #[arg(long, default_value = "10")]
    kill_timeout: u64,

    /// Directory of binaries to install into <assets>/host-binaries
    #[arg(long)]
    assets: Option<PathBuf>,
}

fn load_context(args: &NodeArgs) -> Result<NodeContext, Box<dyn std::error::Error>> {
    let config = load_config(&args.config)?;
    Ok(NodeContext::new(config, args.node.clone())?)
}

async fn run_node(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let context = load_context(&args.node)?;
    tracing::info!(
        node = %context.name,
        ip = %context.node.ip,
        config = %args.node.config.display(),
        "Starting tew-node"
    );

    let mut servers = Servers::new(context).with_kill_timeout(Duration::from_secs(args.kill_timeout));
    if let Some(dir) = args.assets {
        servers = servers.with_assets(Arc::new(DirectoryAssets::new(dir)));
    }

    if let Err(e) = servers.run(args.command_retries).await {
        tracing::error!(error = %e, "Node supervisor failed");
        return Err(e.into());
    }

    tracing::info!("Node stopped");
    Ok(())
}

fn print_plan(args: NodeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let context = load_context(&args)?;
    print!("{}", Servers::new(context).plan());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => run_node(run_args).await?,
        Commands::Plan(node_args) => print_plan(node_args)?,
    }

    Ok(())
}
