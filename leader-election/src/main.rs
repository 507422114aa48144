use anyhow::{Context, Result, ensure};
use clap::Parser;
use tracing::{info, warn};

use leader_election::{
    cli::{Cli, Command},
    cluster::Cluster,
    node::Node,
    runtime::spawn_node,
    transport::UdpTransport,
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command {
        Command::Cluster(args) => {
            let cluster = Cluster::spawn_udp(args.election.to_config()).await?;
            info!("press ctrl-c to stop");
            cluster.run_until_ctrl_c().await?;
        }
        Command::Node(args) => {
            let config = args.election.to_config();
            config.validate().context("invalid cluster configuration")?;
            ensure!(
                args.id < config.total_nodes,
                "node id {} is outside a {}-node cluster",
                args.id,
                config.total_nodes
            );

            let transport = UdpTransport::bind(&config, args.id).await?;
            let mut handle = spawn_node(Node::new(args.id, &config), transport, &config);
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
            handle.shutdown().await?;
        }
    }

    Ok(())
}
