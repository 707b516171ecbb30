//! A sharemul node, running either as the triple producer or as a multiplying party.
use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sharemul::{
    channel::Endpoint,
    matrix::{Matrix, Shape},
    message::PartyId,
    mul::SecureMultiplier,
    producer::TripleProducer,
};
use sharemul_http::{HttpTransport, NodeConfig, Server};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt::format::FmtSpan};

/// A node of a secret-shared matrix multiplication.
///
/// Logging can be controlled with an EnvFilter via the `SHAREMUL_LOG` environment
/// variable.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Path to the JSON configuration of this node.
    #[arg(long, short)]
    config: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Runs the node as the triple producer until interrupted or stopped by the coordinator.
    Producer,
    /// Multiplies a local matrix with the matrix of a peer and prints this node's share of the product.
    #[command(arg_required_else_help = true)]
    Multiply {
        /// The party holding the other operand.
        #[arg(long)]
        peer: PartyId,
        /// Whether the local matrix is the left or the right operand.
        #[arg(long, value_enum)]
        position: Position,
        /// Path to the local matrix, a JSON array of rows.
        #[arg(long)]
        input: PathBuf,
        /// The shape of the peer's matrix, e.g. "3x2".
        #[arg(long)]
        peer_shape: Shape,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Position {
    Left,
    Right,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing().context("tracing initialization")?;

    let cli = Cli::parse();
    let config = NodeConfig::load(&cli.config)?;
    let mailboxes = Arc::new(config.mailboxes());
    let mut server = Server::new(config.listen, Arc::clone(&mailboxes));
    server.bind_socket().await?;
    let server = tokio::spawn(server.start());
    let endpoint = config.endpoint(mailboxes)?;

    let result = match cli.command {
        Commands::Producer => run_producer(&config, endpoint).await,
        Commands::Multiply {
            peer,
            position,
            input,
            peer_shape,
        } => multiply(&config, &endpoint, peer, position, &input, peer_shape).await,
    };
    server.abort();
    result
}

async fn run_producer(config: &NodeConfig, endpoint: Endpoint<HttpTransport>) -> anyhow::Result<()> {
    let producer = Arc::new(TripleProducer::new(endpoint, config.timeouts));
    let (stop, stopped) = watch::channel(false);
    let running = tokio::spawn(Arc::clone(&producer).run(config.clients().collect::<Vec<_>>(), stopped));

    let stop_message = async {
        match config.coordinator {
            Some(coordinator) => producer.stop_on_message(coordinator, &stop).await,
            None => std::future::pending().await,
        }
    };
    tokio::select! {
        interrupted = tokio::signal::ctrl_c() => {
            interrupted.context("unable to listen for ctrl-c")?;
            info!("interrupted, stopping");
            stop.send_replace(true);
        }
        stopped = stop_message => stopped?,
    }

    let generated = running.await??;
    info!(generated, "triple producer finished");
    Ok(())
}

async fn multiply(
    config: &NodeConfig,
    endpoint: &Endpoint<HttpTransport>,
    peer: PartyId,
    position: Position,
    input: &std::path::Path,
    peer_shape: Shape,
) -> anyhow::Result<()> {
    let json = std::fs::read_to_string(input)
        .with_context(|| format!("unable to read {}", input.display()))?;
    let rows: Vec<Vec<f64>> = serde_json::from_str(&json).context("input must be a JSON array of rows")?;
    let operand = Matrix::from_rows(rows)?;

    let multiplier = SecureMultiplier::new(endpoint, config.producer, config.timeouts);
    let share = match position {
        Position::Left => multiplier.multiply_as_left(peer, peer_shape, &operand).await?,
        Position::Right => multiplier.multiply_as_right(peer, peer_shape, &operand).await?,
    };
    println!("{}", serde_json::to_string(&share.to_rows())?);
    Ok(())
}

fn init_tracing() -> anyhow::Result<()> {
    let env_filter = EnvFilter::builder()
        .with_env_var("SHAREMUL_LOG")
        .with_default_directive("sharemul=info".parse()?)
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}
