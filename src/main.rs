//! Command line entry of the RDMA file transfer

use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use rdma_transfer::{
    exchange, logging, Config, ConnectionContext, IbvProvider, Mode, TransferEngine,
};
use tracing::info;

/// Send a file to a peer over an RDMA reliable connection
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, default_value = "config.json")]
    config: PathBuf,
    /// Log at DEBUG regardless of the configuration
    #[arg(long)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let dispatch = logging::dispatch(args.debug || config.debug);
    tracing::dispatcher::with_default(&dispatch, || run(&config))
}

/// Connect, transfer and tear down
fn run(config: &Config) -> anyhow::Result<()> {
    let mut ctx = ConnectionContext::open(IbvProvider::new(), &config.context_config()?)
        .context("opening the RDMA device")?;
    let remote = exchange(&ctx.local_parameters(), config.role()?)
        .context("exchanging connection parameters")?;
    ctx.connect(&remote).context("connecting the queue pair")?;

    let mut engine = TransferEngine::new(&mut ctx, config.engine_config()?)?;
    let stats = match config.mode {
        Mode::Server => engine.run_responder()?,
        Mode::Client => {
            let file = config
                .file_name
                .as_deref()
                .context("client mode needs a file_name")?;
            engine.run_initiator(file)?
        }
    };
    info!(
        "done: {} received, {} chunks ({} bytes) sent",
        stats.received(),
        stats.chunks_sent(),
        stats.bytes_sent()
    );
    ctx.close().context("releasing RDMA resources")?;
    Ok(())
}
