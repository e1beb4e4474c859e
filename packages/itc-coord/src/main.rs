use std::path::PathBuf;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use itc_coord::{CoordConfig, Coordinator, Result};

/// itccoord - ITC coordinator: process ranges and the mailbox directory
#[derive(Parser, Debug)]
#[command(name = "itccoord")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory for the coordinator and process sockets
    #[arg(long)]
    socket_dir: Option<PathBuf>,

    /// Number of process slots
    #[arg(long)]
    max_processes: Option<u32>,

    /// Namespace reported in locate replies
    #[arg(long)]
    namespace: Option<String>,

    /// Service iterations before a listening slot is probed
    #[arg(long)]
    zombie_ticks: Option<u32>,

    /// Probe all listening slots while fewer slots than this are free
    #[arg(long)]
    low_water: Option<usize>,
}

impl Args {
    fn apply(self, config: &mut CoordConfig) {
        if let Some(dir) = self.socket_dir {
            config.socket_dir = dir;
        }
        if let Some(max) = self.max_processes {
            config.max_processes = max;
        }
        if let Some(namespace) = self.namespace {
            config.namespace = namespace;
        }
        if let Some(ticks) = self.zombie_ticks {
            config.zombie_ticks = ticks;
        }
        if let Some(low_water) = self.low_water {
            config.low_water = low_water;
        }
    }
}

#[tokio::main]
async fn main() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = FmtSubscriber::builder().with_env_filter(env_filter).try_init();

    let args = Args::parse();
    if let Err(e) = run(args).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(args: Args) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => CoordConfig::load(path)?,
        None => CoordConfig::default(),
    };
    args.apply(&mut config);

    let coordinator = Coordinator::start(config).await?;

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    info!("shutting down");

    coordinator.shutdown().await
}
