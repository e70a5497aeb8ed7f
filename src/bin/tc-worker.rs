//! Worker node daemon: accepts transcoding tasks over HTTP and answers
//! discovery traffic until interrupted.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;

use transcoder_cluster::worker::Worker;
use transcoder_cluster::{ClusterConfig, logging};

/// Transcoder cluster worker node
#[derive(Parser, Debug)]
#[command(name = "tc-worker")]
#[command(about = "Accepts and executes transcoding tasks for the cluster")]
#[command(version)]
struct Args {
    /// HTTP listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Staging directory for inputs and outputs (default: ./worker_files)
    #[arg(short = 'w', long)]
    work_dir: Option<PathBuf>,

    /// JSON config file; overrides TC_* environment variables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Disable the discovery responder and heartbeat broadcaster
    #[arg(long)]
    no_discovery: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ClusterConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.worker_port = port;
    }
    if let Some(work_dir) = args.work_dir {
        config.work_dir = work_dir;
    } else if config.work_dir == Path::new(".") {
        // The generic default stages next to the process; workers get their
        // own directory unless told otherwise.
        config.work_dir = PathBuf::from("./worker_files");
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    logging::init(&config.log_level, config.log_file.as_deref())?;

    Worker::new(config, args.no_discovery).run()
}
