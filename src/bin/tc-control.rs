//! Controller CLI: enumerate workers, list presets, submit transcoding
//! batches.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser};

use transcoder_cluster::controller::{Controller, EventBus, OUTPUT_SUFFIX, SchedulerEvent};
use transcoder_cluster::discovery::DiscoveryService;
use transcoder_cluster::sync_ext::MutexExt;
use transcoder_cluster::{ClusterConfig, logging, presets};

/// Transcoder cluster controller
#[derive(Parser, Debug)]
#[command(name = "tc-control")]
#[command(about = "Dispatches transcoding tasks to workers on the LAN")]
#[command(version)]
struct Args {
    /// Discover workers, print them, and exit
    #[arg(short, long)]
    scan: bool,

    /// List available transcoding presets and exit
    #[arg(long)]
    list_presets: bool,

    /// Input video file
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output path (default: input name with `_transcoded` suffix)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Preset name (see --list-presets)
    #[arg(short, long)]
    preset: Option<String>,

    /// Raw ffmpeg arguments, e.g. "-c:v libx265 -crf 28"
    #[arg(short = 'a', long)]
    args: Option<String>,

    /// Target worker IP (default: automatic selection)
    #[arg(short, long)]
    worker: Option<String>,

    /// Attempts per task before it is marked failed
    #[arg(long, default_value_t = 2)]
    max_attempts: u32,

    /// JSON config file; overrides TC_* environment variables
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = ClusterConfig::load(args.config.as_deref())?;
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    logging::init(&config.log_level, config.log_file.as_deref())?;

    if args.list_presets {
        println!("Available presets:");
        println!("{}", "-".repeat(60));
        for (id, description) in presets::preset_descriptions() {
            println!("  {id:<24} {description}");
        }
        return Ok(());
    }

    let controller = Controller::new(config.clone())?;

    if args.scan {
        let workers = discover_workers(&controller, &config);
        if workers.is_empty() {
            println!("No workers found");
        } else {
            println!("Found {} worker(s):", workers.len());
            for ip in &workers {
                let status = controller.worker_status(ip);
                let state = status
                    .get("status")
                    .and_then(|v| v.as_str())
                    .unwrap_or("unknown");
                println!("  - {ip}: {state}");
            }
        }
        return Ok(());
    }

    let Some(input) = args.input else {
        Args::command().print_help()?;
        return Ok(());
    };
    if !input.exists() {
        bail!("input file does not exist: {}", input.display());
    }

    let workers = match &args.worker {
        Some(ip) => vec![ip.clone()],
        None => {
            let found = discover_workers(&controller, &config);
            if found.is_empty() {
                bail!("no workers available");
            }
            found
        }
    };

    let ffmpeg_args = resolve_ffmpeg_args(args.preset.as_deref(), args.args.as_deref())?;
    let output = args
        .output
        .unwrap_or_else(|| transcoder_cluster::controller::build_output_path(&input, OUTPUT_SUFFIX));

    println!("Submitting transcode task:");
    println!("  input:   {}", input.display());
    println!("  output:  {}", output.display());
    println!("  workers: {}", workers.join(", "));
    println!("  args:    {}", ffmpeg_args.join(" "));

    let task = controller.create_task(input, output.clone(), ffmpeg_args, args.max_attempts);

    let (events, rx) = EventBus::channel();
    let printer = thread::spawn(move || {
        let mut last_line = String::new();
        for event in rx {
            match event {
                SchedulerEvent::TaskUpdated(task) => {
                    let line = match &task.worker {
                        Some(worker) => {
                            format!("{}: {} on {} ({}%)", task.id, task.status, worker, task.progress)
                        }
                        None => format!("{}: {} ({}%)", task.id, task.status, task.progress),
                    };
                    if line != last_line {
                        println!("{line}");
                        last_line = line;
                    }
                }
                SchedulerEvent::NodeStatus { .. } => {}
                SchedulerEvent::Finished(report) => {
                    println!(
                        "Batch finished: {} completed, {} failed of {}",
                        report.completed, report.failed, report.total
                    );
                }
            }
        }
    });

    let stop = Arc::new(AtomicBool::new(false));
    let result = controller.dispatch(&[task.clone()], &workers, &events, &stop);
    drop(events);
    let _ = printer.join();

    let report = result.context("dispatch failed")?;
    if report.completed == report.total {
        println!("Transcode complete: {}", output.display());
        Ok(())
    } else {
        let error = task
            .lock_unpoisoned()
            .error
            .clone()
            .unwrap_or_else(|| "unknown error".to_string());
        bail!("transcode failed: {error}");
    }
}

/// Workers via UDP discovery first, then the active subnet sweep.
fn discover_workers(controller: &Controller, config: &ClusterConfig) -> Vec<String> {
    let mut service = DiscoveryService::new(
        config.discovery_port,
        Duration::from_secs(config.heartbeat_interval),
    );
    if service.start(None).is_ok() {
        service.broadcast_discovery();
        thread::sleep(Duration::from_secs(2));
        let ips = service.worker_ips();
        service.stop();
        if !ips.is_empty() {
            return ips;
        }
    }
    controller.scan_workers(None)
}

fn resolve_ffmpeg_args(preset: Option<&str>, raw_args: Option<&str>) -> Result<Vec<String>> {
    if let Some(name) = preset {
        let preset = presets::get_preset(name).with_context(|| {
            format!(
                "unknown preset '{name}'; available: {}",
                presets::list_presets().join(", ")
            )
        })?;
        return Ok(preset.to_ffmpeg_args());
    }
    if let Some(raw) = raw_args {
        return Ok(raw.split_whitespace().map(str::to_string).collect());
    }
    Ok(vec![
        "-c:v".to_string(),
        "libx265".to_string(),
        "-crf".to_string(),
        "28".to_string(),
    ])
}
