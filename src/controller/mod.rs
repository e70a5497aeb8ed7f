//! Controller: worker enumeration, task creation, and batch dispatch.

pub mod client;
mod queue;
pub mod scheduler;
pub mod task;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ClusterConfig;
use crate::discovery::{resolve_local_ip, subnet_prefix};
use crate::sync_ext::MutexExt;
use crate::worker::Capabilities;

pub use self::client::{ClientError, WorkerClient};
pub use self::scheduler::{DispatchError, DispatchReport, EventBus, SchedulerEvent};
pub use self::task::{Task, TaskHandle, TaskStatus, task_handle};

/// Default suffix appended to an input file's stem to form its output name.
pub const OUTPUT_SUFFIX: &str = "_transcoded";

/// Subnet probes run 100 at a time, mirroring the aggressive LAN sweep the
/// cluster has always used.
const SCAN_PARALLELISM: usize = 100;

pub struct Controller {
    config: ClusterConfig,
    client: Arc<WorkerClient>,
    task_counter: AtomicU64,
    capabilities: Mutex<HashMap<String, Capabilities>>,
}

impl Controller {
    pub fn new(config: ClusterConfig) -> Result<Self> {
        let client = WorkerClient::new(
            config.worker_port,
            Duration::from_secs(config.task_timeout_secs),
        )
        .context("failed to build worker http client")?;
        Ok(Self {
            config,
            client: Arc::new(client),
            task_counter: AtomicU64::new(0),
            capabilities: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The `a.b.c.` prefix used for active subnet scans.
    pub fn local_subnet(&self) -> String {
        self.config
            .advertise_ip
            .as_deref()
            .and_then(|raw| raw.parse().ok())
            .or_else(resolve_local_ip)
            .map(subnet_prefix)
            .unwrap_or_else(|| "192.168.1.".to_string())
    }

    /// Active fallback when UDP discovery finds nothing: probe every host
    /// in the subnet for a `/ping` answering `pong`.
    pub fn scan_workers(&self, subnet: Option<&str>) -> Vec<String> {
        let subnet = subnet
            .map(str::to_string)
            .unwrap_or_else(|| self.local_subnet());
        info!(%subnet, "scanning subnet for workers");

        let mut found = Vec::new();
        let addresses: Vec<String> = (1u16..=254).map(|host| format!("{subnet}{host}")).collect();
        for batch in addresses.chunks(SCAN_PARALLELISM) {
            let mut probes = Vec::with_capacity(batch.len());
            for ip in batch {
                let client = self.client.clone();
                let ip = ip.clone();
                probes.push(thread::spawn(move || client.ping(&ip).then_some(ip)));
            }
            for probe in probes {
                if let Ok(Some(ip)) = probe.join() {
                    info!(%ip, "worker answered ping");
                    found.push(ip);
                }
            }
        }
        found
    }

    /// Allocate one task. Ids are dense and monotonic within a controller.
    pub fn create_task(
        &self,
        input_file: PathBuf,
        output_file: PathBuf,
        ffmpeg_args: Vec<String>,
        max_attempts: u32,
    ) -> TaskHandle {
        let id = self.task_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let task = Task::new(
            format!("task_{id}"),
            input_file,
            output_file,
            ffmpeg_args,
            max_attempts,
        );
        debug!(task = %task.id, input = %task.input_file.display(), "task created");
        task_handle(task)
    }

    /// Allocate tasks for a whole batch, deriving collision-free output
    /// paths next to each input.
    pub fn create_tasks_for_files(
        &self,
        files: &[PathBuf],
        ffmpeg_args: &[String],
        max_attempts: u32,
        suffix: &str,
    ) -> Vec<TaskHandle> {
        files
            .iter()
            .map(|input| {
                let output = build_output_path(input, suffix);
                self.create_task(input.clone(), output, ffmpeg_args.to_vec(), max_attempts)
            })
            .collect()
    }

    /// Fetch (and cache) a worker's capability descriptor.
    pub fn capabilities_for(&self, worker_ip: &str) -> Option<Capabilities> {
        if let Some(cached) = self.capabilities.lock_unpoisoned().get(worker_ip) {
            return Some(cached.clone());
        }
        match self.client.capabilities(worker_ip) {
            Ok(fetched) => {
                self.capabilities
                    .lock_unpoisoned()
                    .insert(worker_ip.to_string(), fetched.clone());
                Some(fetched)
            }
            Err(err) => {
                debug!(worker = worker_ip, %err, "capability probe failed");
                None
            }
        }
    }

    /// Restrict the worker set when the argument vector selects a hardware
    /// encoder. Unknown capabilities are surfaced instead of guessed at.
    pub fn filter_workers_for_args(
        &self,
        workers: &[String],
        ffmpeg_args: &[String],
    ) -> Result<Vec<String>, DispatchError> {
        let Some(codec) = nvenc_codec_in_args(ffmpeg_args) else {
            return Ok(workers.to_vec());
        };

        let mut supported = Vec::new();
        let mut unknown = Vec::new();
        for worker in workers {
            match self.capabilities_for(worker) {
                Some(capabilities) if capabilities.nvenc_supported => {
                    supported.push(worker.clone());
                }
                Some(_) => {}
                None => unknown.push(worker.clone()),
            }
        }

        if !supported.is_empty() {
            if supported.len() < workers.len() {
                info!(
                    codec = %codec,
                    eligible = supported.len(),
                    total = workers.len(),
                    "restricting dispatch to hardware-capable workers"
                );
            }
            return Ok(supported);
        }
        if !unknown.is_empty() {
            return Err(DispatchError::CapabilitiesUnknown {
                codec: codec.to_string(),
                workers: unknown.join(", "),
            });
        }
        Err(DispatchError::NoCapableWorkers {
            codec: codec.to_string(),
        })
    }

    /// Dispatch a batch and block until it settles. Progress flows through
    /// `events`; `stop` cancels between attempts.
    pub fn dispatch(
        &self,
        tasks: &[TaskHandle],
        workers: &[String],
        events: &EventBus,
        stop: &Arc<AtomicBool>,
    ) -> Result<DispatchReport, DispatchError> {
        // Gate on the whole batch: one hardware-only task restricts the
        // worker set for the run.
        let ffmpeg_args = tasks
            .iter()
            .map(|handle| handle.lock_unpoisoned().ffmpeg_args.clone())
            .find(|args| nvenc_codec_in_args(args).is_some())
            .unwrap_or_default();
        let eligible = self.filter_workers_for_args(workers, &ffmpeg_args)?;
        let submitter = Arc::new(scheduler::HttpSubmitter {
            client: self.client.clone(),
        });
        scheduler::dispatch_tasks(tasks, &eligible, submitter, events, stop)
    }

    /// Point-in-time status blob from one worker.
    pub fn worker_status(&self, worker_ip: &str) -> Value {
        match self.client.status(worker_ip) {
            Ok(status) => status,
            Err(err) => {
                warn!(worker = worker_ip, %err, "worker status fetch failed");
                serde_json::json!({"status": "unknown", "error": err.to_string()})
            }
        }
    }
}

/// First argument token selecting a hardware NVENC encoder, if any.
fn nvenc_codec_in_args(ffmpeg_args: &[String]) -> Option<&str> {
    ffmpeg_args
        .iter()
        .map(String::as_str)
        .find(|arg| arg.contains("_nvenc"))
}

/// Derive `dir/name<suffix>.ext` from an input path, appending `_2`, `_3`,
/// ... until the candidate does not exist yet.
pub fn build_output_path(input: &Path, suffix: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = input
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();
    let dir = input.parent().unwrap_or_else(|| Path::new(""));

    let first = dir.join(format!("{stem}{suffix}{extension}"));
    if !first.exists() {
        return first;
    }
    let mut counter = 2u32;
    loop {
        let candidate = dir.join(format!("{stem}{suffix}_{counter}{extension}"));
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

/// A downloaded result must exist and be non-empty; anything else fails the
/// attempt and enters the normal retry path.
pub fn validate_output_file(path: &Path) -> Result<(), String> {
    match std::fs::metadata(path) {
        Err(_) => Err(format!("output file does not exist: {}", path.display())),
        Ok(metadata) if metadata.len() == 0 => {
            Err(format!("output file is empty: {}", path.display()))
        }
        Ok(_) => Ok(()),
    }
}
