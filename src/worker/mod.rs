//! Worker node: a single-slot transcoding executor behind a small HTTP
//! surface, discoverable over UDP broadcast.

pub mod capabilities;
mod routes;
pub mod slot;
pub mod transcode;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::ClusterConfig;
use crate::discovery::{DiscoveryResponder, HeartbeatBroadcaster, local_hostname, resolve_local_ip};
use self::routes::WorkerContext;
use self::transcode::TranscodeError;

pub use self::capabilities::Capabilities;
pub use self::slot::{ExecutionSlot, SlotSnapshot, SlotStatus};

/// Worker-side failure taxonomy. `Config` is fatal to the process; the
/// other variants settle one task and are reported through the `/task`
/// response for the controller to retry.
#[derive(Debug, Error)]
pub enum WorkerError {
    /// Unbindable port, unwritable work dir: surface and exit.
    #[error("{0}")]
    Config(String),
    #[error("FFmpeg returned code {code}")]
    Ffmpeg { code: i32 },
    /// Subprocess plumbing trouble outside ffmpeg's own exit status
    /// (spawn failure, broken stderr pipe, wait errors).
    #[error("{0}")]
    Probe(String),
    /// Malformed payload: unparsable JSON, bad file name, broken base64.
    #[error("{0}")]
    BadRequest(String),
    /// The execution slot already holds a task.
    #[error("worker busy")]
    Busy,
    #[error("transcode aborted by worker shutdown")]
    Stopped,
}

impl From<TranscodeError> for WorkerError {
    fn from(err: TranscodeError) -> Self {
        match err {
            TranscodeError::Ffmpeg(code) => WorkerError::Ffmpeg { code },
            TranscodeError::Stopped => WorkerError::Stopped,
            TranscodeError::Other(err) => WorkerError::Probe(format!("{err:#}")),
        }
    }
}

pub struct Worker {
    config: ClusterConfig,
    no_discovery: bool,
}

impl Worker {
    pub fn new(config: ClusterConfig, no_discovery: bool) -> Self {
        Self {
            config,
            no_discovery,
        }
    }

    /// Run the worker until interrupted. Blocks the calling thread.
    pub fn run(self) -> Result<()> {
        self.config
            .ensure_work_dir()
            .map_err(|err| WorkerError::Config(format!("{err:#}")))?;

        let capabilities = capabilities::probe(&self.config.ffmpeg_path);
        if capabilities.ffmpeg_installed {
            info!(
                version = %capabilities.ffmpeg_version,
                nvenc = capabilities.nvenc_supported,
                "ffmpeg available"
            );
        } else {
            warn!(
                ffmpeg_path = %self.config.ffmpeg_path,
                "ffmpeg is not available; tasks will be rejected by capability-aware controllers"
            );
        }

        let slot = Arc::new(ExecutionSlot::new());

        let advertise_ip = self
            .config
            .advertise_ip
            .clone()
            .or_else(|| resolve_local_ip().map(|ip| ip.to_string()))
            .unwrap_or_else(|| "127.0.0.1".to_string());

        let mut responder = None;
        let mut heartbeat = None;
        if self.no_discovery {
            info!("discovery disabled (--no-discovery)");
        } else {
            let status_slot = slot.clone();
            let mut service = DiscoveryResponder::new(self.config.discovery_port, move || {
                status_slot.status_json()
            });
            service
                .start(advertise_ip.clone())
                .context("failed to start discovery responder")?;
            responder = Some(service);

            let status_slot = slot.clone();
            let mut beats = HeartbeatBroadcaster::new(
                self.config.discovery_port,
                Duration::from_secs(self.config.heartbeat_interval),
                move || status_slot.status_json(),
            );
            beats
                .start(advertise_ip.clone())
                .context("failed to start heartbeat broadcaster")?;
            heartbeat = Some(beats);
        }

        let ctx = Arc::new(WorkerContext {
            config: self.config.clone(),
            slot: slot.clone(),
            capabilities,
            discovery_enabled: !self.no_discovery,
        });

        info!(
            hostname = %local_hostname(),
            ip = %advertise_ip,
            port = self.config.worker_port,
            work_dir = %self.config.work_dir.display(),
            "worker starting"
        );

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to start async runtime")?;
        let serve_result = runtime.block_on(serve(ctx, self.config.worker_port, slot.clone()));

        // Past this point no new tasks are accepted and any in-flight ffmpeg
        // has been told to quit; release the discovery sockets last.
        slot.request_stop();
        if let Some(mut service) = responder {
            service.stop();
        }
        if let Some(mut beats) = heartbeat {
            beats.stop();
        }
        info!("worker stopped");
        serve_result
    }
}

async fn serve(ctx: Arc<WorkerContext>, port: u16, slot: Arc<ExecutionSlot>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|err| WorkerError::Config(format!("failed to bind worker port {port}: {err}")))?;
    info!("listening on http://0.0.0.0:{port}");

    axum::serve(listener, routes::router(ctx))
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
            // Refuse new tasks and abort the running transcode; the HTTP
            // server then drains in-flight connections.
            slot.request_stop();
        })
        .await
        .context("worker http server failed")
}
