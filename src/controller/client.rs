//! Blocking HTTP client for the Worker task protocol.

use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use reqwest::StatusCode;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::worker::Capabilities;

#[derive(Debug, Error)]
pub enum ClientError {
    /// Connection, read, write or timeout trouble; always retryable.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    /// The worker's execution slot was occupied (HTTP 409).
    #[error("worker busy")]
    WorkerBusy,
    /// The worker processed the request and reported failure
    /// (`status: fail|error`).
    #[error("worker reported {status}: {error}")]
    Rejected { status: String, error: String },
    /// Unexpected response shape or status line.
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("download failed: {0}")]
    Download(String),
    #[error("failed to read input {path}: {source}")]
    Input {
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Serialize)]
struct TaskPayload<'a> {
    task_id: &'a str,
    video_file: VideoFilePayload<'a>,
    ffmpeg_args: &'a [String],
}

#[derive(Debug, Serialize)]
struct VideoFilePayload<'a> {
    name: &'a str,
    data: String,
}

#[derive(Debug, Deserialize)]
pub struct TaskReply {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub output_file: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

pub struct WorkerClient {
    worker_port: u16,
    task_timeout: Duration,
    /// Aggressive-timeout client for liveness probes.
    probe: Client,
    /// Short-timeout client for `/status` polls and capability fetches.
    poll: Client,
    /// No default timeout; task submission sets its own, downloads run
    /// open-ended.
    bulk: Client,
}

impl WorkerClient {
    pub fn new(worker_port: u16, task_timeout: Duration) -> Result<Self, ClientError> {
        Ok(Self {
            worker_port,
            task_timeout,
            probe: Client::builder()
                .timeout(Duration::from_millis(100))
                .build()?,
            poll: Client::builder().timeout(Duration::from_secs(5)).build()?,
            bulk: Client::builder().timeout(None).build()?,
        })
    }

    fn url(&self, worker_ip: &str, path: &str) -> String {
        format!("http://{worker_ip}:{}{path}", self.worker_port)
    }

    /// Liveness probe: expects the literal body `pong`.
    pub fn ping(&self, worker_ip: &str) -> bool {
        let url = self.url(worker_ip, "/ping");
        match self.probe.get(url).send().and_then(|r| r.text()) {
            Ok(body) => body == "pong",
            Err(_) => false,
        }
    }

    /// Execution-slot snapshot as reported by the worker.
    pub fn status(&self, worker_ip: &str) -> Result<Value, ClientError> {
        let url = self.url(worker_ip, "/status");
        Ok(self.poll.get(url).send()?.error_for_status()?.json()?)
    }

    pub fn capabilities(&self, worker_ip: &str) -> Result<Capabilities, ClientError> {
        let url = self.url(worker_ip, "/capabilities");
        Ok(self.poll.get(url).send()?.error_for_status()?.json()?)
    }

    /// Submit one task and block until the worker finishes (or fails) it.
    /// On success returns the worker-local output path from the reply.
    pub fn submit_task(
        &self,
        worker_ip: &str,
        task_id: &str,
        input_file: &Path,
        ffmpeg_args: &[String],
    ) -> Result<String, ClientError> {
        let file_name = input_file
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ClientError::Protocol("input file has no name".to_string()))?;
        let bytes = fs::read(input_file).map_err(|source| ClientError::Input {
            path: input_file.display().to_string(),
            source,
        })?;

        info!(
            task_id,
            worker = worker_ip,
            bytes = bytes.len(),
            file = file_name,
            "submitting task"
        );
        let payload = TaskPayload {
            task_id,
            video_file: VideoFilePayload {
                name: file_name,
                data: BASE64.encode(&bytes),
            },
            ffmpeg_args,
        };
        drop(bytes);

        let response = self
            .bulk
            .post(self.url(worker_ip, "/task"))
            .timeout(self.task_timeout)
            .json(&payload)
            .send()?;

        if response.status() == StatusCode::CONFLICT {
            return Err(ClientError::WorkerBusy);
        }

        let reply: TaskReply = response
            .json()
            .map_err(|err| ClientError::Protocol(format!("unparsable task reply: {err}")))?;
        match reply.status.as_str() {
            "success" => reply
                .output_file
                .ok_or_else(|| ClientError::Protocol("success reply without output_file".into())),
            _ => Err(ClientError::Rejected {
                status: reply.status,
                error: reply.error.unwrap_or_else(|| "unknown error".to_string()),
            }),
        }
    }

    /// Fetch a finished output file into `dest`.
    pub fn download(
        &self,
        worker_ip: &str,
        remote_name: &str,
        dest: &Path,
    ) -> Result<(), ClientError> {
        let url = self.url(worker_ip, "/download");
        let mut response = self
            .bulk
            .get(url)
            .query(&[("file", remote_name)])
            .send()?;
        if !response.status().is_success() {
            return Err(ClientError::Download(format!(
                "worker returned {} for {remote_name}",
                response.status()
            )));
        }
        let mut file = fs::File::create(dest).map_err(|err| {
            ClientError::Download(format!("cannot create {}: {err}", dest.display()))
        })?;
        let bytes = response
            .copy_to(&mut file)
            .map_err(|err| ClientError::Download(format!("transfer failed: {err}")))?;
        debug!(remote_name, bytes, dest = %dest.display(), "download complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_payload_matches_wire_format() {
        let payload = TaskPayload {
            task_id: "task_7",
            video_file: VideoFilePayload {
                name: "in.mp4",
                data: BASE64.encode(b"hello"),
            },
            ffmpeg_args: &["-c:v".to_string(), "libx265".to_string()],
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["task_id"], "task_7");
        assert_eq!(json["video_file"]["name"], "in.mp4");
        assert_eq!(json["video_file"]["data"], "aGVsbG8=");
        assert_eq!(json["ffmpeg_args"][1], "libx265");
    }

    #[test]
    fn task_reply_tolerates_missing_fields() {
        let reply: TaskReply = serde_json::from_str(r#"{"status":"success","output_file":"output_in.mp4"}"#).unwrap();
        assert_eq!(reply.status, "success");
        assert_eq!(reply.output_file.as_deref(), Some("output_in.mp4"));
        assert!(reply.error.is_none());

        let reply: TaskReply = serde_json::from_str(r#"{}"#).unwrap();
        assert_eq!(reply.status, "");
    }

    #[test]
    fn rejection_keeps_both_status_and_error() {
        let err = ClientError::Rejected {
            status: "fail".to_string(),
            error: "FFmpeg returned code 1".to_string(),
        };
        assert_eq!(err.to_string(), "worker reported fail: FFmpeg returned code 1");
    }

    #[test]
    fn ping_on_unroutable_worker_is_false() {
        let client = WorkerClient::new(9, Duration::from_secs(1)).unwrap();
        // Reserved TEST-NET-1 address; the 100 ms probe timeout guarantees a
        // fast negative result.
        assert!(!client.ping("192.0.2.1"));
    }
}
