//! Static capability probing: which encoders the local ffmpeg build offers.

use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Advertised ffmpeg features, immutable after probe. The controller
/// deserializes the same shape from `GET /capabilities`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Capabilities {
    pub ffmpeg_installed: bool,
    pub ffmpeg_version: String,
    pub encoders: Vec<String>,
    pub nvenc_supported: bool,
}

impl Capabilities {
    pub fn unavailable() -> Self {
        Self {
            ffmpeg_installed: false,
            ffmpeg_version: String::new(),
            encoders: Vec::new(),
            nvenc_supported: false,
        }
    }
}

/// Run `ffmpeg -version` and `ffmpeg -encoders` once and derive the
/// capability descriptor. A missing or broken binary yields the
/// "unavailable" descriptor rather than an error: workers without ffmpeg
/// are still valid cluster members, just useless ones.
pub fn probe(ffmpeg_path: &str) -> Capabilities {
    let version_output = match Command::new(ffmpeg_path).arg("-version").output() {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout).into_owned(),
        Ok(output) => {
            warn!(ffmpeg_path, code = ?output.status.code(), "ffmpeg -version failed");
            return Capabilities::unavailable();
        }
        Err(err) => {
            warn!(ffmpeg_path, %err, "ffmpeg binary not found");
            return Capabilities::unavailable();
        }
    };

    let ffmpeg_version = parse_version_output(&version_output).unwrap_or_default();

    let encoders = match Command::new(ffmpeg_path).arg("-encoders").output() {
        Ok(output) if output.status.success() => {
            parse_encoders_output(&String::from_utf8_lossy(&output.stdout))
        }
        Ok(_) | Err(_) => {
            warn!(ffmpeg_path, "ffmpeg -encoders failed; encoder list unknown");
            Vec::new()
        }
    };

    let nvenc_supported = encoders.iter().any(|e| e == "h264_nvenc" || e == "hevc_nvenc");
    debug!(
        version = %ffmpeg_version,
        encoder_count = encoders.len(),
        nvenc_supported,
        "capability probe complete"
    );

    Capabilities {
        ffmpeg_installed: true,
        ffmpeg_version,
        encoders,
        nvenc_supported,
    }
}

/// Extract the version token from the first line of `ffmpeg -version`
/// output, e.g. `ffmpeg version 7.0-full_build-www.gyan.dev ...`.
pub fn parse_version_output(stdout: &str) -> Option<String> {
    let first = stdout.lines().next()?;
    let rest = first.trim().strip_prefix("ffmpeg version ")?;
    rest.split_whitespace().next().map(str::to_string)
}

/// Extract encoder names from `ffmpeg -encoders` output.
///
/// Data rows look like ` V....D libx264  H.264 / AVC ...`: a six-character
/// flags column followed by the encoder name. Legend rows (` V..... = Video`)
/// and the separator are skipped.
pub fn parse_encoders_output(stdout: &str) -> Vec<String> {
    let mut encoders = Vec::new();
    for line in stdout.lines() {
        let mut parts = line.split_whitespace();
        let (Some(flags), Some(name)) = (parts.next(), parts.next()) else {
            continue;
        };
        if flags.len() == 6
            && flags.chars().all(|c| "VASFXBD.".contains(c))
            && name != "="
        {
            encoders.push(name.to_string());
        }
    }
    encoders
}
