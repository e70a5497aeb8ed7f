//! Driving the external ffmpeg binary and deriving live progress from its
//! stderr stream.

use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{Receiver, RecvTimeoutError, channel};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::slot::ExecutionSlot;

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("FFmpeg returned code {0}")]
    Ffmpeg(i32),
    #[error("transcode aborted by worker shutdown")]
    Stopped,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// `time=HH:MM:SS.ss` as emitted on ffmpeg's periodic stderr status lines.
static PROGRESS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"time=(\d+):(\d+):([\d.]+)").expect("progress regex"));

/// Parse the elapsed transcode position from one stderr line.
pub fn parse_progress_seconds(line: &str) -> Option<f64> {
    let captures = PROGRESS_RE.captures(line)?;
    let hours: f64 = captures[1].parse().ok()?;
    let minutes: f64 = captures[2].parse().ok()?;
    let seconds: f64 = captures[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Map elapsed seconds to a whole percentage, clamped to 0..=99 so a task
/// never reads complete before ffmpeg actually exits.
pub fn progress_percent(elapsed_seconds: f64, duration_seconds: f64) -> u8 {
    if !duration_seconds.is_finite() || duration_seconds <= 0.0 {
        return 0;
    }
    let ratio = (elapsed_seconds / duration_seconds).clamp(0.0, 1.0);
    ((ratio * 100.0).floor() as u8).min(99)
}

/// Probe the container duration in seconds via ffprobe. Any failure leaves
/// progress at zero until the transcode completes.
pub fn probe_duration_seconds(ffprobe_path: &str, source: &Path) -> Result<f64> {
    let output = Command::new(ffprobe_path)
        .arg("-v")
        .arg("error")
        .arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("format=duration")
        .arg("-of")
        .arg("default=nw=1:nk=1")
        .arg(source.as_os_str())
        .output()
        .with_context(|| format!("failed to run ffprobe for duration on {}", source.display()))?;

    if !output.status.success() {
        anyhow::bail!(
            "ffprobe failed for {}: {}",
            source.display(),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let first = stdout.lines().next().unwrap_or_default().trim();
    Ok(first.parse().unwrap_or(0.0))
}

/// Forwards ffmpeg stderr lines to the driving loop without letting a quiet
/// encoder block shutdown checks.
struct StderrPump {
    rx: Receiver<String>,
    handle: Option<JoinHandle<()>>,
}

impl StderrPump {
    fn spawn(child: &mut Child) -> Self {
        let (tx, rx) = channel();
        let stderr = child.stderr.take();
        let handle = thread::Builder::new()
            .name("tc-ffmpeg-stderr".into())
            .spawn(move || {
                let Some(stderr) = stderr else { return };
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) => {
                            if tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
            })
            .ok();
        Self { rx, handle }
    }

    fn recv_timeout(&self, timeout: Duration) -> Option<String> {
        match self.rx.recv_timeout(timeout) {
            Ok(line) => Some(line),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Consume whatever the pump produced between the child exiting and us
    /// noticing, so trailing progress lines still count.
    fn drain<F: FnMut(String)>(&self, mut handle_line: F) {
        while let Ok(line) = self.rx.try_recv() {
            handle_line(line);
        }
    }

    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Ask ffmpeg to quit gracefully, give it a short grace window, then kill.
fn terminate_child(child: &mut Child, stdin: &mut Option<std::process::ChildStdin>) {
    if let Some(stdin) = stdin.as_mut() {
        let _ = stdin.write_all(b"q\n");
        let _ = stdin.flush();
    }
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if matches!(child.try_wait(), Ok(Some(_))) {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    let _ = child.kill();
    let _ = child.wait();
}

/// Run `ffmpeg -y -i <input> <args...> <output>`, mirroring progress into
/// the execution slot as stderr lines arrive.
pub fn run_ffmpeg(
    ffmpeg_path: &str,
    input: &Path,
    output: &Path,
    ffmpeg_args: &[String],
    duration_seconds: Option<f64>,
    slot: &ExecutionSlot,
) -> Result<(), TranscodeError> {
    let mut command = Command::new(ffmpeg_path);
    command.arg("-y").arg("-i").arg(input);
    command.args(ffmpeg_args);
    command.arg(output);

    info!(
        input = %input.display(),
        output = %output.display(),
        args = ?ffmpeg_args,
        "starting transcode"
    );

    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("failed to spawn ffmpeg for {}", input.display()))?;

    let mut child_stdin = child.stdin.take();
    let mut pump = StderrPump::spawn(&mut child);
    let poll = Duration::from_millis(100);
    let mut last_percent: Option<u8> = None;

    let handle_line = |line: String, last_percent: &mut Option<u8>| {
        let Some(elapsed) = parse_progress_seconds(&line) else {
            return;
        };
        let Some(duration) = duration_seconds else {
            return;
        };
        let percent = progress_percent(elapsed, duration);
        if *last_percent != Some(percent) && slot.set_progress(percent) {
            debug!(percent, "transcode progress");
        }
        *last_percent = Some(percent);
    };

    let status = loop {
        if slot.stop_requested() {
            warn!(input = %input.display(), "stop requested, terminating ffmpeg");
            terminate_child(&mut child, &mut child_stdin);
            pump.join();
            let _ = std::fs::remove_file(output);
            return Err(TranscodeError::Stopped);
        }

        if let Some(line) = pump.recv_timeout(poll) {
            handle_line(line, &mut last_percent);
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                // Join first: the pump hits EOF once the child is gone, so
                // after the join every trailing line is in the channel.
                pump.join();
                pump.drain(|line| handle_line(line, &mut last_percent));
                break status;
            }
            Ok(None) => {}
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                pump.join();
                return Err(TranscodeError::Other(
                    anyhow::Error::new(err).context("failed to poll ffmpeg"),
                ));
            }
        }
    };

    if status.success() {
        info!(output = %output.display(), "transcode complete");
        Ok(())
    } else {
        let code = status.code().unwrap_or(-1);
        warn!(code, input = %input.display(), "ffmpeg exited with failure");
        Err(TranscodeError::Ffmpeg(code))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_line_parses_hms_timestamp() {
        let line = "frame= 2045 fps=120 q=28.0 size=    4096KiB time=00:01:25.36 bitrate=...";
        let seconds = parse_progress_seconds(line).unwrap();
        assert!((seconds - 85.36).abs() < 1e-9);
    }

    #[test]
    fn lines_without_timestamp_are_ignored() {
        assert_eq!(parse_progress_seconds("Press [q] to stop, [?] for help"), None);
        assert_eq!(parse_progress_seconds(""), None);
        // A bare `time=` with no sexagesimal body must not match.
        assert_eq!(parse_progress_seconds("time=N/A bitrate=N/A"), None);
    }

    #[test]
    fn long_timestamps_parse_beyond_an_hour() {
        let seconds = parse_progress_seconds("time=01:02:03.50 speed=1x").unwrap();
        assert!((seconds - 3723.5).abs() < 1e-9);
    }

    #[test]
    fn percent_is_floored_and_capped_at_99() {
        assert_eq!(progress_percent(0.0, 100.0), 0);
        assert_eq!(progress_percent(49.9, 100.0), 49);
        assert_eq!(progress_percent(99.99, 100.0), 99);
        // Elapsed may legitimately overshoot a rough container duration.
        assert_eq!(progress_percent(150.0, 100.0), 99);
    }

    #[test]
    fn percent_without_duration_stays_zero() {
        assert_eq!(progress_percent(10.0, 0.0), 0);
        assert_eq!(progress_percent(10.0, f64::NAN), 0);
        assert_eq!(progress_percent(10.0, -5.0), 0);
    }
}
