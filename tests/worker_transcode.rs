//! Execution-path tests driven by mock ffmpeg/ffprobe shell scripts.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use transcoder_cluster::worker::transcode::{
    TranscodeError, probe_duration_seconds, run_ffmpeg,
};
use transcoder_cluster::worker::{ExecutionSlot, SlotStatus};

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    let mut permissions = fs::metadata(&path).unwrap().permissions();
    permissions.set_mode(0o755);
    fs::set_permissions(&path, permissions).unwrap();
    path
}

fn processing_slot() -> ExecutionSlot {
    let slot = ExecutionSlot::new();
    slot.try_begin_receiving("in.mp4").unwrap();
    slot.mark_processing();
    slot
}

#[test]
fn successful_transcode_writes_output_and_mirrors_progress() {
    let dir = tempfile::tempdir().unwrap();
    // Emits two progress lines on stderr, writes the output file (the last
    // argument), and exits 0, matching the stderr grammar of a cooperative
    // ffmpeg.
    let ffmpeg = write_script(
        dir.path(),
        "mock-ffmpeg",
        "#!/bin/sh\n\
         for last; do :; done\n\
         echo 'frame=  100 fps=50 time=00:00:02.00 bitrate=1k speed=2x' 1>&2\n\
         echo 'frame=  250 fps=50 time=00:00:05.00 bitrate=1k speed=2x' 1>&2\n\
         echo transcoded-bytes > \"$last\"\n\
         exit 0\n",
    );

    let input = dir.path().join("in.mp4");
    let output = dir.path().join("output_in.mp4");
    fs::write(&input, b"raw").unwrap();

    let slot = processing_slot();
    run_ffmpeg(
        ffmpeg.to_str().unwrap(),
        &input,
        &output,
        &["-c:v".to_string(), "libx265".to_string()],
        Some(10.0),
        &slot,
    )
    .unwrap();

    assert!(output.exists());
    assert!(fs::metadata(&output).unwrap().len() > 0);
    // 5s of 10s, floored, never 100 while processing.
    assert_eq!(slot.snapshot().progress, 50);

    slot.mark_completed();
    let snapshot = slot.snapshot();
    assert_eq!(snapshot.status, SlotStatus::Completed);
    assert_eq!(snapshot.progress, 100);
}

#[test]
fn nonzero_exit_surfaces_the_return_code() {
    let dir = tempfile::tempdir().unwrap();
    let ffmpeg = write_script(
        dir.path(),
        "mock-ffmpeg-fail",
        "#!/bin/sh\n\
         echo 'in.mp4: Invalid data found when processing input' 1>&2\n\
         exit 3\n",
    );

    let input = dir.path().join("in.mp4");
    fs::write(&input, b"raw").unwrap();

    let slot = processing_slot();
    let err = run_ffmpeg(
        ffmpeg.to_str().unwrap(),
        &input,
        &dir.path().join("output_in.mp4"),
        &[],
        Some(10.0),
        &slot,
    )
    .unwrap_err();

    match err {
        TranscodeError::Ffmpeg(code) => {
            assert_eq!(code, 3);
            assert_eq!(err.to_string(), "FFmpeg returned code 3");
        }
        other => panic!("expected ffmpeg failure, got {other:?}"),
    }
}

#[test]
fn unknown_duration_leaves_progress_at_zero() {
    let dir = tempfile::tempdir().unwrap();
    let ffmpeg = write_script(
        dir.path(),
        "mock-ffmpeg-quiet",
        "#!/bin/sh\n\
         for last; do :; done\n\
         echo 'frame=  100 time=00:00:09.00 bitrate=1k' 1>&2\n\
         echo done > \"$last\"\n\
         exit 0\n",
    );

    let input = dir.path().join("in.mp4");
    fs::write(&input, b"raw").unwrap();

    let slot = processing_slot();
    run_ffmpeg(
        ffmpeg.to_str().unwrap(),
        &input,
        &dir.path().join("output_in.mp4"),
        &[],
        None,
        &slot,
    )
    .unwrap();

    assert_eq!(slot.snapshot().progress, 0);
}

#[test]
fn stop_request_aborts_a_running_transcode() {
    let dir = tempfile::tempdir().unwrap();
    let ffmpeg = write_script(
        dir.path(),
        "mock-ffmpeg-hang",
        "#!/bin/sh\n\
         sleep 30\n\
         exit 0\n",
    );

    let input = dir.path().join("in.mp4");
    let output = dir.path().join("output_in.mp4");
    fs::write(&input, b"raw").unwrap();

    let slot = Arc::new(processing_slot());
    let stopper = {
        let slot = slot.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            slot.request_stop();
        })
    };

    let started = Instant::now();
    let err = run_ffmpeg(
        ffmpeg.to_str().unwrap(),
        &input,
        &output,
        &[],
        None,
        &slot,
    )
    .unwrap_err();
    stopper.join().unwrap();

    assert!(matches!(err, TranscodeError::Stopped));
    // Well under the script's 30s: the grace window plus the kill.
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!output.exists(), "partial output must be cleaned up");
}

#[test]
fn duration_probe_reads_ffprobe_stdout() {
    let dir = tempfile::tempdir().unwrap();
    let ffprobe = write_script(
        dir.path(),
        "mock-ffprobe",
        "#!/bin/sh\necho 12.500000\n",
    );
    let input = dir.path().join("in.mp4");
    fs::write(&input, b"raw").unwrap();

    let duration = probe_duration_seconds(ffprobe.to_str().unwrap(), &input).unwrap();
    assert!((duration - 12.5).abs() < 1e-9);
}

#[test]
fn failing_probe_is_an_error_not_a_panic() {
    let dir = tempfile::tempdir().unwrap();
    let ffprobe = write_script(
        dir.path(),
        "mock-ffprobe-fail",
        "#!/bin/sh\necho 'no such stream' 1>&2\nexit 1\n",
    );
    let input = dir.path().join("in.mp4");
    fs::write(&input, b"raw").unwrap();

    assert!(probe_duration_seconds(ffprobe.to_str().unwrap(), &input).is_err());
    assert!(probe_duration_seconds("/nonexistent/ffprobe", &input).is_err());
}
