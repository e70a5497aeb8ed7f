//! Layered configuration: built-in defaults, then `TC_*` environment
//! variables, then an optional JSON config file, with CLI flags applied last
//! by the binaries.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClusterConfig {
    pub control_port: u16,
    pub data_port: u16,
    pub discovery_port: u16,
    pub worker_port: u16,

    /// Controller-side idle re-broadcast cadence, seconds.
    pub discovery_interval: u64,
    /// Worker-side heartbeat cadence, seconds.
    pub heartbeat_interval: u64,

    pub work_dir: PathBuf,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,

    /// Upper bound for a single `/task` POST, seconds.
    pub task_timeout_secs: u64,

    /// Override for the advertised LAN address. When unset the address is
    /// resolved heuristically (see `discovery::resolve_local_ip`).
    pub advertise_ip: Option<String>,

    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            control_port: 55555,
            data_port: 55556,
            discovery_port: 55557,
            worker_port: 9000,
            discovery_interval: 10,
            heartbeat_interval: 10,
            work_dir: PathBuf::from("."),
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
            task_timeout_secs: 3600,
            advertise_ip: None,
            log_level: "info".to_string(),
            log_file: None,
        }
    }
}

/// Sparse form used for the JSON config file: only the keys present in the
/// file override the environment-derived base.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ConfigOverlay {
    control_port: Option<u16>,
    data_port: Option<u16>,
    discovery_port: Option<u16>,
    worker_port: Option<u16>,
    discovery_interval: Option<u64>,
    heartbeat_interval: Option<u64>,
    work_dir: Option<PathBuf>,
    ffmpeg_path: Option<String>,
    ffprobe_path: Option<String>,
    task_timeout_secs: Option<u64>,
    advertise_ip: Option<String>,
    log_level: Option<String>,
    log_file: Option<PathBuf>,
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, raw, "ignoring unparsable environment override");
            None
        }
    }
}

impl ClusterConfig {
    /// Read `TC_*` environment variables over the built-in defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            control_port: env_parsed("TC_CONTROL_PORT").unwrap_or(defaults.control_port),
            data_port: env_parsed("TC_DATA_PORT").unwrap_or(defaults.data_port),
            discovery_port: env_parsed("TC_DISCOVERY_PORT").unwrap_or(defaults.discovery_port),
            worker_port: env_parsed("TC_WORKER_PORT").unwrap_or(defaults.worker_port),
            discovery_interval: env_parsed("TC_DISCOVERY_INTERVAL")
                .unwrap_or(defaults.discovery_interval),
            heartbeat_interval: env_parsed("TC_HEARTBEAT_INTERVAL")
                .unwrap_or(defaults.heartbeat_interval),
            work_dir: env::var_os("TC_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            ffmpeg_path: env::var("TC_FFMPEG_PATH").unwrap_or(defaults.ffmpeg_path),
            ffprobe_path: env::var("TC_FFPROBE_PATH").unwrap_or(defaults.ffprobe_path),
            task_timeout_secs: env_parsed("TC_TASK_TIMEOUT").unwrap_or(defaults.task_timeout_secs),
            advertise_ip: env::var("TC_ADVERTISE_IP").ok(),
            log_level: env::var("TC_LOG_LEVEL").unwrap_or(defaults.log_level),
            log_file: env::var_os("TC_LOG_FILE").map(PathBuf::from),
        }
    }

    /// Built-in defaults with a JSON config file applied on top. Keys
    /// absent from the file keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.apply_file(path)?;
        Ok(config)
    }

    /// Load the environment-derived config and apply a JSON config file on
    /// top of it when one is given. Keys absent from the file keep their
    /// environment/default values.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = Self::from_env();
        if let Some(path) = config_path {
            config.apply_file(path)?;
        }
        Ok(config)
    }

    fn apply_file(&mut self, path: &Path) -> Result<()> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let overlay: ConfigOverlay = serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        self.apply_overlay(overlay);
        Ok(())
    }

    fn apply_overlay(&mut self, overlay: ConfigOverlay) {
        macro_rules! take {
            ($field:ident) => {
                if let Some(value) = overlay.$field {
                    self.$field = value;
                }
            };
        }
        take!(control_port);
        take!(data_port);
        take!(discovery_port);
        take!(worker_port);
        take!(discovery_interval);
        take!(heartbeat_interval);
        take!(work_dir);
        take!(ffmpeg_path);
        take!(ffprobe_path);
        take!(task_timeout_secs);
        take!(log_level);
        if overlay.advertise_ip.is_some() {
            self.advertise_ip = overlay.advertise_ip;
        }
        if overlay.log_file.is_some() {
            self.log_file = overlay.log_file;
        }
    }

    /// Create the work directory. A failure here is fatal for the affected
    /// process: the worker cannot stage files, the controller cannot scan.
    pub fn ensure_work_dir(&self) -> Result<()> {
        fs::create_dir_all(&self.work_dir).with_context(|| {
            format!("work directory {} is not writable", self.work_dir.display())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_ports() {
        let config = ClusterConfig::default();
        assert_eq!(config.control_port, 55555);
        assert_eq!(config.data_port, 55556);
        assert_eq!(config.discovery_port, 55557);
        assert_eq!(config.worker_port, 9000);
        assert_eq!(config.discovery_interval, 10);
        assert_eq!(config.heartbeat_interval, 10);
        assert_eq!(config.ffmpeg_path, "ffmpeg");
        assert_eq!(config.task_timeout_secs, 3600);
    }

    #[test]
    fn file_overlay_overrides_only_present_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        fs::write(
            &path,
            r#"{"worker_port": 9100, "ffmpeg_path": "/opt/ffmpeg/bin/ffmpeg"}"#,
        )
        .unwrap();

        let mut config = ClusterConfig::default();
        config.apply_file(&path).unwrap();

        assert_eq!(config.worker_port, 9100);
        assert_eq!(config.ffmpeg_path, "/opt/ffmpeg/bin/ffmpeg");
        // Untouched keys retain their defaults.
        assert_eq!(config.discovery_port, 55557);
        assert_eq!(config.work_dir, PathBuf::from("."));
    }

    #[test]
    fn from_file_builds_on_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cluster.json");
        fs::write(&path, r#"{"discovery_port": 56000}"#).unwrap();

        let config = ClusterConfig::from_file(&path).unwrap();
        assert_eq!(config.discovery_port, 56000);
        assert_eq!(config.worker_port, 9000);

        assert!(ClusterConfig::from_file(dir.path().join("absent.json").as_path()).is_err());
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{not json").unwrap();

        let mut config = ClusterConfig::default();
        assert!(config.apply_file(&path).is_err());
    }

    #[test]
    fn ensure_work_dir_creates_nested_directories() {
        let dir = tempfile::tempdir().unwrap();
        let config = ClusterConfig {
            work_dir: dir.path().join("a/b/worker_files"),
            ..ClusterConfig::default()
        };
        config.ensure_work_dir().unwrap();
        assert!(config.work_dir.is_dir());
    }
}
