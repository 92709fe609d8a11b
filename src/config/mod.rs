use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OrchestratorError, Result};

/// Fixed name of the executable inside every server directory.
pub const CORE_JAR: &str = "Core.jar";
/// Sub-directory of a server that holds the active world.
pub const WORLD_DIR: &str = "world";
/// Default location of the daemon configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/global.toml";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GlobalConfig {
    /// Root directory every relative path below is resolved against.
    pub data_dir: PathBuf,
    pub cores_dir: PathBuf,
    pub servers_dir: PathBuf,
    pub maps_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub servers_file: PathBuf,
    pub last_launch_file: PathBuf,
    pub tasks_file: PathBuf,
    pub groups_file: PathBuf,
    /// Explicit java executable; ignored when missing or not executable.
    pub java_path: Option<String>,
    pub log_level: Option<String>,
    pub log_buffer_size: usize,
    /// Regex with a `level` capture group used to classify console lines.
    pub log_pattern: Option<String>,
    pub scheduler: SchedulerConfig,
    pub groups: GroupConfig,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 반복 작업 폴링 간격 (초)
    pub poll_interval_secs: u64,
    /// 재시작 작업에서 정지 완료를 기다리는 최대 시간 (초)
    pub restart_wait_secs: u64,
    pub default_launch_mode: u8,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct GroupConfig {
    /// Upper bound on waiting for a member's trigger keyword.
    pub readiness_timeout_ms: u64,
    pub stop_timeout_secs: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("."),
            cores_dir: PathBuf::from("cores"),
            servers_dir: PathBuf::from("servers"),
            maps_dir: PathBuf::from("maps"),
            backups_dir: PathBuf::from("backups"),
            servers_file: PathBuf::from("serverList.json"),
            last_launch_file: PathBuf::from("lastLaunch.json"),
            tasks_file: PathBuf::from("scheduled_tasks.json"),
            groups_file: PathBuf::from("server_groups.json"),
            java_path: None,
            log_level: None,
            log_buffer_size: 10_000,
            log_pattern: None,
            scheduler: SchedulerConfig::default(),
            groups: GroupConfig::default(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            restart_wait_secs: 5,
            default_launch_mode: 1,
        }
    }
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            readiness_timeout_ms: 10_000,
            stop_timeout_secs: 30,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn restart_wait(&self) -> Duration {
        Duration::from_secs(self.restart_wait_secs)
    }
}

impl GroupConfig {
    pub fn readiness_timeout(&self) -> Duration {
        Duration::from_millis(self.readiness_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

impl GlobalConfig {
    /// Load the config file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| OrchestratorError::io(path, e))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))
    }

    /// Defaults rooted at `data_dir`; handy for tests and embedding.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir.join(path)
        }
    }

    pub fn cores_path(&self) -> PathBuf {
        self.resolve(&self.cores_dir)
    }

    pub fn servers_path(&self) -> PathBuf {
        self.resolve(&self.servers_dir)
    }

    pub fn maps_path(&self) -> PathBuf {
        self.resolve(&self.maps_dir)
    }

    pub fn backups_path(&self) -> PathBuf {
        self.resolve(&self.backups_dir)
    }

    pub fn servers_file_path(&self) -> PathBuf {
        self.resolve(&self.servers_file)
    }

    pub fn last_launch_file_path(&self) -> PathBuf {
        self.resolve(&self.last_launch_file)
    }

    pub fn tasks_file_path(&self) -> PathBuf {
        self.resolve(&self.tasks_file)
    }

    pub fn groups_file_path(&self) -> PathBuf {
        self.resolve(&self.groups_file)
    }

    /// Working directory assigned to a newly created server.
    pub fn server_dir(&self, name: &str) -> PathBuf {
        self.servers_path().join(name)
    }
}
