use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{OrchestratorError, Result};

/// Command-line template used to start a server executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "i64")]
pub enum LaunchMode {
    /// Fixed tuned JVM flags, `-jar Core.jar -nogui`.
    Core = 1,
    /// Fixed tuned JVM flags, launched through an `@argsfile`.
    Modpack = 2,
    /// Permission flags only.
    Basic = 3,
    /// Basic plus the channel-limit fix.
    BasicFix = 4,
    /// Caller-supplied JVM and process args.
    Custom = 5,
}

impl LaunchMode {
    pub const ALL: [LaunchMode; 5] = [
        LaunchMode::Core,
        LaunchMode::Modpack,
        LaunchMode::Basic,
        LaunchMode::BasicFix,
        LaunchMode::Custom,
    ];

    pub fn number(self) -> i64 {
        self as i64
    }

    pub fn label(self) -> &'static str {
        match self {
            LaunchMode::Core => "core",
            LaunchMode::Modpack => "modpack",
            LaunchMode::Basic => "basic",
            LaunchMode::BasicFix => "basic-fix",
            LaunchMode::Custom => "custom",
        }
    }
}

impl TryFrom<i64> for LaunchMode {
    type Error = OrchestratorError;

    fn try_from(value: i64) -> Result<Self> {
        match value {
            1 => Ok(LaunchMode::Core),
            2 => Ok(LaunchMode::Modpack),
            3 => Ok(LaunchMode::Basic),
            4 => Ok(LaunchMode::BasicFix),
            5 => Ok(LaunchMode::Custom),
            other => Err(OrchestratorError::InvalidLaunchMode(other)),
        }
    }
}

impl From<LaunchMode> for i64 {
    fn from(mode: LaunchMode) -> Self {
        mode.number()
    }
}

impl fmt::Display for LaunchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.number(), self.label())
    }
}

/// The "last launch" record: exactly what was passed to the most recent start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchConfig {
    pub server_name: String,
    /// Kept as a raw number so a hand-edited file with a bad mode still loads
    /// and is rejected by [`LaunchConfig::mode`].
    pub launch_mode: i64,
    #[serde(default)]
    pub java_path: Option<String>,
    #[serde(default)]
    pub jvm_args: Option<String>,
    #[serde(default)]
    pub process_args: Option<String>,
}

impl LaunchConfig {
    pub fn new(
        server_name: &str,
        mode: LaunchMode,
        java_path: Option<&str>,
        jvm_args: Option<&str>,
        process_args: Option<&str>,
    ) -> Self {
        Self {
            server_name: server_name.to_string(),
            launch_mode: mode.number(),
            java_path: java_path.map(str::to_string),
            jvm_args: jvm_args.map(str::to_string),
            process_args: process_args.map(str::to_string),
        }
    }

    pub fn mode(&self) -> Result<LaunchMode> {
        LaunchMode::try_from(self.launch_mode)
    }

    pub fn is_valid(&self) -> bool {
        !self.server_name.trim().is_empty() && self.mode().is_ok()
    }
}
