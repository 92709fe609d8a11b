use serde::{Deserialize, Serialize};

use super::launch::LaunchMode;
use super::server::Server;
use crate::error::Result;

pub const DEFAULT_TRIGGER_KEYWORD: &str = "Done";
pub const DEFAULT_STARTUP_DELAY_MS: u64 = 5_000;

/// 서버 그룹 - 프리셋을 공유하며 함께 시작되는 서버 묶음
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub member_names: Vec<String>,
    #[serde(default)]
    pub ordered_startup: bool,
    /// Console text that marks a member as ready during ordered startup.
    #[serde(default = "default_trigger")]
    pub trigger_keyword: String,
    /// Pause between one member becoming ready and the next launch.
    #[serde(default = "default_delay")]
    pub startup_delay_ms: u64,
    #[serde(default = "default_mode")]
    pub launch_mode: i64,
    #[serde(default)]
    pub preset_jvm_args: Option<String>,
    #[serde(default)]
    pub preset_process_args: Option<String>,
    #[serde(default)]
    pub min_memory: Option<String>,
    #[serde(default)]
    pub max_memory: Option<String>,
}

fn default_trigger() -> String {
    DEFAULT_TRIGGER_KEYWORD.to_string()
}

fn default_delay() -> u64 {
    DEFAULT_STARTUP_DELAY_MS
}

fn default_mode() -> i64 {
    LaunchMode::Core.number()
}

impl Group {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            member_names: Vec::new(),
            ordered_startup: false,
            trigger_keyword: default_trigger(),
            startup_delay_ms: DEFAULT_STARTUP_DELAY_MS,
            launch_mode: default_mode(),
            preset_jvm_args: None,
            preset_process_args: None,
            min_memory: None,
            max_memory: None,
        }
    }

    pub fn mode(&self) -> Result<LaunchMode> {
        LaunchMode::try_from(self.launch_mode)
    }

    pub fn contains(&self, server_name: &str) -> bool {
        self.member_names.iter().any(|m| m == server_name)
    }

    /// Adds a member once; returns false if it was already present.
    pub fn add_member(&mut self, server_name: &str) -> bool {
        if self.contains(server_name) {
            return false;
        }
        self.member_names.push(server_name.to_string());
        true
    }

    pub fn remove_member(&mut self, server_name: &str) -> bool {
        let before = self.member_names.len();
        self.member_names.retain(|m| m != server_name);
        before != self.member_names.len()
    }

    /// `-Xms`/`-Xmx` from the group's memory presets, then the group's preset
    /// JVM args, or the server's own defaults when the group has none.
    pub fn build_jvm_args(&self, server: &Server) -> String {
        let mut parts: Vec<String> = Vec::new();
        if let Some(min) = non_blank(&self.min_memory) {
            parts.push(format!("-Xms{}", min));
        }
        if let Some(max) = non_blank(&self.max_memory) {
            parts.push(format!("-Xmx{}", max));
        }
        match non_blank(&self.preset_jvm_args) {
            Some(preset) => parts.push(preset.to_string()),
            None => {
                if let Some(own) = non_blank(&server.default_jvm_args) {
                    parts.push(own.to_string());
                }
            }
        }
        parts.join(" ")
    }

    pub fn build_process_args(&self, server: &Server) -> String {
        non_blank(&self.preset_process_args)
            .or_else(|| non_blank(&server.default_process_args))
            .unwrap_or_default()
            .to_string()
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}
