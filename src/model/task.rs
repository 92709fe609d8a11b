use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Operation a scheduled task performs against a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskType {
    StartServer,
    StopServer,
    SendCommand,
    CreateBackup,
    RestartServer,
}

impl TaskType {
    pub fn wire_name(self) -> &'static str {
        match self {
            TaskType::StartServer => "START_SERVER",
            TaskType::StopServer => "STOP_SERVER",
            TaskType::SendCommand => "SEND_COMMAND",
            TaskType::CreateBackup => "CREATE_BACKUP",
            TaskType::RestartServer => "RESTART_SERVER",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

impl FromStr for TaskType {
    type Err = String;

    /// Accepts the short CLI words as well as the wire names.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "start" | "start_server" => Ok(TaskType::StartServer),
            "stop" | "stop_server" => Ok(TaskType::StopServer),
            "command" | "send_command" => Ok(TaskType::SendCommand),
            "backup" | "create_backup" => Ok(TaskType::CreateBackup),
            "restart" | "restart_server" => Ok(TaskType::RestartServer),
            other => Err(format!("unknown task type '{}'", other)),
        }
    }
}

/// A persisted unit of scheduled work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    /// Assigned by the scheduler on registration; empty until then.
    #[serde(default)]
    pub task_id: String,
    pub task_name: String,
    pub server_name: String,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(with = "datetime_format")]
    pub scheduled_time: NaiveDateTime,
    #[serde(with = "datetime_format")]
    pub created_time: NaiveDateTime,
    #[serde(default)]
    pub recurring: bool,
    /// Stored for reference only; recurrence is a plain "has the time passed" poll.
    #[serde(default)]
    pub cron_expression: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub task_type: TaskType,
}

fn default_enabled() -> bool {
    true
}

impl ScheduledTask {
    pub fn new(
        task_name: &str,
        server_name: &str,
        task_type: TaskType,
        scheduled_time: NaiveDateTime,
    ) -> Self {
        Self {
            task_id: String::new(),
            task_name: task_name.to_string(),
            server_name: server_name.to_string(),
            command: None,
            scheduled_time,
            created_time: crate::utils::now_local(),
            recurring: false,
            cron_expression: None,
            enabled: true,
            task_type,
        }
    }

    pub fn with_command(mut self, command: &str) -> Self {
        self.command = Some(command.to_string());
        self
    }

    pub fn recurring(mut self, expression: Option<&str>) -> Self {
        self.recurring = true;
        self.cron_expression = expression.map(str::to_string);
        self
    }

    /// Whether a reloaded task should be armed again.
    pub fn should_rearm(&self, now: NaiveDateTime) -> bool {
        if self.recurring {
            self.enabled
        } else {
            self.enabled && self.scheduled_time > now
        }
    }
}

/// `yyyy-MM-dd HH:mm:ss` (de)serialization for task timestamps.
pub mod datetime_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&raw, FORMAT).map_err(serde::de::Error::custom)
    }

    pub fn parse(raw: &str) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(raw.trim(), FORMAT).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(raw: &str) -> NaiveDateTime {
        datetime_format::parse(raw).unwrap()
    }

    #[test]
    fn test_task_type_parsing() {
        assert_eq!("start".parse::<TaskType>().unwrap(), TaskType::StartServer);
        assert_eq!("BACKUP".parse::<TaskType>().unwrap(), TaskType::CreateBackup);
        assert_eq!("restart_server".parse::<TaskType>().unwrap(), TaskType::RestartServer);
        assert!("reboot".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_json_shape() {
        let task = ScheduledTask::new("nightly", "lobby", TaskType::SendCommand, at("2024-05-01 03:00:00"))
            .with_command("save-all");
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["taskType"], "SEND_COMMAND");
        assert_eq!(json["scheduledTime"], "2024-05-01 03:00:00");
        assert_eq!(json["serverName"], "lobby");
        assert_eq!(json["command"], "save-all");

        let back: ScheduledTask = serde_json::from_value(json).unwrap();
        assert_eq!(back, task);
    }

    #[test]
    fn test_rejects_malformed_time() {
        let raw = r#"{"taskName":"t","serverName":"s","scheduledTime":"2024/05/01",
                      "createdTime":"2024-05-01 00:00:00","taskType":"STOP_SERVER"}"#;
        assert!(serde_json::from_str::<ScheduledTask>(raw).is_err());
    }

    #[test]
    fn test_should_rearm() {
        let now = at("2024-05-01 12:00:00");
        let past = ScheduledTask::new("p", "s", TaskType::StopServer, now - Duration::hours(1));
        let future = ScheduledTask::new("f", "s", TaskType::StopServer, now + Duration::hours(1));
        assert!(!past.should_rearm(now));
        assert!(future.should_rearm(now));

        let recurring = past.clone().recurring(Some("0 3 * * *"));
        assert!(recurring.should_rearm(now));

        let mut disabled = recurring;
        disabled.enabled = false;
        assert!(!disabled.should_rearm(now));
    }
}
