//! 오케스트레이터 에러 타입: 설정 문제와 프로세스 조작 실패를 구분하여
//! 호출자(CLI/원격 API)가 적절한 메시지와 코드를 보여줄 수 있게 합니다.

use std::path::PathBuf;

/// Broad classification used by callers to decide how to report a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Persisted state is missing, unreadable or invalid.
    Configuration,
    /// A process lifecycle or filesystem operation failed.
    Operation,
}

#[derive(thiserror::Error, Debug)]
pub enum OrchestratorError {
    #[error("Server '{0}' not found")]
    ServerNotFound(String),

    #[error("Server '{0}' already exists")]
    ServerExists(String),

    #[error("Group '{0}' not found")]
    GroupNotFound(String),

    #[error("Group '{0}' already exists")]
    GroupExists(String),

    #[error("Task '{0}' not found")]
    TaskNotFound(String),

    #[error("Invalid launch mode: {0}")]
    InvalidLaunchMode(i64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to persist '{path}': {message}")]
    Persistence { path: PathBuf, message: String },

    #[error("Server '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Server '{0}' is not running")]
    NotRunning(String),

    #[error("Failed to launch '{program}': {source}")]
    LaunchFailed {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to send command to '{server}': {message}")]
    CommandFailed { server: String, message: String },

    #[error("Failed to terminate '{server}': {message}")]
    TerminationFailed { server: String, message: String },

    #[error("Cannot modify running server '{0}'")]
    RunningServerLocked(String),

    #[error("Archive contains an unsafe path: {0}")]
    UnsafeArchivePath(String),

    #[error("I/O error on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No ordered startup in progress for group '{0}'")]
    NoOrderedStartup(String),

    #[error("Ordered startup of group '{0}' is already in progress")]
    OrderedStartupInProgress(String),
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

impl OrchestratorError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    pub fn persistence(path: impl Into<PathBuf>, message: impl std::fmt::Display) -> Self {
        Self::Persistence {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ServerNotFound(_)
            | Self::ServerExists(_)
            | Self::GroupNotFound(_)
            | Self::GroupExists(_)
            | Self::TaskNotFound(_)
            | Self::InvalidLaunchMode(_)
            | Self::InvalidConfig(_)
            | Self::Persistence { .. } => ErrorKind::Configuration,
            Self::AlreadyRunning(_)
            | Self::NotRunning(_)
            | Self::LaunchFailed { .. }
            | Self::CommandFailed { .. }
            | Self::TerminationFailed { .. }
            | Self::RunningServerLocked(_)
            | Self::UnsafeArchivePath(_)
            | Self::Io { .. }
            | Self::NoOrderedStartup(_)
            | Self::OrderedStartupInProgress(_) => ErrorKind::Operation,
        }
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ServerNotFound(_) => "SERVER_NOT_FOUND",
            Self::ServerExists(_) => "SERVER_EXISTS",
            Self::GroupNotFound(_) => "GROUP_NOT_FOUND",
            Self::GroupExists(_) => "GROUP_EXISTS",
            Self::TaskNotFound(_) => "TASK_NOT_FOUND",
            Self::InvalidLaunchMode(_) => "INVALID_LAUNCH_MODE",
            Self::InvalidConfig(_) => "INVALID_CONFIG",
            Self::Persistence { .. } => "PERSISTENCE_ERROR",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::NotRunning(_) => "NOT_RUNNING",
            Self::LaunchFailed { .. } => "LAUNCH_FAILED",
            Self::CommandFailed { .. } => "COMMAND_FAILED",
            Self::TerminationFailed { .. } => "TERMINATION_FAILED",
            Self::RunningServerLocked(_) => "SERVER_RUNNING",
            Self::UnsafeArchivePath(_) => "UNSAFE_ARCHIVE_PATH",
            Self::Io { .. } => "IO_ERROR",
            Self::NoOrderedStartup(_) => "NO_ORDERED_STARTUP",
            Self::OrderedStartupInProgress(_) => "ORDERED_STARTUP_IN_PROGRESS",
        }
    }

    /// JSON 에러 응답 생성
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification_matches_taxonomy() {
        assert_eq!(OrchestratorError::ServerNotFound("a".into()).kind(), ErrorKind::Configuration);
        assert_eq!(OrchestratorError::InvalidLaunchMode(9).kind(), ErrorKind::Configuration);
        assert_eq!(OrchestratorError::AlreadyRunning("a".into()).kind(), ErrorKind::Operation);
        assert_eq!(OrchestratorError::UnsafeArchivePath("../x".into()).kind(), ErrorKind::Operation);
    }

    #[test]
    fn json_payload_carries_code_and_message() {
        let err = OrchestratorError::NotRunning("lobby".into());
        let json = err.to_json();
        assert_eq!(json["success"], false);
        assert_eq!(json["error_code"], "NOT_RUNNING");
        assert_eq!(json["error"], "Server 'lobby' is not running");
    }
}
