pub mod managed_process;

use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub use managed_process::{
    ConsoleLine, ExitInfo, LogLevel, LogLine, LogSource, ManagedProcess, ProcessSpec,
    DEFAULT_LOG_BUFFER,
};
use managed_process::SpawnContext;

use crate::error::Result;

/// Text sent to a server's console to request a graceful shutdown.
pub const STOP_COMMAND: &str = "stop";

/// Upper bound on waiting for the OS to confirm a forced kill.
const KILL_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

/// Spawns server processes and drives their stdin and termination.
///
/// Stateless with respect to *which* servers run; the active registry lives
/// in the orchestrator. All processes share one console sink.
pub struct ProcessSupervisor {
    ctx: SpawnContext,
}

impl ProcessSupervisor {
    pub fn new(log_buffer_size: usize, log_pattern: Option<&str>) -> Self {
        // Compile log pattern regex once (shared across every reader)
        let log_regex = log_pattern.and_then(|pat| match Regex::new(pat) {
            Ok(re) => Some(Arc::new(re)),
            Err(e) => {
                tracing::warn!("Invalid log_pattern '{}': {}, falling back to default", pat, e);
                None
            }
        });
        let (console_tx, _) = broadcast::channel(4096);
        Self {
            ctx: SpawnContext {
                log_buffer_size,
                log_regex,
                console_tx,
            },
        }
    }

    pub async fn start(&self, spec: ProcessSpec) -> Result<Arc<ManagedProcess>> {
        tracing::info!(
            "Launching '{}' in {}: {}",
            spec.server,
            spec.working_dir.display(),
            spec.command_line()
        );
        let process = ManagedProcess::spawn(spec, &self.ctx).await?;
        tracing::info!("Server '{}' started with PID {}", process.server, process.pid);
        Ok(Arc::new(process))
    }

    pub async fn send_command(&self, process: &ManagedProcess, text: &str) -> Result<()> {
        process.send_command(text).await?;
        tracing::debug!("Sent '{}' to '{}'", text, process.server);
        Ok(())
    }

    /// Ask the server to stop; escalate to a kill if the command cannot be
    /// delivered. Does not wait for a graceful exit.
    pub async fn stop_graceful(&self, process: &ManagedProcess) -> Result<()> {
        match process.send_command(STOP_COMMAND).await {
            Ok(()) => {
                tracing::info!("Stop command sent to '{}'", process.server);
                Ok(())
            }
            Err(e) => {
                tracing::warn!("Graceful stop of '{}' failed ({}), forcing", process.server, e);
                self.force_stop(process).await.map(|_| ())
            }
        }
    }

    pub async fn force_stop(&self, process: &ManagedProcess) -> Result<ExitInfo> {
        tracing::info!("Force stopping '{}' (PID {})", process.server, process.pid);
        let exit = process.kill(KILL_CONFIRM_TIMEOUT).await?;
        tracing::info!("'{}' terminated with {}", process.server, exit);
        Ok(exit)
    }

    pub async fn wait_for_exit(&self, process: &ManagedProcess) -> ExitInfo {
        process.wait_for_exit().await
    }

    /// Every line from every process, tagged with its server name.
    pub fn subscribe_console(&self) -> broadcast::Receiver<ConsoleLine> {
        self.ctx.console_tx.subscribe()
    }
}

impl Default for ProcessSupervisor {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_BUFFER, None)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::OrchestratorError;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// Shell script that behaves like a tiny console server.
    fn fake_server(dir: &Path) -> String {
        let path = dir.join("fake-server.sh");
        std::fs::write(
            &path,
            "#!/bin/sh\necho \"args: $*\"\necho \"Done (0.1s)!\"\n\
             while read line; do\n  echo \"got: $line\"\n  \
             if [ \"$line\" = \"stop\" ]; then exit 0; fi\ndone\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    fn spec(dir: &Path, program: String) -> ProcessSpec {
        ProcessSpec {
            server: "s1".into(),
            program,
            args: vec!["-jar".into(), "Core.jar".into()],
            working_dir: dir.to_path_buf(),
        }
    }

    async fn wait_for_line(process: &ManagedProcess, needle: &str) {
        for _ in 0..100 {
            if process.output_contains(needle).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("'{}' never appeared", needle);
    }

    #[tokio::test]
    async fn test_start_captures_output_and_stops_gracefully() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::default();
        let mut console = supervisor.subscribe_console();
        let process = supervisor.start(spec(dir.path(), fake_server(dir.path()))).await.unwrap();

        wait_for_line(&process, "args: -jar Core.jar").await;
        supervisor.send_command(&process, "say hi").await.unwrap();
        wait_for_line(&process, "got: say hi").await;

        supervisor.stop_graceful(&process).await.unwrap();
        let exit = supervisor.wait_for_exit(&process).await;
        assert_eq!(exit.code, Some(0));
        assert!(!process.is_running());

        let first = console.recv().await.unwrap();
        assert_eq!(first.server, "s1");
    }

    #[tokio::test]
    async fn test_send_after_exit_is_not_running() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::default();
        let process = supervisor.start(spec(dir.path(), fake_server(dir.path()))).await.unwrap();
        supervisor.send_command(&process, "stop").await.unwrap();
        supervisor.wait_for_exit(&process).await;

        let err = supervisor.send_command(&process, "list").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::NotRunning(_)));
    }

    #[tokio::test]
    async fn test_force_stop_kills() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::default();
        let process = supervisor.start(spec(dir.path(), fake_server(dir.path()))).await.unwrap();
        let exit = supervisor.force_stop(&process).await.unwrap();
        assert!(exit.code.is_none());
        assert!(!process.is_running());
        // a second kill is a no-op
        assert_eq!(supervisor.force_stop(&process).await.unwrap(), exit);
    }

    #[tokio::test]
    async fn test_missing_program_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = ProcessSupervisor::default();
        let err = supervisor
            .start(spec(dir.path(), "/no/such/java".into()))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::LaunchFailed { .. }));
    }

    #[tokio::test]
    async fn test_stderr_is_at_least_warn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("err.sh");
        std::fs::write(&path, "#!/bin/sh\necho oops >&2\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

        let supervisor = ProcessSupervisor::default();
        let process = supervisor
            .start(spec(dir.path(), path.to_string_lossy().into_owned()))
            .await
            .unwrap();
        supervisor.wait_for_exit(&process).await;
        wait_for_line(&process, "oops").await;
        let lines = process.get_recent_console(10).await;
        let oops = lines.iter().find(|l| l.content == "oops").unwrap();
        assert_eq!(oops.source, LogSource::Stderr);
        assert_eq!(oops.level, LogLevel::Warn);
    }
}
