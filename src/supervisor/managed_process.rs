//! Managed Process - one spawned server process with stdio capture
//!
//! Each process owns:
//! - stdout/stderr reader tasks feeding a ring buffer and the console sink
//! - its stdin handle for command injection
//! - a waiter task that owns the child, honours kill requests and publishes
//!   the exit code through a watch channel

use chrono::NaiveDateTime;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command as TokioCommand};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

/// Default maximum number of log lines to keep in the ring buffer.
/// Can be overridden via `log_buffer_size` in config/global.toml.
pub const DEFAULT_LOG_BUFFER: usize = 10_000;

// ─── Log Types ───────────────────────────────────────────────

/// A single line of console output from the managed process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Sequential ID for polling (`console <name> --since <id>`)
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LogSource,
    pub content: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Lifecycle messages from the daemon itself
    System,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

/// A log line tagged with the server it came from; what the global console
/// sink carries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleLine {
    pub server: String,
    pub id: u64,
    pub timestamp: u64,
    pub source: LogSource,
    pub level: LogLevel,
    pub content: String,
}

impl ConsoleLine {
    fn tagged(server: &str, line: &LogLine) -> Self {
        Self {
            server: server.to_string(),
            id: line.id,
            timestamp: line.timestamp,
            source: line.source,
            level: line.level,
            content: line.content.clone(),
        }
    }
}

// ─── Log Buffer ──────────────────────────────────────────────

/// Ring buffer that stores recent log lines with sequential IDs.
pub(crate) struct LogBuffer {
    lines: VecDeque<LogLine>,
    next_id: u64,
    max_size: usize,
}

impl LogBuffer {
    pub(crate) fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: VecDeque::with_capacity(max_size.min(1024)),
            next_id: 0,
            max_size,
        }
    }

    fn push(&mut self, source: LogSource, content: String, level: LogLevel) -> LogLine {
        let line = LogLine {
            id: self.next_id,
            timestamp: crate::utils::current_timestamp(),
            source,
            content,
            level,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    /// All lines with id > `since_id`.
    fn get_since(&self, since_id: u64) -> Vec<LogLine> {
        self.lines.iter().filter(|l| l.id > since_id).cloned().collect()
    }

    fn get_recent(&self, count: usize) -> Vec<LogLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }

    fn any_contains(&self, needle: &str) -> bool {
        self.lines
            .iter()
            .any(|l| l.source != LogSource::System && l.content.contains(needle))
    }
}

// ─── Process Spec ────────────────────────────────────────────

/// Everything needed to spawn one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub server: String,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl ProcessSpec {
    /// `program arg1 arg2 ...` for logs and status output.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// How a process ended. `code` is `None` when it was killed by a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

impl std::fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => f.write_str("no exit code (terminated by signal)"),
        }
    }
}

/// Shared plumbing handed to every spawned process by the supervisor.
#[derive(Clone)]
pub(crate) struct SpawnContext {
    pub log_buffer_size: usize,
    pub log_regex: Option<Arc<Regex>>,
    pub console_tx: broadcast::Sender<ConsoleLine>,
}

// ─── Managed Process ─────────────────────────────────────────

/// A live server process: the runtime half of an instance.
pub struct ManagedProcess {
    /// Unique per launch, so an exit watcher never removes a newer instance
    /// registered under the same name.
    pub id: Uuid,
    pub server: String,
    pub pid: u32,
    pub started_at: NaiveDateTime,
    pub spec: ProcessSpec,
    stdin: Mutex<Option<ChildStdin>>,
    log_buffer: Arc<Mutex<LogBuffer>>,
    log_broadcast: broadcast::Sender<LogLine>,
    kill_tx: mpsc::Sender<()>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("pid", &self.pid)
            .field("started_at", &self.started_at)
            .field("exit", &self.exit_info())
            .finish_non_exhaustive()
    }
}

impl ManagedProcess {
    pub(crate) async fn spawn(spec: ProcessSpec, ctx: &SpawnContext) -> Result<Self> {
        let mut cmd = TokioCommand::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(false);

        // Windows: hide console window
        crate::utils::apply_creation_flags(&mut cmd);

        let mut child = cmd.spawn().map_err(|e| OrchestratorError::LaunchFailed {
            program: spec.program.clone(),
            source: e,
        })?;

        let pid = child.id().ok_or_else(|| OrchestratorError::LaunchFailed {
            program: spec.program.clone(),
            source: std::io::Error::new(
                std::io::ErrorKind::Other,
                "process exited before a PID was assigned",
            ),
        })?;

        let (log_tx, _) = broadcast::channel::<LogLine>(2048);
        let (exit_tx, exit_rx) = watch::channel::<Option<ExitInfo>>(None);
        let (kill_tx, mut kill_rx) = mpsc::channel::<()>(1);
        let log_buffer = Arc::new(Mutex::new(LogBuffer::with_capacity(ctx.log_buffer_size)));

        let sink = LineSink {
            server: spec.server.clone(),
            buffer: log_buffer.clone(),
            local: log_tx.clone(),
            console: ctx.console_tx.clone(),
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_stream(stdout, LogSource::Stdout, sink.clone(), ctx.log_regex.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(read_stream(stderr, LogSource::Stderr, sink.clone(), ctx.log_regex.clone()));
        }
        let stdin = child.stdin.take();

        // ── process waiter ───────────────────────────────────
        {
            let sink = sink.clone();
            let server = spec.server.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    Some(()) = kill_rx.recv() => {
                        if let Err(e) = child.start_kill() {
                            tracing::warn!("Kill request for '{}' failed: {}", server, e);
                        }
                        child.wait().await
                    }
                };
                let exit = match status {
                    Ok(status) => ExitInfo { code: status.code() },
                    Err(e) => {
                        tracing::error!("Failed to wait for '{}': {}", server, e);
                        ExitInfo { code: None }
                    }
                };
                sink.push(LogSource::System, format!("Process exited with {}", exit), LogLevel::Info)
                    .await;
                let _ = exit_tx.send(Some(exit));
            });
        }

        sink.push(LogSource::System, format!("Process started with PID {}", pid), LogLevel::Info)
            .await;

        Ok(Self {
            id: Uuid::new_v4(),
            server: spec.server.clone(),
            pid,
            started_at: crate::utils::now_local(),
            spec,
            stdin: Mutex::new(stdin),
            log_buffer,
            log_broadcast: log_tx,
            kill_tx,
            exit_rx,
        })
    }

    /// Write `command + "\n"` to stdin and flush.
    pub async fn send_command(&self, command: &str) -> Result<()> {
        if !self.is_running() {
            return Err(OrchestratorError::NotRunning(self.server.clone()));
        }
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| OrchestratorError::CommandFailed {
            server: self.server.clone(),
            message: "stdin is closed".to_string(),
        })?;

        let data = format!("{}\n", command.trim_end_matches('\n'));
        let written = match stdin.write_all(data.as_bytes()).await {
            Ok(()) => stdin.flush().await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            // broken pipe: the handle is useless from now on
            *guard = None;
            return Err(OrchestratorError::CommandFailed {
                server: self.server.clone(),
                message: e.to_string(),
            });
        }
        Ok(())
    }

    /// Kill the process and wait until the waiter confirms the exit.
    pub async fn kill(&self, confirm_timeout: Duration) -> Result<ExitInfo> {
        if let Some(exit) = self.exit_info() {
            return Ok(exit);
        }
        // A closed channel means the waiter already finished.
        let _ = self.kill_tx.try_send(());
        match tokio::time::timeout(confirm_timeout, self.wait_for_exit()).await {
            Ok(exit) => Ok(exit),
            Err(_) => Err(OrchestratorError::TerminationFailed {
                server: self.server.clone(),
                message: format!("process {} still alive after {:?}", self.pid, confirm_timeout),
            }),
        }
    }

    /// Wait until the process exits.
    pub async fn wait_for_exit(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        let result = rx.wait_for(Option::is_some).await.map(|v| *v);
        match result {
            Ok(Some(exit)) => exit,
            // sender dropped without publishing; the waiter task is gone
            _ => ExitInfo { code: None },
        }
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.exit_info().is_none()
    }

    pub async fn get_console_since(&self, since_id: u64) -> Vec<LogLine> {
        self.log_buffer.lock().await.get_since(since_id)
    }

    pub async fn get_recent_console(&self, count: usize) -> Vec<LogLine> {
        self.log_buffer.lock().await.get_recent(count)
    }

    /// Subscribe to this process's output only.
    pub fn subscribe(&self) -> broadcast::Receiver<LogLine> {
        self.log_broadcast.subscribe()
    }

    /// Whether any buffered output line contains `needle`.
    pub async fn output_contains(&self, needle: &str) -> bool {
        self.log_buffer.lock().await.any_contains(needle)
    }
}

// ─── Stream readers ──────────────────────────────────────────

#[derive(Clone)]
struct LineSink {
    server: String,
    buffer: Arc<Mutex<LogBuffer>>,
    local: broadcast::Sender<LogLine>,
    console: broadcast::Sender<ConsoleLine>,
}

impl LineSink {
    async fn push(&self, source: LogSource, content: String, level: LogLevel) {
        let line = self.buffer.lock().await.push(source, content, level);
        tracing::debug!(target: "console", server = %self.server, "{}", line.content);
        let _ = self.console.send(ConsoleLine::tagged(&self.server, &line));
        let _ = self.local.send(line);
    }
}

async fn read_stream<R>(stream: R, source: LogSource, sink: LineSink, re: Option<Arc<Regex>>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::with_capacity(256);
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::warn!("Console reader for '{}' stopped: {}", sink.server, e);
                break;
            }
        }
        // non-UTF-8 consoles (GBK etc.) are decoded lossily
        let line = decode_line(&buf);
        let level = parse_log_level(&line, re.as_deref());
        // stderr lines default to at least Warn
        let level = if source == LogSource::Stderr && level == LogLevel::Info {
            LogLevel::Warn
        } else {
            level
        };
        sink.push(source, line, level).await;
    }
}

// ─── Helpers ─────────────────────────────────────────────────

/// Lossy decode of one raw console line without its `\n` / `\r\n`.
fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    while end > 0 && matches!(raw[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Parse the log level from a server log line using an optional regex pattern.
///
/// The pattern must contain a named capture group `level` matching
/// INFO, WARN, ERROR, DEBUG etc. Without a pattern every line is Info.
///
/// Example: `/(?P<level>INFO|WARN|ERROR|DEBUG|FATAL)\]`
pub(crate) fn parse_log_level(line: &str, pattern: Option<&Regex>) -> LogLevel {
    if let Some(re) = pattern {
        if let Some(level_match) = re.captures(line).and_then(|caps| caps.name("level")) {
            return match level_match.as_str().to_uppercase().as_str() {
                "ERROR" | "FATAL" => LogLevel::Error,
                "WARN" | "WARNING" => LogLevel::Warn,
                "DEBUG" | "TRACE" => LogLevel::Debug,
                _ => LogLevel::Info,
            };
        }
    }
    LogLevel::Info
}

// ─── Tests ───────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_buffer_push_and_query() {
        let mut buffer = LogBuffer::with_capacity(DEFAULT_LOG_BUFFER);
        buffer.push(LogSource::Stdout, "line 0".into(), LogLevel::Info);
        buffer.push(LogSource::Stdout, "line 1".into(), LogLevel::Info);
        buffer.push(LogSource::Stderr, "err 0".into(), LogLevel::Error);

        assert_eq!(buffer.lines.len(), 3);
        // since_id = 0 → lines with id > 0
        assert_eq!(buffer.get_since(0).len(), 2);
        assert_eq!(buffer.get_recent(2).len(), 2);
        assert_eq!(buffer.get_recent(100).len(), 3);
        assert!(buffer.any_contains("err"));
        assert!(!buffer.any_contains("Done"));
    }

    #[test]
    fn test_log_buffer_ring() {
        let mut buffer = LogBuffer::with_capacity(50);
        for i in 0..150 {
            buffer.push(LogSource::Stdout, format!("line {}", i), LogLevel::Info);
        }
        assert_eq!(buffer.lines.len(), 50);
        assert_eq!(buffer.lines.front().unwrap().id, 100);
    }

    #[test]
    fn test_system_lines_do_not_count_as_output() {
        let mut buffer = LogBuffer::with_capacity(10);
        buffer.push(LogSource::System, "Process exited with Done".into(), LogLevel::Info);
        assert!(!buffer.any_contains("Done"));
    }

    #[test]
    fn test_parse_log_level_with_pattern() {
        let mc_pattern = Regex::new(r"/(?P<level>INFO|WARN|ERROR|DEBUG|FATAL)\]").unwrap();

        assert_eq!(
            parse_log_level("[12:00:00] [Server thread/INFO]: Done (5.123s)!", Some(&mc_pattern)),
            LogLevel::Info
        );
        assert_eq!(
            parse_log_level("[12:00:00] [Server thread/WARN]: Can't keep up!", Some(&mc_pattern)),
            LogLevel::Warn
        );
        assert_eq!(
            parse_log_level("[12:00:00] [Server thread/FATAL]: crash", Some(&mc_pattern)),
            LogLevel::Error
        );
        assert_eq!(parse_log_level("Some random output", Some(&mc_pattern)), LogLevel::Info);
        assert_eq!(parse_log_level("[Server thread/ERROR]: err", None), LogLevel::Info);
    }

    #[test]
    fn test_decode_line_trims_and_replaces() {
        assert_eq!(decode_line(b"Done (1.0s)!\r\n"), "Done (1.0s)!");
        assert_eq!(decode_line(b"no newline"), "no newline");
        assert_eq!(decode_line(b"Caf\xe9\n"), "Caf\u{FFFD}");
        assert_eq!(decode_line(b"\n"), "");
    }

    #[tokio::test]
    async fn test_reader_survives_invalid_utf8() {
        let (local, _) = broadcast::channel(16);
        let (console, _) = broadcast::channel(16);
        let buffer = Arc::new(Mutex::new(LogBuffer::with_capacity(16)));
        let sink = LineSink {
            server: "s1".into(),
            buffer: buffer.clone(),
            local,
            console,
        };
        let raw: &[u8] = b"Caf\xe9\n\xc4\xe3\xba\xc3\r\nDone (1.0s)!\nlast";

        read_stream(raw, LogSource::Stdout, sink, None).await;

        let buffer = buffer.lock().await;
        let contents: Vec<&str> = buffer.lines.iter().map(|l| l.content.as_str()).collect();
        assert_eq!(contents.len(), 4);
        assert_eq!(contents[2], "Done (1.0s)!");
        assert_eq!(contents[3], "last");
        assert!(buffer.any_contains("Done"));
    }

    #[test]
    fn test_command_line() {
        let spec = ProcessSpec {
            server: "s1".into(),
            program: "java".into(),
            args: vec!["-jar".into(), "Core.jar".into()],
            working_dir: PathBuf::from("/srv/s1"),
        };
        assert_eq!(spec.command_line(), "java -jar Core.jar");
    }
}
