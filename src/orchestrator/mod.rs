//! Orchestration service: the active-instance registry plus every operation
//! that creates, launches, stops or reshapes a server.

pub mod files;
pub mod java;
pub mod launch;

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;

use crate::config::{GlobalConfig, CORE_JAR, WORLD_DIR};
use crate::error::{OrchestratorError, Result};
use crate::events::{Event, EventBus};
use crate::model::server::extract_version;
use crate::model::{LaunchConfig, LaunchMode, Server, ServerPatch};
use crate::store::{LastLaunchStore, ServerStore};
use crate::supervisor::{ConsoleLine, ExitInfo, LogLine, ManagedProcess, ProcessSupervisor};

/// A live server process, shared between the registry and callers.
pub type Instance = Arc<ManagedProcess>;

type Registry = Arc<Mutex<HashMap<String, Instance>>>;

/// Snapshot row for `list_running`.
#[derive(Debug, Clone, Serialize)]
pub struct RunningInfo {
    pub name: String,
    pub pid: u32,
    #[serde(with = "crate::model::task::datetime_format")]
    pub started_at: NaiveDateTime,
    pub uptime_secs: i64,
    pub memory_bytes: Option<u64>,
    pub cpu_percent: Option<f32>,
    pub command_line: String,
}

/// Per-server outcome of a batch start or stop.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl BatchReport {
    fn record(&mut self, name: &str, result: Result<()>) {
        match result {
            Ok(()) => self.succeeded.push(name.to_string()),
            Err(e) => self.failed.push((name.to_string(), e.to_string())),
        }
    }
}

pub struct OrchestrationService {
    config: GlobalConfig,
    supervisor: ProcessSupervisor,
    servers: ServerStore,
    last_launch: LastLaunchStore,
    events: Arc<EventBus>,
    active: Registry,
    java_roots: Vec<PathBuf>,
}

impl OrchestrationService {
    pub fn new(config: GlobalConfig, events: Arc<EventBus>) -> Self {
        let supervisor = ProcessSupervisor::new(config.log_buffer_size, config.log_pattern.as_deref());
        Self {
            servers: ServerStore::new(config.servers_file_path()),
            last_launch: LastLaunchStore::new(config.last_launch_file_path()),
            supervisor,
            events,
            active: Arc::new(Mutex::new(HashMap::new())),
            java_roots: java::default_search_roots(),
            config,
        }
    }

    /// Replace the directories searched for a java install.
    pub fn with_java_roots(mut self, roots: Vec<PathBuf>) -> Self {
        self.java_roots = roots;
        self
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    // ─── Server configuration ───────────────────────────────

    pub fn list_servers(&self) -> Result<Vec<Server>> {
        self.servers.list()
    }

    pub fn find_server(&self, name: &str) -> Result<Server> {
        self.servers.get(name)
    }

    /// Persist an already-built server entry.
    pub fn register_server(&self, server: Server) -> Result<()> {
        if !server.is_valid() {
            return Err(OrchestratorError::InvalidConfig(format!(
                "server '{}' needs a name, core path and version",
                server.name
            )));
        }
        self.servers.insert(server)
    }

    /// Stamp (or clear) the group a server belongs to.
    pub fn set_server_group(&self, name: &str, group: Option<&str>) -> Result<Server> {
        self.servers.update(name, |s| s.group = group.map(str::to_string))
    }

    /// New server from a core template: `cores/<core_file>` becomes
    /// `servers/<name>/Core.jar`.
    pub async fn create_server(&self, core_file: &str, name: &str, description: &str) -> Result<Server> {
        if self.servers.exists(name)? {
            return Err(OrchestratorError::ServerExists(name.to_string()));
        }
        let template = self.config.cores_path().join(core_file);
        if !template.is_file() {
            return Err(not_found(&template, "core template does not exist"));
        }

        let server_dir = self.config.server_dir(name);
        tokio::fs::create_dir_all(&server_dir)
            .await
            .map_err(|e| OrchestratorError::io(&server_dir, e))?;
        let core_path = server_dir.join(CORE_JAR);
        tokio::fs::copy(&template, &core_path)
            .await
            .map_err(|e| OrchestratorError::io(&template, e))?;

        let mut version = extract_version(core_file);
        if version.is_empty() {
            version = "unknown".to_string();
        }
        let server = Server::new(name, &core_path, &version, description);
        self.register_server(server.clone())?;
        tracing::info!("Created server '{}' from {} (version {})", name, core_file, version);
        Ok(server)
    }

    /// Register a server directory that already exists on disk.
    pub fn add_existing_server(
        &self,
        path: &Path,
        name: &str,
        version: &str,
        description: &str,
        default_jvm_args: Option<&str>,
        default_process_args: Option<&str>,
    ) -> Result<Server> {
        if !path.is_dir() {
            return Err(not_found(path, "server directory does not exist"));
        }
        if self.servers.exists(name)? {
            return Err(OrchestratorError::ServerExists(name.to_string()));
        }
        let core_path = path.join(CORE_JAR);
        if !core_path.is_file() {
            tracing::warn!("{} not found in {}; '{}' will not start until it is added", CORE_JAR, path.display(), name);
        }

        let mut server = Server::new(name, &core_path, version, description);
        server.default_jvm_args = non_empty(default_jvm_args);
        server.default_process_args = non_empty(default_process_args);
        self.register_server(server.clone())?;
        tracing::info!("Added existing server '{}' at {}", name, path.display());
        Ok(server)
    }

    /// Duplicate a server's directory and configuration under a new name.
    pub async fn copy_server(&self, source: &str, target: &str) -> Result<Server> {
        if source == target {
            return Err(OrchestratorError::InvalidConfig(
                "source and target names must differ".to_string(),
            ));
        }
        let original = self.find_server(source)?;
        if self.servers.exists(target)? {
            return Err(OrchestratorError::ServerExists(target.to_string()));
        }
        if self.is_running(source).await {
            tracing::warn!("Copying '{}' while it is running; files may be inconsistent", source);
        }

        let src_dir = original.working_dir();
        let dst_dir = self.config.server_dir(target);
        let files = blocking(&src_dir, {
            let (src_dir, dst_dir) = (src_dir.clone(), dst_dir.clone());
            move || files::copy_dir_all(&src_dir, &dst_dir)
        })
        .await?;

        let mut copy = original.clone();
        copy.name = target.to_string();
        copy.core_path = dst_dir.join(CORE_JAR).to_string_lossy().into_owned();
        copy.description = format!("{} (copy)", original.description);
        self.register_server(copy.clone())?;
        tracing::info!("Copied '{}' to '{}' ({} files)", source, target, files);
        Ok(copy)
    }

    pub fn configure_server(&self, name: &str, patch: ServerPatch) -> Result<Server> {
        let updated = self.servers.update(name, |s| s.apply(patch))?;
        tracing::info!("Updated configuration of '{}'", name);
        Ok(updated)
    }

    /// Replace the server's `Core.jar` with another template.
    pub async fn switch_core_version(&self, name: &str, core_file: &str) -> Result<Server> {
        let server = self.find_server(name)?;
        self.ensure_stopped(name).await?;
        let template = self.config.cores_path().join(core_file);
        if !template.is_file() {
            return Err(not_found(&template, "core template does not exist"));
        }
        tokio::fs::copy(&template, &server.core_path)
            .await
            .map_err(|e| OrchestratorError::io(&server.core_path, e))?;

        let version = extract_version(core_file);
        let updated = self.servers.update(name, |s| {
            if !version.is_empty() {
                s.version = version.clone();
            }
        })?;
        tracing::info!("Switched '{}' to core {} (version {})", name, core_file, updated.version);
        Ok(updated)
    }

    /// Install `maps/<map>.zip` or `maps/<map>/` as the server's world.
    pub async fn switch_map(&self, name: &str, map: &str) -> Result<Server> {
        let server = self.find_server(name)?;
        self.ensure_stopped(name).await?;

        let maps = self.config.maps_path();
        let archive = maps.join(format!("{}.zip", map));
        let folder = maps.join(map);
        if !archive.is_file() && !folder.is_dir() {
            return Err(not_found(&archive, "map does not exist"));
        }

        let world = server.working_dir().join(WORLD_DIR);
        let staging = server.working_dir().join(format!("{}.incoming", WORLD_DIR));
        blocking(&world, {
            let (world, staging) = (world.clone(), staging.clone());
            move || {
                files::remove_dir_if_exists(&staging)?;
                let installed = if archive.is_file() {
                    files::extract_zip(&archive, &staging).map(|n| n as u64)
                } else {
                    files::copy_dir_all(&folder, &staging)
                };
                if let Err(e) = installed {
                    let _ = files::remove_dir_if_exists(&staging);
                    return Err(e);
                }
                files::remove_dir_if_exists(&world)?;
                std::fs::rename(&staging, &world).map_err(|e| OrchestratorError::io(&world, e))
            }
        })
        .await?;

        let updated = self.servers.update(name, |s| s.map = Some(map.to_string()))?;
        tracing::info!("Server '{}' now uses map '{}'", name, map);
        Ok(updated)
    }

    /// Core templates available under the cores directory.
    pub fn list_templates(&self) -> Vec<String> {
        let pattern = self.config.cores_path().join("*.jar");
        let mut names = glob_names(&pattern, |p| p.file_name());
        names.sort();
        names
    }

    /// Map archives (`*.zip`) and map folders under the maps directory.
    pub fn list_maps(&self) -> Vec<String> {
        let maps = self.config.maps_path();
        let mut names = glob_names(&maps.join("*.zip"), |p| p.file_stem());
        names.extend(
            glob_names(&maps.join("*"), |p| if p.is_dir() { p.file_name() } else { None }),
        );
        names.sort();
        names.dedup();
        names
    }

    pub async fn delete_server(&self, name: &str, delete_files: bool) -> Result<Server> {
        self.ensure_stopped(name).await?;
        let removed = self.servers.remove(name)?;
        if delete_files {
            let dir = removed.working_dir();
            blocking(&dir, {
                let dir = dir.clone();
                move || files::remove_dir_if_exists(&dir)
            })
            .await?;
            tracing::info!("Deleted server '{}' and {}", name, dir.display());
        } else {
            tracing::info!("Deleted server '{}' (files kept)", name);
        }
        Ok(removed)
    }

    /// Copy the server directory to `backups/<yyyyMMdd_HHmmss>/<name>`.
    pub async fn create_backup(&self, name: &str) -> Result<PathBuf> {
        let server = self.find_server(name)?;
        let dir = server.working_dir();
        let backups = self.config.backups_path();
        let stamp = crate::utils::backup_stamp();
        let name = name.to_string();
        blocking(&dir, {
            let dir = dir.clone();
            move || files::backup_dir(&dir, &backups, &stamp, &name)
        })
        .await
    }

    pub async fn list_backups(&self) -> Result<Vec<files::BackupEntry>> {
        let backups = self.config.backups_path();
        blocking(&backups, {
            let backups = backups.clone();
            move || files::list_backups(&backups)
        })
        .await
    }

    /// Delete backup folders older than `days`; returns how many went.
    pub async fn prune_backups(&self, days: u32) -> Result<usize> {
        let backups = self.config.backups_path();
        let cutoff = crate::utils::now_local() - chrono::Duration::days(i64::from(days));
        let removed = blocking(&backups, {
            let backups = backups.clone();
            move || files::prune_backups(&backups, cutoff)
        })
        .await?;
        tracing::info!("Pruned {} backup folder(s) older than {} day(s)", removed.len(), days);
        Ok(removed.len())
    }

    // ─── Lifecycle ──────────────────────────────────────────

    /// Launch `server` with the given mode. Returns as soon as the OS process
    /// exists; the server's own boot is not awaited.
    pub async fn start_server(
        &self,
        server: &Server,
        mode: LaunchMode,
        java_path: Option<&str>,
        jvm_args: Option<&str>,
        process_args: Option<&str>,
    ) -> Result<Instance> {
        let process = {
            let mut active = self.active.lock().await;
            if let Some(existing) = active.get(&server.name) {
                if existing.is_running() {
                    return Err(OrchestratorError::AlreadyRunning(server.name.clone()));
                }
            }
            let java = java::resolve_java(java_path.or(self.config.java_path.as_deref()), &self.java_roots);
            let spec = launch::build_spec(server, mode, &java, jvm_args, process_args)?;
            let process = self.supervisor.start(spec).await?;
            active.insert(server.name.clone(), process.clone());
            process
        };

        let record = LaunchConfig::new(&server.name, mode, java_path, jvm_args, process_args);
        if let Err(e) = self.last_launch.save(&record) {
            tracing::warn!("Could not record last launch of '{}': {}", server.name, e);
        }

        self.spawn_exit_watcher(process.clone());
        self.events.dispatch(&Event::ServerStarted {
            name: server.name.clone(),
            pid: process.pid,
        });
        Ok(process)
    }

    /// Start with the server's own defaults: `-Xms`/`-Xmx` overrides followed
    /// by its default JVM args, and its default process args.
    pub async fn start_with_defaults(
        &self,
        server: &Server,
        mode: LaunchMode,
        java_path: Option<&str>,
    ) -> Result<Instance> {
        let jvm_args = default_jvm_args(server);
        let process_args = server.default_process_args.clone().unwrap_or_default();
        self.start_server(
            server,
            mode,
            java_path,
            Some(jvm_args.as_str()).filter(|s| !s.is_empty()),
            Some(process_args.as_str()).filter(|s| !s.is_empty()),
        )
        .await
    }

    /// Start again with exactly the parameters of the most recent launch.
    pub async fn relaunch_last(&self) -> Result<Instance> {
        let record = self.last_launch.load()?.ok_or_else(|| {
            OrchestratorError::InvalidConfig("no previous launch recorded".to_string())
        })?;
        if record.server_name.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig(
                "last launch record has no server name".to_string(),
            ));
        }
        let mode = record.mode()?;
        let server = self.find_server(&record.server_name)?;
        self.start_server(
            &server,
            mode,
            record.java_path.as_deref(),
            record.jvm_args.as_deref(),
            record.process_args.as_deref(),
        )
        .await
    }

    pub fn last_launch(&self) -> Result<Option<LaunchConfig>> {
        self.last_launch.load()
    }

    /// Ask the server to stop. If the stop command cannot be delivered the
    /// process is killed and its entry removed right away.
    pub async fn stop_server(&self, name: &str) -> Result<()> {
        let process = self.require_running(name).await?;
        self.supervisor.stop_graceful(&process).await?;
        if !process.is_running() {
            self.remove_instance(&process).await;
        }
        Ok(())
    }

    /// Start each named server with its defaults. One failure never stops
    /// the rest.
    pub async fn batch_start(&self, names: &[String], mode: LaunchMode) -> BatchReport {
        let mut report = BatchReport::default();
        for name in names {
            let result = match self.find_server(name) {
                Ok(server) => self.start_with_defaults(&server, mode, None).await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                tracing::warn!("Batch start: '{}' failed: {}", name, e);
            }
            report.record(name, result);
        }
        report
    }

    pub async fn batch_stop(&self, names: &[String]) -> BatchReport {
        let mut report = BatchReport::default();
        for name in names {
            let result = self.stop_server(name).await;
            if let Err(e) = &result {
                tracing::warn!("Batch stop: '{}' failed: {}", name, e);
            }
            report.record(name, result);
        }
        report
    }

    pub async fn force_stop_server(&self, name: &str) -> Result<ExitInfo> {
        let process = self.require_running(name).await?;
        let exit = self.supervisor.force_stop(&process).await?;
        self.remove_instance(&process).await;
        Ok(exit)
    }

    pub async fn send_command(&self, name: &str, text: &str) -> Result<()> {
        let process = self.require_running(name).await?;
        self.supervisor.send_command(&process, text).await
    }

    pub async fn get_instance(&self, name: &str) -> Option<Instance> {
        self.active.lock().await.get(name).cloned()
    }

    pub async fn is_running(&self, name: &str) -> bool {
        self.get_instance(name).await.map_or(false, |p| p.is_running())
    }

    pub async fn running_names(&self) -> Vec<String> {
        let active = self.active.lock().await;
        let mut names: Vec<String> = active
            .iter()
            .filter(|(_, p)| p.is_running())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Resolves `true` once `name` has no live process, or `false` when
    /// `timeout` elapses first.
    pub async fn wait_until_stopped(&self, name: &str, timeout: Duration) -> bool {
        let Some(process) = self.get_instance(name).await else {
            return true;
        };
        let deadline = Instant::now() + timeout;
        tokio::time::timeout_at(deadline, process.wait_for_exit()).await.is_ok()
    }

    pub async fn list_running(&self) -> Vec<RunningInfo> {
        let instances: Vec<Instance> = {
            let active = self.active.lock().await;
            active.values().filter(|p| p.is_running()).cloned().collect()
        };
        let usage = crate::resource::sample_async(instances.iter().map(|p| p.pid).collect()).await;
        let now = crate::utils::now_local();

        let mut rows: Vec<RunningInfo> = instances
            .iter()
            .map(|p| {
                let sample = usage.get(&p.pid);
                RunningInfo {
                    name: p.server.clone(),
                    pid: p.pid,
                    started_at: p.started_at,
                    uptime_secs: (now - p.started_at).num_seconds().max(0),
                    memory_bytes: sample.map(|u| u.memory_bytes),
                    cpu_percent: sample.map(|u| u.cpu_percent),
                    command_line: p.spec.command_line(),
                }
            })
            .collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        rows
    }

    /// Buffered console output of a running server: lines after `since`, or
    /// the last `count` lines.
    pub async fn console(&self, name: &str, since: Option<u64>, count: usize) -> Result<Vec<LogLine>> {
        let process = self
            .get_instance(name)
            .await
            .ok_or_else(|| OrchestratorError::NotRunning(name.to_string()))?;
        Ok(match since {
            Some(id) => process.get_console_since(id).await,
            None => process.get_recent_console(count).await,
        })
    }

    pub fn subscribe_console(&self) -> broadcast::Receiver<ConsoleLine> {
        self.supervisor.subscribe_console()
    }

    /// Gracefully stop everything, then kill whatever outlives `timeout`.
    pub async fn shutdown_all(&self, timeout: Duration) {
        let instances: Vec<Instance> = self.active.lock().await.values().cloned().collect();
        if instances.is_empty() {
            return;
        }
        tracing::info!("Stopping {} running server(s)", instances.len());
        for process in &instances {
            if let Err(e) = self.supervisor.stop_graceful(process).await {
                tracing::error!("Failed to stop '{}': {}", process.server, e);
            }
        }

        let deadline = Instant::now() + timeout;
        for process in &instances {
            if tokio::time::timeout_at(deadline, process.wait_for_exit()).await.is_err() {
                tracing::warn!("'{}' did not stop within {:?}, forcing", process.server, timeout);
                if let Err(e) = self.supervisor.force_stop(process).await {
                    tracing::error!("{}", e);
                }
            }
            self.remove_instance(process).await;
        }
    }

    // ─── Internals ──────────────────────────────────────────

    async fn require_running(&self, name: &str) -> Result<Instance> {
        match self.get_instance(name).await {
            Some(process) if process.is_running() => Ok(process),
            _ => Err(OrchestratorError::NotRunning(name.to_string())),
        }
    }

    async fn ensure_stopped(&self, name: &str) -> Result<()> {
        if self.is_running(name).await {
            return Err(OrchestratorError::RunningServerLocked(name.to_string()));
        }
        Ok(())
    }

    /// Remove `process` from the registry unless a newer launch replaced it.
    async fn remove_instance(&self, process: &ManagedProcess) {
        remove_if_same(&self.active, process).await;
    }

    fn spawn_exit_watcher(&self, process: Instance) {
        let active = self.active.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let exit = process.wait_for_exit().await;
            let removed = remove_if_same(&active, &process).await;
            tracing::info!("Server '{}' (PID {}) exited with {}", process.server, process.pid, exit);
            if removed {
                events.dispatch(&Event::ServerStopped {
                    name: process.server.clone(),
                    exit_code: exit.code,
                });
            }
        });
    }
}

async fn remove_if_same(active: &Registry, process: &ManagedProcess) -> bool {
    let mut map = active.lock().await;
    match map.get(&process.server) {
        Some(current) if current.id == process.id => {
            map.remove(&process.server);
            true
        }
        _ => false,
    }
}

/// `-Xms<min> -Xmx<max> <defaults>` from a server's own settings.
pub fn default_jvm_args(server: &Server) -> String {
    let mut parts = Vec::new();
    if let Some(min) = server.min_memory.as_deref().filter(|s| !s.trim().is_empty()) {
        parts.push(format!("-Xms{}", min.trim()));
    }
    if let Some(max) = server.max_memory.as_deref().filter(|s| !s.trim().is_empty()) {
        parts.push(format!("-Xmx{}", max.trim()));
    }
    if let Some(args) = server.default_jvm_args.as_deref().filter(|s| !s.trim().is_empty()) {
        parts.push(args.trim().to_string());
    }
    parts.join(" ")
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

fn not_found(path: &Path, message: &str) -> OrchestratorError {
    OrchestratorError::io(path, std::io::Error::new(std::io::ErrorKind::NotFound, message.to_string()))
}

fn glob_names<F>(pattern: &Path, pick: F) -> Vec<String>
where
    F: Fn(&Path) -> Option<&std::ffi::OsStr>,
{
    let Some(pattern) = pattern.to_str() else {
        return Vec::new();
    };
    match glob::glob(pattern) {
        Ok(paths) => paths
            .flatten()
            .filter_map(|p| pick(&p).map(|n| n.to_string_lossy().into_owned()))
            .collect(),
        Err(e) => {
            tracing::warn!("Invalid glob pattern {}: {}", pattern, e);
            Vec::new()
        }
    }
}

/// Run blocking filesystem work off the async workers.
async fn blocking<T, F>(path: &Path, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await.map_err(|e| {
        OrchestratorError::io(path, std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
    })?
}
