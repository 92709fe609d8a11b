//! Group coordinator: named sets of servers sharing launch presets, started
//! all at once or one at a time gated on readiness.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::GroupConfig;
use crate::error::{OrchestratorError, Result};
use crate::model::{Group, LaunchMode};
use crate::orchestrator::{Instance, OrchestrationService};
use crate::store::GroupStore;
use crate::supervisor::LogSource;

/// Outcome of starting or stopping a group. Per-member failures are
/// collected here instead of aborting the batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GroupReport {
    pub group: String,
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
    /// Ordered startup only: how each wait after a launch ended.
    pub readiness: Vec<(String, Readiness)>,
    pub cancelled: bool,
}

impl GroupReport {
    fn new(group: &str) -> Self {
        Self {
            group: group.to_string(),
            ..Self::default()
        }
    }

    fn record(&mut self, member: &str, result: Result<()>) {
        match result {
            Ok(()) => self.succeeded.push(member.to_string()),
            Err(e) => self.failed.push((member.to_string(), e.to_string())),
        }
    }
}

/// Why the wait between two ordered launches ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Readiness {
    /// The trigger keyword showed up in the member's output.
    Keyword,
    /// Nothing matched before the readiness timeout.
    TimedOut,
    /// The member exited before becoming ready.
    Exited,
    /// `advance_manually` was called.
    Manual,
    Cancelled,
}

/// Control handles of one in-progress ordered startup.
struct OrderedRun {
    advance: Notify,
    cancel: CancellationToken,
}

pub struct GroupCoordinator {
    service: Arc<OrchestrationService>,
    store: GroupStore,
    groups: Mutex<Vec<Group>>,
    ordered: Mutex<HashMap<String, Arc<OrderedRun>>>,
    readiness_timeout: Duration,
    stop_timeout: Duration,
}

impl GroupCoordinator {
    pub fn new(service: Arc<OrchestrationService>, store: GroupStore, config: &GroupConfig) -> Arc<Self> {
        Arc::new(Self {
            service,
            store,
            groups: Mutex::new(Vec::new()),
            ordered: Mutex::new(HashMap::new()),
            readiness_timeout: config.readiness_timeout(),
            stop_timeout: config.stop_timeout(),
        })
    }

    fn groups(&self) -> MutexGuard<'_, Vec<Group>> {
        self.groups.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, Arc<OrderedRun>>> {
        self.ordered.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn load(&self) -> Result<usize> {
        let loaded = self.store.load_all()?;
        let count = loaded.len();
        *self.groups() = loaded;
        tracing::info!("Loaded {} server groups", count);
        Ok(count)
    }

    // ─── Registry ───────────────────────────────────────────

    pub fn create_group(&self, group: Group) -> Result<Group> {
        if group.name.trim().is_empty() {
            return Err(OrchestratorError::InvalidConfig("group name must not be empty".to_string()));
        }
        group.mode()?;
        let mut groups = self.groups();
        if groups.iter().any(|g| g.name == group.name) {
            return Err(OrchestratorError::GroupExists(group.name));
        }
        groups.push(group.clone());
        self.store.save(&groups)?;
        tracing::info!("Created group '{}' (launch mode {})", group.name, group.launch_mode);
        Ok(group)
    }

    /// Delete a group and clear the group field of its members.
    pub fn delete_group(&self, name: &str) -> Result<Group> {
        let removed = {
            let mut groups = self.groups();
            let index = groups
                .iter()
                .position(|g| g.name == name)
                .ok_or_else(|| OrchestratorError::GroupNotFound(name.to_string()))?;
            let removed = groups.remove(index);
            self.store.save(&groups)?;
            removed
        };
        for member in &removed.member_names {
            self.unstamp(member, name);
        }
        tracing::info!("Deleted group '{}'", name);
        Ok(removed)
    }

    /// Add a server to a group. Returns false if it was already a member.
    pub fn add_member(&self, group_name: &str, server_name: &str) -> Result<bool> {
        self.service.find_server(server_name)?;
        let added = self.modify(group_name, |g| g.add_member(server_name))?;
        self.service.set_server_group(server_name, Some(group_name))?;
        if added {
            tracing::info!("Added '{}' to group '{}'", server_name, group_name);
        }
        Ok(added)
    }

    pub fn remove_member(&self, group_name: &str, server_name: &str) -> Result<bool> {
        let removed = self.modify(group_name, |g| g.remove_member(server_name))?;
        if removed {
            self.unstamp(server_name, group_name);
            tracing::info!("Removed '{}' from group '{}'", server_name, group_name);
        }
        Ok(removed)
    }

    pub fn list_groups(&self) -> Vec<Group> {
        self.groups().clone()
    }

    pub fn group_info(&self, name: &str) -> Result<Group> {
        self.groups()
            .iter()
            .find(|g| g.name == name)
            .cloned()
            .ok_or_else(|| OrchestratorError::GroupNotFound(name.to_string()))
    }

    pub fn set_ordered(&self, name: &str, ordered: bool) -> Result<Group> {
        self.modify(name, |g| g.ordered_startup = ordered)?;
        self.group_info(name)
    }

    pub fn set_trigger(&self, name: &str, keyword: &str, delay_ms: u64) -> Result<Group> {
        self.modify(name, |g| {
            g.trigger_keyword = keyword.to_string();
            g.startup_delay_ms = delay_ms;
        })?;
        self.group_info(name)
    }

    fn modify<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Group) -> T,
    {
        let mut groups = self.groups();
        let group = groups
            .iter_mut()
            .find(|g| g.name == name)
            .ok_or_else(|| OrchestratorError::GroupNotFound(name.to_string()))?;
        let out = f(group);
        self.store.save(&groups)?;
        Ok(out)
    }

    fn unstamp(&self, server_name: &str, group_name: &str) {
        let cleared = self.service.find_server(server_name).and_then(|server| {
            if server.group.as_deref() == Some(group_name) {
                self.service.set_server_group(server_name, None).map(|_| ())
            } else {
                Ok(())
            }
        });
        if let Err(e) = cleared {
            tracing::warn!("Could not clear group of '{}': {}", server_name, e);
        }
    }

    // ─── Startup ────────────────────────────────────────────

    /// Start a group the way its `ordered_startup` flag says.
    pub async fn start_group(&self, name: &str) -> Result<GroupReport> {
        if self.group_info(name)?.ordered_startup {
            self.start_ordered(name).await
        } else {
            self.start_concurrently(name).await
        }
    }

    /// Launch every member at once and wait for all launch attempts.
    pub async fn start_concurrently(&self, name: &str) -> Result<GroupReport> {
        let group = self.group_info(name)?;
        let mode = group.mode()?;
        tracing::info!("Starting group '{}' concurrently ({} members)", name, group.member_names.len());

        let group = Arc::new(group);
        let mut launches = JoinSet::new();
        for member in group.member_names.iter().cloned() {
            let service = self.service.clone();
            let group = group.clone();
            launches.spawn(async move {
                let result = launch_member(&service, &group, mode, &member).await.map(|_| ());
                (member, result)
            });
        }

        let mut report = GroupReport::new(name);
        while let Some(joined) = launches.join_next().await {
            match joined {
                Ok((member, result)) => {
                    if let Err(e) = &result {
                        tracing::error!("Group '{}': failed to start '{}': {}", name, member, e);
                    }
                    report.record(&member, result);
                }
                Err(e) => tracing::error!("Group '{}': launch task aborted: {}", name, e),
            }
        }
        tracing::info!(
            "Group '{}' started: {} ok, {} failed",
            name,
            report.succeeded.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Launch members one at a time; each next launch waits for the previous
    /// member's readiness and then the group's startup delay.
    pub async fn start_ordered(&self, name: &str) -> Result<GroupReport> {
        let group = self.group_info(name)?;
        let mode = group.mode()?;

        let run = Arc::new(OrderedRun {
            advance: Notify::new(),
            cancel: CancellationToken::new(),
        });
        {
            let mut runs = self.runs();
            if runs.contains_key(name) {
                return Err(OrchestratorError::OrderedStartupInProgress(name.to_string()));
            }
            runs.insert(name.to_string(), run.clone());
        }

        tracing::info!(
            "Starting group '{}' in order: {}",
            name,
            group.member_names.join(" -> ")
        );
        let report = self.run_queue(&group, mode, &run).await;
        self.runs().remove(name);
        Ok(report)
    }

    async fn run_queue(&self, group: &Group, mode: LaunchMode, run: &OrderedRun) -> GroupReport {
        let mut report = GroupReport::new(&group.name);
        let mut queue: VecDeque<String> = group.member_names.iter().cloned().collect();

        while let Some(member) = queue.pop_front() {
            if run.cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            let process = match launch_member(&self.service, group, mode, &member).await {
                Ok(process) => {
                    report.succeeded.push(member.clone());
                    process
                }
                Err(e) => {
                    tracing::error!("Group '{}': failed to start '{}': {}", group.name, member, e);
                    report.failed.push((member, e.to_string()));
                    continue;
                }
            };
            if queue.is_empty() {
                break;
            }

            let readiness = wait_ready(&process, &group.trigger_keyword, self.readiness_timeout, run).await;
            report.readiness.push((member.clone(), readiness));
            match readiness {
                Readiness::Keyword => tracing::info!("'{}' is ready", member),
                Readiness::TimedOut => tracing::warn!(
                    "'{}' did not print '{}' within {:?}, assuming ready",
                    member,
                    group.trigger_keyword,
                    self.readiness_timeout
                ),
                Readiness::Exited => tracing::warn!("'{}' exited before becoming ready", member),
                Readiness::Manual => tracing::info!("Advancing past '{}' on request", member),
                Readiness::Cancelled => {
                    report.cancelled = true;
                    break;
                }
            }

            if readiness != Readiness::Manual && group.startup_delay_ms > 0 {
                tokio::select! {
                    _ = run.cancel.cancelled() => {
                        report.cancelled = true;
                        break;
                    }
                    _ = run.advance.notified() => {}
                    _ = tokio::time::sleep(Duration::from_millis(group.startup_delay_ms)) => {}
                }
            }
        }

        if report.cancelled {
            let attempted = report.succeeded.len() + report.failed.len();
            tracing::warn!(
                "Ordered startup of '{}' cancelled; {} member(s) not started",
                group.name,
                group.member_names.len().saturating_sub(attempted)
            );
        } else {
            tracing::info!("Ordered startup of '{}' finished", group.name);
        }
        report
    }

    /// Skip the current readiness wait (or inter-step delay) of an ordered
    /// startup in progress.
    pub fn advance_manually(&self, name: &str) -> Result<()> {
        let run = self
            .runs()
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NoOrderedStartup(name.to_string()))?;
        run.advance.notify_one();
        Ok(())
    }

    /// Stop an ordered startup before its next launch. Members already
    /// launched keep running.
    pub fn cancel_ordered(&self, name: &str) -> Result<()> {
        let run = self
            .runs()
            .get(name)
            .cloned()
            .ok_or_else(|| OrchestratorError::NoOrderedStartup(name.to_string()))?;
        run.cancel.cancel();
        Ok(())
    }

    pub fn ordered_in_progress(&self, name: &str) -> bool {
        self.runs().contains_key(name)
    }

    /// Gracefully stop every member; failures are logged per member.
    pub async fn stop_group(&self, name: &str) -> Result<GroupReport> {
        let group = self.group_info(name)?;
        let mut report = GroupReport::new(name);
        for member in &group.member_names {
            let result = self.service.stop_server(member).await;
            if let Err(e) = &result {
                tracing::warn!("Group '{}': could not stop '{}': {}", name, member, e);
            }
            report.record(member, result);
        }
        Ok(report)
    }

    /// Stop the group and wait (up to the configured timeout) for members to exit.
    pub async fn stop_group_and_wait(&self, name: &str) -> Result<GroupReport> {
        let report = self.stop_group(name).await?;
        for member in &report.succeeded {
            if !self.service.wait_until_stopped(member, self.stop_timeout).await {
                tracing::warn!("'{}' still running {:?} after stop", member, self.stop_timeout);
            }
        }
        Ok(report)
    }
}

/// Resolve a member's server and start it with the group's presets.
async fn launch_member(
    service: &OrchestrationService,
    group: &Group,
    mode: LaunchMode,
    member: &str,
) -> Result<Instance> {
    let server = service.find_server(member)?;
    let jvm_args = group.build_jvm_args(&server);
    let process_args = group.build_process_args(&server);
    service
        .start_server(
            &server,
            mode,
            None,
            Some(jvm_args.as_str()).filter(|s| !s.is_empty()),
            Some(process_args.as_str()).filter(|s| !s.is_empty()),
        )
        .await
}

/// Wait until `process` looks ready. An empty keyword waits for the timeout.
async fn wait_ready(
    process: &Instance,
    keyword: &str,
    timeout: Duration,
    run: &OrderedRun,
) -> Readiness {
    let keyword = keyword.trim();
    let mut lines = process.subscribe();
    // output printed before we subscribed
    if !keyword.is_empty() && process.output_contains(keyword).await {
        return Readiness::Keyword;
    }

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let exited = process.wait_for_exit();
    tokio::pin!(exited);

    loop {
        tokio::select! {
            _ = run.cancel.cancelled() => return Readiness::Cancelled,
            _ = run.advance.notified() => return Readiness::Manual,
            _ = &mut deadline => return Readiness::TimedOut,
            _ = &mut exited => return Readiness::Exited,
            line = lines.recv() => match line {
                Ok(line) => {
                    if !keyword.is_empty() && line.source != LogSource::System && line.content.contains(keyword) {
                        return Readiness::Keyword;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    if !keyword.is_empty() && process.output_contains(keyword).await {
                        return Readiness::Keyword;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // all senders gone: the process is finished
                    return Readiness::Exited;
                }
            },
        }
    }
}
