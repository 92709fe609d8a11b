//! 작업 스케줄러: 원샷/반복 작업을 예약하고 OrchestrationService를 호출
//!
//! ## 동작
//! - 원샷 작업: 예약 시각까지 대기 후 한 번 실행하고 목록에서 제거
//!   (예약 시각이 이미 지났으면 즉시 실행)
//! - 반복 작업: `poll_interval`마다 확인하여 예약 시각이 지났으면 실행.
//!   cron 표현식은 저장만 하고 해석하지 않습니다.
//! - 모든 변경은 `scheduled_tasks.json`에 즉시 저장되고, 재시작 시 복구됩니다.

use chrono::NaiveDateTime;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{OrchestratorError, Result};
use crate::model::{LaunchMode, ScheduledTask, TaskType};
use crate::orchestrator::OrchestrationService;
use crate::store::TaskStore;

#[derive(Default)]
struct SchedulerState {
    tasks: Vec<ScheduledTask>,
    /// One token per armed timer or poller, keyed by task id.
    timers: HashMap<String, CancellationToken>,
}

pub struct TaskScheduler {
    service: Arc<OrchestrationService>,
    store: TaskStore,
    state: Mutex<SchedulerState>,
    shutdown: CancellationToken,
    poll_interval: Duration,
    restart_wait: Duration,
    default_mode: i64,
}

impl TaskScheduler {
    pub fn new(service: Arc<OrchestrationService>, store: TaskStore, config: &SchedulerConfig) -> Arc<Self> {
        Arc::new(Self {
            service,
            store,
            state: Mutex::new(SchedulerState::default()),
            shutdown: CancellationToken::new(),
            poll_interval: config.poll_interval(),
            restart_wait: config.restart_wait(),
            default_mode: i64::from(config.default_launch_mode),
        })
    }

    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Reload persisted tasks. Future one-shots and enabled recurring tasks
    /// are armed again, disabled ones are kept unarmed and one-shots whose
    /// time already passed are dropped. Returns how many were armed.
    pub fn recover(self: &Arc<Self>) -> Result<usize> {
        let saved = self.store.load_all()?;
        let now = crate::utils::now_local();
        let total = saved.len();

        let mut kept = Vec::with_capacity(total);
        for task in saved {
            if task.should_rearm(now) || !task.enabled {
                kept.push(task);
            } else {
                tracing::warn!("Dropping missed task '{}' ({}), was due {}", task.task_name, task.task_id, task.scheduled_time);
            }
        }

        let armed: Vec<ScheduledTask> = kept.iter().filter(|t| t.should_rearm(now)).cloned().collect();
        {
            let mut state = self.lock();
            state.tasks = kept;
            self.persist(&state)?;
        }
        for task in &armed {
            self.arm(task);
        }
        tracing::info!("Loaded {} scheduled tasks ({} armed)", total, armed.len());
        Ok(armed.len())
    }

    /// Register a task, persist it and arm its timer. Returns the new id.
    pub fn schedule(self: &Arc<Self>, mut task: ScheduledTask) -> Result<String> {
        validate(&task)?;
        task.task_id = generate_task_id();
        let id = task.task_id.clone();

        {
            let mut state = self.lock();
            state.tasks.push(task.clone());
            if let Err(e) = self.persist(&state) {
                state.tasks.retain(|t| t.task_id != id);
                return Err(e);
            }
        }
        tracing::info!(
            "Scheduled task '{}' ({}) {} on '{}' at {}{}",
            task.task_name,
            id,
            task.task_type,
            task.server_name,
            task.scheduled_time,
            if task.recurring { " (recurring)" } else { "" }
        );
        if task.enabled {
            self.arm(&task);
        }
        Ok(id)
    }

    /// Disable and remove a task. Unknown ids return false without touching
    /// the store.
    pub fn cancel(&self, task_id: &str) -> bool {
        let mut state = self.lock();
        let Some(index) = state.tasks.iter().position(|t| t.task_id == task_id) else {
            return false;
        };
        let mut task = state.tasks.remove(index);
        task.enabled = false;
        if let Some(token) = state.timers.remove(task_id) {
            token.cancel();
        }
        if let Err(e) = self.persist(&state) {
            tracing::error!("Task '{}' cancelled but not persisted: {}", task_id, e);
        }
        tracing::info!("Cancelled task '{}' ({})", task.task_name, task_id);
        true
    }

    pub fn get_by_id(&self, task_id: &str) -> Option<ScheduledTask> {
        self.lock().tasks.iter().find(|t| t.task_id == task_id).cloned()
    }

    pub fn list_all(&self) -> Vec<ScheduledTask> {
        self.lock().tasks.clone()
    }

    pub fn list_by_type(&self, task_type: TaskType) -> Vec<ScheduledTask> {
        self.lock().tasks.iter().filter(|t| t.task_type == task_type).cloned().collect()
    }

    pub fn list_enabled(&self, enabled: bool) -> Vec<ScheduledTask> {
        self.lock().tasks.iter().filter(|t| t.enabled == enabled).cloned().collect()
    }

    pub fn set_enabled(self: &Arc<Self>, task_id: &str, enabled: bool) -> Result<ScheduledTask> {
        let task = self.update(task_id, |t| t.enabled = enabled)?;
        if enabled {
            self.arm(&task);
        } else {
            self.disarm(task_id);
        }
        tracing::info!("Task '{}' {}", task_id, if enabled { "enabled" } else { "disabled" });
        Ok(task)
    }

    /// Move a task to `new_time`, keeping its id.
    pub fn reschedule(self: &Arc<Self>, task_id: &str, new_time: NaiveDateTime) -> Result<ScheduledTask> {
        let task = self.update(task_id, |t| t.scheduled_time = new_time)?;
        if task.enabled {
            self.arm(&task);
        }
        tracing::info!("Task '{}' rescheduled to {}", task_id, new_time);
        Ok(task)
    }

    /// Remove every task. Returns how many were removed.
    pub fn clear_all(&self) -> Result<usize> {
        let mut state = self.lock();
        for (_, token) in state.timers.drain() {
            token.cancel();
        }
        let count = state.tasks.len();
        state.tasks.clear();
        self.persist(&state)?;
        tracing::info!("Cleared {} scheduled tasks", count);
        Ok(count)
    }

    /// Stop every timer and poller. Persisted tasks are left as they are.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.lock().timers.clear();
        tracing::info!("Task scheduler stopped");
    }

    // ─── Arming ─────────────────────────────────────────────

    fn arm(self: &Arc<Self>, task: &ScheduledTask) {
        let token = self.shutdown.child_token();
        if let Some(previous) = self.lock().timers.insert(task.task_id.clone(), token.clone()) {
            previous.cancel();
        }
        let scheduler = self.clone();
        let id = task.task_id.clone();

        if task.recurring {
            tokio::spawn(async move { scheduler.run_poller(id, token).await });
            return;
        }

        let delay = (task.scheduled_time - crate::utils::now_local()).to_std().unwrap_or(Duration::ZERO);
        if delay.is_zero() {
            tracing::warn!("Task '{}' is already due, running now", task.task_name);
        }
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => scheduler.fire_once(&id).await,
            }
        });
    }

    fn disarm(&self, task_id: &str) {
        if let Some(token) = self.lock().timers.remove(task_id) {
            token.cancel();
        }
    }

    async fn run_poller(self: Arc<Self>, id: String, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => {}
            }
            let Some(task) = self.get_by_id(&id) else {
                return;
            };
            if task.enabled && crate::utils::now_local() >= task.scheduled_time {
                self.run_logged(&task).await;
            }
        }
    }

    /// Take a one-shot task off the list and run it.
    async fn fire_once(&self, task_id: &str) {
        let task = {
            let mut state = self.lock();
            let Some(index) = state.tasks.iter().position(|t| t.task_id == task_id) else {
                return;
            };
            if !state.tasks[index].enabled {
                return;
            }
            let task = state.tasks.remove(index);
            state.timers.remove(task_id);
            if let Err(e) = self.persist(&state) {
                tracing::error!("Could not persist removal of task '{}': {}", task_id, e);
            }
            task
        };
        self.run_logged(&task).await;
    }

    async fn run_logged(&self, task: &ScheduledTask) {
        tracing::info!("Running task '{}' ({}) on '{}'", task.task_name, task.task_type, task.server_name);
        match self.execute(task).await {
            Ok(()) => tracing::info!("Task '{}' finished", task.task_name),
            Err(e) => tracing::error!("Task '{}' failed: {}", task.task_name, e),
        }
    }

    async fn execute(&self, task: &ScheduledTask) -> Result<()> {
        let name = task.server_name.as_str();
        match task.task_type {
            TaskType::StartServer => self.start_default(name).await,
            TaskType::StopServer => self.service.stop_server(name).await,
            TaskType::SendCommand => {
                let command = task.command.as_deref().unwrap_or_default();
                self.service.send_command(name, command).await
            }
            TaskType::CreateBackup => {
                let path = self.service.create_backup(name).await?;
                tracing::info!("Backup of '{}' written to {}", name, path.display());
                Ok(())
            }
            TaskType::RestartServer => {
                match self.service.stop_server(name).await {
                    Ok(()) => {}
                    Err(OrchestratorError::NotRunning(_)) => {
                        tracing::warn!("'{}' was not running, restart will only start it", name);
                    }
                    Err(e) => return Err(e),
                }
                if !self.service.wait_until_stopped(name, self.restart_wait).await {
                    tracing::warn!("'{}' still running after {:?}, forcing", name, self.restart_wait);
                    match self.service.force_stop_server(name).await {
                        Ok(_) | Err(OrchestratorError::NotRunning(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
                self.start_default(name).await
            }
        }
    }

    async fn start_default(&self, name: &str) -> Result<()> {
        let server = self.service.find_server(name)?;
        let mode = LaunchMode::try_from(self.default_mode)?;
        self.service.start_with_defaults(&server, mode, None).await?;
        Ok(())
    }

    // ─── Persistence ────────────────────────────────────────

    fn update<F>(&self, task_id: &str, f: F) -> Result<ScheduledTask>
    where
        F: FnOnce(&mut ScheduledTask),
    {
        let mut state = self.lock();
        let task = state
            .tasks
            .iter_mut()
            .find(|t| t.task_id == task_id)
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        f(task);
        let updated = task.clone();
        self.persist(&state)?;
        Ok(updated)
    }

    fn persist(&self, state: &SchedulerState) -> Result<()> {
        self.store.save(&state.tasks)
    }
}

fn validate(task: &ScheduledTask) -> Result<()> {
    if task.server_name.trim().is_empty() {
        return Err(OrchestratorError::InvalidConfig("task needs a server name".to_string()));
    }
    if task.task_type == TaskType::SendCommand
        && task.command.as_deref().map_or(true, |c| c.trim().is_empty())
    {
        return Err(OrchestratorError::InvalidConfig(
            "send-command task needs a command".to_string(),
        ));
    }
    Ok(())
}

/// `task_<unix millis>_<8 hex chars>`
pub fn generate_task_id() -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("task_{}_{}", crate::utils::current_millis(), &uuid[..8])
}
