//! End-to-end checks against a fake `java` executable.
//!
//! The fake prints its arguments and working directory, answers `go` with
//! `ready` and exits on `stop`, which is enough to drive launches, ordered
//! group startup and scheduled restarts without a real server. Servers whose
//! directory starts with `crash`, `deaf` or `garbled` exit at once, close
//! their stdin, or print a line that is not UTF-8.
#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use craftvisor_core::config::GlobalConfig;
use craftvisor_core::events::{Event, EventBus, EventPriority};
use craftvisor_core::group::{GroupCoordinator, Readiness};
use craftvisor_core::model::{Group, LaunchMode, ScheduledTask, TaskType};
use craftvisor_core::orchestrator::OrchestrationService;
use craftvisor_core::scheduler::TaskScheduler;
use craftvisor_core::store::{GroupStore, TaskStore};
use craftvisor_core::OrchestratorError;

const FAKE_JAVA: &str = "#!/bin/sh
echo \"args: $*\"
echo \"pwd: $(pwd)\"
case \"$(basename \"$(pwd)\")\" in
  crash*) echo \"crashing\"; exit 1 ;;
  deaf*) exec 0<&-; echo \"stdin closed\"; exec sleep 30 ;;
  garbled*) printf 'Caf\\351\\n'; echo \"Done (1.0s)!\" ;;
esac
while read line; do
  case \"$line\" in
    go) echo \"ready\" ;;
    stop) echo \"Stopping server\"; exit 0 ;;
    *) echo \"got: $line\" ;;
  esac
done
";

struct Harness {
    _dir: tempfile::TempDir,
    root: std::path::PathBuf,
    service: Arc<OrchestrationService>,
    events: Arc<Mutex<Vec<Event>>>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(|_| {})
    }

    fn with_config(adjust: impl FnOnce(&mut GlobalConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();
        let java = root.join("fake-java.sh");
        std::fs::write(&java, FAKE_JAVA).unwrap();
        std::fs::set_permissions(&java, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut config = GlobalConfig::with_data_dir(&root);
        config.java_path = Some(java.to_string_lossy().into_owned());
        config.scheduler.restart_wait_secs = 5;
        config.groups.readiness_timeout_ms = 30_000;
        config.groups.stop_timeout_secs = 5;
        adjust(&mut config);

        let bus = Arc::new(EventBus::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        {
            let events = events.clone();
            bus.register(EventPriority::Monitor, move |e| events.lock().unwrap().push(e.clone()));
        }
        let service = Arc::new(OrchestrationService::new(config, bus).with_java_roots(Vec::new()));
        Self {
            _dir: dir,
            root,
            service,
            events,
        }
    }

    fn add_server(&self, name: &str) {
        let dir = self.root.join("servers").join(name);
        std::fs::create_dir_all(&dir).unwrap();
        self.service
            .add_existing_server(&dir, name, "1.20.4", "", None, None)
            .unwrap();
    }

    fn groups(&self) -> Arc<GroupCoordinator> {
        let config = self.service.config();
        GroupCoordinator::new(
            self.service.clone(),
            GroupStore::new(config.groups_file_path()),
            &config.groups,
        )
    }

    fn scheduler(&self) -> Arc<TaskScheduler> {
        let config = self.service.config();
        TaskScheduler::new(
            self.service.clone(),
            TaskStore::new(config.tasks_file_path()),
            &config.scheduler,
        )
    }

    async fn output_of(&self, name: &str) -> String {
        self.service
            .console(name, None, 100)
            .await
            .map(|lines| lines.into_iter().map(|l| l.content).collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }

    async fn wait_for_output(&self, name: &str, needle: &str) -> String {
        for _ in 0..250 {
            let output = self.output_of(name).await;
            if output.contains(needle) {
                return output;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("'{}' never printed '{}':\n{}", name, needle, self.output_of(name).await);
    }

    async fn wait_running(&self, name: &str) {
        for _ in 0..250 {
            if self.service.is_running(name).await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("'{}' never started", name);
    }

    fn stopped_events(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| matches!(e, Event::ServerStopped { name: n, .. } if n == name))
            .count()
    }
}

#[tokio::test]
async fn test_duplicate_start_is_rejected() {
    let h = Harness::new();
    h.add_server("lobby");
    let server = h.service.find_server("lobby").unwrap();

    let first = h
        .service
        .start_server(&server, LaunchMode::Basic, None, None, None)
        .await
        .unwrap();
    let second = h.service.start_server(&server, LaunchMode::Basic, None, None, None).await;
    assert!(matches!(second, Err(OrchestratorError::AlreadyRunning(_))));
    // the registry is checked before the command line is built
    let custom = h.service.start_server(&server, LaunchMode::Custom, None, None, None).await;
    assert!(matches!(custom, Err(OrchestratorError::AlreadyRunning(_))));

    let running = h.service.get_instance("lobby").await.unwrap();
    assert_eq!(running.pid, first.pid);

    h.service.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_basic_mode_command_line_and_working_dir() {
    let h = Harness::new();
    h.add_server("survival");
    let server = h.service.find_server("survival").unwrap();
    h.service
        .start_server(&server, LaunchMode::Basic, None, None, None)
        .await
        .unwrap();

    let output = h
        .wait_for_output("survival", "args: -Dfunction.permission.level=4 -Dop.permission.level=4 -jar Core.jar")
        .await;
    let expected_dir = std::fs::canonicalize(server.working_dir()).unwrap();
    assert!(output.contains(&format!("pwd: {}", expected_dir.display())), "{}", output);

    h.service.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_custom_mode_and_relaunch_last() {
    let h = Harness::new();
    h.add_server("creative");
    let server = h.service.find_server("creative").unwrap();

    let missing = h.service.start_server(&server, LaunchMode::Custom, None, None, None).await;
    assert!(matches!(missing, Err(OrchestratorError::InvalidConfig(_))));
    assert!(!h.service.is_running("creative").await);

    h.service
        .start_server(&server, LaunchMode::Custom, None, Some("-Xmx1G"), Some("--port 25566"))
        .await
        .unwrap();
    h.wait_for_output("creative", "args: -Xmx1G -jar Core.jar --port 25566").await;

    let record = h.service.last_launch().unwrap().unwrap();
    assert_eq!(record.server_name, "creative");
    assert_eq!(record.launch_mode, 5);

    h.service.stop_server("creative").await.unwrap();
    assert!(h.service.wait_until_stopped("creative", Duration::from_secs(5)).await);

    h.service.relaunch_last().await.unwrap();
    h.wait_for_output("creative", "args: -Xmx1G -jar Core.jar --port 25566").await;
    h.service.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_registry_clears_when_process_exits() {
    let h = Harness::new();
    h.add_server("hub");
    let server = h.service.find_server("hub").unwrap();
    h.service
        .start_server(&server, LaunchMode::Core, None, None, None)
        .await
        .unwrap();
    h.wait_for_output("hub", "args:").await;

    h.service.send_command("hub", "say hello").await.unwrap();
    h.wait_for_output("hub", "got: say hello").await;

    // The process exits on its own; the exit watcher must clean up.
    h.service.send_command("hub", "stop").await.unwrap();
    assert!(h.service.wait_until_stopped("hub", Duration::from_secs(5)).await);
    for _ in 0..100 {
        if h.stopped_events("hub") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(h.stopped_events("hub"), 1);
    assert!(h.service.running_names().await.is_empty());
    assert!(matches!(
        h.service.send_command("hub", "list").await,
        Err(OrchestratorError::NotRunning(_))
    ));

    // A stopped server can be started again under the same name.
    h.service
        .start_server(&server, LaunchMode::Core, None, None, None)
        .await
        .unwrap();
    h.service.force_stop_server("hub").await.unwrap();
    assert!(!h.service.is_running("hub").await);
}

#[tokio::test]
async fn test_concurrent_group_start_reports_missing_member() {
    let h = Harness::new();
    h.add_server("a");
    h.add_server("gone");
    let groups = h.groups();
    groups.create_group(Group::new("net")).unwrap();
    groups.add_member("net", "a").unwrap();
    groups.add_member("net", "gone").unwrap();
    h.service.delete_server("gone", false).await.unwrap();

    let report = groups.start_concurrently("net").await.unwrap();
    assert_eq!(report.succeeded, vec!["a".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "gone");
    assert!(h.service.is_running("a").await);

    let stopped = groups.stop_group_and_wait("net").await.unwrap();
    assert_eq!(stopped.succeeded, vec!["a".to_string()]);
    assert!(!h.service.is_running("a").await);
}

#[tokio::test]
async fn test_group_presets_reach_the_command_line() {
    let h = Harness::new();
    h.add_server("modded");
    let groups = h.groups();
    let mut group = Group::new("presets");
    group.launch_mode = LaunchMode::Custom.number();
    group.min_memory = Some("1G".into());
    group.max_memory = Some("4G".into());
    group.preset_jvm_args = Some("-XX:+UseG1GC".into());
    group.preset_process_args = Some("nogui".into());
    groups.create_group(group).unwrap();
    groups.add_member("presets", "modded").unwrap();

    let report = groups.start_group("presets").await.unwrap();
    assert_eq!(report.succeeded, vec!["modded".to_string()]);
    h.wait_for_output("modded", "args: -Xms1G -Xmx4G -XX:+UseG1GC -jar Core.jar nogui").await;
    h.service.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_ordered_start_waits_for_trigger() {
    let h = Harness::new();
    for name in ["a", "b", "c"] {
        h.add_server(name);
    }
    let groups = h.groups();
    let mut group = Group::new("chain");
    group.ordered_startup = true;
    group.trigger_keyword = "ready".into();
    group.startup_delay_ms = 0;
    groups.create_group(group).unwrap();
    for name in ["a", "b", "c"] {
        groups.add_member("chain", name).unwrap();
    }

    let run = {
        let groups = groups.clone();
        tokio::spawn(async move { groups.start_group("chain").await })
    };

    h.wait_running("a").await;
    h.wait_for_output("a", "args:").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!h.service.is_running("b").await, "b started before a was ready");
    assert!(groups.ordered_in_progress("chain"));

    h.service.send_command("a", "go").await.unwrap();
    h.wait_running("b").await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!h.service.is_running("c").await, "c started before b was ready");

    // Manual advance skips b's readiness wait.
    groups.advance_manually("chain").unwrap();
    h.wait_running("c").await;

    let report = run.await.unwrap().unwrap();
    assert_eq!(report.succeeded, vec!["a", "b", "c"]);
    assert!(report.failed.is_empty());
    assert!(!report.cancelled);
    assert!(!groups.ordered_in_progress("chain"));

    h.service.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_ordered_start_can_be_cancelled() {
    let h = Harness::new();
    h.add_server("first");
    h.add_server("second");
    let groups = h.groups();
    let mut group = Group::new("halt");
    group.ordered_startup = true;
    group.trigger_keyword = "never-printed".into();
    groups.create_group(group).unwrap();
    groups.add_member("halt", "first").unwrap();
    groups.add_member("halt", "second").unwrap();

    let run = {
        let groups = groups.clone();
        tokio::spawn(async move { groups.start_ordered("halt").await })
    };
    h.wait_running("first").await;
    for _ in 0..100 {
        if groups.ordered_in_progress("halt") {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    groups.cancel_ordered("halt").unwrap();

    let report = run.await.unwrap().unwrap();
    assert!(report.cancelled);
    assert_eq!(report.succeeded, vec!["first"]);
    assert!(!h.service.is_running("second").await);

    h.service.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_past_scheduled_start_runs_immediately() {
    let h = Harness::new();
    h.add_server("nightly");
    let scheduler = h.scheduler();

    let past = craftvisor_core::utils::now_local() - chrono::Duration::seconds(30);
    let id = scheduler
        .schedule(ScheduledTask::new("boot", "nightly", TaskType::StartServer, past))
        .unwrap();

    h.wait_running("nightly").await;
    assert!(scheduler.get_by_id(&id).is_none());

    scheduler.shutdown();
    h.service.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_cancelled_task_never_fires() {
    let h = Harness::new();
    h.add_server("quiet");
    let scheduler = h.scheduler();

    let soon = craftvisor_core::utils::now_local() + chrono::Duration::seconds(1);
    let id = scheduler
        .schedule(ScheduledTask::new("boot", "quiet", TaskType::StartServer, soon))
        .unwrap();
    assert!(scheduler.cancel(&id));
    assert!(!scheduler.cancel(&id));

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!h.service.is_running("quiet").await);
    scheduler.shutdown();
}

#[tokio::test]
async fn test_scheduled_restart_relaunches() {
    let h = Harness::new();
    h.add_server("daily");
    let server = h.service.find_server("daily").unwrap();
    let first = h
        .service
        .start_server(&server, LaunchMode::Core, None, None, None)
        .await
        .unwrap();

    let scheduler = h.scheduler();
    let now = craftvisor_core::utils::now_local();
    scheduler
        .schedule(ScheduledTask::new("restart", "daily", TaskType::RestartServer, now))
        .unwrap();

    let mut relaunched = false;
    for _ in 0..250 {
        if let Some(current) = h.service.get_instance("daily").await {
            if current.id != first.id && current.is_running() {
                relaunched = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(relaunched, "restart task did not start a new process");

    scheduler.shutdown();
    h.service.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_shutdown_all_stops_everything() {
    let h = Harness::new();
    for name in ["x", "y"] {
        h.add_server(name);
        let server = h.service.find_server(name).unwrap();
        h.service
            .start_server(&server, LaunchMode::Basic, None, None, None)
            .await
            .unwrap();
    }
    assert_eq!(h.service.running_names().await.len(), 2);
    let listed = h.service.list_running().await;
    assert_eq!(listed.len(), 2);

    h.service.shutdown_all(Duration::from_secs(5)).await;
    assert!(h.service.running_names().await.is_empty());
}

#[tokio::test]
async fn test_console_survives_non_utf8_output() {
    let h = Harness::new();
    h.add_server("garbled");
    let server = h.service.find_server("garbled").unwrap();
    let process = h
        .service
        .start_server(&server, LaunchMode::Basic, None, None, None)
        .await
        .unwrap();

    let output = h.wait_for_output("garbled", "Done (1.0s)!").await;
    assert!(output.contains("Caf\u{FFFD}"), "{}", output);
    assert!(process.output_contains("Done").await);

    h.service.send_command("garbled", "hello").await.unwrap();
    h.wait_for_output("garbled", "got: hello").await;
    h.service.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_ordered_start_falls_back_to_timeout() {
    let h = Harness::with_config(|config| config.groups.readiness_timeout_ms = 300);
    h.add_server("slow");
    h.add_server("next");
    let groups = h.groups();
    let mut group = Group::new("patient");
    group.ordered_startup = true;
    group.trigger_keyword = "never-printed".into();
    group.startup_delay_ms = 0;
    groups.create_group(group).unwrap();
    groups.add_member("patient", "slow").unwrap();
    groups.add_member("patient", "next").unwrap();

    let began = std::time::Instant::now();
    let report = tokio::time::timeout(Duration::from_secs(10), groups.start_ordered("patient"))
        .await
        .expect("ordered startup hung")
        .unwrap();
    assert!(began.elapsed() >= Duration::from_millis(250));
    assert_eq!(report.readiness, vec![("slow".to_string(), Readiness::TimedOut)]);
    assert_eq!(report.succeeded, vec!["slow", "next"]);
    assert!(h.service.is_running("next").await);

    h.service.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_ordered_start_moves_on_when_member_exits() {
    let h = Harness::new();
    h.add_server("crash-first");
    h.add_server("steady");
    let groups = h.groups();
    let mut group = Group::new("fragile");
    group.ordered_startup = true;
    group.trigger_keyword = "never-printed".into();
    group.startup_delay_ms = 0;
    groups.create_group(group).unwrap();
    groups.add_member("fragile", "crash-first").unwrap();
    groups.add_member("fragile", "steady").unwrap();

    // the readiness timeout is 30s, so only the exit can end the wait in time
    let report = tokio::time::timeout(Duration::from_secs(10), groups.start_ordered("fragile"))
        .await
        .expect("ordered startup waited past the member's exit")
        .unwrap();
    assert_eq!(report.readiness, vec![("crash-first".to_string(), Readiness::Exited)]);
    assert_eq!(report.succeeded, vec!["crash-first", "steady"]);
    assert!(h.service.is_running("steady").await);
    assert!(h.service.wait_until_stopped("crash-first", Duration::from_secs(5)).await);

    h.service.shutdown_all(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_stop_escalates_when_stdin_is_closed() {
    let h = Harness::new();
    h.add_server("deaf");
    let server = h.service.find_server("deaf").unwrap();
    let process = h
        .service
        .start_server(&server, LaunchMode::Basic, None, None, None)
        .await
        .unwrap();
    h.wait_for_output("deaf", "stdin closed").await;

    // the stop command hits a broken pipe and is escalated to a kill
    h.service.stop_server("deaf").await.unwrap();

    assert!(!process.is_running());
    assert!(process.exit_info().is_some());
    assert!(!h.service.is_running("deaf").await);
}

#[tokio::test]
async fn test_batch_start_and_stop() {
    let h = Harness::new();
    h.add_server("one");
    h.add_server("two");
    let names = vec!["one".to_string(), "ghost".to_string(), "two".to_string()];

    let started = h.service.batch_start(&names, LaunchMode::Basic).await;
    assert_eq!(started.succeeded, vec!["one", "two"]);
    assert_eq!(started.failed.len(), 1);
    assert_eq!(started.failed[0].0, "ghost");
    assert!(h.service.is_running("one").await);
    assert!(h.service.is_running("two").await);

    let stopped = h.service.batch_stop(&names).await;
    assert_eq!(stopped.succeeded, vec!["one", "two"]);
    assert_eq!(stopped.failed[0].0, "ghost");
    assert!(h.service.wait_until_stopped("one", Duration::from_secs(5)).await);
    assert!(h.service.wait_until_stopped("two", Duration::from_secs(5)).await);
}
