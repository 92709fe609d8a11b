use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

use craftvisor_core::command::Dispatcher;
use craftvisor_core::config::{GlobalConfig, DEFAULT_CONFIG_PATH};
use craftvisor_core::events::{Event, EventBus, EventPriority};
use craftvisor_core::group::GroupCoordinator;
use craftvisor_core::orchestrator::OrchestrationService;
use craftvisor_core::scheduler::TaskScheduler;
use craftvisor_core::store::{GroupStore, TaskStore};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path =
        std::env::var("CRAFTVISOR_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    // 설정 로드 실패는 치명적이지 않음 - 기본값으로 계속 진행
    let (config, config_error) = match GlobalConfig::load(&config_path) {
        Ok(cfg) => (cfg, None),
        Err(e) => (GlobalConfig::default(), Some(e)),
    };

    let default_level = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    if let Some(e) = config_error {
        tracing::warn!("Failed to load {}: {} (using defaults)", config_path, e);
    }
    tracing::info!("craftvisor starting (data dir: {})", config.data_dir.display());

    let events = Arc::new(EventBus::new());
    events.register(EventPriority::Monitor, |event| match event {
        Event::ServerStarted { name, pid } => tracing::info!("[{}] started (PID {})", name, pid),
        Event::ServerStopped { name, exit_code } => {
            tracing::info!("[{}] stopped (exit code {:?})", name, exit_code)
        }
        Event::CommandExecuted { .. } => {}
    });

    let service = Arc::new(OrchestrationService::new(config.clone(), events));
    let scheduler = TaskScheduler::new(
        service.clone(),
        TaskStore::new(config.tasks_file_path()),
        &config.scheduler,
    );
    let groups = GroupCoordinator::new(
        service.clone(),
        GroupStore::new(config.groups_file_path()),
        &config.groups,
    );

    match scheduler.recover() {
        Ok(n) => tracing::info!("Recovered {} scheduled tasks", n),
        Err(e) => tracing::error!("Could not recover scheduled tasks: {}", e),
    }
    match groups.load() {
        Ok(n) => tracing::info!("Loaded {} server groups", n),
        Err(e) => tracing::error!("Could not load server groups: {}", e),
    }

    // 서버 콘솔 출력을 터미널로 중계
    let mut console = service.subscribe_console();
    tokio::spawn(async move {
        loop {
            match console.recv().await {
                Ok(line) => println!("[{}] {}", line.server, line.content),
                Err(RecvError::Lagged(n)) => tracing::warn!("Console output skipped {} lines", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let dispatcher = Dispatcher::new(service.clone(), scheduler.clone(), groups.clone());
    let exit = dispatcher.exit_token();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("Type 'help' for a list of commands.");

    loop {
        tokio::select! {
            _ = exit.cancelled() => break,
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Shutdown signal received");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match dispatcher.execute(&line).await {
                    Ok(reply) if reply.is_empty() => {}
                    Ok(reply) => println!("{}", reply),
                    Err(e) => println!("✗ {}", e),
                },
                Ok(None) => {
                    tracing::info!("stdin closed");
                    break;
                }
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
    }

    scheduler.shutdown();
    service.shutdown_all(config.groups.stop_timeout()).await;
    tracing::info!("craftvisor shut down");
    Ok(())
}
