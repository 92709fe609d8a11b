//! Per-process resource sampling for the running-servers listing.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use sysinfo::{Pid, System};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_bytes: u64,
    pub cpu_percent: f32,
}

/// Sample memory and CPU for every pid at once.
///
/// CPU usage needs two refreshes spaced by sysinfo's minimum interval, so
/// this blocks for that long. Pids that vanished are simply absent.
pub fn sample(pids: &[u32]) -> HashMap<u32, ResourceUsage> {
    let mut usage = HashMap::new();
    if pids.is_empty() {
        return usage;
    }

    let mut sys = System::new();
    sys.refresh_processes();
    std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);
    sys.refresh_processes();

    for &pid in pids {
        if let Some(process) = sys.process(Pid::from_u32(pid)) {
            usage.insert(
                pid,
                ResourceUsage {
                    memory_bytes: process.memory(),
                    cpu_percent: process.cpu_usage(),
                },
            );
        }
    }
    tracing::debug!("Sampled resources for {}/{} processes", usage.len(), pids.len());
    usage
}

// sysinfo 시스템 콜은 동기적으로 프로세스 테이블을 스캔하므로
// spawn_blocking 전용 스레드풀에서 실행합니다.
pub async fn sample_async(pids: Vec<u32>) -> HashMap<u32, ResourceUsage> {
    tokio::task::spawn_blocking(move || sample(&pids))
        .await
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input() {
        assert!(sample(&[]).is_empty());
    }

    #[test]
    fn test_samples_own_process() {
        let me = std::process::id();
        let usage = sample(&[me]);
        let own = usage.get(&me).expect("own process should be visible");
        assert!(own.memory_bytes > 0);
    }

    #[tokio::test]
    async fn test_unknown_pid_is_absent() {
        let usage = sample_async(vec![u32::MAX - 1]).await;
        assert!(usage.is_empty());
    }
}
