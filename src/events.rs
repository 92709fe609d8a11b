//! Priority-ordered event listeners for server lifecycle and commands.

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EventPriority {
    Lowest,
    Low,
    Normal,
    High,
    Highest,
    /// Observe only; always runs after every other priority.
    Monitor,
}

impl EventPriority {
    /// Dispatch position: higher priorities first, `Monitor` last.
    fn rank(self) -> u8 {
        match self {
            EventPriority::Highest => 0,
            EventPriority::High => 1,
            EventPriority::Normal => 2,
            EventPriority::Low => 3,
            EventPriority::Lowest => 4,
            EventPriority::Monitor => 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    ServerStarted { name: String, pid: u32 },
    ServerStopped { name: String, exit_code: Option<i32> },
    CommandExecuted { verb: String, args: Vec<String>, sender: String },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::ServerStarted { .. } => "server_started",
            Event::ServerStopped { .. } => "server_stopped",
            Event::CommandExecuted { .. } => "command_executed",
        }
    }
}

pub type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

struct Registered {
    priority: EventPriority,
    listener: Listener,
}

/// Listeners are kept sorted by priority at registration time, so dispatch is
/// a plain walk. Equal priorities run in registration order.
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<Vec<Registered>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, priority: EventPriority, listener: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let at = listeners
            .iter()
            .position(|r| r.priority.rank() > priority.rank())
            .unwrap_or(listeners.len());
        listeners.insert(
            at,
            Registered {
                priority,
                listener: Arc::new(listener),
            },
        );
    }

    pub fn len(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver `event` to every listener. A panicking listener is logged and
    /// skipped; the rest still run.
    pub fn dispatch(&self, event: &Event) {
        let snapshot: Vec<(EventPriority, Listener)> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            listeners.iter().map(|r| (r.priority, r.listener.clone())).collect()
        };
        for (priority, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::error!("{:?} listener panicked while handling {}", priority, event.name());
            }
        }
    }
}
