//! Console command surface: a static verb table and the dispatcher that maps
//! a typed line onto the orchestration, scheduler and group services.

use anyhow::{anyhow, bail, Context};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::events::Event;
use crate::group::{GroupCoordinator, GroupReport};
use crate::model::task::datetime_format;
use crate::model::{Group, LaunchMode, ScheduledTask, ServerPatch, TaskType};
use crate::orchestrator::OrchestrationService;
use crate::scheduler::TaskScheduler;

const DEFAULT_CONSOLE_LINES: usize = 20;
const DEFAULT_BACKUP_RETENTION_DAYS: u32 = 7;
const GROUP_CREATE_USAGE: &str =
    "group create <name> [mode 1-5] [jvm-args|-] [process-args|-] [min-memory|-] [max-memory|-] [--ordered]";
const CONSOLE_SENDER: &str = "console";

#[derive(Debug, Clone, Copy)]
pub struct CommandDescriptor {
    pub name: &'static str,
    pub aliases: &'static [&'static str],
    pub description: &'static str,
    pub usage: &'static str,
}

pub static COMMANDS: &[CommandDescriptor] = &[
    CommandDescriptor {
        name: "create",
        aliases: &["new"],
        description: "Create a server from a core template",
        usage: "create <core-file> <name> [description]",
    },
    CommandDescriptor {
        name: "add",
        aliases: &[],
        description: "Register an existing server directory",
        usage: "add <path> <name> <version> [description] [jvm-args] [process-args]",
    },
    CommandDescriptor {
        name: "copy",
        aliases: &["cp"],
        description: "Duplicate a server under a new name",
        usage: "copy <source> <target>",
    },
    CommandDescriptor {
        name: "delete",
        aliases: &["rm"],
        description: "Remove a server (add --files to delete its directory)",
        usage: "delete <name> [--files]",
    },
    CommandDescriptor {
        name: "list",
        aliases: &["ls"],
        description: "List servers, core templates or maps",
        usage: "list [templates|maps]",
    },
    CommandDescriptor {
        name: "start",
        aliases: &[],
        description: "Start a server with an explicit launch mode (1-5)",
        usage: "start <name> <mode> [java|-] [jvm-args|-] [process-args|-]",
    },
    CommandDescriptor {
        name: "start-default",
        aliases: &["sd"],
        description: "Start a server with its stored default arguments",
        usage: "start-default <name> [mode]",
    },
    CommandDescriptor {
        name: "last",
        aliases: &[],
        description: "Start again with the parameters of the last launch",
        usage: "last",
    },
    CommandDescriptor {
        name: "stop",
        aliases: &[],
        description: "Gracefully stop a running server",
        usage: "stop <name>",
    },
    CommandDescriptor {
        name: "force-stop",
        aliases: &["kill"],
        description: "Kill a running server",
        usage: "force-stop <name>",
    },
    CommandDescriptor {
        name: "send",
        aliases: &[],
        description: "Send a console command to one server or to all",
        usage: "send <name|all> <command...>",
    },
    CommandDescriptor {
        name: "running",
        aliases: &["ps"],
        description: "List running servers with resource usage",
        usage: "running",
    },
    CommandDescriptor {
        name: "backup",
        aliases: &[],
        description: "Back up a server, list backups or prune old ones",
        usage: "backup <name> | backup list [server] | backup prune [days]",
    },
    CommandDescriptor {
        name: "batch",
        aliases: &[],
        description: "Start (with defaults) or stop several servers at once",
        usage: "batch <start|stop> <name...>",
    },
    CommandDescriptor {
        name: "switch",
        aliases: &[],
        description: "Replace a server's core with another template",
        usage: "switch <name> <core-file>",
    },
    CommandDescriptor {
        name: "map",
        aliases: &[],
        description: "Install a map as the server's world",
        usage: "map <name> <map>",
    },
    CommandDescriptor {
        name: "config",
        aliases: &[],
        description: "Show or change a server's stored settings",
        usage: "config <name> [description|map|jvm-args|process-args|min-memory|max-memory <value>]",
    },
    CommandDescriptor {
        name: "console",
        aliases: &["log"],
        description: "Show recent console output of a server",
        usage: "console <name> [lines]",
    },
    CommandDescriptor {
        name: "group",
        aliases: &["g"],
        description: "Manage server groups",
        usage: "group <create|delete|add|remove|list|info|ordered|trigger|start|start-concurrent|start-ordered|next|cancel|stop> ...",
    },
    CommandDescriptor {
        name: "schedule",
        aliases: &["sched"],
        description: "Manage scheduled tasks",
        usage: "schedule <add|remove|list|start|stop|command|backup|restart> ...",
    },
    CommandDescriptor {
        name: "task",
        aliases: &[],
        description: "Enable, disable or move scheduled tasks",
        usage: "task <enable|disable|reschedule|list-enabled|list-disabled|clear-all> ...",
    },
    CommandDescriptor {
        name: "help",
        aliases: &["?"],
        description: "Show available commands",
        usage: "help [command]",
    },
    CommandDescriptor {
        name: "exit",
        aliases: &["quit"],
        description: "Stop every server and exit",
        usage: "exit",
    },
];

/// Case-insensitive lookup over names and aliases.
pub fn lookup(verb: &str) -> Option<&'static CommandDescriptor> {
    COMMANDS.iter().find(|c| {
        c.name.eq_ignore_ascii_case(verb) || c.aliases.iter().any(|a| a.eq_ignore_ascii_case(verb))
    })
}

/// Positional arguments after the verb (or sub-verb).
struct Args<'a> {
    items: &'a [String],
    usage: &'static str,
}

impl<'a> Args<'a> {
    fn new(items: &'a [String], usage: &'static str) -> Self {
        Self { items, usage }
    }

    fn required(&self, index: usize) -> anyhow::Result<&'a str> {
        self.items
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("Usage: {}", self.usage))
    }

    /// `-` or a missing argument both mean "not given".
    fn optional(&self, index: usize) -> Option<&'a str> {
        self.items.get(index).map(String::as_str).filter(|s| *s != "-")
    }

    fn rest(&self, from: usize) -> anyhow::Result<String> {
        if from >= self.items.len() {
            bail!("Usage: {}", self.usage);
        }
        Ok(self.items[from..].join(" "))
    }

    fn sub(&self, from: usize) -> Args<'a> {
        Args {
            items: self.items.get(from..).unwrap_or(&[]),
            usage: self.usage,
        }
    }
}

pub struct Dispatcher {
    service: Arc<OrchestrationService>,
    scheduler: Arc<TaskScheduler>,
    groups: Arc<GroupCoordinator>,
    exit: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        service: Arc<OrchestrationService>,
        scheduler: Arc<TaskScheduler>,
        groups: Arc<GroupCoordinator>,
    ) -> Self {
        Self {
            service,
            scheduler,
            groups,
            exit: CancellationToken::new(),
        }
    }

    /// Cancelled once `exit` has been executed.
    pub fn exit_token(&self) -> CancellationToken {
        self.exit.clone()
    }

    /// Run one console line. Empty lines yield an empty reply.
    pub async fn execute(&self, line: &str) -> anyhow::Result<String> {
        let tokens = shlex::split(line.trim()).ok_or_else(|| anyhow!("Unbalanced quotes in command"))?;
        let Some((verb, rest)) = tokens.split_first() else {
            return Ok(String::new());
        };
        let descriptor = lookup(verb)
            .ok_or_else(|| anyhow!("Unknown command '{}'. Type 'help' for a list.", verb))?;

        self.service.events().dispatch(&Event::CommandExecuted {
            verb: descriptor.name.to_string(),
            args: rest.to_vec(),
            sender: CONSOLE_SENDER.to_string(),
        });

        let args = Args::new(rest, descriptor.usage);
        match descriptor.name {
            "create" => self.create(&args).await,
            "add" => self.add(&args),
            "copy" => {
                let server = self.service.copy_server(args.required(0)?, args.required(1)?).await?;
                Ok(format!("✓ Copied to '{}' ({})", server.name, server.working_dir().display()))
            }
            "delete" => {
                let name = args.required(0)?;
                let delete_files = rest.iter().any(|a| a == "--files");
                self.service.delete_server(name, delete_files).await?;
                Ok(format!("✓ Deleted server '{}'", name))
            }
            "list" => self.list(&args),
            "start" => self.start(&args).await,
            "start-default" => self.start_default(&args).await,
            "last" => {
                let process = self.service.relaunch_last().await?;
                Ok(format!("✓ Relaunched '{}' (PID {})", process.server, process.pid))
            }
            "stop" => {
                let name = args.required(0)?;
                self.service.stop_server(name).await?;
                Ok(format!("✓ Stop requested for '{}'", name))
            }
            "force-stop" => {
                let name = args.required(0)?;
                let exit = self.service.force_stop_server(name).await?;
                Ok(format!("✓ Killed '{}' ({})", name, exit))
            }
            "send" => self.send(&args).await,
            "running" => self.running().await,
            "backup" => self.backup(&args).await,
            "batch" => self.batch(&args).await,
            "switch" => {
                let server = self
                    .service
                    .switch_core_version(args.required(0)?, args.required(1)?)
                    .await?;
                Ok(format!("✓ '{}' now runs version {}", server.name, server.version))
            }
            "map" => {
                let map = args.required(1)?;
                let server = self.service.switch_map(args.required(0)?, map).await?;
                Ok(format!("✓ '{}' now uses map '{}'", server.name, map))
            }
            "config" => self.config(&args),
            "console" => self.console(&args).await,
            "group" => self.group(&args).await,
            "schedule" => self.schedule(&args),
            "task" => self.task(&args),
            "help" => Ok(help(args.optional(0))),
            "exit" => {
                self.exit.cancel();
                Ok("Shutting down...".to_string())
            }
            other => bail!("Command '{}' has no handler", other),
        }
    }

    // ─── Servers ────────────────────────────────────────────

    async fn create(&self, args: &Args<'_>) -> anyhow::Result<String> {
        let core_file = args.required(0)?;
        let name = args.required(1)?;
        let description = args.optional(2).unwrap_or_default();
        let server = self.service.create_server(core_file, name, description).await?;
        Ok(format!("✓ Created '{}' (version {})", server.name, server.version))
    }

    fn add(&self, args: &Args<'_>) -> anyhow::Result<String> {
        let server = self.service.add_existing_server(
            Path::new(args.required(0)?),
            args.required(1)?,
            args.required(2)?,
            args.optional(3).unwrap_or_default(),
            args.optional(4),
            args.optional(5),
        )?;
        Ok(format!("✓ Added '{}' at {}", server.name, server.working_dir().display()))
    }

    fn list(&self, args: &Args<'_>) -> anyhow::Result<String> {
        match args.optional(0) {
            Some("templates") | Some("cores") => Ok(bullet_list("core template", self.service.list_templates())),
            Some("maps") => Ok(bullet_list("map", self.service.list_maps())),
            Some(other) => bail!("Unknown list target '{}'. Usage: {}", other, args.usage),
            None => {
                let servers = self.service.list_servers()?;
                if servers.is_empty() {
                    return Ok("No servers configured.".to_string());
                }
                let mut out = format!("{} server(s):", servers.len());
                for s in &servers {
                    let _ = write!(out, "\n  {} [{}]", s.name, s.version);
                    if let Some(group) = &s.group {
                        let _ = write!(out, " group={}", group);
                    }
                    if !s.description.is_empty() {
                        let _ = write!(out, " - {}", s.description);
                    }
                }
                Ok(out)
            }
        }
    }

    async fn start(&self, args: &Args<'_>) -> anyhow::Result<String> {
        let server = self.service.find_server(args.required(0)?)?;
        let mode = parse_mode(args.required(1)?)?;
        let process = self
            .service
            .start_server(&server, mode, args.optional(2), args.optional(3), args.optional(4))
            .await?;
        Ok(format!("✓ Started '{}' in {} mode (PID {})", server.name, mode.label(), process.pid))
    }

    async fn start_default(&self, args: &Args<'_>) -> anyhow::Result<String> {
        let server = self.service.find_server(args.required(0)?)?;
        let mode = match args.optional(1) {
            Some(raw) => parse_mode(raw)?,
            None => LaunchMode::try_from(i64::from(self.service.config().scheduler.default_launch_mode))?,
        };
        let process = self.service.start_with_defaults(&server, mode, None).await?;
        Ok(format!("✓ Started '{}' with defaults (PID {})", server.name, process.pid))
    }

    async fn send(&self, args: &Args<'_>) -> anyhow::Result<String> {
        let target = args.required(0)?;
        let command = args.rest(1)?;
        if !target.eq_ignore_ascii_case("all") {
            self.service.send_command(target, &command).await?;
            return Ok(format!("✓ Sent to '{}': {}", target, command));
        }

        let names = self.service.running_names().await;
        if names.is_empty() {
            return Ok("No servers are running.".to_string());
        }
        let mut out = String::new();
        let mut sent = 0;
        for name in &names {
            match self.service.send_command(name, &command).await {
                Ok(()) => {
                    sent += 1;
                    let _ = writeln!(out, "  ✓ {}", name);
                }
                Err(e) => {
                    let _ = writeln!(out, "  ✗ {}: {}", name, e);
                }
            }
        }
        let _ = write!(out, "Sent to {}/{} servers", sent, names.len());
        Ok(out)
    }

    async fn running(&self) -> anyhow::Result<String> {
        let running = self.service.list_running().await;
        if running.is_empty() {
            return Ok("No servers are running.".to_string());
        }
        let mut out = format!("{} running:", running.len());
        for info in &running {
            let memory = info
                .memory_bytes
                .map(|b| format!("{} MB", b / (1024 * 1024)))
                .unwrap_or_else(|| "-".to_string());
            let cpu = info
                .cpu_percent
                .map(|c| format!("{:.1}%", c))
                .unwrap_or_else(|| "-".to_string());
            let _ = write!(
                out,
                "\n  ▶ {} | PID {} | up {}s | mem {} | cpu {}",
                info.name, info.pid, info.uptime_secs, memory, cpu
            );
        }
        Ok(out)
    }

    async fn backup(&self, args: &Args<'_>) -> anyhow::Result<String> {
        match args.required(0)? {
            "list" => {
                let server = args.optional(1);
                let backups: Vec<_> = self
                    .service
                    .list_backups()
                    .await?
                    .into_iter()
                    .filter(|b| server.map_or(true, |s| b.server == s))
                    .collect();
                if backups.is_empty() {
                    return Ok("No backups found.".to_string());
                }
                let mut out = format!("{} backup(s):", backups.len());
                for b in &backups {
                    let _ = write!(
                        out,
                        "\n  {} | {} | {}",
                        b.taken_at.format(datetime_format::FORMAT),
                        b.server,
                        b.path.display()
                    );
                }
                Ok(out)
            }
            "prune" => {
                let days = match args.optional(1) {
                    Some(raw) => raw.parse().with_context(|| format!("'{}' is not a number of days", raw))?,
                    None => DEFAULT_BACKUP_RETENTION_DAYS,
                };
                let removed = self.service.prune_backups(days).await?;
                Ok(format!("✓ Removed {} backup folder(s) older than {} day(s)", removed, days))
            }
            name => {
                let path = self.service.create_backup(name).await?;
                Ok(format!("✓ Backup written to {}", path.display()))
            }
        }
    }

    async fn batch(&self, args: &Args<'_>) -> anyhow::Result<String> {
        let action = args.required(0)?.to_ascii_lowercase();
        let names = args.items.get(1..).unwrap_or(&[]);
        if names.is_empty() {
            bail!("Usage: {}", args.usage);
        }
        let (verb, report) = match action.as_str() {
            "start" => {
                let mode = LaunchMode::try_from(i64::from(self.service.config().scheduler.default_launch_mode))?;
                ("started", self.service.batch_start(names, mode).await)
            }
            "stop" => ("stopped", self.service.batch_stop(names).await),
            other => bail!("Unknown batch action '{}'. Usage: {}", other, args.usage),
        };
        let mut out = String::new();
        for name in &report.succeeded {
            let _ = writeln!(out, "  ✓ {}", name);
        }
        for (name, err) in &report.failed {
            let _ = writeln!(out, "  ✗ {}: {}", name, err);
        }
        let _ = write!(out, "{} {}/{} servers", verb, report.succeeded.len(), names.len());
        Ok(out)
    }

    fn config(&self, args: &Args<'_>) -> anyhow::Result<String> {
        let name = args.required(0)?;
        let Some(field) = args.optional(1) else {
            let server = self.service.find_server(name)?;
            return Ok(serde_json::to_string_pretty(&server)?);
        };
        let value = args.items.get(2..).map(|v| v.join(" ")).unwrap_or_default();
        let mut patch = ServerPatch::default();
        match field {
            "description" => patch.description = Some(value),
            "map" => patch.map = Some(value),
            "jvm-args" => patch.default_jvm_args = Some(value),
            "process-args" => patch.default_process_args = Some(value),
            "min-memory" => patch.min_memory = Some(value),
            "max-memory" => patch.max_memory = Some(value),
            other => bail!("Unknown setting '{}'. Usage: {}", other, args.usage),
        }
        self.service.configure_server(name, patch)?;
        Ok(format!("✓ Updated {} of '{}'", field, name))
    }

    async fn console(&self, args: &Args<'_>) -> anyhow::Result<String> {
        let name = args.required(0)?;
        let count = match args.optional(1) {
            Some(raw) => raw.parse().with_context(|| format!("'{}' is not a line count", raw))?,
            None => DEFAULT_CONSOLE_LINES,
        };
        let lines = self.service.console(name, None, count).await?;
        Ok(lines
            .iter()
            .map(|l| format!("{:>6} {}", l.id, l.content))
            .collect::<Vec<_>>()
            .join("\n"))
    }

    // ─── Groups ─────────────────────────────────────────────

    async fn group(&self, args: &Args<'_>) -> anyhow::Result<String> {
        let sub = args.required(0)?.to_ascii_lowercase();
        let a = args.sub(1);
        match sub.as_str() {
            "create" => {
                let positional: Vec<String> = a.items.iter().filter(|s| *s != "--ordered").cloned().collect();
                let p = Args::new(&positional, GROUP_CREATE_USAGE);
                let mut group = Group::new(p.required(0)?);
                group.ordered_startup = positional.len() != a.items.len();
                if let Some(raw) = p.optional(1) {
                    group.launch_mode = parse_mode(raw)?.number();
                }
                group.preset_jvm_args = p.optional(2).map(str::to_string);
                group.preset_process_args = p.optional(3).map(str::to_string);
                group.min_memory = p.optional(4).map(str::to_string);
                group.max_memory = p.optional(5).map(str::to_string);
                let group = self.groups.create_group(group)?;
                Ok(format!(
                    "✓ Created group '{}' (mode {}{})",
                    group.name,
                    group.launch_mode,
                    if group.ordered_startup { ", ordered" } else { "" }
                ))
            }
            "delete" => {
                let group = self.groups.delete_group(a.required(0)?)?;
                Ok(format!("✓ Deleted group '{}'", group.name))
            }
            "add" => {
                let (group, server) = (a.required(0)?, a.required(1)?);
                if self.groups.add_member(group, server)? {
                    Ok(format!("✓ Added '{}' to '{}'", server, group))
                } else {
                    Ok(format!("'{}' is already in '{}'", server, group))
                }
            }
            "remove" => {
                let (group, server) = (a.required(0)?, a.required(1)?);
                if self.groups.remove_member(group, server)? {
                    Ok(format!("✓ Removed '{}' from '{}'", server, group))
                } else {
                    Ok(format!("'{}' is not in '{}'", server, group))
                }
            }
            "list" => {
                let groups = self.groups.list_groups();
                if groups.is_empty() {
                    return Ok("No groups configured.".to_string());
                }
                let mut out = format!("{} group(s):", groups.len());
                for g in &groups {
                    let _ = write!(
                        out,
                        "\n  {} ({} members{})",
                        g.name,
                        g.member_names.len(),
                        if g.ordered_startup { ", ordered" } else { "" }
                    );
                }
                Ok(out)
            }
            "info" => {
                let group = self.groups.group_info(a.required(0)?)?;
                Ok(serde_json::to_string_pretty(&group)?)
            }
            "ordered" => {
                let flag = parse_switch(a.required(1)?)?;
                let group = self.groups.set_ordered(a.required(0)?, flag)?;
                Ok(format!("✓ Ordered startup of '{}' is {}", group.name, on_off(flag)))
            }
            "trigger" => {
                let name = a.required(0)?;
                let keyword = a.required(1)?;
                let delay_ms = match a.optional(2) {
                    Some(raw) => raw.parse().with_context(|| format!("'{}' is not a delay in ms", raw))?,
                    None => self.groups.group_info(name)?.startup_delay_ms,
                };
                self.groups.set_trigger(name, keyword, delay_ms)?;
                Ok(format!("✓ '{}' waits for \"{}\" then {} ms", name, keyword, delay_ms))
            }
            "start" => {
                let name = a.required(0)?;
                if self.groups.group_info(name)?.ordered_startup {
                    self.spawn_ordered(name)
                } else {
                    Ok(report_summary("started", &self.groups.start_concurrently(name).await?))
                }
            }
            "start-concurrent" => {
                Ok(report_summary("started", &self.groups.start_concurrently(a.required(0)?).await?))
            }
            "start-ordered" => self.spawn_ordered(a.required(0)?),
            "next" => {
                let name = a.required(0)?;
                self.groups.advance_manually(name)?;
                Ok(format!("✓ Advancing ordered startup of '{}'", name))
            }
            "cancel" => {
                let name = a.required(0)?;
                self.groups.cancel_ordered(name)?;
                Ok(format!("✓ Cancelling ordered startup of '{}'", name))
            }
            "stop" => Ok(report_summary("stopped", &self.groups.stop_group(a.required(0)?).await?)),
            other => bail!("Unknown group action '{}'. Usage: {}", other, args.usage),
        }
    }

    /// Ordered startup can take minutes, so it runs in the background and
    /// stays controllable through `group next` / `group cancel`.
    fn spawn_ordered(&self, name: &str) -> anyhow::Result<String> {
        self.groups.group_info(name)?;
        if self.groups.ordered_in_progress(name) {
            bail!("Ordered startup of '{}' is already in progress", name);
        }
        let groups = self.groups.clone();
        let group = name.to_string();
        tokio::spawn(async move {
            match groups.start_ordered(&group).await {
                Ok(report) => tracing::info!("{}", report_summary("started", &report)),
                Err(e) => tracing::error!("Ordered startup of '{}' failed: {}", group, e),
            }
        });
        Ok(format!(
            "✓ Ordered startup of '{0}' running; use 'group next {0}' to skip a wait",
            name
        ))
    }

    // ─── Scheduler ──────────────────────────────────────────

    fn schedule(&self, args: &Args<'_>) -> anyhow::Result<String> {
        let sub = args.required(0)?.to_ascii_lowercase();
        let a = args.sub(1);
        let task = match sub.as_str() {
            "add" | "create" => {
                let task_type: TaskType = a.required(2)?.parse().map_err(|e: String| anyhow!(e))?;
                let task = ScheduledTask::new(a.required(0)?, a.required(1)?, task_type, parse_time(a.required(3)?)?);
                match a.items.get(4..).filter(|r| !r.is_empty()) {
                    Some(command) => task.with_command(&command.join(" ")),
                    None => task,
                }
            }
            "remove" | "delete" => {
                let id = a.required(0)?;
                return if self.scheduler.cancel(id) {
                    Ok(format!("✓ Removed task {}", id))
                } else {
                    bail!("Task '{}' not found", id)
                };
            }
            "list" => return Ok(task_table(&self.scheduler.list_all())),
            "start" => shortcut(&a, "start", TaskType::StartServer)?,
            "stop" => shortcut(&a, "stop", TaskType::StopServer)?,
            "backup" => shortcut(&a, "backup", TaskType::CreateBackup)?,
            "restart" => shortcut(&a, "restart", TaskType::RestartServer)?,
            "command" => {
                let server = a.required(0)?;
                ScheduledTask::new(
                    &format!("command-{}", server),
                    server,
                    TaskType::SendCommand,
                    parse_time(a.required(1)?)?,
                )
                .with_command(&a.rest(2)?)
            }
            other => bail!("Unknown schedule action '{}'. Usage: {}", other, args.usage),
        };

        let time = task.scheduled_time;
        let (kind, server) = (task.task_type, task.server_name.clone());
        let id = self.scheduler.schedule(task)?;
        Ok(format!(
            "✓ Scheduled {} on '{}' at {} (id {})",
            kind,
            server,
            time.format(datetime_format::FORMAT),
            id
        ))
    }

    fn task(&self, args: &Args<'_>) -> anyhow::Result<String> {
        let sub = args.required(0)?.to_ascii_lowercase();
        let a = args.sub(1);
        match sub.as_str() {
            "enable" | "disable" => {
                let enabled = sub == "enable";
                let task = self.scheduler.set_enabled(a.required(0)?, enabled)?;
                Ok(format!("✓ Task {} {}", task.task_id, if enabled { "enabled" } else { "disabled" }))
            }
            "reschedule" => {
                let time = parse_time(a.required(1)?)?;
                let task = self.scheduler.reschedule(a.required(0)?, time)?;
                Ok(format!("✓ Task {} moved to {}", task.task_id, time.format(datetime_format::FORMAT)))
            }
            "list-enabled" => Ok(task_table(&self.scheduler.list_enabled(true))),
            "list-disabled" => Ok(task_table(&self.scheduler.list_enabled(false))),
            "clear-all" => Ok(format!("✓ Cleared {} tasks", self.scheduler.clear_all()?)),
            other => bail!("Unknown task action '{}'. Usage: {}", other, args.usage),
        }
    }
}

/// `schedule <verb> <server> <time>`; the task is named `<verb>-<server>`.
fn shortcut(args: &Args<'_>, verb: &str, task_type: TaskType) -> anyhow::Result<ScheduledTask> {
    let server = args.required(0)?;
    let time = parse_time(args.required(1)?)?;
    Ok(ScheduledTask::new(&format!("{}-{}", verb, server), server, task_type, time))
}

fn parse_mode(raw: &str) -> anyhow::Result<LaunchMode> {
    let number: i64 = raw
        .parse()
        .with_context(|| format!("'{}' is not a launch mode (1-5)", raw))?;
    Ok(LaunchMode::try_from(number)?)
}

fn parse_time(raw: &str) -> anyhow::Result<chrono::NaiveDateTime> {
    datetime_format::parse(raw)
        .ok_or_else(|| anyhow!("Invalid time '{}'; expected yyyy-MM-dd HH:mm:ss", raw))
}

fn parse_switch(raw: &str) -> anyhow::Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" => Ok(true),
        "off" | "false" | "no" => Ok(false),
        other => bail!("Expected on/off, got '{}'", other),
    }
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

fn bullet_list(what: &str, names: Vec<String>) -> String {
    if names.is_empty() {
        return format!("No {}s found.", what);
    }
    let mut out = format!("{} {}(s):", names.len(), what);
    for name in names {
        let _ = write!(out, "\n  {}", name);
    }
    out
}

fn task_table(tasks: &[ScheduledTask]) -> String {
    if tasks.is_empty() {
        return "No scheduled tasks.".to_string();
    }
    let mut out = format!("{} task(s):", tasks.len());
    for t in tasks {
        let _ = write!(
            out,
            "\n  {} | {} | {} on '{}' at {}{}{}",
            t.task_id,
            t.task_name,
            t.task_type,
            t.server_name,
            t.scheduled_time.format(datetime_format::FORMAT),
            if t.recurring { " (recurring)" } else { "" },
            if t.enabled { "" } else { " [disabled]" }
        );
        if let Some(command) = &t.command {
            let _ = write!(out, " `{}`", command);
        }
    }
    out
}

fn report_summary(action: &str, report: &GroupReport) -> String {
    let mut out = format!(
        "Group '{}' {}: {} ok, {} failed{}",
        report.group,
        action,
        report.succeeded.len(),
        report.failed.len(),
        if report.cancelled { " (cancelled)" } else { "" }
    );
    for (member, error) in &report.failed {
        let _ = write!(out, "\n  ✗ {}: {}", member, error);
    }
    out
}

fn help(topic: Option<&str>) -> String {
    if let Some(topic) = topic {
        return match lookup(topic) {
            Some(c) => format!("{} - {}\nUsage: {}", c.name, c.description, c.usage),
            None => format!("Unknown command '{}'", topic),
        };
    }
    let width = COMMANDS.iter().map(|c| c.name.len()).max().unwrap_or(0);
    let mut out = String::from("Available commands:");
    for c in COMMANDS {
        let _ = write!(out, "\n  {:<width$}  {}", c.name, c.description, width = width);
    }
    out
}
