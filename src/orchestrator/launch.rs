//! Command-line templates for the five launch modes.

use crate::config::CORE_JAR;
use crate::error::{OrchestratorError, Result};
use crate::model::{LaunchMode, Server};
use crate::supervisor::ProcessSpec;

/// Tuned flags shared by the core and modpack modes.
const TUNED_JVM_FLAGS: &[&str] = &[
    "-Xms128M",
    "-Xmx23347M",
    "-Dterminal.jline=false",
    "-Dterminal.ansi=true",
    "-Dfile.encoding=UTF-8",
    "-Dlog4j2.formatMsgNoLookups=true",
    "-Duser.timezone=Asia/Shanghai",
    "-Dfunction.permission.level=4",
    "-Dop.permission.level=4",
];

const PERMISSION_FLAGS: &[&str] = &["-Dfunction.permission.level=4", "-Dop.permission.level=4"];

const CHANNEL_LIMIT_FIX: &str = "-Dpaper.disableChannelLimit=true";

/// Argument file read by modpack launchers instead of `-jar`.
pub const MODPACK_ARGS_FILE: &str = "@cnmforge.txt";

/// Arguments after the java executable for `mode`.
///
/// `jvm_args` and `process_args` only matter for [`LaunchMode::Custom`],
/// where they are split on whitespace.
pub fn build_args(
    mode: LaunchMode,
    jvm_args: Option<&str>,
    process_args: Option<&str>,
) -> Result<Vec<String>> {
    let owned = |flags: &[&str]| flags.iter().map(|f| f.to_string()).collect::<Vec<_>>();

    let args = match mode {
        LaunchMode::Core => {
            let mut args = owned(TUNED_JVM_FLAGS);
            args.extend(owned(&["-jar", CORE_JAR, "-nogui"]));
            args
        }
        LaunchMode::Modpack => {
            let mut args = owned(TUNED_JVM_FLAGS);
            args.extend(owned(&[MODPACK_ARGS_FILE, "-nogui"]));
            args
        }
        LaunchMode::Basic => {
            let mut args = owned(PERMISSION_FLAGS);
            args.extend(owned(&["-jar", CORE_JAR]));
            args
        }
        LaunchMode::BasicFix => {
            let mut args = owned(PERMISSION_FLAGS);
            args.push(CHANNEL_LIMIT_FIX.to_string());
            args.extend(owned(&["-jar", CORE_JAR]));
            args
        }
        LaunchMode::Custom => {
            let jvm: Vec<String> = split_args(jvm_args);
            let process: Vec<String> = split_args(process_args);
            if jvm.is_empty() && process.is_empty() {
                return Err(OrchestratorError::InvalidConfig(
                    "custom launch mode needs JVM args or process args".to_string(),
                ));
            }
            let mut args = jvm;
            args.extend(owned(&["-jar", CORE_JAR]));
            args.extend(process);
            args
        }
    };
    Ok(args)
}

/// Full process spec for `server`: java + mode args, run inside the server's
/// own directory.
pub fn build_spec(
    server: &Server,
    mode: LaunchMode,
    java: &str,
    jvm_args: Option<&str>,
    process_args: Option<&str>,
) -> Result<ProcessSpec> {
    Ok(ProcessSpec {
        server: server.name.clone(),
        program: java.to_string(),
        args: build_args(mode, jvm_args, process_args)?,
        working_dir: server.working_dir(),
    })
}

fn split_args(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| s.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}
