//! Locating a usable `java` executable.

use glob::glob;
use std::path::{Path, PathBuf};

/// Used when nothing better is found; resolved through `PATH` at spawn time.
pub const FALLBACK_JAVA: &str = "java";

#[cfg(target_os = "windows")]
const JAVA_EXE: &str = "java.exe";
#[cfg(not(target_os = "windows"))]
const JAVA_EXE: &str = "java";

/// Platform-specific directories whose sub-directories are JDK/JRE installs.
pub fn default_search_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    #[cfg(target_os = "windows")]
    {
        roots.push(PathBuf::from(r"C:\Program Files\Java"));
        roots.push(PathBuf::from(r"C:\Program Files (x86)\Java"));
    }

    #[cfg(not(target_os = "windows"))]
    {
        roots.push(PathBuf::from("/usr/lib/jvm"));
        roots.push(PathBuf::from("/usr/java"));
        roots.push(PathBuf::from("/Library/Java/JavaVirtualMachines"));
        // bundled runtimes next to the daemon
        roots.push(PathBuf::from("java"));
    }

    roots
}

#[cfg(unix)]
pub fn is_executable(path: &Path) -> bool {
    use nix::unistd::{access, AccessFlags};
    path.is_file() && access(path, AccessFlags::X_OK).is_ok()
}

#[cfg(not(unix))]
pub fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Every `<root>/<install>/bin/java` that exists and is executable.
pub fn find_installed(roots: &[PathBuf]) -> Vec<PathBuf> {
    let mut found = Vec::new();

    if let Some(home) = std::env::var_os("JAVA_HOME") {
        let candidate = PathBuf::from(home).join("bin").join(JAVA_EXE);
        if is_executable(&candidate) {
            found.push(candidate);
        }
    }

    for root in roots {
        if !root.is_dir() {
            continue;
        }
        let pattern = root.join("*").join("bin").join(JAVA_EXE);
        let Some(pattern) = pattern.to_str() else {
            continue;
        };
        match glob(pattern) {
            Ok(paths) => {
                for path in paths.flatten() {
                    if is_executable(&path) && !found.contains(&path) {
                        found.push(path);
                    }
                }
            }
            Err(e) => tracing::debug!("Bad java search pattern {}: {}", pattern, e),
        }
    }
    found
}

/// Pick the java executable for a launch.
///
/// An explicit path wins only if it exists and is executable; otherwise the
/// first install under `roots` is used, and failing that plain `java`.
pub fn resolve_java(explicit: Option<&str>, roots: &[PathBuf]) -> String {
    if let Some(explicit) = explicit.map(str::trim).filter(|p| !p.is_empty()) {
        if is_executable(Path::new(explicit)) {
            return explicit.to_string();
        }
        tracing::warn!("Java path '{}' is missing or not executable, searching", explicit);
    }

    match find_installed(roots).into_iter().next() {
        Some(path) => {
            tracing::info!("Using java at {}", path.display());
            path.to_string_lossy().into_owned()
        }
        None => {
            tracing::warn!("No java installation found, relying on PATH");
            FALLBACK_JAVA.to_string()
        }
    }
}
