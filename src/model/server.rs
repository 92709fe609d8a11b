use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// 서버 설정 - 사용자가 생성/추가한 관리 대상 서버
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub name: String,
    /// Path of the server executable; its parent is the working directory.
    pub core_path: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub is_modpack: bool,
    #[serde(default)]
    pub map: Option<String>,
    #[serde(default)]
    pub default_jvm_args: Option<String>,
    #[serde(default)]
    pub default_process_args: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub min_memory: Option<String>,
    #[serde(default)]
    pub max_memory: Option<String>,
}

impl Server {
    pub fn new(name: &str, core_path: impl AsRef<Path>, version: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            core_path: core_path.as_ref().to_string_lossy().into_owned(),
            version: version.to_string(),
            description: description.to_string(),
            is_modpack: false,
            map: None,
            default_jvm_args: None,
            default_process_args: None,
            group: None,
            min_memory: None,
            max_memory: None,
        }
    }

    /// Name, core path and version must be non-blank.
    pub fn is_valid(&self) -> bool {
        !self.name.trim().is_empty()
            && !self.core_path.trim().is_empty()
            && !self.version.trim().is_empty()
    }

    /// The server's own directory (parent of the core executable).
    pub fn working_dir(&self) -> PathBuf {
        Path::new(&self.core_path)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    pub fn apply(&mut self, patch: ServerPatch) {
        if let Some(description) = patch.description {
            self.description = description;
        }
        set_optional(&mut self.map, patch.map);
        set_optional(&mut self.default_jvm_args, patch.default_jvm_args);
        set_optional(&mut self.default_process_args, patch.default_process_args);
        set_optional(&mut self.min_memory, patch.min_memory);
        set_optional(&mut self.max_memory, patch.max_memory);
    }
}

/// Partial update for [`Server`]. `None` leaves a field untouched and
/// `Some("")` clears an optional one.
#[derive(Debug, Clone, Default)]
pub struct ServerPatch {
    pub description: Option<String>,
    pub map: Option<String>,
    pub default_jvm_args: Option<String>,
    pub default_process_args: Option<String>,
    pub min_memory: Option<String>,
    pub max_memory: Option<String>,
}

fn set_optional(field: &mut Option<String>, value: Option<String>) {
    if let Some(value) = value {
        let trimmed = value.trim();
        *field = if trimmed.is_empty() { None } else { Some(trimmed.to_string()) };
    }
}

/// Derive a version string from a core file name by keeping digits and dots,
/// e.g. `paper-1.20.4.jar` -> `1.20.4`.
pub fn extract_version(file_name: &str) -> String {
    let stem = file_name.strip_suffix(".jar").unwrap_or(file_name);
    let version: String = stem.chars().filter(|c| c.is_ascii_digit() || *c == '.').collect();
    version.trim_matches('.').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        let server = Server::new("lobby", "servers/lobby/Core.jar", "1.20.4", "");
        assert!(server.is_valid());

        let mut blank = server.clone();
        blank.version = "  ".into();
        assert!(!blank.is_valid());
    }

    #[test]
    fn test_working_dir_is_parent_of_core() {
        let server = Server::new("s1", "/srv/servers/s1/Core.jar", "1.0", "");
        assert_eq!(server.working_dir(), PathBuf::from("/srv/servers/s1"));
    }

    #[test]
    fn test_extract_version() {
        assert_eq!(extract_version("paper-1.20.4.jar"), "1.20.4");
        assert_eq!(extract_version("spigot-1.8.8-R0.1.jar"), "1.8.80.1");
        assert_eq!(extract_version("server.jar"), "");
    }

    #[test]
    fn test_patch_sets_and_clears() {
        let mut server = Server::new("s1", "servers/s1/Core.jar", "1.0", "old");
        server.apply(ServerPatch {
            description: Some("new".into()),
            default_jvm_args: Some("-XX:+UseG1GC".into()),
            max_memory: Some("4G".into()),
            ..Default::default()
        });
        assert_eq!(server.description, "new");
        assert_eq!(server.default_jvm_args.as_deref(), Some("-XX:+UseG1GC"));
        assert_eq!(server.max_memory.as_deref(), Some("4G"));

        server.apply(ServerPatch {
            default_jvm_args: Some(String::new()),
            ..Default::default()
        });
        assert!(server.default_jvm_args.is_none());
        assert_eq!(server.max_memory.as_deref(), Some("4G"));
    }

    #[test]
    fn test_json_uses_camel_case_and_tolerates_missing_optionals() {
        let json = r#"{"name":"s1","corePath":"servers/s1/Core.jar","version":"1.12.2","isModpack":true}"#;
        let server: Server = serde_json::from_str(json).unwrap();
        assert!(server.is_modpack);
        assert!(server.group.is_none());

        let out = serde_json::to_value(&server).unwrap();
        assert!(out.get("defaultJvmArgs").is_some());
        assert!(out.get("corePath").is_some());
    }
}
