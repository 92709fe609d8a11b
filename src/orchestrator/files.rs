//! Blocking filesystem helpers: directory copies, backups and map archives.
//!
//! Callers on the async runtime go through `tokio::task::spawn_blocking`.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use zip::ZipArchive;

use crate::error::{OrchestratorError, Result};
use crate::utils::parse_backup_stamp;

/// One `<stamp>/<server>` folder under the backups root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupEntry {
    pub server: String,
    #[serde(with = "crate::model::task::datetime_format")]
    pub taken_at: NaiveDateTime,
    pub path: PathBuf,
}

/// 디렉토리 전체 복사
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<u64> {
    fs::create_dir_all(dst).map_err(|e| OrchestratorError::io(dst, e))?;
    let mut copied = 0;
    for entry in fs::read_dir(src).map_err(|e| OrchestratorError::io(src, e))? {
        let entry = entry.map_err(|e| OrchestratorError::io(src, e))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let ty = entry.file_type().map_err(|e| OrchestratorError::io(&src_path, e))?;

        if ty.is_dir() {
            copied += copy_dir_all(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).map_err(|e| OrchestratorError::io(&src_path, e))?;
            copied += 1;
        }
    }
    Ok(copied)
}

/// Remove a directory tree; a missing directory is not an error.
pub fn remove_dir_if_exists(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(OrchestratorError::io(path, e)),
    }
}

/// Copy `server_dir` to `<backups_root>/<stamp>/<name>` and return the target.
pub fn backup_dir(server_dir: &Path, backups_root: &Path, stamp: &str, name: &str) -> Result<PathBuf> {
    if !server_dir.is_dir() {
        return Err(OrchestratorError::io(
            server_dir,
            io::Error::new(io::ErrorKind::NotFound, "server directory does not exist"),
        ));
    }
    let target = backups_root.join(stamp).join(name);
    let files = copy_dir_all(server_dir, &target)?;
    tracing::info!("Backed up {} files of '{}' to {}", files, name, target.display());
    Ok(target)
}

/// Every backup under `backups_root`, oldest first. Folders whose name is
/// not a backup stamp are ignored.
pub fn list_backups(backups_root: &Path) -> Result<Vec<BackupEntry>> {
    let mut backups = Vec::new();
    for (taken_at, stamp_dir) in stamp_dirs(backups_root)? {
        let children = fs::read_dir(&stamp_dir).map_err(|e| OrchestratorError::io(&stamp_dir, e))?;
        for child in children {
            let child = child.map_err(|e| OrchestratorError::io(&stamp_dir, e))?;
            let path = child.path();
            if path.is_dir() {
                backups.push(BackupEntry {
                    server: child.file_name().to_string_lossy().into_owned(),
                    taken_at,
                    path,
                });
            }
        }
    }
    backups.sort_by(|a, b| a.taken_at.cmp(&b.taken_at).then_with(|| a.server.cmp(&b.server)));
    Ok(backups)
}

/// Delete every stamp folder taken before `cutoff` and return what was removed.
pub fn prune_backups(backups_root: &Path, cutoff: NaiveDateTime) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for (taken_at, dir) in stamp_dirs(backups_root)? {
        if taken_at >= cutoff {
            continue;
        }
        fs::remove_dir_all(&dir).map_err(|e| OrchestratorError::io(&dir, e))?;
        tracing::info!("Pruned backup {}", dir.display());
        removed.push(dir);
    }
    Ok(removed)
}

fn stamp_dirs(backups_root: &Path) -> Result<Vec<(NaiveDateTime, PathBuf)>> {
    if !backups_root.is_dir() {
        return Ok(Vec::new());
    }
    let mut dirs = Vec::new();
    let entries = fs::read_dir(backups_root).map_err(|e| OrchestratorError::io(backups_root, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| OrchestratorError::io(backups_root, e))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        if let Some(taken_at) = parse_backup_stamp(&entry.file_name().to_string_lossy()) {
            dirs.push((taken_at, path));
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Extract `archive` into `target`, refusing entries that would land
/// outside of it. Nothing is written if any entry is unsafe.
pub fn extract_zip(archive_path: &Path, target: &Path) -> Result<usize> {
    let zip_err = |e: zip::result::ZipError| {
        OrchestratorError::io(archive_path, io::Error::new(io::ErrorKind::InvalidData, e))
    };
    let file = fs::File::open(archive_path).map_err(|e| OrchestratorError::io(archive_path, e))?;
    let mut archive = ZipArchive::new(file).map_err(zip_err)?;

    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i).map_err(zip_err)?;
        let relative = safe_entry_path(entry.name())
            .ok_or_else(|| OrchestratorError::UnsafeArchivePath(entry.name().to_string()))?;
        entries.push((i, relative, entry.is_dir()));
    }

    fs::create_dir_all(target).map_err(|e| OrchestratorError::io(target, e))?;
    let mut written = 0;
    for (i, relative, is_dir) in entries {
        let out_path = target.join(&relative);
        if is_dir {
            fs::create_dir_all(&out_path).map_err(|e| OrchestratorError::io(&out_path, e))?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent).map_err(|e| OrchestratorError::io(parent, e))?;
        }
        let mut entry = archive.by_index(i).map_err(zip_err)?;
        let mut out = fs::File::create(&out_path).map_err(|e| OrchestratorError::io(&out_path, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| OrchestratorError::io(&out_path, e))?;
        written += 1;
    }
    Ok(written)
}

/// Normalised relative path for an archive entry, or `None` if it is
/// absolute or climbs out with `..`.
fn safe_entry_path(name: &str) -> Option<PathBuf> {
    let normalized = name.replace('\\', "/");
    let mut out = PathBuf::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if out.as_os_str().is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    #[test]
    fn test_list_and_prune_backups() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("backups");
        for (stamp, server) in [
            ("20240101_030000", "lobby"),
            ("20240101_030000", "pvp"),
            ("20240301_120000", "lobby"),
        ] {
            let dir = root.join(stamp).join(server);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join("server.properties"), "motd=hi").unwrap();
        }
        fs::create_dir_all(root.join("not-a-stamp").join("lobby")).unwrap();

        let backups = list_backups(&root).unwrap();
        let listed: Vec<(String, String)> = backups
            .iter()
            .map(|b| (b.taken_at.format("%Y%m%d").to_string(), b.server.clone()))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("20240101".to_string(), "lobby".to_string()),
                ("20240101".to_string(), "pvp".to_string()),
                ("20240301".to_string(), "lobby".to_string()),
            ]
        );

        let cutoff = parse_backup_stamp("20240201_000000").unwrap();
        let removed = prune_backups(&root, cutoff).unwrap();
        assert_eq!(removed, vec![root.join("20240101_030000")]);
        assert!(!root.join("20240101_030000").exists());
        assert!(root.join("20240301_120000").exists());
        assert!(root.join("not-a-stamp").exists());
        assert_eq!(list_backups(&root).unwrap().len(), 1);
    }

    #[test]
    fn test_list_backups_without_folder() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(list_backups(&tmp.path().join("backups")).unwrap().is_empty());
        assert!(prune_backups(&tmp.path().join("backups"), parse_backup_stamp("20240101_000000").unwrap())
            .unwrap()
            .is_empty());
    }

    fn write_zip(path: &Path, entries: &[(&str, &str)]) {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, body) in entries {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(body.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_safe_entry_path() {
        assert_eq!(safe_entry_path("region/r.0.0.mca"), Some(PathBuf::from("region/r.0.0.mca")));
        assert_eq!(safe_entry_path("./level.dat"), Some(PathBuf::from("level.dat")));
        assert_eq!(safe_entry_path("../evil"), None);
        assert_eq!(safe_entry_path("a/../../evil"), None);
        assert_eq!(safe_entry_path("/etc/passwd"), None);
        assert_eq!(safe_entry_path("..\\evil"), None);
    }

    #[test]
    fn test_copy_and_backup() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("servers/s1");
        fs::create_dir_all(src.join("world/region")).unwrap();
        fs::write(src.join("Core.jar"), "jar").unwrap();
        fs::write(src.join("world/region/r.0.0.mca"), "data").unwrap();

        let target = backup_dir(&src, &dir.path().join("backups"), "20240501_030000", "s1").unwrap();
        assert_eq!(target, dir.path().join("backups/20240501_030000/s1"));
        assert_eq!(fs::read_to_string(target.join("world/region/r.0.0.mca")).unwrap(), "data");
        // source untouched
        assert!(src.join("Core.jar").exists());
    }

    #[test]
    fn test_backup_of_missing_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(backup_dir(&dir.path().join("nope"), dir.path(), "x", "nope").is_err());
    }

    #[test]
    fn test_extract_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("skyblock.zip");
        write_zip(&archive, &[("level.dat", "lvl"), ("region/r.0.0.mca", "mca")]);

        let target = dir.path().join("world");
        assert_eq!(extract_zip(&archive, &target).unwrap(), 2);
        assert_eq!(fs::read_to_string(target.join("region/r.0.0.mca")).unwrap(), "mca");
    }

    #[test]
    fn test_extract_rejects_traversal_before_writing() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("ok.txt", "fine"), ("../escape.txt", "bad")]);

        let target = dir.path().join("world");
        let err = extract_zip(&archive, &target).unwrap_err();
        assert!(matches!(err, OrchestratorError::UnsafeArchivePath(_)));
        assert!(!target.join("ok.txt").exists());
        assert!(!dir.path().join("escape.txt").exists());
    }

    #[test]
    fn test_remove_missing_dir_is_ok() {
        let dir = tempfile::tempdir().unwrap();
        assert!(remove_dir_if_exists(&dir.path().join("gone")).is_ok());
    }
}
