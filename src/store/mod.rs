//! JSON persistence for configuration entities.
//!
//! Every entity goes through the same [`JsonStore`]; the file holds either a
//! pretty-printed array (servers, groups, tasks) or a single object (last
//! launch). Mutations are load-modify-save with no cross-process locking.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{OrchestratorError, Result};
use crate::model::{Group, LaunchConfig, ScheduledTask, Server};

pub type GroupStore = JsonStore<Vec<Group>>;
pub type TaskStore = JsonStore<Vec<ScheduledTask>>;
pub type LastLaunchStore = JsonStore<LaunchConfig>;

pub struct JsonStore<T> {
    file_path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Serialize + DeserializeOwned> JsonStore<T> {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            file_path: file_path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// `Ok(None)` when the file does not exist yet.
    pub fn load(&self) -> Result<Option<T>> {
        if !self.file_path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.file_path)
            .map_err(|e| OrchestratorError::persistence(&self.file_path, e))?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        let value = serde_json::from_str(&content)
            .map_err(|e| OrchestratorError::persistence(&self.file_path, e))?;
        Ok(Some(value))
    }

    pub fn save(&self, value: &T) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(|e| OrchestratorError::persistence(&self.file_path, e))?;
            }
        }
        let content = serde_json::to_string_pretty(value)
            .map_err(|e| OrchestratorError::persistence(&self.file_path, e))?;
        // write beside the target, then swap it in
        let tmp = self.tmp_path();
        fs::write(&tmp, content).map_err(|e| OrchestratorError::persistence(&tmp, e))?;
        fs::rename(&tmp, &self.file_path)
            .map_err(|e| OrchestratorError::persistence(&self.file_path, e))
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.file_path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.file_path.with_file_name(name)
    }
}

impl<T: Serialize + DeserializeOwned> JsonStore<Vec<T>> {
    /// Missing file reads as an empty list.
    pub fn load_all(&self) -> Result<Vec<T>> {
        Ok(self.load()?.unwrap_or_default())
    }
}

/// 서버 목록 저장소 - serverList.json 관리
///
/// Each mutation re-reads the file so hand edits made while the daemon runs
/// are picked up. The mutex only serializes mutations inside this process.
pub struct ServerStore {
    inner: JsonStore<Vec<Server>>,
    write_lock: Mutex<()>,
}

impl ServerStore {
    pub fn new(file_path: impl Into<PathBuf>) -> Self {
        Self {
            inner: JsonStore::new(file_path),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        self.inner.path()
    }

    pub fn list(&self) -> Result<Vec<Server>> {
        self.inner.load_all()
    }

    pub fn find(&self, name: &str) -> Result<Option<Server>> {
        Ok(self.list()?.into_iter().find(|s| s.name == name))
    }

    pub fn get(&self, name: &str) -> Result<Server> {
        self.find(name)?
            .ok_or_else(|| OrchestratorError::ServerNotFound(name.to_string()))
    }

    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.find(name)?.is_some())
    }

    pub fn insert(&self, server: Server) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut servers = self.inner.load_all()?;
        if servers.iter().any(|s| s.name == server.name) {
            return Err(OrchestratorError::ServerExists(server.name));
        }
        tracing::debug!("Persisting new server '{}'", server.name);
        servers.push(server);
        self.inner.save(&servers)
    }

    /// Apply `f` to the named server and persist. Returns the updated copy.
    pub fn update<F>(&self, name: &str, f: F) -> Result<Server>
    where
        F: FnOnce(&mut Server),
    {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut servers = self.inner.load_all()?;
        let server = servers
            .iter_mut()
            .find(|s| s.name == name)
            .ok_or_else(|| OrchestratorError::ServerNotFound(name.to_string()))?;
        f(server);
        let updated = server.clone();
        self.inner.save(&servers)?;
        Ok(updated)
    }

    pub fn remove(&self, name: &str) -> Result<Server> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut servers = self.inner.load_all()?;
        let index = servers
            .iter()
            .position(|s| s.name == name)
            .ok_or_else(|| OrchestratorError::ServerNotFound(name.to_string()))?;
        let removed = servers.remove(index);
        self.inner.save(&servers)?;
        Ok(removed)
    }
}
