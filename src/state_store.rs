use std::{
    io,
    path::{Path, PathBuf},
};

use tokio::fs;
use tracing::debug;

use crate::{process::Pid, StateStoreError};

const PID_EXTENSION: &str = "pid";

/// Durable `service name -> pid` records, one `<name>.pid` file per service.
///
/// File content is the decimal pid and nothing else. Records are written right after a spawn
/// succeeds and removed as soon as the process is known to be gone; they exist solely to
/// re-synchronize the supervisor after it restarts.
#[derive(Debug, Clone)]
pub struct PidStore {
    dir: PathBuf,
}

impl PidStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.{PID_EXTENSION}"))
    }

    /// Atomically replaces the record for `name`.
    pub async fn write(&self, name: &str, pid: Pid) -> Result<(), StateStoreError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StateStoreError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let path = self.path_for(name);
        let staging = self.dir.join(format!(".{name}.{PID_EXTENSION}.tmp"));
        fs::write(&staging, pid.to_string())
            .await
            .map_err(|source| StateStoreError::Io {
                path: staging.clone(),
                source,
            })?;
        fs::rename(&staging, &path)
            .await
            .map_err(|source| StateStoreError::Io {
                path: path.clone(),
                source,
            })?;

        debug!(service = %name, pid, path = %path.display(), "wrote pid record");
        Ok(())
    }

    /// Removes the record for `name`. Missing records are not an error.
    pub async fn remove(&self, name: &str) -> Result<(), StateStoreError> {
        let path = self.path_for(name);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(service = %name, path = %path.display(), "removed pid record");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(StateStoreError::Io { path, source }),
        }
    }

    pub async fn read(&self, name: &str) -> Result<Option<Pid>, StateStoreError> {
        let path = self.path_for(name);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StateStoreError::Io { path, source }),
        };
        match content.trim().parse::<Pid>() {
            Ok(pid) => Ok(Some(pid)),
            Err(_) => Err(StateStoreError::Corrupt { path, content }),
        }
    }

    /// Names of every service with a record on disk, sorted.
    pub async fn list_recorded(&self) -> Result<Vec<String>, StateStoreError> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StateStoreError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut names = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(StateStoreError::Io {
                        path: self.dir.clone(),
                        source,
                    })
                }
            };
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(PID_EXTENSION) {
                continue;
            }
            // Staging files end in `.tmp` and never get here.
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}
