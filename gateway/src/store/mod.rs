//! File-backed JSON persistence shared by the client registry, the service
//! registry and the agent ledger.
//!
//! Every read-modify-write cycle is expected to run inside [`execute_async`]
//! while holding a [`StoreLock`]; writes go through [`write_atomic`] so a
//! concurrent reader never observes a half-written file.

use anyhow::{Context, Result};
use fs2::FileExt;
use serde::{de::DeserializeOwned, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::error::{GatewayError, GatewayResult};

/// Exclusive advisory lock on a sidecar `.lock` file, released on drop.
pub struct StoreLock {
    file: File,
    path: PathBuf,
}

impl StoreLock {
    /// Lock guarding a single JSON file (`agents.json` -> `agents.json.lock`).
    pub fn for_file(target: &Path) -> Result<Self> {
        let mut name = target
            .file_name()
            .with_context(|| format!("Path has no file name: {:?}", target))?
            .to_os_string();
        name.push(".lock");
        Self::acquire(target.with_file_name(name))
    }

    /// Lock guarding a directory of per-record files.
    pub fn for_dir(dir: &Path) -> Result<Self> {
        Self::acquire(dir.join(".lock"))
    }

    fn acquire(path: PathBuf) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create dir {:?}", parent))?;
        }

        // Don't truncate: another holder may be mid-cycle.
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {:?}", path))?;

        FileExt::lock_exclusive(&file)
            .with_context(|| format!("Failed to lock {:?}", path))?;

        Ok(Self { file, path })
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!("Failed to release lock {:?}: {}", self.path, e);
        }
    }
}

/// Run blocking file-store work on the blocking pool (spawn_blocking wrapper).
pub async fn execute_async<F, T>(f: F) -> GatewayResult<T>
where
    F: FnOnce() -> GatewayResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => result,
        Err(e) => Err(GatewayError::Persistence(format!("Task join error: {}", e))),
    }
}

/// Read a whole file; `None` when it does not exist.
pub fn read_bytes(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {:?}", path)),
    }
}

/// Read and parse a JSON file; `None` when it is absent or empty.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let Some(bytes) = read_bytes(path)? else {
        return Ok(None);
    };

    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(None);
    }

    let value =
        serde_json::from_slice(&bytes).with_context(|| format!("Failed to parse {:?}", path))?;
    Ok(Some(value))
}

/// Serialize with two-space indentation and a trailing newline.
pub fn to_pretty_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec_pretty(value).context("Failed to serialize JSON")?;
    bytes.push(b'\n');
    Ok(bytes)
}

pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, &to_pretty_json(value)?)
}

/// Replace `path` with `bytes` via a temporary sibling and `rename`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).with_context(|| format!("Failed to create dir {:?}", parent))?;

    let file_name = path
        .file_name()
        .with_context(|| format!("Path has no file name: {:?}", path))?
        .to_string_lossy();
    let tmp = parent.join(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    {
        let mut file =
            File::create(&tmp).with_context(|| format!("Failed to create {:?}", tmp))?;
        file.write_all(bytes)
            .with_context(|| format!("Failed to write {:?}", tmp))?;
        file.sync_all()
            .with_context(|| format!("Failed to sync {:?}", tmp))?;
    }

    fs::rename(&tmp, path).with_context(|| format!("Failed to replace {:?}", path))?;
    Ok(())
}

/// Remove a file; returns `false` when it was already gone.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {:?}", path)),
    }
}
