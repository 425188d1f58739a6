//! The build database stores, for every task that ran, the rule signature and
//! a stamp of its inputs, so the next build can tell which tasks are up to
//! date.
//!
//! Dynamic compile jobs are recorded here too, under their job key.

use crate::fs::{FileSystem, MTime};
use crate::hash::{Signature, SignatureHasher};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

const VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub signature: Signature,
    /// Stamp of the input files' modification times when the task ran.
    pub inputs: Signature,
}

#[derive(Serialize, Deserialize)]
struct DbFile {
    version: u32,
    tasks: BTreeMap<String, TaskRecord>,
}

/// Why a task has to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Staleness {
    UpToDate,
    NeverBuilt,
    RuleChanged,
    OutputMissing,
    InputChanged,
}

impl Staleness {
    pub fn is_stale(&self) -> bool {
        *self != Staleness::UpToDate
    }
}

pub struct Db {
    path: Option<PathBuf>,
    tasks: Mutex<BTreeMap<String, TaskRecord>>,
}

impl Db {
    /// A database that is never written to disk.
    pub fn in_memory() -> Self {
        Db {
            path: None,
            tasks: Mutex::default(),
        }
    }

    /// Opens the database at `path`.  A missing file is an empty database;
    /// an unreadable one is discarded, which only costs a full rebuild.
    pub fn open(path: &Path) -> anyhow::Result<Db> {
        let tasks = match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<DbFile>(&bytes) {
                Ok(file) if file.version == VERSION => file.tasks,
                Ok(file) => {
                    tracing::info!(version = file.version, "db version changed, starting fresh");
                    BTreeMap::new()
                }
                Err(err) => {
                    tracing::warn!("discarding unreadable db {}: {}", path.display(), err);
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(err) => anyhow::bail!("read {}: {}", path.display(), err),
        };
        Ok(Db {
            path: Some(path.to_path_buf()),
            tasks: Mutex::new(tasks),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, TaskRecord>> {
        // A panic while holding the lock cannot leave a half-written record.
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, id: &str) -> Option<TaskRecord> {
        self.lock().get(id).cloned()
    }

    pub fn record(&self, id: &str, record: TaskRecord) {
        self.lock().insert(id.to_string(), record);
    }

    pub fn forget(&self, id: &str) {
        self.lock().remove(id);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = DbFile {
            version: VERSION,
            tasks: self.lock().clone(),
        };
        let bytes = serde_json::to_vec(&file)?;
        crate::fs::write_atomic(path, &bytes)
            .map_err(|err| anyhow::anyhow!("write {}: {}", path.display(), err))
    }

    /// Decides whether a task or job with the given signature, inputs and
    /// outputs can be skipped.
    pub fn staleness<'a>(
        &self,
        fs: &dyn FileSystem,
        id: &str,
        signature: &Signature,
        inputs: impl Iterator<Item = &'a str>,
        outputs: impl Iterator<Item = &'a str>,
    ) -> std::io::Result<Staleness> {
        let Some(record) = self.get(id) else {
            return Ok(Staleness::NeverBuilt);
        };
        if record.signature != *signature {
            return Ok(Staleness::RuleChanged);
        }
        for out in outputs {
            if fs.stat(out)? == MTime::Missing {
                return Ok(Staleness::OutputMissing);
            }
        }
        if stamp_files(fs, inputs)? != record.inputs {
            return Ok(Staleness::InputChanged);
        }
        Ok(Staleness::UpToDate)
    }
}

/// Hashes the names and modification times of files.
pub fn stamp_files<'a>(
    fs: &dyn FileSystem,
    paths: impl Iterator<Item = &'a str>,
) -> std::io::Result<Signature> {
    let mut hasher = SignatureHasher::new("inputs");
    for path in paths {
        hasher.write_str(path);
        hasher.write_u64(fs.stat(path)?.as_nanos());
    }
    Ok(hasher.finish())
}
