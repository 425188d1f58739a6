//! Compilation caching: a content-addressed store of compiler outputs, an
//! action cache mapping compilation keys to those outputs, and the roles
//! built on them (key lookup, output materialization, upload, pruning).
//!
//! The cache is an optimization.  Every error here is reported to the caller
//! as a `CacheError`, which callers log and otherwise treat as a miss.

use crate::cancel::CancellationToken;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::hash::Signature;
use crate::memo::Memo;
use crate::module_graph::JobOutput;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::SystemTime;

/// Content digest of a stored blob.
pub type Digest = Signature;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OutputDescriptor {
    pub digest: Digest,
    /// Which of the compilation's outputs this is, e.g. "object".
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOutput {
    pub descriptor: OutputDescriptor,
    /// Whether the content is present in the local store.  Never persisted;
    /// filled in when the entry is queried.
    #[serde(skip)]
    pub materialized: bool,
}

/// An action cache entry: a compilation key and the outputs it produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedCompilation {
    pub key: String,
    pub outputs: Vec<CachedOutput>,
}

impl CachedCompilation {
    pub fn unmaterialized(&self) -> impl Iterator<Item = &OutputDescriptor> {
        self.outputs
            .iter()
            .filter(|o| !o.materialized)
            .map(|o| &o.descriptor)
    }
}

/// An action cache entry as seen by the pruner.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub key: String,
    /// Larger is more recent.
    pub last_used: u64,
    /// Each output's digest with the size of its stored blob.  Blobs may be
    /// shared with other entries.
    pub blobs: Vec<(Digest, u64)>,
}

pub trait ContentStore: Send + Sync {
    fn contains(&self, digest: &Digest) -> bool;
    fn load(&self, digest: &Digest) -> Result<Vec<u8>, CacheError>;
    fn store(&self, data: &[u8]) -> Result<Digest, CacheError>;
    fn remove(&self, digest: &Digest) -> Result<(), CacheError>;

    fn get_action(&self, key: &str) -> Result<Option<CachedCompilation>, CacheError>;
    fn put_action(&self, entry: &CachedCompilation) -> Result<(), CacheError>;
    fn remove_action(&self, key: &str) -> Result<(), CacheError>;
    /// Marks an entry as recently used.
    fn touch_action(&self, key: &str) -> Result<(), CacheError>;
    fn entries(&self) -> Result<Vec<EntryInfo>, CacheError>;
}

/// A store laid out on disk as `blobs/<digest>` and `actions/<hash>.json`.
pub struct DiskCas {
    root: PathBuf,
}

impl DiskCas {
    pub fn open(root: &Path) -> Result<DiskCas, CacheError> {
        std::fs::create_dir_all(root.join("blobs"))?;
        std::fs::create_dir_all(root.join("actions"))?;
        Ok(DiskCas {
            root: root.to_path_buf(),
        })
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.root.join("blobs").join(digest.to_hex())
    }

    fn action_path(&self, key: &str) -> PathBuf {
        let name = format!("{}.json", Signature::of_bytes(key.as_bytes()).to_hex());
        self.root.join("actions").join(name)
    }

    fn read_action(path: &Path) -> Result<Option<CachedCompilation>, CacheError> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|err| CacheError::Corrupt(path.display().to_string(), err.to_string())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

fn nanos(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

impl ContentStore for DiskCas {
    fn contains(&self, digest: &Digest) -> bool {
        self.blob_path(digest).exists()
    }

    fn load(&self, digest: &Digest) -> Result<Vec<u8>, CacheError> {
        match std::fs::read(self.blob_path(digest)) {
            Ok(data) => Ok(data),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(CacheError::MissingContent(digest.to_hex()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, data: &[u8]) -> Result<Digest, CacheError> {
        let digest = Signature::of_bytes(data);
        let path = self.blob_path(&digest);
        if !path.exists() {
            crate::fs::write_atomic(&path, data)?;
        }
        Ok(digest)
    }

    fn remove(&self, digest: &Digest) -> Result<(), CacheError> {
        match std::fs::remove_file(self.blob_path(digest)) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn get_action(&self, key: &str) -> Result<Option<CachedCompilation>, CacheError> {
        Self::read_action(&self.action_path(key))
    }

    fn put_action(&self, entry: &CachedCompilation) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(entry)
            .map_err(|err| CacheError::Corrupt(entry.key.clone(), err.to_string()))?;
        crate::fs::write_atomic(&self.action_path(&entry.key), &bytes)?;
        Ok(())
    }

    fn remove_action(&self, key: &str) -> Result<(), CacheError> {
        match std::fs::remove_file(self.action_path(key)) {
            Err(err) if err.kind() != std::io::ErrorKind::NotFound => Err(err.into()),
            _ => Ok(()),
        }
    }

    fn touch_action(&self, key: &str) -> Result<(), CacheError> {
        let file = std::fs::File::options()
            .write(true)
            .open(self.action_path(key))?;
        file.set_modified(SystemTime::now())?;
        Ok(())
    }

    fn entries(&self) -> Result<Vec<EntryInfo>, CacheError> {
        let mut entries = Vec::new();
        for dirent in std::fs::read_dir(self.root.join("actions"))? {
            let path = dirent?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let Some(entry) = Self::read_action(&path)? else {
                continue;
            };
            let last_used = nanos(std::fs::metadata(&path)?.modified()?);
            let blobs = entry
                .outputs
                .iter()
                .map(|o| o.descriptor.digest)
                .filter_map(|d| Some((d, std::fs::metadata(self.blob_path(&d)).ok()?.len())))
                .collect();
            entries.push(EntryInfo {
                key: entry.key,
                last_used,
                blobs,
            });
        }
        Ok(entries)
    }
}

#[derive(Default)]
struct MemoryState {
    blobs: HashMap<Digest, Vec<u8>>,
    actions: HashMap<String, (CachedCompilation, u64)>,
    clock: u64,
}

/// An in-memory store, for tests and for builds that only want caching
/// within one process.
#[derive(Default)]
pub struct MemoryCas {
    state: Mutex<MemoryState>,
}

impl MemoryCas {
    pub fn new() -> Self {
        MemoryCas::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ContentStore for MemoryCas {
    fn contains(&self, digest: &Digest) -> bool {
        self.lock().blobs.contains_key(digest)
    }

    fn load(&self, digest: &Digest) -> Result<Vec<u8>, CacheError> {
        self.lock()
            .blobs
            .get(digest)
            .cloned()
            .ok_or_else(|| CacheError::MissingContent(digest.to_hex()))
    }

    fn store(&self, data: &[u8]) -> Result<Digest, CacheError> {
        let digest = Signature::of_bytes(data);
        self.lock().blobs.entry(digest).or_insert_with(|| data.to_vec());
        Ok(digest)
    }

    fn remove(&self, digest: &Digest) -> Result<(), CacheError> {
        self.lock().blobs.remove(digest);
        Ok(())
    }

    fn get_action(&self, key: &str) -> Result<Option<CachedCompilation>, CacheError> {
        Ok(self.lock().actions.get(key).map(|(e, _)| e.clone()))
    }

    fn put_action(&self, entry: &CachedCompilation) -> Result<(), CacheError> {
        let mut state = self.lock();
        state.clock += 1;
        let tick = state.clock;
        state.actions.insert(entry.key.clone(), (entry.clone(), tick));
        Ok(())
    }

    fn remove_action(&self, key: &str) -> Result<(), CacheError> {
        self.lock().actions.remove(key);
        Ok(())
    }

    fn touch_action(&self, key: &str) -> Result<(), CacheError> {
        let mut state = self.lock();
        state.clock += 1;
        let tick = state.clock;
        if let Some((_, used)) = state.actions.get_mut(key) {
            *used = tick;
        }
        Ok(())
    }

    fn entries(&self) -> Result<Vec<EntryInfo>, CacheError> {
        let state = self.lock();
        Ok(state
            .actions
            .values()
            .map(|(entry, used)| EntryInfo {
                key: entry.key.clone(),
                last_used: *used,
                blobs: entry
                    .outputs
                    .iter()
                    .map(|o| o.descriptor.digest)
                    .filter_map(|d| Some((d, state.blobs.get(&d)?.len() as u64)))
                    .collect(),
            })
            .collect())
    }
}

/// A cache shared between machines.
pub trait RemoteCache: Send + Sync {
    fn lookup(&self, key: &str) -> Result<Option<CachedCompilation>, CacheError>;
    fn fetch(&self, digest: &Digest) -> Result<Vec<u8>, CacheError>;
    fn upload_blob(&self, data: &[u8]) -> Result<Digest, CacheError>;
    fn publish(&self, entry: &CachedCompilation) -> Result<(), CacheError>;
}

/// A remote cache that is a shared directory, e.g. a network mount.
pub struct DirectoryRemote {
    cas: DiskCas,
}

impl DirectoryRemote {
    pub fn open(root: &Path) -> Result<DirectoryRemote, CacheError> {
        Ok(DirectoryRemote {
            cas: DiskCas::open(root)?,
        })
    }
}

impl RemoteCache for DirectoryRemote {
    fn lookup(&self, key: &str) -> Result<Option<CachedCompilation>, CacheError> {
        self.cas.get_action(key)
    }

    fn fetch(&self, digest: &Digest) -> Result<Vec<u8>, CacheError> {
        self.cas.load(digest)
    }

    fn upload_blob(&self, data: &[u8]) -> Result<Digest, CacheError> {
        self.cas.store(data)
    }

    fn publish(&self, entry: &CachedCompilation) -> Result<(), CacheError> {
        self.cas.put_action(entry)
    }
}

/// The long-lived parts of a cache, from which a fresh per-build
/// `CompilationCache` is made for every coordinator generation.
#[derive(Clone)]
pub struct CacheSetup {
    pub store: Arc<dyn ContentStore>,
    pub remote: Option<Arc<dyn RemoteCache>>,
    pub budget_bytes: Option<u64>,
}

impl CacheSetup {
    pub fn from_config(config: &CacheConfig) -> Result<Option<CacheSetup>, CacheError> {
        if !config.enabled {
            return Ok(None);
        }
        let path = config.path.as_deref().unwrap_or(".dynbuild_cas");
        let store: Arc<dyn ContentStore> = Arc::new(DiskCas::open(Path::new(path))?);
        let remote = match &config.remote {
            Some(remote) => {
                Some(Arc::new(DirectoryRemote::open(Path::new(remote))?) as Arc<dyn RemoteCache>)
            }
            None => None,
        };
        Ok(Some(CacheSetup {
            store,
            remote,
            budget_bytes: config.budget_bytes,
        }))
    }
}

/// Per-build view of the cache.  Records which entries this build has
/// touched so pruning spares them.
pub struct CompilationCache {
    store: Arc<dyn ContentStore>,
    remote: Option<Arc<dyn RemoteCache>>,
    downloads: Memo<Digest, Result<(), Arc<CacheError>>>,
    touched: Mutex<HashSet<String>>,
    fetches: AtomicUsize,
}

impl CompilationCache {
    pub fn new(setup: &CacheSetup) -> Self {
        CompilationCache {
            store: setup.store.clone(),
            remote: setup.remote.clone(),
            downloads: Memo::new(),
            touched: Mutex::default(),
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn store(&self) -> &Arc<dyn ContentStore> {
        &self.store
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    fn touch(&self, key: &str) {
        self.touched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string());
    }

    pub fn touched_keys(&self) -> HashSet<String> {
        self.touched.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Looks the key up in the local action cache only.
    pub fn query_local_cache_key(&self, key: &str) -> Result<Option<CachedCompilation>, CacheError> {
        let Some(mut entry) = self.store.get_action(key)? else {
            return Ok(None);
        };
        for output in &mut entry.outputs {
            output.materialized = self.store.contains(&output.descriptor.digest);
        }
        self.touch(key);
        if let Err(err) = self.store.touch_action(key) {
            tracing::debug!("touch {}: {}", key, err);
        }
        Ok(Some(entry))
    }

    /// Asks the remote cache for the key, copying a hit into the local action
    /// cache so a following local query finds it.  Content is not fetched.
    pub fn query_remote_cache_key(
        &self,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<CachedCompilation>, CacheError> {
        let Some(remote) = &self.remote else {
            return Ok(None);
        };
        cancel.check().map_err(|_| CacheError::Cancelled)?;
        let Some(entry) = remote.lookup(key)? else {
            return Ok(None);
        };
        cancel.check().map_err(|_| CacheError::Cancelled)?;
        self.store.put_action(&entry)?;
        self.touch(key);
        Ok(Some(entry))
    }

    /// Makes an output's content available locally, fetching it at most once
    /// per digest however many callers ask.  A failed or cancelled fetch is
    /// forgotten so the content reads as not yet materialized.
    pub fn materialize(
        &self,
        output: &OutputDescriptor,
        cancel: &CancellationToken,
    ) -> Result<(), CacheError> {
        if self.store.contains(&output.digest) {
            return Ok(());
        }
        cancel.check().map_err(|_| CacheError::Cancelled)?;
        let (result, _) = self.downloads.get_or_compute(&output.digest, || {
            self.fetch(&output.digest, cancel).map_err(Arc::new)
        });
        if result.is_err() {
            self.downloads.forget(&output.digest);
        }
        result.map_err(CacheError::Shared)
    }

    fn fetch(&self, digest: &Digest, cancel: &CancellationToken) -> Result<(), CacheError> {
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| CacheError::MissingContent(digest.to_hex()))?;
        self.fetches.fetch_add(1, Ordering::SeqCst);
        tracing::debug!("fetching {}", digest);
        let data = remote.fetch(digest)?;
        cancel.check().map_err(|_| CacheError::Cancelled)?;
        if Signature::of_bytes(&data) != *digest {
            return Err(CacheError::Corrupt(
                digest.to_hex(),
                "content does not match digest".into(),
            ));
        }
        self.store.store(&data)?;
        Ok(())
    }

    /// How many remote fetches this build performed.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Writes a cached compilation's outputs to where the job expects them.
    pub fn replay(&self, entry: &CachedCompilation, outputs: &[JobOutput]) -> Result<(), CacheError> {
        for output in outputs {
            let cached = entry
                .outputs
                .iter()
                .find(|o| o.descriptor.kind == output.kind)
                .ok_or_else(|| CacheError::MissingContent(format!("{} {}", entry.key, output.kind)))?;
            let data = self.store.load(&cached.descriptor.digest)?;
            let path = Path::new(&output.path);
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            crate::fs::write_atomic(path, &data)?;
        }
        Ok(())
    }

    /// Stores a finished compilation's outputs under its key.
    pub fn store_compilation(
        &self,
        key: &str,
        outputs: &[JobOutput],
    ) -> Result<CachedCompilation, CacheError> {
        let mut cached = Vec::with_capacity(outputs.len());
        for output in outputs {
            let data = std::fs::read(&output.path)?;
            let digest = self.store.store(&data)?;
            cached.push(CachedOutput {
                descriptor: OutputDescriptor {
                    digest,
                    kind: output.kind.clone(),
                },
                materialized: true,
            });
        }
        let entry = CachedCompilation {
            key: key.to_string(),
            outputs: cached,
        };
        self.store.put_action(&entry)?;
        self.touch(key);
        Ok(entry)
    }
}

/// Publishes entries to the remote cache in the background.
pub struct Uploader {
    store: Arc<dyn ContentStore>,
    remote: Arc<dyn RemoteCache>,
    pending: Arc<(Mutex<usize>, Condvar)>,
    failures: Arc<AtomicUsize>,
}

impl Uploader {
    pub fn new(store: Arc<dyn ContentStore>, remote: Arc<dyn RemoteCache>) -> Self {
        Uploader {
            store,
            remote,
            pending: Arc::default(),
            failures: Arc::default(),
        }
    }

    pub fn upload(&self, entry: CachedCompilation) {
        *self.pending.0.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        let store = self.store.clone();
        let remote = self.remote.clone();
        let pending = self.pending.clone();
        let failures = self.failures.clone();
        rayon::spawn(move || {
            if let Err(err) = upload_entry(store.as_ref(), remote.as_ref(), &entry) {
                tracing::warn!("upload of {} failed: {}", entry.key, err);
                failures.fetch_add(1, Ordering::SeqCst);
            }
            let (count, cvar) = &*pending;
            *count.lock().unwrap_or_else(|e| e.into_inner()) -= 1;
            cvar.notify_all();
        });
    }

    /// Blocks until every upload started so far has finished.
    pub fn wait(&self) {
        let (count, cvar) = &*self.pending;
        let mut count = count.lock().unwrap_or_else(|e| e.into_inner());
        while *count > 0 {
            count = cvar.wait(count).unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn failure_count(&self) -> usize {
        self.failures.load(Ordering::SeqCst)
    }
}

fn upload_entry(
    store: &dyn ContentStore,
    remote: &dyn RemoteCache,
    entry: &CachedCompilation,
) -> Result<(), CacheError> {
    for output in &entry.outputs {
        let data = store.load(&output.descriptor.digest)?;
        remote.upload_blob(&data)?;
    }
    remote.publish(entry)
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PruneReport {
    pub evicted: Vec<String>,
    pub remaining_bytes: u64,
}

/// Keeps the local store under a size budget by evicting the least recently
/// used entries.  Entries the current build touched are never evicted.
pub struct Pruner {
    budget_bytes: u64,
}

impl Pruner {
    pub fn new(budget_bytes: u64) -> Self {
        Pruner { budget_bytes }
    }

    pub fn prune(
        &self,
        store: &dyn ContentStore,
        touched: &HashSet<String>,
    ) -> Result<PruneReport, CacheError> {
        let mut entries = store.entries()?;
        entries.sort_by(|a, b| a.last_used.cmp(&b.last_used).then_with(|| a.key.cmp(&b.key)));
        for entry in &mut entries {
            entry.blobs.sort();
            entry.blobs.dedup();
        }

        // Each blob counts once, however many entries refer to it.
        let mut refs: HashMap<Digest, usize> = HashMap::new();
        let mut total: u64 = 0;
        for &(digest, size) in entries.iter().flat_map(|e| &e.blobs) {
            let count = refs.entry(digest).or_default();
            if *count == 0 {
                total += size;
            }
            *count += 1;
        }

        let mut report = PruneReport::default();
        for entry in entries {
            if total <= self.budget_bytes || touched.contains(&entry.key) {
                continue;
            }
            store.remove_action(&entry.key)?;
            for (digest, size) in entry.blobs {
                let Some(count) = refs.get_mut(&digest) else {
                    continue;
                };
                *count -= 1;
                if *count == 0 {
                    store.remove(&digest)?;
                    total -= size;
                }
            }
            report.evicted.push(entry.key);
        }
        report.remaining_bytes = total;
        if !report.evicted.is_empty() {
            tracing::info!(
                evicted = report.evicted.len(),
                remaining = total,
                "pruned compilation cache"
            );
        }
        Ok(report)
    }
}
