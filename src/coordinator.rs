//! The dynamic task coordinator: the per-build context through which running
//! tasks ask for more work.
//!
//! A request names a `DynamicTaskKey`.  The first request for a key resolves
//! it to an action, which the executor schedules; every later request for the
//! same key gets a handle to that same task.  Resolution failures are
//! returned to the requester only.
//!
//! The coordinator owns the sub-systems that span the whole build (module
//! graphs, the compilation cache and its uploader and pruner) and replaces
//! them wholesale on `reset`.

use crate::action::{self, DynamicStatus, TaskAction};
use crate::cas::{CacheSetup, CompilationCache, OutputDescriptor, Pruner, Uploader};
use crate::error::DynamicTaskError;
use crate::module_graph::{
    ClangModuleGraph, DependencyScanner, ModuleDependencyGraph, ModuleGraphFlavor, ScanRequest,
    SwiftModuleGraph,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DynamicTaskKey {
    /// Scan a module and plan its jobs.
    ModuleScan(ScanRequest),
    /// One job of a planned build.
    DriverJob {
        flavor: ModuleGraphFlavor,
        plan_id: String,
        job: String,
    },
    /// A module build shared between plans.
    ExplicitDependencyJob { job: String },
    /// Make a compilation's cached outputs available locally, if cached.
    MaterializeKey { cache_key: String },
    /// Ask the remote cache about a key.
    KeyQuery { cache_key: String },
    OutputMaterialize(OutputDescriptor),
}

impl fmt::Display for DynamicTaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DynamicTaskKey::ModuleScan(req) => write!(f, "scan {}", req.plan_id),
            DynamicTaskKey::DriverJob { plan_id, job, .. } => write!(f, "job {} of {}", job, plan_id),
            DynamicTaskKey::ExplicitDependencyJob { job } => write!(f, "explicit job {}", job),
            DynamicTaskKey::MaterializeKey { cache_key } => write!(f, "materialize {}", cache_key),
            DynamicTaskKey::KeyQuery { cache_key } => write!(f, "query {}", cache_key),
            DynamicTaskKey::OutputMaterialize(desc) => {
                write!(f, "download {} {}", desc.kind, desc.digest)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Identifies a dynamic task within one coordinator generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DynamicTaskHandle(pub usize);

pub enum DynamicRequest {
    /// The key was new: the caller must schedule `action`.
    New {
        handle: DynamicTaskHandle,
        action: Box<dyn TaskAction>,
    },
    /// Someone already asked.  `finished` is set if that task is done.
    Existing {
        handle: DynamicTaskHandle,
        finished: Option<DynamicStatus>,
    },
}

/// The sub-systems shared by every task of one build.
pub struct BuildSystems {
    pub clang: ClangModuleGraph,
    pub swift: SwiftModuleGraph,
    pub cache: Option<CompilationCache>,
    pub uploader: Option<Uploader>,
    pub pruner: Option<Pruner>,
    defining_targets: DashMap<String, String>,
}

impl BuildSystems {
    fn new(scanner: &Arc<dyn DependencyScanner>, cache: Option<&CacheSetup>) -> Self {
        BuildSystems {
            clang: ClangModuleGraph::new(scanner.clone()),
            swift: SwiftModuleGraph::new(scanner.clone()),
            cache: cache.map(CompilationCache::new),
            uploader: cache.and_then(|setup| {
                setup
                    .remote
                    .as_ref()
                    .map(|remote| Uploader::new(setup.store.clone(), remote.clone()))
            }),
            pruner: cache.and_then(|setup| setup.budget_bytes.map(Pruner::new)),
            defining_targets: DashMap::new(),
        }
    }

    pub fn graph(&self, flavor: ModuleGraphFlavor) -> &ModuleDependencyGraph {
        match flavor {
            ModuleGraphFlavor::Clang => &self.clang,
            ModuleGraphFlavor::Swift => &self.swift,
        }
    }

    /// Records that `target` defines `module`.  The first target to claim a
    /// module keeps it.
    pub fn register_defining_target(&self, module: &str, target: &str) {
        self.defining_targets
            .entry(module.to_string())
            .or_insert_with(|| target.to_string());
    }

    pub fn defining_target(&self, module: &str) -> Option<String> {
        self.defining_targets.get(module).map(|t| t.clone())
    }
}

/// Proof that all dynamic work had drained, needed to reset.
#[derive(Debug)]
pub struct CompletionToken {
    generation: u64,
}

struct Entry {
    handle: DynamicTaskHandle,
    status: Option<DynamicStatus>,
}

#[derive(Default)]
struct RequestTable {
    by_key: HashMap<DynamicTaskKey, Entry>,
    keys: Vec<DynamicTaskKey>,
    in_flight: usize,
}

pub struct DynamicTaskContext {
    scanner: Arc<dyn DependencyScanner>,
    cache: Option<CacheSetup>,
    systems: Arc<BuildSystems>,
    table: Mutex<RequestTable>,
    idle: Condvar,
    generation: u64,
}

impl DynamicTaskContext {
    pub fn new(scanner: Arc<dyn DependencyScanner>, cache: Option<CacheSetup>) -> Self {
        let systems = Arc::new(BuildSystems::new(&scanner, cache.as_ref()));
        DynamicTaskContext {
            scanner,
            cache,
            systems,
            table: Mutex::default(),
            idle: Condvar::new(),
            generation: 0,
        }
    }

    pub fn systems(&self) -> &Arc<BuildSystems> {
        &self.systems
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RequestTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns the task for `key`, resolving it to a new action the first
    /// time it is asked for.
    pub fn request_task(
        &self,
        key: DynamicTaskKey,
        priority: Priority,
    ) -> Result<DynamicRequest, DynamicTaskError> {
        let mut table = self.lock();
        if let Some(entry) = table.by_key.get(&key) {
            return Ok(DynamicRequest::Existing {
                handle: entry.handle,
                finished: entry.status,
            });
        }
        let action = self.resolve(&key)?;
        let handle = DynamicTaskHandle(table.keys.len());
        tracing::debug!(?priority, "new dynamic task {}", key);
        table.keys.push(key.clone());
        table.by_key.insert(
            key,
            Entry {
                handle,
                status: None,
            },
        );
        table.in_flight += 1;
        Ok(DynamicRequest::New { handle, action })
    }

    fn resolve(&self, key: &DynamicTaskKey) -> Result<Box<dyn TaskAction>, DynamicTaskError> {
        let systems = &self.systems;
        let needs_cache = || {
            if systems.cache.is_some() {
                Ok(())
            } else {
                Err(DynamicTaskError::CacheUnavailable)
            }
        };
        Ok(match key {
            DynamicTaskKey::ModuleScan(request) => Box::new(action::ScanAction::new(request.clone())),
            DynamicTaskKey::DriverJob {
                flavor,
                plan_id,
                job,
            } => {
                let job = systems.graph(*flavor).planned_job(plan_id, job)?;
                Box::new(action::DriverJobAction::new(*flavor, Some(plan_id.clone()), job))
            }
            DynamicTaskKey::ExplicitDependencyJob { job } => {
                let job = systems.swift.planned_explicit_dependency_job(job)?;
                Box::new(action::DriverJobAction::new(ModuleGraphFlavor::Swift, None, job))
            }
            DynamicTaskKey::MaterializeKey { cache_key } => {
                needs_cache()?;
                Box::new(action::MaterializeKeyAction::new(cache_key.clone()))
            }
            DynamicTaskKey::KeyQuery { cache_key } => {
                needs_cache()?;
                Box::new(action::KeyQueryAction::new(cache_key.clone()))
            }
            DynamicTaskKey::OutputMaterialize(desc) => {
                needs_cache()?;
                Box::new(action::OutputMaterializeAction::new(desc.clone()))
            }
        })
    }

    pub fn key(&self, handle: DynamicTaskHandle) -> Option<DynamicTaskKey> {
        self.lock().keys.get(handle.0).cloned()
    }

    /// Records the result of a dynamic task.  Later requests for its key see
    /// it as finished.
    pub fn task_finished(&self, handle: DynamicTaskHandle, status: DynamicStatus) {
        let mut table = self.lock();
        let Some(key) = table.keys.get(handle.0).cloned() else {
            return;
        };
        if let Some(entry) = table.by_key.get_mut(&key) {
            if entry.status.is_none() {
                entry.status = Some(status);
                table.in_flight -= 1;
            }
        }
        if table.in_flight == 0 {
            self.idle.notify_all();
        }
    }

    /// Number of distinct keys requested this generation.
    pub fn request_count(&self) -> usize {
        self.lock().keys.len()
    }

    /// Waits until no dynamic task is outstanding, then drains background
    /// uploads and prunes the local cache.
    pub fn wait_for_completion(&self) -> CompletionToken {
        {
            let mut table = self.lock();
            while table.in_flight > 0 {
                table = self.idle.wait(table).unwrap_or_else(|e| e.into_inner());
            }
        }
        if let Some(uploader) = &self.systems.uploader {
            uploader.wait();
        }
        if let (Some(pruner), Some(cache)) = (&self.systems.pruner, &self.systems.cache) {
            if let Err(err) = pruner.prune(cache.store().as_ref(), &cache.touched_keys()) {
                tracing::warn!("pruning compilation cache: {}", err);
            }
        }
        CompletionToken {
            generation: self.generation,
        }
    }

    /// Replaces every per-build sub-system with a fresh one.
    pub fn reset(&mut self, token: CompletionToken) -> Result<(), DynamicTaskError> {
        if token.generation != self.generation || self.lock().in_flight > 0 {
            return Err(DynamicTaskError::StaleToken);
        }
        self.systems = Arc::new(BuildSystems::new(&self.scanner, self.cache.as_ref()));
        *self.lock() = RequestTable::default();
        self.generation += 1;
        Ok(())
    }
}
