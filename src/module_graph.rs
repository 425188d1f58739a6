//! Module dependency graphs: the memoized results of asking a compiler
//! frontend which jobs a module needs, and in what order.
//!
//! A scan runs at most once per build plan id and request; every other
//! caller, including concurrent ones, sees the first scan's result.

use crate::cancel::CancellationToken;
use crate::diagnostic::{has_errors, Diagnostic, DiagnosticLocation, Severity};
use crate::error::ModuleGraphError;
use crate::graph::Command;
use crate::hash::{Signature, SignatureHasher};
use crate::memo::Memo;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::Write;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleGraphFlavor {
    /// C, C++ and Objective-C: one compile job per source file.
    Clang,
    /// Interface-based modules planned by the swift driver.
    Swift,
}

/// How visible an import is outside the importing module.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AccessLevel {
    Private,
    Package,
    #[default]
    Public,
}

impl AccessLevel {
    pub fn parse(s: &str) -> Option<AccessLevel> {
        match s {
            "private" => Some(AccessLevel::Private),
            "package" => Some(AccessLevel::Package),
            "public" => Some(AccessLevel::Public),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Private => "private",
            AccessLevel::Package => "package",
            AccessLevel::Public => "public",
        }
    }
}

/// Everything a scanner needs to plan one module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScanRequest {
    pub flavor: ModuleGraphFlavor,
    /// Per-target plan identifier, e.g. "App-arm64-debug".
    pub plan_id: String,
    pub module_name: String,
    /// The compiler invocation the jobs derive from.
    pub command: Command,
    pub sources: Vec<String>,
    /// Whether jobs should carry compilation cache keys.
    pub caching: bool,
}

impl ScanRequest {
    pub fn signature(&self) -> Signature {
        let mut hasher = SignatureHasher::new("scan");
        let _ = hasher.write_json(self);
        hasher.finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    Compile,
    EmitModule,
    /// Builds a module another job imports.
    ModuleBuild,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobOutput {
    /// e.g. "object", "module", "diagnostics"; names the output in a cache
    /// entry.
    pub kind: String,
    pub path: String,
}

/// One compiler job discovered by a scan.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DriverJob {
    pub key: String,
    pub kind: JobKind,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<JobOutput>,
    pub command: Command,
    /// Keys of jobs that must finish first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub cache_key: Option<String>,
    /// A module build shared by every plan that needs it, looked up by key
    /// alone rather than through one plan.
    #[serde(default)]
    pub explicit_dependency: bool,
}

impl DriverJob {
    pub fn signature(&self) -> Signature {
        let mut hasher = SignatureHasher::new("driver-job");
        let _ = hasher.write_json(self);
        hasher.finish()
    }

    pub fn output_paths(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|o| o.path.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleImport {
    pub name: String,
    #[serde(default)]
    pub access_level: AccessLevel,
    /// A textual include rather than a module import.  `name` is then the
    /// included path.
    #[serde(default)]
    pub textual: bool,
    #[serde(default)]
    pub reexport: bool,
    /// Where the import appears in source.  Empty for implicit imports.
    #[serde(default)]
    pub locations: Vec<DiagnosticLocation>,
}

impl ModuleImport {
    /// Re-exports are visible to everyone regardless of the spelled level.
    pub fn effective_access(&self) -> AccessLevel {
        if self.reexport {
            AccessLevel::Public
        } else {
            self.access_level
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    pub name: String,
    #[serde(default)]
    pub imports: Vec<ModuleImport>,
}

/// What a scanner hands back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOutput {
    #[serde(default)]
    pub jobs: Vec<DriverJob>,
    #[serde(default)]
    pub modules: Vec<ModuleInfo>,
    #[serde(default)]
    pub diagnostics: Vec<Diagnostic>,
}

/// The compiler frontend's dependency scanner.
pub trait DependencyScanner: Send + Sync {
    fn scan(&self, request: &ScanRequest) -> anyhow::Result<ScanOutput>;
}

/// A scanner run as a subprocess: the request is written to its stdin as
/// JSON and it prints a `ScanOutput` as JSON.
pub struct ProcessScanner {
    args: Vec<String>,
}

impl ProcessScanner {
    pub fn new(args: Vec<String>) -> Self {
        ProcessScanner { args }
    }
}

impl DependencyScanner for ProcessScanner {
    fn scan(&self, request: &ScanRequest) -> anyhow::Result<ScanOutput> {
        let (program, args) = match self.args.split_first() {
            Some(split) => split,
            None => anyhow::bail!("no scanner configured"),
        };
        let mut child = std::process::Command::new(program)
            .args(args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .spawn()
            .map_err(|err| anyhow::anyhow!("spawn {}: {}", program, err))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&serde_json::to_vec(request)?)?;
        }
        let out = child.wait_with_output()?;
        if !out.status.success() {
            anyhow::bail!("{} exited with {}", program, out.status);
        }
        Ok(serde_json::from_slice(&out.stdout)?)
    }
}

/// The jobs of one scanned module, indexed by key.
#[derive(Debug)]
pub struct PlannedBuild {
    pub plan_id: String,
    pub module_name: String,
    jobs: Vec<Arc<DriverJob>>,
    by_key: HashMap<String, usize>,
    modules: BTreeMap<String, ModuleInfo>,
}

impl PlannedBuild {
    fn new(request: &ScanRequest, output: ScanOutput) -> Self {
        let mut by_key = HashMap::new();
        let mut jobs = Vec::with_capacity(output.jobs.len());
        for job in output.jobs {
            by_key.insert(job.key.clone(), jobs.len());
            jobs.push(Arc::new(job));
        }
        PlannedBuild {
            plan_id: request.plan_id.clone(),
            module_name: request.module_name.clone(),
            jobs,
            by_key,
            modules: output
                .modules
                .into_iter()
                .map(|m| (m.name.clone(), m))
                .collect(),
        }
    }

    pub fn jobs(&self) -> &[Arc<DriverJob>] {
        &self.jobs
    }

    pub fn job(&self, key: &str) -> Option<&Arc<DriverJob>> {
        self.by_key.get(key).map(|&i| &self.jobs[i])
    }

    /// The compile job whose inputs include `source`.
    pub fn job_for_source(&self, source: &str) -> Option<&Arc<DriverJob>> {
        self.jobs
            .iter()
            .find(|job| job.kind == JobKind::Compile && job.inputs.iter().any(|i| i == source))
    }

    pub fn module(&self, name: &str) -> Option<&ModuleInfo> {
        self.modules.get(name)
    }
}

#[derive(Debug, Clone)]
enum ScanOutcome {
    Planned {
        build: Arc<PlannedBuild>,
        diagnostics: Vec<Diagnostic>,
    },
    Failed(Vec<Diagnostic>),
    Cancelled,
}

/// State shared by both flavors of graph.
pub struct ModuleDependencyGraph {
    flavor: ModuleGraphFlavor,
    scanner: Arc<dyn DependencyScanner>,
    scans: Memo<(String, Signature), ScanOutcome>,
    planned: DashMap<String, Arc<PlannedBuild>>,
    scan_count: AtomicUsize,
}

impl ModuleDependencyGraph {
    fn new(flavor: ModuleGraphFlavor, scanner: Arc<dyn DependencyScanner>) -> Self {
        ModuleDependencyGraph {
            flavor,
            scanner,
            scans: Memo::new(),
            planned: DashMap::new(),
            scan_count: AtomicUsize::new(0),
        }
    }

    pub fn flavor(&self) -> ModuleGraphFlavor {
        self.flavor
    }

    /// Scans the request's module unless an identical request was already
    /// scanned, and reports whether a plan is now available.
    pub fn plan_build(
        &self,
        request: &ScanRequest,
        cancel: &CancellationToken,
    ) -> (bool, Vec<Diagnostic>) {
        let key = (request.plan_id.clone(), request.signature());
        let (outcome, computed) = self.scans.get_or_compute(&key, || self.scan(request, cancel));
        match outcome {
            ScanOutcome::Planned { diagnostics, .. } => (true, diagnostics),
            ScanOutcome::Failed(diagnostics) => (false, diagnostics),
            ScanOutcome::Cancelled => {
                // Let the next caller scan for real.  Only the cancelled
                // caller owns the slot; a waiter that woke up to it may find
                // a fresh scan already in its place.
                if computed {
                    self.scans.forget(&key);
                }
                (
                    false,
                    vec![Diagnostic::error(format!(
                        "dependency scan of {} was cancelled",
                        request.plan_id
                    ))],
                )
            }
        }
    }

    fn scan(&self, request: &ScanRequest, cancel: &CancellationToken) -> ScanOutcome {
        let _span = tracing::info_span!("plan_build", plan_id = %request.plan_id).entered();
        if cancel.is_cancelled() {
            return ScanOutcome::Cancelled;
        }
        self.scan_count.fetch_add(1, Ordering::SeqCst);
        let output = match self.scanner.scan(request) {
            Ok(output) => output,
            Err(err) => {
                tracing::debug!("scan of {} failed: {}", request.plan_id, err);
                return ScanOutcome::Failed(vec![Diagnostic::error(format!(
                    "dependency scan of {} failed: {}",
                    request.plan_id, err
                ))]);
            }
        };
        if cancel.is_cancelled() {
            return ScanOutcome::Cancelled;
        }
        if has_errors(&output.diagnostics) {
            return ScanOutcome::Failed(output.diagnostics);
        }
        let diagnostics = output.diagnostics.clone();
        let build = Arc::new(PlannedBuild::new(request, output));
        tracing::debug!(jobs = build.jobs.len(), "planned {}", request.plan_id);
        self.planned.insert(request.plan_id.clone(), build.clone());
        ScanOutcome::Planned { build, diagnostics }
    }

    /// How many scans actually ran.
    pub fn scan_count(&self) -> usize {
        self.scan_count.load(Ordering::SeqCst)
    }

    pub fn query_planned_build(&self, plan_id: &str) -> Result<Arc<PlannedBuild>, ModuleGraphError> {
        self.planned
            .get(plan_id)
            .map(|b| b.clone())
            .ok_or_else(|| ModuleGraphError::NotPlanned(plan_id.to_string()))
    }

    pub fn planned_job(&self, plan_id: &str, job: &str) -> Result<Arc<DriverJob>, ModuleGraphError> {
        let build = self.query_planned_build(plan_id)?;
        build
            .job(job)
            .cloned()
            .ok_or_else(|| ModuleGraphError::JobNotFound {
                plan_id: plan_id.to_string(),
                job: job.to_string(),
            })
    }

    /// Direct imports of the planned module, as the scanner reported them.
    pub fn import_module_dependencies(
        &self,
        plan_id: &str,
    ) -> Result<Vec<ModuleImport>, ModuleGraphError> {
        let build = self.query_planned_build(plan_id)?;
        Ok(build
            .module(&build.module_name)
            .map(|m| m.imports.clone())
            .unwrap_or_default())
    }

    /// Every module reachable through imports from the planned module.
    /// Textual includes are not modules and are left out.
    pub fn transitive_dependency_module_names(
        &self,
        plan_id: &str,
    ) -> Result<BTreeSet<String>, ModuleGraphError> {
        let build = self.query_planned_build(plan_id)?;
        let mut seen = BTreeSet::new();
        let mut stack = vec![build.module_name.clone()];
        while let Some(name) = stack.pop() {
            let Some(module) = build.module(&name) else {
                continue;
            };
            for import in module.imports.iter().filter(|i| !i.textual) {
                if import.name != build.module_name && seen.insert(import.name.clone()) {
                    stack.push(import.name.clone());
                }
            }
        }
        Ok(seen)
    }
}

pub struct ClangModuleGraph(ModuleDependencyGraph);

impl ClangModuleGraph {
    pub fn new(scanner: Arc<dyn DependencyScanner>) -> Self {
        ClangModuleGraph(ModuleDependencyGraph::new(ModuleGraphFlavor::Clang, scanner))
    }

    pub fn job_for_source(&self, plan_id: &str, source: &str) -> Result<Arc<DriverJob>, ModuleGraphError> {
        let build = self.query_planned_build(plan_id)?;
        build
            .job_for_source(source)
            .cloned()
            .ok_or_else(|| ModuleGraphError::JobNotFound {
                plan_id: plan_id.to_string(),
                job: source.to_string(),
            })
    }
}

impl Deref for ClangModuleGraph {
    type Target = ModuleDependencyGraph;
    fn deref(&self) -> &ModuleDependencyGraph {
        &self.0
    }
}

pub struct SwiftModuleGraph {
    inner: ModuleDependencyGraph,
    /// Module builds shared across plans, first planner wins.
    explicit_jobs: DashMap<String, Arc<DriverJob>>,
}

impl SwiftModuleGraph {
    pub fn new(scanner: Arc<dyn DependencyScanner>) -> Self {
        SwiftModuleGraph {
            inner: ModuleDependencyGraph::new(ModuleGraphFlavor::Swift, scanner),
            explicit_jobs: DashMap::new(),
        }
    }

    pub fn plan_build(
        &self,
        request: &ScanRequest,
        cancel: &CancellationToken,
    ) -> (bool, Vec<Diagnostic>) {
        let (ok, diagnostics) = self.inner.plan_build(request, cancel);
        if ok {
            if let Ok(build) = self.inner.query_planned_build(&request.plan_id) {
                for job in build.jobs().iter().filter(|j| j.explicit_dependency) {
                    self.explicit_jobs
                        .entry(job.key.clone())
                        .or_insert_with(|| job.clone());
                }
            }
        }
        (ok, diagnostics)
    }

    pub fn planned_explicit_dependency_job(&self, key: &str) -> Result<Arc<DriverJob>, ModuleGraphError> {
        self.explicit_jobs
            .get(key)
            .map(|j| j.clone())
            .ok_or_else(|| ModuleGraphError::ExplicitJobNotFound(key.to_string()))
    }
}

impl Deref for SwiftModuleGraph {
    type Target = ModuleDependencyGraph;
    fn deref(&self) -> &ModuleDependencyGraph {
        &self.inner
    }
}

/// One declared `MODULE_DEPENDENCIES` entry: "Foo" or "package Foo".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredModule {
    pub name: String,
    pub access_level: AccessLevel,
}

impl DeclaredModule {
    pub fn parse(entry: &str) -> Option<DeclaredModule> {
        let mut words = entry.split_whitespace();
        let first = words.next()?;
        match (AccessLevel::parse(first), words.next()) {
            (Some(access_level), Some(name)) => Some(DeclaredModule {
                name: name.to_string(),
                access_level,
            }),
            _ => Some(DeclaredModule {
                name: first.to_string(),
                access_level: AccessLevel::Public,
            }),
        }
    }
}

/// Diagnoses imports missing from a target's declared module dependencies,
/// or declared with a narrower access level than they are imported with.
/// Imports with no source location are implicit and not checked, nor are
/// textual includes.
pub fn validate_module_dependencies<S: AsRef<str>>(
    target: &str,
    module_name: &str,
    declared: &[S],
    imports: &[ModuleImport],
    severity: Severity,
) -> Vec<Diagnostic> {
    let declared: HashMap<String, AccessLevel> = declared
        .iter()
        .filter_map(|d| DeclaredModule::parse(d.as_ref()))
        .map(|d| (d.name, d.access_level))
        .collect();
    let mut diags = Vec::new();
    for import in imports {
        if import.name == module_name || import.textual {
            continue;
        }
        let Some(location) = import.locations.first() else {
            continue;
        };
        let access = import.effective_access();
        let message = match declared.get(&import.name) {
            None => format!(
                "Missing entry in MODULE_DEPENDENCIES: {} {}",
                access.as_str(),
                import.name
            ),
            Some(&level) if level < access => format!(
                "MODULE_DEPENDENCIES declares {} as {} but it is imported as {}",
                import.name,
                level.as_str(),
                access.as_str()
            ),
            Some(_) => continue,
        };
        diags.push(
            Diagnostic::new(severity, message)
                .for_target(target)
                .at(location.clone()),
        );
    }
    diags
}
