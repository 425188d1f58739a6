//! Task actions: what the executor runs for a task.
//!
//! An action is driven by messages.  `setup` is called once the task's
//! static inputs are ready and may request dynamic tasks; each requested task
//! reports back through `dependency_ready`, which may request more.  Once
//! nothing is outstanding, `perform` runs on a worker thread.

mod builtin;
mod caching;
mod compile;
mod driver_job;
mod dump;
mod link;
mod process;
mod swift;

pub use builtin::BuiltinAction;
pub use caching::{KeyQueryAction, MaterializeKeyAction, MaterializeState, OutputMaterializeAction};
pub use compile::{ClangCompileAction, ScanAction};
pub use driver_job::DriverJobAction;
pub use dump::DependencyDumpAction;
pub use link::LinkAction;
pub use process::ProcessAction;
pub use swift::SwiftDriverAction;

use crate::cancel::CancellationToken;
use crate::coordinator::{BuildSystems, DynamicTaskKey, Priority};
use crate::db::Db;
use crate::diagnostic::Diagnostic;
use crate::fs::FileSystem;
use crate::graph::{ActionKind, Payload, PlannedTask};
use crate::process::{Spawner, Termination};
use crate::verify::DependencyVerifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandResult {
    Succeeded,
    Failed,
    Cancelled,
}

impl From<Termination> for CommandResult {
    fn from(termination: Termination) -> Self {
        match termination {
            Termination::Success => CommandResult::Succeeded,
            Termination::Failure => CommandResult::Failed,
            Termination::Interrupted => CommandResult::Cancelled,
        }
    }
}

/// What a finished task reports to the tasks that requested it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DynamicStatus {
    pub result: CommandResult,
    /// The task's outputs came from the compilation cache.
    pub cache_hit: bool,
    /// The task changed something on disk.
    pub did_work: bool,
}

impl DynamicStatus {
    pub fn succeeded(&self) -> bool {
        self.result == CommandResult::Succeeded
    }
}

#[derive(Debug)]
pub struct TaskOutcome {
    pub result: CommandResult,
    /// Combined output of any command run.
    pub output: Vec<u8>,
    pub diagnostics: Vec<Diagnostic>,
    pub did_work: bool,
    pub cache_hit: bool,
}

impl TaskOutcome {
    pub fn succeeded(did_work: bool) -> Self {
        TaskOutcome {
            result: CommandResult::Succeeded,
            output: Vec::new(),
            diagnostics: Vec::new(),
            did_work,
            cache_hit: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        TaskOutcome {
            result: CommandResult::Failed,
            output: Vec::new(),
            diagnostics: vec![Diagnostic::error(message)],
            did_work: false,
            cache_hit: false,
        }
    }

    pub fn cancelled() -> Self {
        TaskOutcome {
            result: CommandResult::Cancelled,
            output: Vec::new(),
            diagnostics: Vec::new(),
            did_work: false,
            cache_hit: false,
        }
    }

    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics.extend(diagnostics);
        self
    }

    pub fn status(&self) -> DynamicStatus {
        DynamicStatus {
            result: self.result,
            cache_hit: self.cache_hit,
            did_work: self.did_work,
        }
    }
}

/// Handed to `setup` and `dependency_ready`; collects dynamic requests.
pub struct ActionContext<'a> {
    systems: &'a BuildSystems,
    requests: Vec<(DynamicTaskKey, Priority)>,
}

impl<'a> ActionContext<'a> {
    pub fn new(systems: &'a BuildSystems) -> Self {
        ActionContext {
            systems,
            requests: Vec::new(),
        }
    }

    pub fn systems(&self) -> &'a BuildSystems {
        self.systems
    }

    pub fn request(&mut self, key: DynamicTaskKey, priority: Priority) {
        self.requests.push((key, priority));
    }

    pub fn take_requests(&mut self) -> Vec<(DynamicTaskKey, Priority)> {
        std::mem::take(&mut self.requests)
    }
}

/// Everything `perform` may use.
pub struct PerformContext<'a> {
    pub systems: &'a BuildSystems,
    pub spawner: &'a dyn Spawner,
    pub fs: &'a dyn FileSystem,
    pub db: &'a Db,
    pub cancel: &'a CancellationToken,
    pub verifier: &'a DependencyVerifier,
}

pub trait TaskAction: Send {
    fn setup(&mut self, _cx: &mut ActionContext) {}

    fn dependency_ready(
        &mut self,
        _key: &DynamicTaskKey,
        _status: DynamicStatus,
        _cx: &mut ActionContext,
    ) {
    }

    fn perform(self: Box<Self>, cx: &PerformContext) -> TaskOutcome;
}

/// The action for a statically planned task.
pub fn for_task(task: &PlannedTask) -> Box<dyn TaskAction> {
    match (&task.action, &task.payload) {
        (ActionKind::Process, _) => Box::new(ProcessAction::new(task)),
        (ActionKind::Link, Some(Payload::Link(payload))) => {
            Box::new(LinkAction::new(task, payload.clone()))
        }
        (ActionKind::ClangCompile, Some(Payload::ClangCompile(payload))) => {
            Box::new(ClangCompileAction::new(payload.clone()))
        }
        (ActionKind::SwiftDriver, Some(Payload::SwiftDriver(payload))) => {
            Box::new(SwiftDriverAction::new(payload.clone()))
        }
        (ActionKind::DumpDependencies, Some(Payload::DependencyDump(payload))) => {
            Box::new(DependencyDumpAction::new(payload.clone()))
        }
        (
            ActionKind::Link
            | ActionKind::ClangCompile
            | ActionKind::SwiftDriver
            | ActionKind::DumpDependencies,
            _,
        ) => {
            Box::new(builtin::MisconfiguredAction(task.identifier()))
        }
        _ => Box::new(BuiltinAction::new(task)),
    }
}

/// Creates the parent directories of files a command is about to write.
fn create_parent_dirs<'a>(paths: impl Iterator<Item = &'a str>) -> std::io::Result<()> {
    for path in paths {
        if let Some(dir) = std::path::Path::new(path).parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
    }
    Ok(())
}
