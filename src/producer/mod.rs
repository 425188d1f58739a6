//! Task producers: per-concern generators that turn a configured target into
//! planned tasks.
//!
//! Producers are pure functions of the project model.  They never run the
//! tools they describe, and two calls with the same inputs return tasks with
//! the same signatures.  Problems resolving inputs come back as diagnostics
//! next to whatever tasks could still be planned.

mod cas_config;
mod depinfo;
mod link;
mod product;
mod resources;
mod sources;

pub use cas_config::CasConfigProducer;
pub use depinfo::{dependency_info_path, DependencyInfoMergeProducer, DependencyInfoProducer};
pub use link::LinkProducer;
pub use product::ProductStructureProducer;
pub use resources::ResourcesProducer;
pub use sources::SourcesProducer;

use crate::diagnostic::Diagnostic;
use crate::graph::{NodeRef, PlannedTask, TaskBuilder};
use crate::project::{BuildRequest, ConfiguredTarget, Project};

/// Everything a producer may look at for one target.
pub struct ProducerContext<'a> {
    pub project: &'a Project,
    pub request: &'a BuildRequest,
    pub target: &'a ConfiguredTarget,
    /// Direct dependencies, already configured.
    pub dependencies: Vec<&'a ConfiguredTarget>,
    /// Every target this one depends on, directly or not, by name.
    pub transitive_dependencies: Vec<String>,
}

impl<'a> ProducerContext<'a> {
    /// A task builder for this target, ordered after the target's begin gate.
    pub fn task<S: Into<String>>(&self, rule_info: impl IntoIterator<Item = S>) -> TaskBuilder {
        TaskBuilder::new(rule_info)
            .target(self.target.name())
            .order_only(begin_gate(self.target.name()))
    }
}

/// Everything a workspace producer may look at: all targets of the request.
pub struct WorkspaceContext<'a> {
    pub project: &'a Project,
    pub request: &'a BuildRequest,
    pub targets: &'a [ConfiguredTarget],
}

#[derive(Debug, Default)]
pub struct ProducerOutput {
    pub tasks: Vec<PlannedTask>,
    pub diagnostics: Vec<Diagnostic>,
}

impl ProducerOutput {
    pub fn push(&mut self, task: PlannedTask) {
        self.tasks.push(task);
    }

    pub fn diagnose(&mut self, diag: Diagnostic) {
        self.diagnostics.push(diag);
    }

    pub fn extend(&mut self, other: ProducerOutput) {
        self.tasks.extend(other.tasks);
        self.diagnostics.extend(other.diagnostics);
    }
}

pub trait TaskProducer: Send + Sync {
    fn name(&self) -> &'static str;
    fn produce(&self, cx: &ProducerContext, out: &mut ProducerOutput);
}

/// A producer that needs every target at once, e.g. to write a file shared
/// between targets.
pub trait WorkspaceTaskProducer: Send + Sync {
    fn name(&self) -> &'static str;
    fn produce(&self, cx: &WorkspaceContext, out: &mut ProducerOutput);
}

/// The set of producers a build runs.  Built once and passed to the
/// description builder.
#[derive(Default)]
pub struct ProducerRegistry {
    target: Vec<Box<dyn TaskProducer>>,
    workspace: Vec<Box<dyn WorkspaceTaskProducer>>,
}

impl ProducerRegistry {
    pub fn empty() -> Self {
        ProducerRegistry::default()
    }

    pub fn standard() -> Self {
        ProducerRegistry::empty()
            .with_target_producer(ProductStructureProducer)
            .with_target_producer(SourcesProducer)
            .with_target_producer(LinkProducer)
            .with_target_producer(ResourcesProducer)
            .with_target_producer(DependencyInfoProducer)
            .with_workspace_producer(CasConfigProducer)
            .with_workspace_producer(DependencyInfoMergeProducer)
    }

    pub fn with_target_producer(mut self, producer: impl TaskProducer + 'static) -> Self {
        self.target.push(Box::new(producer));
        self
    }

    pub fn with_workspace_producer(mut self, producer: impl WorkspaceTaskProducer + 'static) -> Self {
        self.workspace.push(Box::new(producer));
        self
    }

    pub fn target_producers(&self) -> &[Box<dyn TaskProducer>] {
        &self.target
    }

    pub fn workspace_producers(&self) -> &[Box<dyn WorkspaceTaskProducer>] {
        &self.workspace
    }
}

pub fn begin_gate(target: &str) -> NodeRef {
    NodeRef::gate(format!("{}-begin", target))
}

pub fn end_gate(target: &str) -> NodeRef {
    NodeRef::gate(format!("{}-end", target))
}

/// The two gates bracketing a target: the begin gate waits for the end gates
/// of its dependencies, the end gate for everything the target's tasks
/// produce.
pub fn gate_tasks(cx: &ProducerContext, tasks: &[PlannedTask]) -> [PlannedTask; 2] {
    let name = cx.target.name();
    let begin = TaskBuilder::new(["Gate".to_string(), format!("{}-begin", name)])
        .target(name)
        .gate()
        .inputs(cx.dependencies.iter().map(|dep| end_gate(dep.name())))
        .output(begin_gate(name))
        .build();
    let mut produced: Vec<NodeRef> = tasks
        .iter()
        .flat_map(|task| task.outputs.iter().cloned())
        .collect();
    produced.sort();
    produced.dedup();
    let end = TaskBuilder::new(["Gate".to_string(), format!("{}-end", name)])
        .target(name)
        .gate()
        .order_only(begin_gate(name))
        .inputs(produced)
        .output(end_gate(name))
        .build();
    [begin, end]
}
