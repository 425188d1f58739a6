//! The build graph, a graph between nodes (files or virtual gates) and the
//! planned tasks that consume and produce them.

use crate::canon::canon_path;
use crate::dense_id;
use crate::depinfo::TargetDependencyInfo;
use crate::densemap::DenseMap;
use crate::diagnostic::Severity;
use crate::hash::{Signature, SignatureHasher};
use crate::module_graph::ScanRequest;
use crate::validity::ValidityCriteria;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fmt;

dense_id!(
    /// Id for a node within a Graph.
    NodeId
);
dense_id!(
    /// Id for a task within a Graph.
    TaskId
);

/// A reference to something a task reads or writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeRef {
    /// A file on disk, canonicalized.
    Path(String),
    /// A node with no content that exists only to carry an ordering edge.
    Virtual(String),
}

impl NodeRef {
    pub fn path(path: impl AsRef<str>) -> Self {
        NodeRef::Path(canon_path(path))
    }

    pub fn gate(name: impl Into<String>) -> Self {
        NodeRef::Virtual(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            NodeRef::Path(p) => p,
            NodeRef::Virtual(v) => v,
        }
    }

    pub fn is_virtual(&self) -> bool {
        matches!(self, NodeRef::Virtual(_))
    }

    pub fn as_path(&self) -> Option<&str> {
        match self {
            NodeRef::Path(p) => Some(p),
            NodeRef::Virtual(_) => None,
        }
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRef::Path(p) => f.write_str(p),
            NodeRef::Virtual(v) => write!(f, "<{}>", v),
        }
    }
}

/// An argv-like command with its environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Command {
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub cwd: Option<String>,
}

impl Command {
    pub fn new<S: Into<String>>(args: impl IntoIterator<Item = S>) -> Self {
        Command {
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            cwd: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// For display, e.g. in failure output.
    pub fn cmdline(&self) -> String {
        self.args.join(" ")
    }

    fn write_signature(&self, hasher: &mut SignatureHasher) {
        hasher.write_strs(&self.args);
        hasher.write_u64(self.env.len() as u64);
        for (k, v) in &self.env {
            hasher.write_str(k);
            hasher.write_str(v);
        }
        hasher.write_str(self.cwd.as_deref().unwrap_or(""));
    }
}

/// How a task is carried out.  Most tasks spawn their command; the rest are
/// performed in-process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Process,
    /// Runs the linker and checks its trace against declared dependencies.
    Link,
    WriteFile { path: String, contents: Vec<u8> },
    MakeDirectory { path: String },
    Symlink { path: String, destination: String },
    Copy { from: String, to: String },
    /// Updates the modification time of an existing product.
    Touch { path: String },
    Gate,
    /// Scans, then drives the per-file compile job dynamically.
    ClangCompile,
    /// Plans a module build, then drives all of its jobs dynamically.
    SwiftDriver,
    /// Writes a target's dependency info once its scans have run.
    DumpDependencies,
    MergeDependencyInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClangCompilePayload {
    pub scan: ScanRequest,
    pub source: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwiftDriverPayload {
    pub scan: ScanRequest,
    pub target: String,
    /// Module dependencies the target declares, with optional access level.
    pub declared_module_dependencies: Vec<String>,
    pub module_validation: Option<Severity>,
    /// Every target this one depends on, directly or not.
    pub target_dependencies: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkPayload {
    pub target: String,
    pub declared_dependencies: Vec<String>,
    /// None when verification is off.
    pub verification: Option<Severity>,
    pub trace_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyInfoPayload {
    pub inputs: Vec<String>,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyDumpPayload {
    pub path: String,
    /// What planning knows: linked inputs and outputs.
    pub info: TargetDependencyInfo,
    /// The target's scans, whose imports complete the dump.
    pub scans: Vec<ScanRequest>,
}

/// Tool-specific data needed to carry out or interpret a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    ClangCompile(ClangCompilePayload),
    SwiftDriver(SwiftDriverPayload),
    Link(LinkPayload),
    DependencyInfo(DependencyInfoPayload),
    DependencyDump(DependencyDumpPayload),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskOrdering {
    /// Run as soon as possible, ahead of other ready work.
    pub immediate: bool,
    /// Produces only virtual outputs; may share them with other gates.
    pub gate: bool,
    /// Never considered up to date.
    pub always_run: bool,
}

/// One unit of build work.  Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedTask {
    pub rule_info: Vec<String>,
    pub target: Option<String>,
    /// Inputs that make the task stale when they change.
    pub inputs: Vec<NodeRef>,
    /// Inputs that must exist first but never make the task stale.
    pub order_only: Vec<NodeRef>,
    pub outputs: Vec<NodeRef>,
    pub command: Command,
    pub action: ActionKind,
    pub payload: Option<Payload>,
    pub ordering: TaskOrdering,
    pub validity: Option<ValidityCriteria>,
    pub signature: Signature,
}

impl PlannedTask {
    /// The unique identifier of the task within a description.
    pub fn identifier(&self) -> String {
        self.rule_info.join(" ")
    }

    pub fn real_outputs(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().filter_map(NodeRef::as_path)
    }

    pub fn real_inputs(&self) -> impl Iterator<Item = &str> {
        self.inputs.iter().filter_map(NodeRef::as_path)
    }
}

pub struct TaskBuilder {
    task: PlannedTask,
}

impl TaskBuilder {
    pub fn new<S: Into<String>>(rule_info: impl IntoIterator<Item = S>) -> Self {
        TaskBuilder {
            task: PlannedTask {
                rule_info: rule_info.into_iter().map(Into::into).collect(),
                target: None,
                inputs: Vec::new(),
                order_only: Vec::new(),
                outputs: Vec::new(),
                command: Command::default(),
                action: ActionKind::Process,
                payload: None,
                ordering: TaskOrdering::default(),
                validity: None,
                signature: Signature([0; 32]),
            },
        }
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.task.target = Some(target.into());
        self
    }

    pub fn input(mut self, node: NodeRef) -> Self {
        self.task.inputs.push(node);
        self
    }

    pub fn inputs(mut self, nodes: impl IntoIterator<Item = NodeRef>) -> Self {
        self.task.inputs.extend(nodes);
        self
    }

    pub fn order_only(mut self, node: NodeRef) -> Self {
        self.task.order_only.push(node);
        self
    }

    pub fn output(mut self, node: NodeRef) -> Self {
        self.task.outputs.push(node);
        self
    }

    pub fn outputs(mut self, nodes: impl IntoIterator<Item = NodeRef>) -> Self {
        self.task.outputs.extend(nodes);
        self
    }

    pub fn command(mut self, command: Command) -> Self {
        self.task.command = command;
        self
    }

    pub fn action(mut self, action: ActionKind) -> Self {
        self.task.action = action;
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.task.payload = Some(payload);
        self
    }

    pub fn immediate(mut self) -> Self {
        self.task.ordering.immediate = true;
        self
    }

    pub fn gate(mut self) -> Self {
        self.task.ordering.gate = true;
        self.task.action = ActionKind::Gate;
        self
    }

    pub fn always_run(mut self) -> Self {
        self.task.ordering.always_run = true;
        self
    }

    pub fn validity(mut self, criteria: ValidityCriteria) -> Self {
        self.task.validity = Some(criteria);
        self
    }

    pub fn build(mut self) -> PlannedTask {
        self.task.signature = task_signature(&self.task);
        self.task
    }
}

/// The rule signature of a task: everything about it that, if changed, means
/// its previous results cannot be reused.
fn task_signature(task: &PlannedTask) -> Signature {
    let mut hasher = SignatureHasher::new("task");
    hasher.write_strs(&task.rule_info);
    for list in [&task.inputs, &task.order_only, &task.outputs] {
        hasher.write_u64(list.len() as u64);
        for node in list {
            hasher.write_bool(node.is_virtual());
            hasher.write_str(node.name());
        }
    }
    task.command.write_signature(&mut hasher);
    // Payloads and actions are plain data with ordered fields.
    let _ = hasher.write_json(&task.action);
    let _ = hasher.write_json(&task.payload);
    hasher.write_bool(task.ordering.immediate);
    hasher.write_bool(task.ordering.gate);
    hasher.write_bool(task.ordering.always_run);
    hasher.finish()
}

#[derive(Debug)]
pub struct Node {
    pub name: NodeRef,
    /// Normally at most one; several only for virtual nodes shared by gates.
    pub producers: Vec<TaskId>,
    pub consumers: Vec<TaskId>,
}

#[derive(Debug, Default)]
struct TaskNodes {
    ins: Vec<NodeId>,
    order_only: Vec<NodeId>,
    outs: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    DuplicateOutput {
        output: NodeRef,
        existing: String,
        task: String,
    },
    DuplicateIdentifier(String),
}

impl fmt::Display for GraphError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphError::DuplicateOutput {
                output,
                existing,
                task,
            } => write!(
                f,
                "multiple commands produce {}: {:?} and {:?}",
                output, existing, task
            ),
            GraphError::DuplicateIdentifier(id) => {
                write!(f, "unexpected duplicate task identifier {:?}", id)
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Graph {
    nodes: DenseMap<NodeId, Node>,
    tasks: DenseMap<TaskId, PlannedTask>,
    task_nodes: DenseMap<TaskId, TaskNodes>,
    by_name: FxHashMap<NodeRef, NodeId>,
    by_identifier: FxHashMap<String, TaskId>,
}

impl Graph {
    pub fn new() -> Self {
        Graph::default()
    }

    pub fn node_id(&mut self, node: &NodeRef) -> NodeId {
        if let Some(&id) = self.by_name.get(node) {
            return id;
        }
        let id = self.nodes.push(Node {
            name: node.clone(),
            producers: Vec::new(),
            consumers: Vec::new(),
        });
        self.by_name.insert(node.clone(), id);
        id
    }

    pub fn lookup(&self, node: &NodeRef) -> Option<NodeId> {
        self.by_name.get(node).copied()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn task(&self, id: TaskId) -> &PlannedTask {
        &self.tasks[id]
    }

    pub fn task_by_identifier(&self, identifier: &str) -> Option<TaskId> {
        self.by_identifier.get(identifier).copied()
    }

    pub fn tasks(&self) -> impl Iterator<Item = (TaskId, &PlannedTask)> {
        self.tasks.iter()
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn inputs(&self, id: TaskId) -> &[NodeId] {
        &self.task_nodes[id].ins
    }

    pub fn order_only(&self, id: TaskId) -> &[NodeId] {
        &self.task_nodes[id].order_only
    }

    pub fn outputs(&self, id: TaskId) -> &[NodeId] {
        &self.task_nodes[id].outs
    }

    /// Tasks that must finish before `id` may start.
    pub fn predecessors(&self, id: TaskId) -> impl Iterator<Item = TaskId> + '_ {
        let nodes = &self.task_nodes[id];
        nodes
            .ins
            .iter()
            .chain(nodes.order_only.iter())
            .flat_map(move |&n| self.nodes[n].producers.iter().copied())
    }

    /// Adds a task, rejecting a second producer of a node unless every
    /// producer involved is a gate and the node is virtual.
    pub fn add_task(&mut self, task: PlannedTask) -> Result<TaskId, GraphError> {
        let identifier = task.identifier();
        if self.by_identifier.contains_key(&identifier) {
            return Err(GraphError::DuplicateIdentifier(identifier));
        }
        for out in &task.outputs {
            let Some(id) = self.lookup(out) else { continue };
            let node = &self.nodes[id];
            let Some(&first) = node.producers.first() else {
                continue;
            };
            let shared_gate = out.is_virtual()
                && task.ordering.gate
                && node.producers.iter().all(|&p| self.tasks[p].ordering.gate);
            if !shared_gate {
                return Err(GraphError::DuplicateOutput {
                    output: out.clone(),
                    existing: self.tasks[first].identifier(),
                    task: identifier,
                });
            }
        }

        let id = self.tasks.next_id();
        let mut nodes = TaskNodes::default();
        for node in &task.inputs {
            let n = self.node_id(node);
            self.nodes[n].consumers.push(id);
            nodes.ins.push(n);
        }
        for node in &task.order_only {
            let n = self.node_id(node);
            self.nodes[n].consumers.push(id);
            nodes.order_only.push(n);
        }
        for node in &task.outputs {
            let n = self.node_id(node);
            self.nodes[n].producers.push(id);
            nodes.outs.push(n);
        }
        self.by_identifier.insert(identifier, id);
        self.task_nodes.push(nodes);
        self.tasks.push(task);
        Ok(id)
    }

    /// Finds an ordering cycle, returned as the tasks along it.
    pub fn find_cycle(&self) -> Option<Vec<TaskId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            Visiting,
            Done,
        }
        let mut marks: DenseMap<TaskId, Mark> = DenseMap::new_sized(self.tasks.len(), Mark::New);
        for start in self.tasks.all_ids() {
            if marks[start] != Mark::New {
                continue;
            }
            // Stack of (task, its predecessors, next predecessor index).
            let mut stack: Vec<(TaskId, Vec<TaskId>, usize)> = Vec::new();
            marks[start] = Mark::Visiting;
            stack.push((start, self.predecessors(start).collect(), 0));
            while let Some((task, preds, next)) = stack.last_mut() {
                if *next == preds.len() {
                    marks[*task] = Mark::Done;
                    stack.pop();
                    continue;
                }
                let pred = preds[*next];
                *next += 1;
                match marks[pred] {
                    Mark::Done => {}
                    Mark::Visiting => {
                        let pos = stack.iter().position(|(t, _, _)| *t == pred).unwrap_or(0);
                        let mut cycle: Vec<TaskId> = stack[pos..].iter().map(|(t, _, _)| *t).collect();
                        cycle.push(pred);
                        return Some(cycle);
                    }
                    Mark::New => {
                        marks[pred] = Mark::Visiting;
                        let preds = self.predecessors(pred).collect();
                        stack.push((pred, preds, 0));
                    }
                }
            }
        }
        None
    }
}
