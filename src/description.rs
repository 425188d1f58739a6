//! Build descriptions: the task graph for one build request.
//!
//! The builder configures every requested target and its dependencies, runs
//! the registered producers over them level by level (targets of one level
//! in parallel), then validates the merged result serially: validity
//! pruning, duplicate output detection and ordering cycle detection.
//! Validation problems come back as diagnostics on the description.

use crate::diagnostic::{self, Diagnostic};
use crate::error::DescriptionError;
use crate::graph::{Graph, PlannedTask, TaskId};
use crate::hash::{Signature, SignatureHasher};
use crate::producer::{
    gate_tasks, ProducerContext, ProducerOutput, ProducerRegistry, WorkspaceContext,
};
use crate::project::{BuildPhase, BuildRequest, ConfiguredTarget, Project, Target};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

/// The complete, immutable task graph for one build request.
#[derive(Debug)]
pub struct BuildDescription {
    /// Signature of the request this was built from.
    pub signature: Signature,
    pub graph: Graph,
    /// Tasks by owning target.
    pub target_tasks: BTreeMap<String, Vec<TaskId>>,
    /// Direct dependencies of every planned target.
    pub target_dependencies: BTreeMap<String, Vec<String>>,
    /// Module name to the target that builds it.
    pub module_definitions: BTreeMap<String, String>,
    pub diagnostics: Vec<Diagnostic>,
    /// Identifiers of tasks dropped by validity pruning.
    pub pruned: Vec<String>,
}

impl BuildDescription {
    pub fn has_errors(&self) -> bool {
        diagnostic::has_errors(&self.diagnostics)
    }

    /// Every task's signature by identifier.
    pub fn task_signatures(&self) -> BTreeMap<String, Signature> {
        self.graph
            .tasks()
            .map(|(_, task)| (task.identifier(), task.signature))
            .collect()
    }

    pub fn tasks_of(&self, target: &str) -> impl Iterator<Item = &PlannedTask> {
        self.target_tasks
            .get(target)
            .into_iter()
            .flatten()
            .map(|&id| self.graph.task(id))
    }
}

/// A request resolved to configured targets, before any producer has run.
/// Its signature is the description cache key.
pub struct PlannedRequest<'a> {
    pub project: &'a Project,
    pub request: &'a BuildRequest,
    /// Ordered by (dependency level, name).
    pub targets: Vec<ConfiguredTarget>,
    /// Indices into `targets`; every dependency is on an earlier level.
    pub levels: Vec<Vec<usize>>,
    pub signature: Signature,
}

/// Computes dependency levels by depth-first search, reporting the first
/// cycle found as the path of target names around it.
struct Leveler<'a> {
    project: &'a Project,
    levels: HashMap<&'a str, usize>,
    stack: Vec<&'a str>,
}

impl<'a> Leveler<'a> {
    fn visit(&mut self, target: &'a Target) -> Result<usize, DescriptionError> {
        if let Some(&level) = self.levels.get(target.name.as_str()) {
            return Ok(level);
        }
        if let Some(pos) = self.stack.iter().position(|&n| n == target.name) {
            let mut cycle: Vec<String> = self.stack[pos..].iter().map(|n| n.to_string()).collect();
            cycle.push(target.name.clone());
            return Err(DescriptionError::TargetCycle(cycle));
        }
        self.stack.push(&target.name);
        let mut level = 0;
        for dep in &target.dependencies {
            let dep_target =
                self.project
                    .target(dep)
                    .ok_or_else(|| DescriptionError::UnknownDependency {
                        target: target.name.clone(),
                        dependency: dep.clone(),
                    })?;
            level = level.max(self.visit(dep_target)? + 1);
        }
        self.stack.pop();
        self.levels.insert(&target.name, level);
        Ok(level)
    }
}

fn json_error(err: serde_json::Error) -> DescriptionError {
    DescriptionError::Other(err.into())
}

/// Resolves the targets of a request and computes its signature.  Fails only
/// when the request cannot be planned at all.
pub fn plan_request<'a>(
    project: &'a Project,
    request: &'a BuildRequest,
) -> Result<PlannedRequest<'a>, DescriptionError> {
    if request.targets.is_empty() {
        return Err(DescriptionError::EmptyRequest);
    }
    let mut leveler = Leveler {
        project,
        levels: HashMap::new(),
        stack: Vec::new(),
    };
    for name in &request.targets {
        let target = project
            .target(name)
            .ok_or_else(|| DescriptionError::UnknownTarget(name.clone()))?;
        leveler.visit(target)?;
    }

    let mut order: Vec<(usize, &str)> = leveler
        .levels
        .iter()
        .map(|(&name, &level)| (level, name))
        .collect();
    order.sort_unstable();

    let mut targets = Vec::with_capacity(order.len());
    let mut levels: Vec<Vec<usize>> = Vec::new();
    for (level, name) in order {
        let Some(target) = project.target(name) else {
            continue;
        };
        if levels.len() <= level {
            levels.resize_with(level + 1, Vec::new);
        }
        levels[level].push(targets.len());
        targets.push(ConfiguredTarget::new(project, target, &request.overrides));
    }

    let mut h = SignatureHasher::new("build-request");
    h.write_str(&project.name);
    h.write_json(&request.command).map_err(json_error)?;
    request.overrides.write_signature(&mut h);
    h.write_bool(request.dependency_info_output.is_some());
    h.write_str(request.dependency_info_output.as_deref().unwrap_or(""));
    h.write_u64(targets.len() as u64);
    for target in &targets {
        h.write_str(target.name());
        h.write_signature(&target.settings.signature());
        h.write_json(&target.target).map_err(json_error)?;
    }

    Ok(PlannedRequest {
        project,
        request,
        targets,
        levels,
        signature: h.finish(),
    })
}

/// Runs producers over planned requests.  Holds the producer registry, so
/// one builder yields the same description for the same request.
pub struct DescriptionBuilder {
    registry: Arc<ProducerRegistry>,
    parallelism: usize,
}

impl DescriptionBuilder {
    pub fn new(registry: Arc<ProducerRegistry>, parallelism: usize) -> Self {
        DescriptionBuilder {
            registry,
            parallelism: parallelism.max(1),
        }
    }

    pub fn build(
        &self,
        project: &Project,
        request: &BuildRequest,
    ) -> Result<BuildDescription, DescriptionError> {
        let planned = plan_request(project, request)?;
        self.build_resolved(&planned)
    }

    fn context<'a>(
        &self,
        planned: &'a PlannedRequest,
        index: &HashMap<&str, usize>,
        transitive: &[Vec<String>],
        i: usize,
    ) -> ProducerContext<'a> {
        let target = &planned.targets[i];
        ProducerContext {
            project: planned.project,
            request: planned.request,
            target,
            dependencies: target
                .target
                .dependencies
                .iter()
                .filter_map(|dep| index.get(dep.as_str()))
                .map(|&d| &planned.targets[d])
                .collect(),
            transitive_dependencies: transitive[i].clone(),
        }
    }

    fn produce_target(&self, cx: &ProducerContext) -> ProducerOutput {
        let mut out = ProducerOutput::default();
        for producer in self.registry.target_producers() {
            let mut produced = ProducerOutput::default();
            producer.produce(cx, &mut produced);
            tracing::trace!(
                "{} planned {} tasks for {}",
                producer.name(),
                produced.tasks.len(),
                cx.target.name()
            );
            out.extend(produced);
        }
        out
    }

    pub fn build_resolved(
        &self,
        planned: &PlannedRequest,
    ) -> Result<BuildDescription, DescriptionError> {
        let _span = tracing::info_span!(
            "build_description",
            targets = planned.targets.len(),
            signature = %planned.signature
        )
        .entered();

        let index: HashMap<&str, usize> = planned
            .targets
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name(), i))
            .collect();

        // Levels are in dependency order, so every dependency's set is ready.
        let mut transitive: Vec<Vec<String>> = vec![Vec::new(); planned.targets.len()];
        for &i in planned.levels.iter().flatten() {
            let mut all = BTreeSet::new();
            for dep in &planned.targets[i].target.dependencies {
                if let Some(&d) = index.get(dep.as_str()) {
                    all.insert(dep.clone());
                    all.extend(transitive[d].iter().cloned());
                }
            }
            transitive[i] = all.into_iter().collect();
        }

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.parallelism)
            .build()
            .map_err(|err| DescriptionError::Other(err.into()))?;

        let mut per_target: Vec<(usize, ProducerOutput)> = Vec::new();
        for level in &planned.levels {
            let outputs: Vec<(usize, ProducerOutput)> = pool.install(|| {
                level
                    .par_iter()
                    .map(|&i| {
                        let cx = self.context(planned, &index, &transitive, i);
                        (i, self.produce_target(&cx))
                    })
                    .collect()
            });
            per_target.extend(outputs);
        }

        let mut workspace = ProducerOutput::default();
        let workspace_cx = WorkspaceContext {
            project: planned.project,
            request: planned.request,
            targets: &planned.targets,
        };
        for producer in self.registry.workspace_producers() {
            producer.produce(&workspace_cx, &mut workspace);
        }

        let mut diagnostics = Vec::new();
        let mut tasks = Vec::new();
        let mut owners = Vec::new();
        for (i, out) in per_target {
            diagnostics.extend(out.diagnostics);
            owners.extend(std::iter::repeat(Some(i)).take(out.tasks.len()));
            tasks.extend(out.tasks);
        }
        diagnostics.extend(workspace.diagnostics);
        owners.extend(std::iter::repeat(None).take(workspace.tasks.len()));
        tasks.extend(workspace.tasks);

        // Pruning runs before gates are added, so a target's end gate only
        // waits on what survived.
        let (tasks, pruned) = {
            let identifiers: Vec<String> = tasks.iter().map(PlannedTask::identifier).collect();
            let (kept, pruned) = crate::validity::prune_invalid(tasks);
            let dropped: BTreeSet<&str> = pruned.iter().map(String::as_str).collect();
            let owners: Vec<Option<usize>> = identifiers
                .iter()
                .zip(owners)
                .filter(|(id, _)| !dropped.contains(id.as_str()))
                .map(|(_, owner)| owner)
                .collect();
            (kept.into_iter().zip(owners).collect::<Vec<_>>(), pruned)
        };
        for id in &pruned {
            tracing::debug!("pruned {}", id);
        }

        let mut by_target: Vec<Vec<PlannedTask>> = vec![Vec::new(); planned.targets.len()];
        let mut unowned = Vec::new();
        for (task, owner) in tasks {
            match owner {
                Some(i) => by_target[i].push(task),
                None => unowned.push(task),
            }
        }

        let mut graph = Graph::new();
        let mut add = |task: PlannedTask, diagnostics: &mut Vec<Diagnostic>| {
            let target = task.target.clone();
            if let Err(err) = graph.add_task(task) {
                let mut diag = Diagnostic::error(err.to_string());
                if let Some(target) = target {
                    diag = diag.for_target(target);
                }
                diagnostics.push(diag);
            }
        };
        for &i in planned.levels.iter().flatten() {
            let cx = self.context(planned, &index, &transitive, i);
            let tasks = std::mem::take(&mut by_target[i]);
            let gates = gate_tasks(&cx, &tasks);
            for task in tasks.into_iter().chain(gates) {
                add(task, &mut diagnostics);
            }
        }
        for task in unowned {
            add(task, &mut diagnostics);
        }

        if let Some(cycle) = graph.find_cycle() {
            let names: Vec<String> = cycle
                .iter()
                .map(|&id| graph.task(id).identifier())
                .collect();
            diagnostics.push(Diagnostic::error(format!(
                "cycle in task ordering: {}",
                names.join(" -> ")
            )));
        }

        let mut target_tasks: BTreeMap<String, Vec<TaskId>> = BTreeMap::new();
        for (id, task) in graph.tasks() {
            if let Some(target) = &task.target {
                target_tasks.entry(target.clone()).or_default().push(id);
            }
        }

        let target_dependencies = planned
            .targets
            .iter()
            .map(|t| (t.name().to_string(), t.target.dependencies.clone()))
            .collect();

        let mut module_definitions = BTreeMap::new();
        for target in &planned.targets {
            let has_sources = target
                .phases()
                .iter()
                .any(|phase| matches!(phase, BuildPhase::Sources { files } if !files.is_empty()));
            if has_sources {
                module_definitions
                    .entry(target.module_name().to_string())
                    .or_insert_with(|| target.name().to_string());
            }
        }

        let description = BuildDescription {
            signature: planned.signature,
            graph,
            target_tasks,
            target_dependencies,
            module_definitions,
            diagnostics,
            pruned,
        };
        tracing::info!(
            "planned {} tasks for {} targets",
            description.graph.task_count(),
            planned.targets.len()
        );
        Ok(description)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{NodeRef, TaskBuilder};
    use crate::producer::TaskProducer;
    use crate::project::BuildCommand;

    const PROJECT: &str = r#"{
        "name": "P",
        "settings": {"PROJECT_DIR": "/p"},
        "targets": [
            {"name": "App", "product_type": "application", "dependencies": ["Lib"],
             "phases": [{"kind": "sources", "files": [{"path": "main.c"}]},
                        {"kind": "resources", "files": [{"path": "icon.png"}]}]},
            {"name": "Lib", "product_type": "framework",
             "phases": [{"kind": "sources", "files": [{"path": "lib.c"}]}]},
            {"name": "Loop1", "product_type": "tool", "dependencies": ["Loop2"]},
            {"name": "Loop2", "product_type": "tool", "dependencies": ["Loop1"]},
            {"name": "Broken", "product_type": "tool", "dependencies": ["Nowhere"]}
        ]
    }"#;

    fn project() -> Project {
        serde_json::from_str(PROJECT).unwrap()
    }

    fn request(targets: &[&str]) -> BuildRequest {
        BuildRequest {
            targets: targets.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    fn builder() -> DescriptionBuilder {
        DescriptionBuilder::new(Arc::new(ProducerRegistry::standard()), 2)
    }

    #[test]
    fn dependencies_come_first() {
        let project = project();
        let req = request(&["App"]);
        let planned = plan_request(&project, &req).unwrap();
        let names: Vec<&str> = planned.targets.iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["Lib", "App"]);
        assert_eq!(planned.levels, vec![vec![0], vec![1]]);
    }

    #[test]
    fn request_errors() {
        let project = project();
        let empty = request(&[]);
        assert!(matches!(
            plan_request(&project, &empty),
            Err(DescriptionError::EmptyRequest)
        ));
        let unknown = request(&["Nope"]);
        assert!(matches!(
            plan_request(&project, &unknown),
            Err(DescriptionError::UnknownTarget(name)) if name == "Nope"
        ));
        let broken = request(&["Broken"]);
        assert!(matches!(
            plan_request(&project, &broken),
            Err(DescriptionError::UnknownDependency { dependency, .. }) if dependency == "Nowhere"
        ));
        let cyclic = request(&["Loop1"]);
        match plan_request(&project, &cyclic) {
            Err(err @ DescriptionError::TargetCycle(_)) => {
                assert_eq!(
                    err.to_string(),
                    "cycle in target dependencies: Loop1 -> Loop2 -> Loop1"
                );
            }
            other => panic!("unexpected {:?}", other.map(|p| p.signature)),
        }
    }

    #[test]
    fn signature_tracks_settings() {
        let project = project();
        let req = request(&["App"]);
        let a = plan_request(&project, &req).unwrap().signature;
        assert_eq!(a, plan_request(&project, &req).unwrap().signature);

        let mut changed = project.clone();
        changed.targets[1].settings.set("OTHER_CFLAGS", "-O2");
        assert_ne!(a, plan_request(&changed, &req).unwrap().signature);

        let indexing = BuildRequest {
            command: BuildCommand::PrepareForIndexing,
            ..request(&["App"])
        };
        assert_ne!(a, plan_request(&project, &indexing).unwrap().signature);
    }

    #[test]
    fn deterministic_and_gated() {
        let project = project();
        let req = request(&["App"]);
        let first = builder().build(&project, &req).unwrap();
        let second = builder().build(&project, &req).unwrap();
        assert!(!first.has_errors(), "{:?}", first.diagnostics);
        assert_eq!(first.task_signatures(), second.task_signatures());

        // App's begin gate waits for Lib's end gate.
        let begin = first.graph.task_by_identifier("Gate App-begin").unwrap();
        assert_eq!(
            first.graph.task(begin).inputs,
            vec![NodeRef::gate("Lib-end")]
        );
        assert_eq!(first.module_definitions.get("Lib").map(String::as_str), Some("Lib"));
        assert!(first.tasks_of("App").any(|t| t.rule_info[0] == "Ld"));
    }

    #[test]
    fn indexing_prunes_unused_structure() {
        let project = project();
        let req = BuildRequest {
            command: BuildCommand::PrepareForIndexing,
            ..request(&["App"])
        };
        let desc = builder().build(&project, &req).unwrap();
        // Nothing lands in the bundle without linking or copying.
        assert!(desc
            .pruned
            .contains(&"MkDir /p/build/Products/debug/App.app".to_string()));
        assert!(desc.graph.task_by_identifier("Ld /p/build/Products/debug/App.app/App").is_none());
    }

    struct Clobber;

    impl TaskProducer for Clobber {
        fn name(&self) -> &'static str {
            "clobber"
        }

        fn produce(&self, cx: &ProducerContext, out: &mut ProducerOutput) {
            out.push(
                cx.task(["Clobber", cx.target.name()])
                    .output(NodeRef::path("/p/shared.txt"))
                    .build(),
            );
        }
    }

    #[test]
    fn duplicate_outputs_are_diagnosed() {
        let project = project();
        let registry = ProducerRegistry::empty().with_target_producer(Clobber);
        let desc = DescriptionBuilder::new(Arc::new(registry), 1)
            .build(&project, &request(&["App"]))
            .unwrap();
        assert!(desc.has_errors());
        assert_eq!(desc.diagnostics.len(), 1);
        assert!(desc.diagnostics[0]
            .message
            .contains("multiple commands produce /p/shared.txt"));
    }

    #[test]
    fn ordering_cycles_are_diagnosed() {
        struct Cycle;
        impl TaskProducer for Cycle {
            fn name(&self) -> &'static str {
                "cycle"
            }
            fn produce(&self, _cx: &ProducerContext, out: &mut ProducerOutput) {
                for (out_path, in_path) in [("/x/a", "/x/b"), ("/x/b", "/x/a")] {
                    out.push(
                        TaskBuilder::new(["Cycle", out_path])
                            .input(NodeRef::path(in_path))
                            .output(NodeRef::path(out_path))
                            .build(),
                    );
                }
            }
        }
        let project = project();
        let registry = ProducerRegistry::empty().with_target_producer(Cycle);
        let desc = DescriptionBuilder::new(Arc::new(registry), 1)
            .build(&project, &request(&["Lib"]))
            .unwrap();
        assert!(desc
            .diagnostics
            .iter()
            .any(|d| d.message.starts_with("cycle in task ordering")));
    }
}
