//! Build runner, choosing and executing tasks as determined by out of date
//! inputs.
//!
//! Static tasks come from the build description.  When a task's action asks
//! for dynamic work, the request goes through the coordinator: a new key
//! becomes a new job in this run, an existing one gets the requester added
//! to its waiters.  Actions only ever learn about finished requests through
//! `dependency_ready`, delivered from this thread; `perform` runs on the
//! worker pool and reports back over a channel.

use crate::action::{self, ActionContext, CommandResult, DynamicStatus, PerformContext, TaskAction, TaskOutcome};
use crate::cancel::CancellationToken;
use crate::coordinator::{BuildSystems, DynamicRequest, DynamicTaskContext, DynamicTaskHandle, DynamicTaskKey, Priority};
use crate::db::{stamp_files, Db, Staleness, TaskRecord};
use crate::dense_id;
use crate::densemap::{DenseMap, Index};
use crate::description::BuildDescription;
use crate::diagnostic::{has_errors, Diagnostic};
use crate::fs::FileSystem;
use crate::graph::{ActionKind, PlannedTask, TaskId};
use crate::process::Spawner;
use crate::verify::DependencyVerifier;
use rustc_hash::FxHashMap;
use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, VecDeque};
use std::sync::mpsc;

dense_id!(
    /// Id for a job within one run: static tasks first, then dynamic tasks
    /// in the order they were requested.
    JobId
);

#[derive(Debug, Clone, Copy)]
pub struct Options {
    pub parallelism: usize,
    /// Keep starting unrelated work after a failure.
    pub keep_going: bool,
}

#[derive(Debug)]
pub struct FailedTask {
    pub name: String,
    /// Output of the failed command, if it ran one.
    pub output: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct BuildSummary {
    /// Static tasks that ran and changed something.
    pub ran: usize,
    /// Static tasks found up to date, by the database or by their action.
    pub up_to_date: usize,
    /// Tasks never started, because a predecessor failed or the build stopped.
    pub skipped: usize,
    pub failed: Vec<FailedTask>,
    pub cancelled: bool,
    pub diagnostics: Vec<Diagnostic>,
    /// Dynamic tasks performed.
    pub dynamic_ran: usize,
    pub cache_hits: usize,
}

impl BuildSummary {
    pub fn success(&self) -> bool {
        self.failed.is_empty() && !self.cancelled
    }
}

/// The outside world a run touches.
#[derive(Clone, Copy)]
pub struct BuildEnv<'a> {
    pub spawner: &'a dyn Spawner,
    pub fs: &'a dyn FileSystem,
    pub db: &'a Db,
    pub verifier: &'a DependencyVerifier,
    pub cancel: &'a CancellationToken,
}

enum Origin {
    Static(TaskId),
    Dynamic(DynamicTaskHandle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    /// Waiting on static predecessors.
    Blocked,
    /// Set up; waiting on the dynamic tasks it requested.
    Waiting,
    Ready,
    Running,
    Done,
}

/// How a job came to be done.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Performed,
    UpToDate,
    Skipped,
}

struct Job {
    origin: Origin,
    name: String,
    target: Option<String>,
    state: JobState,
    /// Created when a static job is activated; given up front for dynamic ones.
    action: Option<Box<dyn TaskAction>>,
    priority: Priority,
    /// Static predecessors not yet done.
    blocked_on: usize,
    /// Dynamic requests not yet reported back.
    outstanding: usize,
    failed_pred: bool,
    /// A predecessor producing one of our real inputs did work this run.
    input_changed: bool,
    /// Static successors, and whether we produce one of their real inputs.
    dependents: Vec<(JobId, bool)>,
    /// Requesters to notify, with the key each asked under.
    waiters: Vec<(JobId, DynamicTaskKey)>,
    /// Resolution failures of our own requests, reported with our outcome.
    diagnostics: Vec<Diagnostic>,
}

impl Job {
    fn new(origin: Origin, name: String, priority: Priority) -> Self {
        Job {
            origin,
            name,
            target: None,
            state: JobState::Blocked,
            action: None,
            priority,
            blocked_on: 0,
            outstanding: 0,
            failed_pred: false,
            input_changed: false,
            dependents: Vec::new(),
            waiters: Vec::new(),
            diagnostics: Vec::new(),
        }
    }
}

fn failed_status() -> DynamicStatus {
    DynamicStatus {
        result: CommandResult::Failed,
        cache_hit: false,
        did_work: false,
    }
}

/// Whether the database decides if the task runs.  Gates have no outputs
/// worth checking, compile tasks defer to the jobs they drive, which are
/// checked one by one, and dependency dumps depend on scan results.
fn db_checked(task: &PlannedTask) -> bool {
    !matches!(
        task.action,
        ActionKind::Gate
            | ActionKind::ClangCompile
            | ActionKind::SwiftDriver
            | ActionKind::DumpDependencies
    )
}

pub struct Work<'a> {
    description: &'a BuildDescription,
    coordinator: &'a DynamicTaskContext,
    systems: &'a BuildSystems,
    env: BuildEnv<'a>,
    options: Options,

    jobs: DenseMap<JobId, Job>,
    dynamic: FxHashMap<DynamicTaskHandle, JobId>,
    activate: VecDeque<JobId>,
    notify: VecDeque<(JobId, DynamicTaskKey, DynamicStatus)>,
    ready: BinaryHeap<(Priority, Reverse<u64>, JobId)>,
    seq: u64,
    running: usize,
    /// No new work is started once set.
    stopping: bool,
    summary: BuildSummary,
}

impl<'a> Work<'a> {
    pub fn new(
        description: &'a BuildDescription,
        coordinator: &'a DynamicTaskContext,
        env: BuildEnv<'a>,
        options: Options,
    ) -> Self {
        let graph = &description.graph;
        let mut jobs: DenseMap<JobId, Job> = DenseMap::default();
        for (id, task) in graph.tasks() {
            let priority = if task.ordering.immediate {
                Priority::High
            } else {
                Priority::Normal
            };
            let mut job = Job::new(Origin::Static(id), task.identifier(), priority);
            job.target = task.target.clone();
            jobs.push(job);
        }
        for (id, _) in graph.tasks() {
            // Predecessor -> whether it produces one of our real inputs.
            let mut preds: BTreeMap<TaskId, bool> = BTreeMap::new();
            for &n in graph.inputs(id) {
                for &p in &graph.node(n).producers {
                    preds.insert(p, true);
                }
            }
            for &n in graph.order_only(id) {
                for &p in &graph.node(n).producers {
                    preds.entry(p).or_insert(false);
                }
            }
            preds.remove(&id);
            let me = JobId::from(id.index());
            jobs[me].blocked_on = preds.len();
            for (p, via_input) in preds {
                jobs[JobId::from(p.index())].dependents.push((me, via_input));
            }
        }
        let activate = jobs
            .iter()
            .filter(|(_, job)| job.blocked_on == 0)
            .map(|(id, _)| id)
            .collect();

        Work {
            description,
            coordinator,
            systems: coordinator.systems(),
            env,
            options,
            jobs,
            dynamic: FxHashMap::default(),
            activate,
            notify: VecDeque::new(),
            ready: BinaryHeap::new(),
            seq: 0,
            running: 0,
            stopping: false,
            summary: BuildSummary::default(),
        }
    }

    fn task(&self, id: JobId) -> Option<&'a PlannedTask> {
        match self.jobs[id].origin {
            Origin::Static(task) => Some(self.description.graph.task(task)),
            Origin::Dynamic(_) => None,
        }
    }

    /// Runs until every job is done or the build stops.
    pub fn run(mut self) -> anyhow::Result<BuildSummary> {
        let _span = tracing::info_span!("work.run", tasks = self.jobs.len()).entered();
        let parallelism = self.options.parallelism.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(parallelism)
            .thread_name(|i| format!("dynbuild-worker-{}", i))
            .build()?;
        let (tx, rx) = mpsc::channel::<(JobId, TaskOutcome)>();
        let env = self.env;
        let systems = self.systems;

        pool.in_place_scope(|scope| -> anyhow::Result<()> {
            loop {
                self.pump();
                if env.cancel.is_cancelled() && !self.summary.cancelled {
                    tracing::info!("build cancelled");
                    self.summary.cancelled = true;
                    self.stopping = true;
                }
                while self.running < parallelism && !self.stopping {
                    let Some((_, _, id)) = self.ready.pop() else {
                        break;
                    };
                    let Some(action) = self.jobs[id].action.take() else {
                        continue;
                    };
                    tracing::debug!("start {}", self.jobs[id].name);
                    self.jobs[id].state = JobState::Running;
                    self.running += 1;
                    let tx = tx.clone();
                    scope.spawn(move |_| {
                        let cx = PerformContext {
                            systems,
                            spawner: env.spawner,
                            fs: env.fs,
                            db: env.db,
                            cancel: env.cancel,
                            verifier: env.verifier,
                        };
                        let outcome = action.perform(&cx);
                        // The receiver outlives every worker.
                        let _ = tx.send((id, outcome));
                    });
                }
                if self.running == 0 {
                    break;
                }
                let (id, outcome) = rx.recv()?;
                self.running -= 1;
                self.complete(id, outcome, Disposition::Performed);
            }
            Ok(())
        })?;

        self.abandon();
        tracing::info!(
            ran = self.summary.ran,
            up_to_date = self.summary.up_to_date,
            dynamic = self.summary.dynamic_ran,
            failed = self.summary.failed.len(),
            "build finished"
        );
        Ok(self.summary)
    }

    /// Activates and notifies until nothing more can happen without a task
    /// finishing.
    fn pump(&mut self) {
        loop {
            if let Some(id) = self.activate.pop_front() {
                self.activate_job(id);
            } else if let Some((id, key, status)) = self.notify.pop_front() {
                self.deliver(id, key, status);
            } else {
                break;
            }
        }
    }

    fn activate_job(&mut self, id: JobId) {
        if self.jobs[id].state != JobState::Blocked || self.stopping {
            return;
        }
        if self.jobs[id].failed_pred {
            let skipped = TaskOutcome {
                result: CommandResult::Failed,
                ..TaskOutcome::succeeded(false)
            };
            self.complete(id, skipped, Disposition::Skipped);
            return;
        }

        if let Some(task) = self.task(id) {
            if db_checked(task) && !task.ordering.always_run && !self.jobs[id].input_changed {
                let staleness = self.env.db.staleness(
                    self.env.fs,
                    &self.jobs[id].name,
                    &task.signature,
                    task.real_inputs(),
                    task.real_outputs(),
                );
                match staleness {
                    Ok(Staleness::UpToDate) => {
                        self.complete(id, TaskOutcome::succeeded(false), Disposition::UpToDate);
                        return;
                    }
                    Ok(staleness) => tracing::debug!(?staleness, "{} is stale", task.identifier()),
                    Err(err) => tracing::debug!("{}: {}, running", task.identifier(), err),
                }
            }
            self.jobs[id].action = Some(action::for_task(task));
        }

        let Some(mut action) = self.jobs[id].action.take() else {
            return;
        };
        self.jobs[id].state = JobState::Waiting;
        let mut cx = ActionContext::new(self.systems);
        action.setup(&mut cx);
        self.jobs[id].action = Some(action);
        self.submit(id, cx.take_requests());
        self.ready_if_idle(id);
    }

    /// Hands a job's dynamic requests to the coordinator.
    fn submit(&mut self, id: JobId, requests: Vec<(DynamicTaskKey, Priority)>) {
        for (key, priority) in requests {
            self.jobs[id].outstanding += 1;
            match self.coordinator.request_task(key.clone(), priority) {
                Ok(DynamicRequest::New { handle, action }) => {
                    let mut job = Job::new(Origin::Dynamic(handle), key.to_string(), priority);
                    job.target = self.jobs[id].target.clone();
                    job.action = Some(action);
                    job.waiters.push((id, key));
                    let new = self.jobs.push(job);
                    self.dynamic.insert(handle, new);
                    self.activate.push_back(new);
                }
                Ok(DynamicRequest::Existing {
                    finished: Some(status),
                    ..
                }) => self.notify.push_back((id, key, status)),
                Ok(DynamicRequest::Existing {
                    handle,
                    finished: None,
                }) => match self.dynamic.get(&handle) {
                    Some(&existing) => self.jobs[existing].waiters.push((id, key)),
                    None => {
                        let message = format!("{} is owned by another build", key);
                        self.reject(id, key, message);
                    }
                },
                Err(err) => {
                    let message = err.to_string();
                    self.reject(id, key, message);
                }
            }
        }
    }

    /// A request that could not be resolved fails only the requester.
    fn reject(&mut self, id: JobId, key: DynamicTaskKey, message: String) {
        tracing::debug!("{} requested {}: {}", self.jobs[id].name, key, message);
        let mut diag = Diagnostic::error(format!("{}: {}", key, message));
        if let Some(target) = &self.jobs[id].target {
            diag = diag.for_target(target.clone());
        }
        self.jobs[id].diagnostics.push(diag);
        self.notify.push_back((id, key, failed_status()));
    }

    fn deliver(&mut self, id: JobId, key: DynamicTaskKey, status: DynamicStatus) {
        let job = &mut self.jobs[id];
        job.outstanding = job.outstanding.saturating_sub(1);
        if job.state != JobState::Waiting {
            return;
        }
        let Some(mut action) = job.action.take() else {
            return;
        };
        let mut cx = ActionContext::new(self.systems);
        action.dependency_ready(&key, status, &mut cx);
        self.jobs[id].action = Some(action);
        self.submit(id, cx.take_requests());
        self.ready_if_idle(id);
    }

    fn ready_if_idle(&mut self, id: JobId) {
        let job = &mut self.jobs[id];
        if job.state == JobState::Waiting && job.outstanding == 0 {
            job.state = JobState::Ready;
            self.ready.push((job.priority, Reverse(self.seq), id));
            self.seq += 1;
        }
    }

    fn complete(&mut self, id: JobId, outcome: TaskOutcome, disposition: Disposition) {
        let task = self.task(id);
        let job = &mut self.jobs[id];
        job.state = JobState::Done;

        let mut diagnostics = std::mem::take(&mut job.diagnostics);
        diagnostics.extend(outcome.diagnostics);
        if let Some(target) = &job.target {
            for diag in diagnostics.iter_mut().filter(|d| d.target.is_none()) {
                diag.target = Some(target.clone());
            }
        }
        let mut status = DynamicStatus {
            result: outcome.result,
            cache_hit: outcome.cache_hit,
            did_work: outcome.did_work,
        };
        if status.succeeded() && has_errors(&diagnostics) {
            status.result = CommandResult::Failed;
        }

        let counted = task.map_or(false, |t| t.action != ActionKind::Gate);
        match (disposition, status.result) {
            (Disposition::Skipped, _) => {
                if counted {
                    self.summary.skipped += 1;
                }
            }
            (Disposition::UpToDate, _) => {
                if counted {
                    self.summary.up_to_date += 1;
                }
            }
            (Disposition::Performed, result) => {
                if task.is_none() {
                    self.summary.dynamic_ran += 1;
                } else if counted && result == CommandResult::Succeeded {
                    if status.did_work {
                        self.summary.ran += 1;
                    } else {
                        self.summary.up_to_date += 1;
                    }
                }
                if status.cache_hit {
                    self.summary.cache_hits += 1;
                }
                match result {
                    CommandResult::Succeeded => {}
                    CommandResult::Failed => {
                        tracing::error!("{} failed", job.name);
                        self.summary.failed.push(FailedTask {
                            name: job.name.clone(),
                            output: outcome.output,
                        });
                        if !self.options.keep_going {
                            self.stopping = true;
                        }
                    }
                    CommandResult::Cancelled => {
                        self.summary.cancelled = true;
                        self.stopping = true;
                    }
                }
            }
        }
        self.summary.diagnostics.extend(diagnostics);

        if let (Some(task), Disposition::Performed) = (task, disposition) {
            if db_checked(task) {
                self.record(task, status);
            }
        }

        for (dep, via_input) in std::mem::take(&mut self.jobs[id].dependents) {
            let d = &mut self.jobs[dep];
            if !status.succeeded() {
                d.failed_pred = true;
            }
            if via_input && status.did_work {
                d.input_changed = true;
            }
            d.blocked_on -= 1;
            if d.blocked_on == 0 {
                self.activate.push_back(dep);
            }
        }
        if let Origin::Dynamic(handle) = self.jobs[id].origin {
            self.coordinator.task_finished(handle, status);
            for (waiter, key) in std::mem::take(&mut self.jobs[id].waiters) {
                self.notify.push_back((waiter, key, status));
            }
        }
    }

    fn record(&self, task: &PlannedTask, status: DynamicStatus) {
        let id = task.identifier();
        if !status.succeeded() {
            self.env.db.forget(&id);
            return;
        }
        match stamp_files(self.env.fs, task.real_inputs()) {
            Ok(inputs) => self.env.db.record(
                &id,
                TaskRecord {
                    signature: task.signature,
                    inputs,
                },
            ),
            Err(err) => tracing::debug!("not recording {}: {}", id, err),
        }
    }

    /// Settles every job left when the loop ends.  If the build was not
    /// stopping, the jobs still waiting are waiting on each other.
    fn abandon(&mut self) {
        let deadlocked = !self.stopping;
        let ids: Vec<JobId> = self.jobs.all_ids().collect();
        for id in ids {
            let job = &mut self.jobs[id];
            if job.state == JobState::Done {
                continue;
            }
            let was_waiting = job.state == JobState::Waiting;
            job.state = JobState::Done;
            if let Origin::Dynamic(handle) = job.origin {
                self.coordinator.task_finished(handle, failed_status());
            }
            if deadlocked && was_waiting {
                let mut diag = Diagnostic::error(format!(
                    "{} never became ready: its dynamic dependencies form a cycle",
                    job.name
                ));
                if let Some(target) = &job.target {
                    diag = diag.for_target(target.clone());
                }
                self.summary.diagnostics.push(diag);
                self.summary.failed.push(FailedTask {
                    name: job.name.clone(),
                    output: Vec::new(),
                });
            } else if matches!(job.origin, Origin::Static(_)) {
                self.summary.skipped += 1;
            }
        }
    }
}
