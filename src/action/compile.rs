use super::{ActionContext, CommandResult, DynamicStatus, PerformContext, TaskAction, TaskOutcome};
use crate::coordinator::{DynamicTaskKey, Priority};
use crate::graph::ClangCompilePayload;
use crate::module_graph::{ModuleGraphFlavor, ScanRequest};

/// Plans a module build.  Deduplicated by request, so however many tasks of
/// a target ask, one of these runs.
pub struct ScanAction {
    request: ScanRequest,
}

impl ScanAction {
    pub fn new(request: ScanRequest) -> Self {
        ScanAction { request }
    }
}

impl TaskAction for ScanAction {
    fn perform(self: Box<Self>, cx: &PerformContext) -> TaskOutcome {
        let (ok, diagnostics) = match self.request.flavor {
            ModuleGraphFlavor::Clang => cx.systems.clang.plan_build(&self.request, cx.cancel),
            ModuleGraphFlavor::Swift => cx.systems.swift.plan_build(&self.request, cx.cancel),
        };
        if cx.cancel.is_cancelled() {
            return TaskOutcome::cancelled();
        }
        let mut outcome = if ok {
            TaskOutcome::succeeded(false)
        } else {
            TaskOutcome {
                result: CommandResult::Failed,
                ..TaskOutcome::succeeded(false)
            }
        };
        outcome.diagnostics = diagnostics;
        outcome
    }
}

/// Compiles one C-family source: waits for its target's scan, then for the
/// scanned job that compiles this file.
pub struct ClangCompileAction {
    payload: ClangCompilePayload,
    failure: Option<String>,
    job: Option<DynamicStatus>,
}

impl ClangCompileAction {
    pub fn new(payload: ClangCompilePayload) -> Self {
        ClangCompileAction {
            payload,
            failure: None,
            job: None,
        }
    }
}

impl TaskAction for ClangCompileAction {
    fn setup(&mut self, cx: &mut ActionContext) {
        cx.request(
            DynamicTaskKey::ModuleScan(self.payload.scan.clone()),
            Priority::High,
        );
    }

    fn dependency_ready(&mut self, key: &DynamicTaskKey, status: DynamicStatus, cx: &mut ActionContext) {
        match key {
            DynamicTaskKey::ModuleScan(request) => {
                if !status.succeeded() {
                    self.failure = Some(format!("dependency scan of {} failed", request.plan_id));
                    return;
                }
                match cx
                    .systems()
                    .clang
                    .job_for_source(&request.plan_id, &self.payload.source)
                {
                    Ok(job) => cx.request(
                        DynamicTaskKey::DriverJob {
                            flavor: ModuleGraphFlavor::Clang,
                            plan_id: request.plan_id.clone(),
                            job: job.key.clone(),
                        },
                        Priority::Normal,
                    ),
                    Err(err) => self.failure = Some(err.to_string()),
                }
            }
            DynamicTaskKey::DriverJob { .. } => self.job = Some(status),
            _ => {}
        }
    }

    fn perform(self: Box<Self>, cx: &PerformContext) -> TaskOutcome {
        if cx.cancel.is_cancelled() {
            return TaskOutcome::cancelled();
        }
        if let Some(failure) = self.failure {
            return TaskOutcome::failed(failure);
        }
        match self.job {
            Some(status) => TaskOutcome {
                result: status.result,
                cache_hit: status.cache_hit,
                ..TaskOutcome::succeeded(status.did_work)
            },
            None => TaskOutcome::failed(format!("no compile job ran for {}", self.payload.source)),
        }
    }
}
