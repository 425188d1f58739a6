use super::{ActionContext, CommandResult, DynamicStatus, PerformContext, TaskAction, TaskOutcome};
use crate::coordinator::{DynamicTaskKey, Priority};
use crate::diagnostic::{has_errors, Diagnostic};
use crate::graph::SwiftDriverPayload;
use crate::module_graph::{validate_module_dependencies, ModuleGraphFlavor};

/// Drives a module's whole build: scans it, runs every job the scan planned,
/// and checks the module's imports against what the target declares.
pub struct SwiftDriverAction {
    payload: SwiftDriverPayload,
    failure: Option<String>,
    failed_jobs: Vec<String>,
    did_work: bool,
    diagnostics: Vec<Diagnostic>,
}

impl SwiftDriverAction {
    pub fn new(payload: SwiftDriverPayload) -> Self {
        SwiftDriverAction {
            payload,
            failure: None,
            failed_jobs: Vec::new(),
            did_work: false,
            diagnostics: Vec::new(),
        }
    }

    fn scanned(&mut self, plan_id: &str, cx: &mut ActionContext) {
        let systems = cx.systems();
        let build = match systems.swift.query_planned_build(plan_id) {
            Ok(build) => build,
            Err(err) => {
                self.failure = Some(err.to_string());
                return;
            }
        };
        for job in build.jobs().iter().filter(|job| !job.explicit_dependency) {
            cx.request(
                DynamicTaskKey::DriverJob {
                    flavor: ModuleGraphFlavor::Swift,
                    plan_id: plan_id.to_string(),
                    job: job.key.clone(),
                },
                Priority::Normal,
            );
        }

        let imports = systems
            .swift
            .import_module_dependencies(plan_id)
            .unwrap_or_default();
        let target = &self.payload.target;
        if let Some(severity) = self.payload.module_validation {
            self.diagnostics.extend(validate_module_dependencies(
                target,
                &self.payload.scan.module_name,
                &self.payload.declared_module_dependencies,
                &imports,
                severity,
            ));
        }

        // Any module the build reaches, not only direct imports, must come
        // from a target this one depends on.
        let modules = systems
            .swift
            .transitive_dependency_module_names(plan_id)
            .unwrap_or_default();
        for module in &modules {
            let Some(defining) = systems.defining_target(module) else {
                continue;
            };
            if defining == *target || self.payload.target_dependencies.contains(&defining) {
                continue;
            }
            self.diagnostics.push(
                Diagnostic::warning(format!(
                    "'{}' is missing a dependency on '{}' because dependency scan of '{}' discovered a dependency on '{}'",
                    target, defining, plan_id, module
                ))
                .for_target(target.clone()),
            );
        }
    }
}

impl TaskAction for SwiftDriverAction {
    fn setup(&mut self, cx: &mut ActionContext) {
        cx.request(
            DynamicTaskKey::ModuleScan(self.payload.scan.clone()),
            Priority::High,
        );
    }

    fn dependency_ready(&mut self, key: &DynamicTaskKey, status: DynamicStatus, cx: &mut ActionContext) {
        match key {
            DynamicTaskKey::ModuleScan(request) => {
                if status.succeeded() {
                    self.scanned(&request.plan_id, cx);
                } else {
                    self.failure = Some(format!("dependency scan of {} failed", request.plan_id));
                }
            }
            DynamicTaskKey::DriverJob { job, .. } => {
                if !status.succeeded() {
                    self.failed_jobs.push(job.clone());
                }
                self.did_work |= status.did_work;
            }
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
        let mut outcome = TaskOutcome::succeeded(self.did_work).with_diagnostics(self.diagnostics);
        if !self.failed_jobs.is_empty() {
            outcome.diagnostics.push(Diagnostic::error(format!(
                "{} failed: {}",
                self.payload.scan.module_name,
                self.failed_jobs.join(", ")
            )));
        }
        if has_errors(&outcome.diagnostics) {
            outcome.result = CommandResult::Failed;
        }
        outcome
    }
}
