use super::process::run_command;
use super::{create_parent_dirs, ActionContext, DynamicStatus, PerformContext, TaskAction, TaskOutcome};
use crate::coordinator::{DynamicTaskKey, Priority};
use crate::db::{stamp_files, TaskRecord};
use crate::module_graph::{DriverJob, ModuleGraphFlavor};
use std::sync::Arc;

/// Runs one scanned compiler job, after the jobs it depends on, replaying
/// it from the compilation cache when possible.
pub struct DriverJobAction {
    flavor: ModuleGraphFlavor,
    /// None for explicit module builds shared between plans.
    plan_id: Option<String>,
    job: Arc<DriverJob>,
    materialize: Option<DynamicStatus>,
    failed_deps: Vec<String>,
}

impl DriverJobAction {
    pub fn new(flavor: ModuleGraphFlavor, plan_id: Option<String>, job: Arc<DriverJob>) -> Self {
        DriverJobAction {
            flavor,
            plan_id,
            job,
            materialize: None,
            failed_deps: Vec::new(),
        }
    }

    /// The job's key in the build database.
    fn db_id(&self) -> String {
        match &self.plan_id {
            Some(plan_id) => format!("job {} {}", plan_id, self.job.key),
            None => format!("job {}", self.job.key),
        }
    }

    fn record(&self, cx: &PerformContext) {
        match stamp_files(cx.fs, self.job.inputs.iter().map(String::as_str)) {
            Ok(inputs) => cx.db.record(
                &self.db_id(),
                TaskRecord {
                    signature: self.job.signature(),
                    inputs,
                },
            ),
            Err(err) => tracing::debug!("not recording {}: {}", self.job.key, err),
        }
    }

    /// Restores the job's outputs from a cache hit.
    fn replay(&self, cx: &PerformContext) -> bool {
        let (Some(cache), Some(key)) = (&cx.systems.cache, &self.job.cache_key) else {
            return false;
        };
        let entry = match cache.query_local_cache_key(key) {
            Ok(Some(entry)) if entry.unmaterialized().next().is_none() => entry,
            Ok(_) => return false,
            Err(err) => {
                tracing::warn!("compilation cache: {}", err);
                return false;
            }
        };
        match cache.replay(&entry, &self.job.outputs) {
            Ok(()) => true,
            Err(err) => {
                tracing::warn!("replaying {} from cache: {}", self.job.key, err);
                false
            }
        }
    }

    fn publish(&self, cx: &PerformContext) {
        let (Some(cache), Some(key)) = (&cx.systems.cache, &self.job.cache_key) else {
            return;
        };
        match cache.store_compilation(key, &self.job.outputs) {
            Ok(entry) => {
                if let Some(uploader) = &cx.systems.uploader {
                    uploader.upload(entry);
                }
            }
            Err(err) => tracing::warn!("caching {}: {}", self.job.key, err),
        }
    }
}

impl TaskAction for DriverJobAction {
    fn setup(&mut self, cx: &mut ActionContext) {
        let systems = cx.systems();
        for dep in &self.job.depends_on {
            let explicit = self.plan_id.is_none()
                || (self.flavor == ModuleGraphFlavor::Swift
                    && systems.swift.planned_explicit_dependency_job(dep).is_ok());
            let key = match &self.plan_id {
                Some(plan_id) if !explicit => DynamicTaskKey::DriverJob {
                    flavor: self.flavor,
                    plan_id: plan_id.clone(),
                    job: dep.clone(),
                },
                _ => DynamicTaskKey::ExplicitDependencyJob { job: dep.clone() },
            };
            cx.request(key, Priority::Normal);
        }
        if let (Some(cache_key), Some(_)) = (&self.job.cache_key, &systems.cache) {
            cx.request(
                DynamicTaskKey::MaterializeKey {
                    cache_key: cache_key.clone(),
                },
                Priority::High,
            );
        }
    }

    fn dependency_ready(&mut self, key: &DynamicTaskKey, status: DynamicStatus, _cx: &mut ActionContext) {
        match key {
            DynamicTaskKey::MaterializeKey { .. } => self.materialize = Some(status),
            _ if !status.succeeded() => self.failed_deps.push(key.to_string()),
            _ => {}
        }
    }

    fn perform(self: Box<Self>, cx: &PerformContext) -> TaskOutcome {
        if cx.cancel.is_cancelled() {
            return TaskOutcome::cancelled();
        }
        if !self.failed_deps.is_empty() {
            return TaskOutcome::failed(format!(
                "{} not run: {} failed",
                self.job.key,
                self.failed_deps.join(", ")
            ));
        }

        let staleness = cx.db.staleness(
            cx.fs,
            &self.db_id(),
            &self.job.signature(),
            self.job.inputs.iter().map(String::as_str),
            self.job.output_paths(),
        );
        match staleness {
            Ok(staleness) if !staleness.is_stale() => return TaskOutcome::succeeded(false),
            Ok(staleness) => tracing::debug!(?staleness, "{} is stale", self.job.key),
            Err(err) => tracing::debug!("{}: {}, running", self.job.key, err),
        }

        if self.materialize.map_or(false, |s| s.cache_hit) && self.replay(cx) {
            tracing::debug!("{} replayed from cache", self.job.key);
            self.record(cx);
            return TaskOutcome {
                cache_hit: true,
                ..TaskOutcome::succeeded(true)
            };
        }

        if let Err(err) = create_parent_dirs(self.job.output_paths()) {
            return TaskOutcome::failed(format!("creating output directories: {}", err));
        }
        let outcome = run_command(&self.job.command, cx);
        if outcome.status().succeeded() {
            self.record(cx);
            self.publish(cx);
        }
        outcome
    }
}
