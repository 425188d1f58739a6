use super::{ActionContext, DynamicStatus, PerformContext, TaskAction, TaskOutcome};
use crate::coordinator::{DynamicTaskKey, Priority};
use crate::graph::DependencyDumpPayload;
use std::path::Path;

/// Writes a target's dependency info dump after its scans, adding the
/// imports and includes they discovered to what planning knew.
pub struct DependencyDumpAction {
    payload: DependencyDumpPayload,
    failed_scans: Vec<String>,
}

impl DependencyDumpAction {
    pub fn new(payload: DependencyDumpPayload) -> Self {
        DependencyDumpAction {
            payload,
            failed_scans: Vec::new(),
        }
    }
}

impl TaskAction for DependencyDumpAction {
    fn setup(&mut self, cx: &mut ActionContext) {
        for scan in &self.payload.scans {
            cx.request(DynamicTaskKey::ModuleScan(scan.clone()), Priority::Normal);
        }
    }

    fn dependency_ready(&mut self, key: &DynamicTaskKey, status: DynamicStatus, _cx: &mut ActionContext) {
        if let DynamicTaskKey::ModuleScan(request) = key {
            if !status.succeeded() {
                self.failed_scans.push(request.plan_id.clone());
            }
        }
    }

    fn perform(self: Box<Self>, cx: &PerformContext) -> TaskOutcome {
        if cx.cancel.is_cancelled() {
            return TaskOutcome::cancelled();
        }
        if !self.failed_scans.is_empty() {
            return TaskOutcome::failed(format!(
                "dependency scan of {} failed",
                self.failed_scans.join(", ")
            ));
        }

        let DependencyDumpPayload { path, mut info, scans } = (*self).payload;
        for scan in &scans {
            match cx
                .systems
                .graph(scan.flavor)
                .import_module_dependencies(&scan.plan_id)
            {
                Ok(imports) => info.add_imports(&scan.module_name, &imports),
                Err(err) => return TaskOutcome::failed(err.to_string()),
            }
        }

        let contents = match serde_json::to_vec_pretty(&info) {
            Ok(contents) => contents,
            Err(err) => return TaskOutcome::failed(format!("encoding {}: {}", path, err)),
        };
        if std::fs::read(&path).ok().as_deref() == Some(contents.as_slice()) {
            return TaskOutcome::succeeded(false);
        }
        match crate::fs::write_atomic(Path::new(&path), &contents) {
            Ok(()) => TaskOutcome::succeeded(true),
            Err(err) => TaskOutcome::failed(format!("write {}: {}", path, err)),
        }
    }
}
