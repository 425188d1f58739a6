use super::sources::scan_requests;
use super::{ProducerContext, ProducerOutput, TaskProducer, WorkspaceContext, WorkspaceTaskProducer};
use crate::canon;
use crate::depinfo::TargetDependencyInfo;
use crate::graph::{
    ActionKind, DependencyDumpPayload, DependencyInfoPayload, NodeRef, Payload, TaskBuilder,
};
use crate::project::{BuildRequest, ConfiguredTarget};
use crate::settings;

fn wants_dump(request: &BuildRequest, target: &ConfiguredTarget) -> bool {
    request.dependency_info_output.is_some() || target.settings.bool(settings::DUMP_DEPENDENCIES)
}

/// Where a target's dependency info dump is written.
pub fn dependency_info_path(target: &ConfiguredTarget) -> String {
    canon::join(
        target.temp_dir(),
        format!("{}-dependency-info.json", target.name()),
    )
}

/// Writes each target's linkage inputs and outputs to a dump file.
pub struct DependencyInfoProducer;

impl TaskProducer for DependencyInfoProducer {
    fn name(&self) -> &'static str {
        "dependency-info"
    }

    fn produce(&self, cx: &ProducerContext, out: &mut ProducerOutput) {
        if !wants_dump(cx.request, cx.target) {
            return;
        }
        let info = TargetDependencyInfo::for_target(&cx.project.name, cx.target);
        let path = dependency_info_path(cx.target);
        out.push(
            cx.task(["WriteDependencyInfo", path.as_str()])
                .output(NodeRef::path(&path))
                .action(ActionKind::DumpDependencies)
                .payload(Payload::DependencyDump(DependencyDumpPayload {
                    path,
                    info,
                    scans: scan_requests(cx.target),
                }))
                .build(),
        );
    }
}

/// Merges every dump of the request into the requested report.
pub struct DependencyInfoMergeProducer;

impl WorkspaceTaskProducer for DependencyInfoMergeProducer {
    fn name(&self) -> &'static str {
        "dependency-info-merge"
    }

    fn produce(&self, cx: &WorkspaceContext, out: &mut ProducerOutput) {
        let Some(output) = &cx.request.dependency_info_output else {
            return;
        };
        let output = canon::canon_path(output);
        let inputs: Vec<String> = cx
            .targets
            .iter()
            .filter(|t| wants_dump(cx.request, t))
            .map(dependency_info_path)
            .collect();
        out.push(
            TaskBuilder::new(["MergeDependencyInfo", output.as_str()])
                .inputs(inputs.iter().map(NodeRef::path))
                .output(NodeRef::path(&output))
                .action(ActionKind::MergeDependencyInfo)
                .payload(Payload::DependencyInfo(DependencyInfoPayload { inputs, output }))
                .build(),
        );
    }
}
