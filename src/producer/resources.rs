use super::{ProducerContext, ProducerOutput, TaskProducer};
use crate::canon;
use crate::graph::{ActionKind, NodeRef};
use crate::project::{BuildCommand, BuildPhase};

/// Copies resources into the product and runs copy-files phases.
pub struct ResourcesProducer;

impl TaskProducer for ResourcesProducer {
    fn name(&self) -> &'static str {
        "resources"
    }

    fn produce(&self, cx: &ProducerContext, out: &mut ProducerOutput) {
        let target = cx.target;
        if cx.request.command == BuildCommand::PrepareForIndexing {
            return;
        }
        let structure = target.product_structure();
        let resources_dir = structure
            .resources_dir
            .clone()
            .unwrap_or_else(|| target.built_products_dir().to_string());

        for phase in target.phases() {
            let (dir, files, rule) = match phase {
                BuildPhase::Resources { files } => (resources_dir.clone(), files, "CpResource"),
                BuildPhase::CopyFiles { destination, files } => (
                    canon::join(target.built_products_dir(), destination),
                    files,
                    "Copy",
                ),
                _ => continue,
            };
            for file in files {
                let from = target.resolve(&file.path);
                let to = canon::join(&dir, canon::file_name(&from));
                out.push(
                    cx.task([rule, to.as_str(), from.as_str()])
                        .input(NodeRef::path(&from))
                        .output(NodeRef::path(&to))
                        .action(ActionKind::Copy { from, to })
                        .build(),
                );
            }
        }
    }
}
