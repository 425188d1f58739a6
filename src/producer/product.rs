use super::{ProducerContext, ProducerOutput, TaskProducer};
use crate::graph::{ActionKind, NodeRef};
use crate::project::ProductType;
use crate::validity::ValidityCriteria;

/// Lays out a target's product: the bundle and resources directories, the
/// version symlinks of a framework, and a final touch of the bundle once its
/// binary is linked.  All of these are speculative and are pruned when
/// nothing else lands in the bundle.
pub struct ProductStructureProducer;

impl TaskProducer for ProductStructureProducer {
    fn name(&self) -> &'static str {
        "product-structure"
    }

    fn produce(&self, cx: &ProducerContext, out: &mut ProducerOutput) {
        let structure = cx.target.product_structure();
        let Some(wrapper) = &structure.wrapper else {
            return;
        };

        for dir in std::iter::once(wrapper).chain(structure.resources_dir.iter()) {
            out.push(
                cx.task(["MkDir", dir.as_str()])
                    .output(NodeRef::path(dir))
                    .action(ActionKind::MakeDirectory { path: dir.clone() })
                    .validity(ValidityCriteria::DirectoryCreation { path: dir.clone() })
                    .build(),
            );
        }

        for (path, destination) in &structure.symlinks {
            out.push(
                cx.task(["SymLink", path.as_str(), destination.as_str()])
                    .output(NodeRef::path(path))
                    .action(ActionKind::Symlink {
                        path: path.clone(),
                        destination: destination.clone(),
                    })
                    .validity(ValidityCriteria::SymlinkCreation {
                        path: path.clone(),
                        destination: destination.clone(),
                    })
                    .build(),
            );
        }

        if let (Some(binary), ProductType::Application | ProductType::Framework) =
            (&structure.binary, structure.product_type)
        {
            out.push(
                cx.task(["Touch", wrapper.as_str()])
                    .input(NodeRef::path(binary))
                    .output(NodeRef::gate(format!("{}-touch", cx.target.name())))
                    .action(ActionKind::Touch {
                        path: binary.clone(),
                    })
                    .validity(ValidityCriteria::Postprocessing {
                        input: binary.clone(),
                    })
                    .build(),
            );
        }
    }
}
