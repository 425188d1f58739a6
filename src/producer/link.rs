use super::{ProducerContext, ProducerOutput, TaskProducer};
use crate::canon;
use crate::depinfo::inputs_from_linker_flags;
use crate::graph::{ActionKind, Command, LinkPayload, NodeRef, Payload};
use crate::project::{BuildCommand, BuildPhase, FileType, ProductType};
use crate::settings;
use crate::verify::severity_from_setting;

/// Links a target's objects into its product: `libtool` for static
/// libraries, the linker for everything else.  Linking is left out when
/// preparing for indexing.
pub struct LinkProducer;

impl TaskProducer for LinkProducer {
    fn name(&self) -> &'static str {
        "link"
    }

    fn produce(&self, cx: &ProducerContext, out: &mut ProducerOutput) {
        let target = cx.target;
        if cx.request.command == BuildCommand::PrepareForIndexing {
            return;
        }
        let structure = target.product_structure();
        let Some(binary) = structure.binary else {
            return;
        };

        let mut objects = Vec::new();
        let mut linked = Vec::new();
        for phase in target.phases() {
            match phase {
                BuildPhase::Sources { files } => {
                    for file in files {
                        let t = file.file_type();
                        if t.is_c_family() || t == FileType::SwiftSource {
                            objects.push(target.object_path(&target.resolve(&file.path)));
                        }
                    }
                }
                BuildPhase::Frameworks { files } => {
                    linked.extend(
                        files
                            .iter()
                            .filter(|f| f.file_type().is_linkable())
                            .map(|f| target.resolve(&f.path)),
                    );
                }
                _ => {}
            }
        }

        if structure.product_type == ProductType::StaticLibrary {
            let mut args = vec![
                target.settings.get_or(settings::LIBTOOL, "libtool").to_string(),
                "-static".to_string(),
                "-o".to_string(),
                binary.clone(),
            ];
            args.extend(objects.iter().cloned());
            out.push(
                cx.task(["Libtool", binary.as_str()])
                    .inputs(objects.iter().map(NodeRef::path))
                    .output(NodeRef::path(&binary))
                    .command(Command::new(args))
                    .build(),
            );
            return;
        }

        // Products of dependencies that can be linked against.
        let products: Vec<_> = cx
            .dependencies
            .iter()
            .map(|dep| dep.product_structure())
            .filter(|p| p.product_type != ProductType::Aggregate)
            .filter(|p| p.product_type != ProductType::Tool && p.product_type != ProductType::Application)
            .collect();

        let mut args = vec![
            target.settings.get_or(settings::LD, "ld").to_string(),
            "-arch".to_string(),
            target.arch(),
        ];
        if matches!(
            structure.product_type,
            ProductType::Framework | ProductType::DynamicLibrary
        ) {
            args.push("-dylib".to_string());
        }
        args.push("-o".to_string());
        args.push(binary.clone());
        args.extend(objects.iter().cloned());
        args.extend(linked.iter().cloned());
        args.extend(products.iter().filter_map(|p| p.binary.clone()));
        let flags = target.settings.list(settings::OTHER_LDFLAGS);
        args.extend(flags.iter().cloned());

        let mut declared = target.settings.list(settings::LINK_DEPENDENCIES);
        declared.extend(linked.iter().map(|path| canon::file_name(path).to_string()));
        declared.extend(products.iter().filter_map(|p| p.link_name()));
        declared.extend(
            inputs_from_linker_flags(&flags)
                .iter()
                .map(|input| input.name.sortable_name().to_string()),
        );
        declared.sort();
        declared.dedup();

        let trace_path = canon::join(
            target.temp_dir(),
            format!("{}-linker-trace.json", target.name()),
        );
        out.push(
            cx.task(["Ld", binary.as_str()])
                .inputs(objects.iter().map(NodeRef::path))
                .inputs(linked.iter().map(NodeRef::path))
                .inputs(products.iter().filter_map(|p| p.binary.as_ref()).map(NodeRef::path))
                .output(NodeRef::path(&binary))
                .command(Command::new(args))
                .action(ActionKind::Link)
                .payload(Payload::Link(LinkPayload {
                    target: target.name().to_string(),
                    declared_dependencies: declared,
                    verification: severity_from_setting(
                        target.settings.get(settings::VALIDATE_LINK_DEPENDENCIES),
                    ),
                    trace_path,
                }))
                .build(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing;
    use super::*;
    use crate::project::BuildRequest;
    use crate::settings::Settings;

    const PROJECT: &str = r#"{
        "name": "P",
        "settings": {"PROJECT_DIR": "/p"},
        "targets": [
            {"name": "App", "product_type": "application", "dependencies": ["Lib", "Gen"],
             "settings": {"OTHER_LDFLAGS": "-lz -framework Metal",
                          "VALIDATE_LINK_DEPENDENCIES": "YES"},
             "phases": [
                {"kind": "sources", "files": [{"path": "main.c"}, {"path": "app.swift"}]},
                {"kind": "frameworks", "files": [{"path": "/sdk/usr/lib/libFoo.dylib"}]}]},
            {"name": "Lib", "product_type": "framework",
             "phases": [{"kind": "sources", "files": [{"path": "lib.c"}]}]},
            {"name": "Gen", "product_type": "aggregate"},
            {"name": "Archive", "product_type": "static-library",
             "phases": [{"kind": "sources", "files": [{"path": "x.c"}]}]}
        ]
    }"#;

    #[test]
    fn links_objects_and_dependencies() {
        let project = testing::project(PROJECT);
        let out = testing::produce(&LinkProducer, &project, "App");
        assert_eq!(out.tasks.len(), 1);
        let task = &out.tasks[0];
        assert_eq!(task.identifier(), "Ld /p/build/Products/debug/App.app/App");
        assert_eq!(task.action, ActionKind::Link);
        let inputs: Vec<&str> = task.real_inputs().collect();
        assert_eq!(
            inputs,
            vec![
                "/p/build/Intermediates/App.build/Objects/arm64/main.o",
                "/p/build/Intermediates/App.build/Objects/arm64/app.o",
                "/sdk/usr/lib/libFoo.dylib",
                "/p/build/Products/debug/Lib.framework/Versions/A/Lib",
            ]
        );
        match &task.payload {
            Some(Payload::Link(payload)) => {
                assert_eq!(
                    payload.declared_dependencies,
                    vec!["Lib.framework", "Metal", "libFoo.dylib", "z"]
                );
                assert!(payload.verification.is_some());
                assert_eq!(
                    payload.trace_path,
                    "/p/build/Intermediates/App.build/App-linker-trace.json"
                );
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn static_library_uses_libtool() {
        let project = testing::project(PROJECT);
        let out = testing::produce(&LinkProducer, &project, "Archive");
        assert_eq!(out.tasks[0].command.args[..3], ["libtool", "-static", "-o"]);
        assert_eq!(out.tasks[0].action, ActionKind::Process);
    }

    #[test]
    fn skipped_for_indexing() {
        let project = testing::project(PROJECT);
        let request = BuildRequest {
            targets: vec!["App".into()],
            command: BuildCommand::PrepareForIndexing,
            overrides: Settings::new(),
            dependency_info_output: None,
        };
        let out = testing::produce_with(&LinkProducer, &project, &request, "App");
        assert!(out.tasks.is_empty());
    }

    #[test]
    fn dependency_path_is_in_the_signature() {
        let mut project = testing::project(PROJECT);
        let before = testing::produce(&LinkProducer, &project, "App").tasks[0].signature;
        let lib = project.targets.iter_mut().find(|t| t.name == "Lib").unwrap();
        lib.settings.set(settings::PRODUCT_NAME, "Core");
        let after = testing::produce(&LinkProducer, &project, "App").tasks[0].signature;
        assert_ne!(before, after);
    }
}
