use super::{ProducerContext, ProducerOutput, TaskProducer};
use crate::canon;
use crate::diagnostic::Diagnostic;
use crate::graph::{ActionKind, ClangCompilePayload, Command, NodeRef, Payload, SwiftDriverPayload};
use crate::module_graph::{AccessLevel, ModuleGraphFlavor, ScanRequest};
use crate::project::{BuildPhase, ConfiguredTarget, FileType};
use crate::settings;
use crate::verify::severity_from_setting;

/// Plans compilation.  C-family files get one task each, driven by the job
/// the target's scan assigns to the file; Swift files are compiled by one
/// driver task for the whole module.
pub struct SourcesProducer;

/// The sources of a target by flavor, resolved against the project.
struct Sources {
    c_family: Vec<String>,
    swift: Vec<String>,
}

/// Sorts a target's sources by flavor, handing the paths of files no rule
/// compiles to `unknown`.
fn collect_sources(target: &ConfiguredTarget, mut unknown: impl FnMut(String)) -> Sources {
    let mut sources = Sources {
        c_family: Vec::new(),
        swift: Vec::new(),
    };
    for phase in target.phases() {
        let BuildPhase::Sources { files } = phase else {
            continue;
        };
        for file in files {
            let path = target.resolve(&file.path);
            match file.file_type() {
                t if t.is_c_family() => sources.c_family.push(path),
                FileType::SwiftSource => sources.swift.push(path),
                FileType::Header => {}
                _ => unknown(path),
            }
        }
    }
    sources
}

/// The scans a target's compile tasks ask for, in the same form they ask.
pub fn scan_requests(target: &ConfiguredTarget) -> Vec<ScanRequest> {
    let sources = collect_sources(target, |_| {});
    let mut scans = Vec::new();
    if !sources.c_family.is_empty() {
        scans.push(clang_scan(target, &sources.c_family));
    }
    if !sources.swift.is_empty() {
        scans.push(swift_scan(target, &sources.swift));
    }
    scans
}

/// Splits MODULE_DEPENDENCIES into entries, keeping an access level keyword
/// together with the module it applies to: "package Foo Bar" is
/// ["package Foo", "Bar"].
pub fn declared_module_dependencies(target: &ConfiguredTarget) -> Vec<String> {
    let mut entries = Vec::new();
    let mut pending: Option<String> = None;
    for word in target.settings.list(settings::MODULE_DEPENDENCIES) {
        match pending.take() {
            Some(level) => entries.push(format!("{} {}", level, word)),
            None if AccessLevel::parse(&word).is_some() => pending = Some(word),
            None => entries.push(word),
        }
    }
    entries
}

fn clang_scan(target: &ConfiguredTarget, sources: &[String]) -> ScanRequest {
    let mut args = vec![
        target.settings.get_or(settings::CC, "clang").to_string(),
        "-arch".to_string(),
        target.arch(),
        "-fmodules".to_string(),
        format!("-fmodule-name={}", target.module_name()),
    ];
    args.extend(target.settings.list(settings::OTHER_CFLAGS));
    ScanRequest {
        flavor: ModuleGraphFlavor::Clang,
        plan_id: target.build_plan_id(),
        module_name: target.module_name().to_string(),
        command: Command::new(args),
        sources: sources.to_vec(),
        caching: target.settings.bool(settings::ENABLE_COMPILE_CACHE),
    }
}

fn swift_module_path(target: &ConfiguredTarget) -> String {
    canon::join(
        target.temp_dir(),
        format!("Objects/{}/{}.swiftmodule", target.arch(), target.module_name()),
    )
}

fn swift_scan(target: &ConfiguredTarget, sources: &[String]) -> ScanRequest {
    let mut args = vec![
        target.settings.get_or(settings::SWIFTC, "swiftc").to_string(),
        "-module-name".to_string(),
        target.module_name().to_string(),
        "-target-arch".to_string(),
        target.arch(),
        "-emit-module-path".to_string(),
        swift_module_path(target),
    ];
    args.extend(target.settings.list(settings::OTHER_SWIFT_FLAGS));
    ScanRequest {
        flavor: ModuleGraphFlavor::Swift,
        plan_id: target.build_plan_id(),
        module_name: target.module_name().to_string(),
        command: Command::new(args),
        sources: sources.to_vec(),
        caching: target.settings.bool(settings::ENABLE_COMPILE_CACHE),
    }
}

impl TaskProducer for SourcesProducer {
    fn name(&self) -> &'static str {
        "sources"
    }

    fn produce(&self, cx: &ProducerContext, out: &mut ProducerOutput) {
        let target = cx.target;
        let sources = collect_sources(target, |path| {
            out.diagnose(
                Diagnostic::warning(format!("no rule to process file '{}' of unknown type", path))
                    .for_target(target.name()),
            )
        });

        if !sources.c_family.is_empty() {
            let scan = clang_scan(target, &sources.c_family);
            for source in &sources.c_family {
                let object = target.object_path(source);
                out.push(
                    cx.task(["CompileC", object.as_str(), source.as_str()])
                        .input(NodeRef::path(source))
                        .output(NodeRef::path(&object))
                        .action(ActionKind::ClangCompile)
                        .payload(Payload::ClangCompile(ClangCompilePayload {
                            scan: scan.clone(),
                            source: source.clone(),
                        }))
                        .build(),
                );
            }
        }

        if !sources.swift.is_empty() {
            let scan = swift_scan(target, &sources.swift);
            let objects = sources
                .swift
                .iter()
                .map(|source| NodeRef::path(target.object_path(source)));
            out.push(
                cx.task(["SwiftDriver", scan.plan_id.as_str()])
                    .inputs(sources.swift.iter().map(NodeRef::path))
                    .outputs(objects)
                    .output(NodeRef::path(swift_module_path(target)))
                    .action(ActionKind::SwiftDriver)
                    .payload(Payload::SwiftDriver(SwiftDriverPayload {
                        target: target.name().to_string(),
                        declared_module_dependencies: declared_module_dependencies(target),
                        module_validation: severity_from_setting(
                            target.settings.get(settings::VALIDATE_MODULE_DEPENDENCIES),
                        ),
                        target_dependencies: cx.transitive_dependencies.clone(),
                        scan,
                    }))
                    .build(),
            );
        }
    }
}
