use super::{ProducerOutput, WorkspaceContext, WorkspaceTaskProducer};
use crate::canon;
use crate::diagnostic::Diagnostic;
use crate::graph::{ActionKind, NodeRef, TaskBuilder};
use crate::project::ConfiguredTarget;
use crate::settings;
use std::collections::BTreeMap;

pub const CAS_CONFIG_FILE: &str = ".cas-config";
pub const PREFIX_MAP_FILE: &str = "compilation-prefix-map.json";

/// Writes the compilation cache configuration into the temp directory of
/// every target with caching enabled, plus a prefix map when remapping is on
/// so cache keys do not depend on where the build happens to live.
///
/// Targets may share a temp directory, in which case they must agree on the
/// file contents.
pub struct CasConfigProducer;

/// The files one target wants in its temp directory.
#[derive(Debug, PartialEq, Eq)]
struct CasFiles {
    config: Vec<u8>,
    prefix_map: Option<Vec<u8>>,
}

fn cas_config(target: &ConfiguredTarget) -> serde_json::Result<Vec<u8>> {
    let cas_path = target
        .settings
        .get(settings::COMPILATION_CACHE_CAS_PATH)
        .map(str::to_string)
        .unwrap_or_else(|| {
            canon::join(
                target.settings.get_or(settings::PROJECT_TEMP_DIR, "."),
                "CompilationCache.noindex",
            )
        });
    // BTreeMap keeps the keys sorted.
    let mut config = BTreeMap::new();
    config.insert("CASPath", cas_path);
    if let Some(plugin) = target.settings.get(settings::COMPILATION_CACHE_PLUGIN_PATH) {
        config.insert("PluginPath", plugin.to_string());
    }
    serde_json::to_vec_pretty(&config)
}

/// Maps build-specific path prefixes to stable tokens.
pub fn prefix_map(target: &ConfiguredTarget) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    let known = [
        (settings::SDKROOT, "/^sdk"),
        (settings::TOOLCHAIN_DIR, "/^toolchain"),
        (settings::PROJECT_DIR, "/^src"),
        (settings::PROJECT_TEMP_DIR, "/^derived"),
        (settings::BUILT_PRODUCTS_DIR, "/^built"),
    ];
    for (setting, token) in known {
        match target.settings.get(setting) {
            Some(path) if !path.is_empty() => {
                map.insert(canon::canon_path(path), token.to_string());
            }
            _ => {}
        }
    }
    for mapping in target.settings.list(settings::OTHER_PREFIX_MAPPINGS) {
        // Paths may contain '=' themselves; the token never does.
        if let Some((path, token)) = mapping.rsplit_once('=') {
            if !path.is_empty() && !token.is_empty() {
                map.insert(canon::canon_path(path), token.to_string());
            }
        }
    }
    map
}

fn cas_files(target: &ConfiguredTarget) -> serde_json::Result<CasFiles> {
    let prefix_map = if target.settings.bool(settings::ENABLE_PREFIX_MAPPING) {
        Some(serde_json::to_vec_pretty(&prefix_map(target))?)
    } else {
        None
    };
    Ok(CasFiles {
        config: cas_config(target)?,
        prefix_map,
    })
}

fn write_task(target: &str, path: String, contents: Vec<u8>) -> crate::graph::PlannedTask {
    TaskBuilder::new(["WriteAuxiliaryFile", path.as_str()])
        .target(target)
        .output(NodeRef::path(&path))
        .action(ActionKind::WriteFile { path, contents })
        .build()
}

impl WorkspaceTaskProducer for CasConfigProducer {
    fn name(&self) -> &'static str {
        "cas-config"
    }

    fn produce(&self, cx: &WorkspaceContext, out: &mut ProducerOutput) {
        // Temp directory -> (first target, its files).
        let mut by_dir: BTreeMap<&str, (&ConfiguredTarget, CasFiles)> = BTreeMap::new();
        for target in cx.targets {
            if !target.settings.bool(settings::ENABLE_COMPILE_CACHE) {
                continue;
            }
            let files = match cas_files(target) {
                Ok(files) => files,
                Err(err) => {
                    out.diagnose(
                        Diagnostic::error(format!("encoding compilation cache config: {}", err))
                            .for_target(target.name()),
                    );
                    continue;
                }
            };
            match by_dir.get(target.temp_dir()) {
                Some((first, existing)) => {
                    if *existing != files {
                        out.diagnose(
                            Diagnostic::error(format!(
                                "targets '{}' and '{}' share '{}' but have different compilation cache settings",
                                first.name(),
                                target.name(),
                                target.temp_dir()
                            ))
                            .for_target(target.name()),
                        );
                    }
                }
                None => {
                    by_dir.insert(target.temp_dir(), (target, files));
                }
            }
        }

        for (dir, (target, files)) in by_dir {
            out.push(write_task(
                target.name(),
                canon::join(dir, CAS_CONFIG_FILE),
                files.config,
            ));
            if let Some(prefix_map) = files.prefix_map {
                out.push(write_task(
                    target.name(),
                    canon::join(dir, PREFIX_MAP_FILE),
                    prefix_map,
                ));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{BuildRequest, Project};
    use crate::settings::Settings;

    fn configure(project: &Project) -> Vec<ConfiguredTarget> {
        project
            .targets
            .iter()
            .map(|t| ConfiguredTarget::new(project, t, &Settings::new()))
            .collect()
    }

    fn produce(project: &Project) -> ProducerOutput {
        let targets = configure(project);
        let request = BuildRequest::default();
        let cx = WorkspaceContext {
            project,
            request: &request,
            targets: &targets,
        };
        let mut out = ProducerOutput::default();
        CasConfigProducer.produce(&cx, &mut out);
        out
    }

    fn contents(out: &ProducerOutput, i: usize) -> serde_json::Value {
        match &out.tasks[i].action {
            ActionKind::WriteFile { contents, .. } => serde_json::from_slice(contents).unwrap(),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn config_and_prefix_map() {
        let project: Project = serde_json::from_str(
            r#"{
                "name": "P",
                "settings": {"PROJECT_DIR": "/src/p", "ENABLE_COMPILE_CACHE": "YES",
                             "ENABLE_PREFIX_MAPPING": "YES", "SDKROOT": "/sdks/mac.sdk",
                             "COMPILATION_CACHE_CAS_PATH": "/cas",
                             "OTHER_PREFIX_MAPPINGS": "/opt/a=b=/^ab"},
                "targets": [{"name": "App", "product_type": "tool"}]
            }"#,
        )
        .unwrap();
        let out = produce(&project);
        assert!(out.diagnostics.is_empty());
        assert_eq!(
            out.tasks[0].identifier(),
            "WriteAuxiliaryFile /src/p/build/Intermediates/App.build/.cas-config"
        );
        assert_eq!(contents(&out, 0), serde_json::json!({"CASPath": "/cas"}));
        assert_eq!(
            contents(&out, 1),
            serde_json::json!({
                "/sdks/mac.sdk": "/^sdk",
                "/src/p": "/^src",
                "/src/p/build/Intermediates": "/^derived",
                "/src/p/build/Products/debug": "/^built",
                "/opt/a=b": "/^ab",
            })
        );
    }

    #[test]
    fn shared_dir_must_agree() {
        let project: Project = serde_json::from_str(
            r#"{
                "name": "P",
                "settings": {"PROJECT_DIR": "/p", "ENABLE_COMPILE_CACHE": "YES",
                             "TARGET_TEMP_DIR": "/p/shared"},
                "targets": [
                    {"name": "A", "product_type": "tool"},
                    {"name": "B", "product_type": "tool",
                     "settings": {"COMPILATION_CACHE_CAS_PATH": "/elsewhere"}}
                ]
            }"#,
        )
        .unwrap();
        let out = produce(&project);
        assert_eq!(out.tasks.len(), 1);
        assert_eq!(out.diagnostics.len(), 1);
        assert!(out.diagnostics[0].message.contains("'A' and 'B' share '/p/shared'"));
    }

    #[test]
    fn disabled_by_default() {
        let project: Project = serde_json::from_str(
            r#"{"name": "P", "targets": [{"name": "App", "product_type": "tool"}]}"#,
        )
        .unwrap();
        assert!(produce(&project).tasks.is_empty());
    }
}
