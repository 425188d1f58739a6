//! Dependency info: a JSON report of what every target in a build links
//! against and produces.  Each target writes its own dump while planning,
//! and one task merges the dumps into the build-wide report.

use crate::module_graph::{AccessLevel, ModuleImport};
use crate::project::{BuildPhase, ConfiguredTarget, FileType};
use crate::settings;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildDependencyInfo {
    pub targets: Vec<TargetDependencyInfo>,
    #[serde(default)]
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetDependencyInfo {
    pub target_name: String,
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub platform_name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<Input>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output_paths: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<Dependency>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Input {
    pub input_type: InputType,
    pub name: NameType,
    pub link_type: LinkType,
    pub library_type: LibraryType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum InputType {
    Framework,
    Library,
}

/// What is known of an input's name.  Search-path linkage often gives only
/// the file name, and `-l` flags only the stem.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NameType {
    #[serde(rename = "path")]
    AbsolutePath(String),
    #[serde(rename = "name")]
    Name(String),
    #[serde(rename = "stem")]
    Stem(String),
}

impl NameType {
    pub fn as_str(&self) -> &str {
        match self {
            NameType::AbsolutePath(s) | NameType::Name(s) | NameType::Stem(s) => s,
        }
    }

    /// Inputs are ordered by file name regardless of which form they have.
    pub fn sortable_name(&self) -> &str {
        match self {
            NameType::AbsolutePath(p) => crate::canon::file_name(p),
            NameType::Name(s) | NameType::Stem(s) => s,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LinkType {
    AbsolutePath,
    SearchPath,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum LibraryType {
    Dynamic,
    Static,
    Upward,
    Unknown,
}

/// Includes order before imports, then by name and access level.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Dependency {
    Include {
        path: String,
    },
    Import {
        name: String,
        #[serde(rename = "accessLevel")]
        access_level: AccessLevel,
        optional: bool,
    },
}

impl Dependency {
    /// Textual includes are recorded by path; module imports by name, with
    /// the access level they are visible at.
    pub fn from_import(import: &ModuleImport) -> Dependency {
        if import.textual {
            Dependency::Include {
                path: import.name.clone(),
            }
        } else {
            Dependency::Import {
                name: import.name.clone(),
                access_level: import.effective_access(),
                optional: false,
            }
        }
    }
}

impl TargetDependencyInfo {
    /// Adds discovered imports, skipping the target's own module and any
    /// already listed.
    pub fn add_imports<'a>(
        &mut self,
        own_module: &str,
        imports: impl IntoIterator<Item = &'a ModuleImport>,
    ) {
        for import in imports {
            if import.name == own_module && !import.textual {
                continue;
            }
            let dependency = Dependency::from_import(import);
            if !self.dependencies.contains(&dependency) {
                self.dependencies.push(dependency);
            }
        }
        self.dependencies.sort();
    }

    /// Sorts every list so the encoding is stable.
    pub fn normalize(&mut self) {
        self.inputs
            .sort_by(|a, b| a.name.sortable_name().cmp(b.name.sortable_name()));
        self.output_paths.sort();
        self.dependencies.sort();
    }

    fn identity(&self) -> (&str, Option<&str>, Option<&str>) {
        (
            &self.target_name,
            self.project_name.as_deref(),
            self.platform_name.as_deref(),
        )
    }

    /// The dump for one configured target, from its linked frameworks and
    /// libraries and its linker flags.
    pub fn for_target(project_name: &str, target: &ConfiguredTarget) -> TargetDependencyInfo {
        let mut inputs = Vec::new();
        for phase in target.phases() {
            let BuildPhase::Frameworks { files } = phase else {
                continue;
            };
            for file in files {
                let file_type = file.file_type();
                let (input_type, library_type) = match file_type {
                    FileType::Framework => (InputType::Framework, LibraryType::Dynamic),
                    FileType::DynamicLibrary | FileType::TextBasedDylib => {
                        (InputType::Library, LibraryType::Dynamic)
                    }
                    FileType::StaticLibrary => (InputType::Library, LibraryType::Static),
                    _ => continue,
                };
                let (name, link_type) = if file.path.starts_with('/') {
                    (NameType::AbsolutePath(file.path.clone()), LinkType::AbsolutePath)
                } else {
                    (
                        NameType::Name(crate::canon::file_name(&file.path).to_string()),
                        LinkType::SearchPath,
                    )
                };
                inputs.push(Input {
                    input_type,
                    name,
                    link_type,
                    library_type,
                });
            }
        }
        inputs.extend(inputs_from_linker_flags(
            &target.settings.list(settings::OTHER_LDFLAGS),
        ));

        let structure = target.product_structure();
        let output_paths = structure
            .wrapper
            .or(structure.binary)
            .into_iter()
            .collect();

        let mut info = TargetDependencyInfo {
            target_name: target.name().to_string(),
            project_name: Some(project_name.to_string()),
            platform_name: target.settings.get(settings::PLATFORM_NAME).map(str::to_string),
            inputs,
            output_paths,
            dependencies: Vec::new(),
        };
        info.normalize();
        info
    }
}

/// Linked inputs named by `-l`, `-framework` and their upward variants.
pub fn inputs_from_linker_flags(flags: &[String]) -> Vec<Input> {
    let mut inputs = Vec::new();
    let mut iter = flags.iter();
    while let Some(flag) = iter.next() {
        let (input_type, library_type, stem) = match flag.as_str() {
            "-framework" => (InputType::Framework, LibraryType::Dynamic, iter.next()),
            "-upward_framework" => (InputType::Framework, LibraryType::Upward, iter.next()),
            "-l" => (InputType::Library, LibraryType::Unknown, iter.next()),
            "-upward-l" => (InputType::Library, LibraryType::Upward, iter.next()),
            f => {
                if let Some(stem) = f.strip_prefix("-upward-l") {
                    push_stem(&mut inputs, InputType::Library, LibraryType::Upward, stem);
                } else if let Some(stem) = f.strip_prefix("-l") {
                    push_stem(&mut inputs, InputType::Library, LibraryType::Unknown, stem);
                }
                continue;
            }
        };
        if let Some(stem) = stem {
            push_stem(&mut inputs, input_type, library_type, stem);
        }
    }
    inputs
}

fn push_stem(inputs: &mut Vec<Input>, input_type: InputType, library_type: LibraryType, stem: &str) {
    if stem.is_empty() {
        return;
    }
    inputs.push(Input {
        input_type,
        name: NameType::Stem(stem.to_string()),
        link_type: LinkType::SearchPath,
        library_type,
    });
}

impl BuildDependencyInfo {
    /// Combines per-target dumps.  A target appearing twice with the same
    /// identity is reported as an error and only the first is kept.
    pub fn merge(dumps: Vec<TargetDependencyInfo>) -> BuildDependencyInfo {
        let mut seen = BTreeSet::new();
        let mut info = BuildDependencyInfo::default();
        for mut dump in dumps {
            let identity = dump.identity();
            let key = (
                identity.0.to_string(),
                identity.1.map(str::to_string),
                identity.2.map(str::to_string),
            );
            if !seen.insert(key) {
                info.errors.push(format!(
                    "Found multiple identical targets named '{}' in project '{}' for platform '{}'",
                    dump.target_name,
                    dump.project_name.as_deref().unwrap_or("nil"),
                    dump.platform_name.as_deref().unwrap_or("nil"),
                ));
                continue;
            }
            dump.normalize();
            info.targets.push(dump);
        }
        info.targets.sort_by(|a, b| a.identity().cmp(&b.identity()));
        info
    }

    pub fn to_json(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    pub fn from_json(bytes: &[u8]) -> serde_json::Result<BuildDependencyInfo> {
        serde_json::from_slice(bytes)
    }
}

/// Reads per-target dumps and writes the merged report.
pub fn merge_files<S: AsRef<str>>(inputs: &[S], output: &str) -> anyhow::Result<BuildDependencyInfo> {
    let mut dumps = Vec::new();
    for input in inputs {
        let input = input.as_ref();
        let bytes = std::fs::read(input).map_err(|err| anyhow::anyhow!("read {}: {}", input, err))?;
        let dump: TargetDependencyInfo = serde_json::from_slice(&bytes)
            .map_err(|err| anyhow::anyhow!("parse {}: {}", input, err))?;
        dumps.push(dump);
    }
    let info = BuildDependencyInfo::merge(dumps);
    crate::fs::write_atomic(std::path::Path::new(output), &info.to_json()?)
        .map_err(|err| anyhow::anyhow!("write {}: {}", output, err))?;
    Ok(info)
}
