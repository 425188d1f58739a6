//! The declarative project model: targets, their build phases and settings,
//! and the request naming which of them to build.

use crate::canon;
use crate::settings::{self, Settings};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub name: String,
    /// Settings shared by every target, overridden by target settings.
    #[serde(default)]
    pub settings: Settings,
    pub targets: Vec<Target>,
}

impl Project {
    pub fn target(&self, name: &str) -> Option<&Target> {
        self.targets.iter().find(|t| t.name == name)
    }

    pub fn load(path: &str) -> anyhow::Result<Project> {
        let bytes = std::fs::read(path).map_err(|err| anyhow::anyhow!("read {}: {}", path, err))?;
        serde_json::from_slice(&bytes).map_err(|err| anyhow::anyhow!("parse {}: {}", path, err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProductType {
    Application,
    Framework,
    StaticLibrary,
    DynamicLibrary,
    Tool,
    /// Builds nothing itself; only orders its dependencies.
    Aggregate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub product_type: ProductType,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub phases: Vec<BuildPhase>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BuildPhase {
    Sources { files: Vec<BuildFile> },
    Frameworks { files: Vec<BuildFile> },
    Resources { files: Vec<BuildFile> },
    CopyFiles {
        destination: String,
        files: Vec<BuildFile>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileType {
    CSource,
    CppSource,
    ObjCSource,
    SwiftSource,
    Header,
    Framework,
    DynamicLibrary,
    StaticLibrary,
    TextBasedDylib,
    Resource,
    Unknown,
}

impl FileType {
    pub fn from_path(path: &str) -> FileType {
        let name = canon::file_name(path);
        let ext = match name.rfind('.') {
            Some(i) => &name[i + 1..],
            None => return FileType::Unknown,
        };
        match ext {
            "c" => FileType::CSource,
            "cc" | "cpp" | "cxx" | "mm" => FileType::CppSource,
            "m" => FileType::ObjCSource,
            "swift" => FileType::SwiftSource,
            "h" | "hh" | "hpp" => FileType::Header,
            "framework" => FileType::Framework,
            "dylib" | "so" => FileType::DynamicLibrary,
            "a" => FileType::StaticLibrary,
            "tbd" => FileType::TextBasedDylib,
            "json" | "png" | "txt" | "plist" | "strings" | "xcassets" | "storyboard" => {
                FileType::Resource
            }
            _ => FileType::Unknown,
        }
    }

    pub fn is_c_family(&self) -> bool {
        matches!(
            self,
            FileType::CSource | FileType::CppSource | FileType::ObjCSource
        )
    }

    pub fn is_linkable(&self) -> bool {
        matches!(
            self,
            FileType::Framework
                | FileType::DynamicLibrary
                | FileType::StaticLibrary
                | FileType::TextBasedDylib
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFile {
    pub path: String,
    /// Explicit type; inferred from the extension when absent.
    #[serde(default)]
    pub file_type: Option<FileType>,
}

impl BuildFile {
    pub fn file_type(&self) -> FileType {
        self.file_type
            .unwrap_or_else(|| FileType::from_path(&self.path))
    }
}

impl From<&str> for BuildFile {
    fn from(path: &str) -> Self {
        BuildFile {
            path: path.to_string(),
            file_type: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildCommand {
    #[default]
    Build,
    /// Plans only what editors need: module scans and cache configuration,
    /// no linking or copying.
    PrepareForIndexing,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildRequest {
    /// Requested targets; their dependencies are included implicitly.
    pub targets: Vec<String>,
    #[serde(default)]
    pub command: BuildCommand,
    /// Settings applied on top of every target's own.
    #[serde(default)]
    pub overrides: Settings,
    /// Where the merged dependency info report is written, if wanted.
    #[serde(default)]
    pub dependency_info_output: Option<String>,
}

/// A target with its settings resolved for one build request.
#[derive(Debug, Clone, Serialize)]
pub struct ConfiguredTarget {
    pub target: Target,
    pub settings: Settings,
}

impl ConfiguredTarget {
    pub fn new(project: &Project, target: &Target, overrides: &Settings) -> Self {
        let mut settings = project.settings.overlay(&target.settings).overlay(overrides);
        settings.set_default(settings::PRODUCT_NAME, target.name.clone());
        let module_name: String = settings
            .get_or(settings::PRODUCT_NAME, &target.name)
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        settings.set_default(settings::PRODUCT_MODULE_NAME, module_name);
        settings.set_default(settings::PROJECT_DIR, ".");
        settings.set_default(settings::CONFIGURATION, "debug");
        settings.set_default(settings::ARCHS, "arm64");
        settings.set_default(settings::CC, "clang");
        settings.set_default(settings::SWIFTC, "swiftc");
        settings.set_default(settings::LD, "ld");
        settings.set_default(settings::LIBTOOL, "libtool");

        let project_dir = settings.get_or(settings::PROJECT_DIR, ".").to_string();
        let configuration = settings.get_or(settings::CONFIGURATION, "debug").to_string();
        settings.set_default(
            settings::PROJECT_TEMP_DIR,
            canon::join(&project_dir, "build/Intermediates"),
        );
        settings.set_default(
            settings::BUILT_PRODUCTS_DIR,
            canon::join(&project_dir, format!("build/Products/{}", configuration)),
        );
        let temp_dir = canon::join(
            settings.get_or(settings::PROJECT_TEMP_DIR, "."),
            format!("{}.build", target.name),
        );
        settings.set_default(settings::TARGET_TEMP_DIR, temp_dir);

        ConfiguredTarget {
            target: target.clone(),
            settings,
        }
    }

    pub fn name(&self) -> &str {
        &self.target.name
    }

    pub fn product_name(&self) -> &str {
        self.settings.get_or(settings::PRODUCT_NAME, &self.target.name)
    }

    pub fn module_name(&self) -> &str {
        self.settings
            .get_or(settings::PRODUCT_MODULE_NAME, &self.target.name)
    }

    /// Only the first architecture is planned.
    pub fn arch(&self) -> String {
        self.settings
            .list(settings::ARCHS)
            .into_iter()
            .next()
            .unwrap_or_else(|| "arm64".to_string())
    }

    pub fn configuration(&self) -> &str {
        self.settings.get_or(settings::CONFIGURATION, "debug")
    }

    /// Identifies this target's compiler build plan, e.g. "App-arm64-debug".
    pub fn build_plan_id(&self) -> String {
        format!("{}-{}-{}", self.name(), self.arch(), self.configuration())
    }

    pub fn project_dir(&self) -> &str {
        self.settings.get_or(settings::PROJECT_DIR, ".")
    }

    pub fn temp_dir(&self) -> &str {
        self.settings.get_or(settings::TARGET_TEMP_DIR, ".")
    }

    pub fn built_products_dir(&self) -> &str {
        self.settings.get_or(settings::BUILT_PRODUCTS_DIR, ".")
    }

    /// Resolves a project-relative file reference.
    pub fn resolve(&self, path: &str) -> String {
        canon::join(self.project_dir(), path)
    }

    /// Where the object file for a source is written.
    pub fn object_path(&self, source: &str) -> String {
        let name = canon::file_name(source);
        let stem = match name.rfind('.') {
            Some(i) => &name[..i],
            None => name,
        };
        canon::join(
            self.temp_dir(),
            format!("Objects/{}/{}.o", self.arch(), stem),
        )
    }

    pub fn phases(&self) -> &[BuildPhase] {
        &self.target.phases
    }

    pub fn product_structure(&self) -> ProductStructure {
        ProductStructure::for_target(self)
    }
}

/// The on-disk layout of a target's product.  Dependents consult this to
/// find what to link against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProductStructure {
    pub target: String,
    pub product_type: ProductType,
    pub module_name: String,
    /// The bundle directory for wrapped products.
    pub wrapper: Option<String>,
    /// The linked binary or archive.
    pub binary: Option<String>,
    pub resources_dir: Option<String>,
    /// Symlinks (path, destination) that make up a versioned bundle.
    pub symlinks: Vec<(String, String)>,
}

impl ProductStructure {
    pub fn for_target(target: &ConfiguredTarget) -> ProductStructure {
        let dir = target.built_products_dir();
        let name = target.product_name();
        let product_type = target.target.product_type;
        let mut structure = ProductStructure {
            target: target.name().to_string(),
            product_type,
            module_name: target.module_name().to_string(),
            wrapper: None,
            binary: None,
            resources_dir: None,
            symlinks: Vec::new(),
        };
        match product_type {
            ProductType::Application => {
                let wrapper = canon::join(dir, format!("{}.app", name));
                structure.binary = Some(canon::join(&wrapper, name));
                structure.resources_dir = Some(canon::join(&wrapper, "Resources"));
                structure.wrapper = Some(wrapper);
            }
            ProductType::Framework => {
                let wrapper = canon::join(dir, format!("{}.framework", name));
                let version = canon::join(&wrapper, "Versions/A");
                structure.binary = Some(canon::join(&version, name));
                structure.resources_dir = Some(canon::join(&version, "Resources"));
                structure.symlinks = vec![
                    (canon::join(&wrapper, "Versions/Current"), "A".to_string()),
                    (
                        canon::join(&wrapper, name),
                        format!("Versions/Current/{}", name),
                    ),
                    (
                        canon::join(&wrapper, "Resources"),
                        "Versions/Current/Resources".to_string(),
                    ),
                ];
                structure.wrapper = Some(wrapper);
            }
            ProductType::StaticLibrary => {
                structure.binary = Some(canon::join(dir, format!("lib{}.a", name)));
            }
            ProductType::DynamicLibrary => {
                structure.binary = Some(canon::join(dir, format!("lib{}.dylib", name)));
            }
            ProductType::Tool => {
                structure.binary = Some(canon::join(dir, name));
            }
            ProductType::Aggregate => {}
        }
        structure
    }

    /// The file name a dependent uses to refer to this product when linking.
    pub fn link_name(&self) -> Option<String> {
        match self.product_type {
            ProductType::Framework => Some(format!("{}.framework", self.module_name)),
            _ => self.binary.as_deref().map(|b| canon::file_name(b).to_string()),
        }
    }
}
