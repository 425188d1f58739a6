//! Dependency verification: checks the libraries and frameworks a linker
//! actually used, as reported in its trace file, against what the target
//! declared.

use crate::canon;
use crate::diagnostic::{Diagnostic, Severity};
use crate::error::VerifyError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Environment variable naming the file the linker writes its trace to.
pub const TRACE_FILE_ENV: &str = "LD_TRACE_FILE";

/// The linker's record of every file it loaded, by category.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkerTrace {
    #[serde(default)]
    pub dynamic: Vec<String>,
    #[serde(default)]
    pub weak: Vec<String>,
    #[serde(default, rename = "re-exports")]
    pub reexports: Vec<String>,
    #[serde(default, rename = "upward-dynamic")]
    pub upward_dynamic: Vec<String>,
    #[serde(default, rename = "delay-init")]
    pub delay_init: Vec<String>,
    #[serde(default)]
    pub archives: Vec<String>,
}

impl LinkerTrace {
    pub fn parse(path: &str, bytes: &[u8]) -> Result<LinkerTrace, VerifyError> {
        serde_json::from_slice(bytes).map_err(|source| VerifyError::Parse {
            path: path.to_string(),
            source,
        })
    }

    pub fn read(path: &str) -> Result<LinkerTrace, VerifyError> {
        let bytes = std::fs::read(path).map_err(|source| VerifyError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(path, &bytes)
    }

    /// Every file in the trace, each once.
    pub fn all_paths(&self) -> BTreeSet<&str> {
        [
            &self.dynamic,
            &self.weak,
            &self.reexports,
            &self.upward_dynamic,
            &self.delay_init,
            &self.archives,
        ]
        .into_iter()
        .flatten()
        .map(|s| s.as_str())
        .collect()
    }

    /// Folds another trace into this one, as when a build links several
    /// times under one outer trace file.
    pub fn merge(&mut self, other: LinkerTrace) {
        self.dynamic.extend(other.dynamic);
        self.weak.extend(other.weak);
        self.reexports.extend(other.reexports);
        self.upward_dynamic.extend(other.upward_dynamic);
        self.delay_init.extend(other.delay_init);
        self.archives.extend(other.archives);
    }
}

/// The name a dependency is declared under, derived from a path or file
/// name: "Foo" for Foo.framework, libFoo.dylib, libFoo.tbd and libFoo.a.
pub fn dependency_name(path: &str) -> Option<String> {
    for component in path.split('/') {
        if let Some(name) = component.strip_suffix(".framework") {
            if !name.is_empty() {
                return Some(name.to_string());
            }
        }
    }
    let file = canon::file_name(path);
    for ext in [".dylib", ".tbd", ".a", ".so"] {
        if let Some(stem) = file.strip_suffix(ext) {
            let stem = stem.strip_prefix("lib").unwrap_or(stem);
            if !stem.is_empty() {
                return Some(stem.to_string());
            }
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// File name as it appeared in the trace, e.g. "libBar.dylib".
    pub file: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub violations: Vec<Violation>,
    /// Trace entries we could not map to a dependency name.
    pub unmapped: Vec<String>,
}

impl VerificationReport {
    pub fn diagnostics(&self, target: &str, severity: Severity) -> Vec<Diagnostic> {
        let mut diags: Vec<Diagnostic> = self
            .unmapped
            .iter()
            .map(|path| {
                Diagnostic::warning(format!("Unable to map {:?} to a dependency name", path))
                    .for_target(target)
            })
            .collect();
        diags.extend(self.violations.iter().map(|v| {
            Diagnostic::new(
                severity,
                format!("Undeclared dependency: {} (linked from {})", v.file, v.path),
            )
            .for_target(target)
        }));
        diags
    }
}

pub struct DependencyVerifier {
    inherent: BTreeSet<String>,
}

impl DependencyVerifier {
    /// `inherent` lists libraries that are always linked and are excluded
    /// from verification, by file name or bare name.
    pub fn new<S: AsRef<str>>(inherent: &[S]) -> Self {
        DependencyVerifier {
            inherent: inherent
                .iter()
                .map(|s| normalize(s.as_ref()))
                .collect(),
        }
    }

    /// Reports every traced file not covered by `declared`.
    pub fn verify<S: AsRef<str>>(&self, declared: &[S], trace: &LinkerTrace) -> VerificationReport {
        let declared: BTreeSet<String> = declared.iter().map(|s| normalize(s.as_ref())).collect();
        let mut report = VerificationReport::default();
        for path in trace.all_paths() {
            let Some(name) = dependency_name(path) else {
                report.unmapped.push(path.to_string());
                continue;
            };
            if self.inherent.contains(&name) || declared.contains(&name) {
                continue;
            }
            report.violations.push(Violation {
                file: canon::file_name(path).to_string(),
                path: path.to_string(),
            });
        }
        report
    }
}

/// Declared names may be a bare stem or a file name.
fn normalize(name: &str) -> String {
    dependency_name(name).unwrap_or_else(|| name.to_string())
}

/// Mode from a YES / YES_ERROR / NO style setting.
pub fn severity_from_setting(value: Option<&str>) -> Option<Severity> {
    match value {
        Some("YES") | Some("YES_WARNING") => Some(Severity::Warning),
        Some("YES_ERROR") => Some(Severity::Error),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> DependencyVerifier {
        DependencyVerifier::new(crate::config::DEFAULT_INHERENT_DEPENDENCIES)
    }

    #[test]
    fn names() {
        assert_eq!(dependency_name("/L/Foo.framework/Foo").as_deref(), Some("Foo"));
        assert_eq!(dependency_name("/usr/lib/libFoo.dylib").as_deref(), Some("Foo"));
        assert_eq!(dependency_name("libBar.a").as_deref(), Some("Bar"));
        assert_eq!(dependency_name("/usr/lib/libSystem.B.tbd").as_deref(), Some("System.B"));
        assert_eq!(dependency_name("/tmp/main.o"), None);
    }

    #[test]
    fn one_undeclared_library() {
        let trace = LinkerTrace::parse(
            "trace.json",
            br#"{"dynamic": ["/usr/lib/libFoo.dylib", "/usr/lib/libBar.dylib",
                             "/usr/lib/libSystem.B.dylib", "/usr/lib/libobjc.A.dylib"]}"#,
        )
        .unwrap();
        let report = verifier().verify(&["libFoo.dylib"], &trace);
        assert_eq!(
            report.violations,
            vec![Violation {
                file: "libBar.dylib".into(),
                path: "/usr/lib/libBar.dylib".into()
            }]
        );
        assert!(report.unmapped.is_empty());
        let diags = report.diagnostics("App", Severity::Error);
        assert_eq!(diags.len(), 1);
        assert!(diags[0].is_error());
    }

    #[test]
    fn every_category_counts() {
        let trace: LinkerTrace = serde_json::from_str(
            r#"{"weak": ["/F/A.framework/A"], "re-exports": ["libB.dylib"],
                "upward-dynamic": ["libC.dylib"], "delay-init": ["libD.dylib"],
                "archives": ["/x/libE.a"]}"#,
        )
        .unwrap();
        let report = verifier().verify(&["A", "libB.dylib"], &trace);
        let mut files: Vec<_> = report.violations.iter().map(|v| v.file.as_str()).collect();
        files.sort();
        assert_eq!(files, vec!["libC.dylib", "libD.dylib", "libE.a"]);
    }

    #[test]
    fn unmapped_is_a_warning() {
        let trace = LinkerTrace {
            archives: vec!["/x/objects.o".into()],
            ..Default::default()
        };
        let report = verifier().verify::<&str>(&[], &trace);
        assert!(report.violations.is_empty());
        let diags = report.diagnostics("App", Severity::Error);
        assert_eq!(diags[0].severity, Severity::Warning);
    }

    #[test]
    fn settings() {
        assert_eq!(severity_from_setting(Some("YES_ERROR")), Some(Severity::Error));
        assert_eq!(severity_from_setting(Some("NO")), None);
    }
}
