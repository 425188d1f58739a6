//! Validity criteria let producers emit tasks speculatively, such as creating
//! a bundle directory or its version symlinks, and have them dropped again
//! when nothing else in the plan makes them useful.

use crate::canon;
use crate::graph::PlannedTask;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValidityCriteria {
    /// Valid if another task writes something inside the directory.
    DirectoryCreation { path: String },
    /// Valid if another task writes the symlink's destination, following
    /// other planned symlinks.
    SymlinkCreation { path: String, destination: String },
    /// Valid if another task produces the file being post-processed.
    Postprocessing { input: String },
}

/// What the rest of the plan produces, as seen by one validity check.
struct ValidityContext<'a> {
    /// Sorted (output path, index of producing task).
    outputs: Vec<(&'a str, usize)>,
    /// Planned symlinks, path to lexically resolved destination.
    links: FxHashMap<&'a str, String>,
}

impl<'a> ValidityContext<'a> {
    fn new(tasks: &'a [PlannedTask], kept: &[bool]) -> Self {
        let mut outputs = Vec::new();
        let mut links = FxHashMap::default();
        for (i, task) in tasks.iter().enumerate() {
            if !kept[i] {
                continue;
            }
            for out in task.real_outputs() {
                outputs.push((out, i));
            }
            if let Some(ValidityCriteria::SymlinkCreation { path, destination }) = &task.validity {
                links.insert(path.as_str(), resolve_link(path, destination));
            }
        }
        outputs.sort_unstable();
        ValidityContext { outputs, links }
    }

    /// Whether a task other than `me` produces `path` or something under it.
    fn produces_within(&self, path: &str, me: usize, strictly: bool) -> bool {
        let start = self.outputs.partition_point(|(p, _)| *p < path);
        self.outputs[start..]
            .iter()
            .take_while(|(p, _)| p.starts_with(path))
            .any(|&(p, owner)| {
                owner != me && canon::is_within(p, path) && !(strictly && p == path)
            })
    }

    /// Rewrites a path that goes through planned symlinks.
    fn follow_links(&self, path: &str) -> String {
        let mut path = path.to_string();
        for _ in 0..8 {
            let hit = self
                .links
                .iter()
                .find(|(link, _)| canon::is_within(&path, link));
            match hit {
                Some((link, dest)) => {
                    path = format!("{}{}", dest, &path[link.len()..]);
                }
                None => break,
            }
        }
        path
    }

    fn is_valid(&self, criteria: &ValidityCriteria, me: usize) -> bool {
        match criteria {
            ValidityCriteria::DirectoryCreation { path } => self.produces_within(path, me, true),
            ValidityCriteria::SymlinkCreation { path, destination } => {
                let target = self.follow_links(&resolve_link(path, destination));
                self.produces_within(&target, me, false)
            }
            ValidityCriteria::Postprocessing { input } => {
                let input = self.follow_links(input);
                self.outputs
                    .iter()
                    .any(|&(p, owner)| owner != me && p == input)
            }
        }
    }
}

fn resolve_link(path: &str, destination: &str) -> String {
    match canon::parent(path) {
        Some(dir) => canon::join(dir, destination),
        None => canon::canon_path(destination),
    }
}

/// Drops tasks whose validity criteria fail, repeating until stable since
/// dropping one task can invalidate another.  Returns the kept tasks in their
/// original order and the identifiers of the dropped ones.
pub fn prune_invalid(tasks: Vec<PlannedTask>) -> (Vec<PlannedTask>, Vec<String>) {
    let mut kept = vec![true; tasks.len()];
    loop {
        let cx = ValidityContext::new(&tasks, &kept);
        let invalid: Vec<usize> = tasks
            .iter()
            .enumerate()
            .filter(|(i, _)| kept[*i])
            .filter_map(|(i, task)| match &task.validity {
                Some(criteria) if !cx.is_valid(criteria, i) => Some(i),
                _ => None,
            })
            .collect();
        if invalid.is_empty() {
            break;
        }
        for i in invalid {
            kept[i] = false;
        }
    }

    let mut dropped = Vec::new();
    let kept_tasks = tasks
        .into_iter()
        .zip(kept)
        .filter_map(|(task, keep)| {
            if keep {
                Some(task)
            } else {
                dropped.push(task.identifier());
                None
            }
        })
        .collect();
    (kept_tasks, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ActionKind, NodeRef, TaskBuilder};

    fn mkdir(path: &str) -> PlannedTask {
        TaskBuilder::new(["MkDir", path])
            .output(NodeRef::path(path))
            .action(ActionKind::MakeDirectory { path: path.into() })
            .validity(ValidityCriteria::DirectoryCreation { path: path.into() })
            .build()
    }

    fn symlink(path: &str, destination: &str) -> PlannedTask {
        TaskBuilder::new(["SymLink", path])
            .output(NodeRef::path(path))
            .action(ActionKind::Symlink {
                path: path.into(),
                destination: destination.into(),
            })
            .validity(ValidityCriteria::SymlinkCreation {
                path: path.into(),
                destination: destination.into(),
            })
            .build()
    }

    fn write(path: &str) -> PlannedTask {
        TaskBuilder::new(["Write", path])
            .output(NodeRef::path(path))
            .build()
    }

    #[test]
    fn empty_directory_dropped() {
        let (kept, dropped) = prune_invalid(vec![mkdir("/out/App.app"), write("/out/other")]);
        assert_eq!(kept.len(), 1);
        assert_eq!(dropped, vec!["MkDir /out/App.app".to_string()]);
    }

    #[test]
    fn used_directory_kept() {
        let (kept, _) = prune_invalid(vec![mkdir("/out/App.app"), write("/out/App.app/App")]);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn framework_symlinks_follow_each_other() {
        let tasks = vec![
            mkdir("/f/Lib.framework"),
            symlink("/f/Lib.framework/Versions/Current", "A"),
            symlink("/f/Lib.framework/Lib", "Versions/Current/Lib"),
            write("/f/Lib.framework/Versions/A/Lib"),
        ];
        let (kept, dropped) = prune_invalid(tasks);
        assert!(dropped.is_empty(), "{:?}", dropped);
        assert_eq!(kept.len(), 4);
    }

    #[test]
    fn cascade_when_nothing_is_linked() {
        let tasks = vec![
            mkdir("/f/Lib.framework"),
            symlink("/f/Lib.framework/Versions/Current", "A"),
            symlink("/f/Lib.framework/Lib", "Versions/Current/Lib"),
        ];
        let (kept, dropped) = prune_invalid(tasks);
        assert!(kept.is_empty());
        assert_eq!(dropped.len(), 3);
    }

    #[test]
    fn postprocessing_needs_producer() {
        let touch = TaskBuilder::new(["Touch", "/out/App"])
            .input(NodeRef::path("/out/App"))
            .validity(ValidityCriteria::Postprocessing {
                input: "/out/App".into(),
            })
            .build();
        let (kept, _) = prune_invalid(vec![touch.clone()]);
        assert!(kept.is_empty());
        let (kept, _) = prune_invalid(vec![touch, write("/out/App")]);
        assert_eq!(kept.len(), 2);
    }
}
