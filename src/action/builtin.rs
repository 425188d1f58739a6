//! Tasks carried out in-process rather than by spawning a command.

use super::{create_parent_dirs, PerformContext, TaskAction, TaskOutcome};
use crate::depinfo;
use crate::diagnostic::Diagnostic;
use crate::graph::{ActionKind, Payload, PlannedTask};
use std::path::Path;
use std::time::SystemTime;

pub struct BuiltinAction {
    identifier: String,
    action: ActionKind,
    payload: Option<Payload>,
}

impl BuiltinAction {
    pub fn new(task: &PlannedTask) -> Self {
        BuiltinAction {
            identifier: task.identifier(),
            action: task.action.clone(),
            payload: task.payload.clone(),
        }
    }

    fn run(&self) -> anyhow::Result<TaskOutcome> {
        Ok(match &self.action {
            ActionKind::Gate => TaskOutcome::succeeded(false),
            ActionKind::WriteFile { path, contents } => {
                if std::fs::read(path).ok().as_deref() == Some(contents.as_slice()) {
                    return Ok(TaskOutcome::succeeded(false));
                }
                crate::fs::write_atomic(Path::new(path), contents)
                    .map_err(|err| anyhow::anyhow!("write {}: {}", path, err))?;
                TaskOutcome::succeeded(true)
            }
            ActionKind::MakeDirectory { path } => {
                if Path::new(path).is_dir() {
                    return Ok(TaskOutcome::succeeded(false));
                }
                std::fs::create_dir_all(path)
                    .map_err(|err| anyhow::anyhow!("mkdir {}: {}", path, err))?;
                TaskOutcome::succeeded(true)
            }
            ActionKind::Symlink { path, destination } => {
                if let Ok(existing) = std::fs::read_link(path) {
                    if existing == Path::new(destination) {
                        return Ok(TaskOutcome::succeeded(false));
                    }
                    std::fs::remove_file(path)?;
                }
                create_parent_dirs(std::iter::once(path.as_str()))?;
                std::os::unix::fs::symlink(destination, path)
                    .map_err(|err| anyhow::anyhow!("symlink {} -> {}: {}", path, destination, err))?;
                TaskOutcome::succeeded(true)
            }
            ActionKind::Copy { from, to } => {
                create_parent_dirs(std::iter::once(to.as_str()))?;
                copy_recursive(Path::new(from), Path::new(to))
                    .map_err(|err| anyhow::anyhow!("copy {} to {}: {}", from, to, err))?;
                TaskOutcome::succeeded(true)
            }
            ActionKind::Touch { path } => {
                let file = std::fs::File::open(path)
                    .map_err(|err| anyhow::anyhow!("touch {}: {}", path, err))?;
                file.set_modified(SystemTime::now())?;
                TaskOutcome::succeeded(true)
            }
            ActionKind::MergeDependencyInfo => {
                let Some(Payload::DependencyInfo(payload)) = &self.payload else {
                    anyhow::bail!("{} has no dependency info payload", self.identifier);
                };
                let info = depinfo::merge_files(&payload.inputs, &payload.output)?;
                let warnings = info.errors.into_iter().map(Diagnostic::warning).collect();
                TaskOutcome::succeeded(true).with_diagnostics(warnings)
            }
            ActionKind::Process
            | ActionKind::Link
            | ActionKind::ClangCompile
            | ActionKind::SwiftDriver
            | ActionKind::DumpDependencies => {
                anyhow::bail!("{} is not a builtin task", self.identifier)
            }
        })
    }
}

fn copy_recursive(from: &Path, to: &Path) -> std::io::Result<()> {
    if from.is_dir() {
        std::fs::create_dir_all(to)?;
        for entry in std::fs::read_dir(from)? {
            let entry = entry?;
            copy_recursive(&entry.path(), &to.join(entry.file_name()))?;
        }
        Ok(())
    } else {
        std::fs::copy(from, to).map(|_| ())
    }
}

impl TaskAction for BuiltinAction {
    fn perform(self: Box<Self>, cx: &PerformContext) -> TaskOutcome {
        if cx.cancel.is_cancelled() {
            return TaskOutcome::cancelled();
        }
        match self.run() {
            Ok(outcome) => outcome,
            Err(err) => TaskOutcome::failed(err.to_string()),
        }
    }
}

/// Stands in for a task whose action needs a payload it does not carry.
pub struct MisconfiguredAction(pub String);

impl TaskAction for MisconfiguredAction {
    fn perform(self: Box<Self>, _cx: &PerformContext) -> TaskOutcome {
        TaskOutcome::failed(format!("task {} is missing its payload", self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::TaskBuilder;

    fn run(action: ActionKind) -> TaskOutcome {
        let task = TaskBuilder::new(["Test"]).action(action).build();
        BuiltinAction::new(&task).run().unwrap()
    }

    #[test]
    fn write_is_idempotent() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sub/out.txt").to_string_lossy().into_owned();
        let write = || ActionKind::WriteFile {
            path: path.clone(),
            contents: b"hello".to_vec(),
        };
        assert!(run(write()).did_work);
        assert!(!run(write()).did_work);
        assert_eq!(std::fs::read_to_string(&path)?, "hello");
        Ok(())
    }

    #[test]
    fn symlink_and_copy() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let root = dir.path().to_string_lossy().into_owned();
        std::fs::write(dir.path().join("a"), "a")?;
        let link = format!("{}/Current", root);
        let symlink = || ActionKind::Symlink {
            path: link.clone(),
            destination: "a".into(),
        };
        assert!(run(symlink()).did_work);
        assert!(!run(symlink()).did_work);
        assert_eq!(std::fs::read_to_string(&link)?, "a");

        run(ActionKind::Copy {
            from: format!("{}/a", root),
            to: format!("{}/res/a", root),
        });
        assert_eq!(std::fs::read_to_string(dir.path().join("res/a"))?, "a");
        Ok(())
    }
}
