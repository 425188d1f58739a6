use super::{create_parent_dirs, CommandResult, PerformContext, TaskAction, TaskOutcome};
use crate::graph::{Command, PlannedTask};

/// Spawns the task's command.
pub struct ProcessAction {
    command: Command,
    outputs: Vec<String>,
}

impl ProcessAction {
    pub fn new(task: &PlannedTask) -> Self {
        ProcessAction {
            command: task.command.clone(),
            outputs: task.real_outputs().map(str::to_string).collect(),
        }
    }
}

/// Runs a command and converts the result, treating failure to spawn as a
/// task failure.
pub(super) fn run_command(command: &Command, cx: &PerformContext) -> TaskOutcome {
    match cx.spawner.spawn(command, cx.cancel) {
        Ok(out) => {
            let result = CommandResult::from(out.termination);
            TaskOutcome {
                result,
                output: out.output,
                diagnostics: Vec::new(),
                did_work: true,
                cache_hit: false,
            }
        }
        Err(err) => TaskOutcome::failed(err.to_string()),
    }
}

impl TaskAction for ProcessAction {
    fn perform(self: Box<Self>, cx: &PerformContext) -> TaskOutcome {
        if let Err(err) = create_parent_dirs(self.outputs.iter().map(String::as_str)) {
            return TaskOutcome::failed(format!("creating output directories: {}", err));
        }
        run_command(&self.command, cx)
    }
}
