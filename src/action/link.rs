use super::process::run_command;
use super::{create_parent_dirs, CommandResult, PerformContext, TaskAction, TaskOutcome};
use crate::diagnostic::{has_errors, Diagnostic};
use crate::graph::{Command, LinkPayload, PlannedTask};
use crate::verify::{LinkerTrace, TRACE_FILE_ENV};
use std::path::Path;

/// Runs the linker with tracing enabled, then checks what it loaded against
/// the target's declared dependencies.
pub struct LinkAction {
    command: Command,
    outputs: Vec<String>,
    payload: LinkPayload,
}

impl LinkAction {
    pub fn new(task: &PlannedTask, payload: LinkPayload) -> Self {
        LinkAction {
            command: task.command.clone(),
            outputs: task.real_outputs().map(str::to_string).collect(),
            payload,
        }
    }

    /// A trace file named by the environment that our trace is appended to.
    fn outer_trace(&self) -> Option<String> {
        self.command
            .env_var(TRACE_FILE_ENV)
            .map(str::to_string)
            .or_else(|| std::env::var(TRACE_FILE_ENV).ok())
            .filter(|outer| *outer != self.payload.trace_path)
    }
}

fn append_trace(outer: &str, trace: &LinkerTrace) -> anyhow::Result<()> {
    let mut merged = match std::fs::read(outer) {
        Ok(bytes) => LinkerTrace::parse(outer, &bytes)?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => LinkerTrace::default(),
        Err(err) => anyhow::bail!("read {}: {}", outer, err),
    };
    merged.merge(trace.clone());
    crate::fs::write_atomic(Path::new(outer), &serde_json::to_vec(&merged)?)?;
    Ok(())
}

impl TaskAction for LinkAction {
    fn perform(self: Box<Self>, cx: &PerformContext) -> TaskOutcome {
        if let Err(err) = create_parent_dirs(
            self.outputs
                .iter()
                .map(String::as_str)
                .chain(std::iter::once(self.payload.trace_path.as_str())),
        ) {
            return TaskOutcome::failed(format!("creating output directories: {}", err));
        }
        let outer = self.outer_trace();
        let tracing_wanted = self.payload.verification.is_some() || outer.is_some();
        let mut command = self.command.clone();
        if tracing_wanted {
            let _ = std::fs::remove_file(&self.payload.trace_path);
            command = command.env(TRACE_FILE_ENV, self.payload.trace_path.clone());
        }

        let mut outcome = run_command(&command, cx);
        if outcome.result != CommandResult::Succeeded || !tracing_wanted {
            return outcome;
        }

        let trace = match LinkerTrace::read(&self.payload.trace_path) {
            Ok(trace) => trace,
            Err(err) => {
                outcome.diagnostics.push(
                    Diagnostic::warning(format!("dependency verification skipped: {}", err))
                        .for_target(self.payload.target.clone()),
                );
                return outcome;
            }
        };
        if let Some(severity) = self.payload.verification {
            let report = cx.verifier.verify(&self.payload.declared_dependencies, &trace);
            outcome
                .diagnostics
                .extend(report.diagnostics(&self.payload.target, severity));
            if has_errors(&outcome.diagnostics) {
                outcome.result = CommandResult::Failed;
            }
        }
        if let Some(outer) = outer {
            if let Err(err) = append_trace(&outer, &trace) {
                tracing::warn!("appending to linker trace {}: {}", outer, err);
            }
        }
        outcome
    }
}
