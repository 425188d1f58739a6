//! Spawning the commands of planned tasks.

use crate::cancel::CancellationToken;
use crate::graph::Command;
use std::io::Write;
use std::os::unix::process::ExitStatusExt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Success,
    Interrupted,
    Failure,
}

#[derive(Debug)]
pub struct ProcessOutput {
    pub termination: Termination,
    /// stdout followed by stderr.
    pub output: Vec<u8>,
}

/// Runs commands.  Indirected as a trait so tests can observe what would run
/// and fake the effects.
pub trait Spawner: Send + Sync {
    /// Returns an Err() if we failed outside of the process itself.
    fn spawn(&self, command: &Command, cancel: &CancellationToken) -> anyhow::Result<ProcessOutput>;
}

#[derive(Default)]
pub struct SystemSpawner {}

impl Spawner for SystemSpawner {
    fn spawn(&self, command: &Command, cancel: &CancellationToken) -> anyhow::Result<ProcessOutput> {
        if cancel.is_cancelled() {
            return Ok(ProcessOutput {
                termination: Termination::Interrupted,
                output: b"interrupted".to_vec(),
            });
        }
        let (program, args) = match command.args.split_first() {
            Some(split) => split,
            None => anyhow::bail!("empty command"),
        };
        let mut cmd = std::process::Command::new(program);
        cmd.args(args);
        for (k, v) in &command.env {
            cmd.env(k, v);
        }
        if let Some(cwd) = &command.cwd {
            cmd.current_dir(cwd);
        }
        let out = cmd
            .output()
            .map_err(|err| anyhow::anyhow!("spawn {}: {}", program, err))?;

        let mut output = out.stdout;
        output.extend_from_slice(&out.stderr);
        let mut termination = Termination::Success;
        if !out.status.success() {
            termination = Termination::Failure;
            if let Some(sig) = out.status.signal() {
                match sig {
                    libc::SIGINT => {
                        write!(output, "interrupted")?;
                        termination = Termination::Interrupted;
                    }
                    _ => write!(output, "signal {}", sig)?,
                }
            }
        }
        Ok(ProcessOutput {
            termination,
            output,
        })
    }
}
