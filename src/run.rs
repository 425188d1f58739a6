use anyhow::anyhow;
use argh::FromArgs;
use std::path::Path;
use std::sync::Arc;

use crate::cancel::CancellationToken;
use crate::config::EngineConfig;
use crate::depinfo;
use crate::diagnostic::Severity;
use crate::engine::Engine;
use crate::fs::RealFileSystem;
use crate::module_graph::ProcessScanner;
use crate::process::SystemSpawner;
use crate::producer::ProducerRegistry;
use crate::project::{BuildRequest, Project};
use crate::verify::{DependencyVerifier, LinkerTrace};

/// Plans and runs builds of a declarative project.
#[derive(FromArgs)]
struct Args {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// engine configuration file (JSON)
    #[argh(option)]
    config: Option<String>,

    /// parallelism [default from system]
    #[argh(option, short = 'j')]
    jobs: Option<usize>,

    /// keep going after failures
    #[argh(switch, short = 'k')]
    keep_going: bool,

    #[argh(subcommand)]
    command: Subcommand,
}

#[derive(FromArgs)]
#[argh(subcommand)]
enum Subcommand {
    Build(BuildArgs),
    Describe(DescribeArgs),
    VerifyTrace(VerifyTraceArgs),
    MergeDependencyInfo(MergeArgs),
}

/// Build targets of a project, with their dependencies.
#[derive(FromArgs)]
#[argh(subcommand, name = "build")]
struct BuildArgs {
    /// project file (JSON)
    #[argh(positional)]
    project: String,

    /// targets to build [default: all]
    #[argh(positional)]
    targets: Vec<String>,

    /// write the merged dependency info report here
    #[argh(option)]
    dependency_info: Option<String>,

    /// only plan what indexing needs
    #[argh(switch)]
    index: bool,
}

/// Print the planned tasks of a project with their signatures.
#[derive(FromArgs)]
#[argh(subcommand, name = "describe")]
struct DescribeArgs {
    /// project file (JSON)
    #[argh(positional)]
    project: String,

    /// targets to plan [default: all]
    #[argh(positional)]
    targets: Vec<String>,
}

/// Check a linker trace against declared dependencies.
#[derive(FromArgs)]
#[argh(subcommand, name = "verify-trace")]
struct VerifyTraceArgs {
    /// linker trace (JSON)
    #[argh(option)]
    trace: String,

    /// declared dependency names
    #[argh(option)]
    declared: Vec<String>,

    /// target name used in diagnostics
    #[argh(option, default = "String::from(\"trace\")")]
    target: String,
}

/// Merge per-target dependency info dumps into one report.
#[derive(FromArgs)]
#[argh(subcommand, name = "merge-dependency-info")]
struct MergeArgs {
    /// output report
    #[argh(option, short = 'o')]
    output: String,

    /// per-target dumps
    #[argh(positional)]
    inputs: Vec<String>,
}

fn request_for(project: &Project, targets: Vec<String>) -> BuildRequest {
    let targets = if targets.is_empty() {
        project.targets.iter().map(|t| t.name.clone()).collect()
    } else {
        targets
    };
    BuildRequest {
        targets,
        ..Default::default()
    }
}

fn engine(config: EngineConfig) -> anyhow::Result<Engine> {
    let scanner = Arc::new(ProcessScanner::new(config.scanner.clone()));
    Engine::new(config, scanner, ProducerRegistry::standard())
}

fn build(config: EngineConfig, args: BuildArgs) -> anyhow::Result<i32> {
    let project = Project::load(&args.project)?;
    let mut request = request_for(&project, args.targets);
    request.dependency_info_output = args.dependency_info;
    if args.index {
        request.command = crate::project::BuildCommand::PrepareForIndexing;
    }

    let mut engine = engine(config)?;
    let cancel = CancellationToken::with_sigint();
    let summary = engine.build(
        &project,
        &request,
        &SystemSpawner::default(),
        &RealFileSystem::new(),
        &cancel,
    )?;

    for diag in &summary.diagnostics {
        eprintln!("{}", diag);
    }
    for failed in &summary.failed {
        eprintln!("dynbuild: failed: {}", failed.name);
        if !failed.output.is_empty() {
            eprintln!("{}", String::from_utf8_lossy(&failed.output).trim_end());
        }
    }
    if summary.cancelled {
        eprintln!("dynbuild: interrupted");
        return Ok(1);
    }
    if !summary.success() {
        return Ok(1);
    }
    let ran = summary.ran + summary.dynamic_ran;
    if ran == 0 {
        // Special case: don't print numbers when no work done.
        println!("dynbuild: no work to do");
    } else {
        println!("dynbuild: ran {} tasks, now up to date", ran);
    }
    Ok(0)
}

fn describe(config: EngineConfig, args: DescribeArgs) -> anyhow::Result<i32> {
    let project = Project::load(&args.project)?;
    let request = request_for(&project, args.targets);
    let engine = engine(config)?;
    let (description, _) = engine.describe(&project, &request)?;
    for (identifier, signature) in description.task_signatures() {
        println!("{} {}", &signature.to_hex()[..16], identifier);
    }
    for diag in &description.diagnostics {
        eprintln!("{}", diag);
    }
    engine.release(&description);
    Ok(if description.has_errors() { 1 } else { 0 })
}

fn verify_trace(config: EngineConfig, args: VerifyTraceArgs) -> anyhow::Result<i32> {
    let trace = LinkerTrace::read(&args.trace)?;
    let verifier = DependencyVerifier::new(config.verification.inherent_dependencies.as_slice());
    let report = verifier.verify(args.declared.as_slice(), &trace);
    for diag in report.diagnostics(&args.target, Severity::Error) {
        println!("{}", diag);
    }
    Ok(if report.violations.is_empty() { 0 } else { 1 })
}

fn merge_dependency_info(args: MergeArgs) -> anyhow::Result<i32> {
    let info = depinfo::merge_files(args.inputs.as_slice(), &args.output)?;
    for err in &info.errors {
        eprintln!("dynbuild: error: {}", err);
    }
    Ok(if info.errors.is_empty() { 0 } else { 1 })
}

fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("DYNBUILD_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    // Fails only if a subscriber is already installed.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Runs the command line, returning the process exit code.
pub fn run() -> anyhow::Result<i32> {
    let args: Args = argh::from_env();
    init_logging();

    if let Some(dir) = &args.chdir {
        let dir = Path::new(dir);
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    let mut config = EngineConfig::load_or_default(args.config.as_deref().map(Path::new))?;
    if let Some(jobs) = args.jobs {
        if jobs == 0 {
            anyhow::bail!("invalid -j 0");
        }
        config.parallelism = jobs;
    }
    if args.keep_going {
        config.keep_going = true;
    }

    match args.command {
        Subcommand::Build(build_args) => build(config, build_args),
        Subcommand::Describe(describe_args) => describe(config, describe_args),
        Subcommand::VerifyTrace(verify_args) => verify_trace(config, verify_args),
        Subcommand::MergeDependencyInfo(merge_args) => merge_dependency_info(merge_args),
    }
}
