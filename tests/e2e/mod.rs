//! Support code for e2e tests: a temporary project directory, a scanner and
//! a spawner that stand in for the compiler, and a runner for the dynbuild
//! binary.

mod build;
mod caching;
mod cli;

use dynbuild::cancel::CancellationToken;
use dynbuild::config::EngineConfig;
use dynbuild::db::Db;
use dynbuild::engine::Engine;
use dynbuild::fs::RealFileSystem;
use dynbuild::graph::Command;
use dynbuild::diagnostic::DiagnosticLocation;
use dynbuild::module_graph::{
    DependencyScanner, DriverJob, JobKind, JobOutput, ModuleImport, ModuleInfo, ScanOutput,
    ScanRequest,
};
use dynbuild::process::{ProcessOutput, Spawner, Termination};
use dynbuild::producer::ProducerRegistry;
use dynbuild::project::{BuildRequest, Project};
use dynbuild::verify::TRACE_FILE_ENV;
use dynbuild::work::BuildSummary;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

pub fn dynbuild_command(args: Vec<&str>) -> std::process::Command {
    let mut cmd = std::process::Command::new(env!("CARGO_BIN_EXE_dynbuild"));
    cmd.args(args);
    cmd
}

fn print_output(out: &std::process::Output) {
    // Gross: use print! instead of writing to stdout so Rust test
    // framework can capture it.
    print!("{}", std::str::from_utf8(&out.stdout).unwrap());
    print!("{}", std::str::from_utf8(&out.stderr).unwrap());
}

pub fn assert_output_contains(out: &std::process::Output, text: &str) {
    let out = std::str::from_utf8(&out.stdout).unwrap();
    if !out.contains(text) {
        panic!(
            "assertion failed; expected output to contain {:?} but got:\n{}",
            text, out
        );
    }
}

/// Manages a temporary project directory.
pub struct TestSpace {
    dir: tempfile::TempDir,
}

impl TestSpace {
    pub fn new() -> anyhow::Result<Self> {
        let dir = tempfile::tempdir()?;
        Ok(TestSpace { dir })
    }

    /// The space's directory, without a trailing separator.
    pub fn root(&self) -> String {
        self.dir.path().to_string_lossy().into_owned()
    }

    /// Absolute path of a file in the space.
    pub fn path(&self, path: &str) -> String {
        self.dir.path().join(path).to_string_lossy().into_owned()
    }

    /// Write a file into the working space, creating its directory.
    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        let path = self.dir.path().join(path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)
    }

    pub fn read(&self, path: &str) -> std::io::Result<Vec<u8>> {
        std::fs::read(self.dir.path().join(path))
    }

    /// Parses a project, substituting `$ROOT` with the space's directory.
    pub fn project(&self, json: &str) -> Project {
        let json = json.replace("$ROOT", &self.root());
        serde_json::from_str(&json).unwrap()
    }

    /// Invoke dynbuild, returning process output.
    pub fn run(&self, cmd: &mut std::process::Command) -> std::io::Result<std::process::Output> {
        cmd.current_dir(self.dir.path()).output()
    }

    /// Like run, but also print output if the command failed.
    pub fn run_expect(
        &self,
        cmd: &mut std::process::Command,
    ) -> anyhow::Result<std::process::Output> {
        let out = self.run(cmd)?;
        if !out.status.success() {
            print_output(&out);
            anyhow::bail!("dynbuild failed, status {}", out.status);
        }
        Ok(out)
    }
}

/// A scanner that plans one compile job per source, writing objects where
/// the target's compile tasks expect them.  Counts scans per plan.
pub struct FakeScanner {
    root: String,
    scans: Mutex<BTreeMap<String, usize>>,
    /// Imports reported per module.
    imports: Mutex<BTreeMap<String, Vec<ModuleImport>>>,
}

impl FakeScanner {
    pub fn new(space: &TestSpace) -> Self {
        FakeScanner {
            root: space.root(),
            scans: Mutex::default(),
            imports: Mutex::default(),
        }
    }

    pub fn scans(&self, plan_id: &str) -> usize {
        self.scans.lock().unwrap().get(plan_id).copied().unwrap_or(0)
    }

    pub fn object_path(&self, target: &str, source: &str) -> String {
        let stem = source.rsplit('/').next().unwrap().split('.').next().unwrap();
        format!(
            "{}/build/Intermediates/{}.build/Objects/arm64/{}.o",
            self.root,
            target,
            stem
        )
    }

    /// Makes scans of `module` report an import of `name` from line 1 of `path`.
    pub fn add_import(&self, module: &str, name: &str, path: &str) {
        self.push_import(
            module,
            ModuleImport {
                name: name.to_string(),
                access_level: Default::default(),
                textual: false,
                reexport: false,
                locations: vec![DiagnosticLocation {
                    path: path.to_string(),
                    line: 1,
                    column: 0,
                }],
            },
        );
    }

    /// Makes scans of `module` report a textual include of `header`.
    pub fn add_include(&self, module: &str, header: &str) {
        self.push_import(
            module,
            ModuleImport {
                name: header.to_string(),
                access_level: Default::default(),
                textual: true,
                reexport: false,
                locations: vec![],
            },
        );
    }

    fn push_import(&self, module: &str, import: ModuleImport) {
        self.imports
            .lock()
            .unwrap()
            .entry(module.to_string())
            .or_default()
            .push(import);
    }
}

impl DependencyScanner for FakeScanner {
    fn scan(&self, request: &ScanRequest) -> anyhow::Result<ScanOutput> {
        *self
            .scans
            .lock()
            .unwrap()
            .entry(request.plan_id.clone())
            .or_default() += 1;
        // Give concurrent callers a chance to pile up.
        std::thread::sleep(std::time::Duration::from_millis(10));
        let target = request.plan_id.split('-').next().unwrap();
        let jobs = request
            .sources
            .iter()
            .map(|source| {
                let object = self.object_path(target, source);
                DriverJob {
                    key: format!("compile {}", source),
                    kind: JobKind::Compile,
                    inputs: vec![source.clone()],
                    outputs: vec![JobOutput {
                        kind: "object".into(),
                        path: object.clone(),
                    }],
                    command: Command::new(["cc", "-c", source.as_str(), "-o", object.as_str()]),
                    depends_on: vec![],
                    cache_key: request.caching.then(|| format!("ck {}", source)),
                    explicit_dependency: false,
                }
            })
            .collect();
        Ok(ScanOutput {
            jobs,
            modules: vec![ModuleInfo {
                name: request.module_name.clone(),
                imports: self
                    .imports
                    .lock()
                    .unwrap()
                    .get(&request.module_name)
                    .cloned()
                    .unwrap_or_default(),
            }],
            diagnostics: vec![],
        })
    }
}

/// Records the commands it is asked to run and fakes their effects: the
/// file after `-o` is written, and a linker trace when one is requested.
#[derive(Default)]
pub struct FakeSpawner {
    commands: Mutex<Vec<Vec<String>>>,
    trace: Option<String>,
}

impl FakeSpawner {
    /// A spawner whose linker reports `trace` (JSON).
    pub fn with_trace(trace: &str) -> Self {
        FakeSpawner {
            commands: Mutex::default(),
            trace: Some(trace.to_string()),
        }
    }

    /// Takes the commands run so far.
    pub fn take(&self) -> Vec<Vec<String>> {
        std::mem::take(&mut *self.commands.lock().unwrap())
    }
}

impl Spawner for FakeSpawner {
    fn spawn(&self, command: &Command, _cancel: &CancellationToken) -> anyhow::Result<ProcessOutput> {
        self.commands.lock().unwrap().push(command.args.clone());
        let mut args = command.args.iter();
        while let Some(arg) = args.next() {
            if arg == "-o" {
                if let Some(out) = args.next() {
                    std::fs::write(out, command.args.join(" "))?;
                }
            }
        }
        if let (Some(trace), Some(path)) = (&self.trace, command.env_var(TRACE_FILE_ENV)) {
            std::fs::write(path, trace)?;
        }
        Ok(ProcessOutput {
            termination: Termination::Success,
            output: Vec::new(),
        })
    }
}

pub fn engine(scanner: Arc<FakeScanner>) -> Engine {
    let config = EngineConfig {
        parallelism: 4,
        producer_parallelism: 2,
        ..Default::default()
    };
    Engine::with_parts(config, scanner, ProducerRegistry::standard(), None, Db::in_memory())
}

pub fn request(targets: &[&str]) -> BuildRequest {
    BuildRequest {
        targets: targets.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    }
}

/// Builds and fails the test on any failed task.
pub fn build(
    engine: &mut Engine,
    project: &Project,
    request: &BuildRequest,
    spawner: &FakeSpawner,
) -> anyhow::Result<BuildSummary> {
    let summary = engine.build(
        project,
        request,
        spawner,
        &RealFileSystem::new(),
        &CancellationToken::new(),
    )?;
    if !summary.success() {
        anyhow::bail!(
            "build failed: {:?} {:?}",
            summary.failed,
            summary.diagnostics
        );
    }
    Ok(summary)
}
